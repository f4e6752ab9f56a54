//! httprox - a minimalistic forward HTTP/1.1 proxy
//!
//! This crate provides the proxy engine: the HTTP/1.1 message model,
//! the chunked transfer-encoding codec, the buffered socket
//! abstraction, the bidirectional relay, and the per-connection
//! request handler, plus the daemon glue that ties them to a TCP
//! listener.

pub mod http;
pub mod logging;
pub mod proxy;
pub mod settings;

/// Program name, used in log targets and the Proxy-Agent header.
pub const PROGRAM_NAME: &str = env!("CARGO_PKG_NAME");

/// Program version, used in the Proxy-Agent header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
