//! HTTP/1.1 protocol layer
//!
//! The message model, header container and chunked transfer-encoding
//! codec used by the proxy. Everything here is plain data plus
//! parsing; no I/O happens in this module tree.

pub mod chunked;
pub mod headers;
pub mod message;

pub use chunked::{Chunk, ChunkCodec, ChunkDecoder, ChunkEncoder, Progress};
pub use headers::Headers;
pub use message::{ClientRequest, Method, ServerResponse, Version};

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol-level failures.
///
/// Request/Response/Header variants carry the HTTP status code the
/// proxy relays back to the client when the failure surfaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request:{reason}")]
    Request { code: u16, reason: String },

    #[error("response:{reason}")]
    Response { code: u16, reason: String },

    #[error("header:{reason}")]
    Header { code: u16, reason: String },

    #[error("chunk-size:{0}")]
    Chunk(String),
}

impl Error {
    /// Status code to relay for this failure. Codec failures have no
    /// protocol-assigned code and fall into the generic 500 bucket.
    pub fn code(&self) -> u16 {
        match self {
            Error::Request { code, .. } => *code,
            Error::Response { code, .. } => *code,
            Error::Header { code, .. } => *code,
            Error::Chunk(_) => 500,
        }
    }
}

/// CRLF line ending.
pub const CRLF: &str = "\r\n";

/// Request headers never forwarded to the origin server.
pub const HOP_HEADERS_TO_ORIGIN: &[&str] = &[
    "Proxy-Connection",
    "Proxy-Authorization",
    "Transfer-Encoding",
    "TE",
    "Trailers",
    "Upgrade",
];

/// Response headers never forwarded back to the client.
pub const HOP_HEADERS_TO_CLIENT: &[&str] = &["Proxy-Authenticate", "Keep-Alive"];

/// Names emitted first when iterating a header set, in this order.
pub const HEADER_PRIORITY: &[&str] = &[
    "Host",
    "Connection",
    "Proxy-Connection",
    "Authorization",
    "User-Agent",
];
