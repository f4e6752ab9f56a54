//! Proxy engine
//!
//! The connection-level machinery: buffered sockets, the
//! bidirectional relay, the per-connection request handler and the
//! accepting daemon.

pub mod connection;
pub mod daemon;
pub mod handler;
pub mod socket;

pub use connection::{Connection, Directions};
pub use daemon::Daemon;
pub use handler::Handler;
pub use socket::BufferedSocket;

use crate::http;
use std::time::Duration;

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Connection-level failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Http(#[from] http::Error),

    /// No readiness within the idle timeout.
    #[error("{0}:connection timeout")]
    Timeout(String),

    /// Peer closed before a full line or body was read.
    #[error("peer disconnected")]
    Disconnected,

    /// An OS socket error outside the tolerated set.
    #[error("socket:{0}")]
    Socket(String),

    /// Anything unanticipated; relayed as a 500 with detail.
    #[error("{0}")]
    Internal(String),
}

/// Per-direction relay buffer size and cache watermark.
pub const SOCKET_BUFSIZE: usize = 4096;

/// Idle timeout bounding every blocking network operation.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest accepted protocol line.
pub const MAX_LINE_LENGTH: usize = 0x4000;

/// Ceiling on concurrently served connections.
pub const MAX_CONCURRENCY: usize = 128;
