//! Bus error types.

use thiserror::Error;

/// Errors reported by bus transports.
#[derive(Debug, Error)]
pub enum Error {
    /// The DSN is not understood by the transport.
    #[error("invalid dsn: {0}")]
    InvalidDsn(String),

    /// The broker could not be reached.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel has been closed.
    #[error("channel closed")]
    ChannelClosed,

    /// A declaration conflicts with existing broker state.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The operation is not permitted on this resource.
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// Exchange or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource is held exclusively by another consumer or connection.
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// Socket-level failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the underlying connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }
}
