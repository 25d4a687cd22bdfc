//! Error types for the specsplit transport.
//!
//! Transport-level failures are split out into [`TransportError`] so callers
//! can tell a clean peer close apart from a torn frame. Everything surfaces
//! through [`SplitError`], which the draft and target loops inspect to decide
//! whether to drop the step, retry the round trip, or end the session.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failures raised while moving frames over an established connection.
///
/// Any of these leaves the owning connection broken.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Incomplete frame: expected {expected} bytes, received {received}")]
    IncompleteFrame { expected: usize, received: usize },

    #[error("Socket operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Main error type for specsplit.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("Failed to connect to {addr} after {attempts} attempts: {reason}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Not connected to a peer")]
    NotConnected,

    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Invalid record: {message}")]
    InvalidRecord { message: String },

    #[error("IO error on {addr:?}: {message}")]
    Io {
        message: String,
        addr: Option<SocketAddr>,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Result type alias for specsplit operations.
pub type Result<T> = std::result::Result<T, SplitError>;

impl From<std::io::Error> for SplitError {
    fn from(err: std::io::Error) -> Self {
        SplitError::Io {
            message: err.to_string(),
            addr: None,
            source: Some(err),
        }
    }
}

impl SplitError {
    /// Create an IO error with socket address context.
    pub fn io_with_addr(err: std::io::Error, addr: SocketAddr) -> Self {
        SplitError::Io {
            message: err.to_string(),
            addr: Some(addr),
            source: Some(err),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        SplitError::ProtocolViolation {
            message: message.into(),
        }
    }

    pub(crate) fn codec(message: impl Into<String>) -> Self {
        SplitError::Codec {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_record(message: impl Into<String>) -> Self {
        SplitError::InvalidRecord {
            message: message.into(),
        }
    }

    /// Check if this error means the connection it came from must be torn down.
    ///
    /// A torn frame or an untrusted length prefix leaves the byte stream at an
    /// unknown position, so nothing more can be read from it.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SplitError::Transport(_) | SplitError::ProtocolViolation { .. }
        )
    }

    /// Check if this error came from a peer closing cleanly between frames.
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, SplitError::Transport(TransportError::PeerClosed))
    }
}

/// Check if a connect attempt failure is worth another attempt.
///
/// Address parsing failures will not get better by waiting.
pub(crate) fn is_retryable_connect_error(err: &std::io::Error) -> bool {
    !matches!(
        err.kind(),
        std::io::ErrorKind::InvalidInput | std::io::ErrorKind::Unsupported
    )
}
