//! Error types for the marketwire transport
//!
//! Provides structured error handling with:
//! - Terminal connection failures carrying the termination reason
//! - Per-operation failures (rejection, timeout, cancellation)
//! - Classification helpers for callers deciding whether to retry

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;

// ─────────────────────────────────────────────────────────────────
// Termination Reasons
// ─────────────────────────────────────────────────────────────────

/// Why a connection was permanently closed.
///
/// Once set, no further reconnection is attempted and every pending
/// operation is rejected with [`Error::ConnectionClosed`] carrying
/// this reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The configured maximum number of reconnect attempts was exhausted
    RetryLimitReached,

    /// The reconnect predicate declined to reconnect
    StoppedByCaller,

    /// The caller closed the connection
    UserClose,

    /// The reconnect machinery hit an unrecoverable error
    UnknownError(String),
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::RetryLimitReached => write!(f, "retry limit reached"),
            TerminationReason::StoppedByCaller => write!(f, "stopped by caller"),
            TerminationReason::UserClose => write!(f, "closed by user"),
            TerminationReason::UnknownError(msg) => write!(f, "unknown error: {}", msg),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Type
// ─────────────────────────────────────────────────────────────────

/// Main error type for the transport
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The configured URL could not be parsed or is not a WebSocket URL
    #[error("invalid WebSocket URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// The configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The connection was permanently closed; no further traffic is possible
    #[error("connection permanently closed: {reason}")]
    ConnectionClosed { reason: TerminationReason },

    /// The outbound buffer is at capacity while disconnected
    #[error("send buffer full ({capacity} messages)")]
    BufferFull { capacity: usize },

    /// Another operation with the same correlation id is still in flight
    #[error("duplicate in-flight operation for correlation id {id}")]
    DuplicateRequest { id: String },

    /// The server rejected the operation with an error frame
    #[error("server rejected request: {message}")]
    ServerRejected { message: String },

    /// The operation did not complete within the configured timeout
    #[error("request timed out after {timeout:?}")]
    RequestTimeout { timeout: Duration },

    /// The caller's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Check if the error is terminal: the connection is gone and every
    /// further operation on this transport will fail the same way.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::ConnectionClosed { .. })
    }

    /// Check if the error was caused by the caller (cancellation or an
    /// expired timeout) rather than the connection or the server.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::RequestTimeout { .. })
    }

    // ─────────────────────────────────────────────────────────────
    // Error Constructors
    // ─────────────────────────────────────────────────────────────

    /// Create an invalid-URL error
    pub fn invalid_url(url: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::InvalidUrl {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create a connection-closed error
    pub fn closed(reason: TerminationReason) -> Self {
        Error::ConnectionClosed { reason }
    }

    /// Create a server-rejection error
    pub fn rejected(message: impl Into<String>) -> Self {
        Error::ServerRejected {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_reason_display() {
        assert_eq!(
            TerminationReason::RetryLimitReached.to_string(),
            "retry limit reached"
        );
        assert_eq!(
            TerminationReason::StoppedByCaller.to_string(),
            "stopped by caller"
        );
        assert_eq!(
            TerminationReason::UnknownError("boom".into()).to_string(),
            "unknown error: boom"
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::closed(TerminationReason::UserClose);
        assert!(err.to_string().contains("closed by user"));

        let err = Error::rejected("Invalid subscription");
        assert!(err.to_string().contains("Invalid subscription"));
    }

    #[test]
    fn test_error_terminal() {
        assert!(Error::closed(TerminationReason::RetryLimitReached).is_terminal());
        assert!(!Error::Cancelled.is_terminal());
        assert!(!Error::rejected("nope").is_terminal());
    }

    #[test]
    fn test_error_cancellation() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(Error::RequestTimeout {
            timeout: Duration::from_secs(10)
        }
        .is_cancellation());
        assert!(!Error::closed(TerminationReason::UserClose).is_cancellation());
    }
}
