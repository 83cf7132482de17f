//! Runtime error types.
//!
//! The variants follow the framework's error taxonomy: protocol and I/O
//! errors are connection-scoped and tear the connection down; unsupported
//! and node errors are request-scoped and leave the connection healthy.

use thiserror::Error;
use trunkline_proto::{InitialStatus, ProtoError};

/// Errors produced by the connection runtime.
#[derive(Error, Debug)]
pub enum NetError {
    /// Peer violated the protocol. Connection-scoped: the connection is
    /// shut down and every live request-on-connection is aborted.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Human-readable description of the violation.
        reason: String,
    },

    /// Wire-level decode failure, promoted to a protocol error.
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// I/O failure on the socket. Connection-scoped.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Peers disagreed on the protocol version during the handshake.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// Version this side speaks.
        ours: u8,
        /// Version the peer announced.
        theirs: u8,
    },

    /// The node rejected our credentials.
    #[error("authentication rejected by {addr}")]
    AuthRejected {
        /// Address of the rejecting node.
        addr: std::net::SocketAddr,
    },

    /// A client authenticated with a name the credentials store does not
    /// know.
    #[error("unknown client name {name:?}")]
    UnknownClient {
        /// The name the client presented.
        name: String,
    },

    /// The connection closed (locally or by the peer) while the operation
    /// was in flight.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request-on-connection was aborted from outside.
    #[error("request aborted")]
    Aborted,

    /// The node answered the opening frame with a not-supported status.
    /// Request-scoped: the connection stays healthy.
    #[error("request not supported by node: {status:?}")]
    Unsupported {
        /// The rejecting status byte.
        status: InitialStatus,
    },

    /// The node reported a request-level error message.
    #[error("node error: {message}")]
    NodeError {
        /// Error detail from the node.
        message: String,
    },

    /// A control change was issued while a previous one was still
    /// un-acknowledged.
    #[error("control message already in flight")]
    ControlInFlight,

    /// No established connection was available for the operation.
    #[error("not connected")]
    NotConnected,

    /// A configuration file could not be parsed.
    #[error("bad config line {line} in {path}: {reason}")]
    BadConfigLine {
        /// File the line came from.
        path: String,
        /// One-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },
}

impl NetError {
    /// True for connection-scoped errors: protocol violations and I/O
    /// failures, which tear the whole connection down.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            NetError::Protocol { .. } | NetError::Proto(_) | NetError::Io(_)
        )
    }

    /// True for request-scoped errors that leave the connection healthy.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            NetError::Unsupported { .. } | NetError::NodeError { .. }
        )
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_scope_classification() {
        assert!(NetError::Protocol {
            reason: "x".into()
        }
        .is_connection_scoped());
        assert!(NetError::Proto(ProtoError::ParityMismatch).is_connection_scoped());
        assert!(NetError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .is_connection_scoped());
        assert!(!NetError::ConnectionClosed.is_connection_scoped());
        assert!(!NetError::Aborted.is_connection_scoped());
    }

    #[test]
    fn test_request_scope_classification() {
        assert!(NetError::Unsupported {
            status: InitialStatus::RequestNotSupported
        }
        .is_request_scoped());
        assert!(NetError::NodeError {
            message: "boom".into()
        }
        .is_request_scoped());
        assert!(!NetError::ConnectionClosed.is_request_scoped());
    }
}
