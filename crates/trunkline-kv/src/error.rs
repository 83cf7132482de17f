//! Key/value client errors.

use thiserror::Error;
use trunkline_net::NetError;
use trunkline_proto::InitialStatus;

/// Errors the key/value client surfaces to its caller.
#[derive(Error, Debug)]
pub enum KvError {
    /// No established node connection was available.
    #[error("no node connection available")]
    NotConnected,

    /// The node does not support the request (command or version).
    #[error("request not supported by node: {status:?}")]
    Unsupported {
        /// The rejecting status byte.
        status: InitialStatus,
    },

    /// The node reported a request-level error.
    #[error("node error: {message}")]
    NodeError {
        /// Error detail from the node.
        message: String,
    },

    /// The request finished without success and without a more specific
    /// error.
    #[error("request failed")]
    Failed,

    /// The client was shut down while the request was in flight.
    #[error("client shut down")]
    ClientClosed,

    /// Runtime error from the framework.
    #[error(transparent)]
    Net(#[from] NetError),
}

/// Result type alias for key/value operations.
pub type Result<T> = std::result::Result<T, KvError>;
