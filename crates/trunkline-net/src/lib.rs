//! Trunkline connection runtime.
//!
//! Multiplexes an unbounded number of concurrently-active requests over a
//! single authenticated duplex TCP link. Each request-on-connection runs as
//! one cooperative task with its own event dispatcher; a versioned request
//! registry on the node side keeps clients and nodes forward and backward
//! compatible.

pub mod admin;
pub mod auth;
pub mod buffers;
pub mod connection;
pub mod connset;
pub mod controller;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod registry;
pub mod request;
pub mod requestset;
pub mod roc;
pub mod sockopt;

mod receiver;
mod sender;

pub use admin::AdminSocket;
pub use buffers::{AcquireBuffer, BufferPool, BufferPoolConfig};
pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use connset::{load_nodes_file, BackoffConfig, ClientConfig, ConnectionSet};
pub use controller::{ControlChange, ControlCodes, ControlLink, Flow, SuspendState};
pub use credentials::{ClientCredentials, NodeCredentials};
pub use dispatch::{FixedWireValue, RequestDispatcher};
pub use error::{NetError, Result};
pub use events::{EventDispatcher, FiberContext, FiberId};
pub use listener::{Listener, ListenerConfig};
pub use metrics::{LatencyHistogram, MetricsSnapshot, NetMetrics};
pub use notify::{Notifier, RequestNotification, RequestOutcome};
pub use registry::{HandlerFlags, RequestRegistry, ServerHandlerFactory, ServerRequest};
pub use request::{
    ClientHandler, ClientHandlerFuture, ClientRoc, MultiNodeHandle, RequestContext,
    RequestDescriptor, RequestType,
};
pub use requestset::RequestHandle;
pub use roc::{RequestId, RocHandle};
pub use sockopt::KeepaliveConfig;
