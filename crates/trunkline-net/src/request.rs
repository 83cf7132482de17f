//! Request descriptors and handler types.
//!
//! A request is described by a plain value (command code, version, and
//! dispatch pattern) paired with a handler function. The serialized user
//! arguments live in an immutable context shared by every
//! request-on-connection of the request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;

use crate::dispatch::RequestDispatcher;
use crate::error::Result;

/// How a client request maps to requests-on-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    /// One RoC on one chosen connection.
    SingleNode,
    /// One RoC on every live connection, plus every connection that
    /// becomes established before the request finishes.
    AllNodes,
    /// One RoC at a time on the next node; advance on failure.
    RoundRobin,
    /// One RoC to start with; the handler fans out itself.
    MultiNode,
}

/// Value describing one request kind.
#[derive(Debug, Clone, Copy)]
pub struct RequestDescriptor {
    /// Command code, first byte of the opening body.
    pub command: u8,
    /// Request version, second byte of the opening body.
    pub version: u8,
    /// Dispatch pattern on the client.
    pub request_type: RequestType,
}

impl RequestDescriptor {
    pub const fn new(command: u8, version: u8, request_type: RequestType) -> Self {
        RequestDescriptor {
            command,
            version,
            request_type,
        }
    }
}

/// Immutable, shared context of one client request: the serialized user
/// arguments every RoC of the request opens with.
#[derive(Debug)]
pub struct RequestContext {
    /// Serialized arguments, appended to the opening body after command and
    /// version.
    pub args: Bytes,
}

impl RequestContext {
    pub fn new(args: Bytes) -> Arc<Self> {
        Arc::new(RequestContext { args })
    }
}

/// Future type of a client-side request handler.
pub type ClientHandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Client-side handler: runs once per RoC, after the framework has
/// enqueued the request's opening frame on that connection.
pub type ClientHandler = Arc<dyn Fn(ClientRoc) -> ClientHandlerFuture + Send + Sync>;

/// Everything a client handler invocation gets to work with.
pub struct ClientRoc {
    /// Event dispatcher of this RoC.
    pub dispatcher: RequestDispatcher,
    /// Shared request context.
    pub context: Arc<RequestContext>,
    /// Fan-out handle, present for MultiNode requests.
    pub multi: Option<MultiNodeHandle>,
}

/// Handle a MultiNode handler uses to start the same request on another
/// established connection.
#[derive(Clone)]
pub struct MultiNodeHandle {
    pub(crate) start: Arc<dyn Fn() -> Result<bool> + Send + Sync>,
}

impl MultiNodeHandle {
    /// Starts a RoC for this request on an established connection the
    /// request is not yet running on. Returns `Ok(false)` when every
    /// connection already carries it (or none is available).
    pub fn start_on_new_conn(&self) -> Result<bool> {
        (self.start)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_is_copyable() {
        let desc = RequestDescriptor::new(4, 1, RequestType::MultiNode);
        let copy = desc;
        assert_eq!(copy.command, 4);
        assert_eq!(desc.request_type, RequestType::MultiNode);
    }
}
