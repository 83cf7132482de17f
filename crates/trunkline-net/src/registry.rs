//! Server-side request registry.
//!
//! Maps `(command, version)` to a handler constructor. The first frame of a
//! new request is answered with a one-byte status: `Supported` hands the
//! rest of the opening body to the constructed handler; the two
//! not-supported statuses leave the connection healthy and create no
//! request-on-connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};
use trunkline_proto::{Frame, FrameType, InitialStatus, PayloadReader, PayloadWriter};

use crate::connection::ConnInner;
use crate::dispatch::RequestDispatcher;
use crate::error::{NetError, Result};
use crate::metrics::LatencyHistogram;
use crate::roc::RequestId;

/// Future type of a server-side request handler.
pub type ServerHandlerFuture =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

/// Constructor invoked per incoming request. Captures whatever the handler
/// needs (storage engine, shared state) in its closure.
pub type ServerHandlerFactory = Arc<dyn Fn(ServerRequest) -> ServerHandlerFuture + Send + Sync>;

/// Everything a server handler invocation gets to work with.
pub struct ServerRequest {
    /// Event dispatcher of this request-on-connection.
    pub dispatcher: RequestDispatcher,
    /// Opening body past command and version: the serialized arguments.
    pub args: Bytes,
}

/// Optional per-handler flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerFlags {
    /// Gather a latency histogram over handler runtimes.
    pub timing: bool,
    /// Log a warning and count every use, so operators can see when a
    /// legacy version is finally unused.
    pub scheduled_for_removal: bool,
}

struct RegisteredHandler {
    factory: ServerHandlerFactory,
    flags: HandlerFlags,
    timing: Arc<LatencyHistogram>,
    uses: AtomicU64,
}

/// Registry of request handlers, built once and shared by every
/// connection of a listener.
#[derive(Default)]
pub struct RequestRegistry {
    handlers: HashMap<(u8, u8), RegisteredHandler>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        RequestRegistry::default()
    }

    /// Registers a handler for `(command, version)`.
    pub fn register(
        &mut self,
        command: u8,
        version: u8,
        flags: HandlerFlags,
        factory: ServerHandlerFactory,
    ) {
        self.handlers.insert(
            (command, version),
            RegisteredHandler {
                factory,
                flags,
                timing: Arc::new(LatencyHistogram::new()),
                uses: AtomicU64::new(0),
            },
        );
    }

    /// Latency histogram of a `timing`-flagged handler.
    pub fn timing_of(&self, command: u8, version: u8) -> Option<Arc<LatencyHistogram>> {
        self.handlers
            .get(&(command, version))
            .filter(|h| h.flags.timing)
            .map(|h| Arc::clone(&h.timing))
    }

    /// How many times a handler has been dispatched.
    pub fn uses_of(&self, command: u8, version: u8) -> Option<u64> {
        self.handlers
            .get(&(command, version))
            .map(|h| h.uses.load(Ordering::Relaxed))
    }

    fn reply_status(conn: &Arc<ConnInner>, id: RequestId, status: InitialStatus) -> Result<()> {
        let mut writer = PayloadWriter::with_capacity(9);
        writer.put_u64(id);
        writer.put_u8(status as u8);
        let frame = Frame::new(FrameType::Request, writer.into_bytes())?;
        conn.enqueue(frame)
    }

    /// Handles the first frame of a new request on `conn`. Called from the
    /// connection's receiver; the error return is a protocol violation.
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        conn: &Arc<ConnInner>,
        id: RequestId,
        first_body: Bytes,
    ) -> Result<()> {
        let mut reader = PayloadReader::new(first_body);
        let command = reader.take_u8().map_err(|_| NetError::Protocol {
            reason: "opening frame without a command byte".into(),
        })?;
        let version = reader.take_u8().map_err(|_| NetError::Protocol {
            reason: "opening frame without a version byte".into(),
        })?;
        let args = reader.take_rest();

        let handler = match self.handlers.get(&(command, version)) {
            Some(handler) => handler,
            None => {
                let known_command = self.handlers.keys().any(|(c, _)| *c == command);
                let status = if known_command {
                    InitialStatus::RequestVersionNotSupported
                } else {
                    InitialStatus::RequestNotSupported
                };
                debug!(
                    peer = %conn.peer(),
                    command,
                    version,
                    ?status,
                    "rejecting unregistered request"
                );
                conn.mark_drained(id);
                return Self::reply_status(conn, id, status);
            }
        };

        handler.uses.fetch_add(1, Ordering::Relaxed);
        if handler.flags.scheduled_for_removal {
            warn!(
                peer = %conn.peer(),
                command,
                version,
                "request version scheduled for removal was used"
            );
        }

        Self::reply_status(conn, id, InitialStatus::Supported)?;

        let factory = Arc::clone(&handler.factory);
        let timing = handler
            .flags
            .timing
            .then(|| (Arc::clone(&handler.timing), Instant::now()));
        let peer = conn.peer();
        conn.spawn_roc(
            id,
            None,
            move |dispatcher| factory(ServerRequest { dispatcher, args }),
            move |result| {
                if let Some((hist, started)) = timing {
                    hist.observe(started.elapsed());
                }
                match result {
                    Ok(()) => {}
                    // Connection-scoped failures were already logged when
                    // the connection went down.
                    Err(err) if err.is_connection_scoped() => {}
                    Err(err) => debug!(%peer, command, version, error = %err, "handler ended with error"),
                }
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_factory() -> ServerHandlerFactory {
        Arc::new(|_req| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_register_and_lookup_flags() {
        let mut registry = RequestRegistry::new();
        registry.register(
            1,
            1,
            HandlerFlags {
                timing: true,
                ..Default::default()
            },
            noop_factory(),
        );
        registry.register(2, 1, HandlerFlags::default(), noop_factory());

        assert!(registry.timing_of(1, 1).is_some());
        assert!(registry.timing_of(2, 1).is_none());
        assert_eq!(registry.uses_of(1, 1), Some(0));
        assert_eq!(registry.uses_of(9, 1), None);
    }
}
