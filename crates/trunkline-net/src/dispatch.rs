//! Request dispatcher: the primitives a handler suspends on.
//!
//! A handler interacts with the outside world only through its dispatcher.
//! Every method here is a legal suspension point; nothing else inside a
//! handler may block the event loop.

use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use trunkline_proto::{Frame, FrameType, InitialStatus, PayloadWriter};

use crate::connection::ConnInner;
use crate::error::{NetError, Result};
use crate::roc::{RequestId, ResumeSignal, RocShared};

/// Values that arrive as a whole fixed-width frame body.
pub trait FixedWireValue: Sized {
    /// Exact body length in bytes.
    const WIRE_LEN: usize;
    /// Decodes from a body of exactly `WIRE_LEN` bytes, little-endian.
    fn from_wire(raw: &[u8]) -> Self;
}

macro_rules! fixed_wire_int {
    ($($ty:ty),*) => {
        $(impl FixedWireValue for $ty {
            const WIRE_LEN: usize = std::mem::size_of::<$ty>();
            fn from_wire(raw: &[u8]) -> Self {
                let mut bytes = [0u8; std::mem::size_of::<$ty>()];
                bytes.copy_from_slice(raw);
                <$ty>::from_le_bytes(bytes)
            }
        })*
    };
}

fixed_wire_int!(u8, u16, u32, u64, i64);

/// Per-RoC event dispatcher handed to the handler.
pub struct RequestDispatcher {
    conn: Arc<ConnInner>,
    id: RequestId,
    mailbox: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    shared: Arc<RocShared>,
}

impl RequestDispatcher {
    pub(crate) fn new(
        conn: Arc<ConnInner>,
        id: RequestId,
        mailbox: mpsc::UnboundedReceiver<Bytes>,
        shared: Arc<RocShared>,
    ) -> Self {
        RequestDispatcher {
            conn,
            id,
            mailbox: Mutex::new(mailbox),
            shared,
        }
    }

    /// Id of the request this dispatcher serves.
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Remote address of the underlying connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer()
    }

    fn abort_check(&self) -> Result<()> {
        if self.shared.is_aborted() {
            return Err(self.shared.abort_cause());
        }
        Ok(())
    }

    /// Builds a payload and hands it to the sender. Returns once the frame
    /// is enqueued; the request id prefix is written here. Suspends while
    /// the outbound queue sits above its high-water mark, which is how a
    /// slow peer throttles a producing request.
    pub async fn send(&self, build: impl FnOnce(&mut PayloadWriter)) -> Result<()> {
        loop {
            let mut drained = pin!(self.conn.drained_note.notified());
            drained.as_mut().enable();
            self.abort_check()?;
            if self.conn.queued_bytes() <= self.conn.config.send_highwater {
                break;
            }
            drained.await;
        }
        let mut writer = PayloadWriter::from_buf(self.conn.buffers.checkout());
        writer.put_u64(self.id);
        build(&mut writer);
        let frame = Frame::new(FrameType::Request, writer.into_bytes())?;
        self.conn.enqueue(frame)
    }

    /// Resumes when the next inbound frame body for this request arrives.
    pub async fn recv(&self) -> Result<Bytes> {
        let mut mailbox = self.mailbox.lock().await;
        loop {
            let mut aborted = pin!(self.shared.abort_note.notified());
            aborted.as_mut().enable();
            self.abort_check()?;
            tokio::select! {
                _ = aborted => continue,
                body = mailbox.recv() => {
                    return body.ok_or(NetError::ConnectionClosed);
                }
            }
        }
    }

    /// Receives a single fixed-width value; a body of any other length is a
    /// protocol error.
    pub async fn recv_value<T: FixedWireValue>(&self) -> Result<T> {
        let body = self.recv().await?;
        if body.len() != T::WIRE_LEN {
            return Err(self.shutdown_with_protocol_error(format!(
                "expected a {}-byte value, got {} bytes",
                T::WIRE_LEN,
                body.len()
            )));
        }
        Ok(T::from_wire(&body))
    }

    /// Waits for a message whose leading type byte is in `types`. Anything
    /// else is a protocol error.
    pub async fn recv_one_of(&self, types: &[u8]) -> Result<(u8, Bytes)> {
        let body = self.recv().await?;
        if body.is_empty() {
            return Err(self.shutdown_with_protocol_error("empty message body".to_string()));
        }
        let msg_type = body[0];
        if !types.contains(&msg_type) {
            return Err(self.shutdown_with_protocol_error(format!(
                "unexpected message type {msg_type} (wanted one of {types:?})"
            )));
        }
        Ok((msg_type, body.slice(1..)))
    }

    /// Reads the one-byte status answering the opening frame of a request,
    /// strictly. Returns any request-specific bytes that followed a
    /// `Supported` status; the not-supported statuses become request-scoped
    /// errors.
    pub async fn recv_initial_status(&self) -> Result<Bytes> {
        let body = self.recv().await?;
        if body.is_empty() {
            return Err(self.shutdown_with_protocol_error("empty initial status".to_string()));
        }
        let status = InitialStatus::try_from(body[0])
            .map_err(|err| self.shutdown_with_protocol_error(err.to_string()))?;
        match status {
            InitialStatus::Supported => Ok(body.slice(1..)),
            InitialStatus::RequestNotSupported | InitialStatus::RequestVersionNotSupported => {
                Err(NetError::Unsupported { status })
            }
        }
    }

    /// Gives up the scheduler once.
    pub async fn yield_now(&self) -> Result<()> {
        self.abort_check()?;
        tokio::task::yield_now().await;
        self.abort_check()
    }

    /// Suspends until another task delivers a manual resume. A delivered
    /// code outside `expected` is a protocol error, never a silent wake-up.
    pub async fn wait_resume(&self, expected: &[i64]) -> Result<i64> {
        loop {
            let mut wake = pin!(self.shared.resume_note.notified());
            wake.as_mut().enable();
            self.abort_check()?;
            if let Some(signal) = self.shared.pop_resume() {
                return match signal {
                    ResumeSignal::Code(code) if expected.contains(&code) => Ok(code),
                    ResumeSignal::Code(code) => Err(self.shutdown_with_protocol_error(format!(
                        "unexpected resume code {code} (expected {expected:?})"
                    ))),
                    ResumeSignal::Error(err) => Err(err),
                };
            }
            wake.await;
        }
    }

    /// Terminates the connection with logged diagnostics and returns the
    /// error for the handler to propagate.
    pub fn shutdown_with_protocol_error(&self, reason: String) -> NetError {
        self.conn.protocol_error(reason)
    }

    /// Acquire function over the connection's shared buffer pool, e.g. for
    /// an event dispatcher.
    pub fn buffer_acquire(&self) -> crate::buffers::AcquireBuffer {
        self.conn.buffers.acquire_fn()
    }
}
