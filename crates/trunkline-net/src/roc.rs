//! Request-on-connection state.
//!
//! A RoC is one cooperative task per (request × connection) pair. The task
//! itself is a plain tokio task driving the handler future; this module
//! holds the state shared between that task and the outside world: the
//! abort flag, the manual resume-code queue, and the external handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::error::NetError;

/// Identifier of a logical request, unique per originating side.
pub type RequestId = u64;

/// A manual wake-up delivered to a RoC's `wait_resume`.
#[derive(Debug)]
pub(crate) enum ResumeSignal {
    /// Expected-or-not integer resume code.
    Code(i64),
    /// An error injected into the handler.
    Error(NetError),
}

/// State shared between a RoC task and everything that may poke it.
#[derive(Debug, Default)]
pub(crate) struct RocShared {
    aborted: AtomicBool,
    cause: Mutex<Option<NetError>>,
    pub(crate) abort_note: Notify,
    resumes: Mutex<VecDeque<ResumeSignal>>,
    pub(crate) resume_note: Notify,
}

impl RocShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(RocShared::default())
    }

    /// Marks the RoC aborted; the cause is delivered at the next suspension
    /// point. The first cause wins.
    pub(crate) fn abort(&self, cause: NetError) {
        {
            let mut slot = self.cause.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.aborted.store(true, Ordering::Release);
        self.abort_note.notify_waiters();
        self.resume_note.notify_waiters();
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The abort cause, defaulting to a generic abort when the setter lost
    /// a race.
    pub(crate) fn abort_cause(&self) -> NetError {
        self.cause
            .lock()
            .unwrap()
            .take()
            .unwrap_or(NetError::Aborted)
    }

    /// Queues a manual resume. Codes queue so that an external signal
    /// arriving between two `wait_resume` calls is not lost; errors jump
    /// the queue.
    pub(crate) fn push_resume(&self, signal: ResumeSignal) {
        {
            let mut queue = self.resumes.lock().unwrap();
            match signal {
                ResumeSignal::Error(_) => queue.push_front(signal),
                ResumeSignal::Code(_) => queue.push_back(signal),
            }
        }
        self.resume_note.notify_one();
    }

    pub(crate) fn pop_resume(&self) -> Option<ResumeSignal> {
        self.resumes.lock().unwrap().pop_front()
    }
}

/// Receiver-side entry for a live RoC: where to deliver inbound frame
/// bodies and how to abort the task.
#[derive(Debug)]
pub(crate) struct RocEntry {
    pub(crate) mailbox: mpsc::UnboundedSender<Bytes>,
    pub(crate) shared: Arc<RocShared>,
}

/// External handle to a running RoC.
///
/// Held by the client request set to signal and abort the task; dropping
/// the handle does not affect the task.
#[derive(Debug, Clone)]
pub struct RocHandle {
    id: RequestId,
    shared: Arc<RocShared>,
}

impl RocHandle {
    pub(crate) fn new(id: RequestId, shared: Arc<RocShared>) -> Self {
        RocHandle { id, shared }
    }

    /// Request id this RoC belongs to.
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Delivers a manual resume code to the RoC's next `wait_resume`.
    pub fn resume(&self, code: i64) {
        self.shared.push_resume(ResumeSignal::Code(code));
    }

    /// Injects an error into the RoC's next `wait_resume`.
    pub fn resume_error(&self, error: NetError) {
        self.shared.push_resume(ResumeSignal::Error(error));
    }

    /// Aborts the RoC; the handler observes the cause at its next
    /// suspension point.
    pub fn abort(&self, cause: NetError) {
        self.shared.abort(cause);
    }
}
