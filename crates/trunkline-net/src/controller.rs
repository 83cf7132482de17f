//! Suspendable request controller.
//!
//! Long-running requests expose a mini control plane: the client may send
//! `Suspend`, `Resume`, or `Stop`, each acknowledged by the node before the
//! next change may be sent, so only one change is in flight at a time. The node's
//! producer observes the suspension flag at its yield points; on `Stop` it
//! stops producing, the handler sends `End`, and a final client `Ack`
//! releases the request. Message-type numbering is per request family, so
//! the codes come in as a value.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::{NetError, Result};
use crate::events::FiberContext;

/// Message-type bytes of one request family's control plane.
#[derive(Debug, Clone, Copy)]
pub struct ControlCodes {
    /// Client → node: pause producing.
    pub suspend: u8,
    /// Client → node: carry on.
    pub resume: u8,
    /// Client → node: stop for good.
    pub stop: u8,
    /// Node → client: change acknowledged. Also the final client → node
    /// acknowledgement of `End`.
    pub ack: u8,
}

/// A control change a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlChange {
    Suspend,
    Resume,
    Stop,
}

impl ControlChange {
    /// Wire byte for this change under the given code assignment.
    pub fn code(self, codes: &ControlCodes) -> u8 {
        match self {
            ControlChange::Suspend => codes.suspend,
            ControlChange::Resume => codes.resume,
            ControlChange::Stop => codes.stop,
        }
    }
}

/// What the producer should do after a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep producing.
    Continue,
    /// Stop producing and send `End`.
    Stop,
}

/// Node-side suspension state shared between the control fiber and the
/// producer.
#[derive(Debug, Default)]
pub struct SuspendState {
    suspended: AtomicBool,
    stopped: AtomicBool,
    changed: Notify,
}

impl SuspendState {
    pub fn new() -> Arc<Self> {
        Arc::new(SuspendState::default())
    }

    fn set_suspended(&self, value: bool) {
        self.suspended.store(value, Ordering::Release);
        self.changed.notify_waiters();
    }

    fn set_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// True while a suspend is in effect.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// True once a stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Producer yield point: parks while suspended, reports `Stop` once a
    /// stop was requested.
    pub async fn checkpoint(&self) -> Flow {
        loop {
            let mut changed = std::pin::pin!(self.changed.notified());
            changed.as_mut().enable();
            if self.stop_requested() {
                return Flow::Stop;
            }
            if !self.is_suspended() {
                return Flow::Continue;
            }
            changed.await;
        }
    }
}

/// Runs a node-side control fiber: ACKs each change, then applies it to
/// `state`, and returns once `Stop` has been acknowledged. The Ack goes
/// out first so that the producer reacting to the change cannot tear the
/// fiber down between applying and acknowledging.
pub async fn run_control_fiber(
    ctx: &FiberContext,
    codes: ControlCodes,
    state: Arc<SuspendState>,
) -> Result<()> {
    loop {
        let received = ctx
            .recv_msg(&[codes.suspend, codes.resume, codes.stop])
            .await;
        let (msg_type, _) = match received {
            Ok(msg) => msg,
            Err(err) => {
                // The control plane is gone; release a producer that may
                // be parked suspended, or it would never observe the end.
                state.set_stopped();
                return Err(err);
            }
        };
        if let Err(err) = ctx.send(|w| w.put_u8(codes.ack)).await {
            state.set_stopped();
            return Err(err);
        }
        if msg_type == codes.suspend {
            state.set_suspended(true);
        } else if msg_type == codes.resume {
            state.set_suspended(false);
        } else {
            state.set_stopped();
            return Ok(());
        }
    }
}

/// Waits for the final client `Ack` after `End` has been sent, ignoring any
/// control message that raced with the `End`: the peer had not yet
/// processed it when it sent the change.
pub async fn await_final_ack(ctx: &FiberContext, codes: ControlCodes) -> Result<()> {
    loop {
        let (msg_type, _) = ctx
            .recv_msg(&[codes.ack, codes.suspend, codes.resume, codes.stop])
            .await?;
        if msg_type == codes.ack {
            return Ok(());
        }
    }
}

/// Client-side single-change-in-flight gate.
///
/// `begin` claims the slot; a second change before the node's Ack is
/// rejected. The fiber that sent the frame parks in `wait_acked`, and the
/// reader fiber reports inbound ACKs through `deliver_ack`.
#[derive(Debug, Default)]
pub struct ControlLink {
    state: Mutex<LinkState>,
    acked: Notify,
}

#[derive(Debug, Default)]
struct LinkState {
    in_flight: Option<ControlChange>,
    delivered: Option<ControlChange>,
}

impl ControlLink {
    pub fn new() -> Arc<Self> {
        Arc::new(ControlLink::default())
    }

    /// Claims the in-flight slot for `change`.
    pub fn begin(&self, change: ControlChange) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.in_flight.is_some() {
            return Err(NetError::ControlInFlight);
        }
        state.in_flight = Some(change);
        Ok(())
    }

    /// Reports an inbound Ack. Returns the change it acknowledged, or
    /// `None` for an Ack with nothing in flight.
    pub fn deliver_ack(&self) -> Option<ControlChange> {
        let mut state = self.state.lock().unwrap();
        let change = state.in_flight.take()?;
        state.delivered = Some(change);
        self.acked.notify_one();
        Some(change)
    }

    /// Waits for the Ack of the change in flight.
    pub async fn wait_acked(&self) -> ControlChange {
        loop {
            let mut acked = std::pin::pin!(self.acked.notified());
            acked.as_mut().enable();
            if let Some(change) = self.state.lock().unwrap().delivered.take() {
                return change;
            }
            acked.await;
        }
    }

    /// True when no change is awaiting its Ack.
    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().in_flight.is_none()
    }
}
