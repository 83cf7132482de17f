//! Per-request sub-fiber event dispatcher.
//!
//! A handler may split itself into several cooperating fibers (say a
//! reader, a writer, and a controller) that share one request-on-connection.
//! The dispatcher pumps the RoC mailbox and routes each inbound body by its
//! leading message-type byte to whichever fiber is waiting on that type;
//! unclaimed bodies queue in arrival order. Fibers can also rendezvous on
//! small-int signals and abort one another; an abort surfaces at the
//! target's next suspension point.
//!
//! Buffer storage is obtained through a caller-supplied acquire function,
//! so buffers may come from any pool; the dispatcher itself is
//! pool-agnostic.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use trunkline_proto::PayloadWriter;

use crate::buffers::AcquireBuffer;
use crate::dispatch::RequestDispatcher;
use crate::error::{NetError, Result};

/// Identifier of a fiber within one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

#[derive(Debug, Clone, Copy)]
enum DeadReason {
    Closed,
    Aborted,
}

impl DeadReason {
    fn to_error(self) -> NetError {
        match self {
            DeadReason::Closed => NetError::ConnectionClosed,
            DeadReason::Aborted => NetError::Aborted,
        }
    }

    fn from_error(err: &NetError) -> Self {
        match err {
            NetError::Aborted => DeadReason::Aborted,
            _ => DeadReason::Closed,
        }
    }
}

struct MsgWaiter {
    fiber: FiberId,
    types: Vec<u8>,
    tx: oneshot::Sender<(u8, Bytes)>,
}

struct SigWaiter {
    fiber: FiberId,
    kinds: Vec<u8>,
    tx: oneshot::Sender<u8>,
}

#[derive(Default)]
struct RouterState {
    queued: VecDeque<Bytes>,
    msg_waiters: Vec<MsgWaiter>,
    sig_waiters: Vec<SigWaiter>,
    dead: Option<DeadReason>,
}

#[derive(Debug, Default)]
struct FiberFlags {
    aborted: AtomicBool,
    note: Notify,
}

impl FiberFlags {
    fn abort(&self) {
        self.aborted.store(true, Ordering::Release);
        self.note.notify_waiters();
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

struct FiberSlot {
    name: &'static str,
    flags: Arc<FiberFlags>,
    join: JoinHandle<Result<()>>,
}

struct EventsInner {
    dispatcher: Arc<RequestDispatcher>,
    router: Mutex<RouterState>,
    fibers: Mutex<HashMap<FiberId, FiberSlot>>,
    next_fiber: AtomicU64,
    acquire: AcquireBuffer,
}

impl EventsInner {
    fn route(&self, body: Bytes) {
        if body.is_empty() {
            let _ = self
                .dispatcher
                .shutdown_with_protocol_error("empty message body".to_string());
            self.mark_dead(DeadReason::Closed);
            return;
        }
        let msg_type = body[0];
        let mut router = self.router.lock().unwrap();
        if let Some(pos) = router
            .msg_waiters
            .iter()
            .position(|w| w.types.contains(&msg_type))
        {
            let waiter = router.msg_waiters.remove(pos);
            let _ = waiter.tx.send((msg_type, body.slice(1..)));
        } else {
            router.queued.push_back(body);
        }
    }

    fn mark_dead(&self, reason: DeadReason) {
        let mut router = self.router.lock().unwrap();
        if router.dead.is_none() {
            router.dead = Some(reason);
        }
        // Dropping the senders fails every parked waiter.
        router.msg_waiters.clear();
        router.sig_waiters.clear();
    }

    fn drop_waiters_of(&self, fiber: FiberId) {
        let mut router = self.router.lock().unwrap();
        router.msg_waiters.retain(|w| w.fiber != fiber);
        router.sig_waiters.retain(|w| w.fiber != fiber);
    }
}

/// Sub-fiber multiplexer for one request-on-connection.
pub struct EventDispatcher {
    inner: Arc<EventsInner>,
    pump: JoinHandle<()>,
}

impl EventDispatcher {
    /// Takes over the request's inbound traffic. From this point the
    /// handler must receive through fibers, not through the raw dispatcher.
    pub fn new(dispatcher: RequestDispatcher, acquire: AcquireBuffer) -> Self {
        let dispatcher = Arc::new(dispatcher);
        let inner = Arc::new(EventsInner {
            dispatcher: Arc::clone(&dispatcher),
            router: Mutex::new(RouterState::default()),
            fibers: Mutex::new(HashMap::new()),
            next_fiber: AtomicU64::new(1),
            acquire,
        });
        let pump_inner = Arc::clone(&inner);
        let pump = tokio::spawn(async move {
            loop {
                match pump_inner.dispatcher.recv().await {
                    Ok(body) => pump_inner.route(body),
                    Err(err) => {
                        trace!(error = %err, "event pump stopped");
                        pump_inner.mark_dead(DeadReason::from_error(&err));
                        break;
                    }
                }
            }
        });
        EventDispatcher { inner, pump }
    }

    /// Spawns a named sub-fiber.
    pub fn spawn_fiber<F, Fut>(&self, name: &'static str, f: F) -> FiberId
    where
        F: FnOnce(FiberContext) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let id = FiberId(self.inner.next_fiber.fetch_add(1, Ordering::Relaxed));
        let flags = Arc::new(FiberFlags::default());
        let ctx = FiberContext {
            id,
            inner: Arc::clone(&self.inner),
            flags: Arc::clone(&flags),
        };
        let fut = f(ctx);
        let join = tokio::spawn(async move {
            let result = fut.await;
            match &result {
                Ok(()) => trace!(fiber = name, "fiber finished"),
                Err(NetError::Aborted) => trace!(fiber = name, "fiber aborted"),
                Err(err) => debug!(fiber = name, error = %err, "fiber failed"),
            }
            result
        });
        self.inner
            .fibers
            .lock()
            .unwrap()
            .insert(id, FiberSlot { name, flags, join });
        id
    }

    /// Aborts a fiber; it observes the abort at its next suspension point.
    pub fn abort_fiber(&self, id: FiberId) {
        let slot = {
            let fibers = self.inner.fibers.lock().unwrap();
            fibers
                .get(&id)
                .map(|slot| (slot.name, Arc::clone(&slot.flags)))
        };
        if let Some((name, flags)) = slot {
            trace!(fiber = name, "aborting fiber");
            flags.abort();
            self.inner.drop_waiters_of(id);
        }
    }

    /// Waits for a fiber to finish and returns its result.
    pub async fn join_fiber(&self, id: FiberId) -> Result<()> {
        let slot = self.inner.fibers.lock().unwrap().remove(&id);
        match slot {
            Some(slot) => slot.join.await.unwrap_or(Err(NetError::Aborted)),
            None => Ok(()),
        }
    }

    /// Sends a payload on the request, same contract as the raw dispatcher.
    pub async fn send(&self, build: impl FnOnce(&mut PayloadWriter)) -> Result<()> {
        self.inner.dispatcher.send(build).await
    }

    /// Delivers a user-defined signal to every fiber currently waiting on
    /// that kind. Signals are edge-triggered: nothing queues.
    pub fn raise_signal(&self, kind: u8) {
        raise_signal_inner(&self.inner, kind);
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.pump.abort();
        let mut fibers = self.inner.fibers.lock().unwrap();
        for (_, slot) in fibers.drain() {
            slot.flags.abort();
            slot.join.abort();
        }
    }
}

fn raise_signal_inner(inner: &Arc<EventsInner>, kind: u8) {
    let mut router = inner.router.lock().unwrap();
    let waiters = std::mem::take(&mut router.sig_waiters);
    let mut kept = Vec::with_capacity(waiters.len());
    for waiter in waiters {
        if waiter.kinds.contains(&kind) {
            let _ = waiter.tx.send(kind);
        } else {
            kept.push(waiter);
        }
    }
    router.sig_waiters = kept;
}

/// A fiber's view of its dispatcher.
pub struct FiberContext {
    id: FiberId,
    inner: Arc<EventsInner>,
    flags: Arc<FiberFlags>,
}

impl FiberContext {
    /// Id of this fiber.
    pub fn id(&self) -> FiberId {
        self.id
    }

    fn abort_check(&self) -> Result<()> {
        if self.flags.is_aborted() {
            return Err(NetError::Aborted);
        }
        Ok(())
    }

    /// Sends a payload on the request.
    pub async fn send(&self, build: impl FnOnce(&mut PayloadWriter)) -> Result<()> {
        self.abort_check()?;
        self.inner.dispatcher.send(build).await
    }

    /// Waits for the next inbound message whose leading type byte is in
    /// `types`. Queued messages of a matching type are claimed first, in
    /// arrival order.
    pub async fn recv_msg(&self, types: &[u8]) -> Result<(u8, Bytes)> {
        let rx = {
            let mut router = self.inner.router.lock().unwrap();
            if let Some(pos) = router
                .queued
                .iter()
                .position(|body| types.contains(&body[0]))
            {
                let body = router.queued.remove(pos).expect("position just found");
                return Ok((body[0], body.slice(1..)));
            }
            if let Some(dead) = router.dead {
                return Err(dead.to_error());
            }
            let (tx, rx) = oneshot::channel();
            router.msg_waiters.push(MsgWaiter {
                fiber: self.id,
                types: types.to_vec(),
                tx,
            });
            rx
        };
        self.await_waiter(rx).await
    }

    /// Waits until some fiber raises one of `kinds`.
    pub async fn wait_signal(&self, kinds: &[u8]) -> Result<u8> {
        let rx = {
            let mut router = self.inner.router.lock().unwrap();
            if let Some(dead) = router.dead {
                return Err(dead.to_error());
            }
            let (tx, rx) = oneshot::channel();
            router.sig_waiters.push(SigWaiter {
                fiber: self.id,
                kinds: kinds.to_vec(),
                tx,
            });
            rx
        };
        self.await_waiter(rx).await
    }

    async fn await_waiter<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        let mut aborted = pin!(self.flags.note.notified());
        aborted.as_mut().enable();
        self.abort_check()?;
        tokio::select! {
            _ = aborted => {
                self.inner.drop_waiters_of(self.id);
                Err(NetError::Aborted)
            }
            value = rx => value.map_err(|_| {
                if self.flags.is_aborted() {
                    NetError::Aborted
                } else {
                    let router = self.inner.router.lock().unwrap();
                    router
                        .dead
                        .map(DeadReason::to_error)
                        .unwrap_or(NetError::ConnectionClosed)
                }
            }),
        }
    }

    /// Raises a signal to the other fibers.
    pub fn raise_signal(&self, kind: u8) {
        raise_signal_inner(&self.inner, kind);
    }

    /// Aborts another fiber of the same request.
    pub fn abort_fiber(&self, target: FiberId) {
        let slot = {
            let fibers = self.inner.fibers.lock().unwrap();
            fibers.get(&target).map(|slot| Arc::clone(&slot.flags))
        };
        if let Some(flags) = slot {
            flags.abort();
            self.inner.drop_waiters_of(target);
        }
    }

    /// Suspends until a manual resume is delivered to the request. Only one
    /// fiber of a request should use this at a time.
    pub async fn wait_resume(&self, expected: &[i64]) -> Result<i64> {
        self.abort_check()?;
        self.inner.dispatcher.wait_resume(expected).await
    }

    /// Obtains buffer storage from the dispatcher's acquire function.
    pub fn acquire_buffer(&self) -> BytesMut {
        (self.inner.acquire)()
    }
}
