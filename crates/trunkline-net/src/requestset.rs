//! Client request set.
//!
//! Allocates request ids, shares one immutable context across the per-node
//! requests-on-connection of a request, and aggregates their terminal
//! states into exactly one `Finished` notification. The dispatch pattern
//! (SingleNode / AllNodes / RoundRobin / MultiNode) decides where RoCs
//! start and what the aggregate means.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use trunkline_proto::{Frame, FrameType, PayloadWriter};

use crate::connection::Connection;
use crate::connset::ConnSetInner;
use crate::error::{NetError, Result};
use crate::notify::{Notifier, RequestNotification, RequestOutcome};
use crate::request::{
    ClientHandler, ClientRoc, MultiNodeHandle, RequestContext, RequestDescriptor, RequestType,
};
use crate::roc::{RequestId, RocHandle};

/// Handle to an assigned request.
#[derive(Clone)]
pub struct RequestHandle {
    id: RequestId,
    tracker: Arc<RequestTracker>,
}

impl RequestHandle {
    pub(crate) fn new(id: RequestId, tracker: Arc<RequestTracker>) -> Self {
        RequestHandle { id, tracker }
    }

    /// Id of the request.
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    /// Delivers a manual resume code to every live RoC of the request.
    pub fn resume_all(&self, code: i64) {
        self.tracker.resume_all(code);
    }
}

pub(crate) struct RequestSetInner {
    next_id: AtomicU64,
    pub(crate) notifier: Notifier,
    active: Mutex<HashMap<RequestId, Arc<RequestTracker>>>,
}

impl RequestSetInner {
    pub(crate) fn new(notifier: Notifier) -> Arc<Self> {
        Arc::new(RequestSetInner {
            next_id: AtomicU64::new(1),
            notifier,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn allocate_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, tracker: Arc<RequestTracker>) {
        self.active.lock().unwrap().insert(tracker.id, tracker);
    }

    pub(crate) fn remove(&self, id: RequestId) {
        self.active.lock().unwrap().remove(&id);
    }

    /// Number of requests not yet finished.
    pub(crate) fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Re-arms live AllNodes requests on a connection that just reached
    /// Established. Called before the connection becomes visible to new
    /// assignments.
    pub(crate) fn on_established(&self, conn: &Connection) {
        let trackers: Vec<Arc<RequestTracker>> = {
            let active = self.active.lock().unwrap();
            active
                .values()
                .filter(|t| t.descriptor.request_type == RequestType::AllNodes)
                .cloned()
                .collect()
        };
        for tracker in trackers {
            tracker.arm_on_established(conn);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// RoC running on this node.
    Active,
    /// RoC lost its connection; waiting for the node to come back.
    Pending,
    /// RoC reached a terminal state.
    Done { success: bool },
}

#[derive(Default)]
struct TrackerState {
    slots: HashMap<SocketAddr, SlotState>,
    handles: HashMap<SocketAddr, RocHandle>,
    tried: Vec<SocketAddr>,
    finished: bool,
}

/// Aggregation state of one request across its nodes.
pub(crate) struct RequestTracker {
    id: RequestId,
    descriptor: RequestDescriptor,
    context: Arc<RequestContext>,
    handler: ClientHandler,
    /// MultiNode aggregate base: nodes the request was meant to reach.
    target_nodes: Option<usize>,
    set: Weak<RequestSetInner>,
    conns: Weak<ConnSetInner>,
    multi: Mutex<Option<MultiNodeHandle>>,
    state: Mutex<TrackerState>,
}

impl RequestTracker {
    pub(crate) fn new(
        id: RequestId,
        descriptor: RequestDescriptor,
        context: Arc<RequestContext>,
        handler: ClientHandler,
        target_nodes: Option<usize>,
        set: Weak<RequestSetInner>,
        conns: Weak<ConnSetInner>,
    ) -> Arc<Self> {
        Arc::new(RequestTracker {
            id,
            descriptor,
            context,
            handler,
            target_nodes,
            set,
            conns,
            multi: Mutex::new(None),
            state: Mutex::new(TrackerState::default()),
        })
    }

    pub(crate) fn install_multi(&self, handle: MultiNodeHandle) {
        *self.multi.lock().unwrap() = Some(handle);
    }

    pub(crate) fn push_tried(&self, addr: SocketAddr) {
        self.state.lock().unwrap().tried.push(addr);
    }

    pub(crate) fn tried(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().tried.clone()
    }

    /// Node addresses this request has ever touched.
    pub(crate) fn known_addrs(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().slots.keys().copied().collect()
    }

    fn resume_all(&self, code: i64) {
        let handles: Vec<RocHandle> = {
            let state = self.state.lock().unwrap();
            state.handles.values().cloned().collect()
        };
        for handle in handles {
            handle.resume(code);
        }
    }

    /// Starts this request's RoC on `conn`: enqueues the opening frame
    /// (id, command, version, args) and spawns the handler.
    pub(crate) fn start_on(self: &Arc<Self>, conn: &Connection) -> Result<()> {
        let addr = conn.peer_addr();
        {
            let mut state = self.state.lock().unwrap();
            if state.finished {
                return Ok(());
            }
            if matches!(state.slots.get(&addr), Some(SlotState::Active)) {
                return Ok(());
            }
            state.slots.insert(addr, SlotState::Active);
        }

        let mut writer = PayloadWriter::with_capacity(10 + self.context.args.len());
        writer.put_u64(self.id);
        writer.put_u8(self.descriptor.command);
        writer.put_u8(self.descriptor.version);
        writer.put_raw(&self.context.args);
        let opening = Frame::new(FrameType::Request, writer.into_bytes())?;

        let handler = Arc::clone(&self.handler);
        let context = Arc::clone(&self.context);
        let multi = self.multi.lock().unwrap().clone();
        let tracker = Arc::clone(self);
        let spawned = conn.inner.spawn_roc(
            self.id,
            Some(opening),
            move |dispatcher| {
                handler(ClientRoc {
                    dispatcher,
                    context,
                    multi,
                })
            },
            move |result| tracker.roc_finished(addr, result),
        );

        match spawned {
            Ok(handle) => {
                let mut state = self.state.lock().unwrap();
                if matches!(state.slots.get(&addr), Some(SlotState::Active)) {
                    state.handles.insert(addr, handle);
                }
                Ok(())
            }
            Err(err) => {
                let mut state = self.state.lock().unwrap();
                let fallback = if self.descriptor.request_type == RequestType::AllNodes {
                    SlotState::Pending
                } else {
                    SlotState::Done { success: false }
                };
                state.slots.insert(addr, fallback);
                Err(err)
            }
        }
    }

    /// Restarts an AllNodes request on a node that came back.
    pub(crate) fn arm_on_established(self: &Arc<Self>, conn: &Connection) {
        debug_assert_eq!(self.descriptor.request_type, RequestType::AllNodes);
        let addr = conn.peer_addr();
        {
            let state = self.state.lock().unwrap();
            if state.finished {
                return;
            }
            match state.slots.get(&addr) {
                Some(SlotState::Active) | Some(SlotState::Done { .. }) => return,
                Some(SlotState::Pending) | None => {}
            }
        }
        if self.start_on(conn).is_ok() {
            debug!(request_id = self.id, node = %addr, "request re-armed after reconnect");
        }
    }

    fn notify_request_error(&self, addr: SocketAddr, err: &NetError) {
        let Some(set) = self.set.upgrade() else { return };
        match err {
            NetError::Unsupported { status } => set.notifier.notify(RequestNotification::Unsupported {
                id: self.id,
                addr,
                status: *status,
            }),
            NetError::NodeError { message } => set.notifier.notify(RequestNotification::NodeError {
                id: self.id,
                addr,
                message: message.clone(),
            }),
            _ => {}
        }
    }

    fn roc_finished(self: &Arc<Self>, addr: SocketAddr, result: Result<()>) {
        let rtype = self.descriptor.request_type;
        let mut advance_round_robin = false;
        let mut pending = false;
        {
            let mut state = self.state.lock().unwrap();
            if state.finished {
                return;
            }
            state.handles.remove(&addr);
            match result {
                Ok(()) => {
                    state.slots.insert(addr, SlotState::Done { success: true });
                }
                Err(NetError::ConnectionClosed) if rtype == RequestType::AllNodes => {
                    // The node link re-arms this slot once it comes back.
                    state.slots.insert(addr, SlotState::Pending);
                    pending = true;
                }
                Err(err) => {
                    self.notify_request_error(addr, &err);
                    state.slots.insert(addr, SlotState::Done { success: false });
                    advance_round_robin = rtype == RequestType::RoundRobin;
                }
            }
        }
        if pending {
            // The node may have come back before this RoC's teardown was
            // processed; in that case the establishment hook already fired
            // and the slot has to be re-armed here.
            if let Some(conns) = self.conns.upgrade() {
                if let Some(conn) = conns.established_on(addr) {
                    let _ = self.start_on(&conn);
                }
            }
            return;
        }
        if advance_round_robin && self.try_next_node() {
            return;
        }
        self.maybe_finish();
    }

    /// RoundRobin advance: starts on the next untried established node.
    fn try_next_node(self: &Arc<Self>) -> bool {
        let Some(conns) = self.conns.upgrade() else {
            return false;
        };
        loop {
            let tried = self.tried();
            let Some((addr, conn)) = conns.next_established_excluding(&tried) else {
                return false;
            };
            self.push_tried(addr);
            debug!(request_id = self.id, node = %addr, "round-robin advancing");
            if self.start_on(&conn).is_ok() {
                return true;
            }
        }
    }

    fn maybe_finish(self: &Arc<Self>) {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            if state.finished || state.slots.is_empty() {
                return;
            }
            let unsettled = state
                .slots
                .values()
                .any(|s| matches!(s, SlotState::Active | SlotState::Pending));
            if unsettled {
                return;
            }
            let successes = state
                .slots
                .values()
                .filter(|s| matches!(s, SlotState::Done { success: true }))
                .count();
            let outcome = match self.descriptor.request_type {
                RequestType::RoundRobin => {
                    if successes > 0 {
                        RequestOutcome::Succeeded
                    } else {
                        RequestOutcome::Failed
                    }
                }
                _ => {
                    let total = self
                        .target_nodes
                        .map_or(state.slots.len(), |t| t.max(state.slots.len()));
                    if successes == 0 {
                        RequestOutcome::Failed
                    } else if successes >= total {
                        RequestOutcome::Succeeded
                    } else {
                        RequestOutcome::PartialSuccess
                    }
                }
            };
            state.finished = true;
            outcome
        };
        if let Some(set) = self.set.upgrade() {
            set.remove(self.id);
            set.notifier.notify(RequestNotification::Finished {
                id: self.id,
                outcome,
            });
        }
    }
}
