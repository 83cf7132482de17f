//! Key/value client.
//!
//! Wraps a connection set and turns the framework's notifications into
//! typed results: request/reply operations resolve a future, GetAll yields
//! an event stream with suspend/resume/stop control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use trunkline_net::{
    ClientConfig, ClientHandler, ClientRoc, ConnectionSet, ControlChange, ControlLink, NetError,
    RequestDescriptor, RequestHandle, RequestId, RequestNotification, RequestOutcome,
};
use trunkline_proto::{PayloadReader, PayloadWriter};

use crate::error::{KvError, Result};
use crate::msg::{self, get_reply, put_reply, resume_code, stream_msg};

/// One event of a GetAll stream.
#[derive(Debug)]
pub enum GetAllEvent {
    /// One record of the store.
    Record { key: u64, value: Bytes },
    /// The node acknowledged a suspend.
    Suspended,
    /// The node acknowledged a resume.
    Resumed,
    /// The node acknowledged a stop; an `End` follows.
    Stopped,
    /// The request finished on all nodes.
    Finished { outcome: RequestOutcome },
}

#[derive(Default)]
struct PendingEntry {
    outcome_tx: Option<oneshot::Sender<RequestOutcome>>,
    get_all_tx: Option<mpsc::UnboundedSender<GetAllEvent>>,
    error: Option<KvError>,
}

#[derive(Default)]
struct PendingMap {
    entries: HashMap<RequestId, PendingEntry>,
}

/// Client over a set of key/value nodes.
pub struct KvClient {
    conns: ConnectionSet,
    pending: Arc<Mutex<PendingMap>>,
    connection_errors: Arc<AtomicU64>,
}

impl KvClient {
    /// Creates the client and its notification router.
    pub fn new(config: ClientConfig) -> KvClient {
        let (conns, mut notifications) = ConnectionSet::new(config);
        let pending = Arc::new(Mutex::new(PendingMap::default()));
        let connection_errors = Arc::new(AtomicU64::new(0));

        let router_pending = Arc::clone(&pending);
        let router_errors = Arc::clone(&connection_errors);
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                route_notification(&router_pending, &router_errors, notification);
            }
        });

        KvClient {
            conns,
            pending,
            connection_errors,
        }
    }

    /// The underlying connection set (node management, reconnect).
    pub fn connections(&self) -> &ConnectionSet {
        &self.conns
    }

    /// Failed connection attempts observed so far.
    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    /// Shuts the client down; in-flight requests fail.
    pub fn shutdown(&self) {
        self.conns.shutdown();
    }

    /// Registers a request under the pending map and assigns it. Holding
    /// the map lock across the assignment means the router cannot process
    /// this request's notifications before the entry exists.
    fn assign_tracked(
        &self,
        descriptor: RequestDescriptor,
        args: Bytes,
        handler: ClientHandler,
        target_nodes: Option<usize>,
        get_all_tx: Option<mpsc::UnboundedSender<GetAllEvent>>,
    ) -> Result<(RequestHandle, oneshot::Receiver<RequestOutcome>)> {
        let mut pending = self.pending.lock().unwrap();
        let assigned = match target_nodes {
            Some(n) => self.conns.assign_multi(descriptor, args, handler, n),
            None => self.conns.assign(descriptor, args, handler),
        };
        let handle = assigned.map_err(|err| match err {
            NetError::NotConnected => KvError::NotConnected,
            other => KvError::Net(other),
        })?;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        pending.entries.insert(
            handle.request_id(),
            PendingEntry {
                outcome_tx: Some(outcome_tx),
                get_all_tx,
                error: None,
            },
        );
        Ok((handle, outcome_rx))
    }

    async fn finish(
        &self,
        id: RequestId,
        outcome_rx: oneshot::Receiver<RequestOutcome>,
    ) -> Result<RequestOutcome> {
        match outcome_rx.await {
            Ok(outcome) => {
                if outcome == RequestOutcome::Failed {
                    let detail = self
                        .pending
                        .lock()
                        .unwrap()
                        .entries
                        .remove(&id)
                        .and_then(|entry| entry.error);
                    return Err(detail.unwrap_or(KvError::Failed));
                }
                self.pending.lock().unwrap().entries.remove(&id);
                Ok(outcome)
            }
            Err(_) => Err(KvError::ClientClosed),
        }
    }

    /// Stores `value` under `key` on one node.
    pub async fn put(&self, key: u64, value: impl Into<Bytes>) -> Result<()> {
        let args = put_args(key, &value.into());
        let (handle, outcome_rx) =
            self.assign_tracked(msg::PUT, args, put_like_handler(), None, None)?;
        self.finish(handle.request_id(), outcome_rx).await.map(|_| ())
    }

    /// Stores `value` under `key` on the next node in rotation, advancing
    /// past failing nodes.
    pub async fn round_robin_put(&self, key: u64, value: impl Into<Bytes>) -> Result<()> {
        let args = put_args(key, &value.into());
        let (handle, outcome_rx) =
            self.assign_tracked(msg::ROUND_ROBIN_PUT, args, put_like_handler(), None, None)?;
        self.finish(handle.request_id(), outcome_rx).await.map(|_| ())
    }

    /// Stores `value` under `key` on two distinct nodes. The outcome says
    /// whether both, one, or neither write landed.
    pub async fn double_put(&self, key: u64, value: impl Into<Bytes>) -> Result<RequestOutcome> {
        let args = put_args(key, &value.into());
        let (handle, outcome_rx) =
            self.assign_tracked(msg::DOUBLE_PUT, args, double_put_handler(), Some(2), None)?;
        match self.finish(handle.request_id(), outcome_rx).await {
            Ok(outcome) => Ok(outcome),
            // Partial failure detail is in the outcome, not an error.
            Err(KvError::Failed) => Ok(RequestOutcome::Failed),
            Err(err) => Err(err),
        }
    }

    /// Fetches the value under `key` from one node.
    pub async fn get(&self, key: u64) -> Result<Option<Bytes>> {
        self.get_versioned(key, msg::REQUEST_VERSION).await
    }

    /// Fetches `key` announcing an arbitrary request version; versions the
    /// node does not register are answered with a version-not-supported
    /// status.
    pub async fn get_versioned(&self, key: u64, version: u8) -> Result<Option<Bytes>> {
        let descriptor = RequestDescriptor { version, ..msg::GET };
        let value_slot: ValueSlot = Arc::new(Mutex::new(None));
        let (value_tx, value_rx) = oneshot::channel();
        *value_slot.lock().unwrap() = Some(value_tx);

        let args = {
            let mut writer = PayloadWriter::with_capacity(8);
            writer.put_u64(key);
            writer.into_bytes()
        };
        let (handle, outcome_rx) = self.assign_tracked(
            descriptor,
            args,
            get_handler(Arc::clone(&value_slot)),
            None,
            None,
        )?;

        match value_rx.await {
            Ok(value) => {
                self.pending.lock().unwrap().entries.remove(&handle.request_id());
                Ok(value)
            }
            Err(_) => {
                // Handler never produced a value; surface the failure.
                match self.finish(handle.request_id(), outcome_rx).await {
                    Ok(_) => Err(KvError::Failed),
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Streams every record of the store from all nodes.
    pub fn get_all(&self) -> Result<GetAllStream> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = ControlLink::new();
        let handler = get_all_handler(events_tx.clone(), Arc::clone(&control));
        let (handle, _outcome_rx) =
            self.assign_tracked(msg::GET_ALL, Bytes::new(), handler, None, Some(events_tx))?;
        Ok(GetAllStream {
            events: events_rx,
            handle,
            control,
        })
    }
}

fn route_notification(
    pending: &Arc<Mutex<PendingMap>>,
    connection_errors: &Arc<AtomicU64>,
    notification: RequestNotification,
) {
    let mut pending = pending.lock().unwrap();
    match notification {
        RequestNotification::Finished { id, outcome } => {
            let mut retire = false;
            if let Some(entry) = pending.entries.get_mut(&id) {
                if let Some(tx) = entry.outcome_tx.take() {
                    // A dropped waiter will never come back for the detail.
                    retire = tx.send(outcome).is_err();
                }
                if let Some(tx) = &entry.get_all_tx {
                    let _ = tx.send(GetAllEvent::Finished { outcome });
                    retire = true;
                }
            }
            if retire {
                pending.entries.remove(&id);
            }
        }
        RequestNotification::Unsupported { id, addr, status } => {
            debug!(request_id = id, node = %addr, ?status, "request not supported");
            if let Some(entry) = pending.entries.get_mut(&id) {
                entry.error.get_or_insert(KvError::Unsupported { status });
            }
        }
        RequestNotification::NodeError { id, addr, message } => {
            debug!(request_id = id, node = %addr, %message, "node error");
            if let Some(entry) = pending.entries.get_mut(&id) {
                entry.error.get_or_insert(KvError::NodeError { message });
            }
        }
        RequestNotification::ConnectionError { addr, message } => {
            debug!(node = %addr, %message, "connection error");
            connection_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// A running GetAll and its control handle.
pub struct GetAllStream {
    events: mpsc::UnboundedReceiver<GetAllEvent>,
    handle: RequestHandle,
    control: Arc<ControlLink>,
}

impl GetAllStream {
    /// Next stream event; `None` once the stream is torn down.
    pub async fn next_event(&mut self) -> Option<GetAllEvent> {
        self.events.recv().await
    }

    /// Asks the nodes to pause producing. Errs while another control
    /// change is still unacknowledged.
    pub fn suspend(&self) -> Result<()> {
        self.control.begin(ControlChange::Suspend)?;
        self.handle.resume_all(resume_code::SUSPEND);
        Ok(())
    }

    /// Asks the nodes to carry on after a suspend.
    pub fn resume(&self) -> Result<()> {
        self.control.begin(ControlChange::Resume)?;
        self.handle.resume_all(resume_code::RESUME);
        Ok(())
    }

    /// Stops the stream for good; a `Stopped` event follows the node's
    /// acknowledgement.
    pub fn stop(&self) -> Result<()> {
        self.control.begin(ControlChange::Stop)?;
        self.handle.resume_all(resume_code::STOP);
        Ok(())
    }

    /// Id of the underlying request.
    pub fn request_id(&self) -> RequestId {
        self.handle.request_id()
    }
}

type ValueSlot = Arc<Mutex<Option<oneshot::Sender<Option<Bytes>>>>>;

fn put_args(key: u64, value: &Bytes) -> Bytes {
    let mut writer = PayloadWriter::with_capacity(12 + value.len());
    writer.put_u64(key);
    writer.put_array(value);
    writer.into_bytes()
}

fn put_like_handler() -> ClientHandler {
    Arc::new(|roc: ClientRoc| {
        Box::pin(async move {
            roc.dispatcher.recv_initial_status().await?;
            read_put_reply(&roc).await
        })
    })
}

fn double_put_handler() -> ClientHandler {
    Arc::new(|roc: ClientRoc| {
        Box::pin(async move {
            roc.dispatcher.recv_initial_status().await?;
            // Fan out to a second node; the first invocation starts it, the
            // second finds every node taken and moves on.
            if let Some(multi) = &roc.multi {
                let _ = multi.start_on_new_conn()?;
            }
            read_put_reply(&roc).await
        })
    })
}

async fn read_put_reply(roc: &ClientRoc) -> trunkline_net::Result<()> {
    let reply: u8 = roc.dispatcher.recv_value().await?;
    match reply {
        put_reply::OK => Ok(()),
        put_reply::ERROR => Err(NetError::NodeError {
            message: "node rejected put".into(),
        }),
        other => Err(roc
            .dispatcher
            .shutdown_with_protocol_error(format!("unknown put reply byte {other}"))),
    }
}

fn get_handler(value_slot: ValueSlot) -> ClientHandler {
    Arc::new(move |roc: ClientRoc| {
        let value_slot = Arc::clone(&value_slot);
        Box::pin(async move {
            roc.dispatcher.recv_initial_status().await?;
            let (reply, body) = roc
                .dispatcher
                .recv_one_of(&[get_reply::VALUE, get_reply::NOTHING, get_reply::ERROR])
                .await?;
            let value = match reply {
                get_reply::VALUE => {
                    let mut reader = PayloadReader::new(body);
                    let value = reader.take_array()?;
                    reader.expect_end()?;
                    Some(value)
                }
                get_reply::NOTHING => None,
                _ => {
                    return Err(NetError::NodeError {
                        message: "node reported a get error".into(),
                    })
                }
            };
            if let Some(tx) = value_slot.lock().unwrap().take() {
                let _ = tx.send(value);
            }
            Ok(())
        })
    })
}

fn get_all_handler(
    events_tx: mpsc::UnboundedSender<GetAllEvent>,
    control: Arc<ControlLink>,
) -> ClientHandler {
    Arc::new(move |roc: ClientRoc| {
        let events_tx = events_tx.clone();
        let control = Arc::clone(&control);
        Box::pin(async move {
            roc.dispatcher.recv_initial_status().await?;
            let acquire = roc.dispatcher.buffer_acquire();
            let events = trunkline_net::EventDispatcher::new(roc.dispatcher, acquire);

            let reader_tx = events_tx.clone();
            let reader_link = Arc::clone(&control);
            let reader = events.spawn_fiber("reader", move |ctx| async move {
                loop {
                    let (msg_type, body) = ctx
                        .recv_msg(&[
                            stream_msg::RECORD,
                            stream_msg::END,
                            stream_msg::ACK,
                            stream_msg::ERROR,
                        ])
                        .await?;
                    match msg_type {
                        stream_msg::RECORD => {
                            let mut reader = PayloadReader::new(body);
                            let key = reader.take_u64()?;
                            let value = reader.take_array()?;
                            let _ = reader_tx.send(GetAllEvent::Record { key, value });
                        }
                        stream_msg::ACK => match reader_link.deliver_ack() {
                            Some(ControlChange::Suspend) => {
                                let _ = reader_tx.send(GetAllEvent::Suspended);
                            }
                            Some(ControlChange::Resume) => {
                                let _ = reader_tx.send(GetAllEvent::Resumed);
                            }
                            Some(ControlChange::Stop) => {
                                let _ = reader_tx.send(GetAllEvent::Stopped);
                            }
                            None => warn!("ack with no control change in flight"),
                        },
                        stream_msg::ERROR => {
                            return Err(NetError::NodeError {
                                message: "node reported a stream error".into(),
                            })
                        }
                        _ => {
                            // End of stream: the final Ack releases the
                            // node's request.
                            ctx.send(|w| w.put_u8(stream_msg::ACK)).await?;
                            return Ok(());
                        }
                    }
                }
            });

            let controller = events.spawn_fiber("controller", move |ctx| async move {
                loop {
                    let code = ctx
                        .wait_resume(&[
                            resume_code::SUSPEND,
                            resume_code::RESUME,
                            resume_code::STOP,
                        ])
                        .await?;
                    let byte = match code {
                        resume_code::SUSPEND => stream_msg::SUSPEND,
                        resume_code::RESUME => stream_msg::RESUME,
                        _ => stream_msg::STOP,
                    };
                    ctx.send(|w| w.put_u8(byte)).await?;
                }
            });

            let result = events.join_fiber(reader).await;
            events.abort_fiber(controller);
            result
        })
    })
}
