//! Connection: one authenticated duplex TCP link.
//!
//! A connection owns its socket, performs the handshake, then runs exactly
//! one sender task and one receiver task. Inbound request frames are
//! demultiplexed by request id into the mailboxes of the live
//! requests-on-connection; shutdown aborts every live RoC with a
//! connection-closed cause.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::{Bytes, BytesMut};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, trace, warn};
use trunkline_proto::Frame;

use crate::auth;
use crate::buffers::{BufferPool, BufferPoolConfig};
use crate::credentials::{ClientCredentials, NodeCredentials};
use crate::dispatch::RequestDispatcher;
use crate::error::{NetError, Result};
use crate::metrics::NetMetrics;
use crate::receiver;
use crate::registry::RequestRegistry;
use crate::roc::{RequestId, RocEntry, RocHandle, RocShared};
use crate::sender::{self, SendItem};
use crate::sockopt::{self, KeepaliveConfig};

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket exists, nothing exchanged yet.
    Initial,
    /// Exchanging protocol version bytes.
    Handshake,
    /// Running the HMAC authentication exchange.
    Authenticating,
    /// Full-duplex operation; requests may start.
    Established,
    /// Tearing down; live RoCs are being aborted.
    ShuttingDown,
    /// Finalized. A client may schedule a reconnect from here.
    Closed,
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol version byte announced during the handshake.
    pub protocol_version: u8,
    /// TCP keepalive parameters.
    pub keepalive: KeepaliveConfig,
    /// Sender coalesces queued frames up to this many bytes per write.
    pub batch_bytes: usize,
    /// A request's `send` suspends while more than this many bytes sit in
    /// the outbound queue. Raw enqueues are unaffected.
    pub send_highwater: usize,
    /// Capacity of the receive buffer.
    pub read_buffer_capacity: usize,
    /// Buffer pool shared by this connection's requests.
    pub buffer_pool: BufferPoolConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            protocol_version: 1,
            keepalive: KeepaliveConfig::default(),
            batch_bytes: 64 * 1024,
            send_highwater: 256 * 1024,
            read_buffer_capacity: 16 * 1024,
            buffer_pool: BufferPoolConfig::default(),
        }
    }
}

/// Which side of the link this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

/// Hook through which the receiver hands its buffer back to a pool when
/// the connection finishes.
pub(crate) type ReadBufReturn = Box<dyn FnOnce(BytesMut) + Send>;

#[derive(Debug, Default)]
struct RocTable {
    entries: HashMap<RequestId, RocEntry>,
    /// Ids of requests that already ran on this connection and ended.
    /// A frame for a drained id is a late frame and is dropped; a frame for
    /// an id that is neither live nor drained opens a new request (server
    /// side). Never reused within a connection's lifetime.
    drained: HashSet<RequestId>,
}

pub(crate) struct ConnInner {
    peer: SocketAddr,
    side: Side,
    pub(crate) config: ConnectionConfig,
    client_name: OnceLock<String>,
    state_tx: watch::Sender<ConnectionState>,
    send_tx: mpsc::UnboundedSender<SendItem>,
    rocs: Mutex<RocTable>,
    registry: Option<Arc<RequestRegistry>>,
    finalized: AtomicBool,
    queued_bytes: AtomicUsize,
    pub(crate) drained_note: Notify,
    pub(crate) metrics: Arc<NetMetrics>,
    pub(crate) buffers: Arc<BufferPool>,
}

impl ConnInner {
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Queues a frame for the sender task. Never blocks.
    pub(crate) fn enqueue(&self, frame: Frame) -> Result<()> {
        if self.state() != ConnectionState::Established {
            return Err(NetError::ConnectionClosed);
        }
        let len = frame.encoded_len();
        self.metrics.record_frame_sent(len);
        self.queued_bytes.fetch_add(len, Ordering::Relaxed);
        self.send_tx
            .send(SendItem::Frame(frame))
            .map_err(|_| NetError::ConnectionClosed)
    }

    /// Bytes currently queued for the sender.
    pub(crate) fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    /// Called by the sender task after a batch hits the socket.
    pub(crate) fn mark_written(&self, len: usize) {
        let before = self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
        if before.saturating_sub(len) <= self.config.send_highwater {
            self.drained_note.notify_waiters();
        }
    }

    /// Records a protocol violation, tears the connection down, and hands
    /// back the error for propagation.
    pub(crate) fn protocol_error(self: &Arc<Self>, reason: String) -> NetError {
        self.metrics.record_protocol_error();
        warn!(peer = %self.peer, %reason, "protocol error, shutting connection down");
        self.shutdown();
        NetError::Protocol { reason }
    }

    /// Drives the connection to ShuttingDown: aborts every live RoC and
    /// tells the sender task to finish. Idempotent.
    pub(crate) fn shutdown(self: &Arc<Self>) {
        {
            let mut table = self.rocs.lock().unwrap();
            if matches!(
                self.state(),
                ConnectionState::ShuttingDown | ConnectionState::Closed
            ) {
                return;
            }
            self.set_state(ConnectionState::ShuttingDown);
            debug!(peer = %self.peer, live_rocs = table.entries.len(), "shutting down");
            for (_, entry) in table.entries.drain() {
                entry.shared.abort(NetError::ConnectionClosed);
            }
        }
        // Wake senders parked on the high-water mark so they observe the
        // abort.
        self.drained_note.notify_waiters();
        if self.send_tx.send(SendItem::Close).is_err() {
            // Sender already gone; finalize here instead.
            self.finalize();
        }
    }

    /// Marks the connection Closed. Called by the sender task once the
    /// socket is done.
    pub(crate) fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        self.metrics.record_connection_closed();
        info!(peer = %self.peer, "connection closed");
    }

    /// Starts a request-on-connection: registers the id, enqueues the
    /// opening frame (if any) while no reply can race it, spawns the
    /// handler task, and returns the external handle. `on_done` fires
    /// exactly once with the handler result after the id has been retired.
    pub(crate) fn spawn_roc<F, Fut, D>(
        self: &Arc<Self>,
        id: RequestId,
        opening: Option<Frame>,
        make: F,
        on_done: D,
    ) -> Result<RocHandle>
    where
        F: FnOnce(RequestDispatcher) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
        D: FnOnce(std::result::Result<(), NetError>) + Send + 'static,
    {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let shared = RocShared::new();
        {
            let mut table = self.rocs.lock().unwrap();
            if self.state() != ConnectionState::Established {
                return Err(NetError::NotConnected);
            }
            if table.entries.contains_key(&id) || table.drained.contains(&id) {
                return Err(NetError::Protocol {
                    reason: format!("request id {id} already used on this connection"),
                });
            }
            table.entries.insert(
                id,
                RocEntry {
                    mailbox: mailbox_tx,
                    shared: Arc::clone(&shared),
                },
            );
        }
        self.metrics.record_roc_started();

        // The mailbox is registered, so a reply to the opening frame cannot
        // be dropped; the handler task has not run, so nothing it sends can
        // overtake the opening frame in the FIFO.
        if let Some(frame) = opening {
            if let Err(err) = self.enqueue(frame) {
                self.finish_roc(id);
                return Err(err);
            }
        }

        let dispatcher = RequestDispatcher::new(Arc::clone(self), id, mailbox_rx, Arc::clone(&shared));
        let fut = make(dispatcher);
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let result = fut.await;
            conn.finish_roc(id);
            if let Err(err) = &result {
                if err.is_connection_scoped() {
                    conn.shutdown();
                }
            }
            on_done(result);
        });
        Ok(RocHandle::new(id, shared))
    }

    fn finish_roc(&self, id: RequestId) {
        let mut table = self.rocs.lock().unwrap();
        if table.entries.remove(&id).is_some() {
            table.drained.insert(id);
            self.metrics.record_roc_finished();
        }
    }

    /// Retires an id that got a not-supported reply and never became a RoC,
    /// so later frames for it are dropped rather than re-dispatched.
    pub(crate) fn mark_drained(&self, id: RequestId) {
        self.rocs.lock().unwrap().drained.insert(id);
    }

    /// Routes one inbound request-frame body. A frame for an id with no
    /// live RoC is silently dropped, except on the server, where an id
    /// that never ran on this connection is the first frame of a new
    /// request.
    pub(crate) fn deliver_request_frame(self: &Arc<Self>, id: RequestId, body: Bytes) {
        let new_request = {
            let table = self.rocs.lock().unwrap();
            if let Some(entry) = table.entries.get(&id) {
                if entry.mailbox.send(body).is_err() {
                    self.metrics.record_frame_dropped();
                }
                return;
            }
            self.side == Side::Server && !table.drained.contains(&id)
        };

        if !new_request {
            trace!(peer = %self.peer, request_id = id, "dropping frame for unknown request id");
            self.metrics.record_frame_dropped();
            return;
        }

        let registry = self
            .registry
            .as_ref()
            .expect("server connection without a registry")
            .clone();
        if let Err(err) = registry.dispatch(self, id, body) {
            let _ = self.protocol_error(err.to_string());
        }
    }
}

/// Handle to an established connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl Connection {
    /// Connects, applies socket options, and runs the client handshake.
    pub async fn connect(
        addr: SocketAddr,
        creds: &ClientCredentials,
        config: ConnectionConfig,
        metrics: Arc<NetMetrics>,
    ) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        Connection::establish_client(stream, creds, config, metrics).await
    }

    /// Runs the client handshake on an already-connected stream.
    pub async fn establish_client(
        mut stream: TcpStream,
        creds: &ClientCredentials,
        config: ConnectionConfig,
        metrics: Arc<NetMetrics>,
    ) -> Result<Connection> {
        sockopt::apply(&stream, &config.keepalive)?;
        let peer = stream.peer_addr()?;
        let (state_tx, _) = watch::channel(ConnectionState::Initial);

        state_tx.send_replace(ConnectionState::Handshake);
        let handshake = async {
            auth::exchange_version(&mut stream, config.protocol_version).await?;
            state_tx.send_replace(ConnectionState::Authenticating);
            auth::client_authenticate(&mut stream, creds, peer).await
        };
        if let Err(err) = handshake.await {
            if matches!(err, NetError::AuthRejected { .. }) {
                metrics.record_auth_failure();
            }
            state_tx.send_replace(ConnectionState::Closed);
            return Err(err);
        }

        let read_buf = BytesMut::with_capacity(config.read_buffer_capacity);
        Ok(Connection::assemble(
            stream,
            Side::Client,
            config,
            metrics,
            None,
            None,
            state_tx,
            peer,
            read_buf,
            None,
        ))
    }

    /// Runs the node-side handshake on an accepted stream.
    pub async fn establish_server(
        stream: TcpStream,
        creds: Arc<NodeCredentials>,
        registry: Arc<RequestRegistry>,
        config: ConnectionConfig,
        metrics: Arc<NetMetrics>,
    ) -> Result<Connection> {
        let read_buf = BytesMut::with_capacity(config.read_buffer_capacity);
        Connection::establish_server_pooled(stream, creds, registry, config, metrics, read_buf, None)
            .await
    }

    /// Node-side establishment with a caller-supplied (typically pooled)
    /// read buffer, returned through `read_buf_return` when the receiver
    /// finishes.
    pub(crate) async fn establish_server_pooled(
        mut stream: TcpStream,
        creds: Arc<NodeCredentials>,
        registry: Arc<RequestRegistry>,
        config: ConnectionConfig,
        metrics: Arc<NetMetrics>,
        read_buf: BytesMut,
        read_buf_return: Option<ReadBufReturn>,
    ) -> Result<Connection> {
        sockopt::apply(&stream, &config.keepalive)?;
        let peer = stream.peer_addr()?;
        let (state_tx, _) = watch::channel(ConnectionState::Initial);

        state_tx.send_replace(ConnectionState::Handshake);
        let handshake = async {
            auth::exchange_version(&mut stream, config.protocol_version).await?;
            state_tx.send_replace(ConnectionState::Authenticating);
            auth::server_authenticate(&mut stream, &creds, peer).await
        };
        let name = match handshake.await {
            Ok(name) => name,
            Err(err) => {
                if matches!(
                    err,
                    NetError::AuthRejected { .. } | NetError::UnknownClient { .. }
                ) {
                    metrics.record_auth_failure();
                }
                state_tx.send_replace(ConnectionState::Closed);
                return Err(err);
            }
        };

        Ok(Connection::assemble(
            stream,
            Side::Server,
            config,
            metrics,
            Some(registry),
            Some(name),
            state_tx,
            peer,
            read_buf,
            read_buf_return,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        stream: TcpStream,
        side: Side,
        config: ConnectionConfig,
        metrics: Arc<NetMetrics>,
        registry: Option<Arc<RequestRegistry>>,
        client_name: Option<String>,
        state_tx: watch::Sender<ConnectionState>,
        peer: SocketAddr,
        read_buf: BytesMut,
        read_buf_return: Option<ReadBufReturn>,
    ) -> Connection {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let buffers = BufferPool::new(config.buffer_pool.clone());
        let inner = Arc::new(ConnInner {
            peer,
            side,
            config,
            client_name: OnceLock::new(),
            state_tx,
            send_tx,
            rocs: Mutex::new(RocTable::default()),
            registry,
            finalized: AtomicBool::new(false),
            queued_bytes: AtomicUsize::new(0),
            drained_note: Notify::new(),
            metrics,
            buffers,
        });
        if let Some(name) = client_name {
            let _ = inner.client_name.set(name);
        }
        inner.set_state(ConnectionState::Established);
        inner.metrics.record_connection_opened();
        debug!(peer = %peer, side = ?side, "connection established");

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(sender::run(write_half, send_rx, Arc::clone(&inner)));
        tokio::spawn(receiver::run(
            read_half,
            Arc::clone(&inner),
            read_buf,
            read_buf_return,
        ));

        Connection { inner }
    }

    /// Remote address of the link.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Authenticated client name (server side only).
    pub fn client_name(&self) -> Option<&str> {
        self.inner.client_name.get().map(String::as_str)
    }

    /// Initiates shutdown: aborts live requests, closes the socket.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Resolves once the connection reaches Closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.subscribe_state();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Number of live requests-on-connection.
    pub fn live_requests(&self) -> usize {
        self.inner.rocs.lock().unwrap().entries.len()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Establishes a real client/server connection pair over loopback with
    /// an empty request registry.
    async fn loopback_pair() -> (Connection, Connection) {
        let creds = ClientCredentials::new("pair", vec![3u8; 16]);
        let mut store = NodeCredentials::new();
        store.add("pair", vec![3u8; 16]);
        let store = Arc::new(store);
        let registry = Arc::new(RequestRegistry::new());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::establish_server(
                stream,
                store,
                registry,
                ConnectionConfig::default(),
                Arc::new(NetMetrics::new()),
            )
            .await
            .unwrap()
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = Connection::establish_client(
            stream,
            &creds,
            ConnectionConfig::default(),
            Arc::new(NetMetrics::new()),
        )
        .await
        .unwrap();
        (client, server.await.unwrap())
    }

    #[tokio::test]
    async fn test_pair_reaches_established() {
        let (client, server) = loopback_pair().await;
        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(server.client_name(), Some("pair"));
        assert_eq!(client.client_name(), None);

        client.shutdown();
        client.closed().await;
        server.closed().await;
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_live_requests() {
        let (client, _server) = loopback_pair().await;

        let (done_tx, done_rx) = oneshot::channel();
        client
            .inner
            .spawn_roc(
                1,
                None,
                |dispatcher| async move {
                    // Parks forever; only the shutdown can end it.
                    dispatcher.recv().await?;
                    Ok(())
                },
                move |result| {
                    let _ = done_tx.send(result);
                },
            )
            .unwrap();
        assert_eq!(client.live_requests(), 1);

        client.shutdown();
        let result = done_rx.await.unwrap();
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
        assert_eq!(client.live_requests(), 0);
    }

    #[tokio::test]
    async fn test_request_ids_are_not_reused() {
        let (client, _server) = loopback_pair().await;

        let (done_tx, done_rx) = oneshot::channel();
        client
            .inner
            .spawn_roc(
                7,
                None,
                |_dispatcher| async move { Ok(()) },
                move |result| {
                    let _ = done_tx.send(result);
                },
            )
            .unwrap();
        done_rx.await.unwrap().unwrap();

        // The id is drained now; starting it again on this connection is
        // a local protocol violation.
        let again = client
            .inner
            .spawn_roc(7, None, |_dispatcher| async move { Ok(()) }, |_result| {});
        assert!(matches!(again, Err(NetError::Protocol { .. })));

        client.shutdown();
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let (client, _server) = loopback_pair().await;
        client.shutdown();
        client.closed().await;

        let frame = Frame::request(9, b"late").unwrap();
        assert!(matches!(
            client.inner.enqueue(frame),
            Err(NetError::ConnectionClosed)
        ));
    }
}
