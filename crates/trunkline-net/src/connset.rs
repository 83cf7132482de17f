//! Client connection set.
//!
//! Owns one outbound connection per configured node. Each node gets a
//! supervisor task that connects, waits out the connection's lifetime, and
//! reconnects with exponential backoff. A connection that reaches
//! Established re-arms the live AllNodes requests before it becomes
//! visible to new assignments.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionConfig, ConnectionState};
use crate::credentials::ClientCredentials;
use crate::error::{NetError, Result};
use crate::metrics::NetMetrics;
use crate::notify::{Notifier, RequestNotification};
use crate::request::{ClientHandler, MultiNodeHandle, RequestContext, RequestDescriptor, RequestType};
use crate::requestset::{RequestHandle, RequestSetInner, RequestTracker};

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure (and after any clean close).
    pub initial: Duration,
    /// Ceiling on the delay.
    pub max: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max)
    }
}

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity presented to every node.
    pub credentials: ClientCredentials,
    /// Start each node's connection as soon as it is added. With
    /// `false`, connections are parked until [`ConnectionSet::connect`].
    pub auto_connect: bool,
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// Per-connection tuning.
    pub connection: ConnectionConfig,
    /// Ceiling on one connect + handshake attempt.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(credentials: ClientCredentials) -> Self {
        ClientConfig {
            credentials,
            auto_connect: true,
            backoff: BackoffConfig::default(),
            connection: ConnectionConfig::default(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct NodeLink {
    addr: SocketAddr,
    conn: Mutex<Option<Connection>>,
    started: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct ConnSetInner {
    config: ClientConfig,
    metrics: Arc<NetMetrics>,
    notifier: Notifier,
    pub(crate) requests: Arc<RequestSetInner>,
    nodes: Mutex<Vec<Arc<NodeLink>>>,
    cursor: AtomicUsize,
    running: AtomicBool,
    established_note: Notify,
}

fn live(conn: Option<Connection>) -> Option<Connection> {
    conn.filter(|conn| conn.state() == ConnectionState::Established)
}

impl ConnSetInner {
    /// Next established connection, round-robin over the nodes, skipping
    /// `excluded` addresses.
    pub(crate) fn next_established_excluding(
        &self,
        excluded: &[SocketAddr],
    ) -> Option<(SocketAddr, Connection)> {
        let nodes = self.nodes.lock().unwrap();
        if nodes.is_empty() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..nodes.len() {
            let link = &nodes[(start + offset) % nodes.len()];
            if excluded.contains(&link.addr) {
                continue;
            }
            if let Some(conn) = live(link.conn.lock().unwrap().clone()) {
                return Some((link.addr, conn));
            }
        }
        None
    }

    /// Established connection to `addr`, if the node currently has one.
    pub(crate) fn established_on(&self, addr: SocketAddr) -> Option<Connection> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .find(|link| link.addr == addr)
            .and_then(|link| live(link.conn.lock().unwrap().clone()))
    }

    fn all_established(&self) -> Vec<Connection> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .filter_map(|link| live(link.conn.lock().unwrap().clone()))
            .collect()
    }

    fn established_count(&self) -> usize {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .filter(|link| live(link.conn.lock().unwrap().clone()).is_some())
            .count()
    }
}

async fn supervise(inner: Arc<ConnSetInner>, link: Arc<NodeLink>) {
    let mut delay = inner.config.backoff.initial;
    loop {
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        let attempt = tokio::time::timeout(
            inner.config.connect_timeout,
            Connection::connect(
                link.addr,
                &inner.config.credentials,
                inner.config.connection.clone(),
                Arc::clone(&inner.metrics),
            ),
        )
        .await;

        match attempt {
            Ok(Ok(conn)) => {
                delay = inner.config.backoff.initial;
                // Re-arm AllNodes requests before new assignments can see
                // this connection.
                inner.requests.on_established(&conn);
                *link.conn.lock().unwrap() = Some(conn.clone());
                inner.established_note.notify_waiters();
                info!(node = %link.addr, "node connected");
                conn.closed().await;
                link.conn.lock().unwrap().take();
                debug!(node = %link.addr, "node connection ended");
            }
            Ok(Err(err)) => {
                inner.notifier.notify(RequestNotification::ConnectionError {
                    addr: link.addr,
                    message: err.to_string(),
                });
            }
            Err(_) => {
                inner.notifier.notify(RequestNotification::ConnectionError {
                    addr: link.addr,
                    message: "connect timed out".into(),
                });
            }
        }

        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        tokio::time::sleep(delay).await;
        delay = inner.config.backoff.next(delay);
    }
}

/// Pool of outbound connections, one per configured node, plus the
/// client's request set.
#[derive(Clone)]
pub struct ConnectionSet {
    inner: Arc<ConnSetInner>,
}

impl ConnectionSet {
    /// Creates the set and the user's notification receiver.
    pub fn new(
        config: ClientConfig,
    ) -> (ConnectionSet, mpsc::UnboundedReceiver<RequestNotification>) {
        let (notifier, rx) = Notifier::channel();
        let inner = Arc::new(ConnSetInner {
            config,
            metrics: Arc::new(NetMetrics::new()),
            notifier: notifier.clone(),
            requests: RequestSetInner::new(notifier),
            nodes: Mutex::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            established_note: Notify::new(),
        });
        (ConnectionSet { inner }, rx)
    }

    /// Adds a node; with `auto_connect` its supervisor starts immediately.
    pub fn add_node(&self, addr: SocketAddr) {
        let link = Arc::new(NodeLink {
            addr,
            conn: Mutex::new(None),
            started: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        });
        self.inner.nodes.lock().unwrap().push(Arc::clone(&link));
        if self.inner.config.auto_connect {
            self.start_link(&link);
        }
    }

    /// Adds every node listed in a nodes file.
    pub fn add_nodes_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        for addr in load_nodes_file(path)? {
            self.add_node(addr);
        }
        Ok(())
    }

    fn start_link(&self, link: &Arc<NodeLink>) {
        if link.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = tokio::spawn(supervise(Arc::clone(&self.inner), Arc::clone(link)));
        *link.supervisor.lock().unwrap() = Some(task);
    }

    /// Starts the parked connections of an `auto_connect = false` set.
    pub fn connect(&self) {
        let links: Vec<Arc<NodeLink>> = self.inner.nodes.lock().unwrap().clone();
        for link in links {
            self.start_link(&link);
        }
    }

    /// Tears every connection down and lets the supervisors rebuild them.
    /// Long-lived AllNodes requests are restarted on the new connections.
    pub fn reconnect(&self) {
        info!("reconnecting all nodes");
        let links: Vec<Arc<NodeLink>> = self.inner.nodes.lock().unwrap().clone();
        for link in links {
            if let Some(conn) = link.conn.lock().unwrap().take() {
                conn.shutdown();
            }
        }
    }

    /// Stops supervisors and closes every connection for good.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        let links: Vec<Arc<NodeLink>> = self.inner.nodes.lock().unwrap().clone();
        for link in links {
            if let Some(task) = link.supervisor.lock().unwrap().take() {
                task.abort();
            }
            if let Some(conn) = link.conn.lock().unwrap().take() {
                conn.shutdown();
            }
        }
    }

    /// Number of configured nodes.
    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().unwrap().len()
    }

    /// Number of nodes currently established.
    pub fn established_count(&self) -> usize {
        self.inner.established_count()
    }

    /// Number of requests not yet finished.
    pub fn active_requests(&self) -> usize {
        self.inner.requests.active_count()
    }

    /// Waits until at least `n` nodes are established.
    pub async fn wait_established(&self, n: usize) {
        loop {
            let mut note = std::pin::pin!(self.inner.established_note.notified());
            note.as_mut().enable();
            if self.inner.established_count() >= n {
                return;
            }
            note.await;
        }
    }

    /// Runtime metrics of this set.
    pub fn metrics(&self) -> Arc<NetMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Assigns a new request: allocates an id, freezes the context, and
    /// starts RoCs according to the descriptor's request type.
    pub fn assign(
        &self,
        descriptor: RequestDescriptor,
        args: Bytes,
        handler: ClientHandler,
    ) -> Result<RequestHandle> {
        self.assign_inner(descriptor, args, handler, None)
    }

    /// Assigns a MultiNode request meant to reach `target_nodes` nodes;
    /// nodes the handler never fans out to count as failures in the
    /// aggregate.
    pub fn assign_multi(
        &self,
        descriptor: RequestDescriptor,
        args: Bytes,
        handler: ClientHandler,
        target_nodes: usize,
    ) -> Result<RequestHandle> {
        self.assign_inner(descriptor, args, handler, Some(target_nodes))
    }

    fn assign_inner(
        &self,
        descriptor: RequestDescriptor,
        args: Bytes,
        handler: ClientHandler,
        target_nodes: Option<usize>,
    ) -> Result<RequestHandle> {
        let inner = &self.inner;
        let id = inner.requests.allocate_id();
        let tracker = RequestTracker::new(
            id,
            descriptor,
            RequestContext::new(args),
            handler,
            target_nodes,
            Arc::downgrade(&inner.requests),
            Arc::downgrade(inner),
        );
        inner.requests.register(Arc::clone(&tracker));

        let started: Result<()> = match descriptor.request_type {
            RequestType::SingleNode => match inner.next_established_excluding(&[]) {
                Some((_, conn)) => tracker.start_on(&conn),
                None => Err(NetError::NotConnected),
            },
            RequestType::RoundRobin => match inner.next_established_excluding(&[]) {
                Some((addr, conn)) => {
                    tracker.push_tried(addr);
                    tracker.start_on(&conn)
                }
                None => Err(NetError::NotConnected),
            },
            RequestType::AllNodes => {
                for conn in inner.all_established() {
                    let _ = tracker.start_on(&conn);
                }
                Ok(())
            }
            RequestType::MultiNode => {
                let weak_tracker = Arc::downgrade(&tracker);
                let weak_conns = Arc::downgrade(inner);
                tracker.install_multi(MultiNodeHandle {
                    start: Arc::new(move || {
                        let Some(tracker) = weak_tracker.upgrade() else {
                            return Ok(false);
                        };
                        let Some(conns) = weak_conns.upgrade() else {
                            return Ok(false);
                        };
                        let excluded = tracker.known_addrs();
                        match conns.next_established_excluding(&excluded) {
                            Some((_, conn)) => tracker.start_on(&conn).map(|()| true),
                            None => Ok(false),
                        }
                    }),
                });
                match inner.next_established_excluding(&[]) {
                    Some((_, conn)) => tracker.start_on(&conn),
                    None => Err(NetError::NotConnected),
                }
            }
        };

        if let Err(err) = started {
            inner.requests.remove(id);
            return Err(err);
        }
        Ok(RequestHandle::new(id, tracker))
    }
}

/// Parses a nodes file: one `address:port` per line, `#` starts a comment,
/// empty lines ignored.
pub fn load_nodes_file(path: impl AsRef<Path>) -> Result<Vec<SocketAddr>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let mut nodes = Vec::new();
    for (idx, raw_line) in text.lines().enumerate() {
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let addr: SocketAddr = line.parse().map_err(|e| NetError::BadConfigLine {
            path: path.display().to_string(),
            line: idx + 1,
            reason: format!("bad address: {e}"),
        })?;
        nodes.push(addr);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_nodes_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# cluster nodes").unwrap();
        writeln!(file, "127.0.0.1:4000").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "127.0.0.1:4001 # second node").unwrap();
        file.flush().unwrap();

        let nodes = load_nodes_file(file.path()).unwrap();
        assert_eq!(
            nodes,
            vec![
                "127.0.0.1:4000".parse().unwrap(),
                "127.0.0.1:4001".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_load_nodes_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not-an-address").unwrap();
        file.flush().unwrap();

        let err = load_nodes_file(file.path()).unwrap_err();
        assert!(matches!(err, NetError::BadConfigLine { line: 1, .. }));
    }

    #[test]
    fn test_backoff_growth_is_capped() {
        let backoff = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(350),
            multiplier: 2.0,
        };
        let second = backoff.next(backoff.initial);
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(backoff.next(second), Duration::from_millis(350));
    }
}
