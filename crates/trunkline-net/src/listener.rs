//! Server listener.
//!
//! Accepts sockets and hands each to a connection drawn from a bounded slot
//! pool; a slot carries a recycled read buffer and a concurrency permit,
//! both returned when the connection closes. Dropping all connections
//! keeps the listener itself alive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionConfig, ReadBufReturn};
use crate::credentials::NodeCredentials;
use crate::error::Result;
use crate::metrics::NetMetrics;
use crate::registry::RequestRegistry;

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Ceiling on concurrently open connections; accepts wait for a free
    /// slot beyond it.
    pub max_connections: usize,
    /// Per-connection tuning.
    pub connection: ConnectionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            max_connections: 64,
            connection: ConnectionConfig::default(),
        }
    }
}

struct SlotPool {
    permits: Arc<Semaphore>,
    buffers: Mutex<Vec<BytesMut>>,
    buffer_capacity: usize,
    max_pooled: usize,
}

impl SlotPool {
    fn take_buffer(&self) -> BytesMut {
        self.buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_capacity))
    }

    fn put_back(&self, mut buf: BytesMut) {
        buf.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }
}

struct ListenerInner {
    local_addr: SocketAddr,
    active: Mutex<HashMap<u64, Connection>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    slots: Arc<SlotPool>,
    metrics: Arc<NetMetrics>,
}

/// Accepting side of a node.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Binds and starts accepting.
    pub async fn bind(
        addr: SocketAddr,
        credentials: Arc<NodeCredentials>,
        registry: Arc<RequestRegistry>,
        config: ListenerConfig,
    ) -> Result<Listener> {
        let socket = TcpListener::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let metrics = Arc::new(NetMetrics::new());
        let slots = Arc::new(SlotPool {
            permits: Arc::new(Semaphore::new(config.max_connections)),
            buffers: Mutex::new(Vec::new()),
            buffer_capacity: config.connection.read_buffer_capacity,
            max_pooled: config.max_connections,
        });
        let inner = Arc::new(ListenerInner {
            local_addr,
            active: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            slots,
            metrics,
        });

        let task = tokio::spawn(accept_loop(
            socket,
            Arc::clone(&inner),
            credentials,
            registry,
            config.connection,
        ));
        *inner.accept_task.lock().unwrap() = Some(task);
        info!(addr = %local_addr, "listening");
        Ok(Listener { inner })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.inner.active.lock().unwrap().len()
    }

    /// Finalizes every open connection but keeps accepting new ones.
    pub fn drop_all_connections(&self) {
        let conns: Vec<Connection> = {
            let active = self.inner.active.lock().unwrap();
            active.values().cloned().collect()
        };
        info!(count = conns.len(), "dropping all connections");
        for conn in conns {
            conn.shutdown();
        }
    }

    /// Stops accepting and finalizes every connection.
    pub fn shutdown(&self) {
        if let Some(task) = self.inner.accept_task.lock().unwrap().take() {
            task.abort();
        }
        self.drop_all_connections();
    }

    /// Runtime metrics of this listener.
    pub fn metrics(&self) -> Arc<NetMetrics> {
        Arc::clone(&self.inner.metrics)
    }
}

async fn accept_loop(
    socket: TcpListener,
    inner: Arc<ListenerInner>,
    credentials: Arc<NodeCredentials>,
    registry: Arc<RequestRegistry>,
    config: ConnectionConfig,
) {
    let mut next_conn_id: u64 = 0;
    loop {
        let permit = match Arc::clone(&inner.slots.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let (stream, peer) = match socket.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        next_conn_id += 1;
        let conn_id = next_conn_id;
        debug!(%peer, conn_id, "accepted");

        let buf = inner.slots.take_buffer();
        let pool = Arc::clone(&inner.slots);
        let buf_return: ReadBufReturn = Box::new(move |buf| {
            pool.put_back(buf);
            drop(permit);
        });

        let inner = Arc::clone(&inner);
        let credentials = Arc::clone(&credentials);
        let registry = Arc::clone(&registry);
        let config = config.clone();
        tokio::spawn(async move {
            let established = Connection::establish_server_pooled(
                stream,
                credentials,
                registry,
                config,
                Arc::clone(&inner.metrics),
                buf,
                Some(buf_return),
            )
            .await;
            match established {
                Ok(conn) => {
                    inner.active.lock().unwrap().insert(conn_id, conn.clone());
                    conn.closed().await;
                    inner.active.lock().unwrap().remove(&conn_id);
                }
                Err(err) => {
                    debug!(%peer, error = %err, "connection rejected");
                }
            }
        });
    }
}
