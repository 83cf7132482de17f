//! Key/value node: registry wiring and request handlers.
//!
//! Put, Get, DoublePut and RoundRobinPut are plain request/reply handlers;
//! GetAll streams the whole store and carries the suspend/resume/stop
//! control plane on a separate sub-fiber.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use trunkline_net::{
    controller, AdminSocket, EventDispatcher, Flow, HandlerFlags, Listener, ListenerConfig,
    NodeCredentials, RequestRegistry, Result, ServerHandlerFactory, ServerRequest, SuspendState,
};
use trunkline_proto::PayloadReader;

use crate::msg::{command, get_reply, put_reply, stream_msg, GET_ALL_CONTROL, REQUEST_VERSION};
use crate::storage::Storage;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct KvNodeConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Listener tuning.
    pub listener: ListenerConfig,
    /// Admin unix socket path, if any.
    pub admin_socket: Option<PathBuf>,
}

impl KvNodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        KvNodeConfig {
            listen_addr,
            listener: ListenerConfig::default(),
            admin_socket: None,
        }
    }
}

/// A running key/value node.
pub struct KvNode {
    listener: Listener,
    _admin: Option<AdminSocket>,
}

impl KvNode {
    /// Builds the registry, binds the listener, and starts serving.
    pub async fn start(
        config: KvNodeConfig,
        credentials: Arc<NodeCredentials>,
        storage: Arc<dyn Storage>,
    ) -> Result<KvNode> {
        let registry = Arc::new(build_registry(storage));
        let listener = Listener::bind(
            config.listen_addr,
            credentials,
            registry,
            config.listener,
        )
        .await?;
        let admin = match &config.admin_socket {
            Some(path) => Some(AdminSocket::bind(path, listener.clone())?),
            None => None,
        };
        Ok(KvNode {
            listener,
            _admin: admin,
        })
    }

    /// Address the node accepted on.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// The underlying listener.
    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    /// Stops accepting and finalizes every connection.
    pub fn shutdown(&self) {
        self.listener.shutdown();
    }
}

/// Registers the five key/value commands against `storage`.
pub fn build_registry(storage: Arc<dyn Storage>) -> RequestRegistry {
    let mut registry = RequestRegistry::new();
    let flags = HandlerFlags::default();
    registry.register(
        command::PUT,
        REQUEST_VERSION,
        HandlerFlags {
            timing: true,
            ..flags
        },
        put_factory(Arc::clone(&storage)),
    );
    registry.register(
        command::GET,
        REQUEST_VERSION,
        flags,
        get_factory(Arc::clone(&storage)),
    );
    registry.register(
        command::GET_ALL,
        REQUEST_VERSION,
        flags,
        get_all_factory(Arc::clone(&storage)),
    );
    // DoublePut and RoundRobinPut differ only on the client side; the node
    // just stores.
    registry.register(
        command::DOUBLE_PUT,
        REQUEST_VERSION,
        flags,
        put_factory(Arc::clone(&storage)),
    );
    registry.register(
        command::ROUND_ROBIN_PUT,
        REQUEST_VERSION,
        flags,
        put_factory(storage),
    );
    registry
}

fn put_factory(storage: Arc<dyn Storage>) -> ServerHandlerFactory {
    Arc::new(move |req: ServerRequest| {
        let storage = Arc::clone(&storage);
        Box::pin(async move {
            let mut reader = PayloadReader::new(req.args);
            let key = reader.take_u64()?;
            let value = reader.take_array()?;
            reader.expect_end()?;
            storage.put(key, value);
            req.dispatcher.send(|w| w.put_u8(put_reply::OK)).await?;
            Ok(())
        })
    })
}

fn get_factory(storage: Arc<dyn Storage>) -> ServerHandlerFactory {
    Arc::new(move |req: ServerRequest| {
        let storage = Arc::clone(&storage);
        Box::pin(async move {
            let mut reader = PayloadReader::new(req.args);
            let key = reader.take_u64()?;
            reader.expect_end()?;
            match storage.get(key) {
                Some(value) => {
                    req.dispatcher
                        .send(|w| {
                            w.put_u8(get_reply::VALUE);
                            w.put_array(&value);
                        })
                        .await?
                }
                None => req.dispatcher.send(|w| w.put_u8(get_reply::NOTHING)).await?,
            }
            Ok(())
        })
    })
}

fn get_all_factory(storage: Arc<dyn Storage>) -> ServerHandlerFactory {
    Arc::new(move |req: ServerRequest| {
        let storage = Arc::clone(&storage);
        Box::pin(async move {
            let reader = PayloadReader::new(req.args);
            reader.expect_end()?;

            let records = storage.snapshot();
            let acquire = req.dispatcher.buffer_acquire();
            let events = EventDispatcher::new(req.dispatcher, acquire);

            let state = SuspendState::new();
            let control_state = Arc::clone(&state);
            let control = events.spawn_fiber("control", move |ctx| async move {
                controller::run_control_fiber(&ctx, GET_ALL_CONTROL, control_state).await
            });

            let producer_state = Arc::clone(&state);
            let producer = events.spawn_fiber("producer", move |ctx| async move {
                for (key, value) in records {
                    if producer_state.checkpoint().await == Flow::Stop {
                        debug!("record stream stopped by peer");
                        break;
                    }
                    ctx.send(|w| {
                        w.put_u8(stream_msg::RECORD);
                        w.put_u64(key);
                        w.put_array(&value);
                    })
                    .await?;
                }
                Ok(())
            });

            let produced = events.join_fiber(producer).await;
            events.abort_fiber(control);
            produced?;

            // End of stream; whatever control message races in after this
            // is ignored until the peer's final Ack.
            events.send(|w| w.put_u8(stream_msg::END)).await?;
            let finisher = events.spawn_fiber("finisher", |ctx| async move {
                controller::await_final_ack(&ctx, GET_ALL_CONTROL).await
            });
            events.join_fiber(finisher).await
        })
    })
}
