//! RPC servers: the acceptor, the dispatcher and the peers they track.

mod registry;

pub use registry::Hook;
pub(crate) use registry::Registry;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::codec::{Codec, Payload};
use crate::config::{Settings, TransportConfig};
use crate::dispatch::{Dispatcher, Handler, Methods};
use crate::error::RpcResult;
use crate::socket::{self, Connection, ServerMetrics};

use registry::RegistryParts;

/// Configures and starts a [`Server`].
pub struct ServerBuilder {
    listen: Option<String>,
    transport: TransportConfig,
    max_connections: Option<usize>,
    codec: Codec,
    on_connect: Option<Hook>,
    on_disconnect: Option<Hook>,
}

impl ServerBuilder {
    /// Listen on `address` (`host:port`; port 0 picks a free port).
    pub fn listen(mut self, address: impl Into<String>) -> Self {
        self.listen = Some(address.into());
        self
    }

    /// Run without an acceptor. Such a server only serves outbound clients
    /// bound to it with [`ClientOptions::server`](crate::socket::ClientOptions::server).
    pub fn no_listen(mut self) -> Self {
        self.listen = None;
        self
    }

    pub fn max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    /// Types this server can receive and send as tagged values.
    pub fn codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    /// Bind, build the handler and spawn the acceptor and dispatch tasks.
    ///
    /// Fails with a config error before binding when the transport settings
    /// cannot frame messages.
    ///
    /// `factory` runs once; the handler's `initialize` runs before any
    /// connection is accepted.
    pub async fn start<H, F>(self, factory: F) -> RpcResult<Server>
    where
        H: Handler,
        F: FnOnce() -> H,
    {
        self.transport.validate()?;

        let listener = match &self.listen {
            Some(address) => Some(socket::bind(address).await?),
            None => None,
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(Registry::new(RegistryParts {
            inbound: inbound_tx,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            codec: Arc::new(self.codec),
            transport: self.transport,
            max_connections: self.max_connections,
        }));
        let handle = ServerHandle {
            registry: Arc::clone(&registry),
        };

        let mut handler = factory();
        handler.initialize(&handle);
        let mut methods = Methods::new();
        H::register(&mut methods);
        info!(count = methods.len(), "Handler methods registered");

        registry.set_started(true);

        let mut workers = Vec::with_capacity(2);

        let dispatcher = Dispatcher::new(handler, methods, handle.clone(), inbound_rx);
        let shutdown = Arc::new(Notify::new());
        workers.push(Worker {
            name: "dispatcher",
            task: tokio::spawn(dispatcher.run(Arc::clone(&shutdown))),
            shutdown,
        });

        if let Some(listener) = listener {
            let shutdown = Arc::new(Notify::new());
            workers.push(Worker {
                name: "acceptor",
                task: tokio::spawn(socket::accept_loop(
                    listener,
                    Arc::clone(&registry),
                    Arc::clone(&shutdown),
                )),
                shutdown,
            });
        }

        match local_addr {
            Some(addr) => info!(address = %addr, "Server started"),
            None => info!("Server started without listener"),
        }

        Ok(Server {
            registry,
            local_addr,
            workers,
        })
    }
}

struct Worker {
    name: &'static str,
    task: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// A running server.
///
/// Many servers can coexist in one process. Dropping a server stops its
/// tasks and closes its connections; [`stop`](Self::stop) does the same
/// gracefully.
#[derive(Debug)]
pub struct Server {
    registry: Arc<Registry>,
    local_addr: Option<SocketAddr>,
    workers: Vec<Worker>,
}

impl Server {
    /// Start configuring a server from loaded settings.
    pub fn builder(settings: &Settings) -> ServerBuilder {
        ServerBuilder {
            listen: settings.server.listen.resolve(),
            transport: settings.transport.clone(),
            max_connections: settings.server.max_connections,
            codec: Codec::new(),
            on_connect: None,
            on_disconnect: None,
        }
    }

    /// Bound address, or `None` when the acceptor is disabled.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// A cloneable handle for handlers, hooks and bound clients.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn is_started(&self) -> bool {
        self.registry.is_started()
    }

    /// Tracked connections, in accept order.
    pub fn connections(&self) -> Vec<Connection> {
        self.registry.snapshot()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        self.registry.metrics()
    }

    /// Notify every tracked connection.
    pub async fn broadcast(&self, method: &str, params: Vec<Payload>) -> RpcResult<usize> {
        self.registry.broadcast(method, &params).await
    }

    /// Stop accepting, stop dispatching and close every tracked connection.
    ///
    /// Requests still queued are dropped. Calling `stop` again does nothing.
    pub async fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.registry.set_started(false);

        for worker in self.workers.drain(..) {
            worker.shutdown.notify_one();
            if let Err(e) = worker.task.await {
                warn!(worker = worker.name, error = %e, "Server task ended abnormally");
            }
            debug!(worker = worker.name, "Server task stopped");
        }

        for conn in self.registry.snapshot() {
            conn.close().await;
        }
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.registry.set_started(false);
        for worker in self.workers.drain(..) {
            worker.task.abort();
        }
        for conn in self.registry.snapshot() {
            conn.close_now();
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("name", &self.name).finish()
    }
}

/// Cloneable reference to a running server.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    registry: Arc<Registry>,
}

impl ServerHandle {
    pub fn codec(&self) -> &Arc<Codec> {
        self.registry.codec()
    }

    pub fn is_started(&self) -> bool {
        self.registry.is_started()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.registry.snapshot()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    pub fn metrics(&self) -> &ServerMetrics {
        self.registry.metrics()
    }

    /// Notify every tracked connection.
    pub async fn broadcast(&self, method: &str, params: Vec<Payload>) -> RpcResult<usize> {
        self.registry.broadcast(method, &params).await
    }

    pub(crate) fn downgrade(&self) -> Weak<Registry> {
        Arc::downgrade(&self.registry)
    }
}
