//! Shared state of a running server.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

use crate::codec::{Codec, Payload};
use crate::config::TransportConfig;
use crate::dispatch::Inbound;
use crate::error::RpcResult;
use crate::protocol::{Message, Request};
use crate::socket::{Connection, ServerMetrics};

/// Connect or disconnect callback.
pub type Hook = Arc<dyn Fn(&Connection) + Send + Sync>;

/// Tracked connections, the inbound queue and the lifecycle hooks.
///
/// Connections hold a weak reference to it so a dropped server does not
/// outlive its peers' receive loops.
pub(crate) struct Registry {
    connections: Mutex<Vec<Connection>>,
    inbound: UnboundedSender<Inbound>,
    started: AtomicBool,
    on_connect: Option<Hook>,
    on_disconnect: Option<Hook>,
    metrics: ServerMetrics,
    codec: Arc<Codec>,
    transport: TransportConfig,
    max_connections: Option<usize>,
}

pub(crate) struct RegistryParts {
    pub(crate) inbound: UnboundedSender<Inbound>,
    pub(crate) on_connect: Option<Hook>,
    pub(crate) on_disconnect: Option<Hook>,
    pub(crate) codec: Arc<Codec>,
    pub(crate) transport: TransportConfig,
    pub(crate) max_connections: Option<usize>,
}

impl Registry {
    pub(crate) fn new(parts: RegistryParts) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            inbound: parts.inbound,
            started: AtomicBool::new(false),
            on_connect: parts.on_connect,
            on_disconnect: parts.on_disconnect,
            metrics: ServerMetrics::new(),
            codec: parts.codec,
            transport: parts.transport,
            max_connections: parts.max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Connection>> {
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub(crate) fn transport(&self) -> &TransportConfig {
        &self.transport
    }

    pub(crate) fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub(crate) fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn set_started(&self, started: bool) {
        self.started.store(started, Ordering::SeqCst);
    }

    /// Queue a request for the dispatcher. Hands the request back when the
    /// server is not running.
    pub(crate) fn enqueue(&self, request: Request, origin: Connection) -> Result<(), Request> {
        if !self.is_started() {
            return Err(request);
        }
        self.inbound
            .send(Inbound { request, origin })
            .map_err(|e| e.0.request)
    }

    pub(crate) fn has_capacity(&self) -> bool {
        match self.max_connections {
            Some(max) => self.lock().len() < max,
            None => true,
        }
    }

    /// Track a freshly accepted connection and run the connect hook.
    pub(crate) fn connected(&self, conn: &Connection) {
        self.lock().push(conn.clone());
        self.metrics
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);
        self.metrics
            .active_connections
            .fetch_add(1, Ordering::Relaxed);

        if let Some(hook) = &self.on_connect {
            hook(conn);
        }
    }

    /// Stop tracking a closed connection.
    ///
    /// The disconnect hook runs only if the connection was still tracked, so
    /// it fires once however many times the connection is closed.
    pub(crate) fn release(&self, conn: &Connection) {
        let removed = {
            let mut connections = self.lock();
            let before = connections.len();
            connections.retain(|c| c != conn);
            connections.len() < before
        };

        if !removed {
            return;
        }

        self.metrics
            .active_connections
            .fetch_sub(1, Ordering::Relaxed);
        debug!(conn_id = %conn.id(), active = self.metrics.active(), "Connection released");

        if let Some(hook) = &self.on_disconnect {
            hook(conn);
        }
    }

    /// Tracked connections, in accept order.
    pub(crate) fn snapshot(&self) -> Vec<Connection> {
        self.lock().clone()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Send a notification to every open tracked connection.
    ///
    /// Returns how many connections it was delivered to; closed or failing
    /// connections are skipped.
    pub(crate) async fn broadcast(&self, method: &str, params: &[Payload]) -> RpcResult<usize> {
        let message = Message::from(Request::notification(method, self.codec.marshal_all(params)?));

        let mut delivered = 0;
        for conn in self.snapshot() {
            if !conn.is_open() {
                continue;
            }
            match conn.send(&message).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(conn_id = %conn.id(), error = %e, "Broadcast skipped connection"),
            }
        }

        info!(method, delivered, "Broadcast sent");
        Ok(delivered)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.connection_count())
            .field("started", &self.is_started())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
