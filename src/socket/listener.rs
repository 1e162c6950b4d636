//! TCP acceptor for servers.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{RpcError, RpcResult};
use crate::server::Registry;

use super::connection::{Connection, PeerRole};

/// Server metrics for monitoring.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Total requests dispatched.
    pub requests_total: AtomicU64,
    /// Requests that ended in an error reply (or a logged failure).
    pub requests_failed: AtomicU64,
    /// Connections accepted since start.
    pub connections_accepted: AtomicU64,
    /// Currently tracked connections.
    pub active_connections: AtomicUsize,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one dispatched request.
    pub fn record_request(&self, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn failed_requests(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// Bind the listen address.
pub(crate) async fn bind(address: &str) -> RpcResult<TcpListener> {
    TcpListener::bind(address)
        .await
        .map_err(|e| RpcError::Socket {
            message: format!("Failed to bind to {}: {}", address, e),
        })
}

/// Accept connections until `shutdown` is notified.
///
/// Every accepted socket becomes a [`Connection`] bound to `registry`. It is
/// tracked and announced through the connect hook before its receive loop
/// starts, so no request from it can be dispatched ahead of the hook.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    shutdown: Arc<Notify>,
) {
    info!("Listener running, waiting for connections...");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        if !registry.has_capacity() {
                            warn!(
                                peer = %addr,
                                max = ?registry.max_connections(),
                                "Connection limit reached, rejecting connection"
                            );
                            continue;
                        }

                        let (conn, read_half) = match Connection::from_stream(
                            stream,
                            PeerRole::Accepted,
                            Arc::clone(registry.codec()),
                            registry.transport().clone(),
                            Some(Arc::downgrade(&registry)),
                        ) {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(peer = %addr, error = %e, "Failed to set up connection");
                                continue;
                            }
                        };

                        info!(conn_id = %conn.id(), peer = %addr, "Connection accepted");
                        registry.connected(&conn);
                        conn.start_receiving(read_half);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = shutdown.notified() => {
                debug!("Shutdown signal received, stopping listener");
                break;
            }
        }
    }
}
