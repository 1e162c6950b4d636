//! One framed, bidirectional peer connection.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::codec::{Codec, Payload};
use crate::config::TransportConfig;
use crate::error::{DispatchErrorKind, ProtocolErrorKind, RpcError, RpcResult};
use crate::protocol::{frame, read_frame, write_frame_with_timeout, Message, Request, Response};
use crate::server::Registry;

use super::pending::{resolve_response, AsyncReply, PendingTable};

/// Which side created the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Opened with [`Client::connect`](super::Client::connect).
    Client,
    /// Accepted by a server and tracked in its registry.
    Accepted,
}

struct ConnectionInner {
    id: Uuid,
    role: PeerRole,
    peer_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    open: AtomicBool,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    shutdown: Notify,
    pending: PendingTable,
    next_id: AtomicU64,
    codec: Arc<Codec>,
    transport: TransportConfig,
    registry: Option<Weak<Registry>>,
    meta: Mutex<HashMap<String, Value>>,
    unsolicited: Mutex<Vec<RpcError>>,
}

/// Handle to a live (or closed) connection.
///
/// Cheap to clone; every clone refers to the same socket. Both ends can
/// issue calls: requests arriving from the peer go to the server bound to
/// this connection, responses resolve this side's outstanding calls.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Connection {
    /// Wrap a connected stream. The receive loop is not started yet.
    pub(crate) fn from_stream(
        stream: TcpStream,
        role: PeerRole,
        codec: Arc<Codec>,
        transport: TransportConfig,
        registry: Option<Weak<Registry>>,
    ) -> RpcResult<(Connection, OwnedReadHalf)> {
        let peer_addr = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();

        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                id: Uuid::new_v4(),
                role,
                peer_addr,
                connected_at: Utc::now(),
                open: AtomicBool::new(true),
                writer: tokio::sync::Mutex::new(Some(write_half)),
                shutdown: Notify::new(),
                pending: PendingTable::new(),
                next_id: AtomicU64::new(1),
                codec,
                transport,
                registry,
                meta: Mutex::new(HashMap::new()),
                unsolicited: Mutex::new(Vec::new()),
            }),
        };
        Ok((conn, read_half))
    }

    /// Spawn the receive loop, the only reader of the socket.
    pub(crate) fn start_receiving(&self, read_half: OwnedReadHalf) -> JoinHandle<()> {
        tokio::spawn(receive_loop(self.clone(), read_half))
    }

    /// Unique identifier of this connection (for logs).
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> PeerRole {
        self.inner.role
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Codec used for this connection's payloads.
    pub fn codec(&self) -> &Arc<Codec> {
        &self.inner.codec
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Store an application value on this connection.
    pub fn set_meta(&self, key: impl Into<String>, value: impl Into<Value>) {
        lock(&self.inner.meta).insert(key.into(), value.into());
    }

    /// Read an application value stored on this connection.
    pub fn meta(&self, key: &str) -> Option<Value> {
        lock(&self.inner.meta).get(key).cloned()
    }

    /// Drain errors the peer reported without a request id.
    pub fn take_unsolicited_errors(&self) -> Vec<RpcError> {
        std::mem::take(&mut *lock(&self.inner.unsolicited))
    }

    /// Call a remote method and wait for its result.
    ///
    /// Suspends the calling task until the response with this call's id
    /// arrives, or fails with a connection error if the connection closes
    /// first.
    pub async fn call(&self, method: &str, params: Vec<Payload>) -> RpcResult<Payload> {
        let (id, waiter) = self.start_call(method, &params).await?;
        debug!(conn_id = %self.id(), id, method, "Waiting for response");

        match waiter.await {
            Ok(response) => resolve_response(&self.inner.codec, response),
            Err(_) => Err(RpcError::closed()),
        }
    }

    /// Call a remote method without waiting.
    ///
    /// `on_reply` runs on a separate task once the response arrives (or the
    /// connection closes). Errors raised while sending are returned directly.
    pub async fn call_async<F>(
        &self,
        method: &str,
        params: Vec<Payload>,
        on_reply: F,
    ) -> RpcResult<JoinHandle<()>>
    where
        F: FnOnce(AsyncReply) + Send + 'static,
    {
        let (id, waiter) = self.start_call(method, &params).await?;
        let codec = Arc::clone(&self.inner.codec);

        Ok(tokio::spawn(async move {
            let response = waiter.await.ok();
            on_reply(AsyncReply::new(id, response, codec));
        }))
    }

    /// Send a notification; no id, no response.
    pub async fn notify(&self, method: &str, params: Vec<Payload>) -> RpcResult<()> {
        let params = self.inner.codec.marshal_all(&params)?;
        self.send(&Request::notification(method, params).into()).await
    }

    async fn start_call(
        &self,
        method: &str,
        params: &[Payload],
    ) -> RpcResult<(u64, oneshot::Receiver<Response>)> {
        let params = self.inner.codec.marshal_all(params)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let waiter = self.inner.pending.register(id);

        // Registered before the open check so close() cannot miss this waiter.
        if !self.is_open() {
            self.inner.pending.cancel(id);
            return Err(RpcError::closed());
        }

        if let Err(e) = self.send(&Request::call(method, params, id).into()).await {
            self.inner.pending.cancel(id);
            return Err(e);
        }
        Ok((id, waiter))
    }

    /// Write one message as a single frame.
    ///
    /// Concurrent senders are serialized, so frames never interleave. A
    /// failed write closes the connection.
    pub async fn send(&self, message: &Message) -> RpcResult<()> {
        let payload = message.encode()?;
        let framed = frame(
            &payload,
            self.inner.transport.delimiter_bytes(),
            self.inner.transport.max_frame_size,
        )?;
        let timeout = Duration::from_secs(self.inner.transport.write_timeout_seconds);

        let result = {
            let mut writer = self.inner.writer.lock().await;
            match writer.as_mut() {
                Some(stream) => write_frame_with_timeout(stream, &framed, timeout).await,
                None => Err(RpcError::closed()),
            }
        };

        match result {
            Ok(()) => {
                trace!(
                    conn_id = %self.id(),
                    frame = %String::from_utf8_lossy(&payload),
                    "Frame sent"
                );
                Ok(())
            }
            Err(e) if e.is_connection_closed() => Err(e),
            Err(e) => {
                warn!(conn_id = %self.id(), error = %e, "Write failed, closing connection");
                self.close().await;
                Err(e)
            }
        }
    }

    /// Close the connection.
    ///
    /// Idempotent: only the first call shuts the socket down, releases
    /// pending callers, and (for accepted peers) leaves the registry and
    /// runs the disconnect hook.
    pub async fn close(&self) {
        if !self.begin_close() {
            return;
        }

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(conn_id = %self.id(), error = %e, "Socket shutdown failed");
            }
        }

        self.finish_close();
    }

    /// Synchronous close for drop paths; the write half is dropped instead
    /// of shut down gracefully when a send holds it.
    pub(crate) fn close_now(&self) {
        if !self.begin_close() {
            return;
        }

        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }

        self.finish_close();
    }

    fn begin_close(&self) -> bool {
        if !self.inner.open.swap(false, Ordering::SeqCst) {
            return false;
        }

        let released = self.inner.pending.fail_all();
        self.inner.shutdown.notify_one();
        info!(
            conn_id = %self.id(),
            peer = %self.peer_addr(),
            released_calls = released,
            "Connection closed"
        );
        true
    }

    fn finish_close(&self) {
        if self.inner.role == PeerRole::Accepted {
            if let Some(registry) = self.registry() {
                registry.release(self);
            }
        }
    }

    fn registry(&self) -> Option<Arc<Registry>> {
        self.inner.registry.as_ref().and_then(Weak::upgrade)
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        trace!(
            conn_id = %self.id(),
            frame = %String::from_utf8_lossy(bytes),
            "Frame received"
        );

        match Message::decode(bytes) {
            Ok(Message::Request(request)) => self.route_request(request).await,
            Ok(Message::Response(response)) => self.route_response(response),
            Err(e) => {
                warn!(conn_id = %self.id(), error = %e, "Malformed frame");
                self.reply(Response::failure(Value::Null, e.to_string())).await;
            }
        }
    }

    async fn route_request(&self, request: Request) {
        let request = match self.registry() {
            Some(registry) => match registry.enqueue(request, self.clone()) {
                Ok(()) => return,
                Err(request) => request,
            },
            None => request,
        };

        let err = RpcError::Dispatch {
            kind: DispatchErrorKind::NoHandler,
        };
        if request.is_notification() {
            debug!(conn_id = %self.id(), error = %err, "Dropping notification");
        } else {
            warn!(conn_id = %self.id(), id = %request.id, error = %err, "Rejecting request");
            self.reply(Response::failure(request.id, err.to_string())).await;
        }
    }

    fn route_response(&self, response: Response) {
        if response.id.is_null() {
            match response.error {
                Some(error) => {
                    error!(conn_id = %self.id(), error = %error, "Unsolicited error from peer");
                    lock(&self.inner.unsolicited).push(RpcError::Remote { error });
                }
                None => debug!(conn_id = %self.id(), "Ignoring response without id"),
            }
            return;
        }

        match response.correlation_id() {
            Some(id) => {
                if !self.inner.pending.resolve(id, response) {
                    warn!(conn_id = %self.id(), id, "Response for unknown request id");
                }
            }
            None => {
                warn!(conn_id = %self.id(), id = %response.id, "Response with non-integer id");
            }
        }
    }

    /// Best-effort reply; failures are logged.
    pub(crate) async fn reply(&self, response: Response) {
        if let Err(e) = self.send(&response.into()).await {
            debug!(conn_id = %self.id(), error = %e, "Failed to send reply");
        }
    }
}

async fn receive_loop(conn: Connection, read_half: OwnedReadHalf) {
    let mut reader = BufReader::new(read_half);
    let delimiter = conn.inner.transport.delimiter_bytes().to_vec();
    let max_size = conn.inner.transport.max_frame_size;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, &delimiter, max_size) => frame,
            _ = conn.inner.shutdown.notified() => break,
        };

        match frame {
            Ok(bytes) => conn.handle_frame(&bytes).await,
            Err(e) if e.is_connection_closed() => {
                debug!(conn_id = %conn.id(), "Peer closed the stream");
                break;
            }
            Err(
                e @ RpcError::Protocol {
                    kind: ProtocolErrorKind::FrameTooLarge { .. },
                },
            ) => {
                warn!(conn_id = %conn.id(), error = %e, "Oversized frame, dropping connection");
                conn.reply(Response::failure(Value::Null, e.to_string())).await;
                break;
            }
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "Read failed");
                break;
            }
        }
    }

    conn.close().await;
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("peer_addr", &self.inner.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}
