//! Outbound connections.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::info;

use crate::codec::Codec;
use crate::config::{Settings, TransportConfig};
use crate::error::{RpcError, RpcResult};
use crate::server::ServerHandle;

use super::connection::{Connection, PeerRole};

/// Options for [`Client::connect`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    transport: TransportConfig,
    codec: Option<Arc<Codec>>,
    server: Option<ServerHandle>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the transport section of loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new().transport(settings.transport.clone())
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn codec(mut self, codec: impl Into<Arc<Codec>>) -> Self {
        self.codec = Some(codec.into());
        self
    }

    /// Route requests the peer sends on this connection to `server`'s
    /// handler, so the remote side can call back.
    pub fn server(mut self, server: ServerHandle) -> Self {
        self.server = Some(server);
        self
    }
}

/// A connection opened to a remote server.
///
/// Derefs to [`Connection`]; the connection is closed when the client is
/// dropped.
#[derive(Debug)]
pub struct Client {
    conn: Connection,
}

impl Client {
    /// Connect to `address` (`host:port`).
    ///
    /// Without an explicit codec the bound server's codec is used, then an
    /// empty one. The transport settings are checked before connecting.
    pub async fn connect(address: &str, options: ClientOptions) -> RpcResult<Client> {
        options.transport.validate()?;

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| RpcError::Socket {
                message: format!("Failed to connect to {}: {}", address, e),
            })?;

        let codec = match (&options.codec, &options.server) {
            (Some(codec), _) => Arc::clone(codec),
            (None, Some(server)) => Arc::clone(server.codec()),
            (None, None) => Arc::new(Codec::new()),
        };
        let registry = options.server.as_ref().map(ServerHandle::downgrade);

        let (conn, read_half) = Connection::from_stream(
            stream,
            PeerRole::Client,
            codec,
            options.transport,
            registry,
        )?;
        info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "Connected");
        conn.start_receiving(read_half);

        Ok(Client { conn })
    }

    /// Connect to the configured default address.
    pub async fn from_settings(settings: &Settings) -> RpcResult<Client> {
        Client::connect(&settings.client.address, ClientOptions::from_settings(settings)).await
    }

    /// Connect, run `f` with the client, then close it whatever `f` returned.
    pub async fn open<F, Fut, T>(address: &str, options: ClientOptions, f: F) -> RpcResult<T>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: Future<Output = RpcResult<T>>,
    {
        let client = Client::connect(address, options).await?;
        let result = f(client.connection().clone()).await;
        client.close().await;
        result
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Close the connection gracefully.
    pub async fn close(self) {
        self.conn.close().await;
    }
}

impl Deref for Client {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.close_now();
    }
}
