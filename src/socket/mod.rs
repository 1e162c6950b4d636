//! TCP transport: connections, outbound clients and the server acceptor.

mod client;
mod connection;
mod listener;
mod pending;

pub use client::{Client, ClientOptions};
pub use connection::{Connection, PeerRole};
pub use listener::ServerMetrics;
pub use pending::AsyncReply;

pub(crate) use listener::{accept_loop, bind};
