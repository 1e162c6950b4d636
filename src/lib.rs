//! Stride RPC Library
//!
//! A bidirectional JSON-RPC transport over delimiter-framed TCP. Either end
//! of a connection can call the other; servers dispatch inbound requests
//! one at a time into a single handler object, and registered application
//! types cross the wire as tagged records.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod server;
pub mod socket;

pub use codec::{Codec, Dumped, Payload, TaggedValue, WireType};
pub use config::Settings;
pub use dispatch::{CallContext, Handler, Methods, Params};
pub use error::{RpcError, RpcResult};
pub use server::{Server, ServerBuilder, ServerHandle};
pub use socket::{AsyncReply, Client, ClientOptions, Connection, PeerRole, ServerMetrics};
