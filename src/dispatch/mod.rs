//! Serialized dispatch of inbound requests into a server's handler.
//!
//! Every server runs one dispatch task. Requests from all of its
//! connections are queued in arrival order and executed one at a time
//! against the handler, which the task owns exclusively.

mod engine;
mod methods;
mod traits;
mod types;

pub(crate) use engine::{Dispatcher, Inbound};
pub use methods::Methods;
pub use traits::Handler;
pub use types::{CallContext, Params};
