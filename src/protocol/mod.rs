//! Wire protocol module.
//!
//! Defines message types and delimiter framing for socket communication.
//!
//! ## Wire Format
//!
//! Messages are delimiter-terminated JSON (newline by default):
//! ```text
//! {"method": "add", "params": [2, 3], "id": 1}\n
//! {"id": 1, "result": 5}\n
//! ```

mod message;
mod wire;

pub use message::{Message, Request, Response};
pub use wire::{frame, read_frame, write_frame, write_frame_with_timeout};
