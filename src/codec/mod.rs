//! Object marshalling.
//!
//! Converts application values ([`Payload`]) to wire-safe JSON and back.
//! JSON primitives pass through unchanged; values of registered
//! [`WireType`]s travel as tagged records:
//!
//! ```text
//! {"__type__": ["Point"], "x": 3, "y": -4}
//! {"__type__": ["Money", 1250, "EUR"]}
//! ```
//!
//! Fields holding another wire type are tagged too when marked with
//! [`nested`].

pub mod nested;
mod payload;
mod registry;

pub use payload::{Payload, TaggedValue, WireObject, WireType};
pub use registry::{Codec, Dumped, TYPE_TAG};
