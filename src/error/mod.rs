//! Error types for stride.
//!
//! Provides a unified error handling system using thiserror.

mod types;

pub use types::*;
