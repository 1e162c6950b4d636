//! Configuration module for stride.
//!
//! Handles loading and validating configuration from TOML files.

mod settings;

pub use settings::*;
