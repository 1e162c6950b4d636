//! Configuration settings for stride servers and clients.

use serde::Deserialize;
use std::path::Path;

use crate::error::RpcError;

/// Port used when the acceptor is enabled without an explicit address.
pub const DEFAULT_PORT: u16 = 30274;

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listen setting: an address, or a boolean toggle.
///
/// `false` yields a server without an acceptor; `true` listens on the
/// default address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Listen {
    Address(String),
    Toggle(bool),
}

impl Listen {
    /// Listen on the given address.
    pub fn address(addr: impl Into<String>) -> Self {
        Listen::Address(addr.into())
    }

    /// No acceptor.
    pub fn disabled() -> Self {
        Listen::Toggle(false)
    }

    /// The address to bind, or `None` when the acceptor is disabled.
    pub fn resolve(&self) -> Option<String> {
        match self {
            Listen::Address(addr) => Some(addr.clone()),
            Listen::Toggle(true) => Some(default_listen_address()),
            Listen::Toggle(false) => None,
        }
    }
}

impl Default for Listen {
    fn default() -> Self {
        Listen::Address(default_listen_address())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to accept connections on, or `false` to disable the acceptor.
    #[serde(default)]
    pub listen: Listen,
    /// Maximum number of tracked connections. Unlimited when absent.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: Listen::default(),
            max_connections: None,
        }
    }
}

/// Framing and socket I/O configuration, shared by both ends.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Byte sequence terminating each frame.
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    /// Maximum frame size in bytes, delimiter excluded.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Socket write timeout in seconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_seconds: u64,
}

impl TransportConfig {
    /// Delimiter as raw bytes.
    pub fn delimiter_bytes(&self) -> &[u8] {
        self.delimiter.as_bytes()
    }

    /// Check that frames can be cut unambiguously with these settings.
    ///
    /// The delimiter must be non-empty and must not overlap itself: no
    /// proper prefix may equal a suffix (`}}` or `aba` are refused), since
    /// the reader splits at the first complete occurrence.
    pub fn validate(&self) -> Result<(), RpcError> {
        let delimiter = self.delimiter_bytes();
        if delimiter.is_empty() {
            return Err(RpcError::Config {
                message: "Frame delimiter must not be empty".to_string(),
            });
        }

        if (1..delimiter.len()).any(|n| delimiter[..n] == delimiter[delimiter.len() - n..]) {
            return Err(RpcError::Config {
                message: format!(
                    "Frame delimiter {:?} overlaps itself and cannot split frames reliably",
                    self.delimiter
                ),
            });
        }

        if self.max_frame_size == 0 {
            return Err(RpcError::Config {
                message: "max_frame_size must be greater than zero".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            max_frame_size: default_max_frame_size(),
            write_timeout_seconds: default_write_timeout(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Address of the remote peer.
    #[serde(default = "default_client_address")]
    pub address: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: default_client_address(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Whether the binary installs a log subscriber at all.
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format ("pretty" or "json").
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_listen_address() -> String {
    format!("127.0.0.1:{}", DEFAULT_PORT)
}

fn default_client_address() -> String {
    format!("localhost:{}", DEFAULT_PORT)
}

fn default_delimiter() -> String {
    "\n".to_string()
}

fn default_max_frame_size() -> usize {
    1_048_576 // 1MB
}

fn default_write_timeout() -> u64 {
    30
}

fn default_logging_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    /// Load settings from a TOML configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RpcError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| RpcError::Config {
            message: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            RpcError::Config { message } => RpcError::Config {
                message: format!("{} ({})", message, path.display()),
            },
            other => other,
        })
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, RpcError> {
        let settings: Settings = toml::from_str(content).map_err(|e| RpcError::Config {
            message: format!("Failed to parse config: {}", e),
        })?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), RpcError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(RpcError::Config {
                message: format!(
                    "Invalid log level '{}'. Valid levels: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(RpcError::Config {
                message: format!(
                    "Invalid log format '{}'. Valid formats: {:?}",
                    self.logging.format, valid_formats
                ),
            });
        }

        self.transport.validate()?;

        if self.server.max_connections == Some(0) {
            return Err(RpcError::Config {
                message: "max_connections must be greater than zero when set".to_string(),
            });
        }

        if let Listen::Address(addr) = &self.server.listen {
            if addr.trim().is_empty() {
                return Err(RpcError::Config {
                    message: "Listen address must not be empty; use `listen = false` to disable"
                        .to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_delimiter(), "\n");
        assert_eq!(default_log_level(), "info");
        assert_eq!(default_log_format(), "pretty");
        assert_eq!(default_listen_address(), "127.0.0.1:30274");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.transport.delimiter, "\n");
        assert_eq!(settings.transport.max_frame_size, 1_048_576);
        assert_eq!(
            settings.server.listen.resolve().as_deref(),
            Some("127.0.0.1:30274")
        );
        assert!(settings.logging.enabled);
    }

    #[test]
    fn test_listen_false_disables_acceptor() {
        let settings = Settings::from_toml("[server]\nlisten = false\n").unwrap();
        assert_eq!(settings.server.listen, Listen::disabled());
        assert!(settings.server.listen.resolve().is_none());
    }

    #[test]
    fn test_listen_address_and_custom_delimiter() {
        let settings = Settings::from_toml(
            r#"
            [server]
            listen = "0.0.0.0:4000"
            max_connections = 8

            [transport]
            delimiter = "\r\n"
            "#,
        )
        .unwrap();
        assert_eq!(settings.server.listen.resolve().as_deref(), Some("0.0.0.0:4000"));
        assert_eq!(settings.server.max_connections, Some(8));
        assert_eq!(settings.transport.delimiter_bytes(), b"\r\n");
    }

    #[test]
    fn test_rejects_empty_delimiter() {
        let result = Settings::from_toml("[transport]\ndelimiter = \"\"\n");
        assert!(matches!(result, Err(RpcError::Config { .. })));
    }

    #[test]
    fn test_rejects_self_overlapping_delimiter() {
        for delimiter in ["}}", "aba", "\n\n"] {
            let transport = TransportConfig {
                delimiter: delimiter.to_string(),
                ..TransportConfig::default()
            };
            assert!(
                matches!(transport.validate(), Err(RpcError::Config { .. })),
                "{:?} should be refused",
                delimiter
            );
        }

        let result = Settings::from_toml("[transport]\ndelimiter = \"}}\"\n");
        assert!(matches!(result, Err(RpcError::Config { .. })));
    }

    #[test]
    fn test_accepts_non_overlapping_delimiters() {
        for delimiter in ["\n", "\r\n", "\0", "<END>", "ab"] {
            let transport = TransportConfig {
                delimiter: delimiter.to_string(),
                ..TransportConfig::default()
            };
            assert!(transport.validate().is_ok(), "{:?} should be accepted", delimiter);
        }
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let result = Settings::from_toml("[logging]\nlevel = \"loud\"\n");
        assert!(matches!(result, Err(RpcError::Config { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stride.toml");
        std::fs::write(&path, "[logging]\nenabled = false\nformat = \"json\"\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert!(!settings.logging.enabled);
        assert_eq!(settings.logging.format, "json");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Settings::load("/nonexistent/stride.toml");
        assert!(matches!(result, Err(RpcError::Config { .. })));
    }
}
