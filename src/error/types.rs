//! Error types for the stride transport.

use thiserror::Error;

/// Main error type for the transport, codec and dispatch engine.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Configuration-related errors.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Socket setup errors (bind, connect).
    #[error("Socket error: {message}")]
    Socket { message: String },

    /// Malformed frames or messages.
    #[error("Protocol error: {kind}")]
    Protocol { kind: ProtocolErrorKind },

    /// Tagged values that cannot be marshalled or restored.
    #[error("Serialization error: {kind}")]
    Serialization { kind: SerializationErrorKind },

    /// The connection is gone or failed underneath a call.
    #[error("Connection error: {kind}")]
    Connection { kind: ConnectionErrorKind },

    /// A request could not be dispatched to the handler, or the handler failed.
    #[error("Dispatch error: {kind}")]
    Dispatch { kind: DispatchErrorKind },

    /// Failure reported by the remote peer.
    #[error("Remote error: {}", remote_text(.error))]
    Remote { error: serde_json::Value },

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Protocol error kinds.
#[derive(Error, Debug)]
pub enum ProtocolErrorKind {
    #[error("Frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid message format: {message}")]
    InvalidMessageFormat { message: String },

    #[error("Frame delimiter appears inside the encoded message")]
    DelimiterInPayload,
}

/// Serialization error kinds.
#[derive(Error, Debug)]
pub enum SerializationErrorKind {
    #[error("Message contains a {type_name} but that type is not registered locally")]
    UnknownType { type_name: String },

    #[error("Invalid type tag: {message}")]
    InvalidTag { message: String },

    #[error("Cannot encode {type_name}: {message}")]
    Dump { type_name: String, message: String },

    #[error("Cannot restore {type_name}: {message}")]
    Load { type_name: String, message: String },

    #[error("Tagged value cannot be converted to plain JSON")]
    NotPlain,
}

/// Connection error kinds.
#[derive(Error, Debug)]
pub enum ConnectionErrorKind {
    #[error("Connection closed")]
    Closed,

    #[error("Write timed out after {timeout_secs} seconds")]
    WriteTimeout { timeout_secs: u64 },
}

/// Dispatch error kinds.
#[derive(Error, Debug)]
pub enum DispatchErrorKind {
    #[error("Supplied method is not a string")]
    MethodNotString,

    #[error("Supplied params object is not an array")]
    ParamsNotArray,

    #[error("Cannot run '{method}' because it is not exposed by this server")]
    UnknownMethod { method: String },

    #[error("Wrong number of arguments (given {given}, expected {expected})")]
    WrongArity { given: usize, expected: usize },

    #[error("Invalid argument {index}: {message}")]
    InvalidArgument { index: usize, message: String },

    #[error("No handler is bound to this connection")]
    NoHandler,

    #[error("{message}")]
    Failed { message: String },
}

impl RpcError {
    /// Error a handler method returns to report a failure to its caller.
    pub fn failed(message: impl Into<String>) -> Self {
        RpcError::Dispatch {
            kind: DispatchErrorKind::Failed {
                message: message.into(),
            },
        }
    }

    /// Shorthand for a closed connection.
    pub fn closed() -> Self {
        RpcError::Connection {
            kind: ConnectionErrorKind::Closed,
        }
    }

    /// Whether this error means the connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            RpcError::Connection {
                kind: ConnectionErrorKind::Closed
            }
        )
    }
}

fn remote_text(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Result type alias for stride operations.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_string_payload_verbatim() {
        let err = RpcError::Remote {
            error: serde_json::json!("division by zero"),
        };
        assert_eq!(err.to_string(), "Remote error: division by zero");
    }

    #[test]
    fn test_remote_error_displays_structured_payload_as_json() {
        let err = RpcError::Remote {
            error: serde_json::json!({"code": 7}),
        };
        assert_eq!(err.to_string(), r#"Remote error: {"code":7}"#);
    }

    #[test]
    fn test_failed_keeps_handler_text() {
        let err = RpcError::failed("out of cheese");
        assert!(err.to_string().contains("out of cheese"));
    }

    #[test]
    fn test_unknown_type_names_the_type() {
        let err = RpcError::Serialization {
            kind: SerializationErrorKind::UnknownType {
                type_name: "Point".to_string(),
            },
        };
        assert!(err.to_string().contains("Point"));
    }
}
