//! Message types for the wire protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolErrorKind, RpcError};

/// A request or notification.
///
/// `method` and `params` are kept as raw JSON so the dispatch engine can
/// reject malformed shapes with a reply instead of dropping the frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Value,

    #[serde(default)]
    pub params: Value,

    /// Correlation id; `null` marks a notification.
    #[serde(default)]
    pub id: Value,
}

impl Request {
    /// A request expecting exactly one response.
    pub fn call(method: impl Into<String>, params: Vec<Value>, id: u64) -> Self {
        Self {
            method: Value::String(method.into()),
            params: Value::Array(params),
            id: Value::from(id),
        }
    }

    /// A fire-and-forget notification.
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: Value::String(method.into()),
            params: Value::Array(params),
            id: Value::Null,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_null()
    }

    /// Method name, if it is a string.
    pub fn method_name(&self) -> Option<&str> {
        self.method.as_str()
    }
}

/// A response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure payload; `null` on the wire reads as no error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Response {
    /// A success response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failure response.
    pub fn failure(id: Value, error: impl Into<Value>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Id as a correlation key, if it is a non-negative integer.
    pub fn correlation_id(&self) -> Option<u64> {
        self.id.as_u64()
    }
}

/// One decoded frame: exactly one of request, notification or response.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// Decode a frame payload.
    ///
    /// Any JSON object carrying a `method` key is a request; every other
    /// object is a response.
    pub fn decode(bytes: &[u8]) -> Result<Self, RpcError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| RpcError::Protocol {
            kind: ProtocolErrorKind::InvalidMessageFormat {
                message: format!("Invalid JSON: {}", e),
            },
        })?;

        let is_request = match &value {
            Value::Object(map) => map.contains_key("method"),
            _ => {
                return Err(RpcError::Protocol {
                    kind: ProtocolErrorKind::InvalidMessageFormat {
                        message: "Message must be a JSON object".to_string(),
                    },
                })
            }
        };

        let message = if is_request {
            Message::Request(serde_json::from_value(value)?)
        } else {
            Message::Response(serde_json::from_value(value)?)
        };
        Ok(message)
    }

    /// Encode to JSON bytes, without the delimiter.
    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        Ok(match self {
            Message::Request(request) => serde_json::to_vec(request)?,
            Message::Response(response) => serde_json::to_vec(response)?,
        })
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}
