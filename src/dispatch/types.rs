//! Dispatch types: positional parameters and the per-call context.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::{Payload, WireType};
use crate::error::{DispatchErrorKind, RpcError, RpcResult};
use crate::server::ServerHandle;
use crate::socket::Connection;

/// Positional parameters of one request, already unmarshalled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    inner: Vec<Payload>,
}

impl Params {
    pub fn new(inner: Vec<Payload>) -> Self {
        Self { inner }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn into_inner(self) -> Vec<Payload> {
        self.inner
    }

    /// Fail unless exactly `expected` arguments were given.
    pub fn expect_len(&self, expected: usize) -> RpcResult<()> {
        if self.inner.len() == expected {
            Ok(())
        } else {
            Err(RpcError::Dispatch {
                kind: DispatchErrorKind::WrongArity {
                    given: self.inner.len(),
                    expected,
                },
            })
        }
    }

    /// Get a required argument.
    pub fn payload(&self, index: usize) -> RpcResult<&Payload> {
        self.inner
            .get(index)
            .ok_or_else(|| invalid(index, "missing argument"))
    }

    /// Deserialize a required plain argument into any serde type.
    pub fn get<T: DeserializeOwned>(&self, index: usize) -> RpcResult<T> {
        self.payload(index)?
            .deserialize()
            .map_err(|e| invalid(index, e.to_string()))
    }

    /// Get an optional argument; absent and null both read as `None`.
    pub fn get_optional<T: DeserializeOwned>(&self, index: usize) -> RpcResult<Option<T>> {
        match self.inner.get(index) {
            None | Some(Payload::Null) => Ok(None),
            Some(_) => self.get(index).map(Some),
        }
    }

    /// Get a required string argument.
    pub fn get_string(&self, index: usize) -> RpcResult<String> {
        self.payload(index)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| invalid(index, "expected a string"))
    }

    /// Get a required integer argument.
    pub fn get_i64(&self, index: usize) -> RpcResult<i64> {
        self.payload(index)?
            .as_i64()
            .ok_or_else(|| invalid(index, "expected an integer"))
    }

    /// Get a required numeric argument.
    pub fn get_f64(&self, index: usize) -> RpcResult<f64> {
        self.payload(index)?
            .as_f64()
            .ok_or_else(|| invalid(index, "expected a number"))
    }

    /// Get a required boolean argument.
    pub fn get_bool(&self, index: usize) -> RpcResult<bool> {
        self.payload(index)?
            .as_bool()
            .ok_or_else(|| invalid(index, "expected a boolean"))
    }

    /// Borrow a required tagged argument as its concrete type.
    pub fn tagged<T: WireType>(&self, index: usize) -> RpcResult<&T> {
        self.payload(index)?
            .downcast_ref::<T>()
            .ok_or_else(|| invalid(index, format!("expected a {}", T::TYPE_NAME)))
    }
}

impl From<Vec<Payload>> for Params {
    fn from(inner: Vec<Payload>) -> Self {
        Self::new(inner)
    }
}

fn invalid(index: usize, message: impl Into<String>) -> RpcError {
    RpcError::Dispatch {
        kind: DispatchErrorKind::InvalidArgument {
            index,
            message: message.into(),
        },
    }
}

/// Notifications a handler queued during an invocation.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Notify {
        target: Connection,
        method: String,
        params: Vec<Payload>,
    },
    Broadcast {
        method: String,
        params: Vec<Payload>,
    },
}

/// Context handed to every handler invocation.
///
/// Identifies the connection that sent the request (the current caller)
/// and lets the handler address peers. Messages queued here are sent after
/// the handler returns and before its reply.
#[derive(Debug)]
pub struct CallContext {
    caller: Connection,
    server: ServerHandle,
    method: String,
    request_id: Value,
    outbox: Vec<Outgoing>,
}

impl CallContext {
    pub(crate) fn new(
        caller: Connection,
        server: ServerHandle,
        method: String,
        request_id: Value,
    ) -> Self {
        Self {
            caller,
            server,
            method,
            request_id,
            outbox: Vec::new(),
        }
    }

    /// The connection that sent the request.
    pub fn caller(&self) -> &Connection {
        &self.caller
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn request_id(&self) -> &Value {
        &self.request_id
    }

    /// Whether the caller expects no reply.
    pub fn is_notification(&self) -> bool {
        self.request_id.is_null()
    }

    /// Queue a notification back to the caller.
    pub fn notify_caller(&mut self, method: impl Into<String>, params: Vec<Payload>) {
        let target = self.caller.clone();
        self.notify(&target, method, params);
    }

    /// Queue a notification to any connection.
    pub fn notify(&mut self, target: &Connection, method: impl Into<String>, params: Vec<Payload>) {
        self.outbox.push(Outgoing::Notify {
            target: target.clone(),
            method: method.into(),
            params,
        });
    }

    /// Queue a notification to every connection tracked by the server.
    pub fn broadcast(&mut self, method: impl Into<String>, params: Vec<Payload>) {
        self.outbox.push(Outgoing::Broadcast {
            method: method.into(),
            params,
        });
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Tag(u8);

    impl WireType for Tag {
        const TYPE_NAME: &'static str = "Tag";
    }

    fn params() -> Params {
        Params::new(vec![
            Payload::from("alice"),
            Payload::from(42),
            Payload::from(2.5),
            Payload::from(true),
            Payload::Null,
            Payload::tagged(Tag(7)),
        ])
    }

    #[test]
    fn test_typed_getters() {
        let p = params();
        assert_eq!(p.get_string(0).unwrap(), "alice");
        assert_eq!(p.get_i64(1).unwrap(), 42);
        assert_eq!(p.get_f64(2).unwrap(), 2.5);
        assert!(p.get_bool(3).unwrap());
        assert_eq!(p.tagged::<Tag>(5).unwrap(), &Tag(7));
        assert_eq!(p.get::<u32>(1).unwrap(), 42);
    }

    #[test]
    fn test_optional_reads_null_and_missing_as_none() {
        let p = params();
        assert_eq!(p.get_optional::<String>(4).unwrap(), None);
        assert_eq!(p.get_optional::<String>(99).unwrap(), None);
        assert_eq!(p.get_optional::<String>(0).unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn test_wrong_type_names_the_argument() {
        let err = params().get_i64(0).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Dispatch {
                kind: DispatchErrorKind::InvalidArgument { index: 0, .. }
            }
        ));
    }

    #[test]
    fn test_missing_argument() {
        let err = Params::default().get_string(0).unwrap_err();
        assert!(err.to_string().contains("missing argument"));
    }

    #[test]
    fn test_expect_len() {
        let p = Params::new(vec![1.into()]);
        assert!(p.expect_len(1).is_ok());
        let err = p.expect_len(2).unwrap_err();
        assert!(err.to_string().contains("given 1, expected 2"));
    }
}
