//! Method table mapping exposed names to handler functions.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::codec::Payload;
use crate::error::{DispatchErrorKind, RpcError, RpcResult};

use super::types::{CallContext, Params};

type MethodFn<H> = Box<dyn Fn(&mut H, &mut CallContext, Params) -> RpcResult<Payload> + Send + Sync>;

/// Methods a handler exposes to peers.
pub struct Methods<H> {
    table: HashMap<String, MethodFn<H>>,
}

impl<H> Methods<H> {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Expose `f` under `name`. Registering a name twice replaces it.
    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut H, &mut CallContext, Params) -> RpcResult<Payload> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(method = %name, "Registering method");
        self.table.insert(name, Box::new(f));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.contains_key(name)
    }

    /// Exposed names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Run the method registered under `name`.
    pub fn invoke(
        &self,
        handler: &mut H,
        ctx: &mut CallContext,
        name: &str,
        params: Params,
    ) -> RpcResult<Payload> {
        let method = self.table.get(name).ok_or_else(|| RpcError::Dispatch {
            kind: DispatchErrorKind::UnknownMethod {
                method: name.to_string(),
            },
        })?;
        method(handler, ctx, params)
    }
}

impl<H> Default for Methods<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> fmt::Debug for Methods<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Methods")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    #[test]
    fn test_register_and_list() {
        let mut methods = Methods::<Counter>::new();
        methods
            .register("b", |_, _, _| Ok(Payload::Null))
            .register("a", |_, _, _| Ok(Payload::Null));

        assert_eq!(methods.len(), 2);
        assert!(methods.contains("a"));
        assert!(!methods.contains("c"));
        assert_eq!(methods.names(), vec!["a", "b"]);
    }
}
