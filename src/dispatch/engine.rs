//! Dispatch engine: the single consumer of a server's inbound queue.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::codec::Payload;
use crate::error::{DispatchErrorKind, RpcError, RpcResult};
use crate::protocol::{Request, Response};
use crate::server::ServerHandle;
use crate::socket::Connection;

use super::methods::Methods;
use super::traits::Handler;
use super::types::{CallContext, Outgoing, Params};

/// A request waiting for dispatch, with the connection it came from.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub(crate) request: Request,
    pub(crate) origin: Connection,
}

/// Owns the handler and runs one request at a time against it.
pub(crate) struct Dispatcher<H: Handler> {
    handler: H,
    methods: Methods<H>,
    server: ServerHandle,
    inbound: UnboundedReceiver<Inbound>,
}

impl<H: Handler> Dispatcher<H> {
    pub(crate) fn new(
        handler: H,
        methods: Methods<H>,
        server: ServerHandle,
        inbound: UnboundedReceiver<Inbound>,
    ) -> Self {
        Self {
            handler,
            methods,
            server,
            inbound,
        }
    }

    /// Consume the queue in arrival order until `shutdown` is notified or
    /// every sender is gone.
    pub(crate) async fn run(mut self, shutdown: Arc<Notify>) {
        info!(methods = ?self.methods.names(), "Dispatcher running");

        loop {
            let next = tokio::select! {
                next = self.inbound.recv() => next,
                _ = shutdown.notified() => break,
            };

            match next {
                Some(inbound) => self.dispatch(inbound).await,
                None => break,
            }
        }

        debug!("Dispatcher stopped");
    }

    async fn dispatch(&mut self, inbound: Inbound) {
        let Inbound { request, origin } = inbound;
        let id = request.id.clone();
        let method = request
            .method_name()
            .map(str::to_string)
            .unwrap_or_default();

        let server = self.server.clone();
        let (outcome, outbox) = self.execute(request, &origin);
        flush(&server, outbox).await;

        let outcome = outcome.and_then(|payload| server.codec().marshal(&payload));
        server.metrics().record_request(outcome.is_ok());

        match outcome {
            Ok(result) => {
                debug!(conn_id = %origin.id(), method = %method, id = %id, "Request handled");
                if !id.is_null() {
                    origin.reply(Response::success(id, result)).await;
                }
            }
            Err(e) => {
                warn!(
                    conn_id = %origin.id(),
                    method = %method,
                    id = %id,
                    error = %e,
                    "Request failed"
                );
                if !id.is_null() {
                    origin.reply(Response::failure(id, e.to_string())).await;
                }
            }
        }
    }

    /// Validate the request and run the handler method.
    fn execute(
        &mut self,
        request: Request,
        origin: &Connection,
    ) -> (RpcResult<Payload>, Vec<Outgoing>) {
        let Request { method, params, id } = request;

        let method = match method {
            Value::String(method) => method,
            _ => return (Err(dispatch_error(DispatchErrorKind::MethodNotString)), Vec::new()),
        };

        let params = match params {
            Value::Array(params) => params,
            _ => return (Err(dispatch_error(DispatchErrorKind::ParamsNotArray)), Vec::new()),
        };

        if !self.methods.contains(&method) {
            return (
                Err(dispatch_error(DispatchErrorKind::UnknownMethod { method })),
                Vec::new(),
            );
        }

        let params = match self.server.codec().unmarshal_all(params) {
            Ok(params) => Params::new(params),
            Err(e) => return (Err(e), Vec::new()),
        };

        let mut ctx = CallContext::new(origin.clone(), self.server.clone(), method, id);
        let Self {
            handler, methods, ..
        } = self;
        let name = ctx.method().to_string();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            methods.invoke(handler, &mut ctx, &name, params)
        }))
        .unwrap_or_else(|panic| Err(RpcError::failed(panic_message(&*panic))));

        (outcome, ctx.take_outbox())
    }
}

/// Send the notifications a handler queued, in order.
async fn flush(server: &ServerHandle, outbox: Vec<Outgoing>) {
    for outgoing in outbox {
        let result = match outgoing {
            Outgoing::Notify {
                target,
                method,
                params,
            } => target.notify(&method, params).await,
            Outgoing::Broadcast { method, params } => {
                server.broadcast(&method, params).await.map(|_| ())
            }
        };

        if let Err(e) = result {
            debug!(error = %e, "Failed to deliver queued notification");
        }
    }
}

fn dispatch_error(kind: DispatchErrorKind) -> RpcError {
    RpcError::Dispatch { kind }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extracts_text() {
        let panic = panic::catch_unwind(|| panic!("bad state")).unwrap_err();
        assert_eq!(panic_message(&*panic), "handler panicked: bad state");

        let panic = panic::catch_unwind(|| panic!("{} items", 3)).unwrap_err();
        assert_eq!(panic_message(&*panic), "handler panicked: 3 items");
    }
}
