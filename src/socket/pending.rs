//! Correlation table for outstanding calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::codec::{Codec, Payload};
use crate::error::{RpcError, RpcResult};
use crate::protocol::Response;

/// Per-connection map from request id to the waiter for its response.
///
/// Each waiter is a oneshot sender, so a response is consumed exactly once.
/// Dropping the table's senders (on close) wakes every waiter with an error.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    waiters: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a waiter for `id`.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<Response> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Hand a response to its waiter. Returns false if nobody waits on `id`.
    pub(crate) fn resolve(&self, id: u64, response: Response) -> bool {
        match self.lock().remove(&id) {
            // A dropped receiver means the caller gave up; the response is still consumed.
            Some(tx) => {
                let _ = tx.send(response);
                true
            }
            None => false,
        }
    }

    /// Forget a waiter whose request never made it onto the wire.
    pub(crate) fn cancel(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Release every waiter with a closed-connection error.
    pub(crate) fn fail_all(&self) -> usize {
        let mut waiters = self.lock();
        let count = waiters.len();
        waiters.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Turn a correlated response into the call's outcome.
pub(crate) fn resolve_response(codec: &Codec, response: Response) -> RpcResult<Payload> {
    if let Some(error) = response.error {
        return Err(RpcError::Remote { error });
    }
    codec.unmarshal(response.result.unwrap_or(Value::Null))
}

/// Handle passed to the continuation of an asynchronous call.
///
/// [`result`](Self::result) reports a remote error only on its first access;
/// later accesses return the (empty) result instead of raising again.
#[derive(Debug)]
pub struct AsyncReply {
    id: u64,
    response: Option<Response>,
    codec: Arc<Codec>,
    errored: bool,
}

impl AsyncReply {
    pub(crate) fn new(id: u64, response: Option<Response>, codec: Arc<Codec>) -> Self {
        Self {
            id,
            response,
            codec,
            errored: false,
        }
    }

    /// Correlation id of the originating request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The call's result, or the error the peer reported.
    ///
    /// Fails with a connection error if the connection closed before the
    /// response arrived.
    pub fn result(&mut self) -> RpcResult<Payload> {
        let Some(response) = &self.response else {
            return Err(RpcError::closed());
        };

        if let Some(error) = &response.error {
            if !self.errored {
                self.errored = true;
                return Err(RpcError::Remote {
                    error: error.clone(),
                });
            }
        }

        self.codec
            .unmarshal(response.result.clone().unwrap_or(Value::Null))
    }

    /// Alias for [`result`](Self::result).
    pub fn value(&mut self) -> RpcResult<Payload> {
        self.result()
    }
}
