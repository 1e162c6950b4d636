//! Handler trait definition.

use crate::server::ServerHandle;

use super::methods::Methods;

/// Application object whose methods peers can invoke.
///
/// A server owns exactly one handler. Invocations are serialized on the
/// server's dispatch task, so methods take `&mut self` and need no locking.
///
/// # Example
///
/// ```ignore
/// struct Calculator {
///     total: i64,
/// }
///
/// impl Handler for Calculator {
///     fn register(methods: &mut Methods<Self>) {
///         methods.register("add", |calc, _ctx, params| {
///             params.expect_len(2)?;
///             let sum = params.get_i64(0)? + params.get_i64(1)?;
///             calc.total += sum;
///             Ok(sum.into())
///         });
///     }
/// }
/// ```
pub trait Handler: Send + Sized + 'static {
    /// Fill in the table of remotely callable methods.
    ///
    /// Only names registered here can be invoked; anything else is answered
    /// with an unknown-method error without running handler code.
    fn register(methods: &mut Methods<Self>);

    /// Called once after the handler is created, before any request is
    /// dispatched to it.
    fn initialize(&mut self, _server: &ServerHandle) {}
}
