//! Remote-invocable callbacks and the caller handle passed to them.

use crate::session::Session;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;

/// Handle a callback can use to call back into the peer that invoked it.
///
/// The server builds one per request when the caller advertised an origin
/// session; it lives only for the duration of that request.
#[async_trait::async_trait]
pub trait Caller: Send {
    /// The session the handle is connected back to.
    fn origin(&self) -> Option<&Session>;

    /// Execute `name` on the connected peer(s).
    async fn call(
        &mut self,
        name: &str,
        args: Vec<String>,
        request_reply: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>>;
}

/// A named unit of remote-invocable logic registered on a server.
///
/// Errors are sent back to the caller as `"failure <message>"` replies.
#[async_trait::async_trait]
pub trait RemoteCallback: Send + Sync {
    async fn call(&self, args: Vec<String>, caller: Option<&mut dyn Caller>) -> Result<String>;
}

/// Adapter for plain functions that ignore the caller handle.
pub struct FnCallback<F>(F);

#[async_trait::async_trait]
impl<F> RemoteCallback for FnCallback<F>
where
    F: Fn(Vec<String>) -> Result<String> + Send + Sync + 'static,
{
    async fn call(&self, args: Vec<String>, _caller: Option<&mut dyn Caller>) -> Result<String> {
        (self.0)(args)
    }
}

/// Wrap a synchronous function as a callback.
pub fn callback_fn<F>(f: F) -> Arc<dyn RemoteCallback>
where
    F: Fn(Vec<String>) -> Result<String> + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}
