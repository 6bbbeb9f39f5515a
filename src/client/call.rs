//! Correlation of one outgoing call with its reply.

use super::error::{DecodeError, Result};
use crate::bus::{BusConnection, BusError, CallFuture, Payload, WireArgs};
use std::sync::Arc;
use tracing::debug;

/// One outstanding method call.
///
/// Consuming the call yields exactly one result: the decoded reply, the
/// transport error untouched, or a [`DecodeError`] naming the method.
pub(crate) struct PendingCall {
    context: &'static str,
    method: &'static str,
    reply: CallFuture,
}

impl PendingCall {
    /// Issue `method` on `connection`. Without a connection the call fails
    /// with [`BusError::Disconnected`] when awaited.
    pub fn issue(
        connection: Option<&Arc<dyn BusConnection>>,
        context: &'static str,
        path: &str,
        interface: &str,
        method: &'static str,
        args: Payload,
    ) -> Self {
        let reply: CallFuture = match connection {
            Some(connection) => connection.call(path, interface, method, args),
            None => Box::pin(async { Err(BusError::Disconnected) }),
        };

        Self {
            context,
            method,
            reply,
        }
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Wait for the reply and decode it as `T`.
    pub async fn finish<T: WireArgs>(self) -> Result<T> {
        self.finish_map(|args: T| Ok(args)).await
    }

    /// Wait for the reply, decode it as `T` and convert it.
    ///
    /// A failing conversion is reported like a decode failure.
    pub async fn finish_map<T, U, F>(self, convert: F) -> Result<U>
    where
        T: WireArgs,
        F: FnOnce(T) -> std::result::Result<U, String>,
    {
        let payload = self.reply.await?;
        payload
            .decode::<T>()
            .and_then(convert)
            .map_err(|detail| DecodeError::reply(self.context, self.method, detail).into())
    }

    /// Wait for the reply, ignoring its body.
    pub async fn finish_empty(self) -> Result<()> {
        self.reply.await?;
        Ok(())
    }

    /// Run `complete` with the acknowledgement on a spawned task.
    pub fn spawn_ack<F>(self, complete: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        tokio::spawn(async move { complete(self.finish_empty().await) });
    }

    /// Fire and forget: the outcome is only logged.
    pub fn detach(self) {
        let context = self.context;
        let method = self.method;
        tokio::spawn(async move {
            match self.finish_empty().await {
                Ok(()) => debug!("{}: \"{}\" succeeded", context, method),
                Err(e) => debug!("{}: \"{}\" failed: {}", context, method, e),
            }
        });
    }
}
