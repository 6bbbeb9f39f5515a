//! Lifetime of a daemon-side object owned by one proxy.
//!
//! A proxy subscribes its signals when it is attached and issues `Start`
//! (browsers and resolvers) only after every subscription is in place. On
//! drop it unsubscribes each handle once and, if the client is still
//! connected, frees the daemon-side object.

use super::call::PendingCall;
use super::error::DecodeError;
use super::event::{Dispatcher, Event};
use super::ClientShared;
use crate::bus::{BusConnection, Payload, SignalHandler, SubscriptionHandle, WireArgs};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Signal delivery and error log shared by every proxy kind.
pub(crate) struct ProxyCore {
    kind: &'static str,
    dispatcher: Dispatcher,
    on_error_log: Event<String>,
}

impl ProxyCore {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            dispatcher: Dispatcher::held(),
            on_error_log: Event::new(),
        }
    }

    pub fn on_error_log(&self) -> &Event<String> {
        &self.on_error_log
    }

    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatcher.dispatch(task);
    }

    /// Start delivering signals to observers.
    pub fn release(&self) {
        self.dispatcher.open();
    }

    pub fn error_log(&self, message: String) {
        warn!("{}", message);
        self.on_error_log.emit(&message);
    }

    fn signal_decode_failed(&self, signal: &str, detail: String) {
        let error = DecodeError::signal(self.kind, signal, detail);
        warn!("{} ({})", error, error.detail);
        self.on_error_log.emit(&error.to_string());
    }
}

/// State reachable from signal handlers.
pub(crate) trait ProxyState: Send + Sync + 'static {
    fn core(&self) -> &ProxyCore;
}

/// A proxy that the client factories can construct.
pub(crate) trait RemoteProxy: Send + Sync + Sized + 'static {
    /// Subscribe signals (and start, where applicable) for the object at `path`.
    fn attach(
        client: Weak<ClientShared>,
        connection: &Arc<dyn BusConnection>,
        path: String,
    ) -> Self;

    /// Deliver signals queued while the creating completion ran.
    fn release(&self);
}

/// Decode a signal payload into `U` through its wire tuple `T`.
pub(crate) fn decode_as<T, U>(payload: Payload) -> Result<U, String>
where
    T: WireArgs,
    U: TryFrom<T, Error = String>,
{
    payload.decode::<T>().and_then(U::try_from)
}

/// Decode a payload consisting of a single string, e.g. `Failure`.
pub(crate) fn decode_text(payload: Payload) -> Result<String, String> {
    payload.decode::<(String,)>().map(|(text,)| text)
}

/// Signals without arguments.
pub(crate) fn decode_unit(_payload: Payload) -> Result<(), String> {
    Ok(())
}

pub(crate) struct RemoteObject {
    kind: &'static str,
    interface: &'static str,
    path: String,
    client: Weak<ClientShared>,
    connection: Weak<dyn BusConnection>,
    subscriptions: Vec<SubscriptionHandle>,
}

impl RemoteObject {
    pub fn new(
        kind: &'static str,
        interface: &'static str,
        path: String,
        client: Weak<ClientShared>,
        connection: &Arc<dyn BusConnection>,
    ) -> Self {
        Self {
            kind,
            interface,
            path,
            client,
            connection: Arc::downgrade(connection),
            subscriptions: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Subscribe `signal` on this object. Payloads are decoded on arrival and
    /// handed to `deliver` through the proxy's dispatcher; payloads that fail
    /// to decode go to the error log instead.
    pub fn subscribe<S, U, D, F>(
        &mut self,
        connection: &Arc<dyn BusConnection>,
        shared: &Arc<S>,
        signal: &'static str,
        decode: D,
        deliver: F,
    ) where
        S: ProxyState,
        U: Send + 'static,
        D: Fn(Payload) -> Result<U, String> + Send + Sync + 'static,
        F: Fn(&S, U) + Send + Sync + 'static,
    {
        let shared = shared.clone();
        let deliver = Arc::new(deliver);

        let handler: SignalHandler = Arc::new(move |payload: Payload| {
            let decoded = decode(payload);
            let target = shared.clone();
            let deliver = deliver.clone();
            shared.core().dispatch(move || match decoded {
                Ok(value) => deliver(&target, value),
                Err(detail) => target.core().signal_decode_failed(signal, detail),
            });
        });

        let handle = connection.subscribe_signal(self.interface, signal, &self.path, handler);
        self.subscriptions.push(handle);
    }

    /// Issue `Start`. A failure is reported to the error log.
    pub fn start<S: ProxyState>(&self, connection: &Arc<dyn BusConnection>, shared: &Arc<S>) {
        let kind = self.kind;
        let call = PendingCall::issue(
            Some(connection),
            kind,
            &self.path,
            self.interface,
            "Start",
            Payload::empty(),
        );
        let shared = shared.clone();

        tokio::spawn(async move {
            if let Err(e) = call.finish_empty().await {
                let message = format!("{}: D-Bus call \"Start\" failed: {}", kind, e);
                let target = shared.clone();
                shared.core().dispatch(move || target.core().error_log(message));
            }
        });
    }

    /// Issue a method on this object over the client's current connection.
    pub fn call(&self, method: &'static str, args: Payload) -> PendingCall {
        let connection = self
            .client
            .upgrade()
            .and_then(|client| client.current_connection());
        PendingCall::issue(
            connection.as_ref(),
            self.kind,
            &self.path,
            self.interface,
            method,
            args,
        )
    }
}

impl Drop for RemoteObject {
    fn drop(&mut self) {
        match self.connection.upgrade() {
            Some(connection) => {
                for handle in self.subscriptions.drain(..) {
                    connection.unsubscribe(handle);
                }
            }
            None => debug!("{} {}: connection already closed", self.kind, self.path),
        }

        let current = self
            .client
            .upgrade()
            .and_then(|client| client.current_connection());
        let Some(connection) = current else {
            debug!("{} {}: not connected, skipping Free", self.kind, self.path);
            return;
        };

        if tokio::runtime::Handle::try_current().is_err() {
            debug!("{} {}: no runtime, skipping Free", self.kind, self.path);
            return;
        }

        PendingCall::issue(
            Some(&connection),
            self.kind,
            &self.path,
            self.interface,
            "Free",
            Payload::empty(),
        )
        .detach();
    }
}
