//! Message bus binding.
//!
//! The proxy layer only talks to the bus through the [`Bus`] and
//! [`BusConnection`] traits. [`SystemBus`] implements them on top of `zbus`;
//! tests use an in-memory fake.
//!
//! ```text
//! ┌──────────────┐  watch_name   ┌──────────────┐
//! │    Client    │──────────────>│     Bus      │
//! └──────┬───────┘               └──────┬───────┘
//!        │ on_appeared(connection)      │
//!        v                              v
//! ┌──────────────┐  call / subscribe_signal / unsubscribe
//! │   proxies    │──────────────────────────────> BusConnection
//! └──────────────┘
//! ```

pub mod payload;
mod system;

#[cfg(test)]
pub(crate) mod fake;

use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use payload::{Payload, WireArgs};
pub use system::{BusKind, SystemBus};

/// Well-known bus name of the Avahi daemon.
pub const AVAHI_BUS_NAME: &str = "org.freedesktop.Avahi";

/// Object path of the Avahi server object.
pub const SERVER_PATH: &str = "/";

/// D-Bus interface names used by the Avahi daemon.
pub mod interface {
    pub const SERVER: &str = "org.freedesktop.Avahi.Server";
    pub const SERVER2: &str = "org.freedesktop.Avahi.Server2";
    pub const ENTRY_GROUP: &str = "org.freedesktop.Avahi.EntryGroup";
    pub const RECORD_BROWSER: &str = "org.freedesktop.Avahi.RecordBrowser";
    pub const SERVICE_BROWSER: &str = "org.freedesktop.Avahi.ServiceBrowser";
    pub const SERVICE_RESOLVER: &str = "org.freedesktop.Avahi.ServiceResolver";
}

/// Failure of a call at the transport level.
///
/// Daemon-side rejections (e.g. committing an empty entry group) also end up
/// here as [`BusError::Remote`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("D-Bus call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Not connected to the Avahi daemon")]
    Disconnected,

    #[error("D-Bus transport error: {0}")]
    Transport(String),
}

impl From<zbus::Error> for BusError {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::MethodError(name, message, _) => BusError::Remote {
                name: name.to_string(),
                message: message.unwrap_or_default(),
            },
            other => BusError::Transport(other.to_string()),
        }
    }
}

/// Identifies a live signal subscription on a [`BusConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Identifies a name watch on a [`Bus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

impl WatchHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Receives the payload of a subscribed signal.
pub type SignalHandler = Arc<dyn Fn(Payload) + Send + Sync>;

/// Invoked with the connection when the watched name appears or vanishes.
pub type NameHandler = Box<dyn Fn(Arc<dyn BusConnection>) + Send + Sync>;

/// Reply future of [`BusConnection::call`].
pub type CallFuture = BoxFuture<'static, Result<Payload, BusError>>;

/// A connection to the bus on which the watched daemon is reachable.
pub trait BusConnection: Send + Sync {
    /// Issue a method call on the daemon. The returned future owns everything
    /// it needs and may outlive the caller.
    fn call(&self, path: &str, interface: &str, method: &str, args: Payload) -> CallFuture;

    /// Register `handler` for `signal` of `interface` emitted at `path`.
    fn subscribe_signal(
        &self,
        interface: &str,
        signal: &str,
        path: &str,
        handler: SignalHandler,
    ) -> SubscriptionHandle;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// The bus itself: watches a well-known name and hands out the connection.
pub trait Bus: Send + Sync {
    fn watch_name(
        &self,
        name: &str,
        on_appeared: NameHandler,
        on_vanished: NameHandler,
    ) -> WatchHandle;

    fn unwatch_name(&self, handle: WatchHandle);
}

/// Key of a signal route: interface, member and object path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SignalKey {
    pub interface: String,
    pub member: String,
    pub path: String,
}

impl SignalKey {
    pub fn new(interface: &str, member: &str, path: &str) -> Self {
        Self {
            interface: interface.to_string(),
            member: member.to_string(),
            path: path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_error_display() {
        let err = BusError::Remote {
            name: "org.freedesktop.Avahi.NotPermittedError".into(),
            message: "Not permitted".into(),
        };
        assert_eq!(
            err.to_string(),
            "org.freedesktop.Avahi.NotPermittedError: Not permitted"
        );
        assert_eq!(
            BusError::Disconnected.to_string(),
            "Not connected to the Avahi daemon"
        );
    }

    #[test]
    fn test_handles() {
        assert_eq!(SubscriptionHandle::new(3).id(), 3);
        assert_ne!(WatchHandle::new(1), WatchHandle::new(2));
    }
}
