//! Publishing through an Avahi entry group.
//!
//! Entries are added to the group and become visible on the network only
//! after [`EntryGroup::commit`]. The daemon reports progress through
//! `StateChanged`; on [`EntryGroupState::Collision`] the application should
//! reset the group and retry with another name.

use super::error::Result;
use super::event::Event;
use super::remote::{decode_as, ProxyCore, ProxyState, RemoteObject, RemoteProxy};
use super::ClientShared;
use crate::bus::{interface, BusConnection, Payload};
use crate::types::{
    EntryGroupState, EntryGroupStateChange, Interface, Port, Protocol, PublishFlags, Txt,
};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

const KIND: &str = "EntryGroup";

type StateChangedArgs = (i32, String);

impl TryFrom<StateChangedArgs> for EntryGroupStateChange {
    type Error = String;

    fn try_from((state, error): StateChangedArgs) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            state: EntryGroupState::try_from(state)?,
            error,
        })
    }
}

struct Shared {
    core: ProxyCore,
    state: Mutex<EntryGroupState>,
    on_state_changed: Event<EntryGroupStateChange>,
}

impl ProxyState for Shared {
    fn core(&self) -> &ProxyCore {
        &self.core
    }
}

/// Proxy for an `org.freedesktop.Avahi.EntryGroup` object.
pub struct EntryGroup {
    remote: RemoteObject,
    shared: Arc<Shared>,
}

impl RemoteProxy for EntryGroup {
    fn attach(
        client: Weak<ClientShared>,
        connection: &Arc<dyn BusConnection>,
        path: String,
    ) -> Self {
        let shared = Arc::new(Shared {
            core: ProxyCore::new(KIND),
            state: Mutex::new(EntryGroupState::Uncommitted),
            on_state_changed: Event::new(),
        });
        let mut remote = RemoteObject::new(KIND, interface::ENTRY_GROUP, path, client, connection);

        remote.subscribe(
            connection,
            &shared,
            "StateChanged",
            decode_as::<StateChangedArgs, EntryGroupStateChange>,
            |shared: &Shared, change: EntryGroupStateChange| {
                debug!("{}: state changed to {}", KIND, change.state);
                *shared.state.lock().unwrap_or_else(|e| e.into_inner()) = change.state;
                shared.on_state_changed.emit(&change);
            },
        );

        Self { remote, shared }
    }

    fn release(&self) {
        self.shared.core.release();
    }
}

impl EntryGroup {
    /// Object path of the group on the daemon.
    pub fn path(&self) -> &str {
        self.remote.path()
    }

    /// Last state reported by the daemon.
    pub fn state(&self) -> EntryGroupState {
        *self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn on_state_changed(&self) -> &Event<EntryGroupStateChange> {
        &self.shared.on_state_changed
    }

    /// Parse errors and asynchronous failures of this group.
    pub fn on_error_log(&self) -> &Event<String> {
        self.shared.core.on_error_log()
    }

    /// Add a service. `domain` and `host` may be empty for the defaults.
    #[allow(clippy::too_many_arguments)]
    pub fn add_service<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        flags: PublishFlags,
        name: &str,
        service_type: &str,
        domain: &str,
        host: &str,
        port: Port,
        txt: Txt,
        complete: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let args = Payload::encode((
            interface,
            protocol.to_raw(),
            flags.bits(),
            name.to_string(),
            service_type.to_string(),
            domain.to_string(),
            host.to_string(),
            port,
            txt,
        ));
        self.remote.call("AddService", args).spawn_ack(complete);
    }

    /// Register a subtype (e.g. `_printer._sub._http._tcp`) for a service
    /// already added to this group.
    #[allow(clippy::too_many_arguments)]
    pub fn add_service_subtype<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        flags: PublishFlags,
        name: &str,
        service_type: &str,
        domain: &str,
        subtype: &str,
        complete: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let args = Payload::encode((
            interface,
            protocol.to_raw(),
            flags.bits(),
            name.to_string(),
            service_type.to_string(),
            domain.to_string(),
            subtype.to_string(),
        ));
        self.remote.call("AddServiceSubtype", args).spawn_ack(complete);
    }

    /// Replace the TXT data of a published service.
    #[allow(clippy::too_many_arguments)]
    pub fn update_service_txt<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        flags: PublishFlags,
        name: &str,
        service_type: &str,
        domain: &str,
        txt: Txt,
        complete: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let args = Payload::encode((
            interface,
            protocol.to_raw(),
            flags.bits(),
            name.to_string(),
            service_type.to_string(),
            domain.to_string(),
            txt,
        ));
        self.remote.call("UpdateServiceTxt", args).spawn_ack(complete);
    }

    /// Publish the entries added so far. The daemon rejects empty groups.
    pub fn commit<F>(&self, complete: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.remote
            .call("Commit", Payload::empty())
            .spawn_ack(complete);
    }

    /// Remove all entries from the group.
    pub fn reset<F>(&self, complete: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.remote.call("Reset", Payload::empty()).spawn_ack(complete);
    }
}
