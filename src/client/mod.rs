//! Asynchronous client for the Avahi daemon.
//!
//! [`Client`] watches the daemon's bus name, tracks the global server state
//! and creates proxies for daemon-side objects. Every operation takes a
//! completion that runs exactly once, on a spawned task, with the decoded
//! result or the error.
//!
//! # Usage
//!
//! ```ignore
//! let client = Client::system(&config.bus);
//! client.on_connected().connect(|_| info!("Avahi is up"));
//! client.connect();
//!
//! client.create_service_browser(IF_UNSPEC, Protocol::Unspec, "_http._tcp", "",
//!     LookupFlags::empty(), |result| {
//!         if let Ok(browser) = result {
//!             browser.on_item_new().connect(|item| println!("{}", item.name));
//!         }
//!     });
//! ```
//!
//! Handlers connected inside a factory completion see every signal the daemon
//! sent for the new object, even those that arrived before the completion
//! ran.

mod call;
mod entry_group;
pub mod error;
pub mod event;
mod record_browser;
mod remote;
mod service_browser;
mod service_resolver;

pub use entry_group::EntryGroup;
pub use error::{DecodeError, DecodeOrigin, Error, Result};
pub use event::{Event, HandlerId, Milestone};
pub use record_browser::RecordBrowser;
pub use service_browser::ServiceBrowser;
pub use service_resolver::ServiceResolver;

use crate::bus::{
    interface, Bus, BusConnection, BusError, Payload, SubscriptionHandle, SystemBus, WatchHandle,
    SERVER_PATH,
};
use crate::config::BusConfig;
use crate::types::{
    Interface, LookupFlags, Protocol, RecordClass, RecordData, RecordType, ServerState,
    ServerStateChange, IF_UNSPEC,
};
use call::PendingCall;
use remote::RemoteProxy;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;

const CONTEXT: &str = "Client";

/// State shared between the client, its bus callbacks and its proxies.
pub(crate) struct ClientShared {
    connection: RwLock<Option<Arc<dyn BusConnection>>>,
    state_subscription: Mutex<Option<SubscriptionHandle>>,
    on_connected: Event<()>,
    on_disconnected: Event<()>,
    on_server_state_changed: Event<ServerStateChange>,
}

impl ClientShared {
    fn new() -> Self {
        Self {
            connection: RwLock::new(None),
            state_subscription: Mutex::new(None),
            on_connected: Event::new(),
            on_disconnected: Event::new(),
            on_server_state_changed: Event::new(),
        }
    }

    pub(crate) fn current_connection(&self) -> Option<Arc<dyn BusConnection>> {
        self.connection
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn name_appeared(self: &Arc<Self>, connection: Arc<dyn BusConnection>) {
        let weak = Arc::downgrade(self);
        let handle = connection.subscribe_signal(
            interface::SERVER,
            "StateChanged",
            SERVER_PATH,
            Arc::new(move |payload: Payload| {
                if let Some(shared) = weak.upgrade() {
                    shared.server_state_changed(payload);
                }
            }),
        );

        let previous = self
            .state_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        let stale = self
            .connection
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(connection);
        if let (Some(previous), Some(stale)) = (previous, stale) {
            debug!("Replacing a connection that never vanished");
            stale.unsubscribe(previous);
        }

        self.on_connected.emit(&());
    }

    fn name_vanished(&self, connection: Arc<dyn BusConnection>) {
        self.on_disconnected.emit(&());

        let handle = self
            .state_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            connection.unsubscribe(handle);
        }
        *self.connection.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn server_state_changed(&self, payload: Payload) {
        let decoded = payload
            .decode::<(i32, String)>()
            .and_then(|(state, error)| {
                Ok(ServerStateChange {
                    state: ServerState::try_from(state)?,
                    error,
                })
            });

        let change = match decoded {
            Ok(change) => {
                debug!("Server state changed to {}", change.state);
                change
            }
            Err(detail) => {
                let error = DecodeError::signal(CONTEXT, "StateChanged", detail);
                warn!("{} ({})", error, error.detail);
                ServerStateChange {
                    state: ServerState::Failure,
                    error: error.to_string(),
                }
            }
        };

        self.on_server_state_changed.emit(&change);
    }
}

/// Connection to the Avahi daemon.
///
/// Dropping the client stops watching the daemon. Proxies created by it stay
/// usable until then; afterwards their calls fail with
/// [`BusError::Disconnected`].
pub struct Client {
    bus: Arc<dyn Bus>,
    service_name: String,
    shared: Arc<ClientShared>,
    watch: Mutex<Option<WatchHandle>>,
}

impl Client {
    /// Create a client on top of an arbitrary bus binding.
    pub fn new(bus: Arc<dyn Bus>, config: &BusConfig) -> Self {
        Self {
            bus,
            service_name: config.service_name.clone(),
            shared: Arc::new(ClientShared::new()),
            watch: Mutex::new(None),
        }
    }

    /// Create a client using `zbus` on the configured bus.
    pub fn system(config: &BusConfig) -> Self {
        let bus = SystemBus::new(config.kind, config.call_timeout());
        Self::new(Arc::new(bus), config)
    }

    /// Start watching the daemon. Availability is reported through
    /// [`Client::on_connected`] and [`Client::on_disconnected`].
    pub fn connect(&self) {
        let mut watch = self.watch.lock().unwrap_or_else(|e| e.into_inner());
        if watch.is_some() {
            warn!("Already watching {}", self.service_name);
            return;
        }

        info!("Watching {}", self.service_name);
        let appeared = Arc::downgrade(&self.shared);
        let vanished = Arc::downgrade(&self.shared);
        *watch = Some(self.bus.watch_name(
            &self.service_name,
            Box::new(move |connection| {
                if let Some(shared) = appeared.upgrade() {
                    shared.name_appeared(connection);
                }
            }),
            Box::new(move |connection| {
                if let Some(shared) = vanished.upgrade() {
                    shared.name_vanished(connection);
                }
            }),
        ));
    }

    pub fn is_connected(&self) -> bool {
        self.shared.current_connection().is_some()
    }

    pub fn current_connection(&self) -> Option<Arc<dyn BusConnection>> {
        self.shared.current_connection()
    }

    /// Raised when the daemon appears on the bus.
    pub fn on_connected(&self) -> &Event<()> {
        &self.shared.on_connected
    }

    /// Raised when the daemon leaves the bus, before the connection is
    /// cleared.
    pub fn on_disconnected(&self) -> &Event<()> {
        &self.shared.on_disconnected
    }

    pub fn on_server_state_changed(&self) -> &Event<ServerStateChange> {
        &self.shared.on_server_state_changed
    }

    fn call_server(&self, interface: &str, method: &'static str, args: Payload) -> PendingCall {
        PendingCall::issue(
            self.shared.current_connection().as_ref(),
            CONTEXT,
            SERVER_PATH,
            interface,
            method,
            args,
        )
    }

    pub fn get_server_state<F>(&self, complete: F)
    where
        F: FnOnce(Result<ServerState>) + Send + 'static,
    {
        let call = self.call_server(interface::SERVER, "GetState", Payload::empty());
        tokio::spawn(async move {
            complete(
                call.finish_map(|(state,): (i32,)| ServerState::try_from(state))
                    .await,
            )
        });
    }

    pub fn get_host_name<F>(&self, complete: F)
    where
        F: FnOnce(Result<String>) + Send + 'static,
    {
        let call = self.call_server(interface::SERVER, "GetHostName", Payload::empty());
        tokio::spawn(async move { complete(call.finish::<(String,)>().await.map(|(name,)| name)) });
    }

    /// Ask the daemon to change the host name. The new state is reported
    /// through [`Client::on_server_state_changed`] once it takes effect.
    pub fn set_host_name<F>(&self, name: &str, complete: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.call_server(
            interface::SERVER,
            "SetHostName",
            Payload::encode((name.to_string(),)),
        )
        .spawn_ack(complete);
    }

    /// Ask the daemon to verify that a cached record is still valid.
    ///
    /// `interface` must name a concrete network interface; [`IF_UNSPEC`] is
    /// rejected with [`Error::InvalidArgument`].
    #[allow(clippy::too_many_arguments)]
    pub fn reconfirm_record<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        name: &str,
        class: RecordClass,
        record_type: RecordType,
        rdata: RecordData,
        complete: F,
    ) where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if interface == IF_UNSPEC {
            tokio::spawn(async move {
                complete(Err(Error::InvalidArgument(
                    "ReconfirmRecord needs an explicit interface".to_string(),
                )))
            });
            return;
        }

        let args = Payload::encode((
            interface,
            protocol.to_raw(),
            name.to_string(),
            class,
            record_type,
            0u32,
            rdata,
        ));
        self.call_server(interface::SERVER, "ReconfirmRecord", args)
            .spawn_ack(complete);
    }

    /// Issue a factory call and attach a proxy to the returned object path.
    fn create<P, F>(&self, interface: &str, method: &'static str, args: Payload, complete: F)
    where
        P: RemoteProxy,
        F: FnOnce(Result<Arc<P>>) + Send + 'static,
    {
        let connection = self.shared.current_connection();
        let call = PendingCall::issue(
            connection.as_ref(),
            CONTEXT,
            SERVER_PATH,
            interface,
            method,
            args,
        );
        let client = Arc::downgrade(&self.shared);

        tokio::spawn(async move {
            let (path, connection) = match (call.finish::<(OwnedObjectPath,)>().await, connection)
            {
                (Ok((path,)), Some(connection)) => (path, connection),
                (Err(e), _) => return complete(Err(e)),
                (Ok(_), None) => return complete(Err(BusError::Disconnected.into())),
            };

            debug!("{} returned {}", method, path.as_str());
            let proxy = Arc::new(P::attach(client, &connection, path.as_str().to_string()));
            complete(Ok(proxy.clone()));
            proxy.release();
        });
    }

    pub fn create_entry_group<F>(&self, complete: F)
    where
        F: FnOnce(Result<Arc<EntryGroup>>) + Send + 'static,
    {
        self.create(
            interface::SERVER,
            "EntryGroupNew",
            Payload::empty(),
            complete,
        );
    }

    /// Browse records of `name` with the given class and type.
    #[allow(clippy::too_many_arguments)]
    pub fn create_record_browser<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        name: &str,
        class: RecordClass,
        record_type: RecordType,
        flags: LookupFlags,
        complete: F,
    ) where
        F: FnOnce(Result<Arc<RecordBrowser>>) + Send + 'static,
    {
        let args = Payload::encode((
            interface,
            protocol.to_raw(),
            name.to_string(),
            class,
            record_type,
            flags.bits(),
        ));
        self.create(interface::SERVER2, "RecordBrowserPrepare", args, complete);
    }

    /// Browse services of `service_type`. An empty `domain` browses the
    /// default domain.
    pub fn create_service_browser<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        service_type: &str,
        domain: &str,
        flags: LookupFlags,
        complete: F,
    ) where
        F: FnOnce(Result<Arc<ServiceBrowser>>) + Send + 'static,
    {
        let args = Payload::encode((
            interface,
            protocol.to_raw(),
            service_type.to_string(),
            domain.to_string(),
            flags.bits(),
        ));
        self.create(interface::SERVER2, "ServiceBrowserPrepare", args, complete);
    }

    /// Resolve a service found by a browser. `aprotocol` selects the address
    /// family of the reported address.
    #[allow(clippy::too_many_arguments)]
    pub fn create_service_resolver<F>(
        &self,
        interface: Interface,
        protocol: Protocol,
        name: &str,
        service_type: &str,
        domain: &str,
        aprotocol: Protocol,
        flags: LookupFlags,
        complete: F,
    ) where
        F: FnOnce(Result<Arc<ServiceResolver>>) + Send + 'static,
    {
        let args = Payload::encode((
            interface,
            protocol.to_raw(),
            name.to_string(),
            service_type.to_string(),
            domain.to_string(),
            aprotocol.to_raw(),
            flags.bits(),
        ));
        self.create(interface::SERVER2, "ServiceResolverPrepare", args, complete);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let watch = self
            .watch
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(watch) = watch {
            self.bus.unwatch_name(watch);
        }

        let handle = self
            .shared
            .state_subscription
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let (Some(handle), Some(connection)) = (handle, self.shared.current_connection()) {
            connection.unsubscribe(handle);
        }
        *self
            .shared
            .connection
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}
