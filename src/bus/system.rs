//! `zbus` implementation of the bus traits.
//!
//! All signals sent by the watched daemon are received through a single
//! message stream and routed to subscribers from one task, so signals of one
//! object are always delivered in the order the daemon emitted them.

use super::{
    Bus, BusConnection, BusError, CallFuture, NameHandler, Payload, SignalHandler, SignalKey,
    SubscriptionHandle, WatchHandle,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use zbus::names::BusName;
use zbus::message::{Flags, Type as MessageType};
use zbus::zvariant::Structure;
use zbus::{Connection, MatchRule, Message, MessageStream};

/// Which message bus to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// The system bus, where the Avahi daemon lives
    #[default]
    System,
    /// The session bus (useful for test daemons)
    Session,
}

impl BusKind {
    async fn connect(self) -> zbus::Result<Connection> {
        match self {
            BusKind::System => Connection::system().await,
            BusKind::Session => Connection::session().await,
        }
    }
}

impl fmt::Display for BusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusKind::System => write!(f, "system"),
            BusKind::Session => write!(f, "session"),
        }
    }
}

/// [`Bus`] backed by a `zbus` connection to the system or session bus.
pub struct SystemBus {
    kind: BusKind,
    call_timeout: Option<Duration>,
    watches: Mutex<HashMap<u64, AbortHandle>>,
    next_watch: AtomicU64,
}

impl SystemBus {
    /// Create a bus binding. `call_timeout` of `None` waits for replies
    /// indefinitely.
    pub fn new(kind: BusKind, call_timeout: Option<Duration>) -> Self {
        Self {
            kind,
            call_timeout,
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
        }
    }
}

impl Bus for SystemBus {
    /// Must be called from within a Tokio runtime.
    fn watch_name(
        &self,
        name: &str,
        on_appeared: NameHandler,
        on_vanished: NameHandler,
    ) -> WatchHandle {
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(watch(
            self.kind,
            self.call_timeout,
            name.to_string(),
            on_appeared,
            on_vanished,
        ));

        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, task.abort_handle());

        WatchHandle::new(id)
    }

    fn unwatch_name(&self, handle: WatchHandle) {
        let task = self
            .watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id());

        if let Some(task) = task {
            debug!("Stopping name watch {}", handle.id());
            task.abort();
        }
    }
}

impl Drop for SystemBus {
    fn drop(&mut self) {
        let watches = self.watches.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, task) in watches.drain() {
            task.abort();
        }
    }
}

async fn watch(
    kind: BusKind,
    call_timeout: Option<Duration>,
    name: String,
    on_appeared: NameHandler,
    on_vanished: NameHandler,
) {
    let connection = match kind.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            error!("Failed to connect to the {} bus: {}", kind, e);
            return;
        }
    };

    if let Err(e) = watch_on(connection, call_timeout, &name, &on_appeared, &on_vanished).await {
        error!("Watching {} failed: {}", name, e);
    }
}

async fn watch_on(
    connection: Connection,
    call_timeout: Option<Duration>,
    name: &str,
    on_appeared: &NameHandler,
    on_vanished: &NameHandler,
) -> zbus::Result<()> {
    let dbus = zbus::fdo::DBusProxy::new(&connection).await?;

    // Subscribe before asking for the current owner so no change is missed
    let mut owner_changes = dbus
        .receive_name_owner_changed_with_args(&[(0, name)])
        .await?;

    let link: Arc<dyn BusConnection> =
        Arc::new(DbusConnection::open(connection, name, call_timeout).await?);

    let mut present = false;
    if dbus.name_has_owner(BusName::try_from(name)?).await? {
        info!("{} is available", name);
        present = true;
        on_appeared(link.clone());
    }

    while let Some(signal) = owner_changes.next().await {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                warn!("Cannot parse NameOwnerChanged: {}", e);
                continue;
            }
        };

        let has_owner = args.new_owner().is_some();
        if has_owner && !present {
            info!("{} appeared", name);
            present = true;
            on_appeared(link.clone());
        } else if !has_owner && present {
            info!("{} vanished", name);
            present = false;
            on_vanished(link.clone());
        }
    }

    debug!("Name owner stream for {} closed", name);
    Ok(())
}

#[derive(Default)]
struct Routes {
    next_id: u64,
    /// Ordered by subscription time
    entries: BTreeMap<u64, (SignalKey, SignalHandler)>,
}

/// Connection to the bus with the daemon as default destination.
struct DbusConnection {
    connection: Connection,
    service: String,
    call_timeout: Option<Duration>,
    routes: Arc<Mutex<Routes>>,
    router: AbortHandle,
}

impl DbusConnection {
    async fn open(
        connection: Connection,
        service: &str,
        call_timeout: Option<Duration>,
    ) -> zbus::Result<Self> {
        let rule = MatchRule::builder()
            .msg_type(MessageType::Signal)
            .sender(service)?
            .build();
        let stream = MessageStream::for_match_rule(rule, &connection, None).await?;

        let routes = Arc::new(Mutex::new(Routes::default()));
        let router = tokio::spawn(route_signals(stream, routes.clone())).abort_handle();

        Ok(Self {
            connection,
            service: service.to_string(),
            call_timeout,
            routes,
            router,
        })
    }
}

async fn route_signals(mut stream: MessageStream, routes: Arc<Mutex<Routes>>) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("Failed to receive signal: {}", e);
                continue;
            }
        };

        let header = message.header();
        let (Some(path), Some(interface), Some(member)) =
            (header.path(), header.interface(), header.member())
        else {
            continue;
        };
        let key = SignalKey::new(interface.as_str(), member.as_str(), path.as_str());

        // Handlers run outside the lock, they may subscribe or unsubscribe
        let handlers: Vec<SignalHandler> = routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .values()
            .filter(|(route, _)| *route == key)
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(Payload::from_message(message.clone()));
        }
    }

    debug!("Signal stream closed");
}

/// Build a method call to the daemon.
///
/// Calls never auto-start the daemon: a daemon that is not running is
/// reported as an error instead of being activated behind the name watch.
fn method_call(
    service: &str,
    path: &str,
    interface: &str,
    method: &str,
    body: Option<&Structure<'static>>,
) -> zbus::Result<Message> {
    let builder = Message::method_call(path, method)?
        .destination(service)?
        .interface(interface)?
        .with_flags(Flags::NoAutoStart)?;
    match body {
        Some(body) => builder.build(body),
        None => builder.build(&()),
    }
}

/// Send a method call and wait for the message answering it.
async fn send_and_wait(connection: &Connection, call: Message) -> zbus::Result<Message> {
    let serial = call.primary_header().serial_num();

    // Listen before sending so the reply cannot slip past
    let mut incoming = MessageStream::from(connection);
    connection.send(&call).await?;

    while let Some(message) = incoming.next().await {
        let message = message?;
        if message.header().reply_serial() != Some(serial) {
            continue;
        }
        return match message.message_type() {
            MessageType::Error => Err(zbus::Error::from(message)),
            _ => Ok(message),
        };
    }

    Err(zbus::Error::Failure(format!(
        "connection closed before the reply to call {}",
        serial
    )))
}

impl BusConnection for DbusConnection {
    fn call(&self, path: &str, interface: &str, method: &str, args: Payload) -> CallFuture {
        let connection = self.connection.clone();
        let service = self.service.clone();
        let path = path.to_string();
        let interface = interface.to_string();
        let method = method.to_string();
        let call_timeout = self.call_timeout;

        Box::pin(async move {
            let fields = args.into_fields().map_err(BusError::Transport)?;
            debug!("D-Bus call {}.{} on {}", interface, method, path);

            let reply = async {
                let call = method_call(&service, &path, &interface, &method, fields.as_ref())?;
                send_and_wait(&connection, call).await
            };

            let reply = match call_timeout {
                Some(limit) => tokio::time::timeout(limit, reply)
                    .await
                    .map_err(|_| BusError::Timeout(limit))?,
                None => reply.await,
            };

            Ok(Payload::from_message(reply?))
        })
    }

    fn subscribe_signal(
        &self,
        interface: &str,
        signal: &str,
        path: &str,
        handler: SignalHandler,
    ) -> SubscriptionHandle {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        routes.next_id += 1;
        let id = routes.next_id;
        routes
            .entries
            .insert(id, (SignalKey::new(interface, signal, path), handler));
        debug!("Subscribed {}.{} on {} ({})", interface, signal, path, id);
        SubscriptionHandle::new(id)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let removed = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .remove(&handle.id());

        if removed.is_none() {
            debug!("Unknown subscription {}", handle.id());
        }
    }
}

impl Drop for DbusConnection {
    fn drop(&mut self) {
        self.router.abort();
    }
}
