//! Browsing services of one type.

use super::event::{Event, Milestone};
use super::remote::{
    decode_as, decode_text, decode_unit, ProxyCore, ProxyState, RemoteObject, RemoteProxy,
};
use super::ClientShared;
use crate::bus::{interface, BusConnection};
use crate::types::{ServiceItem, ServiceItemArgs};
use std::sync::{Arc, Weak};
use tracing::debug;

const KIND: &str = "ServiceBrowser";

struct Shared {
    core: ProxyCore,
    on_item_new: Event<ServiceItem>,
    on_item_remove: Event<ServiceItem>,
    on_failure: Event<String>,
    on_all_for_now: Milestone,
    on_cache_exhausted: Milestone,
}

impl ProxyState for Shared {
    fn core(&self) -> &ProxyCore {
        &self.core
    }
}

/// Proxy for an `org.freedesktop.Avahi.ServiceBrowser` object.
pub struct ServiceBrowser {
    remote: RemoteObject,
    shared: Arc<Shared>,
}

impl RemoteProxy for ServiceBrowser {
    fn attach(
        client: Weak<ClientShared>,
        connection: &Arc<dyn BusConnection>,
        path: String,
    ) -> Self {
        let shared = Arc::new(Shared {
            core: ProxyCore::new(KIND),
            on_item_new: Event::new(),
            on_item_remove: Event::new(),
            on_failure: Event::new(),
            on_all_for_now: Milestone::new(),
            on_cache_exhausted: Milestone::new(),
        });
        let mut remote =
            RemoteObject::new(KIND, interface::SERVICE_BROWSER, path, client, connection);

        remote.subscribe(
            connection,
            &shared,
            "ItemNew",
            decode_as::<ServiceItemArgs, ServiceItem>,
            |shared: &Shared, item: ServiceItem| shared.on_item_new.emit(&item),
        );
        remote.subscribe(
            connection,
            &shared,
            "ItemRemove",
            decode_as::<ServiceItemArgs, ServiceItem>,
            |shared: &Shared, item: ServiceItem| shared.on_item_remove.emit(&item),
        );
        remote.subscribe(
            connection,
            &shared,
            "Failure",
            decode_text,
            |shared: &Shared, error: String| shared.on_failure.emit(&error),
        );
        remote.subscribe(
            connection,
            &shared,
            "AllForNow",
            decode_unit,
            |shared: &Shared, ()| {
                if !shared.on_all_for_now.fire() {
                    debug!("{}: ignoring repeated AllForNow", KIND);
                }
            },
        );
        remote.subscribe(
            connection,
            &shared,
            "CacheExhausted",
            decode_unit,
            |shared: &Shared, ()| {
                if !shared.on_cache_exhausted.fire() {
                    debug!("{}: ignoring repeated CacheExhausted", KIND);
                }
            },
        );

        remote.start(connection, &shared);
        Self { remote, shared }
    }

    fn release(&self) {
        self.shared.core.release();
    }
}

impl ServiceBrowser {
    pub fn path(&self) -> &str {
        self.remote.path()
    }

    /// A service appeared.
    pub fn on_item_new(&self) -> &Event<ServiceItem> {
        &self.shared.on_item_new
    }

    /// A service disappeared.
    pub fn on_item_remove(&self) -> &Event<ServiceItem> {
        &self.shared.on_item_remove
    }

    /// The daemon gave up browsing, with its error text.
    pub fn on_failure(&self) -> &Event<String> {
        &self.shared.on_failure
    }

    /// No more items are expected in the near future.
    pub fn on_all_for_now(&self) -> &Milestone {
        &self.shared.on_all_for_now
    }

    /// All cached items have been reported.
    pub fn on_cache_exhausted(&self) -> &Milestone {
        &self.shared.on_cache_exhausted
    }

    pub fn on_error_log(&self) -> &Event<String> {
        self.shared.core.on_error_log()
    }
}
