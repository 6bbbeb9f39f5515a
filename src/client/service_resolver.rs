//! Resolving a service to host, address, port and TXT data.
//!
//! The daemon keeps the resolver running and raises `Found` again whenever
//! the service data changes.

use super::event::Event;
use super::remote::{decode_as, decode_text, ProxyCore, ProxyState, RemoteObject, RemoteProxy};
use super::ClientShared;
use crate::bus::{interface, BusConnection};
use crate::types::{ResolvedService, ResolvedServiceArgs};
use std::sync::{Arc, Weak};

const KIND: &str = "ServiceResolver";

struct Shared {
    core: ProxyCore,
    on_found: Event<ResolvedService>,
    on_failure: Event<String>,
}

impl ProxyState for Shared {
    fn core(&self) -> &ProxyCore {
        &self.core
    }
}

/// Proxy for an `org.freedesktop.Avahi.ServiceResolver` object.
pub struct ServiceResolver {
    remote: RemoteObject,
    shared: Arc<Shared>,
}

impl RemoteProxy for ServiceResolver {
    fn attach(
        client: Weak<ClientShared>,
        connection: &Arc<dyn BusConnection>,
        path: String,
    ) -> Self {
        let shared = Arc::new(Shared {
            core: ProxyCore::new(KIND),
            on_found: Event::new(),
            on_failure: Event::new(),
        });
        let mut remote =
            RemoteObject::new(KIND, interface::SERVICE_RESOLVER, path, client, connection);

        remote.subscribe(
            connection,
            &shared,
            "Found",
            decode_as::<ResolvedServiceArgs, ResolvedService>,
            |shared: &Shared, service: ResolvedService| shared.on_found.emit(&service),
        );
        remote.subscribe(
            connection,
            &shared,
            "Failure",
            decode_text,
            |shared: &Shared, error: String| shared.on_failure.emit(&error),
        );

        remote.start(connection, &shared);
        Self { remote, shared }
    }

    fn release(&self) {
        self.shared.core.release();
    }
}

impl ServiceResolver {
    pub fn path(&self) -> &str {
        self.remote.path()
    }

    pub fn on_found(&self) -> &Event<ResolvedService> {
        &self.shared.on_found
    }

    pub fn on_failure(&self) -> &Event<String> {
        &self.shared.on_failure
    }

    pub fn on_error_log(&self) -> &Event<String> {
        self.shared.core.on_error_log()
    }
}
