//! Browsing raw DNS records.

use super::event::{Event, Milestone};
use super::remote::{
    decode_as, decode_text, decode_unit, ProxyCore, ProxyState, RemoteObject, RemoteProxy,
};
use super::ClientShared;
use crate::bus::{interface, BusConnection};
use crate::types::{RecordItem, RecordItemArgs};
use std::sync::{Arc, Weak};
use tracing::debug;

const KIND: &str = "RecordBrowser";

struct Shared {
    core: ProxyCore,
    on_item_new: Event<RecordItem>,
    on_item_remove: Event<RecordItem>,
    on_failure: Event<String>,
    on_all_for_now: Milestone,
    on_cache_exhausted: Milestone,
}

impl ProxyState for Shared {
    fn core(&self) -> &ProxyCore {
        &self.core
    }
}

/// Proxy for an `org.freedesktop.Avahi.RecordBrowser` object.
pub struct RecordBrowser {
    remote: RemoteObject,
    shared: Arc<Shared>,
}

impl RemoteProxy for RecordBrowser {
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
            RemoteObject::new(KIND, interface::RECORD_BROWSER, path, client, connection);

        remote.subscribe(
            connection,
            &shared,
            "ItemNew",
            decode_as::<RecordItemArgs, RecordItem>,
            |shared: &Shared, item: RecordItem| shared.on_item_new.emit(&item),
        );
        remote.subscribe(
            connection,
            &shared,
            "ItemRemove",
            decode_as::<RecordItemArgs, RecordItem>,
            |shared: &Shared, item: RecordItem| shared.on_item_remove.emit(&item),
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

impl RecordBrowser {
    pub fn path(&self) -> &str {
        self.remote.path()
    }

    pub fn on_item_new(&self) -> &Event<RecordItem> {
        &self.shared.on_item_new
    }

    pub fn on_item_remove(&self) -> &Event<RecordItem> {
        &self.shared.on_item_remove
    }

    pub fn on_failure(&self) -> &Event<String> {
        &self.shared.on_failure
    }

    pub fn on_all_for_now(&self) -> &Milestone {
        &self.shared.on_all_for_now
    }

    pub fn on_cache_exhausted(&self) -> &Milestone {
        &self.shared.on_cache_exhausted
    }

    pub fn on_error_log(&self) -> &Event<String> {
        self.shared.core.on_error_log()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::fake::FakeConnection;
    use crate::bus::Payload;
    use crate::client::tests::{connected_client, object_path, wait};
    use crate::client::{Client, Result};
    use crate::types::{dns_class, dns_type, LookupFlags, LookupResultFlags, Protocol, IF_UNSPEC};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const PATH: &str = "/Client1/RecordBrowser1";

    fn browse_ptr<F>(client: &Client, complete: F)
    where
        F: FnOnce(Result<Arc<RecordBrowser>>) + Send + 'static,
    {
        client.create_record_browser(
            IF_UNSPEC,
            Protocol::Unspec,
            "_http._tcp.local",
            dns_class::IN,
            dns_type::PTR,
            LookupFlags::empty(),
            complete,
        );
    }

    fn ptr_record(target: &[u8]) -> (i32, i32, String, u16, u16, Vec<u8>, u32) {
        (
            2,
            0,
            "_http._tcp.local".to_string(),
            dns_class::IN,
            dns_type::PTR,
            target.to_vec(),
            1,
        )
    }

    #[tokio::test]
    async fn test_subscribes_in_order_before_start() {
        let connection = FakeConnection::new();
        connection.reply("RecordBrowserPrepare", (object_path(PATH),));
        let subscriptions_at_start = Arc::new(Mutex::new(None));
        {
            let seen = subscriptions_at_start.clone();
            let watcher = Arc::downgrade(&connection);
            connection.respond("Start", move |_, _| {
                *seen.lock().unwrap() = watcher.upgrade().map(|c| c.subscribed().len());
                Ok(Payload::empty())
            });
        }
        let (client, _bus) = connected_client(&connection);

        let browser = wait(|done| browse_ptr(&client, done)).await.unwrap();
        assert_eq!(browser.path(), PATH);

        let members: Vec<String> = connection
            .subscribed()
            .into_iter()
            .filter(|key| key.path == PATH && key.interface == interface::RECORD_BROWSER)
            .map(|key| key.member)
            .collect();
        assert_eq!(
            members,
            vec!["ItemNew", "ItemRemove", "Failure", "AllForNow", "CacheExhausted"]
        );
        // Server StateChanged plus the five browser signals
        assert_eq!(*subscriptions_at_start.lock().unwrap(), Some(6));

        let start: Vec<_> = connection
            .calls()
            .into_iter()
            .filter(|call| call.method == "Start")
            .collect();
        assert_eq!(start.len(), 1);
        assert_eq!(start[0].path, PATH);
        assert_eq!(start[0].interface, interface::RECORD_BROWSER);
    }

    #[tokio::test]
    async fn test_item_new_and_milestones() {
        let connection = FakeConnection::new();
        connection.reply("RecordBrowserPrepare", (object_path(PATH),));
        let (client, _bus) = connected_client(&connection);
        let browser = wait(|done| browse_ptr(&client, done)).await.unwrap();

        let items = Arc::new(Mutex::new(Vec::new()));
        let all_for_now = Arc::new(AtomicUsize::new(0));
        let cache_exhausted = Arc::new(AtomicUsize::new(0));
        {
            let items = items.clone();
            browser
                .on_item_new()
                .connect(move |item| items.lock().unwrap().push(item.clone()));
            let all_for_now = all_for_now.clone();
            browser.on_all_for_now().connect(move || {
                all_for_now.fetch_add(1, Ordering::SeqCst);
            });
            let cache_exhausted = cache_exhausted.clone();
            browser.on_cache_exhausted().connect(move || {
                cache_exhausted.fetch_add(1, Ordering::SeqCst);
            });
        }

        connection.emit_args(
            interface::RECORD_BROWSER,
            "ItemNew",
            PATH,
            ptr_record(b"\x07printer"),
        );
        for signal in ["CacheExhausted", "AllForNow", "AllForNow", "CacheExhausted"] {
            connection.emit(interface::RECORD_BROWSER, signal, PATH, Payload::empty);
        }

        let items = items.lock().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].interface, 2);
        assert_eq!(items[0].protocol, Protocol::Inet);
        assert_eq!(items[0].rdata, b"\x07printer".to_vec());
        assert!(items[0].flags.contains(LookupResultFlags::CACHED));
        assert_eq!(all_for_now.load(Ordering::SeqCst), 1);
        assert_eq!(cache_exhausted.load(Ordering::SeqCst), 1);
        assert!(browser.on_all_for_now().is_reached());
        assert!(browser.on_cache_exhausted().is_reached());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_and_frees() {
        let connection = FakeConnection::new();
        connection.reply("RecordBrowserPrepare", (object_path(PATH),));
        let (client, _bus) = connected_client(&connection);
        let browser = wait(|done| browse_ptr(&client, done)).await.unwrap();

        let items = Arc::new(AtomicUsize::new(0));
        {
            let items = items.clone();
            browser.on_item_new().connect(move |_| {
                items.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(browser);
        tokio::task::yield_now().await;

        let ours = |keys: Vec<crate::bus::SignalKey>| {
            keys.into_iter().filter(|key| key.path == PATH).count()
        };
        assert_eq!(ours(connection.subscribed()), 5);
        assert_eq!(ours(connection.unsubscribed()), 5);
        assert_eq!(connection.call_count("Free"), 1);

        connection.emit_args(
            interface::RECORD_BROWSER,
            "ItemNew",
            PATH,
            ptr_record(b"\x04late"),
        );
        assert_eq!(items.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_records_and_failure() {
        let connection = FakeConnection::new();
        connection.reply("RecordBrowserPrepare", (object_path(PATH),));
        let (client, _bus) = connected_client(&connection);

        let browser = wait(|done| {
            client.create_record_browser(
                IF_UNSPEC,
                Protocol::Unspec,
                "_http._tcp.local",
                dns_class::IN,
                dns_type::PTR,
                LookupFlags::empty(),
                done,
            )
        })
        .await
        .unwrap();

        let removed = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));
        {
            let removed = removed.clone();
            browser
                .on_item_remove()
                .connect(move |item| removed.lock().unwrap().push(item.clone()));
            let failures = failures.clone();
            browser
                .on_failure()
                .connect(move |error| failures.lock().unwrap().push(error.clone()));
        }

        connection.emit_args(
            interface::RECORD_BROWSER,
            "ItemRemove",
            PATH,
            (
                3i32,
                1i32,
                "_http._tcp.local".to_string(),
                dns_class::IN,
                dns_type::PTR,
                b"\x07printer".to_vec(),
                4u32,
            ),
        );
        connection.emit_args(
            interface::RECORD_BROWSER,
            "Failure",
            PATH,
            ("Timeout reached".to_string(),),
        );

        let removed = removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].protocol, Protocol::Inet6);
        assert_eq!(removed[0].record_type, dns_type::PTR);
        assert_eq!(removed[0].rdata, b"\x07printer".to_vec());
        assert_eq!(*failures.lock().unwrap(), vec!["Timeout reached"]);

        let prepared: Vec<_> = connection
            .calls()
            .into_iter()
            .map(|call| (call.interface, call.method))
            .filter(|(_, method)| method == "RecordBrowserPrepare")
            .collect();
        assert_eq!(
            prepared,
            vec![(
                interface::SERVER2.to_string(),
                "RecordBrowserPrepare".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_failure_with_wrong_payload_is_logged() {
        let connection = FakeConnection::new();
        connection.reply("RecordBrowserPrepare", (object_path(PATH),));
        let (client, _bus) = connected_client(&connection);
        let browser = wait(|done| {
            client.create_record_browser(
                2,
                Protocol::Inet,
                "host.local",
                dns_class::IN,
                dns_type::A,
                LookupFlags::USE_MULTICAST,
                done,
            )
        })
        .await
        .unwrap();

        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = errors.clone();
            browser
                .on_error_log()
                .connect(move |message| errors.lock().unwrap().push(message.clone()));
        }

        connection.emit_args(interface::RECORD_BROWSER, "Failure", PATH, (5i32,));
        assert_eq!(
            *errors.lock().unwrap(),
            vec!["RecordBrowser: Cannot parse \"Failure\" parameters"]
        );
    }
}
