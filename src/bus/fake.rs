//! In-memory bus for unit tests.
//!
//! [`FakeConnection`] records every call, subscription and unsubscription,
//! answers calls from per-method responders and lets tests emit signals,
//! including synchronously from inside `subscribe_signal`.

use super::{
    Bus, BusConnection, BusError, CallFuture, NameHandler, Payload, SignalHandler, SignalKey,
    SubscriptionHandle, WatchHandle,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use zbus::zvariant::Structure;

/// A call issued on the fake connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CallRecord {
    pub path: String,
    pub interface: String,
    pub method: String,
}

type Responder = Box<dyn FnMut(&CallRecord, Payload) -> Result<Payload, BusError> + Send>;
type SubscribeHook = Arc<dyn Fn(&FakeConnection, &SignalKey) + Send + Sync>;

#[derive(Default)]
struct State {
    calls: Vec<CallRecord>,
    responders: HashMap<String, Responder>,
    routes: BTreeMap<u64, (SignalKey, SignalHandler)>,
    subscribed: Vec<SignalKey>,
    unsubscribed: Vec<SignalKey>,
    next_id: u64,
    on_subscribe: Option<SubscribeHook>,
}

#[derive(Default)]
pub(crate) struct FakeConnection {
    state: Mutex<State>,
}

impl FakeConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every call of `method` with `responder`.
    pub fn respond<F>(&self, method: &str, responder: F)
    where
        F: FnMut(&CallRecord, Payload) -> Result<Payload, BusError> + Send + 'static,
    {
        self.state()
            .responders
            .insert(method.to_string(), Box::new(responder));
    }

    /// Answer every call of `method` with the given reply arguments.
    pub fn reply<T>(&self, method: &str, args: T)
    where
        T: Clone + Send + 'static,
        Structure<'static>: From<T>,
    {
        self.respond(method, move |_, _| Ok(Payload::encode(args.clone())));
    }

    /// Reject every call of `method` with `error`.
    pub fn fail(&self, method: &str, error: BusError) {
        self.respond(method, move |_, _| Err(error.clone()));
    }

    /// Run `hook` after each subscription is registered, outside the lock.
    pub fn on_subscribe<F>(&self, hook: F)
    where
        F: Fn(&FakeConnection, &SignalKey) + Send + Sync + 'static,
    {
        self.state().on_subscribe = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .count()
    }

    pub fn subscribed(&self) -> Vec<SignalKey> {
        self.state().subscribed.clone()
    }

    pub fn unsubscribed(&self) -> Vec<SignalKey> {
        self.state().unsubscribed.clone()
    }

    /// Number of live subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.state().routes.len()
    }

    /// Deliver a signal to every matching subscriber. `payload` is invoked
    /// once per subscriber.
    pub fn emit<F>(&self, interface: &str, signal: &str, path: &str, payload: F)
    where
        F: Fn() -> Payload,
    {
        let key = SignalKey::new(interface, signal, path);
        let handlers: Vec<SignalHandler> = self
            .state()
            .routes
            .values()
            .filter(|(route, _)| *route == key)
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(payload());
        }
    }

    /// Deliver a signal carrying `args`.
    pub fn emit_args<T>(&self, interface: &str, signal: &str, path: &str, args: T)
    where
        T: Clone,
        Structure<'static>: From<T>,
    {
        self.emit(interface, signal, path, || Payload::encode(args.clone()));
    }
}

impl BusConnection for FakeConnection {
    fn call(&self, path: &str, interface: &str, method: &str, args: Payload) -> CallFuture {
        let record = CallRecord {
            path: path.to_string(),
            interface: interface.to_string(),
            method: method.to_string(),
        };

        let responder = {
            let mut state = self.state();
            state.calls.push(record.clone());
            state.responders.remove(method)
        };

        // Responders run unlocked so they can inspect the connection
        let result = match responder {
            Some(mut responder) => {
                let result = responder(&record, args);
                self.state()
                    .responders
                    .entry(method.to_string())
                    .or_insert(responder);
                result
            }
            None => Ok(Payload::empty()),
        };

        // Replies never resolve within the issuing call
        Box::pin(async move {
            tokio::task::yield_now().await;
            result
        })
    }

    fn subscribe_signal(
        &self,
        interface: &str,
        signal: &str,
        path: &str,
        handler: SignalHandler,
    ) -> SubscriptionHandle {
        let key = SignalKey::new(interface, signal, path);
        let (id, hook) = {
            let mut state = self.state();
            state.next_id += 1;
            let id = state.next_id;
            state.routes.insert(id, (key.clone(), handler));
            state.subscribed.push(key.clone());
            (id, state.on_subscribe.clone())
        };

        if let Some(hook) = hook {
            hook(self, &key);
        }

        SubscriptionHandle::new(id)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut state = self.state();
        if let Some((key, _)) = state.routes.remove(&handle.id()) {
            state.unsubscribed.push(key);
        }
    }
}

struct Watch {
    name: String,
    on_appeared: NameHandler,
    on_vanished: NameHandler,
}

/// Bus whose watched name is made to appear and vanish by the test.
#[derive(Default)]
pub(crate) struct FakeBus {
    watches: Mutex<BTreeMap<u64, Arc<Watch>>>,
    next_id: Mutex<u64>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn matching(&self, name: &str) -> Vec<Arc<Watch>> {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|watch| watch.name == name)
            .cloned()
            .collect()
    }

    pub fn appear(&self, name: &str, connection: &Arc<FakeConnection>) {
        for watch in self.matching(name) {
            (watch.on_appeared)(connection.clone());
        }
    }

    pub fn vanish(&self, name: &str, connection: &Arc<FakeConnection>) {
        for watch in self.matching(name) {
            (watch.on_vanished)(connection.clone());
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Bus for FakeBus {
    fn watch_name(
        &self,
        name: &str,
        on_appeared: NameHandler,
        on_vanished: NameHandler,
    ) -> WatchHandle {
        let id = {
            let mut next_id = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            *next_id += 1;
            *next_id
        };
        self.watches.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Arc::new(Watch {
                name: name.to_string(),
                on_appeared,
                on_vanished,
            }),
        );
        WatchHandle::new(id)
    }

    fn unwatch_name(&self, handle: WatchHandle) {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id());
    }
}
