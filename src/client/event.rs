//! Local fan-out of daemon signals to application handlers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Identifies a connected handler, for [`Event::disconnect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A typed multicast event.
///
/// Handlers run in connection order, outside any lock, so a handler may
/// connect or disconnect handlers (itself included) or drop the object that
/// owns the event. A handler disconnected during an emission is not called
/// for the rest of it.
pub struct Event<T> {
    handlers: Mutex<Vec<(HandlerId, Handler<T>)>>,
    next_id: AtomicU64,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if the handler was not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn is_connected(&self, id: HandlerId) -> bool {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|(handler_id, _)| *handler_id == id)
    }

    pub(crate) fn emit(&self, value: &T) {
        let snapshot: Vec<(HandlerId, Handler<T>)> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, handler) in snapshot {
            if self.is_connected(id) {
                handler(value);
            }
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An event delivered at most once, such as "all cached items reported".
#[derive(Default)]
pub struct Milestone {
    event: Event<()>,
    reached: AtomicBool,
}

impl Milestone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.event.connect(move |_| handler())
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.event.disconnect(id)
    }

    pub fn handler_count(&self) -> usize {
        self.event.handler_count()
    }

    /// Whether the milestone has already been delivered.
    pub fn is_reached(&self) -> bool {
        self.reached.load(Ordering::SeqCst)
    }

    /// Deliver the milestone. Returns `false` if it was already delivered.
    pub(crate) fn fire(&self) -> bool {
        if self.reached.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.event.emit(&());
        true
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Serializes signal delivery for one proxy.
///
/// Starts held: tasks are queued until [`Dispatcher::open`], which runs them
/// in order. Once open, a task runs on the calling thread unless another
/// thread is already delivering; then it is queued and run by that thread
/// after the current task. Tasks never overlap and never run under the lock.
pub(crate) struct Dispatcher {
    gate: Mutex<Gate>,
}

struct Gate {
    open: bool,
    /// A thread is draining the queue
    running: bool,
    queue: VecDeque<Task>,
}

/// Releases the drain if a task unwinds.
struct Draining<'a> {
    gate: &'a Mutex<Gate>,
    armed: bool,
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.lock().unwrap_or_else(|e| e.into_inner()).running = false;
        }
    }
}

impl Dispatcher {
    pub fn held() -> Self {
        Self {
            gate: Mutex::new(Gate {
                open: false,
                running: false,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            gate.queue.push_back(Box::new(task));
            if !gate.open || gate.running {
                return;
            }
            gate.running = true;
        }
        self.drain();
    }

    /// Flush queued tasks in order and deliver directly from now on.
    pub fn open(&self) {
        {
            let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            gate.open = true;
            if gate.running {
                return;
            }
            gate.running = true;
        }
        self.drain();
    }

    fn drain(&self) {
        let mut draining = Draining {
            gate: &self.gate,
            armed: true,
        };
        loop {
            let task = {
                let mut gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
                match gate.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        gate.running = false;
                        draining.armed = false;
                        return;
                    }
                }
            };
            task();
        }
    }

    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_event_delivers_in_connection_order() {
        let event = Event::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            event.connect(move |value| seen.lock().unwrap().push(format!("{}{}", tag, value)));
        }
        event.emit(&1);
        event.emit(&2);

        assert_eq!(*seen.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_event_disconnect_is_independent() {
        let event = Event::<()>::new();
        let count = Arc::new(AtomicU64::new(0));

        let first = {
            let count = count.clone();
            event.connect(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _second = {
            let count = count.clone();
            event.connect(move |_| {
                count.fetch_add(10, Ordering::SeqCst);
            })
        };

        assert!(event.disconnect(first));
        assert!(!event.disconnect(first));
        event.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(event.handler_count(), 1);

        event.clear();
        assert_eq!(event.handler_count(), 0);
    }

    #[test]
    fn test_handler_can_disconnect_itself() {
        let event = Arc::new(Event::<()>::new());
        let count = Arc::new(AtomicU64::new(0));
        let own_id = Arc::new(Mutex::new(None));

        let id = {
            let weak = Arc::downgrade(&event);
            let count = count.clone();
            let own_id = own_id.clone();
            event.connect(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                if let (Some(event), Some(id)) = (weak.upgrade(), *own_id.lock().unwrap()) {
                    event.disconnect(id);
                }
            })
        };
        *own_id.lock().unwrap() = Some(id);

        event.emit(&());
        event.emit(&());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(event.handler_count(), 0);
    }

    #[test]
    fn test_handler_disconnected_mid_emission_is_skipped() {
        let event = Arc::new(Event::<()>::new());
        let later_calls = Arc::new(AtomicU64::new(0));
        let later_id = Arc::new(Mutex::new(None));

        {
            let weak = Arc::downgrade(&event);
            let later_id = later_id.clone();
            event.connect(move |_| {
                if let (Some(event), Some(id)) = (weak.upgrade(), *later_id.lock().unwrap()) {
                    event.disconnect(id);
                }
            });
        }
        let id = {
            let later_calls = later_calls.clone();
            event.connect(move |_| {
                later_calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        *later_id.lock().unwrap() = Some(id);

        event.emit(&());
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_milestone_fires_once() {
        let milestone = Milestone::new();
        let count = Arc::new(AtomicU64::new(0));
        {
            let count = count.clone();
            milestone.connect(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(!milestone.is_reached());
        assert!(milestone.fire());
        assert!(!milestone.fire());
        assert!(milestone.is_reached());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispatcher_holds_then_flushes_in_order() {
        let dispatcher = Dispatcher::held();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let seen = seen.clone();
            dispatcher.dispatch(move || seen.lock().unwrap().push(n));
        }
        assert_eq!(dispatcher.queued(), 3);
        assert!(seen.lock().unwrap().is_empty());

        dispatcher.open();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

        let direct = seen.clone();
        dispatcher.dispatch(move || direct.lock().unwrap().push(3));
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(dispatcher.queued(), 0);
    }

    #[test]
    fn test_dispatch_during_flush_keeps_order() {
        let dispatcher = Arc::new(Dispatcher::held());
        let seen = Arc::new(Mutex::new(Vec::new()));

        {
            let inner = dispatcher.clone();
            let seen = seen.clone();
            dispatcher.dispatch(move || {
                seen.lock().unwrap().push(1);
                let seen = seen.clone();
                inner.dispatch(move || seen.lock().unwrap().push(3));
            });
        }
        {
            let seen = seen.clone();
            dispatcher.dispatch(move || seen.lock().unwrap().push(2));
        }

        dispatcher.open();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_dispatch_from_two_threads_never_overlaps() {
        let dispatcher = Arc::new(Dispatcher::held());
        dispatcher.open();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let worker = {
            let dispatcher = dispatcher.clone();
            let seen = seen.clone();
            thread::spawn(move || {
                dispatcher.dispatch(move || {
                    seen.lock().unwrap().push("signal start");
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    seen.lock().unwrap().push("signal end");
                });
            })
        };

        started_rx.recv().unwrap();
        {
            let seen = seen.clone();
            dispatcher.dispatch(move || seen.lock().unwrap().push("start failed"));
        }
        // Queued behind the running task, not run on this thread
        assert_eq!(*seen.lock().unwrap(), vec!["signal start"]);
        assert_eq!(dispatcher.queued(), 1);

        release_tx.send(()).unwrap();
        worker.join().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["signal start", "signal end", "start failed"]
        );
        assert_eq!(dispatcher.queued(), 0);
    }

    #[test]
    fn test_dispatcher_recovers_after_panicking_task() {
        let dispatcher = Arc::new(Dispatcher::held());
        dispatcher.open();

        let panicking = dispatcher.clone();
        let result = thread::spawn(move || panicking.dispatch(|| panic!("handler bug")))
            .join();
        assert!(result.is_err());

        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            dispatcher.dispatch(move || ran.store(true, Ordering::SeqCst));
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
