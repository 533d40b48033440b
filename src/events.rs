//! Event fan-out for transports and the connection manager
//!
//! An [`EventHub`] delivers every emitted event to two kinds of consumers:
//!
//! - listeners, closures invoked synchronously on the emitting task
//! - subscribers, crossbeam receivers drained by whoever holds them
//!
//! Listeners are how the connection manager reacts to transport state
//! changes; subscribers are how a UI or the CLI observes progress without
//! holding a reference to the emitter.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle returned by [`EventHub::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct HubInner<T> {
    listeners: Mutex<Vec<(ListenerId, Listener<T>)>>,
    subscribers: Mutex<Vec<Sender<T>>>,
    next_id: AtomicU64,
}

/// Cloneable broadcaster; clones share the same listener set
pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventHub<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                listeners: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a closure called for every event
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    /// Remove a listener; unknown ids are ignored
    pub fn remove_listener(&self, id: ListenerId) {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.retain(|(listener_id, _)| *listener_id != id);
        }
    }

    /// Open a new subscription channel
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver an event to every listener and live subscriber
    pub fn emit(&self, event: T) {
        // Snapshot so listeners may add or remove listeners while running.
        let listeners: Vec<Listener<T>> = match self.inner.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(&event);
        }

        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Drop every listener and subscriber
    pub fn clear(&self) {
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.clear();
        }
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.clear();
        }
    }
}
