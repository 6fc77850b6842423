//! # Event Bus
//!
//! A small publish/subscribe registry shared by the transport, the protocol
//! client and the session façade. Listeners subscribe to an event *kind* and
//! are invoked in registration order every time an event of that kind is
//! emitted.
//!
//! ## Key Rust Concepts Used:
//! - **Associated types**: `BusEvent::Kind` ties an event enum to its
//!   discriminant type, so one bus implementation serves every event family
//! - **Trait objects**: callbacks are stored as `Arc<dyn Fn(&E) + Send + Sync>`
//! - **Mutex + clone-out**: the listener list is copied out of the lock before
//!   dispatch, so a callback may subscribe or unsubscribe without deadlocking

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// An event that can travel over an [`EventBus`].
pub trait BusEvent {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<E> {
    id: ListenerId,
    callback: Listener<E>,
}

pub struct EventBus<E: BusEvent> {
    listeners: Mutex<HashMap<E::Kind, Vec<Entry<E>>>>,
    next_id: AtomicU64,
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `callback` for events of `kind`.
    pub fn on<F>(&self, kind: E::Kind, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap();
        listeners.entry(kind).or_default().push(Entry {
            id,
            callback: Arc::new(callback),
        });
        id
    }

    /// Remove a listener. Returns false when the id was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        for entries in listeners.values_mut() {
            if let Some(pos) = entries.iter().position(|e| e.id == id) {
                entries.remove(pos);
                return true;
            }
        }
        false
    }

    /// Invoke every listener of the event's kind, in registration order.
    ///
    /// Listeners registered during dispatch are not called for this event.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Listener<E>> = {
            let listeners = self.listeners.lock().unwrap();
            match listeners.get(&event.kind()) {
                Some(entries) => entries.iter().map(|e| e.callback.clone()).collect(),
                None => return,
            }
        };

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(&kind)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap().clear();
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> Debug for EventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock().unwrap();
        let total: usize = listeners.values().map(|v| v.len()).sum();
        f.debug_struct("EventBus").field("listeners", &total).finish()
    }
}
