//! Event fan-out for engine push notifications.
//!
//! Subscribers register per `EventKind` and are invoked synchronously, in
//! registration order, on the thread that delivers the notification. Events
//! dispatched while nobody is subscribed are dropped; there is no buffering.

use crate::composition::InputStatus;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::error;

/// Deploy lifecycle reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeployStatus {
    Start,
    Success,
    Failure,
}

impl DeployStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Names subscribers register under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeployStatusChanged,
    InputStatusChanged,
    OptionChanged,
}

/// A notification pushed from the engine side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DeployStatusChanged(DeployStatus),
    InputStatusChanged(InputStatus),
    OptionChanged { name: String, enabled: bool },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DeployStatusChanged(_) => EventKind::DeployStatusChanged,
            Event::InputStatusChanged(_) => EventKind::InputStatusChanged,
            Event::OptionChanged { .. } => EventKind::OptionChanged,
        }
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Callback)>>,
}

fn lock(inner: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscriber registry. Cheap to clone; clones share the same registry.
#[derive(Clone, Default)]
pub struct EventHub {
    inner: Arc<Mutex<Listeners>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = lock(&self.inner);
        let counts: HashMap<EventKind, usize> = listeners
            .by_kind
            .iter()
            .map(|(k, v)| (*k, v.len()))
            .collect();
        f.debug_struct("EventHub").field("listeners", &counts).finish()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `kind`. The returned handle removes it again.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            hub: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Deliver `event` to every subscriber of its kind and return how many ran.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe. A panicking callback is logged and does not stop delivery
    /// to the ones registered after it.
    pub fn dispatch(&self, event: &Event) -> usize {
        let kind = event.kind();
        let callbacks: Vec<Callback> = match lock(&self.inner).by_kind.get(&kind) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return 0,
        };
        for callback in &callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(?kind, "event subscriber panicked");
            }
        }
        callbacks.len()
    }

    /// Number of callbacks registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.inner).by_kind.get(&kind).map_or(0, Vec::len)
    }

    /// Whether any bookkeeping exists for `kind`.
    pub fn has_entry(&self, kind: EventKind) -> bool {
        lock(&self.inner).by_kind.contains_key(&kind)
    }

    fn remove(inner: &Mutex<Listeners>, kind: EventKind, id: u64) -> bool {
        let mut listeners = lock(inner);
        let Some(list) = listeners.by_kind.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(cb_id, _)| *cb_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.by_kind.remove(&kind);
        }
        removed
    }
}

/// Handle returned by `EventHub::subscribe`.
///
/// Dropping the handle keeps the callback registered; call `unsubscribe` to
/// remove it.
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    hub: Weak<Mutex<Listeners>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the callback. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.hub.upgrade() {
            Some(inner) => EventHub::remove(&inner, self.kind, self.id),
            None => false,
        }
    }
}
