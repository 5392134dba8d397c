//! Listener types and the event listener table.

use crate::instance::{Instance, PropertyBag};
use crate::keys::EventChannelKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Error a listener may return; it aborts the drain that invoked it.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by listeners.
pub type ListenerResult = Result<(), ListenerError>;

/// Called with `(instance, deleted)` when a record changes.
pub type UpdateListener = Arc<dyn Fn(&Instance, bool) -> ListenerResult + Send + Sync>;

/// Called with each event delivered on a channel.
pub type EventListener = Arc<dyn Fn(&Event) -> ListenerResult + Send + Sync>;

/// Handle returned by a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A delivered event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Channel the event arrived on.
    pub channel: EventChannelKey,
    /// Record or callable that raised it.
    pub source: Instance,
    /// Event payload.
    pub properties: PropertyBag,
}

/// Event listeners per channel, in registration order.
#[derive(Default)]
pub struct EventListeners {
    channels: Mutex<HashMap<EventChannelKey, Vec<(ListenerId, EventListener)>>>,
}

impl EventListeners {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener. Returns its id and whether it is the first on
    /// the channel.
    pub fn add(&self, channel: EventChannelKey, listener: EventListener) -> (ListenerId, bool) {
        let id = ListenerId::next();
        let mut channels = self.channels.lock();
        let list = channels.entry(channel).or_default();
        list.push((id, listener));
        (id, list.len() == 1)
    }

    /// Removes a listener. Returns `Some(true)` if the channel has no
    /// listeners left, `None` if the id was not registered.
    pub fn remove(&self, channel: &EventChannelKey, id: ListenerId) -> Option<bool> {
        let mut channels = self.channels.lock();
        let list = channels.get_mut(channel)?;
        let pos = list.iter().position(|(i, _)| *i == id)?;
        list.remove(pos);
        let empty = list.is_empty();
        if empty {
            channels.remove(channel);
        }
        Some(empty)
    }

    /// Listeners on `channel`, in registration order.
    pub fn listeners(&self, channel: &EventChannelKey) -> Vec<EventListener> {
        self.channels
            .lock()
            .get(channel)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// True if any listener is registered on `channel`.
    pub fn is_subscribed(&self, channel: &EventChannelKey) -> bool {
        self.channels.lock().contains_key(channel)
    }
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListeners")
            .field("channels", &self.channels.lock().len())
            .finish()
    }
}
