//! Resolution tracker: per-operation deferred work.
//!
//! A tracker collects four FIFO queues while an operation decodes and
//! reconciles its response, then drains them once, in this order:
//!
//! 1. reference resolution (may fetch, and fetching may queue more)
//! 2. event delivery
//! 3. update delivery
//! 4. deletion
//!
//! Listeners therefore only see fully resolved reference graphs, and an
//! update listener told about a deletion can still find the instance in the
//! identity map.

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::Instance;
use crate::keys::InstanceKey;
use crate::listeners::Event;
use crate::state::RuntimeState;
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

/// Runs once every key of a resolution has been looked up; `None` marks a
/// key the server reports as deleted.
pub type ResolutionCallback = Box<dyn FnOnce(Vec<Option<Instance>>) -> RuntimeResult<()> + Send>;

/// Fetches records the identity map cannot supply.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches and reconciles a snapshot of `key`. Work discovered while
    /// reconciling is queued on `tracker`.
    async fn fetch(&self, key: &InstanceKey, tracker: &mut Tracker)
        -> RuntimeResult<Option<Instance>>;
}

struct Resolution {
    keys: Vec<InstanceKey>,
    callback: Option<ResolutionCallback>,
}

/// Deferred work for one top-level operation.
#[derive(Default)]
pub struct Tracker {
    resolutions: VecDeque<Resolution>,
    events: VecDeque<Event>,
    updates: VecDeque<(Instance, bool)>,
    deletions: VecDeque<InstanceKey>,
}

impl Tracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues resolution of one key.
    pub fn resolve(&mut self, key: InstanceKey) {
        self.resolutions.push_back(Resolution {
            keys: vec![key],
            callback: None,
        });
    }

    /// Queues joint resolution of `keys`; `callback` receives the results in
    /// the same order.
    pub fn resolve_then(&mut self, keys: Vec<InstanceKey>, callback: ResolutionCallback) {
        self.resolutions.push_back(Resolution {
            keys,
            callback: Some(callback),
        });
    }

    /// Queues an event for delivery.
    pub fn queue_event(&mut self, event: Event) {
        self.events.push_back(event);
    }

    /// Queues an update notification.
    pub fn queue_update(&mut self, instance: Instance, deleted: bool) {
        self.updates.push_back((instance, deleted));
    }

    /// Queues removal of `key` from the identity map.
    pub fn queue_deletion(&mut self, key: InstanceKey) {
        self.deletions.push_back(key);
    }

    /// True if a resolution for `key` is waiting.
    pub fn is_resolution_pending(&self, key: &InstanceKey) -> bool {
        self.resolutions.iter().any(|r| r.keys.contains(key))
    }

    /// Number of waiting resolutions.
    pub fn pending_resolutions(&self) -> usize {
        self.resolutions.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.resolutions.is_empty()
            && self.events.is_empty()
            && self.updates.is_empty()
            && self.deletions.is_empty()
    }

    /// Runs all queued work.
    ///
    /// Fetches are sequential. A failed fetch, callback or listener aborts
    /// the rest of the drain.
    pub async fn drain(mut self, state: &RuntimeState, fetcher: &dyn Fetcher) -> RuntimeResult<()> {
        let mut fetched = 0usize;
        while let Some(resolution) = self.resolutions.pop_front() {
            let mut resolved = Vec::with_capacity(resolution.keys.len());
            for key in &resolution.keys {
                let instance = match state.identity().resolved(key) {
                    Some(instance) => Some(instance),
                    None => {
                        fetched += 1;
                        fetcher.fetch(key, &mut self).await?
                    }
                };
                resolved.push(instance);
            }
            if let Some(callback) = resolution.callback {
                callback(resolved)?;
            }
        }

        let events = self.events.len();
        while let Some(event) = self.events.pop_front() {
            for listener in state.events().listeners(&event.channel) {
                listener(&event).map_err(|e| RuntimeError::Listener(e.to_string()))?;
            }
        }

        let updates = self.updates.len();
        while let Some((instance, deleted)) = self.updates.pop_front() {
            for listener in state.identity().update_listeners(&instance) {
                listener(&instance, deleted).map_err(|e| RuntimeError::Listener(e.to_string()))?;
            }
        }

        let deletions = self.deletions.len();
        while let Some(key) = self.deletions.pop_front() {
            state.identity().remove(&key);
        }

        trace!(fetched, events, updates, deletions, "tracker drained");
        Ok(())
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("resolutions", &self.resolutions.len())
            .field("events", &self.events.len())
            .field("updates", &self.updates.len())
            .field("deletions", &self.deletions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PropertyBag;
    use crate::keys::{ClassKind, EventChannelKey, ServiceIdentity};
    use crate::listeners::EventListener;
    use crate::registry::ClassRegistry;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn state() -> RuntimeState {
        let registry = ClassRegistry::builder(ServiceIdentity::new("svc", "v1"))
            .record("User", 5)
            .unwrap()
            .callable("Api", 1)
            .unwrap()
            .event("Ping", 9)
            .unwrap()
            .build();
        RuntimeState::new(registry)
    }

    fn user(state: &RuntimeState, pk: &str) -> InstanceKey {
        state
            .registry()
            .instance_key(ClassKind::Record, 5, pk)
            .unwrap()
    }

    /// Creates each fetched key at version 1.
    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        state: Option<Arc<RuntimeState>>,
    }

    #[async_trait]
    impl Fetcher for CountingFetcher {
        async fn fetch(
            &self,
            key: &InstanceKey,
            _tracker: &mut Tracker,
        ) -> RuntimeResult<Option<Instance>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(state) = &self.state else {
                return Ok(None);
            };
            let instance = match state.identity().try_get_instance(key) {
                Some(i) => i,
                None => {
                    let i = state.registry().create_instance(key.clone())?;
                    state.identity().set_instance(&i)?;
                    i
                }
            };
            state.identity().set_version(&instance, 1);
            Ok(Some(instance))
        }
    }

    #[tokio::test]
    async fn cached_keys_are_not_fetched() {
        let state = Arc::new(state());
        let cached = state.registry().create_instance(user(&state, "u1")).unwrap();
        state.identity().set_instance(&cached).unwrap();
        state.identity().set_version(&cached, 4);

        let fetcher = CountingFetcher {
            state: Some(Arc::clone(&state)),
            ..Default::default()
        };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut tracker = Tracker::new();
        tracker.resolve_then(
            vec![user(&state, "u1"), user(&state, "u2")],
            Box::new(move |resolved| {
                sink.lock().extend(resolved);
                Ok(())
            }),
        );
        tracker.drain(&state, &fetcher).await.unwrap();

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        let seen = seen.lock();
        assert_eq!(seen[0].as_ref(), Some(&cached));
        assert_eq!(seen[1].as_ref().map(|i| i.primary_key()), Some("u2"));
    }

    #[tokio::test]
    async fn deletion_runs_after_update_delivery() {
        let state = state();
        let instance = state.registry().create_instance(user(&state, "u1")).unwrap();
        state.identity().set_instance(&instance).unwrap();
        state.identity().set_version(&instance, 2);

        let visible = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&visible);
        let key = user(&state, "u1");
        let state = Arc::new(state);
        let inner = Arc::clone(&state);
        state.identity().add_update_listener(
            &instance,
            Arc::new(move |_, deleted| {
                *sink.lock() = Some((deleted, inner.identity().try_get_instance(&key).is_some()));
                Ok(())
            }),
        );

        let mut tracker = Tracker::new();
        tracker.queue_update(instance.clone(), true);
        tracker.queue_deletion(user(&state, "u1"));
        tracker.drain(&state, &CountingFetcher::default()).await.unwrap();

        assert_eq!(*visible.lock(), Some((true, true)));
        assert!(state.identity().try_get_instance(&user(&state, "u1")).is_none());
    }

    #[tokio::test]
    async fn events_precede_updates_and_listener_failure_aborts() {
        let state = state();
        let source = state
            .registry()
            .create_instance(state.registry().instance_key(ClassKind::Callable, 1, "api").unwrap())
            .unwrap();
        let channel = EventChannelKey::new(
            state.registry().by_id(ClassKind::Event, 9).unwrap().key.clone(),
            source.key().clone(),
        );
        let order = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&order);
        let failing: EventListener = Arc::new(move |_| {
            log.lock().push("event");
            Err("listener refused".into())
        });
        state.events().add(channel.clone(), failing);

        let record = state.registry().create_instance(user(&state, "u1")).unwrap();
        state.identity().set_instance(&record).unwrap();
        let log = Arc::clone(&order);
        state.identity().add_update_listener(
            &record,
            Arc::new(move |_, _| {
                log.lock().push("update");
                Ok(())
            }),
        );

        let mut tracker = Tracker::new();
        tracker.queue_update(record.clone(), false);
        tracker.queue_event(Event {
            channel,
            source,
            properties: PropertyBag::new(),
        });
        tracker.queue_deletion(user(&state, "u1"));

        let err = tracker
            .drain(&state, &CountingFetcher::default())
            .await
            .unwrap_err();
        assert_eq!(err, RuntimeError::Listener("listener refused".into()));
        assert_eq!(*order.lock(), vec!["event"]);
        // The drain stopped before the deletion queue.
        assert!(state.identity().try_get_instance(&user(&state, "u1")).is_some());
    }
}
