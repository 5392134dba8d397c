//! Reconciler: applies server deltas and snapshots to the identity map.
//!
//! Deltas reach the client over several independent paths (subscriptions,
//! method responses, event bundles) that can race with direct fetches and
//! saves. Nothing is buffered: a delta that does not directly follow the
//! cached version drops the cached instance and queues a fresh fetch.
//!
//! A message is applied in two passes. Every delta is first staged: its key
//! resolved, its outcome decided and its properties decoded. Only once the
//! whole message has staged does anything in the cache change.

use crate::codec::ValueDecoder;
use crate::error::RuntimeResult;
use crate::instance::{Instance, PropertyBag};
use crate::keys::{ClassKind, EventChannelKey, InstanceKey};
use crate::listeners::Event;
use crate::state::RuntimeState;
use crate::tracker::Tracker;
use nimbus_protocol::{DataUpdateMessage, DeltaData, EventMessage, Property, ServerMessage};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// What applying a delta did.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// First version; the instance was created or adopted.
    Created(Instance),
    /// Advanced by one version.
    Updated(Instance),
    /// Deletion queued for a cached instance.
    Deleted,
    /// Deletion of a key nothing caches.
    Absent,
    /// Version did not follow; a fresh fetch is queued.
    Resync,
}

/// Applies deltas against one service's state.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'a> {
    state: &'a RuntimeState,
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler.
    pub fn new(state: &'a RuntimeState) -> Self {
        Self { state }
    }

    /// Applies one version-advancing delta.
    ///
    /// Property values are decoded before anything is mutated, so a decode
    /// failure leaves the cache untouched.
    pub fn apply_delta(&self, delta: &DeltaData, tracker: &mut Tracker) -> RuntimeResult<Reconciled> {
        let staged = self.stage(delta, &mut Staging::default(), tracker)?;
        self.commit(staged, tracker)
    }

    /// Replaces a record wholesale with a fetched snapshot.
    ///
    /// A bare or locally created instance at the key is adopted. A snapshot
    /// no newer than the cached version is ignored. Returns `None` if the
    /// server reports the record deleted.
    pub fn apply_snapshot(
        &self,
        snapshot: &DeltaData,
        tracker: &mut Tracker,
    ) -> RuntimeResult<Option<Instance>> {
        let key = self.key(snapshot)?;
        let identity = self.state.identity();

        if snapshot.deleted {
            if let Some(instance) = identity.try_get_instance(&key) {
                tracker.queue_update(instance, true);
                tracker.queue_deletion(key);
            }
            return Ok(None);
        }

        if let Some(instance) = identity.try_get_instance(&key) {
            if identity
                .try_get_version(&instance)
                .is_some_and(|v| snapshot.version <= v)
            {
                return Ok(Some(instance));
            }
        }

        let properties = self.decode_properties(&snapshot.changed_properties, tracker)?;
        let instance = self.get_or_register(key)?;
        instance.replace_properties(properties);
        identity.set_version(&instance, snapshot.version);
        tracker.queue_update(instance.clone(), false);
        Ok(Some(instance))
    }

    /// Applies every delta of a data update in order.
    ///
    /// All deltas are decoded first; if any fails, none is applied.
    pub fn apply_data_update(
        &self,
        message: &DataUpdateMessage,
        tracker: &mut Tracker,
    ) -> RuntimeResult<()> {
        for staged in self.stage_all(&message.deltas, tracker)? {
            self.commit(staged, tracker)?;
        }
        Ok(())
    }

    /// Applies an event's deltas, then queues the event for delivery.
    ///
    /// The deltas, source and properties are all decoded before the cache
    /// changes.
    pub fn apply_event(&self, message: &EventMessage, tracker: &mut Tracker) -> RuntimeResult<()> {
        let (staged, event) = self.stage_event(message, tracker)?;
        for staged in staged {
            self.commit(staged, tracker)?;
        }
        tracker.queue_event(event);
        Ok(())
    }

    /// Decodes a batch of messages without applying any of them.
    ///
    /// Bare instances for referenced keys may be registered; nothing else in
    /// the cache changes. Lets a caller reject a whole batch before the
    /// first message is applied.
    pub fn check(&self, messages: &[ServerMessage]) -> RuntimeResult<()> {
        let mut scratch = Tracker::new();
        for message in messages {
            match message {
                ServerMessage::DataUpdate(update) => {
                    self.stage_all(&update.deltas, &mut scratch)?;
                }
                ServerMessage::Event(event) => {
                    self.stage_event(event, &mut scratch)?;
                }
            }
        }
        Ok(())
    }

    fn stage_all(&self, deltas: &[DeltaData], tracker: &mut Tracker) -> RuntimeResult<Vec<Staged>> {
        let mut staging = Staging::default();
        deltas
            .iter()
            .map(|delta| self.stage(delta, &mut staging, tracker))
            .collect()
    }

    fn stage_event(
        &self,
        message: &EventMessage,
        tracker: &mut Tracker,
    ) -> RuntimeResult<(Vec<Staged>, Event)> {
        let staged = self.stage_all(&message.deltas, tracker)?;
        let event_class = self
            .state
            .registry()
            .by_id(ClassKind::Event, message.class_id)?
            .key
            .clone();
        let mut decoder = ValueDecoder::new(self.state, tracker);
        let source = decoder.decode_source(&message.source)?;
        let properties = message
            .properties
            .iter()
            .map(|p| Ok((p.name.clone(), decoder.decode(&p.value)?)))
            .collect::<RuntimeResult<PropertyBag>>()?;
        let event = Event {
            channel: EventChannelKey::new(event_class, source.key().clone()),
            source,
            properties,
        };
        Ok((staged, event))
    }

    /// Decides what a delta does and decodes its properties.
    ///
    /// Versions and properties are left alone; `staging` carries the
    /// version each earlier delta of the same batch will leave behind.
    fn stage(
        &self,
        delta: &DeltaData,
        staging: &mut Staging,
        tracker: &mut Tracker,
    ) -> RuntimeResult<Staged> {
        let key = self.key(delta)?;
        if delta.deleted {
            return Ok(Staged {
                key,
                step: Step::Delete,
            });
        }

        let known = staging.version(self.state, &key);
        let step = match known {
            None if delta.version == 1 => Step::Apply {
                version: 1,
                first: true,
                changed: self.decode_properties(&delta.changed_properties, tracker)?,
                deleted: delta.deleted_property_names.clone(),
            },
            Some(version) if delta.version == version + 1 => Step::Apply {
                version: delta.version,
                first: false,
                changed: self.decode_properties(&delta.changed_properties, tracker)?,
                deleted: delta.deleted_property_names.clone(),
            },
            cached => Step::Resync {
                cached,
                incoming: delta.version,
            },
        };

        match &step {
            Step::Apply { version, .. } => {
                staging.versions.insert(key.clone(), *version);
            }
            Step::Resync {
                cached: Some(_), ..
            } => {
                staging.versions.remove(&key);
                staging.dropped.insert(key.clone());
            }
            _ => {}
        }
        Ok(Staged { key, step })
    }

    fn commit(&self, staged: Staged, tracker: &mut Tracker) -> RuntimeResult<Reconciled> {
        let Staged { key, step } = staged;
        let identity = self.state.identity();
        match step {
            Step::Delete => Ok(match identity.try_get_instance(&key) {
                Some(instance) => {
                    tracker.queue_update(instance, true);
                    tracker.queue_deletion(key);
                    Reconciled::Deleted
                }
                None => Reconciled::Absent,
            }),
            Step::Apply {
                version,
                first,
                changed,
                deleted,
            } => {
                // Decoding may itself have registered a bare instance here.
                let instance = self.get_or_register(key)?;
                instance.apply_changes(changed, &deleted);
                identity.set_version(&instance, version);
                tracker.queue_update(instance.clone(), false);
                Ok(if first {
                    Reconciled::Created(instance)
                } else {
                    Reconciled::Updated(instance)
                })
            }
            Step::Resync { cached, incoming } => {
                debug!(
                    key = %key,
                    cached = ?cached,
                    incoming,
                    "version does not follow, resyncing"
                );
                // Unversioned instances are kept so references to them stay
                // valid; the fetch fills them in.
                if cached.is_some() {
                    identity.remove(&key);
                }
                tracker.resolve(key);
                Ok(Reconciled::Resync)
            }
        }
    }

    fn key(&self, delta: &DeltaData) -> RuntimeResult<InstanceKey> {
        Ok(self.state.registry().instance_key(
            ClassKind::Record,
            delta.class_id,
            delta.primary_key.as_str(),
        )?)
    }

    fn decode_properties(
        &self,
        properties: &[Property],
        tracker: &mut Tracker,
    ) -> RuntimeResult<PropertyBag> {
        let mut decoder = ValueDecoder::new(self.state, tracker);
        properties
            .iter()
            .map(|p| Ok((p.name.clone(), decoder.decode(&p.value)?)))
            .collect()
    }

    fn get_or_register(&self, key: InstanceKey) -> RuntimeResult<Instance> {
        let identity = self.state.identity();
        if let Some(instance) = identity.try_get_instance(&key) {
            return Ok(instance);
        }
        let instance = self.state.registry().create_instance(key)?;
        identity.set_instance(&instance)?;
        Ok(instance)
    }
}

/// Versions that deltas staged earlier in a batch will leave behind.
#[derive(Debug, Default)]
struct Staging {
    versions: HashMap<InstanceKey, u64>,
    dropped: HashSet<InstanceKey>,
}

impl Staging {
    fn version(&self, state: &RuntimeState, key: &InstanceKey) -> Option<u64> {
        if let Some(version) = self.versions.get(key) {
            return Some(*version);
        }
        if self.dropped.contains(key) {
            return None;
        }
        let identity = state.identity();
        identity
            .try_get_instance(key)
            .and_then(|i| identity.try_get_version(&i))
    }
}

/// A decoded delta waiting to be committed.
#[derive(Debug)]
struct Staged {
    key: InstanceKey,
    step: Step,
}

#[derive(Debug)]
enum Step {
    Delete,
    Apply {
        version: u64,
        first: bool,
        changed: PropertyBag,
        deleted: Vec<String>,
    },
    Resync {
        cached: Option<u64>,
        incoming: u64,
    },
}
