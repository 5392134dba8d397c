//! Identity map: the cache of known remote objects.
//!
//! Entries are weak, so application code decides how long an object lives.
//! Versions and update listeners are side tables indexed by handle identity
//! rather than stored on the object, and are dropped together with the
//! entry by [`IdentityMap::remove`] or [`IdentityMap::prune`].
//!
//! Records hold each other strongly through their properties, so a cycle of
//! records outlives every outside handle. [`IdentityMap::prune`] finds
//! cached or formerly cached records that only other such records hold and
//! empties their properties, which frees the cycle. References held inside
//! a shared map count as outside owners.

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::{Instance, InstanceId, PropertyBag, WeakInstance};
use crate::keys::InstanceKey;
use crate::listeners::{ListenerId, UpdateListener};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

struct Entry {
    id: InstanceId,
    instance: WeakInstance,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<InstanceKey, Entry>,
    versions: HashMap<InstanceId, u64>,
    listeners: HashMap<InstanceId, Vec<(ListenerId, UpdateListener)>>,
    /// Instances removed or cleared while still alive.
    detached: Vec<WeakInstance>,
}

impl Tables {
    fn drop_side_tables(&mut self, id: InstanceId) {
        self.versions.remove(&id);
        self.listeners.remove(&id);
    }
}

/// Cache of live remote objects keyed by [`InstanceKey`].
#[derive(Default)]
pub struct IdentityMap {
    tables: Mutex<Tables>,
}

impl IdentityMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `instance` under its key.
    ///
    /// # Errors
    ///
    /// Fails with `IdentityConflict` if another live instance occupies the
    /// key. Registering the same instance twice is a no-op.
    pub fn set_instance(&self, instance: &Instance) -> RuntimeResult<()> {
        let mut tables = self.tables.lock();
        if let Some(entry) = tables.entries.get(instance.key()) {
            if entry.id == instance.id() {
                return Ok(());
            }
            if entry.instance.is_alive() {
                return Err(RuntimeError::IdentityConflict {
                    key: instance.key().to_string(),
                });
            }
            let dead = entry.id;
            tables.drop_side_tables(dead);
        }
        tables.entries.insert(
            instance.key().clone(),
            Entry {
                id: instance.id(),
                instance: instance.downgrade(),
            },
        );
        Ok(())
    }

    /// The live instance at `key`.
    pub fn try_get_instance(&self, key: &InstanceKey) -> Option<Instance> {
        let mut tables = self.tables.lock();
        let entry = tables.entries.get(key)?;
        match entry.instance.upgrade() {
            Some(instance) => Some(instance),
            None => {
                let dead = entry.id;
                tables.entries.remove(key);
                tables.drop_side_tables(dead);
                None
            }
        }
    }

    /// The live instance at `key` if its version is known.
    pub fn resolved(&self, key: &InstanceKey) -> Option<Instance> {
        let instance = self.try_get_instance(key)?;
        self.try_get_version(&instance).map(|_| instance)
    }

    /// Records the confirmed version of `instance`.
    pub fn set_version(&self, instance: &Instance, version: u64) {
        self.tables.lock().versions.insert(instance.id(), version);
    }

    /// Confirmed version of `instance`. Version 0 (locally created) counts
    /// as unknown.
    pub fn try_get_version(&self, instance: &Instance) -> Option<u64> {
        self.tables
            .lock()
            .versions
            .get(&instance.id())
            .copied()
            .filter(|&v| v > 0)
    }

    /// Appends an update listener for `instance`. Returns its id and
    /// whether it is the first for the instance.
    pub fn add_update_listener(
        &self,
        instance: &Instance,
        listener: UpdateListener,
    ) -> (ListenerId, bool) {
        let id = ListenerId::next();
        let mut tables = self.tables.lock();
        let list = tables.listeners.entry(instance.id()).or_default();
        list.push((id, listener));
        (id, list.len() == 1)
    }

    /// Removes an update listener. Returns `Some(true)` if none remain for
    /// the instance, `None` if the id was not registered.
    pub fn remove_update_listener(&self, instance: &Instance, id: ListenerId) -> Option<bool> {
        let mut tables = self.tables.lock();
        let list = tables.listeners.get_mut(&instance.id())?;
        let pos = list.iter().position(|(i, _)| *i == id)?;
        list.remove(pos);
        let empty = list.is_empty();
        if empty {
            tables.listeners.remove(&instance.id());
        }
        Some(empty)
    }

    /// Update listeners of `instance`, in registration order.
    pub fn update_listeners(&self, instance: &Instance) -> Vec<UpdateListener> {
        self.tables
            .lock()
            .listeners
            .get(&instance.id())
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    /// Clears `key` and the side tables of whatever instance occupies it.
    pub fn remove(&self, key: &InstanceKey) -> Option<Instance> {
        let mut tables = self.tables.lock();
        let entry = tables.entries.remove(key)?;
        tables.drop_side_tables(entry.id);
        let instance = entry.instance.upgrade();
        if instance.is_some() {
            tables.detached.push(entry.instance);
        }
        instance
    }

    /// Frees record cycles nothing outside them holds, then drops entries
    /// whose instance has been released. Returns how many entries went.
    pub fn prune(&self) -> usize {
        let mut tables = self.tables.lock();
        // The lock keeps `try_get_instance` from handing out new handles
        // while owners are counted.
        drop(break_unowned_cycles(&tables));
        tables.detached.retain(WeakInstance::is_alive);

        let before = tables.entries.len();
        tables.entries.retain(|_, e| e.instance.is_alive());
        let live: HashSet<InstanceId> = tables.entries.values().map(|e| e.id).collect();
        tables.versions.retain(|id, _| live.contains(id));
        tables.listeners.retain(|id, _| live.contains(id));
        before - tables.entries.len()
    }

    /// Empties the map and all side tables. Live instances stay eligible
    /// for cycle collection by a later [`IdentityMap::prune`].
    pub fn clear(&self) {
        let mut tables = self.tables.lock();
        let Tables {
            entries, detached, ..
        } = std::mem::take(&mut *tables);
        tables.detached = detached
            .into_iter()
            .chain(entries.into_values().map(|e| e.instance))
            .filter(WeakInstance::is_alive)
            .collect();
    }

    /// Number of entries, live or not yet pruned.
    pub fn len(&self) -> usize {
        self.tables.lock().entries.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.tables.lock().entries.is_empty()
    }
}

/// Empties the properties of every candidate no outside owner can reach.
///
/// Candidates are the live cached and detached instances plus everything
/// their properties reach. An instance's outside owners are its strong
/// count less the handle held here and the references found in candidate
/// properties. Returns the emptied properties; dropping them frees the
/// cycles.
fn break_unowned_cycles(tables: &Tables) -> Vec<PropertyBag> {
    let mut queue: Vec<Instance> = tables
        .entries
        .values()
        .filter_map(|e| e.instance.upgrade())
        .chain(tables.detached.iter().filter_map(WeakInstance::upgrade))
        .collect();
    let mut candidates: HashMap<InstanceId, Instance> = HashMap::new();
    while let Some(instance) = queue.pop() {
        if candidates.contains_key(&instance.id()) {
            continue;
        }
        instance.for_each_reference(&mut |r| queue.push(r.clone()));
        candidates.insert(instance.id(), instance);
    }

    let mut inbound: HashMap<InstanceId, usize> = HashMap::new();
    let mut edges: HashMap<InstanceId, Vec<InstanceId>> = HashMap::new();
    for (id, instance) in &candidates {
        let out = edges.entry(*id).or_default();
        instance.for_each_reference(&mut |r| {
            *inbound.entry(r.id()).or_default() += 1;
            out.push(r.id());
        });
    }

    let mut pending: Vec<InstanceId> = candidates
        .iter()
        .filter(|(id, i)| i.strong_count() > 1 + inbound.get(*id).copied().unwrap_or(0))
        .map(|(id, _)| *id)
        .collect();
    let mut owned: HashSet<InstanceId> = pending.iter().copied().collect();
    while let Some(id) = pending.pop() {
        for next in edges.get(&id).into_iter().flatten() {
            if owned.insert(*next) {
                pending.push(*next);
            }
        }
    }

    candidates
        .iter()
        .filter(|(id, _)| !owned.contains(*id))
        .map(|(_, i)| i.take_properties())
        .collect()
}

impl std::fmt::Debug for IdentityMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("IdentityMap")
            .field("entries", &tables.entries.len())
            .field("versions", &tables.versions.len())
            .field("listeners", &tables.listeners.len())
            .finish()
    }
}
