//! Remote object handles and their property stores.
//!
//! An [`Instance`] is an opaque handle `{key, id}` paired with a mutable
//! property store. The handle is created bare by the class registry and
//! populated later by the reconciler; every holder of the handle observes
//! the same store. [`RecordView`] is the application-facing view over it.

use crate::keys::{ClassKind, InstanceKey};
use crate::value::Value;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one handle, independent of its key.
///
/// Two handles for the same key (say, before and after a resync) have
/// different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Ordered, string-keyed property store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    entries: Vec<(String, Value)>,
}

impl PropertyBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Sets `name`, keeping its position if already present.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((name, value));
                None
            }
        }
    }

    /// Removes `name`.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(pos).1)
    }

    /// True if `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates `(name, value)` in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Property names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for PropertyBag {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut bag = PropertyBag::new();
        for (name, value) in iter {
            bag.insert(name, value);
        }
        bag
    }
}

impl IntoIterator for PropertyBag {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

struct InstanceCell {
    id: InstanceId,
    key: InstanceKey,
    properties: RwLock<PropertyBag>,
}

/// Shared handle to one remote object.
///
/// Equality is handle identity, not key equality.
#[derive(Clone)]
pub struct Instance(Arc<InstanceCell>);

impl Instance {
    pub(crate) fn new(key: InstanceKey) -> Self {
        Self(Arc::new(InstanceCell {
            id: InstanceId::next(),
            key,
            properties: RwLock::new(PropertyBag::new()),
        }))
    }

    /// Handle identity.
    pub fn id(&self) -> InstanceId {
        self.0.id
    }

    /// Logical key.
    pub fn key(&self) -> &InstanceKey {
        &self.0.key
    }

    /// Kind of the object.
    pub fn kind(&self) -> ClassKind {
        self.0.key.kind()
    }

    /// Service-scoped class id.
    pub fn class_id(&self) -> u32 {
        self.0.key.class.class_id
    }

    /// Primary key, or session id.
    pub fn primary_key(&self) -> &str {
        &self.0.key.primary_key
    }

    /// Property view.
    pub fn view(&self) -> RecordView {
        RecordView {
            instance: self.clone(),
        }
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance(Arc::downgrade(&self.0))
    }

    /// Copy of the current properties.
    pub fn snapshot(&self) -> PropertyBag {
        self.0.properties.read().clone()
    }

    /// Calls `f` with every instance held by this one's properties.
    pub(crate) fn for_each_reference(&self, f: &mut dyn FnMut(&Instance)) {
        for (_, value) in &self.0.properties.read().entries {
            value.for_each_instance(f);
        }
    }

    pub(crate) fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Empties the properties, returning what they held.
    pub(crate) fn take_properties(&self) -> PropertyBag {
        std::mem::take(&mut *self.0.properties.write())
    }

    pub(crate) fn replace_properties(&self, bag: PropertyBag) {
        *self.0.properties.write() = bag;
    }

    pub(crate) fn apply_changes(&self, changed: PropertyBag, deleted: &[String]) {
        let mut properties = self.0.properties.write();
        for (name, value) in changed {
            properties.insert(name, value);
        }
        for name in deleted {
            properties.remove(name);
        }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Instance {}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Properties may reference this instance; print identity only.
        f.debug_struct("Instance")
            .field("key", &self.0.key)
            .field("id", &self.0.id)
            .finish()
    }
}

/// Non-owning handle to an [`Instance`].
#[derive(Clone)]
pub struct WeakInstance(Weak<InstanceCell>);

impl WeakInstance {
    /// The instance, if some owner still holds it.
    pub fn upgrade(&self) -> Option<Instance> {
        self.0.upgrade().map(Instance)
    }

    /// True while some owner holds the instance.
    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl fmt::Debug for WeakInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakInstance(alive: {})", self.is_alive())
    }
}

/// Read/write view over an instance's properties.
///
/// Local writes are not sent anywhere until the record is saved.
#[derive(Debug, Clone)]
pub struct RecordView {
    instance: Instance,
}

impl RecordView {
    /// The viewed instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Value of `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.instance.0.properties.read().get(name).cloned()
    }

    /// Sets `name`.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.instance.0.properties.write().insert(name, value.into())
    }

    /// Removes `name`.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.instance.0.properties.write().remove(name)
    }

    /// String value of `name`.
    pub fn get_str(&self, name: &str) -> Option<String> {
        match self.instance.0.properties.read().get(name) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Numeric value of `name`.
    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.instance.0.properties.read().get(name).and_then(Value::as_number)
    }

    /// Boolean value of `name`.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.instance.0.properties.read().get(name).and_then(Value::as_bool)
    }

    /// True if `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.instance.0.properties.read().contains(name)
    }

    /// Number of properties.
    pub fn len(&self) -> usize {
        self.instance.0.properties.read().len()
    }

    /// True if there are no properties.
    pub fn is_empty(&self) -> bool {
        self.instance.0.properties.read().is_empty()
    }

    /// Property names in order.
    pub fn names(&self) -> Vec<String> {
        self.instance.0.properties.read().names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{ClassKey, ServiceIdentity};

    fn key(pk: &str) -> InstanceKey {
        ClassKey::new(ServiceIdentity::new("svc", "v1"), 5, ClassKind::Record).instance(pk)
    }

    #[test]
    fn handles_share_one_store() {
        let a = Instance::new(key("u1"));
        let b = a.clone();
        a.view().set("name", "Sam");
        assert_eq!(b.view().get_str("name").as_deref(), Some("Sam"));
        assert_eq!(a, b);
    }

    #[test]
    fn identity_is_per_handle() {
        let a = Instance::new(key("u1"));
        let b = Instance::new(key("u1"));
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn bag_keeps_insertion_order() {
        let mut bag = PropertyBag::new();
        bag.insert("b", Value::from(1.0));
        bag.insert("a", Value::from(2.0));
        bag.insert("b", Value::from(3.0));
        assert_eq!(bag.names(), vec!["b", "a"]);
        assert_eq!(bag.get("b"), Some(&Value::Number(3.0)));
        assert_eq!(bag.remove("b"), Some(Value::Number(3.0)));
        assert_eq!(bag.names(), vec!["a"]);
    }

    #[test]
    fn apply_changes_sets_then_removes() {
        let instance = Instance::new(key("u1"));
        instance.replace_properties(PropertyBag::from_iter([
            ("name", Value::from("Sam")),
            ("age", Value::from(30.0)),
        ]));
        instance.apply_changes(
            PropertyBag::from_iter([("name", Value::from("Sal"))]),
            &["age".to_string()],
        );
        let view = instance.view();
        assert_eq!(view.get_str("name").as_deref(), Some("Sal"));
        assert!(!view.contains("age"));
        assert_eq!(view.get_number("name"), None);
    }

    #[test]
    fn weak_handle_follows_owner() {
        let instance = Instance::new(key("u1"));
        let weak = instance.downgrade();
        assert!(weak.upgrade().is_some());
        drop(instance);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }
}
