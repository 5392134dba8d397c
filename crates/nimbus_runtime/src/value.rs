//! Dynamic application values.

use crate::instance::Instance;
use crate::keys::ClassKind;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A dynamic value as seen by application code.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value.
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Double-precision number.
    Number(f64),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    /// Ordered name → value entries.
    Object(Vec<(String, Value)>),
    /// Items in index order.
    Array(Vec<Value>),
    /// Ordered key/value pairs; keys may be composite or references.
    Map(SharedMap),
    /// Ordered unique items.
    Set(Vec<Value>),
    /// Reference to a versioned record.
    Record(Instance),
    /// Reference to a session handle.
    Session(Instance),
    /// Reference to a callable object.
    Callable(Instance),
}

impl Value {
    /// An object from named entries.
    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// A set from items; later duplicates are dropped.
    pub fn set<I: IntoIterator<Item = Value>>(items: I) -> Self {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        Value::Set(unique)
    }

    /// A map from pairs; a repeated key keeps its first position and the
    /// last value.
    pub fn map<I: IntoIterator<Item = (Value, Value)>>(pairs: I) -> Self {
        Value::Map(SharedMap::from_pairs(pairs))
    }

    /// Boolean content.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric content.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String content.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Referenced instance, for any reference kind.
    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Record(i) | Value::Session(i) | Value::Callable(i) => Some(i),
            _ => None,
        }
    }

    /// Object entries.
    pub fn as_object(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Array items.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Shared map.
    pub fn as_map(&self) -> Option<&SharedMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// True for `Undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Short type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::String(_) => "string",
            Value::Number(_) => "number",
            Value::Date(_) => "date",
            Value::Object(_) => "object",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Set(_) => "set",
            Value::Record(_) => "record",
            Value::Session(_) => "session",
            Value::Callable(_) => "callable",
        }
    }

    /// Calls `f` with every instance this value holds, once per occurrence.
    /// Shared map contents are skipped.
    pub(crate) fn for_each_instance(&self, f: &mut dyn FnMut(&Instance)) {
        match self {
            Value::Record(i) | Value::Session(i) | Value::Callable(i) => f(i),
            Value::Object(entries) => {
                for (_, value) in entries {
                    value.for_each_instance(f);
                }
            }
            Value::Array(items) | Value::Set(items) => {
                for item in items {
                    item.for_each_instance(f);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<SharedMap> for Value {
    fn from(map: SharedMap) -> Self {
        Value::Map(map)
    }
}

/// Wraps an instance as the reference kind matching its class.
///
/// Event-class instances are wrapped as records and rejected when encoded.
impl From<Instance> for Value {
    fn from(instance: Instance) -> Self {
        match instance.kind() {
            ClassKind::Session => Value::Session(instance),
            ClassKind::Callable => Value::Callable(instance),
            ClassKind::Record | ClassKind::Event => Value::Record(instance),
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Ordered key/value pairs behind a shared handle.
///
/// Decoding can insert entries after the map has been handed out, once
/// references in an entry have been resolved. Clones share entries.
/// Equality compares contents.
#[derive(Clone, Default)]
pub struct SharedMap(Arc<Mutex<Vec<(Value, Value)>>>);

impl SharedMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a map from pairs.
    pub fn from_pairs<I: IntoIterator<Item = (Value, Value)>>(pairs: I) -> Self {
        let map = Self::new();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        map
    }

    /// Inserts or replaces the value for `key`.
    pub fn insert(&self, key: Value, value: Value) -> Option<Value> {
        let mut entries = self.0.lock();
        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                entries.push((key, value));
                None
            }
        }
    }

    /// Value for `key`.
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.0
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Removes `key`.
    pub fn remove(&self, key: &Value) -> Option<Value> {
        let mut entries = self.0.lock();
        let pos = entries.iter().position(|(k, _)| k == key)?;
        Some(entries.remove(pos).1)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// True if empty.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Copy of the entries in order.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.lock().clone()
    }

    /// True if both handles share entries.
    pub fn ptr_eq(&self, other: &SharedMap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for SharedMap {
    fn eq(&self, other: &Self) -> bool {
        // Never hold both locks at once.
        self.ptr_eq(other) || self.entries() == other.entries()
    }
}

impl fmt::Debug for SharedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries();
        f.debug_map()
            .entries(entries.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_drops_duplicates() {
        let set = Value::set([Value::from(1), Value::from("a"), Value::from(1)]);
        assert_eq!(set, Value::Set(vec![Value::Number(1.0), Value::from("a")]));
    }

    #[test]
    fn map_replaces_equal_keys() {
        let key = Value::Array(vec![Value::from(1), Value::from(2)]);
        let map = SharedMap::new();
        assert_eq!(map.insert(key.clone(), Value::from("x")), None);
        assert_eq!(
            map.insert(key.clone(), Value::from("y")),
            Some(Value::from("x"))
        );
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&key), Some(Value::from("y")));
    }

    #[test]
    fn shared_map_clones_share_entries() {
        let map = SharedMap::new();
        let alias = map.clone();
        map.insert(Value::from("k"), Value::Null);
        assert_eq!(alias.len(), 1);
        assert!(alias.ptr_eq(&map));
        assert_eq!(Value::Map(map), Value::Map(alias));
    }

    #[test]
    fn maps_compare_by_content() {
        let a = SharedMap::from_pairs([(Value::from(1), Value::from(true))]);
        let b = SharedMap::from_pairs([(Value::from(1), Value::from(true))]);
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn option_converts_to_null() {
        assert_eq!(Value::from(None::<&str>), Value::Null);
        assert_eq!(Value::from(Some(2.5)), Value::Number(2.5));
    }
}
