//! Value codec: [`Value`] ⇄ [`EncodedValue`].
//!
//! Outgoing record references are written as bare `[class_id, key]`
//! references. Every distinct record reached from the request is serialized
//! once, in full, into the request's referenced-deltas list by a worklist, so
//! cycles and repeated references cost nothing extra.
//!
//! Incoming references never carry properties. A record reference yields the
//! cached instance, or a bare one registered in the identity map, and queues
//! its resolution on the active tracker. A map entry holding an unresolved
//! record reference is inserted only once its references are resolved.

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::Instance;
use crate::keys::{ClassKind, InstanceKey};
use crate::state::RuntimeState;
use crate::tracker::Tracker;
use crate::value::{SharedMap, Value};
use nimbus_codec::{CodecError, EncodedValue, ReferencePayload, TypeTag};
use nimbus_protocol::{DeltaData, Property};
use std::collections::{HashSet, VecDeque};

/// Deepest container nesting accepted in an incoming value.
///
/// Each level of a tagged value is its own byte string, so the wire
/// decoder's limit only bounds a single level.
pub const MAX_VALUE_DEPTH: usize = 128;

/// Decodes values, queueing deferred work on a tracker.
pub struct ValueDecoder<'a> {
    state: &'a RuntimeState,
    tracker: &'a mut Tracker,
    depth: usize,
}

impl<'a> ValueDecoder<'a> {
    /// Creates a decoder.
    pub fn new(state: &'a RuntimeState, tracker: &'a mut Tracker) -> Self {
        Self {
            state,
            tracker,
            depth: 0,
        }
    }

    /// Decodes one value.
    ///
    /// Fails with [`CodecError::TooDeep`] once containers nest deeper than
    /// [`MAX_VALUE_DEPTH`].
    pub fn decode(&mut self, encoded: &EncodedValue) -> RuntimeResult<Value> {
        if self.depth >= MAX_VALUE_DEPTH {
            return Err(CodecError::TooDeep {
                max_depth: MAX_VALUE_DEPTH,
            }
            .into());
        }
        self.depth += 1;
        let value = self.decode_nested(encoded);
        self.depth -= 1;
        value
    }

    fn decode_nested(&mut self, encoded: &EncodedValue) -> RuntimeResult<Value> {
        Ok(match encoded.tag {
            TypeTag::Undefined => Value::Undefined,
            TypeTag::Null => Value::Null,
            TypeTag::Boolean => Value::Bool(encoded.as_boolean()?),
            TypeTag::String => Value::String(encoded.as_string()?),
            TypeTag::Number => Value::Number(encoded.as_number()?),
            TypeTag::Date => Value::Date(encoded.as_date()?),
            TypeTag::Object => Value::Object(
                encoded
                    .object_entries()?
                    .into_iter()
                    .map(|(name, v)| Ok((name, self.decode(&v)?)))
                    .collect::<RuntimeResult<_>>()?,
            ),
            TypeTag::Array => Value::Array(self.decode_items(encoded)?),
            TypeTag::Set => Value::Set(self.decode_items(encoded)?),
            TypeTag::Map => Value::Map(self.decode_map(encoded)?),
            TypeTag::RecordRef => Value::Record(self.record(&encoded.as_reference()?, true)?),
            TypeTag::SessionRef => Value::Session(self.session(&encoded.as_reference()?)?),
            TypeTag::CallableRef => Value::Callable(self.callable(&encoded.as_reference()?)?),
        })
    }

    /// Decodes a record or callable reference naming an event source.
    pub fn decode_source(&mut self, encoded: &EncodedValue) -> RuntimeResult<Instance> {
        match self.decode(encoded)? {
            Value::Record(i) | Value::Callable(i) => Ok(i),
            other => Err(RuntimeError::UnsupportedValueType(format!(
                "event source must be a record or callable, got {}",
                other.type_name()
            ))),
        }
    }

    fn decode_items(&mut self, encoded: &EncodedValue) -> RuntimeResult<Vec<Value>> {
        encoded
            .list_items()?
            .iter()
            .map(|item| self.decode(item))
            .collect()
    }

    fn decode_map(&mut self, encoded: &EncodedValue) -> RuntimeResult<SharedMap> {
        let map = SharedMap::new();
        for (k, v) in encoded.map_pairs()? {
            let key = self.decode_entry_side(&k)?;
            let value = self.decode_entry_side(&v)?;
            let key_pending = self.unresolved(&key);
            let value_pending = self.unresolved(&value);

            let pending: Vec<InstanceKey> = [(&key, key_pending), (&value, value_pending)]
                .into_iter()
                .filter(|(_, pending)| *pending)
                .filter_map(|(v, _)| v.as_instance().map(|i| i.key().clone()))
                .collect();
            if pending.is_empty() {
                map.insert(key, value);
                continue;
            }

            let target = map.clone();
            self.tracker.resolve_then(
                pending,
                Box::new(move |resolved| {
                    let mut resolved = resolved.into_iter();
                    let key = if key_pending {
                        match resolved.next().flatten() {
                            Some(instance) => Value::Record(instance),
                            // The key record no longer exists.
                            None => return Ok(()),
                        }
                    } else {
                        key
                    };
                    let value = if value_pending {
                        resolved.next().flatten().map_or(Value::Null, Value::Record)
                    } else {
                        value
                    };
                    target.insert(key, value);
                    Ok(())
                }),
            );
        }
        Ok(map)
    }

    /// Decodes a map key or value; a top-level record reference is left for
    /// the entry's joint resolution instead of being queued on its own.
    fn decode_entry_side(&mut self, encoded: &EncodedValue) -> RuntimeResult<Value> {
        if encoded.tag == TypeTag::RecordRef {
            Ok(Value::Record(self.record(&encoded.as_reference()?, false)?))
        } else {
            self.decode(encoded)
        }
    }

    fn unresolved(&self, value: &Value) -> bool {
        match value {
            Value::Record(i) => self.state.identity().try_get_version(i).is_none(),
            _ => false,
        }
    }

    fn record(&mut self, payload: &ReferencePayload, queue: bool) -> RuntimeResult<Instance> {
        let key = self.state.registry().instance_key(
            ClassKind::Record,
            payload.class_id,
            payload.key.as_str(),
        )?;
        let instance = self.get_or_register(key)?;
        if queue && self.state.identity().try_get_version(&instance).is_none() {
            self.tracker.resolve(instance.key().clone());
        }
        Ok(instance)
    }

    fn callable(&mut self, payload: &ReferencePayload) -> RuntimeResult<Instance> {
        let key = self.state.registry().instance_key(
            ClassKind::Callable,
            payload.class_id,
            payload.key.as_str(),
        )?;
        self.get_or_register(key)
    }

    fn session(&mut self, payload: &ReferencePayload) -> RuntimeResult<Instance> {
        let key = self.state.registry().instance_key(
            ClassKind::Session,
            payload.class_id,
            payload.key.as_str(),
        )?;
        self.state.registry().create_instance(key)
    }

    fn get_or_register(&self, key: InstanceKey) -> RuntimeResult<Instance> {
        if let Some(instance) = self.state.identity().try_get_instance(&key) {
            return Ok(instance);
        }
        let instance = self.state.registry().create_instance(key)?;
        self.state.identity().set_instance(&instance)?;
        Ok(instance)
    }
}

/// Encodes the values of one request and collects the records they reach.
pub struct RequestEncoder<'a> {
    state: &'a RuntimeState,
    queued: HashSet<InstanceKey>,
    worklist: VecDeque<Instance>,
}

impl<'a> RequestEncoder<'a> {
    /// Creates an encoder.
    pub fn new(state: &'a RuntimeState) -> Self {
        Self {
            state,
            queued: HashSet::new(),
            worklist: VecDeque::new(),
        }
    }

    /// Encodes one value. Records it references are queued for
    /// [`finish`](Self::finish).
    pub fn encode(&mut self, value: &Value) -> RuntimeResult<EncodedValue> {
        Ok(match value {
            Value::Undefined => EncodedValue::undefined(),
            Value::Null => EncodedValue::null(),
            Value::Bool(b) => EncodedValue::boolean(*b),
            Value::String(s) => EncodedValue::string(s),
            Value::Number(n) => EncodedValue::number(*n),
            Value::Date(millis) => EncodedValue::date(*millis),
            Value::Object(entries) => EncodedValue::object(
                entries
                    .iter()
                    .map(|(name, v)| Ok((name.clone(), self.encode(v)?)))
                    .collect::<RuntimeResult<Vec<_>>>()?,
            ),
            Value::Array(items) => EncodedValue::array(self.encode_all(items)?),
            Value::Set(items) => EncodedValue::set(self.encode_all(items)?),
            Value::Map(map) => EncodedValue::map(
                map.entries()
                    .iter()
                    .map(|(k, v)| Ok((self.encode(k)?, self.encode(v)?)))
                    .collect::<RuntimeResult<Vec<_>>>()?,
            ),
            Value::Record(instance) => {
                self.include(instance)?;
                self.reference(TypeTag::RecordRef, ClassKind::Record, instance)?
            }
            Value::Session(instance) => {
                self.reference(TypeTag::SessionRef, ClassKind::Session, instance)?
            }
            Value::Callable(instance) => {
                self.reference(TypeTag::CallableRef, ClassKind::Callable, instance)?
            }
        })
    }

    /// Queues a record for serialization even if no value references it.
    pub fn include(&mut self, instance: &Instance) -> RuntimeResult<()> {
        self.check_reference(ClassKind::Record, instance)?;
        if self.queued.insert(instance.key().clone()) {
            self.worklist.push_back(instance.clone());
        }
        Ok(())
    }

    /// Serializes every queued record, following references until none are
    /// left, and returns their full snapshots.
    pub fn finish(mut self) -> RuntimeResult<Vec<DeltaData>> {
        let mut deltas = Vec::new();
        while let Some(instance) = self.worklist.pop_front() {
            let properties = instance
                .snapshot()
                .iter()
                .map(|(name, v)| Ok(Property::new(name, self.encode(v)?)))
                .collect::<RuntimeResult<Vec<_>>>()?;
            let version = self
                .state
                .identity()
                .try_get_version(&instance)
                .unwrap_or(0);
            deltas.push(DeltaData::update(
                instance.class_id(),
                instance.primary_key(),
                version,
                properties,
            ));
        }
        Ok(deltas)
    }

    fn encode_all(&mut self, items: &[Value]) -> RuntimeResult<Vec<EncodedValue>> {
        items.iter().map(|v| self.encode(v)).collect()
    }

    fn reference(
        &self,
        tag: TypeTag,
        kind: ClassKind,
        instance: &Instance,
    ) -> RuntimeResult<EncodedValue> {
        self.check_reference(kind, instance)?;
        Ok(EncodedValue::reference(
            tag,
            instance.class_id(),
            instance.primary_key(),
        )?)
    }

    fn check_reference(&self, kind: ClassKind, instance: &Instance) -> RuntimeResult<()> {
        if instance.kind() != kind {
            return Err(RuntimeError::UnsupportedValueType(format!(
                "{} instance {} in a {kind} position",
                instance.kind(),
                instance.key()
            )));
        }
        if instance.key().service() != self.state.service() {
            return Err(RuntimeError::validation(format!(
                "{} belongs to another service than {}",
                instance.key(),
                self.state.service()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::PropertyBag;
    use crate::keys::ServiceIdentity;
    use crate::registry::ClassRegistry;

    fn state() -> RuntimeState {
        let registry = ClassRegistry::builder(ServiceIdentity::new("svc", "v1"))
            .record("User", 5)
            .unwrap()
            .session("Chat", 2)
            .unwrap()
            .callable("Api", 1)
            .unwrap()
            .event("Ping", 9)
            .unwrap()
            .build();
        RuntimeState::new(registry)
    }

    fn record(state: &RuntimeState, pk: &str, version: u64) -> Instance {
        let key = state
            .registry()
            .instance_key(ClassKind::Record, 5, pk)
            .unwrap();
        let instance = state.registry().create_instance(key).unwrap();
        state.identity().set_instance(&instance).unwrap();
        state.identity().set_version(&instance, version);
        instance
    }

    fn round_trip(state: &RuntimeState, value: &Value) -> (Value, Tracker) {
        let mut encoder = RequestEncoder::new(state);
        let encoded = encoder.encode(value).unwrap();
        let mut tracker = Tracker::new();
        let decoded = ValueDecoder::new(state, &mut tracker).decode(&encoded).unwrap();
        (decoded, tracker)
    }

    #[test]
    fn nested_values_round_trip() {
        let state = state();
        let value = Value::object([
            ("when", Value::Date(1_700_000_000_000)),
            ("tags", Value::set([Value::from("a"), Value::from("b")])),
            (
                "lookup",
                Value::map([
                    (Value::Array(vec![Value::from(1)]), Value::from(true)),
                    (Value::from("k"), Value::Null),
                ]),
            ),
            ("list", Value::Array(vec![Value::Undefined, Value::from(0.5)])),
        ]);
        let (decoded, tracker) = round_trip(&state, &value);
        assert_eq!(decoded, value);
        assert!(tracker.is_empty());
    }

    #[test]
    fn cached_record_reference_yields_live_instance() {
        let state = state();
        let user = record(&state, "u1", 3);
        let (decoded, tracker) = round_trip(&state, &Value::Array(vec![Value::from(user.clone())]));
        assert_eq!(decoded, Value::Array(vec![Value::Record(user)]));
        assert!(tracker.is_empty());
    }

    #[test]
    fn unknown_record_reference_is_bare_and_queued() {
        let state = state();
        let encoded = EncodedValue::array(vec![
            EncodedValue::reference(TypeTag::RecordRef, 5, "u9").unwrap(),
        ]);
        let mut tracker = Tracker::new();
        let decoded = ValueDecoder::new(&state, &mut tracker).decode(&encoded).unwrap();

        let instance = decoded.as_array().unwrap()[0].as_instance().unwrap().clone();
        assert_eq!(instance.primary_key(), "u9");
        assert!(instance.view().is_empty());
        assert_eq!(state.identity().try_get_instance(instance.key()), Some(instance.clone()));
        assert!(tracker.is_resolution_pending(instance.key()));
    }

    #[test]
    fn session_and_callable_references() {
        let state = state();
        let encoded = EncodedValue::array(vec![
            EncodedValue::reference(TypeTag::SessionRef, 2, "s-1").unwrap(),
            EncodedValue::reference(TypeTag::CallableRef, 1, "api").unwrap(),
        ]);
        let mut tracker = Tracker::new();
        let decoded = ValueDecoder::new(&state, &mut tracker).decode(&encoded).unwrap();
        let items = decoded.as_array().unwrap();

        let session = items[0].as_instance().unwrap();
        assert_eq!(session.kind(), ClassKind::Session);
        assert!(state.identity().try_get_instance(session.key()).is_none());

        let callable = items[1].as_instance().unwrap();
        assert_eq!(state.identity().try_get_instance(callable.key()).as_ref(), Some(callable));
        assert!(tracker.is_empty());
    }

    #[test]
    fn map_entry_with_unresolved_references_is_deferred() {
        let state = state();
        let encoded = EncodedValue::map(vec![
            (
                EncodedValue::reference(TypeTag::RecordRef, 5, "k").unwrap(),
                EncodedValue::reference(TypeTag::RecordRef, 5, "v").unwrap(),
            ),
            (EncodedValue::string("plain"), EncodedValue::number(1.0)),
        ]);
        let mut tracker = Tracker::new();
        let decoded = ValueDecoder::new(&state, &mut tracker).decode(&encoded).unwrap();
        let map = decoded.as_map().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(tracker.pending_resolutions(), 1);
    }

    #[test]
    fn referenced_records_are_collected_once() {
        let state = state();
        let a = record(&state, "a", 2);
        let b = record(&state, "b", 7);
        // a → b → a, plus a second path to b.
        a.view().set("friend", b.clone());
        b.view().set("friend", a.clone());
        a.view().set("also", Value::Array(vec![Value::from(b.clone())]));

        let mut encoder = RequestEncoder::new(&state);
        encoder.encode(&Value::from(a.clone())).unwrap();
        let deltas = encoder.finish().unwrap();

        let keys: Vec<(&str, u64)> = deltas
            .iter()
            .map(|d| (d.primary_key.as_str(), d.version))
            .collect();
        assert_eq!(keys, vec![("a", 2), ("b", 7)]);
        assert_eq!(deltas[0].changed_properties.len(), 2);
    }

    #[test]
    fn local_record_has_version_zero() {
        let state = state();
        let key = state
            .registry()
            .instance_key(ClassKind::Record, 5, "new")
            .unwrap();
        let local = state.registry().create_instance(key).unwrap();
        local.replace_properties(PropertyBag::from_iter([("n", Value::from(1))]));

        let mut encoder = RequestEncoder::new(&state);
        encoder.include(&local).unwrap();
        let deltas = encoder.finish().unwrap();
        assert_eq!(deltas[0].version, 0);
    }

    #[test]
    fn foreign_and_misplaced_instances_are_rejected() {
        let state = state();
        let other = ClassRegistry::builder(ServiceIdentity::new("other", "v1"))
            .record("User", 5)
            .unwrap()
            .build();
        let foreign = other
            .create_instance(other.instance_key(ClassKind::Record, 5, "u1").unwrap())
            .unwrap();
        let mut encoder = RequestEncoder::new(&state);
        assert!(matches!(
            encoder.encode(&Value::Record(foreign)),
            Err(RuntimeError::LocalValidation(_))
        ));

        let callable = state
            .registry()
            .create_instance(state.registry().instance_key(ClassKind::Callable, 1, "api").unwrap())
            .unwrap();
        assert!(matches!(
            encoder.encode(&Value::Record(callable)),
            Err(RuntimeError::UnsupportedValueType(_))
        ));
    }

    #[test]
    fn unknown_class_id_fails_decoding() {
        let state = state();
        let mut tracker = Tracker::new();
        let encoded = EncodedValue::reference(TypeTag::RecordRef, 77, "x").unwrap();
        assert!(matches!(
            ValueDecoder::new(&state, &mut tracker).decode(&encoded),
            Err(RuntimeError::Registry(_))
        ));
    }

    fn nested_arrays(levels: usize) -> EncodedValue {
        let mut encoded = EncodedValue::null();
        for _ in 0..levels {
            encoded = EncodedValue::array([encoded]);
        }
        encoded
    }

    #[test]
    fn nesting_past_the_limit_is_rejected() {
        let state = state();
        let mut tracker = Tracker::new();
        let mut decoder = ValueDecoder::new(&state, &mut tracker);
        assert!(matches!(
            decoder.decode(&nested_arrays(2_000)),
            Err(RuntimeError::Codec(CodecError::TooDeep {
                max_depth: MAX_VALUE_DEPTH
            }))
        ));

        // The failure leaves the decoder usable.
        let decoded = decoder.decode(&nested_arrays(MAX_VALUE_DEPTH - 1)).unwrap();
        let mut depth = 0;
        let mut current = &decoded;
        while let Value::Array(items) = current {
            depth += 1;
            current = &items[0];
        }
        assert_eq!(depth, MAX_VALUE_DEPTH - 1);
        assert_eq!(*current, Value::Null);
    }
}
