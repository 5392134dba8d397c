//! Property tests for value encoding and version reconciliation.

use nimbus_protocol::DeltaData;
use nimbus_runtime::{
    ClassKind, Instance, Reconciled, Reconciler, RequestEncoder, RuntimeState, Tracker, Value,
    ValueDecoder,
};
use nimbus_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn user(state: &RuntimeState, primary_key: &str) -> Instance {
    let key = state
        .registry()
        .instance_key(ClassKind::Record, USER_CLASS, primary_key)
        .unwrap();
    if let Some(existing) = state.identity().try_get_instance(&key) {
        return existing;
    }
    let instance = state.registry().create_instance(key).unwrap();
    state.identity().set_instance(&instance).unwrap();
    state.identity().set_version(&instance, 1);
    instance
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn values_with_references_survive_encoding(
        value in value_strategy(),
        keys in prop::collection::vec(primary_key_strategy(), 1..4),
    ) {
        let state = RuntimeState::new(registry());
        let users: Vec<Instance> = keys.iter().map(|pk| user(&state, pk)).collect();
        for u in &users {
            u.view().set("name", u.primary_key().to_string());
        }
        let original = Value::Array(vec![
            value,
            Value::Array(users.iter().cloned().map(Value::from).collect()),
            Value::object([("first", Value::from(users[0].clone()))]),
        ]);

        let mut encoder = RequestEncoder::new(&state);
        let encoded = encoder.encode(&original).unwrap();
        let deltas = encoder.finish().unwrap();
        let distinct: BTreeSet<&String> = keys.iter().collect();
        prop_assert_eq!(deltas.len(), distinct.len());

        let mut tracker = Tracker::new();
        let decoded = ValueDecoder::new(&state, &mut tracker)
            .decode(&encoded)
            .unwrap();
        prop_assert_eq!(&decoded, &original);
        prop_assert_eq!(tracker.pending_resolutions(), 0);
    }

    #[test]
    fn cached_versions_only_advance_by_one(versions in prop::collection::vec(1u64..6, 1..24)) {
        let state = RuntimeState::new(registry());
        let reconciler = Reconciler::new(&state);
        let key = state
            .registry()
            .instance_key(ClassKind::Record, USER_CLASS, "u1")
            .unwrap();
        let mut alive = Vec::new();
        let mut known: Option<u64> = None;

        for version in versions {
            let mut tracker = Tracker::new();
            let delta = DeltaData::update(USER_CLASS, "u1", version, vec![text("v", "x")]);
            let outcome = reconciler.apply_delta(&delta, &mut tracker).unwrap();
            match (known, outcome) {
                (None, Reconciled::Created(instance)) => {
                    prop_assert_eq!(version, 1);
                    alive.push(instance);
                    known = Some(1);
                }
                (Some(k), Reconciled::Updated(_)) => {
                    prop_assert_eq!(version, k + 1);
                    known = Some(version);
                }
                (_, Reconciled::Resync) => {
                    prop_assert!(known.map_or(version != 1, |k| version != k + 1));
                    prop_assert!(tracker.is_resolution_pending(&key));
                    known = None;
                }
                (k, other) => prop_assert!(false, "unexpected {:?} at {:?}", other, k),
            }
            let cached = state
                .identity()
                .try_get_instance(&key)
                .and_then(|i| state.identity().try_get_version(&i));
            prop_assert_eq!(cached, known);
        }
    }
}
