//! Property-based test generators using proptest.
//!
//! Values are reference-free; tests splice references in themselves since
//! those need a live runtime state.

use nimbus_runtime::Value;
use proptest::prelude::*;

/// Strategy for leaf values.
pub fn leaf_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Undefined),
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::String),
        (-1_000_000i64..1_000_000).prop_map(|n| Value::Number(n as f64)),
        (-1.0e9f64..1.0e9).prop_map(Value::Number),
        (0i64..4_102_444_800_000).prop_map(Value::Date),
    ]
}

/// Strategy for nested values: arrays, objects, maps and sets over leaves.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    leaf_value_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", inner.clone()), 0..4).prop_map(|entries| {
                let mut seen = std::collections::HashSet::new();
                Value::object(entries.into_iter().filter(|(k, _)| seen.insert(k.clone())))
            }),
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::set),
            prop::collection::vec((inner.clone(), inner), 0..4).prop_map(Value::map),
        ]
    })
}

/// Strategy for record primary keys.
pub fn primary_key_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}"
}
