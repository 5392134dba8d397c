//! # Nimbus Codec
//!
//! Binary value encoding for the Nimbus client runtime.
//!
//! Two layers live here:
//!
//! - [`WireValue`]: a small self-describing binary data model (null, bool,
//!   integer, double, bytes, text, array, map) used for every envelope on the
//!   wire.
//! - [`EncodedValue`]: the tagged-union form `(TypeTag, bytes)` in which
//!   dynamic application values travel, including composite containers and
//!   the three reference kinds.
//!
//! ## Usage
//!
//! ```
//! use nimbus_codec::{from_wire_bytes, to_wire_bytes, EncodedValue, TypeTag, WireValue};
//!
//! let value = WireValue::fields([("answer", WireValue::Integer(42))]);
//! let bytes = to_wire_bytes(&value);
//! assert_eq!(from_wire_bytes(&bytes).unwrap(), value);
//!
//! let tagged = EncodedValue::number(1.5);
//! assert_eq!(tagged.tag, TypeTag::Number);
//! assert_eq!(tagged.as_number().unwrap(), 1.5);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod tagged;
mod value;

pub use decoder::{from_wire_bytes, WireDecoder};
pub use encoder::{to_wire_bytes, WireEncoder};
pub use error::{CodecError, CodecResult};
pub use tagged::{EncodedValue, ReferencePayload, TypeTag};
pub use value::WireValue;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wire_value_strategy() -> impl Strategy<Value = WireValue> {
        let leaf = prop_oneof![
            Just(WireValue::Null),
            any::<bool>().prop_map(WireValue::Bool),
            any::<i64>().prop_map(WireValue::Integer),
            any::<f64>()
                .prop_filter("NaN never compares equal", |f| !f.is_nan())
                .prop_map(WireValue::Float),
            prop::collection::vec(any::<u8>(), 0..32).prop_map(WireValue::Bytes),
            "[a-zA-Z0-9 ]{0,24}".prop_map(WireValue::Text),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..8).prop_map(WireValue::Array),
                prop::collection::vec((inner.clone(), inner), 0..8).prop_map(WireValue::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn wire_values_survive_the_wire(value in wire_value_strategy()) {
            let bytes = to_wire_bytes(&value);
            prop_assert_eq!(from_wire_bytes(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn nested_envelope_shape() {
        let value = WireValue::fields([
            (
                "items",
                WireValue::Array(vec![
                    EncodedValue::string("a").to_wire(),
                    EncodedValue::boolean(false).to_wire(),
                ]),
            ),
            ("count", WireValue::Integer(2)),
        ]);
        let decoded = from_wire_bytes(&to_wire_bytes(&value)).unwrap();
        let items = decoded.get("items").and_then(WireValue::as_array).unwrap();
        assert_eq!(
            EncodedValue::from_wire(&items[0]).unwrap().as_string().unwrap(),
            "a"
        );
        assert_eq!(decoded.get("count"), Some(&WireValue::Integer(2)));
    }
}
