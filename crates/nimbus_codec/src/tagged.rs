//! Tagged-union value encoding.
//!
//! Every dynamic value travels as a `(TypeTag, bytes)` pair. Primitive
//! payloads are single wire values; composite payloads are wire arrays of
//! nested `(tag, bytes)` pairs, so a receiver can walk a container without
//! knowing anything about the values inside it.
//!
//! ```text
//! Object    [[name, tag, bytes], ...]
//! Array     [[tag, bytes], ...]
//! Set       [[tag, bytes], ...]
//! Map       [[key_tag, key_bytes, value_tag, value_bytes], ...]
//! *Ref      [class_id, key]
//! ```

use crate::decoder::from_wire_bytes;
use crate::encoder::to_wire_bytes;
use crate::error::{CodecError, CodecResult};
use crate::value::WireValue;

/// Largest integer magnitude a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// The kind of a tagged value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    /// No value at all.
    Undefined = 0,
    /// Explicit null.
    Null = 1,
    /// Boolean.
    Boolean = 2,
    /// UTF-8 string.
    String = 3,
    /// Double-precision number.
    Number = 4,
    /// Milliseconds since the Unix epoch.
    Date = 5,
    /// Ordered name → value bag.
    Object = 6,
    /// Index → value list.
    Array = 7,
    /// Ordered key/value pairs with arbitrary keys.
    Map = 8,
    /// Ordered unique items.
    Set = 9,
    /// Reference to a versioned record.
    RecordRef = 10,
    /// Reference to a session handle.
    SessionRef = 11,
    /// Reference to a callable object.
    CallableRef = 12,
}

impl TypeTag {
    /// Numeric code written on the wire.
    pub fn to_code(self) -> u8 {
        self as u8
    }

    /// Parses a wire code.
    pub fn from_code(code: u8) -> CodecResult<Self> {
        Ok(match code {
            0 => TypeTag::Undefined,
            1 => TypeTag::Null,
            2 => TypeTag::Boolean,
            3 => TypeTag::String,
            4 => TypeTag::Number,
            5 => TypeTag::Date,
            6 => TypeTag::Object,
            7 => TypeTag::Array,
            8 => TypeTag::Map,
            9 => TypeTag::Set,
            10 => TypeTag::RecordRef,
            11 => TypeTag::SessionRef,
            12 => TypeTag::CallableRef,
            other => return Err(CodecError::UnknownTypeTag(other)),
        })
    }

    /// Returns true for the three reference kinds.
    pub fn is_reference(self) -> bool {
        matches!(
            self,
            TypeTag::RecordRef | TypeTag::SessionRef | TypeTag::CallableRef
        )
    }
}

/// A value in its `(tag, bytes)` wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedValue {
    /// What the bytes hold.
    pub tag: TypeTag,
    /// Tag-specific payload.
    pub bytes: Vec<u8>,
}

/// The class and key carried by a reference payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencePayload {
    /// Service-scoped class identifier.
    pub class_id: u32,
    /// Primary key or session id.
    pub key: String,
}

impl EncodedValue {
    /// Creates an encoded value from raw parts.
    pub fn new(tag: TypeTag, bytes: Vec<u8>) -> Self {
        Self { tag, bytes }
    }

    /// The undefined value.
    pub fn undefined() -> Self {
        Self::new(TypeTag::Undefined, Vec::new())
    }

    /// The null value.
    pub fn null() -> Self {
        Self::new(TypeTag::Null, Vec::new())
    }

    /// A boolean.
    pub fn boolean(b: bool) -> Self {
        Self::new(TypeTag::Boolean, to_wire_bytes(&WireValue::Bool(b)))
    }

    /// A string.
    pub fn string(s: &str) -> Self {
        Self::new(TypeTag::String, to_wire_bytes(&WireValue::from(s)))
    }

    /// A number. Integral values within the exact range of a double are
    /// written as integers; negative zero stays a float to keep its sign.
    #[allow(clippy::cast_possible_truncation)]
    pub fn number(n: f64) -> Self {
        let negative_zero = n == 0.0 && n.is_sign_negative();
        let wire = if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER && !negative_zero {
            WireValue::Integer(n as i64)
        } else {
            WireValue::Float(n)
        };
        Self::new(TypeTag::Number, to_wire_bytes(&wire))
    }

    /// A date as epoch milliseconds.
    pub fn date(epoch_millis: i64) -> Self {
        Self::new(TypeTag::Date, to_wire_bytes(&WireValue::Integer(epoch_millis)))
    }

    /// An object from ordered named entries.
    pub fn object<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, EncodedValue)>,
    {
        let items = entries
            .into_iter()
            .map(|(name, value)| {
                WireValue::Array(vec![
                    WireValue::Text(name),
                    WireValue::from(value.tag.to_code()),
                    WireValue::Bytes(value.bytes),
                ])
            })
            .collect();
        Self::new(TypeTag::Object, to_wire_bytes(&WireValue::Array(items)))
    }

    /// An array from items.
    pub fn array<I: IntoIterator<Item = EncodedValue>>(items: I) -> Self {
        Self::new(TypeTag::Array, pack_list(items))
    }

    /// A set from items, already deduplicated by the caller.
    pub fn set<I: IntoIterator<Item = EncodedValue>>(items: I) -> Self {
        Self::new(TypeTag::Set, pack_list(items))
    }

    /// A map from key/value pairs.
    pub fn map<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (EncodedValue, EncodedValue)>,
    {
        let items = pairs
            .into_iter()
            .map(|(k, v)| {
                WireValue::Array(vec![
                    WireValue::from(k.tag.to_code()),
                    WireValue::Bytes(k.bytes),
                    WireValue::from(v.tag.to_code()),
                    WireValue::Bytes(v.bytes),
                ])
            })
            .collect();
        Self::new(TypeTag::Map, to_wire_bytes(&WireValue::Array(items)))
    }

    /// A reference of the given kind.
    ///
    /// # Errors
    ///
    /// Fails if `tag` is not a reference tag.
    pub fn reference(tag: TypeTag, class_id: u32, key: &str) -> CodecResult<Self> {
        if !tag.is_reference() {
            return Err(CodecError::encoding_failed(format!(
                "{tag:?} is not a reference tag"
            )));
        }
        let wire = WireValue::Array(vec![WireValue::from(class_id), WireValue::from(key)]);
        Ok(Self::new(tag, to_wire_bytes(&wire)))
    }

    /// Wraps this value as a two-element wire array `[tag, bytes]`.
    pub fn to_wire(&self) -> WireValue {
        WireValue::Array(vec![
            WireValue::from(self.tag.to_code()),
            WireValue::Bytes(self.bytes.clone()),
        ])
    }

    /// Parses a `[tag, bytes]` wire array.
    pub fn from_wire(value: &WireValue) -> CodecResult<Self> {
        match value.as_array() {
            Some([tag, bytes]) => Ok(Self::new(parse_tag(tag)?, expect_bytes(bytes)?.to_vec())),
            _ => Err(CodecError::invalid_structure("expected [tag, bytes]")),
        }
    }

    /// Reads a boolean payload.
    pub fn as_boolean(&self) -> CodecResult<bool> {
        self.expect_tag(TypeTag::Boolean)?;
        from_wire_bytes(&self.bytes)?
            .as_bool()
            .ok_or_else(|| CodecError::invalid_structure("boolean payload"))
    }

    /// Reads a string payload.
    pub fn as_string(&self) -> CodecResult<String> {
        self.expect_tag(TypeTag::String)?;
        match from_wire_bytes(&self.bytes)? {
            WireValue::Text(s) => Ok(s),
            other => Err(mismatch("text", &other)),
        }
    }

    /// Reads a number payload.
    pub fn as_number(&self) -> CodecResult<f64> {
        self.expect_tag(TypeTag::Number)?;
        let wire = from_wire_bytes(&self.bytes)?;
        wire.as_float().ok_or_else(|| mismatch("number", &wire))
    }

    /// Reads a date payload.
    pub fn as_date(&self) -> CodecResult<i64> {
        self.expect_tag(TypeTag::Date)?;
        let wire = from_wire_bytes(&self.bytes)?;
        wire.as_integer().ok_or_else(|| mismatch("integer", &wire))
    }

    /// Reads object entries in order.
    pub fn object_entries(&self) -> CodecResult<Vec<(String, EncodedValue)>> {
        self.expect_tag(TypeTag::Object)?;
        unpack_items(&self.bytes)?
            .iter()
            .map(|item| match item.as_array() {
                Some([WireValue::Text(name), tag, bytes]) => Ok((
                    name.clone(),
                    EncodedValue::new(parse_tag(tag)?, expect_bytes(bytes)?.to_vec()),
                )),
                _ => Err(CodecError::invalid_structure(
                    "object entry must be [name, tag, bytes]",
                )),
            })
            .collect()
    }

    /// Reads array or set items in order.
    pub fn list_items(&self) -> CodecResult<Vec<EncodedValue>> {
        if !matches!(self.tag, TypeTag::Array | TypeTag::Set) {
            return Err(CodecError::invalid_structure(format!(
                "expected array or set, got {:?}",
                self.tag
            )));
        }
        unpack_items(&self.bytes)?
            .iter()
            .map(EncodedValue::from_wire)
            .collect()
    }

    /// Reads map pairs in order.
    pub fn map_pairs(&self) -> CodecResult<Vec<(EncodedValue, EncodedValue)>> {
        self.expect_tag(TypeTag::Map)?;
        unpack_items(&self.bytes)?
            .iter()
            .map(|item| match item.as_array() {
                Some([kt, kb, vt, vb]) => Ok((
                    EncodedValue::new(parse_tag(kt)?, expect_bytes(kb)?.to_vec()),
                    EncodedValue::new(parse_tag(vt)?, expect_bytes(vb)?.to_vec()),
                )),
                _ => Err(CodecError::invalid_structure(
                    "map entry must be [key_tag, key_bytes, value_tag, value_bytes]",
                )),
            })
            .collect()
    }

    /// Reads a reference payload of any reference kind.
    pub fn as_reference(&self) -> CodecResult<ReferencePayload> {
        if !self.tag.is_reference() {
            return Err(CodecError::invalid_structure(format!(
                "expected reference, got {:?}",
                self.tag
            )));
        }
        let wire = from_wire_bytes(&self.bytes)?;
        match wire.as_array() {
            Some([class_id, WireValue::Text(key)]) => {
                let class_id = class_id
                    .as_unsigned()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| CodecError::invalid_structure("reference class id"))?;
                Ok(ReferencePayload {
                    class_id,
                    key: key.clone(),
                })
            }
            _ => Err(CodecError::invalid_structure(
                "reference must be [class_id, key]",
            )),
        }
    }

    fn expect_tag(&self, expected: TypeTag) -> CodecResult<()> {
        if self.tag == expected {
            Ok(())
        } else {
            Err(CodecError::invalid_structure(format!(
                "expected {expected:?}, got {:?}",
                self.tag
            )))
        }
    }
}

fn pack_list<I: IntoIterator<Item = EncodedValue>>(items: I) -> Vec<u8> {
    let items = items.into_iter().map(|v| v.to_wire()).collect();
    to_wire_bytes(&WireValue::Array(items))
}

fn unpack_items(bytes: &[u8]) -> CodecResult<Vec<WireValue>> {
    match from_wire_bytes(bytes)? {
        WireValue::Array(items) => Ok(items),
        other => Err(mismatch("array", &other)),
    }
}

fn parse_tag(value: &WireValue) -> CodecResult<TypeTag> {
    let code = value
        .as_unsigned()
        .and_then(|n| u8::try_from(n).ok())
        .ok_or_else(|| CodecError::invalid_structure("type tag must be a small integer"))?;
    TypeTag::from_code(code)
}

fn expect_bytes(value: &WireValue) -> CodecResult<&[u8]> {
    value.as_bytes().ok_or_else(|| mismatch("bytes", value))
}

fn mismatch(expected: &str, got: &WireValue) -> CodecError {
    CodecError::invalid_structure(format!("expected {expected}, got {}", got.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_codes_round_trip() {
        for code in 0..=12u8 {
            assert_eq!(TypeTag::from_code(code).unwrap().to_code(), code);
        }
        assert_eq!(TypeTag::from_code(13), Err(CodecError::UnknownTypeTag(13)));
    }

    #[test]
    fn integral_numbers_use_integer_payload() {
        let encoded = EncodedValue::number(42.0);
        assert_eq!(encoded.bytes, vec![0x18, 42]);
        assert_eq!(encoded.as_number().unwrap(), 42.0);

        let encoded = EncodedValue::number(0.25);
        assert_eq!(encoded.bytes[0], 0xfb);
        assert_eq!(encoded.as_number().unwrap(), 0.25);
    }

    #[test]
    fn negative_zero_keeps_its_sign() {
        let encoded = EncodedValue::number(-0.0);
        assert_eq!(encoded.bytes[0], 0xfb);
        assert!(encoded.as_number().unwrap().is_sign_negative());

        assert_eq!(EncodedValue::number(0.0).bytes, vec![0x00]);
    }

    #[test]
    fn object_entries_keep_order() {
        let object = EncodedValue::object(vec![
            ("b".to_string(), EncodedValue::boolean(true)),
            ("a".to_string(), EncodedValue::string("x")),
        ]);
        let entries = object.object_entries().unwrap();
        assert_eq!(entries[0].0, "b");
        assert!(entries[0].1.as_boolean().unwrap());
        assert_eq!(entries[1].0, "a");
        assert_eq!(entries[1].1.as_string().unwrap(), "x");
    }

    #[test]
    fn map_pairs_with_composite_keys() {
        let key = EncodedValue::array(vec![EncodedValue::number(1.0)]);
        let map = EncodedValue::map(vec![(key.clone(), EncodedValue::null())]);
        let pairs = map.map_pairs().unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, key);
        assert_eq!(pairs[0].1.tag, TypeTag::Null);
    }

    #[test]
    fn reference_payload() {
        let r = EncodedValue::reference(TypeTag::RecordRef, 5, "u1").unwrap();
        assert_eq!(
            r.as_reference().unwrap(),
            ReferencePayload {
                class_id: 5,
                key: "u1".into()
            }
        );
        assert!(EncodedValue::reference(TypeTag::Array, 5, "u1").is_err());
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let s = EncodedValue::string("x");
        assert!(s.as_number().is_err());
        assert!(s.list_items().is_err());
        assert!(s.as_reference().is_err());
    }
}
