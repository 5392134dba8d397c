//! Dynamic wire value type.

/// A value in the binary wire data model.
///
/// This is the structural layer underneath every envelope and every tagged
/// value payload. Maps keep insertion order; the encoder writes entries
/// exactly as given and the decoder preserves the order it reads.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// IEEE 754 double.
    Float(f64),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<WireValue>),
    /// Ordered key-value pairs.
    Map(Vec<(WireValue, WireValue)>),
}

impl WireValue {
    /// Builds a text-keyed map from `(name, value)` fields, keeping their order.
    pub fn fields<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, WireValue)>,
        K: Into<String>,
    {
        WireValue::Map(
            fields
                .into_iter()
                .map(|(k, v)| (WireValue::Text(k.into()), v))
                .collect(),
        )
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, WireValue::Null)
    }

    /// Boolean content.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            WireValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a non-negative integer.
    pub fn as_unsigned(&self) -> Option<u64> {
        self.as_integer().and_then(|n| u64::try_from(n).ok())
    }

    /// Get this value as a float. Integers widen.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            WireValue::Float(f) => Some(*f),
            WireValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Byte-string content.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Text content.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WireValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Array items.
    pub fn as_array(&self) -> Option<&[WireValue]> {
        match self {
            WireValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Map entries in wire order.
    pub fn as_map(&self) -> Option<&[(WireValue, WireValue)]> {
        match self {
            WireValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up a text key in this map value.
    pub fn get(&self, key: &str) -> Option<&WireValue> {
        self.as_map()?
            .iter()
            .find(|(k, _)| k.as_text() == Some(key))
            .map(|(_, v)| v)
    }

    /// Short name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            WireValue::Null => "null",
            WireValue::Bool(_) => "bool",
            WireValue::Integer(_) => "integer",
            WireValue::Float(_) => "float",
            WireValue::Bytes(_) => "bytes",
            WireValue::Text(_) => "text",
            WireValue::Array(_) => "array",
            WireValue::Map(_) => "map",
        }
    }
}

impl From<bool> for WireValue {
    fn from(b: bool) -> Self {
        WireValue::Bool(b)
    }
}

impl From<i64> for WireValue {
    fn from(n: i64) -> Self {
        WireValue::Integer(n)
    }
}

impl From<u32> for WireValue {
    fn from(n: u32) -> Self {
        WireValue::Integer(i64::from(n))
    }
}

impl From<u16> for WireValue {
    fn from(n: u16) -> Self {
        WireValue::Integer(i64::from(n))
    }
}

impl From<u8> for WireValue {
    fn from(n: u8) -> Self {
        WireValue::Integer(i64::from(n))
    }
}

impl From<f64> for WireValue {
    fn from(f: f64) -> Self {
        WireValue::Float(f)
    }
}

impl From<String> for WireValue {
    fn from(s: String) -> Self {
        WireValue::Text(s)
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::Text(s.to_string())
    }
}

impl From<Vec<u8>> for WireValue {
    fn from(b: Vec<u8>) -> Self {
        WireValue::Bytes(b)
    }
}

impl From<()> for WireValue {
    fn from((): ()) -> Self {
        WireValue::Null
    }
}
