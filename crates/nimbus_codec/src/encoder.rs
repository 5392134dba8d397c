//! Wire encoder.

use crate::value::WireValue;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;

const FALSE: u8 = 0xf4;
const TRUE: u8 = 0xf5;
const NULL: u8 = 0xf6;
const DOUBLE: u8 = 0xfb;

/// Encodes `value` to wire bytes.
///
/// Heads take the shortest form, floats are always 64-bit, and map entries
/// keep the order they have in `value`.
pub fn to_wire_bytes(value: &WireValue) -> Vec<u8> {
    let mut encoder = WireEncoder::new();
    encoder.encode(value);
    encoder.into_bytes()
}

/// Appends wire values to a buffer.
#[derive(Debug, Default)]
pub struct WireEncoder {
    out: Vec<u8>,
}

impl WireEncoder {
    /// An empty encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one value.
    pub fn encode(&mut self, value: &WireValue) {
        match value {
            WireValue::Null => self.out.push(NULL),
            WireValue::Bool(false) => self.out.push(FALSE),
            WireValue::Bool(true) => self.out.push(TRUE),
            WireValue::Integer(n) if *n >= 0 => self.head(MAJOR_UNSIGNED, n.unsigned_abs()),
            // -1 travels as 0, -2 as 1, ...
            WireValue::Integer(n) => self.head(MAJOR_NEGATIVE, (n + 1).unsigned_abs()),
            WireValue::Float(f) => {
                self.out.push(DOUBLE);
                self.out.extend_from_slice(&f.to_be_bytes());
            }
            WireValue::Bytes(b) => self.blob(MAJOR_BYTES, b),
            WireValue::Text(s) => self.blob(MAJOR_TEXT, s.as_bytes()),
            WireValue::Array(items) => {
                self.head(MAJOR_ARRAY, items.len() as u64);
                items.iter().for_each(|item| self.encode(item));
            }
            WireValue::Map(pairs) => {
                self.head(MAJOR_MAP, pairs.len() as u64);
                for (key, value) in pairs {
                    self.encode(key);
                    self.encode(value);
                }
            }
        }
    }

    /// The bytes written so far.
    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }

    fn blob(&mut self, major: u8, bytes: &[u8]) {
        self.head(major, bytes.len() as u64);
        self.out.extend_from_slice(bytes);
    }

    fn head(&mut self, major: u8, arg: u64) {
        let major = major << 5;
        let be = arg.to_be_bytes();
        let (info, width) = match arg {
            0..=23 => (arg as u8, 0),
            24..=0xff => (24, 1),
            0x100..=0xffff => (25, 2),
            0x1_0000..=0xffff_ffff => (26, 4),
            _ => (27, 8),
        };
        self.out.push(major | info);
        self.out.extend_from_slice(&be[8 - width..]);
    }
}
