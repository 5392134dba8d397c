//! Wire decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::WireValue;

/// Decode exactly one value from wire bytes.
///
/// # Errors
///
/// Returns an error if the bytes are malformed, use unsupported constructs
/// (indefinite lengths, semantic tags), or contain trailing data.
pub fn from_wire_bytes(bytes: &[u8]) -> CodecResult<WireValue> {
    let mut decoder = WireDecoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// A streaming wire decoder over a borrowed buffer.
pub struct WireDecoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

/// Largest array or map length accepted.
const MAX_CONTAINER_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Largest byte or text string accepted.
const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Maximum container nesting.
const MAX_DEPTH: usize = 256;

impl<'a> WireDecoder<'a> {
    /// A decoder positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    /// Reads the next value.
    #[allow(clippy::cast_possible_wrap)]
    pub fn decode(&mut self) -> CodecResult<WireValue> {
        let lead = self.read_byte()?;
        let major = lead >> 5;
        let info = lead & 0x1f;

        match major {
            0 => {
                let n = self.decode_argument(info)?;
                i64::try_from(n)
                    .map(WireValue::Integer)
                    .map_err(|_| CodecError::invalid_structure("integer exceeds i64 range"))
            }
            1 => {
                let n = self.decode_argument(info)?;
                i64::try_from(n)
                    .map(|n| WireValue::Integer(-n - 1))
                    .map_err(|_| CodecError::invalid_structure("integer exceeds i64 range"))
            }
            2 => {
                let len = self.decode_length(info, MAX_BYTES_LENGTH)?;
                Ok(WireValue::Bytes(self.read_bytes(len)?.to_vec()))
            }
            3 => {
                let len = self.decode_length(info, MAX_BYTES_LENGTH)?;
                let bytes = self.read_bytes(len)?;
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(WireValue::Text(text.to_string()))
            }
            4 => {
                let len = self.decode_length(info, MAX_CONTAINER_ELEMENTS)?;
                self.enter()?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.decode()?);
                }
                self.depth -= 1;
                Ok(WireValue::Array(items))
            }
            5 => {
                let len = self.decode_length(info, MAX_CONTAINER_ELEMENTS)?;
                self.enter()?;
                let mut pairs = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = self.decode()?;
                    let value = self.decode()?;
                    pairs.push((key, value));
                }
                self.depth -= 1;
                Ok(WireValue::Map(pairs))
            }
            6 => Err(CodecError::unsupported_type("semantic tag")),
            _ => self.decode_simple(info),
        }
    }

    /// True once every byte has been read.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    fn enter(&mut self) -> CodecResult<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CodecError::TooDeep {
                max_depth: MAX_DEPTH,
            });
        }
        Ok(())
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(CodecError::UnexpectedEof)?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn decode_argument(&mut self, info: u8) -> CodecResult<u64> {
        match info {
            0..=23 => Ok(u64::from(info)),
            24 => Ok(u64::from(self.read_byte()?)),
            25 => Ok(u64::from(u16::from_be_bytes(self.read_array()?))),
            26 => Ok(u64::from(u32::from_be_bytes(self.read_array()?))),
            27 => Ok(u64::from_be_bytes(self.read_array()?)),
            31 => Err(CodecError::IndefiniteLength),
            _ => Err(CodecError::invalid_structure("reserved additional info")),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn decode_length(&mut self, info: u8, max_allowed: u64) -> CodecResult<usize> {
        let claimed = self.decode_argument(info)?;
        if claimed > max_allowed {
            return Err(CodecError::SizeLimitExceeded {
                claimed,
                max_allowed,
            });
        }
        Ok(claimed as usize)
    }

    fn decode_simple(&mut self, info: u8) -> CodecResult<WireValue> {
        match info {
            20 => Ok(WireValue::Bool(false)),
            21 => Ok(WireValue::Bool(true)),
            // undefined collapses to null at this layer
            22 | 23 => Ok(WireValue::Null),
            25 => {
                let bits = u16::from_be_bytes(self.read_array()?);
                Ok(WireValue::Float(half_to_f64(bits)))
            }
            26 => {
                let bits = u32::from_be_bytes(self.read_array()?);
                Ok(WireValue::Float(f64::from(f32::from_bits(bits))))
            }
            27 => {
                let bits = u64::from_be_bytes(self.read_array()?);
                Ok(WireValue::Float(f64::from_bits(bits)))
            }
            31 => Err(CodecError::invalid_structure("break without indefinite")),
            other => Err(CodecError::unsupported_type(format!(
                "simple value {other}"
            ))),
        }
    }
}

fn half_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f64::from(bits & 0x03ff);
    match exponent {
        0 => sign * mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => sign * f64::INFINITY,
        0x1f => f64::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    }
}
