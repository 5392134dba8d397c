//! Field access over decoded envelope maps.

use crate::error::{ProtocolError, ProtocolResult};
use nimbus_codec::{EncodedValue, WireValue};

/// A text-keyed wire map being decoded as `context`.
pub(crate) struct Fields<'a> {
    context: &'static str,
    map: &'a [(WireValue, WireValue)],
}

impl<'a> Fields<'a> {
    pub(crate) fn of(value: &'a WireValue, context: &'static str) -> ProtocolResult<Self> {
        let map = value.as_map().ok_or(ProtocolError::NotAMap { context })?;
        Ok(Self { context, map })
    }

    pub(crate) fn get(&self, field: &'static str) -> Option<&'a WireValue> {
        self.map
            .iter()
            .find(|(k, _)| k.as_text() == Some(field))
            .map(|(_, v)| v)
            .filter(|v| !v.is_null())
    }

    pub(crate) fn has(&self, field: &'static str) -> bool {
        self.get(field).is_some()
    }

    pub(crate) fn require(&self, field: &'static str) -> ProtocolResult<&'a WireValue> {
        self.get(field).ok_or(ProtocolError::MissingField {
            context: self.context,
            field,
        })
    }

    fn invalid(&self, field: &'static str, expected: &'static str) -> ProtocolError {
        ProtocolError::InvalidField {
            context: self.context,
            field,
            expected,
        }
    }

    pub(crate) fn text(&self, field: &'static str) -> ProtocolResult<String> {
        self.require(field)?
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| self.invalid(field, "text"))
    }

    pub(crate) fn unsigned(&self, field: &'static str) -> ProtocolResult<u64> {
        self.require(field)?
            .as_unsigned()
            .ok_or_else(|| self.invalid(field, "a non-negative integer"))
    }

    pub(crate) fn u32(&self, field: &'static str) -> ProtocolResult<u32> {
        u32::try_from(self.unsigned(field)?).map_err(|_| self.invalid(field, "a 32-bit integer"))
    }

    pub(crate) fn bool_or(&self, field: &'static str, default: bool) -> ProtocolResult<bool> {
        match self.get(field) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| self.invalid(field, "a boolean")),
        }
    }

    pub(crate) fn encoded(&self, field: &'static str) -> ProtocolResult<EncodedValue> {
        Ok(EncodedValue::from_wire(self.require(field)?)?)
    }

    /// Items of an optional array field; absent means empty.
    pub(crate) fn list(&self, field: &'static str) -> ProtocolResult<&'a [WireValue]> {
        match self.get(field) {
            None => Ok(&[]),
            Some(v) => v.as_array().ok_or_else(|| self.invalid(field, "an array")),
        }
    }

    pub(crate) fn text_list(&self, field: &'static str) -> ProtocolResult<Vec<String>> {
        self.list(field)?
            .iter()
            .map(|v| {
                v.as_text()
                    .map(str::to_string)
                    .ok_or_else(|| self.invalid(field, "an array of text"))
            })
            .collect()
    }
}
