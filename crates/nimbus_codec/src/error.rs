//! Codec errors.

use thiserror::Error;

/// Result alias used throughout the codec.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encoding and decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A value could not be put on the wire.
    #[error("cannot encode: {message}")]
    EncodingFailed {
        /// What went wrong.
        message: String,
    },

    /// Indefinite-length items are not part of the wire format.
    #[error("indefinite-length items are not supported")]
    IndefiniteLength,

    /// Text was not UTF-8.
    #[error("text is not valid UTF-8")]
    InvalidUtf8,

    /// Input ended inside a value.
    #[error("input ended inside a value")]
    UnexpectedEof,

    /// Bytes were left over after a complete value was decoded.
    #[error("{remaining} trailing bytes after value")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },

    /// Well-formed bytes with the wrong shape.
    #[error("unexpected shape: {message}")]
    InvalidStructure {
        /// What was expected.
        message: String,
    },

    /// A construct the data model has no place for.
    #[error("unsupported construct: {type_name}")]
    UnsupportedType {
        /// The construct.
        type_name: String,
    },

    /// A type tag byte that names no known value kind.
    #[error("unknown type tag {0}")]
    UnknownTypeTag(u8),

    /// A length prefix exceeded the allowed maximum.
    #[error("size limit exceeded: claimed {claimed}, max {max_allowed}")]
    SizeLimitExceeded {
        /// Length claimed by the input.
        claimed: u64,
        /// Maximum accepted length.
        max_allowed: u64,
    },

    /// Containers nested deeper than the decoder accepts.
    #[error("nesting depth exceeds {max_depth}")]
    TooDeep {
        /// Maximum accepted depth.
        max_depth: usize,
    },
}

impl CodecError {
    /// An [`CodecError::EncodingFailed`].
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// An [`CodecError::InvalidStructure`].
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// An [`CodecError::UnsupportedType`].
    pub fn unsupported_type(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }
}
