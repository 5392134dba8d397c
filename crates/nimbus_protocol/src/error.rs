//! Error types for the protocol crate.

use nimbus_codec::CodecError;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing or parsing protocol messages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Underlying value codec failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A frame with no bytes at all.
    #[error("empty frame")]
    EmptyFrame,

    /// A frame shorter than its header, or whose length field disagrees
    /// with the bytes present.
    #[error("malformed frame: {message}")]
    MalformedFrame {
        /// What was wrong.
        message: String,
    },

    /// Frame length above the configured maximum.
    #[error("frame too large: {len} bytes, max {max}")]
    FrameTooLarge {
        /// Length of the offending frame.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Inbound frame kind byte is neither Response nor Message.
    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    /// Request kind code not recognized.
    #[error("unknown request kind {0}")]
    UnknownRequestKind(u64),

    /// Server message kind code not recognized.
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u64),

    /// Required envelope field absent.
    #[error("{context}: missing field `{field}`")]
    MissingField {
        /// Structure being decoded.
        context: &'static str,
        /// Field name.
        field: &'static str,
    },

    /// Envelope field present with the wrong shape.
    #[error("{context}: field `{field}` is not {expected}")]
    InvalidField {
        /// Structure being decoded.
        context: &'static str,
        /// Field name.
        field: &'static str,
        /// Expected shape.
        expected: &'static str,
    },

    /// A structure that should be a map was something else.
    #[error("{context}: expected a map")]
    NotAMap {
        /// Structure being decoded.
        context: &'static str,
    },

    /// A response body carrying more than one outcome.
    #[error("response carries more than one outcome")]
    AmbiguousResponse,

    /// A response body carrying no outcome.
    #[error("response carries no outcome")]
    EmptyResponse,

    /// Peer speaks a different protocol version.
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch {
        /// Local protocol version.
        local: u16,
        /// Remote protocol version.
        remote: u16,
    },
}

impl ProtocolError {
    /// Creates a malformed frame error.
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }
}
