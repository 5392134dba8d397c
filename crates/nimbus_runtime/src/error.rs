//! Error types for the runtime.

use crate::registry::RegistryError;
use nimbus_codec::CodecError;
use nimbus_protocol::ProtocolError;
use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Connection-level failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No open channel; requests are never queued.
    #[error("connection not ready")]
    NotReady,

    /// The connector could not establish a channel.
    #[error("connection refused: {reason}")]
    Refused {
        /// Why the connector gave up.
        reason: String,
    },

    /// The channel closed while the request was outstanding.
    #[error("connection closed")]
    Closed,
}

/// Stable machine codes carried by platform errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformErrorCode {
    /// Unrecognized or unspecified.
    Unknown,
    /// The addressed record or object does not exist.
    NotFound,
    /// A save raced with a newer version on the server.
    WriteConflict,
    /// The caller lacks permission.
    Forbidden,
    /// The request was rejected as malformed.
    InvalidRequest,
    /// The request named a service build the server does not host.
    ServiceMismatch,
    /// Credentials missing or invalid.
    Unauthenticated,
    /// Too many requests.
    RateLimited,
    /// Server-side failure.
    Internal,
}

impl PlatformErrorCode {
    /// Maps a wire code; unrecognized numbers become `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::NotFound,
            2 => Self::WriteConflict,
            3 => Self::Forbidden,
            4 => Self::InvalidRequest,
            5 => Self::ServiceMismatch,
            6 => Self::Unauthenticated,
            7 => Self::RateLimited,
            8 => Self::Internal,
            _ => Self::Unknown,
        }
    }

    /// The wire code.
    pub fn code(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::NotFound => 1,
            Self::WriteConflict => 2,
            Self::Forbidden => 3,
            Self::InvalidRequest => 4,
            Self::ServiceMismatch => 5,
            Self::Unauthenticated => 6,
            Self::RateLimited => 7,
            Self::Internal => 8,
        }
    }

    /// Stable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NotFound => "not-found",
            Self::WriteConflict => "write-conflict",
            Self::Forbidden => "forbidden",
            Self::InvalidRequest => "invalid-request",
            Self::ServiceMismatch => "service-mismatch",
            Self::Unauthenticated => "unauthenticated",
            Self::RateLimited => "rate-limited",
            Self::Internal => "internal",
        }
    }
}

/// Errors returned by runtime operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Channel not ready, refused, or closed.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Malformed frame or envelope.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The platform rejected the request.
    #[error("platform error {} ({raw_code}){}", .code.name(), detail(.message))]
    Platform {
        /// Decoded code.
        code: PlatformErrorCode,
        /// Code as received, kept for codes this build does not know.
        raw_code: u32,
        /// Optional detail.
        message: Option<String>,
    },

    /// Remote application code threw.
    #[error("script exception: {message}")]
    Script {
        /// Exception message.
        message: String,
        /// Remote stack trace.
        stack: String,
    },

    /// Rejected locally before anything was sent.
    #[error("validation failed: {0}")]
    LocalValidation(String),

    /// A value the codec cannot express.
    #[error("unsupported value type: {0}")]
    UnsupportedValueType(String),

    /// Class lookup or registration failure.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A different live instance already occupies the key.
    #[error("identity conflict at {key}")]
    IdentityConflict {
        /// Display form of the key.
        key: String,
    },

    /// A listener failed and aborted the drain.
    #[error("listener failed: {0}")]
    Listener(String),

    /// Tagged value failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

fn detail(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

impl RuntimeError {
    /// Creates a platform error from a wire code.
    pub fn platform(raw_code: u32, message: Option<String>) -> Self {
        Self::Platform {
            code: PlatformErrorCode::from_code(raw_code),
            raw_code,
            message,
        }
    }

    /// Creates a local validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::LocalValidation(message.into())
    }

    /// Returns true for connection-level failures.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RuntimeError::Connection(_))
    }

    /// Returns true if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Connection(_) => true,
            RuntimeError::Platform { code, .. } => matches!(
                code,
                PlatformErrorCode::WriteConflict
                    | PlatformErrorCode::RateLimited
                    | PlatformErrorCode::Internal
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_codes_round_trip() {
        for code in 0..=8 {
            assert_eq!(PlatformErrorCode::from_code(code).code(), code);
        }
        let err = RuntimeError::platform(99, None);
        assert!(matches!(
            err,
            RuntimeError::Platform {
                code: PlatformErrorCode::Unknown,
                raw_code: 99,
                ..
            }
        ));
    }

    #[test]
    fn retryable_errors() {
        assert!(RuntimeError::from(ConnectionError::Closed).is_retryable());
        assert!(RuntimeError::platform(2, None).is_retryable());
        assert!(!RuntimeError::platform(1, None).is_retryable());
        assert!(!RuntimeError::validation("duplicate key").is_retryable());
        assert!(!RuntimeError::Script {
            message: "boom".into(),
            stack: String::new()
        }
        .is_retryable());
    }

    #[test]
    fn error_display() {
        let err = RuntimeError::platform(3, Some("no access".into()));
        assert_eq!(err.to_string(), "platform error forbidden (3): no access");

        let err = RuntimeError::from(ConnectionError::NotReady);
        assert!(err.is_connection_error());
        assert_eq!(err.to_string(), "connection error: connection not ready");
    }
}
