//! Request, response, and push envelopes.

use crate::error::{ProtocolError, ProtocolResult};
use crate::fields::Fields;
use crate::messages::{RequestBody, RequestKind, ServerMessage};
use nimbus_codec::{from_wire_bytes, to_wire_bytes, WireValue};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// A client request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Protocol version.
    pub protocol_version: u16,
    /// Opaque trace id echoed in server logs.
    pub log_context: String,
    /// Target service.
    pub service_id: String,
    /// Target service build.
    pub service_version: String,
    /// Kind-specific body.
    pub body: RequestBody,
}

impl RequestEnvelope {
    /// Creates an envelope at the current protocol version.
    pub fn new(
        log_context: impl Into<String>,
        service_id: impl Into<String>,
        service_version: impl Into<String>,
        body: RequestBody,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            log_context: log_context.into(),
            service_id: service_id.into(),
            service_version: service_version.into(),
            body,
        }
    }

    /// The request kind.
    pub fn kind(&self) -> RequestKind {
        self.body.kind()
    }

    /// Encodes to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        to_wire_bytes(&WireValue::fields([
            ("protocol_version", WireValue::from(self.protocol_version)),
            ("log_context", WireValue::from(self.log_context.as_str())),
            ("service_id", WireValue::from(self.service_id.as_str())),
            ("service_version", WireValue::from(self.service_version.as_str())),
            ("request_kind", WireValue::from(self.kind().to_code())),
            ("request_body", self.body.to_wire()),
        ]))
    }

    /// Decodes from wire bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = from_wire_bytes(bytes)?;
        let f = Fields::of(&value, "RequestEnvelope")?;
        let protocol_version =
            u16::try_from(f.unsigned("protocol_version")?).map_err(|_| {
                ProtocolError::InvalidField {
                    context: "RequestEnvelope",
                    field: "protocol_version",
                    expected: "a 16-bit integer",
                }
            })?;
        let kind = RequestKind::from_code(f.unsigned("request_kind")?)?;
        Ok(Self {
            protocol_version,
            log_context: f.text("log_context")?,
            service_id: f.text("service_id")?,
            service_version: f.text("service_version")?,
            body: RequestBody::from_wire(kind, f.require("request_body")?)?,
        })
    }
}

/// The single outcome a response carries.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// The platform rejected the request.
    Error {
        /// Stable machine code.
        error_code: u32,
        /// Optional human-readable detail.
        message: Option<String>,
    },
    /// Remote application code threw.
    Exception {
        /// Exception message.
        message: String,
        /// Remote stack trace.
        stack: String,
    },
    /// Success.
    Ok {
        /// Kind-specific result.
        response: WireValue,
        /// Server messages produced while handling the request.
        bundled_messages: Vec<ServerMessage>,
    },
}

/// A server response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    /// Server protocol version, when the server reports one.
    pub protocol_version: Option<u16>,
    /// Console output captured on the server.
    pub console_log: Vec<String>,
    /// The outcome.
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    /// A success response.
    pub fn ok(response: WireValue, bundled_messages: Vec<ServerMessage>) -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION),
            console_log: Vec::new(),
            body: ResponseBody::Ok {
                response,
                bundled_messages,
            },
        }
    }

    /// A platform error response.
    pub fn error(error_code: u32, message: Option<String>) -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION),
            console_log: Vec::new(),
            body: ResponseBody::Error {
                error_code,
                message,
            },
        }
    }

    /// A script exception response.
    pub fn exception(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            protocol_version: Some(PROTOCOL_VERSION),
            console_log: Vec::new(),
            body: ResponseBody::Exception {
                message: message.into(),
                stack: stack.into(),
            },
        }
    }

    /// Encodes to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut fields = Vec::new();
        if let Some(version) = self.protocol_version {
            fields.push(("protocol_version", WireValue::from(version)));
        }
        if !self.console_log.is_empty() {
            fields.push((
                "console_log",
                WireValue::Array(
                    self.console_log
                        .iter()
                        .map(|l| WireValue::from(l.as_str()))
                        .collect(),
                ),
            ));
        }
        match &self.body {
            ResponseBody::Error {
                error_code,
                message,
            } => {
                fields.push(("error_code", WireValue::from(*error_code)));
                if let Some(message) = message {
                    fields.push(("error_message", WireValue::from(message.as_str())));
                }
            }
            ResponseBody::Exception { message, stack } => {
                fields.push(("exception_message", WireValue::from(message.as_str())));
                fields.push(("stack", WireValue::from(stack.as_str())));
            }
            ResponseBody::Ok {
                response,
                bundled_messages,
            } => {
                fields.push(("ok_response", response.clone()));
                fields.push((
                    "bundled_messages",
                    WireValue::Array(bundled_messages.iter().map(ServerMessage::to_wire).collect()),
                ));
            }
        }
        to_wire_bytes(&WireValue::fields(fields))
    }

    /// Decodes from wire bytes.
    ///
    /// Exactly one of `error_code`, `exception_message` and `ok_response`
    /// must be present.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = from_wire_bytes(bytes)?;
        let f = Fields::of(&value, "ResponseEnvelope")?;

        let outcomes = ["error_code", "exception_message", "ok_response"]
            .iter()
            .filter(|name| f.has(name))
            .count();
        match outcomes {
            0 => return Err(ProtocolError::EmptyResponse),
            1 => {}
            _ => return Err(ProtocolError::AmbiguousResponse),
        }

        let body = if f.has("error_code") {
            ResponseBody::Error {
                error_code: f.u32("error_code")?,
                message: f.get("error_message").and_then(|v| v.as_text()).map(str::to_string),
            }
        } else if f.has("exception_message") {
            ResponseBody::Exception {
                message: f.text("exception_message")?,
                stack: f.get("stack").and_then(|v| v.as_text()).unwrap_or_default().to_string(),
            }
        } else {
            ResponseBody::Ok {
                response: f.require("ok_response")?.clone(),
                bundled_messages: f
                    .list("bundled_messages")?
                    .iter()
                    .map(ServerMessage::from_wire)
                    .collect::<Result<_, _>>()?,
            }
        };

        let protocol_version = match f.get("protocol_version") {
            None => None,
            Some(_) => Some(u16::try_from(f.unsigned("protocol_version")?).map_err(|_| {
                ProtocolError::InvalidField {
                    context: "ResponseEnvelope",
                    field: "protocol_version",
                    expected: "a 16-bit integer",
                }
            })?),
        };

        Ok(Self {
            protocol_version,
            console_log: f.text_list("console_log")?,
            body,
        })
    }
}

/// A server-initiated message.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEnvelope {
    /// Opaque trace id.
    pub log_context: String,
    /// Service the message is addressed to.
    pub service_id: String,
    /// Service build the message is addressed to.
    pub service_version: String,
    /// The message.
    pub payload: ServerMessage,
}

impl PushEnvelope {
    /// Encodes to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        to_wire_bytes(&WireValue::fields([
            ("log_context", WireValue::from(self.log_context.as_str())),
            ("service_id", WireValue::from(self.service_id.as_str())),
            ("service_version", WireValue::from(self.service_version.as_str())),
            ("payload", self.payload.to_wire()),
        ]))
    }

    /// Decodes from wire bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let value = from_wire_bytes(bytes)?;
        let f = Fields::of(&value, "PushEnvelope")?;
        Ok(Self {
            log_context: f.text("log_context")?,
            service_id: f.text("service_id")?,
            service_version: f.text("service_version")?,
            payload: ServerMessage::from_wire(f.require("payload")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DataUpdateMessage, DeltaData, RecordTarget};

    #[test]
    fn request_envelope_round_trip() {
        let envelope = RequestEnvelope::new(
            "ctx-1",
            "svc",
            "v3",
            RequestBody::GetData(RecordTarget::new(5, "u1")),
        );
        let decoded = RequestEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.kind(), RequestKind::GetData);
    }

    #[test]
    fn response_outcomes() {
        let ok = ResponseEnvelope::ok(WireValue::Null, vec![]);
        // A null ok_response is indistinguishable from an absent one.
        assert_eq!(
            ResponseEnvelope::decode(&ok.encode()),
            Err(ProtocolError::EmptyResponse)
        );

        let ok = ResponseEnvelope::ok(
            WireValue::fields(Vec::<(&str, WireValue)>::new()),
            vec![ServerMessage::DataUpdate(DataUpdateMessage {
                deltas: vec![DeltaData::deletion(1, "a", 2)],
            })],
        );
        assert_eq!(ResponseEnvelope::decode(&ok.encode()).unwrap(), ok);

        let err = ResponseEnvelope::error(2, Some("conflict".into()));
        assert_eq!(ResponseEnvelope::decode(&err.encode()).unwrap(), err);

        let exc = ResponseEnvelope::exception("boom", "at f()");
        assert_eq!(ResponseEnvelope::decode(&exc.encode()).unwrap(), exc);
    }

    #[test]
    fn response_with_two_outcomes_is_rejected() {
        let bytes = to_wire_bytes(&WireValue::fields([
            ("error_code", WireValue::Integer(1)),
            ("exception_message", WireValue::from("x")),
        ]));
        assert_eq!(
            ResponseEnvelope::decode(&bytes),
            Err(ProtocolError::AmbiguousResponse)
        );
    }

    #[test]
    fn console_log_is_carried() {
        let mut env = ResponseEnvelope::exception("boom", "");
        env.console_log = vec!["line 1".into(), "line 2".into()];
        let decoded = ResponseEnvelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded.console_log, env.console_log);
    }

    #[test]
    fn push_envelope_round_trip() {
        let push = PushEnvelope {
            log_context: "ctx".into(),
            service_id: "svc".into(),
            service_version: "v1".into(),
            payload: ServerMessage::DataUpdate(DataUpdateMessage::default()),
        };
        assert_eq!(PushEnvelope::decode(&push.encode()).unwrap(), push);
    }

    #[test]
    fn envelope_must_be_a_map() {
        let bytes = to_wire_bytes(&WireValue::Integer(1));
        assert_eq!(
            PushEnvelope::decode(&bytes),
            Err(ProtocolError::NotAMap {
                context: "PushEnvelope"
            })
        );
    }
}
