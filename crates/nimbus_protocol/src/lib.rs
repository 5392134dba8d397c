//! # Nimbus Protocol
//!
//! Wire envelopes and frame headers exchanged between the Nimbus client
//! runtime and a service.
//!
//! ## Message flow
//!
//! ```text
//! Client                                 Server
//!    |  OutboundFrame(id, RequestEnvelope)  |
//!    |------------------------------------->|
//!    |  InboundFrame(id, Response)          |
//!    |<-------------------------------------|
//!    |  InboundFrame(_, Message)            |
//!    |<-------------------------------------|   (push, any time)
//! ```
//!
//! Every envelope is a text-keyed [`nimbus_codec::WireValue`] map. Dynamic
//! application values inside envelopes travel as
//! [`nimbus_codec::EncodedValue`] pairs.
//!
//! Framing and parsing only; no I/O happens here.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod fields;
mod frame;
mod messages;

pub use envelope::{
    PushEnvelope, RequestEnvelope, ResponseBody, ResponseEnvelope, PROTOCOL_VERSION,
};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{FrameKind, InboundFrame, OutboundFrame, INBOUND_HEADER_LEN, OUTBOUND_HEADER_LEN};
pub use messages::{
    CallMethodRequest, CallMethodResponse, DataUpdateMessage, DeltaData, EventChannelTarget,
    EventMessage, GetDataResponse, Property, RecordTarget, RequestBody, RequestKind,
    SaveDataRequest, ServerMessage,
};
