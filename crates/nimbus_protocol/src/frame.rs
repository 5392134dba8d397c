//! Frame headers.
//!
//! ```text
//! outbound: [u32 LE request_id][u32 LE payload_len][payload]
//! inbound:  [u32 LE correlation_id][u8 kind][payload]
//! ```
//!
//! Inbound frames carry no length: the channel underneath is
//! message-oriented and delivers each frame whole.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the outbound header.
pub const OUTBOUND_HEADER_LEN: usize = 8;

/// Size of the inbound header.
pub const INBOUND_HEADER_LEN: usize = 5;

/// A client → server request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Correlation id chosen by the client.
    pub request_id: u32,
    /// Encoded request envelope.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Creates a frame.
    pub fn new(request_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            payload: payload.into(),
        }
    }

    /// Writes header and payload into one buffer.
    ///
    /// # Errors
    ///
    /// Fails if the payload does not fit a 32-bit length.
    pub fn encode(&self) -> ProtocolResult<Bytes> {
        let len = u32::try_from(self.payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
            len: self.payload.len(),
            max: u32::MAX as usize,
        })?;
        let mut buf = BytesMut::with_capacity(OUTBOUND_HEADER_LEN + self.payload.len());
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(len);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parses a frame, checking the length field against the bytes present.
    pub fn decode(frame: &[u8]) -> ProtocolResult<Self> {
        if frame.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        if frame.len() < OUTBOUND_HEADER_LEN {
            return Err(ProtocolError::malformed_frame(format!(
                "{} bytes is shorter than the request header",
                frame.len()
            )));
        }
        let mut header = &frame[..OUTBOUND_HEADER_LEN];
        let request_id = header.get_u32_le();
        let len = header.get_u32_le() as usize;
        let payload = &frame[OUTBOUND_HEADER_LEN..];
        if payload.len() != len {
            return Err(ProtocolError::malformed_frame(format!(
                "length field says {len}, frame carries {}",
                payload.len()
            )));
        }
        Ok(Self::new(request_id, Bytes::copy_from_slice(payload)))
    }
}

/// Kind byte of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Completes the pending request with the same correlation id.
    Response,
    /// Server-initiated push message.
    Message,
}

impl FrameKind {
    /// Wire byte.
    pub fn to_code(self) -> u8 {
        match self {
            FrameKind::Response => 0,
            FrameKind::Message => 1,
        }
    }

    /// Parses a wire byte.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        match code {
            0 => Ok(FrameKind::Response),
            1 => Ok(FrameKind::Message),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// A server → client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Request id being answered; unused for messages.
    pub correlation_id: u32,
    /// Response or push message.
    pub kind: FrameKind,
    /// Encoded response or push envelope.
    pub payload: Bytes,
}

impl InboundFrame {
    /// A response to `correlation_id`.
    pub fn response(correlation_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            kind: FrameKind::Response,
            payload: payload.into(),
        }
    }

    /// A push message.
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: 0,
            kind: FrameKind::Message,
            payload: payload.into(),
        }
    }

    /// Writes header and payload into one buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(INBOUND_HEADER_LEN + self.payload.len());
        buf.put_u32_le(self.correlation_id);
        buf.put_u8(self.kind.to_code());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a frame.
    pub fn decode(frame: Bytes) -> ProtocolResult<Self> {
        if frame.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        if frame.len() < INBOUND_HEADER_LEN {
            return Err(ProtocolError::malformed_frame(format!(
                "{} bytes is shorter than the response header",
                frame.len()
            )));
        }
        let mut header = &frame[..INBOUND_HEADER_LEN];
        let correlation_id = header.get_u32_le();
        let kind = FrameKind::from_code(header.get_u8())?;
        Ok(Self {
            correlation_id,
            kind,
            payload: frame.slice(INBOUND_HEADER_LEN..),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_header_is_little_endian() {
        let frame = OutboundFrame::new(1, vec![0xaa, 0xbb]).encode().unwrap();
        assert_eq!(&frame[..], &[1, 0, 0, 0, 2, 0, 0, 0, 0xaa, 0xbb]);
        assert_eq!(
            OutboundFrame::decode(&frame).unwrap(),
            OutboundFrame::new(1, vec![0xaa, 0xbb])
        );
    }

    #[test]
    fn outbound_length_mismatch() {
        assert!(matches!(
            OutboundFrame::decode(&[1, 0, 0, 0, 5, 0, 0, 0, 1]),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        assert_eq!(OutboundFrame::decode(&[]), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn inbound_response_and_message() {
        let bytes = InboundFrame::response(7, vec![9]).encode();
        assert_eq!(&bytes[..], &[7, 0, 0, 0, 0, 9]);
        let frame = InboundFrame::decode(bytes).unwrap();
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.correlation_id, 7);
        assert_eq!(&frame.payload[..], &[9]);

        let frame = InboundFrame::decode(InboundFrame::message(vec![1, 2]).encode()).unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
    }

    #[test]
    fn inbound_rejects_bad_frames() {
        assert_eq!(
            InboundFrame::decode(Bytes::new()),
            Err(ProtocolError::EmptyFrame)
        );
        assert!(matches!(
            InboundFrame::decode(Bytes::from_static(&[1, 0])),
            Err(ProtocolError::MalformedFrame { .. })
        ));
        assert_eq!(
            InboundFrame::decode(Bytes::from_static(&[1, 0, 0, 0, 7])),
            Err(ProtocolError::UnknownFrameKind(7))
        );
    }
}
