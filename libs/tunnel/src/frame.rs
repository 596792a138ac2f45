//! The tunnel's wire format.
//!
//! Every frame is an eight byte header followed by `length` bytes of payload:
//!
//! ```text
//! 0      1      2            4                      8
//! | kind | rsvd | length u16 | stream id u32        | payload ...
//! ```
//!
//! All integers are big-endian. Unknown kinds must be ignored by receivers so
//! the format can grow.

use anyhow::{Context as _, Result, bail};
use telepresence_model::{ConnectionId, SessionId};

/// Frames never exceed 64 KiB of payload; the length field would not fit more.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// First frame of every stream; announces connection id and session.
    Connect,
    /// Acknowledges a `Connect`; data may flow afterwards.
    StreamOk,
    StreamData,
    /// One direction is done sending; the other keeps draining.
    CloseSend,
    KeepAlive,
    /// Immediate both-directions close, with a reason code.
    Error,
    /// Anything we do not understand; skipped for forward compatibility.
    Unknown(u8),
}

impl FrameKind {
    fn to_wire(self) -> u8 {
        match self {
            FrameKind::Connect => 1,
            FrameKind::StreamOk => 2,
            FrameKind::StreamData => 3,
            FrameKind::CloseSend => 4,
            FrameKind::KeepAlive => 5,
            FrameKind::Error => 6,
            FrameKind::Unknown(other) => other,
        }
    }

    fn from_wire(value: u8) -> Self {
        match value {
            1 => FrameKind::Connect,
            2 => FrameKind::StreamOk,
            3 => FrameKind::StreamData,
            4 => FrameKind::CloseSend,
            5 => FrameKind::KeepAlive,
            6 => FrameKind::Error,
            other => FrameKind::Unknown(other),
        }
    }
}

/// Why a stream was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorReason {
    #[error("session expired")]
    SessionExpired,
    #[error("destination is not routable")]
    Unroutable,
    #[error("peer is overloaded")]
    Backpressure,
    #[error("internal error")]
    Internal,
}

impl ErrorReason {
    fn to_wire(self) -> u8 {
        match self {
            ErrorReason::SessionExpired => 1,
            ErrorReason::Unroutable => 2,
            ErrorReason::Backpressure => 3,
            ErrorReason::Internal => 4,
        }
    }

    fn from_wire(value: u8) -> Self {
        match value {
            1 => ErrorReason::SessionExpired,
            2 => ErrorReason::Unroutable,
            3 => ErrorReason::Backpressure,
            _ => ErrorReason::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, stream_id: u32, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD);

        Self {
            kind,
            stream_id,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind.to_wire());
        buf.push(0); // reserved
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Parses one frame from the front of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < HEADER_LEN {
            bail!("Frame header truncated: {} bytes", buf.len());
        }

        let kind = FrameKind::from_wire(buf[0]);
        let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let Some(payload) = buf.get(HEADER_LEN..HEADER_LEN + length) else {
            bail!("Frame payload truncated: want {length} bytes");
        };

        Ok((
            Self {
                kind,
                stream_id,
                payload: payload.to_vec(),
            },
            HEADER_LEN + length,
        ))
    }
}

/// The payload of a `Connect` frame: length-prefixed session id followed by
/// the encoded connection id.
pub fn connect_payload(session: &SessionId, id: &ConnectionId) -> Vec<u8> {
    let session = session.as_str().as_bytes();

    let mut buf = Vec::with_capacity(2 + session.len() + 40);
    buf.extend_from_slice(&(session.len() as u16).to_be_bytes());
    buf.extend_from_slice(session);
    buf.extend_from_slice(&id.encode());

    buf
}

pub fn parse_connect(payload: &[u8]) -> Result<(SessionId, ConnectionId)> {
    let (len, rest) = payload
        .split_first_chunk::<2>()
        .context("Connect payload truncated")?;
    let session_len = u16::from_be_bytes(*len) as usize;

    anyhow::ensure!(rest.len() > session_len, "Connect payload truncated");
    let (session, id) = rest.split_at(session_len);

    let session = SessionId::new(
        std::str::from_utf8(session).context("Session id is not valid UTF-8")?,
    );
    let id = ConnectionId::decode(id).context("Failed to decode connection id")?;

    Ok((session, id))
}

/// The payload of an `Error` frame: reason code plus a human readable message.
pub fn error_payload(reason: ErrorReason, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + message.len());
    buf.push(reason.to_wire());
    buf.extend_from_slice(message.as_bytes());

    buf
}

pub fn parse_error(payload: &[u8]) -> (ErrorReason, String) {
    let Some((&reason, message)) = payload.split_first() else {
        return (ErrorReason::Internal, String::new());
    };

    (
        ErrorReason::from_wire(reason),
        String::from_utf8_lossy(message).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use telepresence_model::Protocol;

    #[test]
    fn frame_round_trips_to_bit_equality() {
        let frame = Frame::new(FrameKind::StreamData, 7, b"some payload".to_vec());

        let encoded = frame.encode();
        let (decoded, consumed) = Frame::decode(&encoded).unwrap();

        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn unknown_kinds_survive_decoding() {
        let frame = Frame::new(FrameKind::Unknown(42), 0, vec![1, 2, 3]);

        let (decoded, _) = Frame::decode(&frame.encode()).unwrap();

        assert_eq!(decoded.kind, FrameKind::Unknown(42));
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        let encoded = Frame::new(FrameKind::StreamData, 1, vec![0; 32]).encode();

        assert!(Frame::decode(&encoded[..HEADER_LEN + 16]).is_err());
        assert!(Frame::decode(&encoded[..4]).is_err());
    }

    #[test]
    fn connect_payload_round_trips() {
        let session = SessionId::new("sess-42");
        let id = ConnectionId::new(
            Protocol::Tcp,
            "10.11.0.1:51000".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        );

        let (parsed_session, parsed_id) = parse_connect(&connect_payload(&session, &id)).unwrap();

        assert_eq!(parsed_session, session);
        assert_eq!(parsed_id, id);
    }

    #[test]
    fn error_payload_round_trips() {
        let (reason, message) = parse_error(&error_payload(
            ErrorReason::Unroutable,
            "10.0.5.1 is never proxied",
        ));

        assert_eq!(reason, ErrorReason::Unroutable);
        assert_eq!(message, "10.0.5.1 is never proxied");
    }
}
