//! Binary framing for CRDT document synchronization.
//!
//! Wire format (identical in both directions):
//! ```text
//! ┌──────────┬──────────────────────────────────────────────┐
//! │ msg_type │ type-specific payload                        │
//! │ 1 byte   │ variable                                     │
//! └──────────┴──────────────────────────────────────────────┘
//!
//! SYNC (0)            [0][step:u8][update bytes]
//! AWARENESS (1)       client → server: [1][presence bytes]
//!                     server → client: [1][client_id:u32 LE][presence bytes]
//! AUTH (2)            [2][opaque]
//! QUERY_AWARENESS (3) [3]
//! ```
//!
//! Update and presence payloads are opaque: they are produced and merged by
//! the client-side CRDT runtime. An awareness payload consisting of a single
//! zero byte retracts the tagged client's presence.

use thiserror::Error;

/// Process-unique connection identity, carried on the wire as `u32` LE.
pub type ClientId = u32;

/// Payload that signals removal of a client's awareness state.
pub const AWARENESS_REMOVED: &[u8] = &[0];

/// Top-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Document sync (handshake or incremental update)
    Sync = 0,
    /// Presence (cursor, selection, user info)
    Awareness = 1,
    /// Authentication (accepted, not interpreted)
    Auth = 2,
    /// Request for every stored awareness entry
    QueryAwareness = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            2 => Ok(Self::Auth),
            3 => Ok(Self::QueryAwareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Sub-types carried in the second byte of a SYNC frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyncStep {
    /// "Send me your current encoded state"
    Step1 = 0,
    /// "Here is my encoded state"
    Step2 = 1,
    /// "Apply this incremental update and relay it"
    Update = 2,
}

impl TryFrom<u8> for SyncStep {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Step1),
            1 => Ok(Self::Step2),
            2 => Ok(Self::Update),
            other => Err(ProtocolError::UnknownSyncStep(other)),
        }
    }
}

/// A decoded frame borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Sync { step: SyncStep, payload: &'a [u8] },
    Awareness { payload: &'a [u8] },
    Auth { payload: &'a [u8] },
    QueryAwareness,
}

impl<'a> Frame<'a> {
    /// Decode a frame from raw bytes.
    ///
    /// Trailing bytes after a QUERY_AWARENESS type byte are ignored.
    pub fn decode(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        let (&type_byte, rest) = bytes.split_first().ok_or(ProtocolError::Empty)?;

        match MessageType::try_from(type_byte)? {
            MessageType::Sync => {
                let (&step_byte, payload) = rest
                    .split_first()
                    .ok_or(ProtocolError::Truncated(MessageType::Sync))?;
                Ok(Frame::Sync {
                    step: SyncStep::try_from(step_byte)?,
                    payload,
                })
            }
            MessageType::Awareness => Ok(Frame::Awareness { payload: rest }),
            MessageType::Auth => Ok(Frame::Auth { payload: rest }),
            MessageType::QueryAwareness => Ok(Frame::QueryAwareness),
        }
    }

    /// Encode the frame in the client → server layout.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Frame::Sync { step, payload } => sync_frame(step, payload),
            Frame::Awareness { payload } => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(MessageType::Awareness as u8);
                out.extend_from_slice(payload);
                out
            }
            Frame::Auth { payload } => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(MessageType::Auth as u8);
                out.extend_from_slice(payload);
                out
            }
            Frame::QueryAwareness => vec![MessageType::QueryAwareness as u8],
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync { .. } => MessageType::Sync,
            Frame::Awareness { .. } => MessageType::Awareness,
            Frame::Auth { .. } => MessageType::Auth,
            Frame::QueryAwareness => MessageType::QueryAwareness,
        }
    }
}

/// Build a `[SYNC][step][payload]` frame.
pub fn sync_frame(step: SyncStep, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(MessageType::Sync as u8);
    out.push(step as u8);
    out.extend_from_slice(payload);
    out
}

/// The state request the server sends to every new connection.
pub fn sync_step1() -> Vec<u8> {
    sync_frame(SyncStep::Step1, &[])
}

/// Build a server → client awareness frame tagged with the originating client.
pub fn awareness_frame(client_id: ClientId, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(MessageType::Awareness as u8);
    out.extend_from_slice(&client_id.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build the retraction frame for a client whose presence went away.
pub fn awareness_removal_frame(client_id: ClientId) -> Vec<u8> {
    awareness_frame(client_id, AWARENESS_REMOVED)
}

/// Split a server → client awareness payload into `(client_id, presence)`.
pub fn split_tagged_awareness(payload: &[u8]) -> Result<(ClientId, &[u8]), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Truncated(MessageType::Awareness));
    }
    let (id_bytes, rest) = payload.split_at(4);
    let mut buf = [0u8; 4];
    buf.copy_from_slice(id_bytes);
    Ok((ClientId::from_le_bytes(buf), rest))
}

/// Protocol errors. None of these close the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("truncated {0:?} frame")]
    Truncated(MessageType),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unknown sync step {0}")]
    UnknownSyncStep(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_sync_update() {
        let bytes = [0u8, 2, 0x01, 0x02];
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(
            frame,
            Frame::Sync { step: SyncStep::Update, payload: &[0x01, 0x02] }
        );
    }

    #[test]
    fn test_decode_sync_step1_without_payload() {
        let frame = Frame::decode(&[0, 0]).unwrap();
        assert_eq!(frame, Frame::Sync { step: SyncStep::Step1, payload: &[] });
    }

    #[test]
    fn test_decode_awareness_and_query() {
        assert_eq!(
            Frame::decode(&[1, 9, 9]).unwrap(),
            Frame::Awareness { payload: &[9, 9] }
        );
        assert_eq!(Frame::decode(&[3]).unwrap(), Frame::QueryAwareness);
        assert_eq!(Frame::decode(&[3, 7]).unwrap(), Frame::QueryAwareness);
        assert_eq!(Frame::decode(&[2, 5]).unwrap(), Frame::Auth { payload: &[5] });
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(
            Frame::decode(&[0]),
            Err(ProtocolError::Truncated(MessageType::Sync))
        );
        assert_eq!(Frame::decode(&[9, 1]), Err(ProtocolError::UnknownMessageType(9)));
        assert_eq!(Frame::decode(&[0, 7, 1]), Err(ProtocolError::UnknownSyncStep(7)));
    }

    #[test]
    fn test_sync_frame_layout() {
        assert_eq!(sync_step1(), vec![0, 0]);
        assert_eq!(sync_frame(SyncStep::Step2, &[4, 5]), vec![0, 1, 4, 5]);
        assert_eq!(sync_frame(SyncStep::Update, &[1]), vec![0, 2, 1]);
    }

    #[test]
    fn test_awareness_frame_embeds_le_client_id() {
        let frame = awareness_frame(0x0102_0304, &[0xAA]);
        assert_eq!(frame, vec![1, 0x04, 0x03, 0x02, 0x01, 0xAA]);

        let Frame::Awareness { payload } = Frame::decode(&frame).unwrap() else {
            panic!("expected awareness frame");
        };
        let (id, presence) = split_tagged_awareness(payload).unwrap();
        assert_eq!(id, 0x0102_0304);
        assert_eq!(presence, &[0xAA]);
    }

    #[test]
    fn test_awareness_removal_frame() {
        assert_eq!(awareness_removal_frame(7), vec![1, 7, 0, 0, 0, 0]);
    }

    #[test]
    fn test_split_tagged_awareness_too_short() {
        assert!(split_tagged_awareness(&[1, 2]).is_err());
    }

    #[test]
    fn test_client_encode_matches_decode() {
        let update = [0xDE, 0xAD];
        let frame = Frame::Sync { step: SyncStep::Update, payload: &update };
        let bytes = frame.encode();
        assert_eq!(bytes, vec![0, 2, 0xDE, 0xAD]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
        assert_eq!(Frame::QueryAwareness.encode(), vec![3]);
        assert_eq!(Frame::Awareness { payload: &[1] }.encode(), vec![1, 1]);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Sync as u8, 0);
        assert_eq!(MessageType::Awareness as u8, 1);
        assert_eq!(MessageType::Auth as u8, 2);
        assert_eq!(MessageType::QueryAwareness as u8, 3);
        assert_eq!(SyncStep::Step1 as u8, 0);
        assert_eq!(SyncStep::Step2 as u8, 1);
        assert_eq!(SyncStep::Update as u8, 2);
    }
}
