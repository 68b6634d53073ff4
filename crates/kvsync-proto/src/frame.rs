//! Sync Protocol Codec (component C7, §4.5): varuint-prefixed message
//! framing for SYNC, AWARENESS, AUTH, and QUERY_AWARENESS messages.
//!
//! The codec only frames; it never interprets the CRDT bytes it carries.
//! SYNC sub-messages (state vector / update bundle / incremental update)
//! are produced and consumed by the CRDT runtime the embedding application
//! provides — this module only knows their outer `varuint` sub-type tag,
//! the same way it only knows the outer message-type tag.

use crate::error::{ProtocolError, Result};

/// The outer message-type tag every frame starts with (§4.5 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    QueryAwareness = 3,
}

impl MessageType {
    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0 => Ok(MessageType::Sync),
            1 => Ok(MessageType::Awareness),
            2 => Ok(MessageType::Auth),
            3 => Ok(MessageType::QueryAwareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    pub fn code(self) -> u64 {
        self as u64
    }
}

/// The SYNC sub-message's own tag (§4.6 "SYNC step-1", "step-2",
/// "SYNC-incremental").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSubType {
    /// Carries a state vector: "what I already have".
    Step1 = 0,
    /// Carries an update bundle answering a peer's step-1.
    Step2 = 1,
    /// Carries an incremental update applied after the initial handshake.
    Update = 2,
}

impl SyncSubType {
    pub fn from_code(code: u64) -> Result<Self> {
        match code {
            0 => Ok(SyncSubType::Step1),
            1 => Ok(SyncSubType::Step2),
            2 => Ok(SyncSubType::Update),
            other => Err(ProtocolError::UnknownSyncSubType(other)),
        }
    }

    pub fn code(self) -> u64 {
        self as u64
    }
}

/// A decoded SYNC sub-message: sub-type tag plus opaque CRDT bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub sub_type: SyncSubType,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    pub fn new(sub_type: SyncSubType, payload: Vec<u8>) -> Self {
        Self { sub_type, payload }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.payload.len());
        write_varuint(&mut buf, self.sub_type.code());
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let code = read_varuint(bytes, &mut pos)?;
        let sub_type = SyncSubType::from_code(code)?;
        Ok(Self {
            sub_type,
            payload: bytes[pos..].to_vec(),
        })
    }
}

/// A decoded top-level frame. AUTH is reserved (§4.5); it round-trips as
/// opaque bytes without further structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    Auth(Vec<u8>),
    QueryAwareness,
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Sync(_) => MessageType::Sync,
            Frame::Awareness(_) => MessageType::Awareness,
            Frame::Auth(_) => MessageType::Auth,
            Frame::QueryAwareness => MessageType::QueryAwareness,
        }
    }

    /// Encode as `varuint(msg_type) || payload`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_varuint(&mut buf, self.message_type().code());
        match self {
            Frame::Sync(sync) => buf.extend_from_slice(&sync.encode()),
            Frame::Awareness(payload) | Frame::Auth(payload) => {
                buf.extend_from_slice(payload);
            }
            Frame::QueryAwareness => {}
        }
        buf
    }

    /// Decode one frame from `bytes`. Does not attempt to decode the SYNC
    /// sub-message's payload further than its own sub-type tag.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let code = read_varuint(bytes, &mut pos)?;
        let msg_type = MessageType::from_code(code)?;
        let rest = &bytes[pos..];
        Ok(match msg_type {
            MessageType::Sync => Frame::Sync(SyncMessage::decode(rest)?),
            MessageType::Awareness => Frame::Awareness(rest.to_vec()),
            MessageType::Auth => Frame::Auth(rest.to_vec()),
            MessageType::QueryAwareness => Frame::QueryAwareness,
        })
    }
}

/// Append `value` to `buf` as an unsigned LEB128 varint.
pub fn write_varuint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Read an unsigned LEB128 varint from `buf` starting at `*pos`, advancing
/// `*pos` past it.
pub fn read_varuint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or(ProtocolError::Truncated { expected: 1 })?;
        *pos += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 64 {
            return Err(ProtocolError::VarintOverflow);
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varuint_roundtrips_small_and_large_values() {
        for value in [0u64, 1, 127, 128, 300, 16384, u64::MAX] {
            let mut buf = Vec::new();
            write_varuint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varuint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn read_varuint_truncated_errors() {
        let buf = [0x80u8]; // continuation bit set, no following byte
        let mut pos = 0;
        assert!(matches!(
            read_varuint(&buf, &mut pos),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn frame_roundtrips_each_message_type() {
        let sync = Frame::Sync(SyncMessage::new(SyncSubType::Step1, vec![1, 2, 3]));
        assert_eq!(Frame::decode(&sync.encode()).unwrap(), sync);

        let awareness = Frame::Awareness(vec![9, 9]);
        assert_eq!(Frame::decode(&awareness.encode()).unwrap(), awareness);

        let auth = Frame::Auth(vec![]);
        assert_eq!(Frame::decode(&auth.encode()).unwrap(), auth);

        let query = Frame::QueryAwareness;
        assert_eq!(Frame::decode(&query.encode()).unwrap(), query);
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        let bytes = vec![9u8]; // varuint 9, not a known message type
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn sync_message_preserves_sub_type_and_payload() {
        let msg = SyncMessage::new(SyncSubType::Update, vec![5, 6, 7]);
        let encoded = msg.encode();
        let decoded = SyncMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.sub_type, SyncSubType::Update);
        assert_eq!(decoded.payload, vec![5, 6, 7]);
    }
}
