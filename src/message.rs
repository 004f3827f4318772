//! Message records and their overflow parts.
//!
//! One `MessageRec` per message, doubly linked under its conversation.
//! The first chunk of the body lives inline in the message slot; a body
//! longer than the inline capacity continues as a chain of `PartRec`
//! records, one slot's worth of bytes each, whose order defines
//! reassembly order.

use crate::record::{DecodeError, Reader, RecordKind, Writer, LINK_SIZE, NIL, PAYLOAD_SIZE};

/// tag, flags, timestamp, parts head, chunk length
const MSG_FIXED: usize = 1 + 1 + 8 + 4 + 2;

/// tag, delivered, chunk length
const PART_FIXED: usize = 1 + 1 + 2;

/// Inline body bytes that fit in a message slot
pub const MSG_CHUNK_CAPACITY: usize = PAYLOAD_SIZE - MSG_FIXED - 3 * LINK_SIZE;

/// Body bytes that fit in one overflow part slot
pub const PART_CHUNK_CAPACITY: usize = PAYLOAD_SIZE - PART_FIXED - 3 * LINK_SIZE;

/// Whether a message was received or sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Per-message status flags, stored in one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageFlags {
    /// Fragment 0 (the inline chunk) confirmed delivered
    pub delivered_first_part: bool,
    /// Every fragment confirmed delivered
    pub delivered_all: bool,
    pub direction: Direction,
    pub unread: bool,
    /// Body was stored compressed
    pub compressed: bool,
    /// Body fits the 7-bit SMS alphabet
    pub ascii_encoding: bool,
}

impl MessageFlags {
    #[must_use]
    pub fn new(direction: Direction) -> Self {
        Self {
            delivered_first_part: false,
            delivered_all: false,
            direction,
            unread: direction == Direction::Incoming,
            compressed: false,
            ascii_encoding: false,
        }
    }

    fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.delivered_first_part {
            b |= 1;
        }
        if self.delivered_all {
            b |= 1 << 1;
        }
        if self.direction == Direction::Outgoing {
            b |= 1 << 2;
        }
        if self.unread {
            b |= 1 << 3;
        }
        if self.compressed {
            b |= 1 << 4;
        }
        if self.ascii_encoding {
            b |= 1 << 5;
        }
        b
    }

    fn from_byte(b: u8) -> Self {
        Self {
            delivered_first_part: b & 1 != 0,
            delivered_all: b & (1 << 1) != 0,
            direction: if b & (1 << 2) != 0 {
                Direction::Outgoing
            } else {
                Direction::Incoming
            },
            unread: b & (1 << 3) != 0,
            compressed: b & (1 << 4) != 0,
            ascii_encoding: b & (1 << 5) != 0,
        }
    }
}

/// One message record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageRec {
    pub flags: MessageFlags,
    pub timestamp: i64,
    pub chunk: Vec<u8>,
    pub parts_head: u32,
    pub parent: u32,
    pub prev: u32,
    pub next: u32,
}

impl MessageRec {
    #[must_use]
    pub fn new(parent: u32, direction: Direction, timestamp: i64) -> Self {
        Self {
            flags: MessageFlags::new(direction),
            timestamp,
            chunk: Vec::new(),
            parts_head: NIL,
            parent,
            prev: NIL,
            next: NIL,
        }
    }

    #[must_use]
    pub fn encode_payload(&self) -> [u8; PAYLOAD_SIZE] {
        debug_assert!(self.chunk.len() <= MSG_CHUNK_CAPACITY);
        let mut w = Writer::<PAYLOAD_SIZE>::tagged(RecordKind::Message);
        w.put_u8(self.flags.to_byte());
        w.put_i64(self.timestamp);
        w.put_u32(self.parts_head);
        w.put_chunk(&self.chunk);
        w.finish(&[self.parent, self.prev, self.next])
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::tagged(payload, RecordKind::Message)?;
        let flags = MessageFlags::from_byte(r.get_u8()?);
        let timestamp = r.get_i64()?;
        let parts_head = r.get_u32()?;
        let chunk = r.get_chunk(MSG_CHUNK_CAPACITY)?;
        Ok(Self {
            flags,
            timestamp,
            chunk,
            parts_head,
            parent: r.link(3)?,
            prev: r.link(2)?,
            next: r.link(1)?,
        })
    }
}

/// One overflow part record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PartRec {
    pub delivered: bool,
    pub chunk: Vec<u8>,
    pub parent: u32,
    pub prev: u32,
    pub next: u32,
}

impl PartRec {
    #[must_use]
    pub fn new(parent: u32) -> Self {
        Self {
            delivered: false,
            chunk: Vec::new(),
            parent,
            prev: NIL,
            next: NIL,
        }
    }

    #[must_use]
    pub fn encode_payload(&self) -> [u8; PAYLOAD_SIZE] {
        debug_assert!(self.chunk.len() <= PART_CHUNK_CAPACITY);
        let mut w = Writer::<PAYLOAD_SIZE>::tagged(RecordKind::Part);
        w.put_u8(self.delivered as u8);
        w.put_chunk(&self.chunk);
        w.finish(&[self.parent, self.prev, self.next])
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::tagged(payload, RecordKind::Part)?;
        let delivered = r.get_u8()? != 0;
        let chunk = r.get_chunk(PART_CHUNK_CAPACITY)?;
        Ok(Self {
            delivered,
            chunk,
            parent: r.link(3)?,
            prev: r.link(2)?,
            next: r.link(1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let mut rec = MessageRec::new(4, Direction::Outgoing, 1_704_067_200_000);
        rec.chunk = b"short message body".to_vec();
        rec.parts_head = 12;
        rec.prev = 3;
        rec.next = 8;
        rec.flags.delivered_first_part = true;
        rec.flags.compressed = true;

        let payload = rec.encode_payload();
        let recovered = MessageRec::decode_payload(&payload).unwrap();
        assert_eq!(recovered, rec);
    }

    #[test]
    fn test_message_full_chunk_roundtrip() {
        let mut rec = MessageRec::new(1, Direction::Incoming, 0);
        rec.chunk = vec![0x5A; MSG_CHUNK_CAPACITY];

        let payload = rec.encode_payload();
        let recovered = MessageRec::decode_payload(&payload).unwrap();
        assert_eq!(recovered.chunk, rec.chunk);
    }

    #[test]
    fn test_part_roundtrip() {
        let mut rec = PartRec::new(9);
        rec.delivered = true;
        rec.chunk = vec![0xA5; PART_CHUNK_CAPACITY];
        rec.prev = 2;
        rec.next = 6;

        let payload = rec.encode_payload();
        let recovered = PartRec::decode_payload(&payload).unwrap();
        assert_eq!(recovered, rec);
    }

    #[test]
    fn test_flags_byte_roundtrip() {
        let mut flags = MessageFlags::new(Direction::Outgoing);
        flags.delivered_all = true;
        flags.ascii_encoding = true;

        let recovered = MessageFlags::from_byte(flags.to_byte());
        assert_eq!(recovered, flags);
    }

    #[test]
    fn test_incoming_message_starts_unread() {
        assert!(MessageFlags::new(Direction::Incoming).unread);
        assert!(!MessageFlags::new(Direction::Outgoing).unread);
    }

    #[test]
    fn test_kind_tags_distinguish_message_and_part() {
        let msg = MessageRec::new(1, Direction::Incoming, 0).encode_payload();
        assert!(PartRec::decode_payload(&msg).is_err());
    }
}
