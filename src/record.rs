//! On-disk record layout.
//!
//! Every record occupies exactly one 256-byte slot:
//! - Slot 0 (header): 3-byte magic tag + 1-byte version + one encrypted
//!   block whose plaintext ends with the two list-head pointers
//! - Every other slot: one encrypted block; 1-byte kind tag and the
//!   type-specific fields at the front, navigation pointers as the last
//!   4/8/12 bytes, random filler in between
//!
//! The filler makes all slots the same size and shape before encryption,
//! so record type and content length are not observable from ciphertext.
//!
//! Cross-references are 4-byte big-endian slot indices; `0` means "no
//! reference" (slot 0 is the header, so it can never be a data record).

use crate::crypto::{self, ENCRYPTION_OVERHEAD};
use crate::fs::{Block, BLOCK_SIZE};

/// Magic tag at the start of slot 0
pub const MAGIC: [u8; 3] = *b"CRS";

/// Current format version
pub const FORMAT_VERSION: u8 = 1;

/// Null slot reference
pub const NIL: u32 = 0;

/// Slots added per growth step (and the initial file size)
pub const GROWTH_BATCH: usize = 32;

/// Usable plaintext bytes in a data slot
pub const PAYLOAD_SIZE: usize = BLOCK_SIZE - ENCRYPTION_OVERHEAD;

/// Usable plaintext bytes in the header slot (magic + version are outside
/// the ciphertext)
pub const HEADER_PAYLOAD_SIZE: usize = BLOCK_SIZE - 4 - ENCRYPTION_OVERHEAD;

/// Size of one slot reference on disk
pub const LINK_SIZE: usize = 4;

/// Record kind tag, the first plaintext byte of every data slot.
///
/// A reference that reaches a slot of the wrong kind is a format error,
/// not a misparse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Free = 0x01,
    Conversation = 0x02,
    SessionKeys = 0x03,
    Message = 0x04,
    Part = 0x05,
}

impl RecordKind {
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Free),
            0x02 => Some(Self::Conversation),
            0x03 => Some(Self::SessionKeys),
            0x04 => Some(Self::Message),
            0x05 => Some(Self::Part),
            _ => None,
        }
    }
}

/// Errors from record parsing
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("bad magic tag in header slot")]
    BadMagic,
    #[error("unsupported format version {0}")]
    BadVersion(u8),
    #[error("record kind mismatch: expected {expected:?}, found tag 0x{found:02x}")]
    KindMismatch { expected: RecordKind, found: u8 },
    #[error("malformed record: {0}")]
    Malformed(&'static str),
}

// ============================================================
// CODEC CURSORS
// ============================================================

/// Forward cursor building a fixed-size plaintext payload.
///
/// Front fields are appended in order; `finish` fills the gap up to the
/// link region with random bytes and writes the links big-endian at the
/// tail, `links[0]` first, the last link in the final 4 bytes.
pub(crate) struct Writer<const N: usize> {
    buf: [u8; N],
    pos: usize,
}

impl<const N: usize> Writer<N> {
    pub fn tagged(kind: RecordKind) -> Self {
        let mut w = Self {
            buf: [0u8; N],
            pos: 0,
        };
        w.put_u8(kind as u8);
        w
    }

    pub fn untagged() -> Self {
        Self {
            buf: [0u8; N],
            pos: 0,
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_be_bytes());
        self.pos += 4;
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_be_bytes());
        self.pos += 8;
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// 1-byte length prefix + UTF-8 bytes. Caller enforces the cap.
    pub fn put_str(&mut self, s: &str) {
        debug_assert!(s.len() <= u8::MAX as usize);
        self.put_u8(s.len() as u8);
        self.put_bytes(s.as_bytes());
    }

    /// 2-byte length prefix + raw bytes. Caller enforces the cap.
    pub fn put_chunk(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.buf[self.pos..self.pos + 2].copy_from_slice(&(bytes.len() as u16).to_be_bytes());
        self.pos += 2;
        self.put_bytes(bytes);
    }

    pub fn finish(mut self, links: &[u32]) -> [u8; N] {
        let link_start = N - links.len() * LINK_SIZE;
        assert!(self.pos <= link_start, "record fields overflow the slot");
        crypto::fill_random(&mut self.buf[self.pos..link_start]);
        for (i, link) in links.iter().enumerate() {
            let at = link_start + i * LINK_SIZE;
            self.buf[at..at + LINK_SIZE].copy_from_slice(&link.to_be_bytes());
        }
        self.buf
    }
}

/// Forward cursor over a decrypted payload.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading a data payload, checking the kind tag.
    pub fn tagged(buf: &'a [u8], expected: RecordKind) -> Result<Self, DecodeError> {
        let mut r = Self { buf, pos: 0 };
        let found = r.get_u8()?;
        if found != expected as u8 {
            return Err(DecodeError::KindMismatch { expected, found });
        }
        Ok(r)
    }

    pub fn untagged(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.buf.len() {
            return Err(DecodeError::Malformed("field runs past end of payload"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4 bytes")))
    }

    pub fn get_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().expect("8 bytes")))
    }

    pub fn get_array<const K: usize>(&mut self) -> Result<[u8; K], DecodeError> {
        let bytes = self.take(K)?;
        let mut out = [0u8; K];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn get_str(&mut self, cap: usize) -> Result<String, DecodeError> {
        let len = self.get_u8()? as usize;
        if len > cap {
            return Err(DecodeError::Malformed("string length over cap"));
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::Malformed("invalid UTF-8"))
    }

    pub fn get_chunk(&mut self, cap: usize) -> Result<Vec<u8>, DecodeError> {
        let len_bytes = self.take(2)?;
        let len = u16::from_be_bytes(len_bytes.try_into().expect("2 bytes")) as usize;
        if len > cap {
            return Err(DecodeError::Malformed("chunk length over capacity"));
        }
        Ok(self.take(len)?.to_vec())
    }

    /// Read the link stored `n_from_end` positions before the end
    /// (1 = the last 4 bytes).
    pub fn link(&self, n_from_end: usize) -> Result<u32, DecodeError> {
        let at = self
            .buf
            .len()
            .checked_sub(n_from_end * LINK_SIZE)
            .ok_or(DecodeError::Malformed("payload shorter than link region"))?;
        let bytes = self.buf[at..at + LINK_SIZE]
            .try_into()
            .expect("4 bytes");
        Ok(u32::from_be_bytes(bytes))
    }
}

// ============================================================
// HEADER
// ============================================================

/// The singleton record at slot 0.
///
/// Holds the format version and the roots of the two top-level lists:
/// the free-slot stack and the conversation list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub free_head: u32,
    pub conversation_head: u32,
}

impl Header {
    /// Header for a freshly formatted file
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: FORMAT_VERSION,
            free_head: NIL,
            conversation_head: NIL,
        }
    }

    /// Serialize the plaintext payload (filler + the two heads last).
    #[must_use]
    pub(crate) fn encode_payload(&self) -> [u8; HEADER_PAYLOAD_SIZE] {
        let w = Writer::<HEADER_PAYLOAD_SIZE>::untagged();
        w.finish(&[self.free_head, self.conversation_head])
    }

    /// Parse the decrypted payload.
    pub(crate) fn decode_payload(version: u8, payload: &[u8]) -> Result<Self, DecodeError> {
        let r = Reader::untagged(payload);
        let free_head = r.link(2)?;
        let conversation_head = r.link(1)?;
        Ok(Self {
            version,
            free_head,
            conversation_head,
        })
    }

    /// Split a raw header block into (version, ciphertext), checking magic.
    pub(crate) fn frame(block: &Block) -> Result<(u8, &[u8]), DecodeError> {
        if block[..3] != MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = block[3];
        if version != FORMAT_VERSION {
            return Err(DecodeError::BadVersion(version));
        }
        Ok((version, &block[4..]))
    }

    /// Assemble a raw header block from the ciphertext of the payload.
    pub(crate) fn assemble(version: u8, ciphertext: &[u8]) -> Block {
        debug_assert_eq!(ciphertext.len(), BLOCK_SIZE - 4);
        let mut block = [0u8; BLOCK_SIZE];
        block[..3].copy_from_slice(&MAGIC);
        block[3] = version;
        block[4..].copy_from_slice(ciphertext);
        block
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================
// FREE SLOT
// ============================================================

/// Serialize a free-slot marker pointing at the next free slot.
#[must_use]
pub(crate) fn encode_free(next: u32) -> [u8; PAYLOAD_SIZE] {
    let w = Writer::<PAYLOAD_SIZE>::tagged(RecordKind::Free);
    w.finish(&[next])
}

/// Parse a free-slot marker, returning its `next` pointer.
pub(crate) fn decode_free(payload: &[u8]) -> Result<u32, DecodeError> {
    let r = Reader::tagged(payload, RecordKind::Free)?;
    r.link(1)
}
