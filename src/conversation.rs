//! Conversation records.
//!
//! One record per remote party. Anchors the per-conversation sublists of
//! session keys and messages, and is itself doubly linked under the
//! header's conversation list head.
//!
//! Lookup is by phone-number *equivalence*, not byte equality: the same
//! party may appear as a local-format number ("07700900123") on an
//! incoming SMS and as an international-format number ("+447700900123")
//! in the contact book, and both must resolve to one conversation.

use crate::record::{DecodeError, Reader, RecordKind, Writer, PAYLOAD_SIZE};

/// Maximum stored phone number length in bytes
pub const PHONE_MAX: usize = 40;

/// Minimum count of matching trailing digits for two numbers in different
/// formats to be considered the same line
const MIN_MATCH: usize = 7;

/// One conversation: the remote party's number plus the roots of its two
/// sublists and its own list links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConversationRec {
    pub number: String,
    pub keys_head: u32,
    pub msgs_head: u32,
    pub prev: u32,
    pub next: u32,
}

impl ConversationRec {
    pub fn new(number: String) -> Self {
        Self {
            number,
            keys_head: crate::record::NIL,
            msgs_head: crate::record::NIL,
            prev: crate::record::NIL,
            next: crate::record::NIL,
        }
    }

    #[must_use]
    pub fn encode_payload(&self) -> [u8; PAYLOAD_SIZE] {
        let mut w = Writer::<PAYLOAD_SIZE>::tagged(RecordKind::Conversation);
        w.put_u32(self.keys_head);
        w.put_u32(self.msgs_head);
        w.put_str(&self.number);
        w.finish(&[self.prev, self.next])
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::tagged(payload, RecordKind::Conversation)?;
        let keys_head = r.get_u32()?;
        let msgs_head = r.get_u32()?;
        let number = r.get_str(PHONE_MAX)?;
        Ok(Self {
            number,
            keys_head,
            msgs_head,
            prev: r.link(2)?,
            next: r.link(1)?,
        })
    }
}

// ============================================================
// PHONE NUMBER EQUIVALENCE
// ============================================================

/// Split a dialable string into (has international prefix, digits).
/// Separators and formatting characters are ignored.
fn normalize(number: &str) -> (bool, Vec<u8>) {
    let has_plus = number.trim_start().starts_with('+');
    let digits = number.bytes().filter(u8::is_ascii_digit).collect();
    (has_plus, digits)
}

/// Locale-aware phone-number equivalence.
///
/// Two numbers match when their trailing digits agree and the leading
/// remainder is a known formatting variant of the same line:
/// - identical digit strings
/// - one is a suffix of the other with at least [`MIN_MATCH`] digits in
///   common (local vs. international form)
/// - a trunk-prefix `0` on one side against a `+`-prefixed country code
///   on the other ("07700900123" vs "+447700900123")
#[must_use]
pub fn phone_numbers_match(a: &str, b: &str) -> bool {
    let (a_plus, a_digits) = normalize(a);
    let (b_plus, b_digits) = normalize(b);

    if a_digits.is_empty() || b_digits.is_empty() {
        return false;
    }

    let matched = a_digits
        .iter()
        .rev()
        .zip(b_digits.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let a_rem = a_digits.len() - matched;
    let b_rem = b_digits.len() - matched;

    if a_rem == 0 && b_rem == 0 {
        // Same digits; "+44..." vs "44..." also lands here
        return true;
    }
    if matched < MIN_MATCH {
        return false;
    }
    if a_rem == 0 || b_rem == 0 {
        // One side is a shorter local form of the other
        return true;
    }
    // Trunk prefix on one side, international prefix on the other
    (a_rem == 1 && a_digits[0] == b'0' && b_plus) || (b_rem == 1 && b_digits[0] == b'0' && a_plus)
}

/// Whether a stored number should be rewritten to the query's form:
/// the query is a fuller international-format variant of the same line.
#[must_use]
pub(crate) fn should_upgrade(stored: &str, query: &str) -> bool {
    let (stored_plus, stored_digits) = normalize(stored);
    let (query_plus, query_digits) = normalize(query);
    query_plus && !stored_plus && query_digits.len() > stored_digits.len()
}
