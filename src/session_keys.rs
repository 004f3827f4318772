//! Session-key records and the one-way ratchet.
//!
//! One record per (conversation, SIM identity) pair, doubly linked under
//! its conversation. Carries two independent hash ratchets (outgoing and
//! incoming), each a (key, counter) pair, plus the exchange-progress flags
//! that drive the key-negotiation state machine.
//!
//! # Security Properties
//!
//! - **Monotonic ratchets**: a (key, counter) pair only ever advances, one
//!   `hash` step per counter increment; there is no way back to an earlier
//!   key
//! - **Saturation = expiry**: counters stop at 255 and the key freezes;
//!   a saturated outgoing ratchet reports `KeysExpired`
//! - **Zeroize on drop**: all three keys are wiped when the record leaves
//!   the cache

use zeroize::Zeroize;

use crate::crypto::{self, RatchetKey};
use crate::record::{DecodeError, Reader, RecordKind, Writer, NIL, PAYLOAD_SIZE};

/// Maximum stored SIM identity value length in bytes
pub const SIM_VALUE_MAX: usize = 20;

/// Ratchet counter saturation point
pub const COUNTER_MAX: u8 = 255;

/// Which physical SIM a session was negotiated against: the subscriber
/// number when available, else the SIM serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimIdentity {
    pub value: String,
    pub is_serial: bool,
}

impl SimIdentity {
    /// Identity from a subscriber phone number
    #[must_use]
    pub fn number(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_serial: false,
        }
    }

    /// Identity from a SIM serial (ICCID)
    #[must_use]
    pub fn serial(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            is_serial: true,
        }
    }
}

/// Progress of the key exchange, derived from the two flags and the
/// outgoing counter; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// Our key material is on its way to the peer
    SendingKeys,
    /// Peer's keys arrived, our confirmation is on its way
    SendingConfirmation,
    /// Our keys are sent, waiting for the peer's
    WaitingForReply,
    /// Both sides confirmed, ratchet usable
    KeysExchanged,
    /// Outgoing ratchet saturated, a fresh exchange is needed
    KeysExpired,
}

/// One session-keys record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionKeysRec {
    pub keys_sent: bool,
    pub keys_confirmed: bool,
    pub sim: SimIdentity,
    pub outgoing_key: RatchetKey,
    pub outgoing_counter: u8,
    pub incoming_key: RatchetKey,
    pub incoming_counter: u8,
    pub ratchet_private: RatchetKey,
    pub timestamp: i64,
    pub parent: u32,
    pub prev: u32,
    pub next: u32,
}

impl SessionKeysRec {
    /// A brand-new record: fresh random keys, zeroed counters, flags down.
    #[must_use]
    pub fn fresh(parent: u32, sim: SimIdentity, timestamp: i64) -> Self {
        Self {
            keys_sent: false,
            keys_confirmed: false,
            sim,
            outgoing_key: crypto::random_key(),
            outgoing_counter: 0,
            incoming_key: crypto::random_key(),
            incoming_counter: 0,
            ratchet_private: crypto::random_key(),
            timestamp,
            parent,
            prev: NIL,
            next: NIL,
        }
    }

    /// Exchange status per the negotiation state machine.
    #[must_use]
    pub fn status(&self) -> KeyStatus {
        match (self.keys_sent, self.keys_confirmed) {
            (false, false) => KeyStatus::SendingKeys,
            (false, true) => KeyStatus::SendingConfirmation,
            (true, false) => KeyStatus::WaitingForReply,
            (true, true) => {
                if self.outgoing_counter < COUNTER_MAX {
                    KeyStatus::KeysExchanged
                } else {
                    KeyStatus::KeysExpired
                }
            }
        }
    }

    /// Advance the outgoing ratchet up to `steps` times, stopping silently
    /// at saturation. Returns the counter afterwards.
    pub fn advance_outgoing(&mut self, steps: u32) -> u8 {
        Self::advance(&mut self.outgoing_key, &mut self.outgoing_counter, steps)
    }

    /// Advance the incoming ratchet up to `steps` times, stopping silently
    /// at saturation. Returns the counter afterwards.
    pub fn advance_incoming(&mut self, steps: u32) -> u8 {
        Self::advance(&mut self.incoming_key, &mut self.incoming_counter, steps)
    }

    fn advance(key: &mut RatchetKey, counter: &mut u8, steps: u32) -> u8 {
        for _ in 0..steps {
            if *counter >= COUNTER_MAX {
                break;
            }
            *key = crypto::ratchet_hash(key);
            *counter += 1;
        }
        *counter
    }

    #[must_use]
    pub fn encode_payload(&self) -> [u8; PAYLOAD_SIZE] {
        let mut flags = 0u8;
        if self.keys_sent {
            flags |= 1;
        }
        if self.keys_confirmed {
            flags |= 1 << 1;
        }
        if self.sim.is_serial {
            flags |= 1 << 2;
        }

        let mut w = Writer::<PAYLOAD_SIZE>::tagged(RecordKind::SessionKeys);
        w.put_u8(flags);
        w.put_str(&self.sim.value);
        w.put_bytes(&self.outgoing_key);
        w.put_u8(self.outgoing_counter);
        w.put_bytes(&self.incoming_key);
        w.put_u8(self.incoming_counter);
        w.put_bytes(&self.ratchet_private);
        w.put_i64(self.timestamp);
        w.finish(&[self.parent, self.prev, self.next])
    }

    pub fn decode_payload(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::tagged(payload, RecordKind::SessionKeys)?;
        let flags = r.get_u8()?;
        let value = r.get_str(SIM_VALUE_MAX)?;
        let outgoing_key = r.get_array()?;
        let outgoing_counter = r.get_u8()?;
        let incoming_key = r.get_array()?;
        let incoming_counter = r.get_u8()?;
        let ratchet_private = r.get_array()?;
        let timestamp = r.get_i64()?;

        Ok(Self {
            keys_sent: flags & 1 != 0,
            keys_confirmed: flags & (1 << 1) != 0,
            sim: SimIdentity {
                value,
                is_serial: flags & (1 << 2) != 0,
            },
            outgoing_key,
            outgoing_counter,
            incoming_key,
            incoming_counter,
            ratchet_private,
            timestamp,
            parent: r.link(3)?,
            prev: r.link(2)?,
            next: r.link(1)?,
        })
    }
}

impl Drop for SessionKeysRec {
    fn drop(&mut self) {
        self.outgoing_key.zeroize();
        self.incoming_key.zeroize();
        self.ratchet_private.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionKeysRec {
        let mut rec = SessionKeysRec::fresh(3, SimIdentity::serial("8944110068"), 1_704_067_200_000);
        rec.keys_sent = true;
        rec.outgoing_counter = 9;
        rec.prev = 7;
        rec.next = 11;
        rec
    }

    #[test]
    fn test_roundtrip() {
        let rec = sample();
        let payload = rec.encode_payload();
        let recovered = SessionKeysRec::decode_payload(&payload).unwrap();
        assert_eq!(recovered, rec);
    }

    #[test]
    fn test_fresh_keys_are_distinct() {
        let rec = SessionKeysRec::fresh(1, SimIdentity::number("+447700900123"), 0);
        assert_ne!(rec.outgoing_key, rec.incoming_key);
        assert_ne!(rec.outgoing_key, rec.ratchet_private);
        assert_eq!(rec.outgoing_counter, 0);
        assert_eq!(rec.incoming_counter, 0);
    }

    #[test]
    fn test_status_table() {
        let mut rec = SessionKeysRec::fresh(1, SimIdentity::number("1234567"), 0);
        assert_eq!(rec.status(), KeyStatus::SendingKeys);

        rec.keys_confirmed = true;
        assert_eq!(rec.status(), KeyStatus::SendingConfirmation);

        rec.keys_sent = true;
        rec.keys_confirmed = false;
        assert_eq!(rec.status(), KeyStatus::WaitingForReply);

        rec.keys_confirmed = true;
        assert_eq!(rec.status(), KeyStatus::KeysExchanged);

        rec.outgoing_counter = COUNTER_MAX;
        assert_eq!(rec.status(), KeyStatus::KeysExpired);
    }

    #[test]
    fn test_advance_steps_and_changes_key() {
        let mut rec = SessionKeysRec::fresh(1, SimIdentity::number("1234567"), 0);
        let before = rec.outgoing_key;

        assert_eq!(rec.advance_outgoing(5), 5);
        assert_ne!(rec.outgoing_key, before);

        // Incoming ratchet is independent
        assert_eq!(rec.incoming_counter, 0);
    }

    #[test]
    fn test_advance_saturates_and_freezes() {
        let mut rec = SessionKeysRec::fresh(1, SimIdentity::number("1234567"), 0);

        assert_eq!(rec.advance_outgoing(300), COUNTER_MAX);
        let frozen = rec.outgoing_key;

        assert_eq!(rec.advance_outgoing(1), COUNTER_MAX);
        assert_eq!(rec.outgoing_key, frozen);
    }

    #[test]
    fn test_advance_matches_repeated_hash() {
        let mut rec = SessionKeysRec::fresh(1, SimIdentity::number("1234567"), 0);
        let mut expected = rec.incoming_key;
        for _ in 0..4 {
            expected = crate::crypto::ratchet_hash(&expected);
        }

        rec.advance_incoming(4);
        assert_eq!(rec.incoming_key, expected);
    }
}
