//! The store handle.
//!
//! Owns the open backing file, the master key, the header singleton, and
//! the per-type record caches. Every public operation locks the store
//! once, performs a bounded number of slot reads/writes, and unlocks; all
//! internal helpers run on `&mut Inner`, so holding the borrow *is* the
//! proof that the lock is held and no helper ever re-acquires it.
//!
//! # Caching
//!
//! Records are deduplicated through per-type maps keyed by slot index:
//! a record is decrypted at most once while resident, repeated lookups hit
//! the same entry, and every mutation goes through the cache before being
//! written back, so a stale copy can never overwrite a newer one. Entries
//! are evicted when their slot is freed.
//!
//! # Durability
//!
//! There is no journal. A crash between the writes of a composite
//! operation (e.g. between relinking a neighbour and persisting the new
//! head) can corrupt a list; [`Store::check_integrity`] detects this but
//! nothing repairs it. Accepted limitation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::conversation::{phone_numbers_match, should_upgrade, ConversationRec, PHONE_MAX};
use crate::crypto::{self, CryptoError, MasterKey, RatchetKey};
use crate::fs::{Block, BlockIo, IoError, BLOCK_SIZE};
use crate::message::{
    Direction, MessageFlags, MessageRec, PartRec, MSG_CHUNK_CAPACITY, PART_CHUNK_CAPACITY,
};
use crate::record::{self, DecodeError, Header, GROWTH_BATCH, NIL};
use crate::session_keys::{KeyStatus, SessionKeysRec, SimIdentity, SIM_VALUE_MAX};

/// Errors surfaced by store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Bad magic, bad version, or a record that fails to parse
    #[error("storage format error: {0}")]
    Format(#[from] DecodeError),
    /// A linked-list invariant does not hold on disk
    #[error("list structure corrupt: {0}")]
    Corrupt(&'static str),
    /// Slot index beyond the file extent, or part index beyond the chain
    #[error("index {index} out of bounds (limit {limit})")]
    OutOfBounds { index: u32, limit: u32 },
    /// Value does not fit its slot field
    #[error("value too long for its record field: {0}")]
    TooLong(&'static str),
    /// No resident record at the given slot
    #[error("no record resident at slot {index}")]
    NotFound { index: u32 },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<IoError> for StoreError {
    fn from(e: IoError) -> Self {
        match e {
            IoError::OutOfBounds { index, count } => Self::OutOfBounds {
                index,
                limit: count,
            },
            IoError::Io(e) => Self::Io(e),
        }
    }
}

/// Which intrusive list a record participates in.
///
/// All four lists share the same push-front/unlink shape; the kind only
/// selects the cache to go through and where the head pointer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    /// Conversations, rooted in the header
    Conversations,
    /// Session keys, rooted in a conversation
    Keys,
    /// Messages, rooted in a conversation
    Messages,
    /// Overflow parts, rooted in a message
    Parts,
}

/// Navigation pointers of one record
#[derive(Clone, Copy)]
struct Links {
    parent: u32,
    prev: u32,
    next: u32,
}

/// Everything behind the store lock.
struct Inner<F: BlockIo> {
    io: F,
    master: MasterKey,
    header: Header,
    conversations: HashMap<u32, ConversationRec>,
    session_keys: HashMap<u32, SessionKeysRec>,
    messages: HashMap<u32, MessageRec>,
    parts: HashMap<u32, PartRec>,
}

/// The record store: one handle per open backing file.
///
/// Construct once at startup with [`Store::open_or_create`] and pass by
/// reference to everything that needs it.
pub struct Store<F: BlockIo> {
    inner: Mutex<Inner<F>>,
    observer: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Encrypt a full-size data payload into one raw block.
fn seal(master: &MasterKey, payload: &[u8]) -> Result<Block, StoreError> {
    let ciphertext = crypto::encrypt(master, payload)?;
    let mut block = [0u8; BLOCK_SIZE];
    block.copy_from_slice(&ciphertext);
    Ok(block)
}

// ============================================================
// CONSTRUCTION
// ============================================================

impl<F: BlockIo> Store<F> {
    /// Format an empty backing: 32 slots, one header plus 31 free slots
    /// chained into the free stack.
    pub fn create(mut io: F, master: MasterKey) -> Result<Self, StoreError> {
        if io.block_count() != 0 {
            return Err(StoreError::Corrupt("refusing to format a non-empty backing"));
        }

        let mut header = Header::new();
        header.free_head = 1;

        let mut blocks = Vec::with_capacity(GROWTH_BATCH);
        let header_ciphertext = crypto::encrypt(&master, &header.encode_payload())?;
        blocks.push(Header::assemble(header.version, &header_ciphertext));
        for i in 1..GROWTH_BATCH as u32 {
            let next = if (i as usize) < GROWTH_BATCH - 1 { i + 1 } else { NIL };
            blocks.push(seal(&master, &record::encode_free(next))?);
        }

        io.append_blocks(&blocks)?;
        io.flush()?;
        debug!(slots = GROWTH_BATCH, "formatted new store");

        Ok(Self::from_parts(io, master, header))
    }

    /// Open an existing backing: read slot 0, verify the magic tag,
    /// decrypt the header.
    pub fn open(mut io: F, master: MasterKey) -> Result<Self, StoreError> {
        let block = io.read_block(0)?;
        let (version, ciphertext) = Header::frame(&block)?;
        let payload = crypto::decrypt(&master, ciphertext)?;
        let header = Header::decode_payload(version, &payload)?;
        debug!(slots = io.block_count(), "opened store");

        Ok(Self::from_parts(io, master, header))
    }

    /// Open the backing if it holds data, otherwise format it.
    pub fn open_or_create(io: F, master: MasterKey) -> Result<Self, StoreError> {
        if io.block_count() == 0 {
            Self::create(io, master)
        } else {
            Self::open(io, master)
        }
    }

    fn from_parts(io: F, master: MasterKey, header: Header) -> Self {
        Self {
            inner: Mutex::new(Inner {
                io,
                master,
                header,
                conversations: HashMap::new(),
                session_keys: HashMap::new(),
                messages: HashMap::new(),
                parts: HashMap::new(),
            }),
            observer: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<F>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the callback fired after any mutation that changes the
    /// conversation list (create, delete, bulk key migration). Invoked
    /// after the store lock is released, so it may call back in.
    pub fn set_change_observer(&self, observer: impl Fn() + Send + Sync + 'static) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    /// Drop the registered change callback.
    pub fn clear_change_observer(&self) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn notify(&self) {
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(f) = observer {
            f();
        }
    }
}

// ============================================================
// PUBLIC OPERATIONS
// ============================================================

impl<F: BlockIo> Store<F> {
    /// Slots currently in the backing file (header and free slots included)
    #[must_use]
    pub fn slot_count(&self) -> u32 {
        self.lock().io.block_count()
    }

    /// Length of the free-slot stack
    pub fn empty_entries_count(&self) -> Result<u32, StoreError> {
        self.lock().empty_entries_count()
    }

    /// Walk every list and sublist, forward and backward, and verify the
    /// structural invariants: no slot reachable twice, prev pointers
    /// mirroring the forward order, parent pointers matching the owning
    /// record, and the free stack disjoint from all live records.
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        self.lock().check_integrity()
    }

    // ---- conversations ----

    /// All conversations, most recently created first.
    pub fn conversations(&self) -> Result<Vec<u32>, StoreError> {
        self.lock().walk(ListKind::Conversations, NIL)
    }

    /// Create a conversation for a remote party's number and attach it to
    /// the front of the conversation list.
    pub fn create_conversation(&self, number: &str) -> Result<u32, StoreError> {
        if number.len() > PHONE_MAX {
            return Err(StoreError::TooLong("phone number"));
        }
        let index = {
            let mut inner = self.lock();
            let index = inner.allocate_one()?;
            inner
                .conversations
                .insert(index, ConversationRec::new(number.to_string()));
            inner.push_front(ListKind::Conversations, NIL, index)?;
            index
        };
        debug!(index, "created conversation");
        self.notify();
        Ok(index)
    }

    /// Find the conversation for a number using phone-number equivalence.
    ///
    /// When the stored number is a shorter local-format variant and the
    /// query is a fuller international-format variant, the stored record
    /// is upgraded in place to the international form.
    pub fn find_conversation(&self, number: &str) -> Result<Option<u32>, StoreError> {
        let mut inner = self.lock();
        for index in inner.walk(ListKind::Conversations, NIL)? {
            let stored = inner.conversation_mut(index)?.number.clone();
            if !phone_numbers_match(&stored, number) {
                continue;
            }
            if should_upgrade(&stored, number) && number.len() <= PHONE_MAX {
                inner.conversation_mut(index)?.number = number.to_string();
                inner.save_conversation(index)?;
                debug!(index, "upgraded stored number to international form");
            }
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// The stored number of a conversation.
    pub fn conversation_number(&self, conv: u32) -> Result<String, StoreError> {
        Ok(self.lock().conversation_mut(conv)?.number.clone())
    }

    /// Delete a conversation and everything it owns: every session-keys
    /// record, every message, every overflow part.
    pub fn delete_conversation(&self, conv: u32) -> Result<(), StoreError> {
        self.lock().delete_conversation(conv)?;
        self.notify();
        Ok(())
    }

    // ---- session keys ----

    /// Session-keys records of a conversation, most recent first.
    pub fn session_keys_list(&self, conv: u32) -> Result<Vec<u32>, StoreError> {
        self.lock().walk(ListKind::Keys, conv)
    }

    /// Create a session-keys record for a (conversation, SIM) pair:
    /// fresh random keys, zeroed counters, attached to the front.
    pub fn create_session_keys(&self, conv: u32, sim: &SimIdentity) -> Result<u32, StoreError> {
        if sim.value.len() > SIM_VALUE_MAX {
            return Err(StoreError::TooLong("SIM identity"));
        }
        let mut inner = self.lock();
        inner.conversation_mut(conv)?;
        let index = inner.allocate_one()?;
        inner
            .session_keys
            .insert(index, SessionKeysRec::fresh(conv, sim.clone(), now_millis()));
        inner.push_front(ListKind::Keys, conv, index)?;
        Ok(index)
    }

    /// The most recent session-keys record negotiated against a SIM.
    pub fn session_keys_for_sim(
        &self,
        conv: u32,
        sim: &SimIdentity,
    ) -> Result<Option<u32>, StoreError> {
        let mut inner = self.lock();
        for index in inner.walk(ListKind::Keys, conv)? {
            if inner.session_keys_mut(index)?.sim == *sim {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Unlink and free a session-keys record.
    pub fn delete_session_keys(&self, keys: u32) -> Result<(), StoreError> {
        self.lock().delete_session_keys(keys)
    }

    /// Exchange status derived from the flags and the outgoing counter.
    pub fn key_status(&self, keys: u32) -> Result<KeyStatus, StoreError> {
        Ok(self.lock().session_keys_mut(keys)?.status())
    }

    pub fn set_keys_sent(&self, keys: u32, sent: bool) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.session_keys_mut(keys)?.keys_sent = sent;
        inner.save_session_keys(keys)
    }

    pub fn set_keys_confirmed(&self, keys: u32, confirmed: bool) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.session_keys_mut(keys)?.keys_confirmed = confirmed;
        inner.save_session_keys(keys)
    }

    /// Current (key, counter) of the outgoing ratchet.
    pub fn outgoing_ratchet(&self, keys: u32) -> Result<(RatchetKey, u8), StoreError> {
        let mut inner = self.lock();
        let rec = inner.session_keys_mut(keys)?;
        Ok((rec.outgoing_key, rec.outgoing_counter))
    }

    /// Current (key, counter) of the incoming ratchet.
    pub fn incoming_ratchet(&self, keys: u32) -> Result<(RatchetKey, u8), StoreError> {
        let mut inner = self.lock();
        let rec = inner.session_keys_mut(keys)?;
        Ok((rec.incoming_key, rec.incoming_counter))
    }

    /// The private key of the pending key exchange.
    pub fn ratchet_private_key(&self, keys: u32) -> Result<RatchetKey, StoreError> {
        Ok(self.lock().session_keys_mut(keys)?.ratchet_private)
    }

    /// Advance the outgoing ratchet up to `steps` times; saturates at 255.
    /// Returns the counter afterwards.
    pub fn advance_outgoing(&self, keys: u32, steps: u32) -> Result<u8, StoreError> {
        let mut inner = self.lock();
        let counter = inner.session_keys_mut(keys)?.advance_outgoing(steps);
        inner.save_session_keys(keys)?;
        Ok(counter)
    }

    /// Advance the incoming ratchet up to `steps` times; saturates at 255.
    /// Returns the counter afterwards.
    pub fn advance_incoming(&self, keys: u32, steps: u32) -> Result<u8, StoreError> {
        let mut inner = self.lock();
        let counter = inner.session_keys_mut(keys)?.advance_incoming(steps);
        inner.save_session_keys(keys)?;
        Ok(counter)
    }

    pub fn session_keys_sim(&self, keys: u32) -> Result<SimIdentity, StoreError> {
        Ok(self.lock().session_keys_mut(keys)?.sim.clone())
    }

    pub fn session_keys_timestamp(&self, keys: u32) -> Result<i64, StoreError> {
        Ok(self.lock().session_keys_mut(keys)?.timestamp)
    }

    /// The conversation owning a session-keys record.
    pub fn session_keys_parent(&self, keys: u32) -> Result<u32, StoreError> {
        Ok(self.lock().session_keys_mut(keys)?.parent)
    }

    /// Migrate one conversation's session keys from one SIM to another.
    ///
    /// No-op when `original == replacement` or the conversation holds no
    /// record for `original`. Otherwise every record for `replacement` is
    /// deleted, the first record for `original` is renamed to
    /// `replacement`, and any further `original` records are deleted as
    /// redundant.
    pub fn replace_session_keys(
        &self,
        conv: u32,
        original: &SimIdentity,
        replacement: &SimIdentity,
    ) -> Result<(), StoreError> {
        self.lock().replace_session_keys(conv, original, replacement)?;
        Ok(())
    }

    /// Migrate every conversation's session keys from one SIM to another
    /// ("move to new SIM"). Fires the change notification when anything
    /// was migrated.
    pub fn change_all_session_keys(
        &self,
        original: &SimIdentity,
        replacement: &SimIdentity,
    ) -> Result<(), StoreError> {
        let changed = {
            let mut inner = self.lock();
            let mut changed = false;
            for conv in inner.walk(ListKind::Conversations, NIL)? {
                changed |= inner.replace_session_keys(conv, original, replacement)?;
            }
            changed
        };
        if changed {
            self.notify();
        }
        Ok(())
    }

    // ---- messages ----

    /// Messages of a conversation, most recent first.
    pub fn messages(&self, conv: u32) -> Result<Vec<u32>, StoreError> {
        self.lock().walk(ListKind::Messages, conv)
    }

    /// Create an empty message and attach it to the front of the
    /// conversation's message list.
    pub fn create_message(
        &self,
        conv: u32,
        direction: Direction,
        timestamp: i64,
    ) -> Result<u32, StoreError> {
        let mut inner = self.lock();
        inner.conversation_mut(conv)?;
        let index = inner.allocate_one()?;
        inner
            .messages
            .insert(index, MessageRec::new(conv, direction, timestamp));
        inner.push_front(ListKind::Messages, conv, index)?;
        Ok(index)
    }

    /// Delete a message: its whole part chain first, then the message.
    pub fn delete_message(&self, msg: u32) -> Result<(), StoreError> {
        self.lock().delete_message(msg)
    }

    pub fn message_flags(&self, msg: u32) -> Result<MessageFlags, StoreError> {
        Ok(self.lock().message_mut(msg)?.flags)
    }

    pub fn set_message_flags(&self, msg: u32, flags: MessageFlags) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.message_mut(msg)?.flags = flags;
        inner.save_message(msg)
    }

    pub fn message_timestamp(&self, msg: u32) -> Result<i64, StoreError> {
        Ok(self.lock().message_mut(msg)?.timestamp)
    }

    /// The conversation owning a message.
    pub fn message_parent(&self, msg: u32) -> Result<u32, StoreError> {
        Ok(self.lock().message_mut(msg)?.parent)
    }

    /// Total fragments of a message: the inline chunk plus the part chain.
    pub fn part_count(&self, msg: u32) -> Result<usize, StoreError> {
        let mut inner = self.lock();
        inner.message_mut(msg)?;
        Ok(1 + inner.walk(ListKind::Parts, msg)?.len())
    }

    /// Resize the part chain to `fragments` total fragments (minimum 1,
    /// the inline chunk). Excess trailing parts are deleted; missing parts
    /// are appended empty; overlapping parts keep their content.
    pub fn set_part_count(&self, msg: u32, fragments: usize) -> Result<(), StoreError> {
        if fragments == 0 {
            return Err(StoreError::OutOfBounds { index: 0, limit: 1 });
        }
        self.lock().set_chain_len(msg, fragments - 1)
    }

    /// Replace the entire part chain with the given chunks, in order.
    /// The inline chunk is untouched.
    pub fn assign_parts(&self, msg: u32, parts: &[Vec<u8>]) -> Result<(), StoreError> {
        for chunk in parts {
            if chunk.len() > PART_CHUNK_CAPACITY {
                return Err(StoreError::TooLong("message part"));
            }
        }
        self.lock().assign_parts(msg, parts)
    }

    /// Fragment data by index: 0 is the inline chunk, i ≥ 1 walks the
    /// part chain.
    pub fn part_data(&self, msg: u32, index: usize) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.lock();
        if index == 0 {
            return Ok(inner.message_mut(msg)?.chunk.clone());
        }
        let slot = inner.part_at(msg, index)?;
        Ok(inner.part_mut(slot)?.chunk.clone())
    }

    /// Overwrite fragment data by index (0 = inline chunk).
    pub fn set_part_data(&self, msg: u32, index: usize, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if index == 0 {
            if data.len() > MSG_CHUNK_CAPACITY {
                return Err(StoreError::TooLong("inline message chunk"));
            }
            inner.message_mut(msg)?.chunk = data.to_vec();
            return inner.save_message(msg);
        }
        if data.len() > PART_CHUNK_CAPACITY {
            return Err(StoreError::TooLong("message part"));
        }
        let slot = inner.part_at(msg, index)?;
        inner.part_mut(slot)?.chunk = data.to_vec();
        inner.save_part(slot)
    }

    /// Per-fragment delivery flag (0 = the message's first-part flag).
    pub fn set_part_delivered(
        &self,
        msg: u32,
        index: usize,
        delivered: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if index == 0 {
            inner.message_mut(msg)?.flags.delivered_first_part = delivered;
            return inner.save_message(msg);
        }
        let slot = inner.part_at(msg, index)?;
        inner.part_mut(slot)?.delivered = delivered;
        inner.save_part(slot)
    }

    /// Reassemble the full body: inline chunk, then the chain in order.
    pub fn message_body(&self, msg: u32) -> Result<Vec<u8>, StoreError> {
        let mut inner = self.lock();
        let mut body = inner.message_mut(msg)?.chunk.clone();
        for slot in inner.walk(ListKind::Parts, msg)? {
            body.extend_from_slice(&inner.part_mut(slot)?.chunk);
        }
        Ok(body)
    }

    /// Store a full body, splitting it across the inline chunk and a
    /// freshly sized part chain.
    pub fn set_message_body(&self, msg: u32, body: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let inline_len = body.len().min(MSG_CHUNK_CAPACITY);
        inner.message_mut(msg)?.chunk = body[..inline_len].to_vec();
        inner.save_message(msg)?;

        let rest: Vec<Vec<u8>> = body[inline_len..]
            .chunks(PART_CHUNK_CAPACITY)
            .map(<[u8]>::to_vec)
            .collect();
        inner.assign_parts(msg, &rest)
    }

    /// Messages of a conversation still flagged unread.
    pub fn unread_count(&self, conv: u32) -> Result<u32, StoreError> {
        let mut inner = self.lock();
        let mut count = 0;
        for msg in inner.walk(ListKind::Messages, conv)? {
            if inner.message_mut(msg)?.flags.unread {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Clear the unread flag on every message of a conversation.
    pub fn mark_conversation_read(&self, conv: u32) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for msg in inner.walk(ListKind::Messages, conv)? {
            if inner.message_mut(msg)?.flags.unread {
                inner.message_mut(msg)?.flags.unread = false;
                inner.save_message(msg)?;
            }
        }
        Ok(())
    }
}

// ============================================================
// INTERNALS
// ============================================================

impl<F: BlockIo> Inner<F> {
    // ---- slot encryption ----

    fn write_record(&mut self, index: u32, payload: &[u8]) -> Result<(), StoreError> {
        let block = seal(&self.master, payload)?;
        self.io.write_block(index, &block)?;
        Ok(())
    }

    fn read_payload(&mut self, index: u32) -> Result<Vec<u8>, StoreError> {
        let block = self.io.read_block(index)?;
        Ok(crypto::decrypt(&self.master, &block)?)
    }

    fn save_header(&mut self) -> Result<(), StoreError> {
        let ciphertext = crypto::encrypt(&self.master, &self.header.encode_payload())?;
        let block = Header::assemble(self.header.version, &ciphertext);
        self.io.write_block(0, &block)?;
        Ok(())
    }

    // ---- record caches ----

    fn conversation_mut(&mut self, index: u32) -> Result<&mut ConversationRec, StoreError> {
        if !self.conversations.contains_key(&index) {
            let payload = self.read_payload(index)?;
            let rec = ConversationRec::decode_payload(&payload)?;
            self.conversations.insert(index, rec);
        }
        self.conversations
            .get_mut(&index)
            .ok_or(StoreError::NotFound { index })
    }

    fn save_conversation(&mut self, index: u32) -> Result<(), StoreError> {
        let payload = self
            .conversations
            .get(&index)
            .ok_or(StoreError::NotFound { index })?
            .encode_payload();
        self.write_record(index, &payload)
    }

    fn session_keys_mut(&mut self, index: u32) -> Result<&mut SessionKeysRec, StoreError> {
        if !self.session_keys.contains_key(&index) {
            let payload = self.read_payload(index)?;
            let rec = SessionKeysRec::decode_payload(&payload)?;
            self.session_keys.insert(index, rec);
        }
        self.session_keys
            .get_mut(&index)
            .ok_or(StoreError::NotFound { index })
    }

    fn save_session_keys(&mut self, index: u32) -> Result<(), StoreError> {
        let payload = self
            .session_keys
            .get(&index)
            .ok_or(StoreError::NotFound { index })?
            .encode_payload();
        self.write_record(index, &payload)
    }

    fn message_mut(&mut self, index: u32) -> Result<&mut MessageRec, StoreError> {
        if !self.messages.contains_key(&index) {
            let payload = self.read_payload(index)?;
            let rec = MessageRec::decode_payload(&payload)?;
            self.messages.insert(index, rec);
        }
        self.messages
            .get_mut(&index)
            .ok_or(StoreError::NotFound { index })
    }

    fn save_message(&mut self, index: u32) -> Result<(), StoreError> {
        let payload = self
            .messages
            .get(&index)
            .ok_or(StoreError::NotFound { index })?
            .encode_payload();
        self.write_record(index, &payload)
    }

    fn part_mut(&mut self, index: u32) -> Result<&mut PartRec, StoreError> {
        if !self.parts.contains_key(&index) {
            let payload = self.read_payload(index)?;
            let rec = PartRec::decode_payload(&payload)?;
            self.parts.insert(index, rec);
        }
        self.parts
            .get_mut(&index)
            .ok_or(StoreError::NotFound { index })
    }

    fn save_part(&mut self, index: u32) -> Result<(), StoreError> {
        let payload = self
            .parts
            .get(&index)
            .ok_or(StoreError::NotFound { index })?
            .encode_payload();
        self.write_record(index, &payload)
    }

    // ---- allocator ----

    /// Pop `n` slots off the free stack, growing the backing as needed.
    fn allocate(&mut self, n: usize) -> Result<Vec<u32>, StoreError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.allocate_one()?);
        }
        Ok(out)
    }

    fn allocate_one(&mut self) -> Result<u32, StoreError> {
        if self.header.free_head == NIL {
            self.grow()?;
        }
        let index = self.header.free_head;
        let payload = self.read_payload(index)?;
        self.header.free_head = record::decode_free(&payload)?;
        self.save_header()?;
        Ok(index)
    }

    /// Append one batch of fresh free slots and push them onto the stack.
    fn grow(&mut self) -> Result<(), StoreError> {
        let start = self.io.block_count();
        debug!(start, count = GROWTH_BATCH, "growing backing file");

        let mut blocks = Vec::with_capacity(GROWTH_BATCH);
        for i in 0..GROWTH_BATCH as u32 {
            let next = if (i as usize) < GROWTH_BATCH - 1 {
                start + i + 1
            } else {
                self.header.free_head
            };
            blocks.push(seal(&self.master, &record::encode_free(next))?);
        }
        self.io.append_blocks(&blocks)?;

        self.header.free_head = start;
        self.save_header()
    }

    /// Turn a retired slot back into a free one and push it.
    fn free_slot(&mut self, index: u32) -> Result<(), StoreError> {
        self.conversations.remove(&index);
        self.session_keys.remove(&index);
        self.messages.remove(&index);
        self.parts.remove(&index);

        self.write_record(index, &record::encode_free(self.header.free_head))?;
        self.header.free_head = index;
        self.save_header()
    }

    fn empty_entries_count(&mut self) -> Result<u32, StoreError> {
        let cap = self.io.block_count();
        let mut count = 0u32;
        let mut cur = self.header.free_head;
        while cur != NIL {
            count += 1;
            if count > cap {
                return Err(StoreError::Corrupt("free list cycle"));
            }
            let payload = self.read_payload(cur)?;
            cur = record::decode_free(&payload)?;
        }
        Ok(count)
    }

    // ---- generic list plumbing ----
    // One routine each for push-front and unlink, shared by all four
    // list kinds; the kind only picks the cache and the head field.

    fn links(&mut self, kind: ListKind, index: u32) -> Result<Links, StoreError> {
        Ok(match kind {
            ListKind::Conversations => {
                let r = self.conversation_mut(index)?;
                Links {
                    parent: NIL,
                    prev: r.prev,
                    next: r.next,
                }
            }
            ListKind::Keys => {
                let r = self.session_keys_mut(index)?;
                Links {
                    parent: r.parent,
                    prev: r.prev,
                    next: r.next,
                }
            }
            ListKind::Messages => {
                let r = self.message_mut(index)?;
                Links {
                    parent: r.parent,
                    prev: r.prev,
                    next: r.next,
                }
            }
            ListKind::Parts => {
                let r = self.part_mut(index)?;
                Links {
                    parent: r.parent,
                    prev: r.prev,
                    next: r.next,
                }
            }
        })
    }

    fn head(&mut self, kind: ListKind, parent: u32) -> Result<u32, StoreError> {
        Ok(match kind {
            ListKind::Conversations => self.header.conversation_head,
            ListKind::Keys => self.conversation_mut(parent)?.keys_head,
            ListKind::Messages => self.conversation_mut(parent)?.msgs_head,
            ListKind::Parts => self.message_mut(parent)?.parts_head,
        })
    }

    fn set_head(&mut self, kind: ListKind, parent: u32, value: u32) -> Result<(), StoreError> {
        match kind {
            ListKind::Conversations => {
                self.header.conversation_head = value;
                self.save_header()
            }
            ListKind::Keys => {
                self.conversation_mut(parent)?.keys_head = value;
                self.save_conversation(parent)
            }
            ListKind::Messages => {
                self.conversation_mut(parent)?.msgs_head = value;
                self.save_conversation(parent)
            }
            ListKind::Parts => {
                self.message_mut(parent)?.parts_head = value;
                self.save_message(parent)
            }
        }
    }

    fn set_prev(&mut self, kind: ListKind, index: u32, value: u32) -> Result<(), StoreError> {
        match kind {
            ListKind::Conversations => self.conversation_mut(index)?.prev = value,
            ListKind::Keys => self.session_keys_mut(index)?.prev = value,
            ListKind::Messages => self.message_mut(index)?.prev = value,
            ListKind::Parts => self.part_mut(index)?.prev = value,
        }
        self.save_node(kind, index)
    }

    fn set_next(&mut self, kind: ListKind, index: u32, value: u32) -> Result<(), StoreError> {
        match kind {
            ListKind::Conversations => self.conversation_mut(index)?.next = value,
            ListKind::Keys => self.session_keys_mut(index)?.next = value,
            ListKind::Messages => self.message_mut(index)?.next = value,
            ListKind::Parts => self.part_mut(index)?.next = value,
        }
        self.save_node(kind, index)
    }

    fn save_node(&mut self, kind: ListKind, index: u32) -> Result<(), StoreError> {
        match kind {
            ListKind::Conversations => self.save_conversation(index),
            ListKind::Keys => self.save_session_keys(index),
            ListKind::Messages => self.save_message(index),
            ListKind::Parts => self.save_part(index),
        }
    }

    /// Stamp a new node's links for push-front and persist it.
    fn init_node(
        &mut self,
        kind: ListKind,
        index: u32,
        parent: u32,
        next: u32,
    ) -> Result<(), StoreError> {
        match kind {
            ListKind::Conversations => {
                let r = self.conversation_mut(index)?;
                r.prev = NIL;
                r.next = next;
            }
            ListKind::Keys => {
                let r = self.session_keys_mut(index)?;
                r.parent = parent;
                r.prev = NIL;
                r.next = next;
            }
            ListKind::Messages => {
                let r = self.message_mut(index)?;
                r.parent = parent;
                r.prev = NIL;
                r.next = next;
            }
            ListKind::Parts => {
                let r = self.part_mut(index)?;
                r.parent = parent;
                r.prev = NIL;
                r.next = next;
            }
        }
        self.save_node(kind, index)
    }

    /// Attach a record at the front of a list: the new record is persisted
    /// first, then the old head's back-link, then the head itself.
    fn push_front(&mut self, kind: ListKind, parent: u32, index: u32) -> Result<(), StoreError> {
        let head = self.head(kind, parent)?;
        self.init_node(kind, index, parent, head)?;
        if head != NIL {
            self.set_prev(kind, head, index)?;
        }
        self.set_head(kind, parent, index)
    }

    /// Detach a record from its list: patch the predecessor's forward link
    /// (or the head when it was first), then the successor's back-link.
    fn unlink(&mut self, kind: ListKind, index: u32) -> Result<(), StoreError> {
        let links = self.links(kind, index)?;
        if links.prev == NIL {
            self.set_head(kind, links.parent, links.next)?;
        } else {
            self.set_next(kind, links.prev, links.next)?;
        }
        if links.next != NIL {
            self.set_prev(kind, links.next, links.prev)?;
        }
        Ok(())
    }

    /// Forward walk of a whole list, collecting slot indices.
    fn walk(&mut self, kind: ListKind, parent: u32) -> Result<Vec<u32>, StoreError> {
        let cap = self.io.block_count() as usize;
        let mut out = Vec::new();
        let mut cur = self.head(kind, parent)?;
        while cur != NIL {
            if out.len() >= cap {
                return Err(StoreError::Corrupt("list cycle"));
            }
            out.push(cur);
            cur = self.links(kind, cur)?.next;
        }
        Ok(out)
    }

    /// The chain slot holding fragment `index` (1-based within the chain).
    fn part_at(&mut self, msg: u32, index: usize) -> Result<u32, StoreError> {
        let chain = self.walk(ListKind::Parts, msg)?;
        chain
            .get(index - 1)
            .copied()
            .ok_or(StoreError::OutOfBounds {
                index: index as u32,
                limit: (chain.len() + 1) as u32,
            })
    }

    // ---- deletion ----

    fn delete_session_keys(&mut self, keys: u32) -> Result<(), StoreError> {
        self.session_keys_mut(keys)?;
        self.unlink(ListKind::Keys, keys)?;
        self.free_slot(keys)
    }

    fn delete_message(&mut self, msg: u32) -> Result<(), StoreError> {
        loop {
            let head = self.message_mut(msg)?.parts_head;
            if head == NIL {
                break;
            }
            self.unlink(ListKind::Parts, head)?;
            self.free_slot(head)?;
        }
        self.unlink(ListKind::Messages, msg)?;
        self.free_slot(msg)
    }

    fn delete_conversation(&mut self, conv: u32) -> Result<(), StoreError> {
        self.conversation_mut(conv)?;
        self.unlink(ListKind::Conversations, conv)?;
        loop {
            let head = self.conversation_mut(conv)?.keys_head;
            if head == NIL {
                break;
            }
            self.delete_session_keys(head)?;
        }
        loop {
            let head = self.conversation_mut(conv)?.msgs_head;
            if head == NIL {
                break;
            }
            self.delete_message(head)?;
        }
        debug!(conv, "deleted conversation");
        self.free_slot(conv)
    }

    // ---- SIM migration ----

    /// Returns whether anything changed.
    fn replace_session_keys(
        &mut self,
        conv: u32,
        original: &SimIdentity,
        replacement: &SimIdentity,
    ) -> Result<bool, StoreError> {
        if original == replacement {
            return Ok(false);
        }

        let mut original_matches = Vec::new();
        let mut replacement_matches = Vec::new();
        for index in self.walk(ListKind::Keys, conv)? {
            let sim = &self.session_keys_mut(index)?.sim;
            if sim == original {
                original_matches.push(index);
            } else if sim == replacement {
                replacement_matches.push(index);
            }
        }
        if original_matches.is_empty() {
            return Ok(false);
        }

        for index in replacement_matches {
            self.delete_session_keys(index)?;
        }
        let keep = original_matches[0];
        self.session_keys_mut(keep)?.sim = replacement.clone();
        self.save_session_keys(keep)?;
        for &index in &original_matches[1..] {
            self.delete_session_keys(index)?;
        }
        debug!(conv, keep, "migrated session keys to new SIM identity");
        Ok(true)
    }

    // ---- part chain resizing ----

    fn set_chain_len(&mut self, msg: u32, chain_len: usize) -> Result<(), StoreError> {
        let chain = self.walk(ListKind::Parts, msg)?;

        if chain.len() > chain_len {
            for &index in &chain[chain_len..] {
                self.unlink(ListKind::Parts, index)?;
                self.free_slot(index)?;
            }
            return Ok(());
        }

        if chain.len() < chain_len {
            let slots = self.allocate(chain_len - chain.len())?;
            let tail = chain.last().copied();
            for (i, &index) in slots.iter().enumerate() {
                let mut rec = PartRec::new(msg);
                rec.prev = if i == 0 {
                    tail.unwrap_or(NIL)
                } else {
                    slots[i - 1]
                };
                rec.next = if i + 1 < slots.len() { slots[i + 1] } else { NIL };
                self.parts.insert(index, rec);
                self.save_part(index)?;
            }
            match tail {
                Some(t) => {
                    self.part_mut(t)?.next = slots[0];
                    self.save_part(t)?;
                }
                None => {
                    self.message_mut(msg)?.parts_head = slots[0];
                    self.save_message(msg)?;
                }
            }
        }
        Ok(())
    }

    fn assign_parts(&mut self, msg: u32, parts: &[Vec<u8>]) -> Result<(), StoreError> {
        loop {
            let head = self.message_mut(msg)?.parts_head;
            if head == NIL {
                break;
            }
            self.unlink(ListKind::Parts, head)?;
            self.free_slot(head)?;
        }

        let slots = self.allocate(parts.len())?;
        for (i, chunk) in parts.iter().enumerate() {
            let mut rec = PartRec::new(msg);
            rec.chunk = chunk.clone();
            rec.prev = if i == 0 { NIL } else { slots[i - 1] };
            rec.next = if i + 1 < slots.len() { slots[i + 1] } else { NIL };
            self.parts.insert(slots[i], rec);
            self.save_part(slots[i])?;
        }
        self.message_mut(msg)?.parts_head = slots.first().copied().unwrap_or(NIL);
        self.save_message(msg)
    }

    // ---- integrity ----

    fn check_integrity(&mut self) -> Result<(), StoreError> {
        let mut seen: HashSet<u32> = HashSet::new();

        let convs = self.check_list(ListKind::Conversations, NIL, &mut seen)?;
        for conv in convs {
            for keys in self.check_list(ListKind::Keys, conv, &mut seen)? {
                if self.links(ListKind::Keys, keys)?.parent != conv {
                    return Err(StoreError::Corrupt("session keys parent mismatch"));
                }
            }
            for msg in self.check_list(ListKind::Messages, conv, &mut seen)? {
                if self.links(ListKind::Messages, msg)?.parent != conv {
                    return Err(StoreError::Corrupt("message parent mismatch"));
                }
                for part in self.check_list(ListKind::Parts, msg, &mut seen)? {
                    if self.links(ListKind::Parts, part)?.parent != msg {
                        return Err(StoreError::Corrupt("part parent mismatch"));
                    }
                }
            }
        }

        let cap = self.io.block_count();
        let mut count = 0u32;
        let mut cur = self.header.free_head;
        while cur != NIL {
            if !seen.insert(cur) {
                return Err(StoreError::Corrupt("free slot also reachable elsewhere"));
            }
            count += 1;
            if count > cap {
                return Err(StoreError::Corrupt("free list cycle"));
            }
            let payload = self.read_payload(cur)?;
            cur = record::decode_free(&payload)?;
        }
        Ok(())
    }

    /// Forward walk plus the checks that make the backward walk
    /// redundant: every prev pointer must mirror the forward order, and
    /// no slot may already be reachable from elsewhere.
    fn check_list(
        &mut self,
        kind: ListKind,
        parent: u32,
        seen: &mut HashSet<u32>,
    ) -> Result<Vec<u32>, StoreError> {
        let forward = self.walk(kind, parent)?;
        let mut expected_prev = NIL;
        for &index in &forward {
            if !seen.insert(index) {
                return Err(StoreError::Corrupt("slot reachable twice"));
            }
            if self.links(kind, index)?.prev != expected_prev {
                return Err(StoreError::Corrupt("prev pointer does not mirror forward order"));
            }
            expected_prev = index;
        }
        Ok(forward)
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemBlockIo;

    fn test_master() -> MasterKey {
        MasterKey::from_bytes([7u8; 32])
    }

    fn new_store() -> (Store<MemBlockIo>, MemBlockIo) {
        let io = MemBlockIo::new();
        let store = Store::create(io.clone(), test_master()).unwrap();
        (store, io)
    }

    #[test]
    fn test_create_formats_initial_batch() {
        let (store, io) = new_store();
        assert_eq!(io.block_count(), GROWTH_BATCH as u32);
        assert_eq!(store.empty_entries_count().unwrap(), GROWTH_BATCH as u32 - 1);
        assert!(store.conversations().unwrap().is_empty());
    }

    #[test]
    fn test_create_rejects_nonempty_backing() {
        let mut io = MemBlockIo::new();
        io.append_blocks(&[[0u8; BLOCK_SIZE]]).unwrap();
        assert!(matches!(
            Store::create(io, test_master()),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn test_open_wrong_key_fails() {
        let (_, io) = new_store();
        let result = Store::open(io, MasterKey::from_bytes([8u8; 32]));
        assert!(matches!(
            result,
            Err(StoreError::Crypto(CryptoError::DecryptionFailed))
        ));
    }

    #[test]
    fn test_open_bad_magic_fails() {
        let (_, io) = new_store();
        let mut block = io.raw_block(0).unwrap();
        block[0] ^= 0xFF;
        io.corrupt_block(0, &block);

        assert!(matches!(
            Store::open(io, test_master()),
            Err(StoreError::Format(DecodeError::BadMagic))
        ));
    }

    #[test]
    fn test_conversations_push_front_order() {
        let (store, _) = new_store();
        let a = store.create_conversation("111111111").unwrap();
        let b = store.create_conversation("222222222").unwrap();
        let c = store.create_conversation("333333333").unwrap();

        assert_eq!(store.conversations().unwrap(), vec![c, b, a]);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_persistence_across_reopen() {
        let io = MemBlockIo::new();
        let conv;
        let keys;
        {
            let store = Store::create(io.clone(), test_master()).unwrap();
            conv = store.create_conversation("+447700900123").unwrap();
            keys = store
                .create_session_keys(conv, &SimIdentity::serial("89441100"))
                .unwrap();
            store.set_keys_sent(keys, true).unwrap();
            store.advance_outgoing(keys, 3).unwrap();
        }

        let store = Store::open(io, test_master()).unwrap();
        assert_eq!(store.slot_count(), GROWTH_BATCH as u32);
        assert_eq!(store.conversations().unwrap(), vec![conv]);
        assert_eq!(
            store.conversation_number(conv).unwrap(),
            "+447700900123"
        );
        assert_eq!(store.session_keys_list(conv).unwrap(), vec![keys]);
        assert_eq!(store.key_status(keys).unwrap(), KeyStatus::WaitingForReply);
        assert_eq!(store.outgoing_ratchet(keys).unwrap().1, 3);
        assert_ne!(store.ratchet_private_key(keys).unwrap(), [0u8; 32]);
        assert!(store.session_keys_timestamp(keys).unwrap() > 0);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_allocator_grows_in_batches() {
        let (store, io) = new_store();
        // 31 free slots initially; the 32nd conversation forces growth
        for i in 0..32 {
            store.create_conversation(&format!("4477009{:05}", i)).unwrap();
        }
        assert_eq!(io.block_count(), 2 * GROWTH_BATCH as u32);
        assert_eq!(store.conversations().unwrap().len(), 32);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_free_list_lifo() {
        let (store, _) = new_store();
        let a = store.create_conversation("111111111").unwrap();
        let b = store.create_conversation("222222222").unwrap();
        let c = store.create_conversation("333333333").unwrap();

        store.delete_conversation(a).unwrap();
        store.delete_conversation(b).unwrap();
        store.delete_conversation(c).unwrap();

        // LIFO: the last freed slot comes back first
        assert_eq!(store.create_conversation("444444444").unwrap(), c);
        assert_eq!(store.create_conversation("555555555").unwrap(), b);
        assert_eq!(store.create_conversation("666666666").unwrap(), a);
    }

    #[test]
    fn test_find_by_equivalence_and_upgrade() {
        let (store, _) = new_store();
        let conv = store.create_conversation("07700900123").unwrap();

        let found = store.find_conversation("+447700900123").unwrap();
        assert_eq!(found, Some(conv));
        // Stored record upgraded to the international form
        assert_eq!(
            store.conversation_number(conv).unwrap(),
            "+447700900123"
        );

        assert_eq!(store.find_conversation("447700900123").unwrap(), Some(conv));
        assert_eq!(store.find_conversation("+441110000000").unwrap(), None);
    }

    #[test]
    fn test_cascade_delete_returns_all_slots() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        store
            .create_session_keys(conv, &SimIdentity::serial("S1"))
            .unwrap();
        let msg = store
            .create_message(conv, Direction::Outgoing, 1_000)
            .unwrap();
        store.set_part_count(msg, 3).unwrap();

        let before = store.empty_entries_count().unwrap();
        store.delete_conversation(conv).unwrap();
        let after = store.empty_entries_count().unwrap();

        // conversation + keys + message + 2 parts
        assert_eq!(after, before + 5);
        assert!(store.conversations().unwrap().is_empty());
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_session_keys_lifecycle() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let s1 = SimIdentity::serial("S1");
        let s2 = SimIdentity::number("+447700900999");

        let k1 = store.create_session_keys(conv, &s1).unwrap();
        let k2 = store.create_session_keys(conv, &s2).unwrap();

        assert_eq!(store.session_keys_list(conv).unwrap(), vec![k2, k1]);
        assert_eq!(store.session_keys_for_sim(conv, &s1).unwrap(), Some(k1));
        assert_eq!(store.session_keys_parent(k1).unwrap(), conv);

        store.delete_session_keys(k2).unwrap();
        assert_eq!(store.session_keys_list(conv).unwrap(), vec![k1]);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_ratchet_advances_persist() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let keys = store
            .create_session_keys(conv, &SimIdentity::serial("S1"))
            .unwrap();

        let (key_before, _) = store.outgoing_ratchet(keys).unwrap();
        assert_eq!(store.advance_outgoing(keys, 2).unwrap(), 2);
        let (key_after, counter) = store.outgoing_ratchet(keys).unwrap();

        assert_eq!(counter, 2);
        assert_eq!(key_after, crypto::ratchet_hash(&crypto::ratchet_hash(&key_before)));

        // Incoming is independent
        assert_eq!(store.incoming_ratchet(keys).unwrap().1, 0);
    }

    #[test]
    fn test_replace_session_keys_migration() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let s1 = SimIdentity::serial("S1");
        let s2 = SimIdentity::serial("S2");

        let old_s2 = store.create_session_keys(conv, &s2).unwrap();
        let keep = store.create_session_keys(conv, &s1).unwrap();
        let redundant = store.create_session_keys(conv, &s1).unwrap();

        store.replace_session_keys(conv, &s1, &s2).unwrap();

        let list = store.session_keys_list(conv).unwrap();
        assert_eq!(list.len(), 1);
        let survivor = list[0];
        assert_eq!(store.session_keys_sim(survivor).unwrap(), s2);
        // The first match of the original identity is the one renamed
        assert!(survivor == keep || survivor == redundant);
        assert_ne!(survivor, old_s2);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_replace_session_keys_noop_cases() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let s1 = SimIdentity::serial("S1");
        let s2 = SimIdentity::serial("S2");
        let keys = store.create_session_keys(conv, &s2).unwrap();

        // Same identity on both sides
        store.replace_session_keys(conv, &s2, &s2).unwrap();
        assert_eq!(store.session_keys_list(conv).unwrap(), vec![keys]);

        // No record for the original identity: existing s2 is untouched
        store.replace_session_keys(conv, &s1, &s2).unwrap();
        assert_eq!(store.session_keys_list(conv).unwrap(), vec![keys]);
    }

    #[test]
    fn test_message_parts_indexing() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let msg = store
            .create_message(conv, Direction::Outgoing, 2_000)
            .unwrap();

        store.set_part_data(msg, 0, b"inline").unwrap();
        store
            .assign_parts(msg, &[b"part one".to_vec(), b"part two".to_vec()])
            .unwrap();

        assert_eq!(store.part_count(msg).unwrap(), 3);
        assert_eq!(store.part_data(msg, 0).unwrap(), b"inline");
        assert_eq!(store.part_data(msg, 1).unwrap(), b"part one");
        assert_eq!(store.part_data(msg, 2).unwrap(), b"part two");

        assert!(matches!(
            store.part_data(msg, 3),
            Err(StoreError::OutOfBounds { index: 3, limit: 3 })
        ));
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_set_part_count_preserves_overlap() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let msg = store
            .create_message(conv, Direction::Outgoing, 2_000)
            .unwrap();
        store
            .assign_parts(msg, &[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()])
            .unwrap();

        // Shrink to 2 fragments: only the first chain part survives
        store.set_part_count(msg, 2).unwrap();
        assert_eq!(store.part_count(msg).unwrap(), 2);
        assert_eq!(store.part_data(msg, 1).unwrap(), b"one");

        // Grow to 4: appended parts are empty, existing one keeps content
        store.set_part_count(msg, 4).unwrap();
        assert_eq!(store.part_count(msg).unwrap(), 4);
        assert_eq!(store.part_data(msg, 1).unwrap(), b"one");
        assert_eq!(store.part_data(msg, 2).unwrap(), b"");
        assert_eq!(store.part_data(msg, 3).unwrap(), b"");
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_set_part_count_rejects_zero() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let msg = store.create_message(conv, Direction::Outgoing, 0).unwrap();
        assert!(store.set_part_count(msg, 0).is_err());
    }

    #[test]
    fn test_message_body_split_and_reassemble() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        let msg = store
            .create_message(conv, Direction::Outgoing, 3_000)
            .unwrap();

        // Spans the inline chunk and two overflow parts
        let body: Vec<u8> = (0..(MSG_CHUNK_CAPACITY + PART_CHUNK_CAPACITY + 50))
            .map(|i| (i % 251) as u8)
            .collect();
        store.set_message_body(msg, &body).unwrap();

        assert_eq!(store.part_count(msg).unwrap(), 3);
        assert_eq!(store.message_body(msg).unwrap(), body);

        // Short body replaces the chain entirely
        store.set_message_body(msg, b"tiny").unwrap();
        assert_eq!(store.part_count(msg).unwrap(), 1);
        assert_eq!(store.message_body(msg).unwrap(), b"tiny");
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_unread_bookkeeping() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        store.create_message(conv, Direction::Incoming, 1).unwrap();
        store.create_message(conv, Direction::Incoming, 2).unwrap();
        store.create_message(conv, Direction::Outgoing, 3).unwrap();

        assert_eq!(store.unread_count(conv).unwrap(), 2);
        store.mark_conversation_read(conv).unwrap();
        assert_eq!(store.unread_count(conv).unwrap(), 0);
    }

    #[test]
    fn test_change_notification() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let (store, _) = new_store();
        let fired = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&fired);
        store.set_change_observer(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });

        let conv = store.create_conversation("+447700900123").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Non-list mutations do not notify
        store.create_message(conv, Direction::Outgoing, 0).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        store.delete_conversation(conv).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // Migration with nothing to migrate does not notify
        store
            .change_all_session_keys(&SimIdentity::serial("A"), &SimIdentity::serial("B"))
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        // After clearing the observer, nothing fires
        store.clear_change_observer();
        store.create_conversation("+447700900456").unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_operating_on_freed_slot_fails() {
        let (store, _) = new_store();
        let conv = store.create_conversation("+447700900123").unwrap();
        store.delete_conversation(conv).unwrap();

        assert!(matches!(
            store.conversation_number(conv),
            Err(StoreError::Format(DecodeError::KindMismatch { .. }))
        ));
    }
}
