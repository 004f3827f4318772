//! Courier Store - Encrypted record store for the Courier secure-messaging app
//!
//! This crate is the persistent layer under the Courier messenger: one flat
//! file holding every conversation, the per-SIM session keys, and all
//! message bodies. It uses:
//! - Fixed-size slots (256 bytes), encrypted one by one with AES-256-GCM
//! - Random filler padding so slot type and content length stay hidden
//! - Intrusive doubly-linked lists over a LIFO free-slot allocator
//! - A one-way hash ratchet embedded in each session-keys record
//!
//! ## Architecture
//!
//! ```text
//! Messenger UI / SMS transport
//!     ↓ create / find / delete, ratchet advance, part data
//! Store<F: BlockIo>
//!     ├── Header singleton (slot 0: free-stack head, conversation head)
//!     ├── Per-type record caches (slot index → decrypted record)
//!     ├── Free-slot allocator (LIFO stack, grows the file in batches)
//!     └── Slot encryption (AES-256-GCM, random filler)
//!     ↓ read_block/write_block/append_blocks
//! BlockIo (file with advisory lock, or in-memory for tests)
//!     ↓
//! store.bin: [Header][Conversation][SessionKeys][Message][Part][Free]...
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod conversation;
pub mod crypto;
pub mod fs;
pub mod message;
pub mod record;
pub mod session_keys;
pub mod store;

pub use conversation::{phone_numbers_match, PHONE_MAX};
pub use crypto::{
    CryptoError, MasterKey, RatchetKey, ENCRYPTION_OVERHEAD, MASTER_KEY_SIZE, NONCE_SIZE,
    RATCHET_KEY_SIZE, TAG_SIZE,
};
pub use fs::{Block, BlockIo, FileBlockIo, IoError, MemBlockIo, BLOCK_SIZE};
pub use message::{
    Direction, MessageFlags, MSG_CHUNK_CAPACITY, PART_CHUNK_CAPACITY,
};
pub use record::{Header, RecordKind, DecodeError, FORMAT_VERSION, GROWTH_BATCH, MAGIC, NIL, PAYLOAD_SIZE};
pub use session_keys::{KeyStatus, SimIdentity, COUNTER_MAX, SIM_VALUE_MAX};
pub use store::{Store, StoreError};
