//! Cryptographic operations for slot encryption and the key ratchet.
//!
//! - AES-256-GCM for authenticated slot encryption (`aes-gcm`)
//! - SHA-256 as the one-way ratchet step (`sha2`)
//! - OS-seeded RNG for nonces, filler, and fresh keys (`rand`)
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: `MasterKey` implements `ZeroizeOnDrop`; ratchet
//!   key material held in records is zeroized by the record types
//! - **Fresh nonce per write**: every slot encryption draws a random 96-bit
//!   nonce, stored ahead of the ciphertext, so rewriting a slot never
//!   reuses a (key, nonce) pair
//! - **Uniform slots**: callers pad plaintext to a fixed size with random
//!   filler before calling [`encrypt`], so ciphertext length reveals
//!   nothing about record type or content

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Nonce size for AES-256-GCM
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for AES-256-GCM
pub const TAG_SIZE: usize = 16;

/// Bytes of every ciphertext spent on nonce + tag
pub const ENCRYPTION_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Size of the master key in bytes
pub const MASTER_KEY_SIZE: usize = 32;

/// Size of a ratchet key in bytes (SHA-256 output)
pub const RATCHET_KEY_SIZE: usize = 32;

/// One ratchet key (outgoing, incoming, or the exchange private key)
pub type RatchetKey = [u8; RATCHET_KEY_SIZE];

/// Error types for crypto operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("invalid ciphertext length")]
    InvalidLength,
}

/// Master key protecting every slot of the backing file (32 bytes).
/// Derivation from a passphrase happens outside this crate.
/// Automatically zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; MASTER_KEY_SIZE]);

impl MasterKey {
    /// Wrap externally derived key bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; MASTER_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random master key
    #[must_use]
    pub fn random() -> Self {
        let mut key = [0u8; MASTER_KEY_SIZE];
        fill_random(&mut key);
        Self(key)
    }

    /// Get the key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_SIZE] {
        &self.0
    }
}

/// Fill a buffer with cryptographically secure random bytes
pub fn fill_random(buf: &mut [u8]) {
    rand::thread_rng().fill_bytes(buf);
}

/// Generate a fresh random ratchet key
#[must_use]
pub fn random_key() -> RatchetKey {
    let mut key = [0u8; RATCHET_KEY_SIZE];
    fill_random(&mut key);
    key
}

/// One ratchet step: key' = SHA-256(key).
///
/// One-way by construction; advancing a key can never be undone, which is
/// what makes a compromised current key useless against past messages.
#[must_use]
pub fn ratchet_hash(key: &RatchetKey) -> RatchetKey {
    let digest = Sha256::digest(key);
    let mut next = [0u8; RATCHET_KEY_SIZE];
    next.copy_from_slice(&digest);
    next
}

/// Encrypt a slot payload with AES-256-GCM.
///
/// Output layout: nonce (12 bytes) + ciphertext + tag (16 bytes), so the
/// result is exactly `plaintext.len() + ENCRYPTION_OVERHEAD` bytes.
pub fn encrypt(master: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(master.as_bytes()).map_err(|_| CryptoError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    fill_random(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a slot payload produced by [`encrypt`].
///
/// Fails with `DecryptionFailed` on authentication mismatch (wrong master
/// key or corrupted ciphertext).
pub fn decrypt(master: &MasterKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < ENCRYPTION_OVERHEAD {
        return Err(CryptoError::InvalidLength);
    }

    let cipher =
        Aes256Gcm::new_from_slice(master.as_bytes()).map_err(|_| CryptoError::DecryptionFailed)?;

    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| CryptoError::DecryptionFailed)
}
