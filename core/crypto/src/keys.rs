//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of the key-derivation salt in bytes.
pub const SALT_LENGTH: usize = 32;

/// Field-encryption master key.
///
/// Derived once at startup from the configured master secret and shared by
/// every encrypted field in the process.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LENGTH],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Short non-secret fingerprint for startup logs.
    ///
    /// BLAKE2b over the key with a fixed label, first 4 bytes hex encoded.
    /// Lets operators confirm two processes share a key without exposing it.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(b"dealvault-key-fingerprint");
        hasher.update(self.key);
        let digest = hasher.finalize();
        digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Salt for key derivation.
///
/// Field encryption uses one fixed salt computed from the application
/// context string, so every process with the same master secret derives the
/// same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Derive the salt for a fixed application context string.
    pub fn for_context(context: &str) -> Self {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(context.as_bytes());
        let digest = hasher.finalize();
        let mut salt = [0u8; SALT_LENGTH];
        salt.copy_from_slice(&digest);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}
