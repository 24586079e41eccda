//! Master key derivation using Argon2id.
//!
//! The configured master secret is stretched once at startup into the
//! 256-bit field-encryption key. The salt is fixed per application context
//! (see [`Salt::for_context`]) so the derivation is stable across restarts.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};

use crate::keys::{MasterKey, Salt, KEY_LENGTH};
use dealvault_common::{Error, Result};

/// Context string bound into every field-encryption key.
pub const KEY_CONTEXT: &str = "dealvault-field-encryption";

/// Parameters for Argon2id key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Number of iterations.
    pub time_cost: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Parameters for a long-running server process.
    pub fn interactive() -> Self {
        Self {
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Higher cost parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Moderate parameters for constrained hosts and tooling.
    pub fn moderate() -> Self {
        Self {
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// Parse a named strength: "interactive", "moderate" or "sensitive".
    pub fn from_strength(name: &str) -> Result<Self> {
        match name {
            "interactive" => Ok(Self::interactive()),
            "moderate" => Ok(Self::moderate()),
            "sensitive" => Ok(Self::sensitive()),
            other => Err(Error::Config(format!(
                "Unknown KDF strength '{}'; use interactive, moderate or sensitive",
                other
            ))),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a master key from a secret and salt using Argon2id.
///
/// # Errors
/// - Returns error if the secret is empty
/// - Returns error if Argon2id parameters are invalid
///
/// # Security
/// - The secret is not stored or logged
pub fn derive_key(secret: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if secret.is_empty() {
        return Err(Error::Config("Master secret cannot be empty".to_string()));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(secret, salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;

    Ok(MasterKey::from_bytes(key_bytes))
}

/// Derive the field-encryption key for [`KEY_CONTEXT`].
pub fn derive_master_key(secret: &[u8], params: &KdfParams) -> Result<MasterKey> {
    derive_key(secret, &Salt::for_context(KEY_CONTEXT), params)
}
