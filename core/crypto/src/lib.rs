//! Cryptographic primitives for DealVault.
//!
//! This module provides:
//! - Master key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - The string-level field encryption engine
//! - The encrypted field type embedded in every secret-holding record
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Decryption failures degrade to "unavailable", never to a wrong value

pub mod aead;
pub mod engine;
pub mod field;
pub mod kdf;
pub mod keys;

pub use engine::{EncryptionEngine, EngineConfig, Environment, DEVELOPMENT_MASTER_SECRET};
pub use field::{EncryptedField, FieldSpec, Normalization, MASK_PREFIX, PRESENT_INDICATOR};
pub use kdf::{derive_key, derive_master_key, KdfParams, KEY_CONTEXT};
pub use keys::{MasterKey, Salt, KEY_LENGTH};
