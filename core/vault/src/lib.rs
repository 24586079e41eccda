//! Vault engine for DealVault.
//!
//! This module provides:
//! - Vaults with per-member roles (admin, editor, revealer, viewer)
//! - Credentials with encrypted secrets, custom fields and links
//! - Bank accounts and legal entities with encrypted numbers
//! - Rotation policy evaluation
//! - The append-only security audit log
//!
//! # Architecture
//! Services share one [`Store`] and one [`EncryptionEngine`] by `Arc`.
//! Every sensitive operation checks permissions and writes its audit
//! record inside the same database transaction as the change.

pub mod access;
pub mod audit;
pub mod bank_account;
pub mod banking;
pub mod context;
pub mod credential;
pub mod credentials;
pub mod legal_entity;
pub mod rotation;
pub mod store;
mod tag;
pub mod users;
pub mod vault;

pub use access::{Capability, Role, UserRole};
pub use audit::{
    AuditAction, AuditEntry, AuditLog, AuditPage, AuditQuery, AuditRecord, AuditTarget,
    AuditTargetKind,
};
pub use bank_account::{
    AccountStatus, AccountType, BankAccount, BankAccountSummary, BankAccountUpdate,
    NewBankAccount, RevealedBankNumbers,
};
pub use banking::BankAccounts;
pub use context::RequestContext;
pub use credential::{
    Credential, CredentialField, CredentialFilter, CredentialLink, CredentialSummary,
    CredentialType, CredentialUpdate, FieldType, FieldUpdate, LinkRelationship, LinkTarget,
    LinkTargetKind, NewCredential, NewField, RevealedCredential, RevealedField, Sensitivity,
};
pub use credentials::CredentialOperations;
pub use legal_entity::{
    EntityStatus, EntityType, LegalEntities, LegalEntity, LegalEntitySummary, NewLegalEntity,
};
pub use rotation::{
    RotationPolicy, RotationStatus, RotationSummary, MAX_ROTATION_INTERVAL_DAYS,
    ROTATION_WARNING_DAYS,
};
pub use store::Store;
pub use users::{User, UserDirectory};
pub use vault::{Membership, Vault, VaultManager, VaultStats, VaultUpdate};

use std::path::Path;
use std::sync::Arc;

use dealvault_common::Result;
use dealvault_crypto::{EncryptionEngine, EngineConfig};

/// Entry point wiring the store and the engine into every service.
#[derive(Clone)]
pub struct DealVault {
    store: Arc<Store>,
    engine: Arc<EncryptionEngine>,
}

impl DealVault {
    pub fn new(store: Arc<Store>, engine: Arc<EncryptionEngine>) -> Self {
        Self { store, engine }
    }

    /// Open (or create) the database and build the engine from configuration.
    ///
    /// # Errors
    /// - `Error::Config` if the engine cannot start; fatal
    /// - Storage failure opening the database
    pub fn open(db_path: impl AsRef<Path>, config: &EngineConfig) -> Result<Self> {
        let engine = EncryptionEngine::from_config(config)?;
        let store = if db_path.as_ref().as_os_str() == ":memory:" {
            Store::in_memory()?
        } else {
            Store::open(db_path)?
        };
        Ok(Self::new(Arc::new(store), Arc::new(engine)))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn users(&self) -> UserDirectory {
        UserDirectory::new(self.store.clone())
    }

    pub fn vaults(&self) -> VaultManager {
        VaultManager::new(self.store.clone())
    }

    pub fn credentials(&self) -> CredentialOperations {
        CredentialOperations::new(self.store.clone(), self.engine.clone())
    }

    pub fn bank_accounts(&self) -> BankAccounts {
        BankAccounts::new(self.store.clone(), self.engine.clone())
    }

    pub fn legal_entities(&self) -> LegalEntities {
        LegalEntities::new(self.store.clone(), self.engine.clone())
    }

    pub fn audit_log(&self) -> AuditLog {
        AuditLog::new(self.store.clone())
    }
}
