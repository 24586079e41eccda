//! Common utilities and types shared across DealVault modules.
//!
//! This module provides the error type and the identifier newtypes that are
//! used throughout the codebase, ensuring consistency and type safety.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    AuditLogId, BankAccountId, CredentialFieldId, CredentialId, CredentialLinkId, LegalEntityId,
    MembershipId, SensitiveString, UserId, VaultId,
};
