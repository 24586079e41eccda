//! Credential records: secrets, custom fields and links to business records.
//!
//! The structs here are plain data. Every read or write that needs a
//! permission check or an audit record goes through
//! [`CredentialOperations`](crate::credentials::CredentialOperations).

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::Serialize;
use serde_json::Value;

use crate::rotation::{RotationPolicy, RotationStatus};
use crate::store::{from_db_json, from_db_tag, from_db_time, from_db_time_opt};
use crate::tag::tagged_enum;
use dealvault_common::{
    CredentialFieldId, CredentialId, CredentialLinkId, LegalEntityId, SensitiveString, UserId,
    VaultId,
};
use dealvault_crypto::{EncryptedField, FieldSpec};

// Credential values are only trimmed. Dashes and inner spaces are
// significant in passwords, tokens and notes; only numeric identifiers
// (bank numbers, EIN) are compacted.
pub const USERNAME: FieldSpec = FieldSpec::verbatim("username", 4);
pub const EMAIL: FieldSpec = FieldSpec::verbatim("email", 4);
pub const SECRET: FieldSpec = FieldSpec::verbatim("secret", 4);
pub const NOTES: FieldSpec = FieldSpec::verbatim("notes", 0);
/// Custom field values, trimmed like the built-in secrets.
pub const FIELD_VALUE: FieldSpec = FieldSpec::verbatim("value", 4);

tagged_enum! {
    /// What kind of secret a credential holds.
    pub enum CredentialType in "credential_type" {
        Login => ("login", "Login"),
        ApiKey => ("api_key", "API Key"),
        SshKey => ("ssh_key", "SSH Key"),
        Database => ("database", "Database"),
        BankPortal => ("bank_portal", "Bank Portal"),
        CloudProvider => ("cloud_provider", "Cloud Provider"),
        OtpSeed => ("otp_seed", "OTP Seed"),
        RecoveryCodes => ("recovery_codes", "Recovery Codes"),
        Other => ("other", "Other"),
    }
}

impl Default for CredentialType {
    fn default() -> Self {
        Self::Login
    }
}

tagged_enum! {
    pub enum Sensitivity in "sensitivity" {
        Internal => ("internal", "Internal"),
        Confidential => ("confidential", "Confidential"),
        HighlyConfidential => ("highly_confidential", "Highly Confidential"),
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Self::Confidential
    }
}

tagged_enum! {
    pub enum FieldType in "field_type" {
        Text => ("text", "Text"),
        Password => ("password", "Password"),
        Token => ("token", "Token"),
        Pin => ("pin", "PIN"),
        Note => ("note", "Note"),
    }
}

impl Default for FieldType {
    fn default() -> Self {
        Self::Text
    }
}

tagged_enum! {
    /// How a credential relates to the record it is linked to.
    pub enum LinkRelationship in "relationship" {
        General => ("general", "General"),
        Primary => ("primary", "Primary"),
        Login => ("login", "Login"),
        Admin => ("admin", "Admin"),
        Backup => ("backup", "Backup"),
    }
}

impl Default for LinkRelationship {
    fn default() -> Self {
        Self::General
    }
}

tagged_enum! {
    pub enum LinkTargetKind in "linkable_type" {
        Deal => ("deal", "Deal"),
        Organization => ("organization", "Organization"),
        Person => ("person", "Person"),
        LegalEntity => ("legal_entity", "Legal Entity"),
    }
}

/// A business record a credential can be linked to.
///
/// Deals, organizations and people live outside this crate; only their ids
/// are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum LinkTarget {
    Deal(i64),
    Organization(i64),
    Person(i64),
    LegalEntity(LegalEntityId),
}

impl LinkTarget {
    pub fn kind(&self) -> LinkTargetKind {
        match self {
            Self::Deal(_) => LinkTargetKind::Deal,
            Self::Organization(_) => LinkTargetKind::Organization,
            Self::Person(_) => LinkTargetKind::Person,
            Self::LegalEntity(_) => LinkTargetKind::LegalEntity,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Deal(id) | Self::Organization(id) | Self::Person(id) => *id,
            Self::LegalEntity(id) => id.get(),
        }
    }

    pub fn from_parts(kind: LinkTargetKind, id: i64) -> Self {
        match kind {
            LinkTargetKind::Deal => Self::Deal(id),
            LinkTargetKind::Organization => Self::Organization(id),
            LinkTargetKind::Person => Self::Person(id),
            LinkTargetKind::LegalEntity => Self::LegalEntity(LegalEntityId::new(id)),
        }
    }
}

/// A stored credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: CredentialId,
    pub vault_id: VaultId,
    pub title: String,
    pub credential_type: CredentialType,
    pub url: Option<String>,
    pub(crate) username: EncryptedField,
    pub(crate) email: EncryptedField,
    pub(crate) secret: EncryptedField,
    pub(crate) notes: EncryptedField,
    pub rotation: RotationPolicy,
    pub sensitivity: Sensitivity,
    pub metadata: Value,
    pub created_by: Option<UserId>,
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const CREDENTIAL_COLUMNS: &str = "id, vault_id, title, credential_type, url, \
    username_ciphertext, username_last4, email_ciphertext, email_last4, \
    secret_ciphertext, secret_last4, notes_ciphertext, \
    secret_last_rotated_at, rotation_interval_days, sensitivity, metadata, \
    created_by_id, updated_by_id, created_at, updated_at";

impl Credential {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: CredentialId::new(row.get(0)?),
            vault_id: VaultId::new(row.get(1)?),
            title: row.get(2)?,
            credential_type: from_db_tag(&row.get::<_, String>(3)?)?,
            url: row.get(4)?,
            username: EncryptedField::restore(USERNAME, row.get(5)?, row.get(6)?),
            email: EncryptedField::restore(EMAIL, row.get(7)?, row.get(8)?),
            secret: EncryptedField::restore(SECRET, row.get(9)?, row.get(10)?),
            notes: EncryptedField::restore(NOTES, row.get(11)?, None),
            rotation: RotationPolicy::new(row.get(13)?, from_db_time_opt(row.get(12)?)?),
            sensitivity: from_db_tag(&row.get::<_, String>(14)?)?,
            metadata: from_db_json(&row.get::<_, String>(15)?)?,
            created_by: row.get::<_, Option<i64>>(16)?.map(UserId::new),
            updated_by: row.get::<_, Option<i64>>(17)?.map(UserId::new),
            created_at: from_db_time(&row.get::<_, String>(18)?)?,
            updated_at: from_db_time(&row.get::<_, String>(19)?)?,
        })
    }

    /// Encrypted fields by name.
    pub(crate) fn field(&self, name: &str) -> Option<&EncryptedField> {
        match name {
            "username" => Some(&self.username),
            "email" => Some(&self.email),
            "secret" => Some(&self.secret),
            "notes" => Some(&self.notes),
            _ => None,
        }
    }

    /// Record a rotation at `now`.
    pub fn mark_secret_rotated(&mut self, now: DateTime<Utc>) {
        self.rotation.last_rotated_at = Some(now);
    }

    pub fn rotation_status(&self, now: DateTime<Utc>) -> RotationStatus {
        self.rotation.status(now)
    }

    pub fn days_until_rotation(&self, now: DateTime<Utc>) -> Option<i64> {
        self.rotation.days_until_rotation(now)
    }

    /// Masked view, safe to log and display.
    pub fn summary(&self, now: DateTime<Utc>) -> CredentialSummary {
        CredentialSummary {
            id: self.id,
            vault_id: self.vault_id,
            title: self.title.clone(),
            credential_type: self.credential_type,
            url: self.url.clone(),
            username: self.username.masked(),
            email: self.email.masked(),
            secret: self.secret.masked(),
            has_notes: self.notes.present(),
            sensitivity: self.sensitivity,
            rotation_status: self.rotation_status(now),
            days_until_rotation: self.days_until_rotation(now),
            secret_last_rotated_at: self.rotation.last_rotated_at,
            updated_at: self.updated_at,
        }
    }
}

/// Masked view of a credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialSummary {
    pub id: CredentialId,
    pub vault_id: VaultId,
    pub title: String,
    pub credential_type: CredentialType,
    pub url: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub secret: Option<String>,
    pub has_notes: bool,
    pub sensitivity: Sensitivity,
    pub rotation_status: RotationStatus,
    pub days_until_rotation: Option<i64>,
    pub secret_last_rotated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A custom field on a credential.
#[derive(Debug, Clone)]
pub struct CredentialField {
    pub id: CredentialFieldId,
    pub credential_id: CredentialId,
    pub label: String,
    pub field_type: FieldType,
    pub(crate) value: EncryptedField,
    pub is_secret: bool,
    pub sort_order: i64,
}

pub(crate) const FIELD_COLUMNS: &str =
    "id, credential_id, label, field_type, value_ciphertext, value_last4, is_secret, sort_order";

impl CredentialField {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: CredentialFieldId::new(row.get(0)?),
            credential_id: CredentialId::new(row.get(1)?),
            label: row.get(2)?,
            field_type: from_db_tag(&row.get::<_, String>(3)?)?,
            value: EncryptedField::restore(FIELD_VALUE, row.get(4)?, row.get(5)?),
            is_secret: row.get(6)?,
            sort_order: row.get(7)?,
        })
    }

    /// Masked value. Fields are encrypted whether or not they are secret,
    /// so plaintext is only available through an audited reveal.
    pub fn masked_value(&self) -> Option<String> {
        self.value.masked()
    }
}

/// Input for a new custom field.
#[derive(Debug, Clone, Default)]
pub struct NewField {
    pub label: String,
    pub field_type: FieldType,
    pub value: Option<String>,
    pub is_secret: bool,
    pub sort_order: i64,
}

impl NewField {
    pub fn secret(label: impl Into<String>, field_type: FieldType, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            field_type,
            value: Some(value.into()),
            is_secret: true,
            sort_order: 0,
        }
    }
}

/// Changes to a custom field. `None` leaves a property as it is; a blank
/// value clears the stored value.
#[derive(Debug, Clone, Default)]
pub struct FieldUpdate {
    pub label: Option<String>,
    pub field_type: Option<FieldType>,
    pub value: Option<String>,
    pub is_secret: Option<bool>,
    pub sort_order: Option<i64>,
}

/// A link from a credential to a business record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialLink {
    pub id: CredentialLinkId,
    pub credential_id: CredentialId,
    pub target: LinkTarget,
    pub relationship: LinkRelationship,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
}

pub(crate) const LINK_COLUMNS: &str =
    "id, credential_id, linkable_type, linkable_id, relationship, created_by_id, created_at";

impl CredentialLink {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let kind: LinkTargetKind = from_db_tag(&row.get::<_, String>(2)?)?;
        Ok(Self {
            id: CredentialLinkId::new(row.get(0)?),
            credential_id: CredentialId::new(row.get(1)?),
            target: LinkTarget::from_parts(kind, row.get(3)?),
            relationship: from_db_tag(&row.get::<_, String>(4)?)?,
            created_by: row.get::<_, Option<i64>>(5)?.map(UserId::new),
            created_at: from_db_time(&row.get::<_, String>(6)?)?,
        })
    }
}

/// Input for a new credential.
#[derive(Debug, Clone, Default)]
pub struct NewCredential {
    pub title: String,
    pub credential_type: CredentialType,
    pub url: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub secret: Option<String>,
    pub notes: Option<String>,
    pub rotation_interval_days: Option<i64>,
    pub sensitivity: Sensitivity,
    pub metadata: Option<Value>,
}

impl NewCredential {
    pub fn new(title: impl Into<String>, credential_type: CredentialType) -> Self {
        Self {
            title: title.into(),
            credential_type,
            ..Self::default()
        }
    }
}

/// Changes to an existing credential. `None` leaves a field as it is; for
/// encrypted fields `Some("")` clears the value.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub title: Option<String>,
    pub credential_type: Option<CredentialType>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
    pub secret: Option<String>,
    pub notes: Option<String>,
    /// `Some(None)` removes the rotation policy.
    pub rotation_interval_days: Option<Option<i64>>,
    pub sensitivity: Option<Sensitivity>,
    pub metadata: Option<Value>,
}

/// Filters for listing credentials in a vault.
#[derive(Debug, Clone, Default)]
pub struct CredentialFilter {
    pub credential_type: Option<CredentialType>,
    pub sensitivity: Option<Sensitivity>,
    pub rotation_status: Option<RotationStatus>,
    /// Case-insensitive match on title or URL.
    pub search: Option<String>,
    pub linked_to: Option<LinkTarget>,
}

/// Decrypted credential contents returned by an audited reveal.
///
/// Values are zeroized on drop. A `None` value is either absent or
/// could not be decrypted.
#[derive(Debug, Serialize)]
pub struct RevealedCredential {
    pub credential_id: CredentialId,
    pub title: String,
    pub username: Option<SensitiveString>,
    pub email: Option<SensitiveString>,
    pub secret: Option<SensitiveString>,
    pub notes: Option<SensitiveString>,
    pub fields: Vec<RevealedField>,
}

#[derive(Debug, Serialize)]
pub struct RevealedField {
    pub label: String,
    pub field_type: FieldType,
    pub is_secret: bool,
    pub value: Option<SensitiveString>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use dealvault_crypto::Normalization;

    #[test]
    fn test_type_labels() {
        assert_eq!(CredentialType::ApiKey.label(), "API Key");
        assert_eq!(CredentialType::ALL.len(), 9);
        assert_eq!("otp_seed".parse::<CredentialType>().unwrap(), CredentialType::OtpSeed);
        assert_eq!(Sensitivity::default(), Sensitivity::Confidential);
        assert_eq!(Sensitivity::HighlyConfidential.as_str(), "highly_confidential");
        assert!("secret".parse::<FieldType>().unwrap_err().is_validation());
    }

    #[test]
    fn test_credential_values_keep_dashes_and_spaces() {
        for spec in [USERNAME, EMAIL, SECRET, NOTES, FIELD_VALUE] {
            assert_eq!(spec.normalization, Normalization::Verbatim, "{}", spec.name);
            assert_eq!(spec.clean("  pass-word 12 \n"), "pass-word 12");
        }
        assert_eq!(crate::bank_account::ACCOUNT_NUMBER.clean(" 12-34 56 "), "123456");
    }

    #[test]
    fn test_link_target_parts() {
        let target = LinkTarget::LegalEntity(LegalEntityId::new(8));
        assert_eq!(target.kind(), LinkTargetKind::LegalEntity);
        assert_eq!(LinkTarget::from_parts(target.kind(), target.id()), target);
        assert_eq!(
            serde_json::to_value(LinkTarget::Deal(3)).unwrap(),
            serde_json::json!({"type": "deal", "id": 3})
        );
    }

    #[test]
    fn test_summary_is_masked() {
        let now = Utc::now();
        let credential = Credential {
            id: CredentialId::new(1),
            vault_id: VaultId::new(1),
            title: "Bank portal".into(),
            credential_type: CredentialType::BankPortal,
            url: None,
            username: EncryptedField::restore(USERNAME, Some("v1:x".into()), Some("ops1".into())),
            email: EncryptedField::new(EMAIL),
            secret: EncryptedField::restore(SECRET, Some("v1:y".into()), Some("4321".into())),
            notes: EncryptedField::restore(NOTES, Some("v1:z".into()), None),
            rotation: RotationPolicy::new(Some(30), Some(now - Duration::days(27))),
            sensitivity: Sensitivity::HighlyConfidential,
            metadata: Value::Object(Default::default()),
            created_by: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        };

        let summary = credential.summary(now);
        assert_eq!(summary.secret.as_deref(), Some("••••4321"));
        assert_eq!(summary.username.as_deref(), Some("••••ops1"));
        assert_eq!(summary.email, None);
        assert!(summary.has_notes);
        assert_eq!(summary.rotation_status, RotationStatus::DueSoon);
        assert_eq!(summary.days_until_rotation, Some(3));
    }
}
