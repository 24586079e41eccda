//! Bank account records.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::Serialize;
use serde_json::Value;

use crate::store::{from_db_json, from_db_tag, from_db_time};
use crate::tag::tagged_enum;
use dealvault_common::{BankAccountId, LegalEntityId, SensitiveString, UserId};
use dealvault_crypto::{EncryptedField, FieldSpec};

pub const ROUTING_NUMBER: FieldSpec = FieldSpec::compact("routing_number", 4);
pub const ACCOUNT_NUMBER: FieldSpec = FieldSpec::compact("account_number", 4);
pub const SWIFT: FieldSpec = FieldSpec::compact("swift", 0);

tagged_enum! {
    pub enum AccountType in "account_type" {
        Checking => ("checking", "Checking"),
        Savings => ("savings", "Savings"),
        Brokerage => ("brokerage", "Brokerage"),
        Trust => ("trust", "Trust"),
        Other => ("other", "Other"),
    }
}

tagged_enum! {
    pub enum AccountStatus in "status" {
        Active => ("active", "Active"),
        Closed => ("closed", "Closed"),
    }
}

impl Default for AccountStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// A bank account owned by a legal entity.
#[derive(Debug, Clone)]
pub struct BankAccount {
    pub id: BankAccountId,
    pub legal_entity_id: LegalEntityId,
    pub bank_name: Option<String>,
    pub account_name: Option<String>,
    pub account_type: Option<AccountType>,
    pub nickname: Option<String>,
    pub(crate) routing_number: EncryptedField,
    pub(crate) account_number: EncryptedField,
    pub(crate) swift: EncryptedField,
    pub is_primary: bool,
    pub status: AccountStatus,
    pub metadata: Value,
    pub created_by: Option<UserId>,
    pub updated_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) const COLUMNS: &str = "id, legal_entity_id, bank_name, account_name, account_type, nickname, \
    routing_number_ciphertext, routing_last4, account_number_ciphertext, account_last4, swift_ciphertext, \
    is_primary, status, metadata, created_by_id, updated_by_id, created_at, updated_at";

impl BankAccount {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: BankAccountId::new(row.get(0)?),
            legal_entity_id: LegalEntityId::new(row.get(1)?),
            bank_name: row.get(2)?,
            account_name: row.get(3)?,
            account_type: row
                .get::<_, Option<String>>(4)?
                .as_deref()
                .map(from_db_tag)
                .transpose()?,
            nickname: row.get(5)?,
            routing_number: EncryptedField::restore(ROUTING_NUMBER, row.get(6)?, row.get(7)?),
            account_number: EncryptedField::restore(ACCOUNT_NUMBER, row.get(8)?, row.get(9)?),
            swift: EncryptedField::restore(SWIFT, row.get(10)?, None),
            is_primary: row.get(11)?,
            status: from_db_tag(&row.get::<_, String>(12)?)?,
            metadata: from_db_json(&row.get::<_, String>(13)?)?,
            created_by: row.get::<_, Option<i64>>(14)?.map(UserId::new),
            updated_by: row.get::<_, Option<i64>>(15)?.map(UserId::new),
            created_at: from_db_time(&row.get::<_, String>(16)?)?,
            updated_at: from_db_time(&row.get::<_, String>(17)?)?,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Nickname, else "bank - account name", else whichever of the two exists.
    pub fn display_name(&self) -> String {
        let nonblank = |s: &Option<String>| s.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        if let Some(nickname) = nonblank(&self.nickname) {
            return nickname;
        }
        match (nonblank(&self.bank_name), nonblank(&self.account_name)) {
            (Some(bank), Some(account)) => format!("{} - {}", bank, account),
            (Some(one), None) | (None, Some(one)) => one,
            (None, None) => format!("Bank Account #{}", self.id),
        }
    }

    /// "Bank · Type · ••••1234", skipping missing parts.
    pub fn summary(&self) -> String {
        [
            self.bank_name.clone().filter(|s| !s.trim().is_empty()),
            self.account_type.map(|t| t.label().to_string()),
            self.account_number.masked(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" · ")
    }

    /// Masked view, safe to log and display.
    pub fn masked(&self) -> BankAccountSummary {
        BankAccountSummary {
            id: self.id,
            legal_entity_id: self.legal_entity_id,
            display_name: self.display_name(),
            summary: self.summary(),
            routing_number: self.routing_number.masked(),
            account_number: self.account_number.masked(),
            swift: self.swift.masked(),
            is_primary: self.is_primary,
            status: self.status,
        }
    }
}

/// Masked view of a bank account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BankAccountSummary {
    pub id: BankAccountId,
    pub legal_entity_id: LegalEntityId,
    pub display_name: String,
    pub summary: String,
    pub routing_number: Option<String>,
    pub account_number: Option<String>,
    pub swift: Option<String>,
    pub is_primary: bool,
    pub status: AccountStatus,
}

/// Input for a new bank account.
#[derive(Debug, Clone, Default)]
pub struct NewBankAccount {
    pub bank_name: Option<String>,
    pub account_name: Option<String>,
    pub account_type: Option<AccountType>,
    pub nickname: Option<String>,
    pub routing_number: Option<String>,
    pub account_number: Option<String>,
    pub swift: Option<String>,
    pub is_primary: bool,
    pub metadata: Option<Value>,
}

/// Changes to a bank account. `None` leaves a field as it is; for the
/// encrypted numbers `Some("")` clears the value.
#[derive(Debug, Clone, Default)]
pub struct BankAccountUpdate {
    pub bank_name: Option<String>,
    pub account_name: Option<String>,
    pub account_type: Option<AccountType>,
    pub nickname: Option<String>,
    pub routing_number: Option<String>,
    pub account_number: Option<String>,
    pub swift: Option<String>,
    pub is_primary: Option<bool>,
    pub status: Option<AccountStatus>,
}

/// Decrypted numbers returned by an audited reveal.
#[derive(Debug, Serialize)]
pub struct RevealedBankNumbers {
    pub bank_account_id: BankAccountId,
    pub routing_number: Option<SensitiveString>,
    pub account_number: Option<SensitiveString>,
    pub swift: Option<SensitiveString>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> BankAccount {
        let now = Utc::now();
        BankAccount {
            id: BankAccountId::new(3),
            legal_entity_id: LegalEntityId::new(1),
            bank_name: Some("First Republic".into()),
            account_name: Some("Operating".into()),
            account_type: Some(AccountType::Checking),
            nickname: None,
            routing_number: EncryptedField::restore(ROUTING_NUMBER, Some("v1:a".into()), Some("0021".into())),
            account_number: EncryptedField::restore(ACCOUNT_NUMBER, Some("v1:b".into()), Some("1234".into())),
            swift: EncryptedField::restore(SWIFT, Some("v1:c".into()), None),
            is_primary: true,
            status: AccountStatus::Active,
            metadata: Value::Object(Default::default()),
            created_by: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut account = account();
        assert_eq!(account.display_name(), "First Republic - Operating");
        account.nickname = Some("Main op".into());
        assert_eq!(account.display_name(), "Main op");
        account.nickname = Some("  ".into());
        account.account_name = None;
        assert_eq!(account.display_name(), "First Republic");
        account.bank_name = None;
        assert_eq!(account.display_name(), "Bank Account #3");
    }

    #[test]
    fn test_summary_line() {
        let mut account = account();
        assert_eq!(account.summary(), "First Republic · Checking · ••••1234");
        account.account_type = None;
        account.account_number = EncryptedField::new(ACCOUNT_NUMBER);
        assert_eq!(account.summary(), "First Republic");
    }

    #[test]
    fn test_swift_masks_fully() {
        let masked = account().masked();
        assert_eq!(masked.swift.as_deref(), Some(dealvault_crypto::PRESENT_INDICATOR));
        assert_eq!(masked.routing_number.as_deref(), Some("••••0021"));
    }
}
