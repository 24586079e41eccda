//! Bank account operations.
//!
//! Bank accounts sit outside vaults. Managing them and revealing their
//! numbers needs an admin or ops organisation role; denials are recorded
//! like vault denials.
//!
//! Each legal entity has at most one active primary account. Saving a
//! primary demotes the others in the same transaction, a pre-write check
//! rejects a second primary if that did not happen, and the partial unique
//! index `idx_bank_accounts_unique_primary` rejects anything that slips
//! past both.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::access::UserRole;
use crate::audit::{self, AuditAction, AuditEntry, AuditTarget};
use crate::bank_account::{
    AccountStatus, BankAccount, BankAccountSummary, BankAccountUpdate, NewBankAccount,
    RevealedBankNumbers, ACCOUNT_NUMBER, COLUMNS, ROUTING_NUMBER, SWIFT,
};
use crate::context::RequestContext;
use crate::legal_entity;
use crate::store::{constraint, granted, not_found, storage, to_db_time, Gated, Store};
use crate::users;
use dealvault_common::{BankAccountId, Error, LegalEntityId, Result, UserId};
use dealvault_crypto::{EncryptedField, EncryptionEngine};

const PRIMARY_TAKEN: &str = "already has an active primary account for this entity";

pub(crate) fn get(conn: &Connection, id: BankAccountId) -> Result<BankAccount> {
    conn.query_row(
        &format!("SELECT {} FROM bank_accounts WHERE id = ?1", COLUMNS),
        [id.get()],
        BankAccount::from_row,
    )
    .map_err(not_found("bank account", id.get()))
}

fn active_primary(conn: &Connection, entity: LegalEntityId) -> Result<Option<BankAccount>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM bank_accounts WHERE legal_entity_id = ?1 AND is_primary = 1 AND status = 'active'",
            COLUMNS
        ),
        [entity.get()],
        BankAccount::from_row,
    )
    .optional()
    .map_err(storage)
}

/// Clear the primary flag on every other active account of the entity.
fn demote_other_primaries(
    conn: &Connection,
    entity: LegalEntityId,
    keep: Option<BankAccountId>,
) -> Result<usize> {
    let demoted = conn
        .execute(
            "UPDATE bank_accounts SET is_primary = 0, updated_at = ?1
             WHERE legal_entity_id = ?2 AND is_primary = 1 AND status = 'active'
               AND (?3 IS NULL OR id != ?3)",
            params![to_db_time(&Utc::now()), entity.get(), keep.map(|id| id.get())],
        )
        .map_err(storage)?;
    if demoted > 0 {
        debug!(legal_entity_id = %entity, demoted, "Demoted previous primary accounts");
    }
    Ok(demoted)
}

/// Reject a second active primary before writing.
fn check_single_primary(conn: &Connection, account: &BankAccount, existing: Option<BankAccountId>) -> Result<()> {
    if !(account.is_primary && account.is_active()) {
        return Ok(());
    }
    match active_primary(conn, account.legal_entity_id)? {
        Some(other) if Some(other.id) != existing => Err(Error::validation("is_primary", PRIMARY_TAKEN)),
        _ => Ok(()),
    }
}

/// Insert a row exactly as given. Callers demote and validate first.
fn insert(conn: &Connection, a: &BankAccount, actor: UserId) -> Result<BankAccountId> {
    let now = to_db_time(&Utc::now());
    conn.execute(
        "INSERT INTO bank_accounts (legal_entity_id, bank_name, account_name, account_type, nickname,
            routing_number_ciphertext, routing_last4, account_number_ciphertext, account_last4, swift_ciphertext,
            is_primary, status, metadata, created_by_id, updated_by_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, ?15, ?15)",
        params![
            a.legal_entity_id.get(),
            a.bank_name,
            a.account_name,
            a.account_type.map(|t| t.as_str()),
            a.nickname,
            a.routing_number.ciphertext(),
            a.routing_number.last_suffix(),
            a.account_number.ciphertext(),
            a.account_number.last_suffix(),
            a.swift.ciphertext(),
            a.is_primary,
            a.status.as_str(),
            a.metadata.to_string(),
            actor.get(),
            now,
        ],
    )
    .map_err(constraint("is_primary", PRIMARY_TAKEN))?;
    Ok(BankAccountId::new(conn.last_insert_rowid()))
}

fn save(conn: &Connection, a: &BankAccount, actor: UserId) -> Result<()> {
    conn.execute(
        "UPDATE bank_accounts SET bank_name = ?1, account_name = ?2, account_type = ?3, nickname = ?4,
            routing_number_ciphertext = ?5, routing_last4 = ?6, account_number_ciphertext = ?7, account_last4 = ?8,
            swift_ciphertext = ?9, is_primary = ?10, status = ?11, updated_by_id = ?12, updated_at = ?13
         WHERE id = ?14",
        params![
            a.bank_name,
            a.account_name,
            a.account_type.map(|t| t.as_str()),
            a.nickname,
            a.routing_number.ciphertext(),
            a.routing_number.last_suffix(),
            a.account_number.ciphertext(),
            a.account_number.last_suffix(),
            a.swift.ciphertext(),
            a.is_primary,
            a.status.as_str(),
            actor.get(),
            to_db_time(&Utc::now()),
            a.id.get(),
        ],
    )
    .map_err(constraint("is_primary", PRIMARY_TAKEN))?;
    Ok(())
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn numbers_update(
    conn: &Connection,
    ctx: &RequestContext,
    actor: UserId,
    account: &BankAccount,
    fields: &[&str],
    change: &str,
) -> Result<()> {
    let entry = AuditEntry::new(actor, AuditAction::UpdateSecret, AuditTarget::BankAccount(account.id))
        .with("legal_entity_id", account.legal_entity_id.get())
        .with("fields_changed", fields.to_vec())
        .with("change", change)
        .with_context(ctx);
    audit::record(conn, entry).map(|_| ())
}

/// Audited, role-gated bank account operations.
pub struct BankAccounts {
    store: Arc<Store>,
    engine: Arc<EncryptionEngine>,
}

impl BankAccounts {
    pub fn new(store: Arc<Store>, engine: Arc<EncryptionEngine>) -> Self {
        Self { store, engine }
    }

    /// Add a bank account to a legal entity.
    ///
    /// # Postconditions
    /// - If the new account is primary, every other active account of the
    ///   entity is no longer primary
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) unless the caller is admin or ops
    pub fn create(
        &self,
        ctx: &RequestContext,
        entity_id: LegalEntityId,
        input: NewBankAccount,
    ) -> Result<BankAccount> {
        let actor = ctx.actor()?;
        let metadata = match input.metadata {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => return Err(Error::validation("metadata", "must be a JSON object")),
        };

        let mut account = BankAccount {
            id: BankAccountId::new(0),
            legal_entity_id: entity_id,
            bank_name: trimmed(input.bank_name),
            account_name: trimmed(input.account_name),
            account_type: input.account_type,
            nickname: trimmed(input.nickname),
            routing_number: EncryptedField::new(ROUTING_NUMBER),
            account_number: EncryptedField::new(ACCOUNT_NUMBER),
            swift: EncryptedField::new(SWIFT),
            is_primary: input.is_primary,
            status: AccountStatus::Active,
            metadata,
            created_by: Some(actor),
            updated_by: Some(actor),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        account.routing_number.set(&self.engine, input.routing_number.as_deref())?;
        account.account_number.set(&self.engine, input.account_number.as_deref())?;
        account.swift.set(&self.engine, input.swift.as_deref())?;

        let account = self.store.write_gated(|tx| {
            legal_entity::get(tx, entity_id)?;
            granted!(users::authorize(
                tx,
                ctx,
                actor,
                UserRole::can_manage_bank_accounts,
                AuditTarget::LegalEntity(entity_id),
                "create_bank_account",
            )?);

            if account.is_primary {
                demote_other_primaries(tx, entity_id, None)?;
            }
            check_single_primary(tx, &account, None)?;
            let id = insert(tx, &account, actor)?;
            let stored = get(tx, id)?;

            let numbers: Vec<&str> = [&stored.routing_number, &stored.account_number, &stored.swift]
                .into_iter()
                .filter(|f| f.present())
                .map(|f| f.name())
                .collect();
            if !numbers.is_empty() {
                numbers_update(tx, ctx, actor, &stored, &numbers, "created")?;
            }
            Ok(Gated::Done(stored))
        })?;

        info!(bank_account_id = %account.id, legal_entity_id = %entity_id, primary = account.is_primary, "Bank account created");
        Ok(account)
    }

    pub fn get(&self, id: BankAccountId) -> Result<BankAccount> {
        self.store.read(|conn| get(conn, id))
    }

    /// Masked views of an entity's accounts, primary first.
    pub fn for_entity(&self, entity_id: LegalEntityId) -> Result<Vec<BankAccountSummary>> {
        self.store.read(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM bank_accounts WHERE legal_entity_id = ?1
                     ORDER BY status = 'active' DESC, is_primary DESC, id",
                    COLUMNS
                ))
                .map_err(storage)?;
            let accounts = stmt
                .query_map([entity_id.get()], BankAccount::from_row)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(accounts.iter().map(BankAccount::masked).collect())
        })
    }

    /// The entity's active primary account.
    pub fn primary_account(&self, entity_id: LegalEntityId) -> Result<Option<BankAccount>> {
        self.store.read(|conn| active_primary(conn, entity_id))
    }

    /// Apply changes. Any change to an encrypted number writes one
    /// `update_secret` record listing the fields.
    pub fn update(
        &self,
        ctx: &RequestContext,
        id: BankAccountId,
        changes: BankAccountUpdate,
    ) -> Result<BankAccount> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let mut account = get(tx, id)?;
            granted!(users::authorize(
                tx,
                ctx,
                actor,
                UserRole::can_manage_bank_accounts,
                AuditTarget::BankAccount(id),
                "update_bank_account",
            )?);

            if let Some(bank_name) = changes.bank_name {
                account.bank_name = trimmed(Some(bank_name));
            }
            if let Some(account_name) = changes.account_name {
                account.account_name = trimmed(Some(account_name));
            }
            if let Some(kind) = changes.account_type {
                account.account_type = Some(kind);
            }
            if let Some(nickname) = changes.nickname {
                account.nickname = trimmed(Some(nickname));
            }
            if let Some(primary) = changes.is_primary {
                account.is_primary = primary;
            }
            if let Some(status) = changes.status {
                account.status = status;
            }

            let mut changed = Vec::new();
            for (field, value) in [
                (&mut account.routing_number, &changes.routing_number),
                (&mut account.account_number, &changes.account_number),
                (&mut account.swift, &changes.swift),
            ] {
                if let Some(value) = value {
                    field.set(&self.engine, Some(value.as_str()))?;
                    changed.push(field.name());
                }
            }

            if account.is_primary && account.is_active() {
                demote_other_primaries(tx, account.legal_entity_id, Some(id))?;
            }
            check_single_primary(tx, &account, Some(id))?;
            save(tx, &account, actor)?;
            if !changed.is_empty() {
                numbers_update(tx, ctx, actor, &account, &changed, "updated")?;
            }
            get(tx, id).map(Gated::Done)
        })
    }

    /// Soft-delete: mark the account closed. A closed account no longer
    /// counts toward the single-primary rule.
    pub fn close(&self, ctx: &RequestContext, id: BankAccountId) -> Result<BankAccount> {
        let account = self.update(
            ctx,
            id,
            BankAccountUpdate {
                status: Some(AccountStatus::Closed),
                ..Default::default()
            },
        )?;
        info!(bank_account_id = %id, "Bank account closed");
        Ok(account)
    }

    /// Decrypt routing, account and SWIFT numbers.
    ///
    /// # Security
    /// Writes one `reveal_secret` record.
    pub fn reveal_numbers(&self, ctx: &RequestContext, id: BankAccountId) -> Result<RevealedBankNumbers> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let account = get(tx, id)?;
            granted!(users::authorize(
                tx,
                ctx,
                actor,
                UserRole::can_reveal_secrets,
                AuditTarget::BankAccount(id),
                "reveal_secret",
            )?);
            let revealed: Vec<&str> = [&account.routing_number, &account.account_number, &account.swift]
                .into_iter()
                .filter(|f| f.present())
                .map(|f| f.name())
                .collect();
            let entry = AuditEntry::new(actor, AuditAction::RevealSecret, AuditTarget::BankAccount(id))
                .with("legal_entity_id", account.legal_entity_id.get())
                .with("fields_revealed", revealed)
                .with_context(ctx);
            audit::record(tx, entry)?;

            Ok(Gated::Done(RevealedBankNumbers {
                bank_account_id: id,
                routing_number: account.routing_number.decrypted(&self.engine),
                account_number: account.account_number.decrypted(&self.engine),
                swift: account.swift.decrypted(&self.engine),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLog, AuditQuery};
    use crate::bank_account::AccountType;
    use crate::legal_entity::{EntityType, LegalEntities, NewLegalEntity};
    use crate::users::UserDirectory;
    use dealvault_crypto::{MasterKey, KEY_LENGTH};

    struct Fixture {
        store: Arc<Store>,
        accounts: BankAccounts,
        entity: LegalEntityId,
        ops: UserId,
        member: UserId,
    }

    impl Fixture {
        fn ctx(&self) -> RequestContext {
            RequestContext::for_actor(self.ops)
        }

        fn open(&self, name: &str, number: &str, primary: bool) -> BankAccount {
            self.accounts
                .create(
                    &self.ctx(),
                    self.entity,
                    NewBankAccount {
                        bank_name: Some("First Republic".into()),
                        account_name: Some(name.into()),
                        account_type: Some(AccountType::Checking),
                        routing_number: Some("121 000 021".into()),
                        account_number: Some(number.into()),
                        swift: Some("FRBKUS6S".into()),
                        is_primary: primary,
                        ..Default::default()
                    },
                )
                .unwrap()
        }

        fn active_primaries(&self) -> i64 {
            self.store
                .read(|conn| {
                    conn.query_row(
                        "SELECT COUNT(*) FROM bank_accounts WHERE legal_entity_id = ?1 AND is_primary = 1 AND status = 'active'",
                        [self.entity.get()],
                        |row| row.get(0),
                    )
                    .map_err(storage)
                })
                .unwrap()
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = Arc::new(EncryptionEngine::from_key(MasterKey::from_bytes([3u8; KEY_LENGTH])));
        let users = UserDirectory::new(store.clone());
        let ops = users.create("ops@example.com", "Olga Ops", UserRole::Ops).unwrap().id;
        let member = users.create("mem@example.com", "Mel Member", UserRole::Member).unwrap().id;
        let entity = LegalEntities::new(store.clone(), engine.clone())
            .create(
                &RequestContext::for_actor(ops),
                NewLegalEntity::new("Harbor Holdings LLC", EntityType::Llc),
            )
            .unwrap()
            .id;
        Fixture {
            accounts: BankAccounts::new(store.clone(), engine),
            store,
            entity,
            ops,
            member,
        }
    }

    #[test]
    fn test_numbers_are_compacted_and_masked() {
        let f = fixture();
        let account = f.open("Operating", "0000-1234", true);

        assert_eq!(account.account_number.masked().as_deref(), Some("••••1234"));
        assert_eq!(account.routing_number.last_suffix(), Some("0021"));
        assert_eq!(account.summary(), "First Republic · Checking · ••••1234");

        let revealed = f.accounts.reveal_numbers(&f.ctx(), account.id).unwrap();
        assert_eq!(revealed.routing_number.unwrap(), "121000021");
        assert_eq!(revealed.account_number.unwrap(), "00001234");
        assert_eq!(revealed.swift.unwrap(), "FRBKUS6S");
    }

    #[test]
    fn test_new_primary_demotes_previous() {
        let f = fixture();
        let first = f.open("Operating", "11112222", true);
        let second = f.open("Reserve", "33334444", true);

        assert_eq!(f.active_primaries(), 1);
        assert!(!f.accounts.get(first.id).unwrap().is_primary);
        assert_eq!(f.accounts.primary_account(f.entity).unwrap().unwrap().id, second.id);

        f.accounts
            .update(
                &f.ctx(),
                first.id,
                BankAccountUpdate {
                    is_primary: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(f.active_primaries(), 1);
        assert_eq!(f.accounts.primary_account(f.entity).unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_racing_primary_insert_rejected_by_index() {
        let f = fixture();
        let existing = f.open("Operating", "11112222", true);

        // Skip demotion and the pre-write check, as a concurrent writer would.
        let mut racer = f.accounts.get(existing.id).unwrap();
        racer.account_name = Some("Racer".into());
        let err = f
            .store
            .write(|tx| insert(tx, &racer, f.ops))
            .unwrap_err();

        assert!(matches!(err, Error::Validation { ref field, .. } if field == "is_primary"));
        assert_eq!(f.active_primaries(), 1);
    }

    #[test]
    fn test_pre_write_check_rejects_second_primary() {
        let f = fixture();
        f.open("Operating", "11112222", true);
        let second = f.open("Reserve", "33334444", false);

        let mut promoted = f.accounts.get(second.id).unwrap();
        promoted.is_primary = true;
        let err = f
            .store
            .read(|conn| check_single_primary(conn, &promoted, Some(second.id)))
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_closed_primary_frees_the_slot() {
        let f = fixture();
        let first = f.open("Operating", "11112222", true);
        let closed = f.accounts.close(&f.ctx(), first.id).unwrap();
        assert_eq!(closed.status, AccountStatus::Closed);
        assert!(f.accounts.primary_account(f.entity).unwrap().is_none());

        // A closed primary does not block a new active one.
        f.store
            .write(|tx| {
                let mut fresh = get(tx, first.id)?;
                fresh.status = AccountStatus::Active;
                fresh.account_name = Some("Replacement".into());
                insert(tx, &fresh, f.ops)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(f.active_primaries(), 1);

        let listed = f.accounts.for_entity(f.entity).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].status, AccountStatus::Closed);
    }

    #[test]
    fn test_member_is_denied_and_denial_recorded() {
        let f = fixture();
        let account = f.open("Operating", "11112222", true);
        let ctx = RequestContext::for_actor(f.member);

        assert!(f.accounts.reveal_numbers(&ctx, account.id).unwrap_err().is_access_denied());
        assert!(f
            .accounts
            .create(&ctx, f.entity, NewBankAccount::default())
            .unwrap_err()
            .is_access_denied());

        let denials = AuditLog::new(f.store.clone())
            .query(&f.ctx(), &AuditQuery::denials())
            .unwrap();
        assert_eq!(denials.total, 2);
        assert_eq!(denials.records[1].target, AuditTarget::BankAccount(account.id));
        assert_eq!(denials.records[1].metadata["action_attempted"], "reveal_secret");
    }

    #[test]
    fn test_number_updates_are_logged() {
        let f = fixture();
        let account = f.open("Operating", "11112222", false);
        f.accounts
            .update(
                &f.ctx(),
                account.id,
                BankAccountUpdate {
                    account_number: Some("99998888".into()),
                    nickname: Some("Ops".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        let updates = AuditLog::new(f.store.clone())
            .query(
                &f.ctx(),
                &AuditQuery::updates().for_target(AuditTarget::BankAccount(account.id)),
            )
            .unwrap();
        assert_eq!(updates.total, 2);
        assert_eq!(updates.records[0].metadata["fields_changed"], serde_json::json!(["account_number"]));
        assert_eq!(f.accounts.get(account.id).unwrap().display_name(), "Ops");
    }
}
