//! Security audit log.
//!
//! Append-only record of every reveal, copy, secret update, deletion,
//! permission change and access denial. Records are written inside the
//! transaction of the operation they describe; if the write fails the
//! operation fails with it. There is no update or delete path, and the
//! table carries triggers that abort any attempt.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::access::UserRole;
use crate::context::RequestContext;
use crate::store::{
    from_db_json, from_db_tag, from_db_time, granted, storage, to_db_time, Gated, Store,
};
use crate::tag::tagged_enum;
use crate::users;
use dealvault_common::{
    AuditLogId, BankAccountId, CredentialId, Error, LegalEntityId, Result, UserId, VaultId,
};

/// Default page size for audit queries.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Largest page size a query may request.
pub const MAX_PAGE_SIZE: u32 = 100;

tagged_enum! {
    /// What happened.
    pub enum AuditAction in "action" {
        ViewDecryptedField => ("view_decrypted_field", "Viewed Decrypted Field"),
        RevealSecret => ("reveal_secret", "Revealed Secret"),
        CopySecret => ("copy_secret", "Copied Secret"),
        UpdateSecret => ("update_secret", "Updated Secret"),
        DeleteSecret => ("delete_secret", "Deleted Secret"),
        PermissionChange => ("permission_change", "Permission Changed"),
        AccessDenied => ("access_denied", "Access Denied"),
    }
}

tagged_enum! {
    /// Kind of record an audit entry points at.
    pub enum AuditTargetKind in "auditable_type" {
        Vault => ("vault", "Vault"),
        Credential => ("credential", "Credential"),
        BankAccount => ("bank_account", "Bank Account"),
        LegalEntity => ("legal_entity", "Legal Entity"),
        User => ("user", "User"),
        Document => ("document", "Document"),
    }
}

/// The record an audit entry is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AuditTarget {
    Vault(VaultId),
    Credential(CredentialId),
    BankAccount(BankAccountId),
    LegalEntity(LegalEntityId),
    User(UserId),
    /// Documents live in the external blob store; only the id is known here.
    Document(i64),
}

impl AuditTarget {
    pub fn kind(&self) -> AuditTargetKind {
        match self {
            Self::Vault(_) => AuditTargetKind::Vault,
            Self::Credential(_) => AuditTargetKind::Credential,
            Self::BankAccount(_) => AuditTargetKind::BankAccount,
            Self::LegalEntity(_) => AuditTargetKind::LegalEntity,
            Self::User(_) => AuditTargetKind::User,
            Self::Document(_) => AuditTargetKind::Document,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Vault(id) => id.get(),
            Self::Credential(id) => id.get(),
            Self::BankAccount(id) => id.get(),
            Self::LegalEntity(id) => id.get(),
            Self::User(id) => id.get(),
            Self::Document(id) => *id,
        }
    }

    pub fn from_parts(kind: AuditTargetKind, id: i64) -> Self {
        match kind {
            AuditTargetKind::Vault => Self::Vault(VaultId::new(id)),
            AuditTargetKind::Credential => Self::Credential(CredentialId::new(id)),
            AuditTargetKind::BankAccount => Self::BankAccount(BankAccountId::new(id)),
            AuditTargetKind::LegalEntity => Self::LegalEntity(LegalEntityId::new(id)),
            AuditTargetKind::User => Self::User(UserId::new(id)),
            AuditTargetKind::Document => Self::Document(id),
        }
    }

    /// Human-readable name of the target, looked up per kind.
    ///
    /// Falls back to "<Kind> #<id>" when the record is gone.
    pub fn label(&self, conn: &Connection) -> Result<String> {
        let sql = match self.kind() {
            AuditTargetKind::Vault => "SELECT name FROM vaults WHERE id = ?1",
            AuditTargetKind::Credential => "SELECT title FROM credentials WHERE id = ?1",
            AuditTargetKind::BankAccount => {
                "SELECT COALESCE(NULLIF(nickname, ''), bank_name || ' - ' || account_name, bank_name, account_name)
                 FROM bank_accounts WHERE id = ?1"
            }
            AuditTargetKind::LegalEntity => {
                "SELECT COALESCE(NULLIF(name_short, ''), name_legal) FROM legal_entities WHERE id = ?1"
            }
            AuditTargetKind::User => "SELECT full_name FROM users WHERE id = ?1",
            AuditTargetKind::Document => {
                return Ok(format!("{} #{}", self.kind().label(), self.id()));
            }
        };

        let name: Option<Option<String>> = conn
            .query_row(sql, [self.id()], |row| row.get(0))
            .optional()
            .map_err(storage)?;
        Ok(name
            .flatten()
            .unwrap_or_else(|| format!("{} #{}", self.kind().label(), self.id())))
    }
}

impl fmt::Display for AuditTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind().as_str(), self.id())
    }
}

/// A record about to be written.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub actor: UserId,
    pub action: AuditAction,
    pub target: AuditTarget,
    pub metadata: Map<String, Value>,
}

impl AuditEntry {
    pub fn new(actor: UserId, action: AuditAction, target: AuditTarget) -> Self {
        Self {
            actor,
            action,
            target,
            metadata: Map::new(),
        }
    }

    /// Add one metadata key.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Merge request context fields (network origin, client, timestamp).
    pub fn with_context(mut self, ctx: &RequestContext) -> Self {
        for (key, value) in ctx.audit_metadata() {
            self.metadata.entry(key).or_insert(value);
        }
        self
    }

    /// Merge an arbitrary metadata object. Non-object values are stored under "data".
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        match metadata {
            Value::Object(map) => self.metadata.extend(map),
            Value::Null => {}
            other => {
                self.metadata.insert("data".to_string(), other);
            }
        }
        self
    }
}

/// Write one audit record in the caller's transaction.
///
/// # Errors
/// - `Error::Audit` if the record cannot be written; the caller must let
///   this abort the enclosing transaction.
pub(crate) fn record(conn: &Connection, entry: AuditEntry) -> Result<AuditLogId> {
    let metadata = Value::Object(entry.metadata).to_string();
    conn.execute(
        "INSERT INTO security_audit_logs (actor_user_id, action, auditable_type, auditable_id, metadata, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.actor.get(),
            entry.action.as_str(),
            entry.target.kind().as_str(),
            entry.target.id(),
            metadata,
            to_db_time(&Utc::now()),
        ],
    )
    .map_err(|e| Error::Audit(e.to_string()))?;

    let id = AuditLogId::new(conn.last_insert_rowid());
    if entry.action == AuditAction::AccessDenied {
        warn!(audit_id = %id, actor = %entry.actor, target = %entry.target, "Access denied");
    } else {
        info!(audit_id = %id, actor = %entry.actor, action = %entry.action, target = %entry.target, "Security audit");
    }
    Ok(id)
}

/// Write an `access_denied` record and build the error to return.
pub(crate) fn deny<T>(
    conn: &Connection,
    ctx: &RequestContext,
    actor: UserId,
    target: AuditTarget,
    attempted: &str,
    extra: Map<String, Value>,
) -> Result<Gated<T>> {
    let mut entry = AuditEntry::new(actor, AuditAction::AccessDenied, target)
        .with("action_attempted", attempted)
        .with_context(ctx);
    entry.metadata.extend(extra);
    record(conn, entry)?;
    Ok(Gated::Denied(Error::AccessDenied(format!(
        "{} not permitted on {}",
        attempted, target
    ))))
}

/// A stored audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: AuditLogId,
    pub actor: UserId,
    pub action: AuditAction,
    pub target: AuditTarget,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn field_name(&self) -> Option<&str> {
        self.meta_str("field_name")
    }

    pub fn ip_address(&self) -> Option<&str> {
        self.meta_str("ip_address")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.meta_str("user_agent")
    }

    /// One-line description: "<actor> <action> on <target>".
    pub fn summary(&self, conn: &Connection) -> Result<String> {
        let actor = users::get(conn, self.actor)
            .map(|u| u.full_name)
            .unwrap_or_else(|_| format!("User #{}", self.actor));
        Ok(format!(
            "{} {} on {}",
            actor,
            self.action.label().to_lowercase(),
            self.target.label(conn)?
        ))
    }
}

const COLUMNS: &str = "id, actor_user_id, action, auditable_type, auditable_id, metadata, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let kind: AuditTargetKind = from_db_tag(&row.get::<_, String>(3)?)?;
    Ok(AuditRecord {
        id: AuditLogId::new(row.get(0)?),
        actor: UserId::new(row.get(1)?),
        action: from_db_tag(&row.get::<_, String>(2)?)?,
        target: AuditTarget::from_parts(kind, row.get(4)?),
        metadata: from_db_json(&row.get::<_, String>(5)?)?,
        created_at: from_db_time(&row.get::<_, String>(6)?)?,
    })
}

/// Filters for reading the audit log. Results are newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditQuery {
    pub target: Option<AuditTarget>,
    /// Any of these actions; empty means all.
    pub actions: Vec<AuditAction>,
    pub actor: Option<UserId>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// 1-based page number.
    pub page: u32,
    pub per_page: u32,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            target: None,
            actions: Vec::new(),
            actor: None,
            after: None,
            before: None,
            page: 1,
            per_page: DEFAULT_PAGE_SIZE,
        }
    }
}

impl AuditQuery {
    pub fn all() -> Self {
        Self::default()
    }

    /// Reveal-type records.
    pub fn reveals() -> Self {
        Self::default().actions([AuditAction::RevealSecret, AuditAction::ViewDecryptedField])
    }

    /// Update and delete records.
    pub fn updates() -> Self {
        Self::default().actions([AuditAction::UpdateSecret, AuditAction::DeleteSecret])
    }

    pub fn denials() -> Self {
        Self::default().actions([AuditAction::AccessDenied])
    }

    pub fn for_target(mut self, target: AuditTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn actions(mut self, actions: impl IntoIterator<Item = AuditAction>) -> Self {
        self.actions = actions.into_iter().collect();
        self
    }

    pub fn by_actor(mut self, actor: UserId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn since(mut self, after: DateTime<Utc>) -> Self {
        self.after = Some(after);
        self
    }

    pub fn until(mut self, before: DateTime<Utc>) -> Self {
        self.before = Some(before);
        self
    }

    pub fn page(mut self, page: u32, per_page: u32) -> Self {
        self.page = page;
        self.per_page = per_page;
        self
    }

    fn clamped(&self) -> (u32, u32) {
        (self.page.max(1), self.per_page.clamp(1, MAX_PAGE_SIZE))
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(target) = &self.target {
            args.push(SqlValue::Text(target.kind().as_str().to_string()));
            args.push(SqlValue::Integer(target.id()));
            clauses.push(format!(
                "auditable_type = ?{} AND auditable_id = ?{}",
                args.len() - 1,
                args.len()
            ));
        }
        if !self.actions.is_empty() {
            let mut slots = Vec::with_capacity(self.actions.len());
            for action in &self.actions {
                args.push(SqlValue::Text(action.as_str().to_string()));
                slots.push(format!("?{}", args.len()));
            }
            clauses.push(format!("action IN ({})", slots.join(", ")));
        }
        if let Some(actor) = self.actor {
            args.push(SqlValue::Integer(actor.get()));
            clauses.push(format!("actor_user_id = ?{}", args.len()));
        }
        if let Some(after) = &self.after {
            args.push(SqlValue::Text(to_db_time(after)));
            clauses.push(format!("created_at >= ?{}", args.len()));
        }
        if let Some(before) = &self.before {
            args.push(SqlValue::Text(to_db_time(before)));
            clauses.push(format!("created_at <= ?{}", args.len()));
        }

        if clauses.is_empty() {
            (String::new(), args)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), args)
        }
    }
}

/// One page of audit records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditPage {
    pub records: Vec<AuditRecord>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

pub(crate) fn query(conn: &Connection, query: &AuditQuery) -> Result<AuditPage> {
    let (page, per_page) = query.clamped();
    let (where_sql, args) = query.where_clause();

    let total: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM security_audit_logs{}", where_sql),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )
        .map_err(storage)?;

    let mut page_args = args;
    page_args.push(SqlValue::Integer(i64::from(per_page)));
    let limit_slot = page_args.len();
    page_args.push(SqlValue::Integer(i64::from(page - 1) * i64::from(per_page)));
    let offset_slot = page_args.len();

    let sql = format!(
        "SELECT {} FROM security_audit_logs{} ORDER BY created_at DESC, id DESC LIMIT ?{} OFFSET ?{}",
        COLUMNS, where_sql, limit_slot, offset_slot
    );
    let mut stmt = conn.prepare(&sql).map_err(storage)?;
    let records = stmt
        .query_map(params_from_iter(page_args.iter()), from_row)
        .map_err(storage)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage)?;

    Ok(AuditPage {
        records,
        page,
        per_page,
        total: total as u64,
    })
}

/// Entry points for writing and reading the audit log directly.
pub struct AuditLog {
    store: Arc<Store>,
}

impl AuditLog {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Write one record in its own transaction.
    ///
    /// For sensitive actions performed outside this crate (for example a
    /// document download by the blob store collaborator).
    ///
    /// # Errors
    /// - `Error::Unauthenticated` without an actor
    /// - `Error::Audit` if the record cannot be persisted
    pub fn write(
        &self,
        actor: Option<UserId>,
        target: AuditTarget,
        action: AuditAction,
        metadata: Value,
    ) -> Result<AuditLogId> {
        let actor = actor.ok_or(Error::Unauthenticated)?;
        let entry = AuditEntry::new(actor, action, target).with_metadata(metadata);
        self.store.write(|tx| record(tx, entry))
    }

    /// Query the log. Only admin and ops users may read it; other callers
    /// are denied and the denial is itself recorded.
    pub fn query(&self, ctx: &RequestContext, filter: &AuditQuery) -> Result<AuditPage> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            granted!(users::authorize(
                tx,
                ctx,
                actor,
                UserRole::can_read_audit_log,
                AuditTarget::User(actor),
                "read_audit_log",
            )?);
            query(tx, filter).map(Gated::Done)
        })
    }

    /// One-line summary of a record, resolving actor and target names.
    pub fn summarize(&self, record: &AuditRecord) -> Result<String> {
        self.store.read(|conn| record.summary(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::UserDirectory;
    use serde_json::json;

    fn setup() -> (Arc<Store>, UserId, UserId) {
        let store = Arc::new(Store::in_memory().unwrap());
        let users = UserDirectory::new(store.clone());
        let ops = users.create("ops@example.com", "Olga Ops", UserRole::Ops).unwrap();
        let member = users
            .create("mem@example.com", "Mel Member", UserRole::Member)
            .unwrap();
        (store, ops.id, member.id)
    }

    #[test]
    fn test_write_requires_actor() {
        let (store, _, _) = setup();
        let log = AuditLog::new(store);
        let err = log
            .write(None, AuditTarget::Document(4), AuditAction::RevealSecret, Value::Null)
            .unwrap_err();
        assert!(matches!(err, Error::Unauthenticated));
    }

    #[test]
    fn test_write_unknown_actor_is_audit_error() {
        let (store, _, _) = setup();
        let log = AuditLog::new(store);
        let err = log
            .write(
                Some(UserId::new(999)),
                AuditTarget::Document(4),
                AuditAction::RevealSecret,
                Value::Null,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Audit(_)));
    }

    #[test]
    fn test_query_filters_and_orders() {
        let (store, ops, member) = setup();
        let log = AuditLog::new(store);
        log.write(
            Some(member),
            AuditTarget::Document(1),
            AuditAction::RevealSecret,
            json!({"field_name": "body", "ip_address": "10.1.1.1"}),
        )
        .unwrap();
        log.write(Some(member), AuditTarget::Document(1), AuditAction::CopySecret, Value::Null)
            .unwrap();
        log.write(Some(ops), AuditTarget::Document(2), AuditAction::UpdateSecret, Value::Null)
            .unwrap();

        let ctx = RequestContext::for_actor(ops);
        let all = log.query(&ctx, &AuditQuery::all()).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.records[0].action, AuditAction::UpdateSecret);

        let reveals = log.query(&ctx, &AuditQuery::reveals()).unwrap();
        assert_eq!(reveals.total, 1);
        assert_eq!(reveals.records[0].field_name(), Some("body"));
        assert_eq!(reveals.records[0].ip_address(), Some("10.1.1.1"));

        let doc1 = log
            .query(&ctx, &AuditQuery::all().for_target(AuditTarget::Document(1)).by_actor(member))
            .unwrap();
        assert_eq!(doc1.total, 2);

        let paged = log.query(&ctx, &AuditQuery::all().page(2, 2)).unwrap();
        assert_eq!(paged.records.len(), 1);
        assert_eq!(paged.total, 3);
    }

    #[test]
    fn test_page_size_clamped() {
        let (store, ops, _) = setup();
        let log = AuditLog::new(store);
        let page = log
            .query(&RequestContext::for_actor(ops), &AuditQuery::all().page(0, 1000))
            .unwrap();
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, MAX_PAGE_SIZE);
    }

    #[test]
    fn test_member_cannot_read_and_denial_is_logged() {
        let (store, ops, member) = setup();
        let log = AuditLog::new(store);

        let err = log
            .query(&RequestContext::for_actor(member), &AuditQuery::all())
            .unwrap_err();
        assert!(err.is_access_denied());

        let denials = log
            .query(&RequestContext::for_actor(ops), &AuditQuery::denials())
            .unwrap();
        assert_eq!(denials.total, 1);
        assert_eq!(denials.records[0].actor, member);
        assert_eq!(
            denials.records[0].metadata["action_attempted"],
            "read_audit_log"
        );
    }

    #[test]
    fn test_summary_line() {
        let (store, ops, _) = setup();
        let log = AuditLog::new(store.clone());
        log.write(Some(ops), AuditTarget::User(ops), AuditAction::PermissionChange, Value::Null)
            .unwrap();
        let page = log
            .query(&RequestContext::for_actor(ops), &AuditQuery::all())
            .unwrap();

        assert_eq!(
            log.summarize(&page.records[0]).unwrap(),
            "Olga Ops permission changed on Olga Ops"
        );
    }

    #[test]
    fn test_target_parts_roundtrip() {
        let target = AuditTarget::BankAccount(BankAccountId::new(12));
        assert_eq!(AuditTarget::from_parts(target.kind(), target.id()), target);
        assert_eq!(target.to_string(), "bank_account:12");
    }

    #[test]
    fn test_action_and_kind_tags_roundtrip() {
        for action in AuditAction::ALL {
            assert_eq!(action.as_str().parse::<AuditAction>().unwrap(), *action);
        }
        for kind in AuditTargetKind::ALL {
            assert_eq!(kind.as_str().parse::<AuditTargetKind>().unwrap(), *kind);
        }
        assert_eq!(AuditAction::AccessDenied.label(), "Access Denied");
        assert_eq!(
            serde_json::to_string(&AuditAction::CopySecret).unwrap(),
            "\"copy_secret\""
        );
        assert!("login".parse::<AuditAction>().unwrap_err().is_validation());
        assert!("deal".parse::<AuditTargetKind>().unwrap_err().is_validation());
    }
}
