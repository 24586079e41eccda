//! Credential operations.
//!
//! Every operation resolves the caller's vault membership, checks the
//! capability it needs and writes its audit record in the same transaction
//! as the change. A failed check records one `access_denied` entry and
//! returns `Error::AccessDenied`.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::access::Capability;
use crate::audit::{self, AuditAction, AuditEntry, AuditTarget};
use crate::context::RequestContext;
use crate::credential::{
    Credential, CredentialField, CredentialFilter, CredentialLink, CredentialSummary,
    CredentialUpdate, FieldUpdate, LinkRelationship, LinkTarget, NewCredential, NewField,
    RevealedCredential, RevealedField, CREDENTIAL_COLUMNS, EMAIL, FIELD_COLUMNS, FIELD_VALUE,
    LINK_COLUMNS, NOTES, SECRET, USERNAME,
};
use crate::rotation::MAX_ROTATION_INTERVAL_DAYS;
use crate::store::{constraint, granted, not_found, storage, to_db_time, Gated, Store};
use crate::vault;
use dealvault_common::{
    CredentialFieldId, CredentialId, CredentialLinkId, Error, Result, SensitiveString, UserId,
    VaultId,
};
use dealvault_crypto::{EncryptedField, EncryptionEngine};

/// Names accepted by single-field reveal and copy.
const SECRET_FIELDS: [&str; 4] = ["username", "email", "secret", "notes"];

pub(crate) fn get(conn: &Connection, id: CredentialId) -> Result<Credential> {
    conn.query_row(
        &format!("SELECT {} FROM credentials WHERE id = ?1", CREDENTIAL_COLUMNS),
        [id.get()],
        Credential::from_row,
    )
    .map_err(not_found("credential", id.get()))
}

fn fields_of(conn: &Connection, id: CredentialId) -> Result<Vec<CredentialField>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM credential_fields WHERE credential_id = ?1 ORDER BY sort_order, id",
            FIELD_COLUMNS
        ))
        .map_err(storage)?;
    let fields = stmt
        .query_map([id.get()], CredentialField::from_row)
        .map_err(storage)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage)?;
    Ok(fields)
}

fn links_of(conn: &Connection, id: CredentialId) -> Result<Vec<CredentialLink>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM credential_links WHERE credential_id = ?1 ORDER BY id",
            LINK_COLUMNS
        ))
        .map_err(storage)?;
    let links = stmt
        .query_map([id.get()], CredentialLink::from_row)
        .map_err(storage)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage)?;
    Ok(links)
}

fn get_field(conn: &Connection, id: CredentialFieldId) -> Result<CredentialField> {
    conn.query_row(
        &format!("SELECT {} FROM credential_fields WHERE id = ?1", FIELD_COLUMNS),
        [id.get()],
        CredentialField::from_row,
    )
    .map_err(not_found("credential field", id.get()))
}

fn clean_label(label: &str) -> Result<String> {
    let label = label.trim();
    if label.is_empty() {
        return Err(Error::validation("label", "can't be blank"));
    }
    Ok(label.to_string())
}

/// Insert a link; the unique index rejects a duplicate.
fn insert_link(
    conn: &Connection,
    id: CredentialId,
    target: LinkTarget,
    relationship: LinkRelationship,
    actor: UserId,
) -> Result<CredentialLink> {
    conn.execute(
        "INSERT INTO credential_links (credential_id, linkable_type, linkable_id, relationship, created_by_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.get(),
            target.kind().as_str(),
            target.id(),
            relationship.as_str(),
            actor.get(),
            to_db_time(&Utc::now()),
        ],
    )
    .map_err(constraint("linkable_id", "is already linked with this relationship"))?;
    debug!(credential_id = %id, link_id = %CredentialLinkId::new(conn.last_insert_rowid()), "Credential linked");
    find_link(conn, id, target, relationship)?
        .ok_or_else(|| Error::Storage("link vanished after insert".to_string()))
}

fn find_link(
    conn: &Connection,
    id: CredentialId,
    target: LinkTarget,
    relationship: LinkRelationship,
) -> Result<Option<CredentialLink>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM credential_links
             WHERE credential_id = ?1 AND linkable_type = ?2 AND linkable_id = ?3 AND relationship = ?4",
            LINK_COLUMNS
        ),
        params![id.get(), target.kind().as_str(), target.id(), relationship.as_str()],
        CredentialLink::from_row,
    )
    .optional()
    .map_err(storage)
}

fn save(conn: &Connection, c: &Credential, actor: UserId, now: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE credentials SET title = ?1, credential_type = ?2, url = ?3,
            username_ciphertext = ?4, username_last4 = ?5, email_ciphertext = ?6, email_last4 = ?7,
            secret_ciphertext = ?8, secret_last4 = ?9, notes_ciphertext = ?10,
            secret_last_rotated_at = ?11, rotation_interval_days = ?12, sensitivity = ?13,
            metadata = ?14, updated_by_id = ?15, updated_at = ?16
         WHERE id = ?17",
        params![
            c.title,
            c.credential_type.as_str(),
            c.url,
            c.username.ciphertext(),
            c.username.last_suffix(),
            c.email.ciphertext(),
            c.email.last_suffix(),
            c.secret.ciphertext(),
            c.secret.last_suffix(),
            c.notes.ciphertext(),
            c.rotation.last_rotated_at.as_ref().map(to_db_time),
            c.rotation.interval_days,
            c.sensitivity.as_str(),
            c.metadata.to_string(),
            actor.get(),
            to_db_time(now),
            c.id.get(),
        ],
    )
    .map_err(storage)?;
    Ok(())
}

fn clean_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(Error::validation("title", "can't be blank"));
    }
    Ok(title.to_string())
}

fn check_interval(interval: Option<i64>) -> Result<()> {
    match interval {
        Some(days) if days <= 0 => Err(Error::validation(
            "rotation_interval_days",
            "must be greater than 0",
        )),
        Some(days) if days > MAX_ROTATION_INTERVAL_DAYS => Err(Error::validation(
            "rotation_interval_days",
            format!("must be at most {} days", MAX_ROTATION_INTERVAL_DAYS),
        )),
        _ => Ok(()),
    }
}

fn clean_url(url: Option<&str>) -> Option<String> {
    url.map(str::trim).filter(|u| !u.is_empty()).map(str::to_string)
}

fn metadata_object(metadata: Option<Value>) -> Result<Value> {
    match metadata {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(Value::Object(map)) => Ok(Value::Object(map)),
        Some(_) => Err(Error::validation("metadata", "must be a JSON object")),
    }
}

fn secret_update(
    conn: &Connection,
    ctx: &RequestContext,
    actor: UserId,
    credential: &Credential,
    fields: &[&str],
    change: &str,
) -> Result<()> {
    let entry = AuditEntry::new(actor, AuditAction::UpdateSecret, AuditTarget::Credential(credential.id))
        .with("vault_id", credential.vault_id.get())
        .with("fields_changed", fields.to_vec())
        .with("change", change)
        .with_context(ctx);
    audit::record(conn, entry).map(|_| ())
}

/// Audited, permission-checked credential operations.
pub struct CredentialOperations {
    store: Arc<Store>,
    engine: Arc<EncryptionEngine>,
}

impl CredentialOperations {
    pub fn new(store: Arc<Store>, engine: Arc<EncryptionEngine>) -> Self {
        Self { store, engine }
    }

    fn encrypt(&self, spec: dealvault_crypto::FieldSpec, value: Option<&str>) -> Result<EncryptedField> {
        let mut field = EncryptedField::new(spec);
        field.set(&self.engine, value)?;
        Ok(field)
    }

    /// Store a new credential in a vault.
    ///
    /// A secret supplied at creation counts as a fresh rotation.
    ///
    /// # Preconditions
    /// - Caller holds `edit` in the vault
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) without `edit`
    /// - Validation failure on blank title or out-of-range rotation interval
    pub fn create(&self, ctx: &RequestContext, vault_id: VaultId, input: NewCredential) -> Result<Credential> {
        let actor = ctx.actor()?;
        let title = clean_title(&input.title)?;
        check_interval(input.rotation_interval_days)?;
        let metadata = metadata_object(input.metadata)?;

        let username = self.encrypt(USERNAME, input.username.as_deref())?;
        let email = self.encrypt(EMAIL, input.email.as_deref())?;
        let secret = self.encrypt(SECRET, input.secret.as_deref())?;
        let notes = self.encrypt(NOTES, input.notes.as_deref())?;
        let now = Utc::now();
        let rotated_at = secret.present().then(|| to_db_time(&now));

        let credential = self.store.write_gated(|tx| {
            vault::get(tx, vault_id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::Edit,
                AuditTarget::Vault(vault_id),
                "create_credential",
            )?);

            let stamp = to_db_time(&now);
            tx.execute(
                "INSERT INTO credentials (vault_id, title, credential_type, url,
                    username_ciphertext, username_last4, email_ciphertext, email_last4,
                    secret_ciphertext, secret_last4, notes_ciphertext,
                    secret_last_rotated_at, rotation_interval_days, sensitivity, metadata,
                    created_by_id, updated_by_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16, ?17, ?17)",
                params![
                    vault_id.get(),
                    title,
                    input.credential_type.as_str(),
                    clean_url(input.url.as_deref()),
                    username.ciphertext(),
                    username.last_suffix(),
                    email.ciphertext(),
                    email.last_suffix(),
                    secret.ciphertext(),
                    secret.last_suffix(),
                    notes.ciphertext(),
                    rotated_at,
                    input.rotation_interval_days,
                    input.sensitivity.as_str(),
                    metadata.to_string(),
                    actor.get(),
                    stamp,
                ],
            )
            .map_err(storage)?;

            let credential = get(tx, CredentialId::new(tx.last_insert_rowid()))?;
            let stored: Vec<&str> = [&username, &email, &secret, &notes]
                .into_iter()
                .filter(|f| f.present())
                .map(|f| f.name())
                .collect();
            if !stored.is_empty() {
                secret_update(tx, ctx, actor, &credential, &stored, "created")?;
            }
            Ok(Gated::Done(credential))
        })?;

        info!(credential_id = %credential.id, vault_id = %vault_id, "Credential created");
        Ok(credential)
    }

    /// Masked view of one credential.
    pub fn show(&self, ctx: &RequestContext, id: CredentialId) -> Result<CredentialSummary> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::View,
                AuditTarget::Credential(id),
                "view_credential",
            )?);
            Ok(Gated::Done(credential.summary(Utc::now())))
        })
    }

    /// Masked views of a vault's credentials, by title.
    pub fn list(
        &self,
        ctx: &RequestContext,
        vault_id: VaultId,
        filter: &CredentialFilter,
    ) -> Result<Vec<CredentialSummary>> {
        let actor = ctx.actor()?;
        let now = Utc::now();

        let mut clauses = vec!["c.vault_id = ?1".to_string()];
        let mut args = vec![SqlValue::Integer(vault_id.get())];
        if let Some(kind) = filter.credential_type {
            args.push(SqlValue::Text(kind.as_str().to_string()));
            clauses.push(format!("c.credential_type = ?{}", args.len()));
        }
        if let Some(sensitivity) = filter.sensitivity {
            args.push(SqlValue::Text(sensitivity.as_str().to_string()));
            clauses.push(format!("c.sensitivity = ?{}", args.len()));
        }
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            args.push(SqlValue::Text(format!("%{}%", search.to_lowercase())));
            clauses.push(format!(
                "(LOWER(c.title) LIKE ?{n} OR LOWER(COALESCE(c.url, '')) LIKE ?{n})",
                n = args.len()
            ));
        }
        if let Some(target) = filter.linked_to {
            args.push(SqlValue::Text(target.kind().as_str().to_string()));
            args.push(SqlValue::Integer(target.id()));
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM credential_links l WHERE l.credential_id = c.id
                         AND l.linkable_type = ?{} AND l.linkable_id = ?{})",
                args.len() - 1,
                args.len()
            ));
        }
        let sql = format!(
            "SELECT {} FROM credentials c WHERE {} ORDER BY c.title, c.id",
            CREDENTIAL_COLUMNS
                .split(", ")
                .map(|col| format!("c.{}", col.trim()))
                .collect::<Vec<_>>()
                .join(", "),
            clauses.join(" AND ")
        );

        self.store.write_gated(|tx| {
            vault::get(tx, vault_id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::View,
                AuditTarget::Vault(vault_id),
                "list_credentials",
            )?);
            let mut stmt = tx.prepare(&sql).map_err(storage)?;
            let credentials = stmt
                .query_map(params_from_iter(args.iter()), Credential::from_row)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;

            let summaries = credentials
                .iter()
                .filter(|c| {
                    filter
                        .rotation_status
                        .map_or(true, |status| c.rotation_status(now) == status)
                })
                .map(|c| c.summary(now))
                .collect();
            Ok(Gated::Done(summaries))
        })
    }

    /// Apply changes to a credential.
    ///
    /// Changing the secret marks it rotated. Any change to an encrypted
    /// field writes one `update_secret` record listing the fields.
    pub fn update(&self, ctx: &RequestContext, id: CredentialId, changes: CredentialUpdate) -> Result<Credential> {
        let actor = ctx.actor()?;
        let title = changes.title.as_deref().map(clean_title).transpose()?;
        if let Some(interval) = changes.rotation_interval_days {
            check_interval(interval)?;
        }
        let metadata = changes.metadata.map(|m| metadata_object(Some(m))).transpose()?;

        self.store.write_gated(|tx| {
            let mut credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(id),
                "update_credential",
            )?);

            let now = Utc::now();
            if let Some(title) = title {
                credential.title = title;
            }
            if let Some(kind) = changes.credential_type {
                credential.credential_type = kind;
            }
            if let Some(url) = changes.url.as_deref() {
                credential.url = clean_url(Some(url));
            }
            if let Some(interval) = changes.rotation_interval_days {
                credential.rotation.interval_days = interval;
            }
            if let Some(sensitivity) = changes.sensitivity {
                credential.sensitivity = sensitivity;
            }
            if let Some(metadata) = metadata {
                credential.metadata = metadata;
            }

            let mut changed = Vec::new();
            for (field, value) in [
                (&mut credential.username, &changes.username),
                (&mut credential.email, &changes.email),
                (&mut credential.secret, &changes.secret),
                (&mut credential.notes, &changes.notes),
            ] {
                if let Some(value) = value {
                    field.set(&self.engine, Some(value.as_str()))?;
                    changed.push(field.name());
                }
            }
            if changed.contains(&SECRET.name) {
                credential.mark_secret_rotated(now);
            }

            save(tx, &credential, actor, &now)?;
            if !changed.is_empty() {
                secret_update(tx, ctx, actor, &credential, &changed, "updated")?;
            }
            debug!(credential_id = %id, fields = changed.len(), "Credential updated");
            get(tx, id).map(Gated::Done)
        })
    }

    /// Record that the secret was rotated outside the system.
    pub fn mark_secret_rotated(&self, ctx: &RequestContext, id: CredentialId) -> Result<Credential> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let mut credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(id),
                "mark_secret_rotated",
            )?);
            let now = Utc::now();
            credential.mark_secret_rotated(now);
            save(tx, &credential, actor, &now)?;
            secret_update(tx, ctx, actor, &credential, &[SECRET.name], "rotated")?;
            info!(credential_id = %id, "Secret marked rotated");
            get(tx, id).map(Gated::Done)
        })
    }

    /// Delete a credential with its fields and links.
    pub fn delete(&self, ctx: &RequestContext, id: CredentialId) -> Result<()> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(id),
                "delete_secret",
            )?);
            let entry = AuditEntry::new(actor, AuditAction::DeleteSecret, AuditTarget::Credential(id))
                .with("vault_id", credential.vault_id.get())
                .with("title", credential.title.as_str())
                .with_context(ctx);
            audit::record(tx, entry)?;
            tx.execute("DELETE FROM credentials WHERE id = ?1", [id.get()])
                .map_err(storage)?;
            Ok(Gated::Done(()))
        })?;

        info!(credential_id = %id, "Credential deleted");
        Ok(())
    }

    /// Decrypt every secret of a credential, including custom fields.
    ///
    /// # Security
    /// Writes one `reveal_secret` record. Values that fail to decrypt come
    /// back as `None`.
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) without `reveal`
    pub fn reveal(&self, ctx: &RequestContext, id: CredentialId) -> Result<RevealedCredential> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Reveal,
                AuditTarget::Credential(id),
                "reveal_secret",
            )?);

            let fields = fields_of(tx, id)?;
            let revealed: Vec<&str> = [&credential.username, &credential.email, &credential.secret, &credential.notes]
                .into_iter()
                .filter(|f| f.present())
                .map(|f| f.name())
                .collect();
            let entry = AuditEntry::new(actor, AuditAction::RevealSecret, AuditTarget::Credential(id))
                .with("vault_id", credential.vault_id.get())
                .with("fields_revealed", revealed)
                .with("custom_field_count", fields.len())
                .with_context(ctx);
            audit::record(tx, entry)?;

            Ok(Gated::Done(RevealedCredential {
                credential_id: id,
                title: credential.title.clone(),
                username: credential.username.decrypted(&self.engine),
                email: credential.email.decrypted(&self.engine),
                secret: credential.secret.decrypted(&self.engine),
                notes: credential.notes.decrypted(&self.engine),
                fields: fields
                    .iter()
                    .map(|f| RevealedField {
                        label: f.label.clone(),
                        field_type: f.field_type,
                        is_secret: f.is_secret,
                        value: f.value.decrypted(&self.engine),
                    })
                    .collect(),
            }))
        })
    }

    /// Decrypt one named field (`username`, `email`, `secret` or `notes`).
    ///
    /// Writes one `view_decrypted_field` record.
    pub fn reveal_field(
        &self,
        ctx: &RequestContext,
        id: CredentialId,
        field_name: &str,
    ) -> Result<Option<SensitiveString>> {
        let actor = ctx.actor()?;
        if !SECRET_FIELDS.contains(&field_name) {
            return Err(Error::validation("field_name", format!("'{}' is not a secret field", field_name)));
        }
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Reveal,
                AuditTarget::Credential(id),
                "view_decrypted_field",
            )?);
            let entry = AuditEntry::new(actor, AuditAction::ViewDecryptedField, AuditTarget::Credential(id))
                .with("vault_id", credential.vault_id.get())
                .with("field_name", field_name)
                .with_context(ctx);
            audit::record(tx, entry)?;
            Ok(Gated::Done(
                credential.field(field_name).and_then(|f| f.decrypted(&self.engine)),
            ))
        })
    }

    /// Record that a client copied a field. No plaintext is returned.
    ///
    /// `field_name` is a built-in secret field or a custom field label.
    pub fn copy(&self, ctx: &RequestContext, id: CredentialId, field_name: &str) -> Result<()> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Reveal,
                AuditTarget::Credential(id),
                "copy_secret",
            )?);
            let known = SECRET_FIELDS.contains(&field_name)
                || fields_of(tx, id)?.iter().any(|f| f.label == field_name);
            if !known {
                return Err(Error::validation(
                    "field_name",
                    format!("'{}' is not a field of this credential", field_name),
                ));
            }
            let entry = AuditEntry::new(actor, AuditAction::CopySecret, AuditTarget::Credential(id))
                .with("vault_id", credential.vault_id.get())
                .with("field_name", field_name)
                .with_context(ctx);
            audit::record(tx, entry)?;
            Ok(Gated::Done(()))
        })
    }

    /// Add a custom field.
    pub fn add_field(&self, ctx: &RequestContext, id: CredentialId, input: NewField) -> Result<CredentialField> {
        let actor = ctx.actor()?;
        let label = clean_label(&input.label)?;
        let value = self.encrypt(FIELD_VALUE, input.value.as_deref())?;

        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(id),
                "add_field",
            )?);
            let now = to_db_time(&Utc::now());
            tx.execute(
                "INSERT INTO credential_fields (credential_id, label, field_type, value_ciphertext, value_last4,
                    is_secret, sort_order, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id.get(),
                    label,
                    input.field_type.as_str(),
                    value.ciphertext(),
                    value.last_suffix(),
                    input.is_secret,
                    input.sort_order,
                    now,
                ],
            )
            .map_err(storage)?;
            let field_id = CredentialFieldId::new(tx.last_insert_rowid());
            if value.present() {
                secret_update(tx, ctx, actor, &credential, &[label.as_str()], "field_added")?;
            }
            get_field(tx, field_id).map(Gated::Done)
        })
    }

    /// Change a custom field's label, type, value, secrecy or position.
    ///
    /// A change to the value or label writes one `update_secret` record.
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) without `edit`
    /// - Validation failure on a blank label
    pub fn update_field(
        &self,
        ctx: &RequestContext,
        field_id: CredentialFieldId,
        changes: FieldUpdate,
    ) -> Result<CredentialField> {
        let actor = ctx.actor()?;
        let label = changes.label.as_deref().map(clean_label).transpose()?;

        self.store.write_gated(|tx| {
            let mut field = get_field(tx, field_id)?;
            let credential = get(tx, field.credential_id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(credential.id),
                "update_field",
            )?);

            let previous_label = field.label.clone();
            let mut audited = false;
            if let Some(label) = label {
                audited |= label != field.label;
                field.label = label;
            }
            if let Some(value) = changes.value.as_deref() {
                field.value.set(&self.engine, Some(value))?;
                audited = true;
            }
            if let Some(field_type) = changes.field_type {
                field.field_type = field_type;
            }
            if let Some(is_secret) = changes.is_secret {
                field.is_secret = is_secret;
            }
            if let Some(sort_order) = changes.sort_order {
                field.sort_order = sort_order;
            }

            tx.execute(
                "UPDATE credential_fields SET label = ?1, field_type = ?2, value_ciphertext = ?3,
                    value_last4 = ?4, is_secret = ?5, sort_order = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    field.label,
                    field.field_type.as_str(),
                    field.value.ciphertext(),
                    field.value.last_suffix(),
                    field.is_secret,
                    field.sort_order,
                    to_db_time(&Utc::now()),
                    field_id.get(),
                ],
            )
            .map_err(storage)?;
            if audited {
                let entry = AuditEntry::new(actor, AuditAction::UpdateSecret, AuditTarget::Credential(credential.id))
                    .with("vault_id", credential.vault_id.get())
                    .with("fields_changed", vec![field.label.as_str()])
                    .with("previous_label", previous_label)
                    .with("change", "field_updated")
                    .with_context(ctx);
                audit::record(tx, entry)?;
            }
            debug!(credential_id = %credential.id, field_id = %field_id, "Custom field updated");
            get_field(tx, field_id).map(Gated::Done)
        })
    }

    /// Delete a custom field. Writes one `update_secret` record.
    pub fn remove_field(&self, ctx: &RequestContext, field_id: CredentialFieldId) -> Result<()> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let field = get_field(tx, field_id)?;
            let credential = get(tx, field.credential_id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(credential.id),
                "remove_field",
            )?);
            tx.execute("DELETE FROM credential_fields WHERE id = ?1", [field_id.get()])
                .map_err(storage)?;
            secret_update(tx, ctx, actor, &credential, &[field.label.as_str()], "field_removed")?;
            Ok(Gated::Done(()))
        })
    }

    /// Custom fields in display order.
    pub fn fields(&self, ctx: &RequestContext, id: CredentialId) -> Result<Vec<CredentialField>> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::View,
                AuditTarget::Credential(id),
                "view_credential",
            )?);
            fields_of(tx, id).map(Gated::Done)
        })
    }

    /// Link a credential to a business record. Linking twice returns the
    /// existing link.
    pub fn link_to(
        &self,
        ctx: &RequestContext,
        id: CredentialId,
        target: LinkTarget,
        relationship: LinkRelationship,
    ) -> Result<CredentialLink> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(id),
                "link_credential",
            )?);

            if let Some(existing) = find_link(tx, id, target, relationship)? {
                return Ok(Gated::Done(existing));
            }
            insert_link(tx, id, target, relationship, actor).map(Gated::Done)
        })
    }

    /// Create a link, rejecting one that already exists.
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) without `edit`
    /// - Validation failure on `linkable_id` for a duplicate link
    pub fn add_link(
        &self,
        ctx: &RequestContext,
        id: CredentialId,
        target: LinkTarget,
        relationship: LinkRelationship,
    ) -> Result<CredentialLink> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(id),
                "link_credential",
            )?);
            insert_link(tx, id, target, relationship, actor).map(Gated::Done)
        })
    }

    /// Remove links to a record, for one relationship or all of them.
    /// Returns the number of links removed.
    pub fn unlink_from(
        &self,
        ctx: &RequestContext,
        id: CredentialId,
        target: LinkTarget,
        relationship: Option<LinkRelationship>,
    ) -> Result<usize> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::Edit,
                AuditTarget::Credential(id),
                "unlink_credential",
            )?);
            let removed = tx
                .execute(
                    "DELETE FROM credential_links
                     WHERE credential_id = ?1 AND linkable_type = ?2 AND linkable_id = ?3
                       AND (?4 IS NULL OR relationship = ?4)",
                    params![
                        id.get(),
                        target.kind().as_str(),
                        target.id(),
                        relationship.map(|r| r.as_str()),
                    ],
                )
                .map_err(storage)?;
            Ok(Gated::Done(removed))
        })
    }

    pub fn links(&self, ctx: &RequestContext, id: CredentialId) -> Result<Vec<CredentialLink>> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let credential = get(tx, id)?;
            granted!(vault::authorize(
                tx,
                ctx,
                actor,
                credential.vault_id,
                Capability::View,
                AuditTarget::Credential(id),
                "view_credential",
            )?);
            links_of(tx, id).map(Gated::Done)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{Role, UserRole};
    use crate::audit::{AuditLog, AuditQuery, AuditRecord};
    use crate::credential::{CredentialType, FieldType};
    use crate::rotation::RotationStatus;
    use crate::users::UserDirectory;
    use crate::vault::VaultManager;
    use dealvault_common::LegalEntityId;
    use dealvault_crypto::{MasterKey, KEY_LENGTH};

    struct Fixture {
        store: Arc<Store>,
        ops: CredentialOperations,
        vault: VaultId,
        admin: UserId,
        editor: UserId,
        revealer: UserId,
        viewer: UserId,
        outsider: UserId,
        auditor: UserId,
    }

    impl Fixture {
        fn ctx(&self, user: UserId) -> RequestContext {
            RequestContext::for_actor(user).with_ip_address("192.0.2.10")
        }

        fn audit(&self, query: AuditQuery) -> Vec<AuditRecord> {
            AuditLog::new(self.store.clone())
                .query(&RequestContext::for_actor(self.auditor), &query)
                .unwrap()
                .records
        }

        fn bank_login(&self) -> Credential {
            let mut input = NewCredential::new("Chase portal", CredentialType::BankPortal);
            input.url = Some("https://chase.example.com".into());
            input.username = Some("ops-team".into());
            input.secret = Some("hunter2-4321".into());
            input.notes = Some("MFA on the ops phone".into());
            input.rotation_interval_days = Some(90);
            self.ops.create(&self.ctx(self.admin), self.vault, input).unwrap()
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let engine = Arc::new(EncryptionEngine::from_key(MasterKey::from_bytes([7u8; KEY_LENGTH])));
        let users = UserDirectory::new(store.clone());
        let user = |email: &str, role: UserRole| users.create(email, email, role).unwrap().id;
        let admin = user("admin@example.com", UserRole::Member);
        let editor = user("editor@example.com", UserRole::Member);
        let revealer = user("revealer@example.com", UserRole::Member);
        let viewer = user("viewer@example.com", UserRole::Member);
        let outsider = user("outsider@example.com", UserRole::Member);
        let auditor = user("auditor@example.com", UserRole::Ops);

        let vaults = VaultManager::new(store.clone());
        let ctx = RequestContext::for_actor(admin);
        let vault = vaults.create(&ctx, "Operations", None).unwrap().id;
        vaults.add_member(&ctx, vault, editor, Role::Editor).unwrap();
        vaults.add_member(&ctx, vault, revealer, Role::Revealer).unwrap();
        vaults.add_member(&ctx, vault, viewer, Role::Viewer).unwrap();

        Fixture {
            ops: CredentialOperations::new(store.clone(), engine),
            store,
            vault,
            admin,
            editor,
            revealer,
            viewer,
            outsider,
            auditor,
        }
    }

    #[test]
    fn test_create_masks_and_reveals() {
        let f = fixture();
        let credential = f.bank_login();

        let summary = f.ops.show(&f.ctx(f.viewer), credential.id).unwrap();
        assert_eq!(summary.secret.as_deref(), Some("••••4321"));
        assert_eq!(summary.username.as_deref(), Some("••••team"));
        assert!(summary.has_notes);
        assert_eq!(summary.rotation_status, RotationStatus::Ok);

        let revealed = f.ops.reveal(&f.ctx(f.admin), credential.id).unwrap();
        assert_eq!(revealed.secret.unwrap(), "hunter2-4321");
        assert_eq!(revealed.notes.unwrap(), "MFA on the ops phone");
        assert!(revealed.email.is_none());

        let reveals = f.audit(AuditQuery::reveals().for_target(AuditTarget::Credential(credential.id)));
        assert_eq!(reveals.len(), 1);
        assert_eq!(reveals[0].actor, f.admin);
        assert_eq!(reveals[0].ip_address(), Some("192.0.2.10"));
    }

    #[test]
    fn test_secret_at_creation_counts_as_rotation() {
        let f = fixture();
        let credential = f.bank_login();
        assert!(credential.rotation.last_rotated_at.is_some());

        let mut input = NewCredential::new("Placeholder", CredentialType::Other);
        input.rotation_interval_days = Some(30);
        let empty = f.ops.create(&f.ctx(f.editor), f.vault, input).unwrap();
        assert_eq!(empty.rotation_status(Utc::now()), RotationStatus::Overdue);
    }

    #[test]
    fn test_access_matrix_and_one_denial_per_failure() {
        let f = fixture();
        let credential = f.bank_login();

        // (user, may edit, may reveal)
        let cases = [
            (f.admin, true, true),
            (f.editor, true, false),
            (f.revealer, false, true),
            (f.viewer, false, false),
            (f.outsider, false, false),
        ];

        let mut expected_denials = 0;
        for (user, edit, reveal) in cases {
            let ctx = f.ctx(user);

            let revealed = f.ops.reveal(&ctx, credential.id);
            assert_eq!(revealed.is_ok(), reveal);
            let copied = f.ops.copy(&ctx, credential.id, "secret");
            assert_eq!(copied.is_ok(), reveal);
            let update = CredentialUpdate {
                url: Some("https://chase.example.com/login".into()),
                ..Default::default()
            };
            let updated = f.ops.update(&ctx, credential.id, update);
            assert_eq!(updated.is_ok(), edit);

            if !reveal {
                assert!(revealed.unwrap_err().is_access_denied());
                expected_denials += 2;
            }
            if !edit {
                assert!(updated.unwrap_err().is_access_denied());
                expected_denials += 1;
            }
            assert_eq!(f.audit(AuditQuery::denials()).len(), expected_denials);
        }

        let viewer_denial = f
            .audit(AuditQuery::denials().by_actor(f.viewer))
            .into_iter()
            .find(|r| r.metadata["action_attempted"] == "reveal_secret")
            .unwrap();
        assert_eq!(viewer_denial.target, AuditTarget::Credential(credential.id));
        assert_eq!(viewer_denial.metadata["role"], "viewer");
        assert_eq!(viewer_denial.metadata["required_capability"], "reveal");
    }

    #[test]
    fn test_outsider_cannot_view() {
        let f = fixture();
        let credential = f.bank_login();
        assert!(f
            .ops
            .show(&f.ctx(f.outsider), credential.id)
            .unwrap_err()
            .is_access_denied());
        assert!(f
            .ops
            .list(&f.ctx(f.outsider), f.vault, &CredentialFilter::default())
            .unwrap_err()
            .is_access_denied());
    }

    #[test]
    fn test_anonymous_is_rejected_without_audit() {
        let f = fixture();
        let credential = f.bank_login();
        assert!(matches!(
            f.ops.reveal(&RequestContext::anonymous(), credential.id),
            Err(Error::Unauthenticated)
        ));
        assert!(f.audit(AuditQuery::denials()).is_empty());
    }

    #[test]
    fn test_secret_update_marks_rotated_and_logs_once() {
        let f = fixture();
        let credential = f.bank_login();
        let before = credential.rotation.last_rotated_at.unwrap();

        let updated = f
            .ops
            .update(
                &f.ctx(f.editor),
                credential.id,
                CredentialUpdate {
                    secret: Some("new-secret-9876".into()),
                    title: Some("Chase business portal".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(updated.rotation.last_rotated_at.unwrap() >= before);
        assert_eq!(updated.secret.masked().as_deref(), Some("••••9876"));
        assert_eq!(updated.updated_by, Some(f.editor));

        let updates = f.audit(
            AuditQuery::all()
                .actions([AuditAction::UpdateSecret])
                .for_target(AuditTarget::Credential(credential.id))
                .by_actor(f.editor),
        );
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].metadata["fields_changed"], serde_json::json!(["secret"]));
    }

    #[test]
    fn test_non_secret_update_is_not_logged() {
        let f = fixture();
        let credential = f.bank_login();
        f.ops
            .update(
                &f.ctx(f.editor),
                credential.id,
                CredentialUpdate {
                    sensitivity: Some(crate::credential::Sensitivity::HighlyConfidential),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(f.audit(AuditQuery::updates().by_actor(f.editor)).is_empty());
    }

    #[test]
    fn test_blank_secret_clears_value() {
        let f = fixture();
        let credential = f.bank_login();
        let updated = f
            .ops
            .update(
                &f.ctx(f.admin),
                credential.id,
                CredentialUpdate {
                    notes: Some("   ".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!updated.notes.present());
        assert_eq!(updated.notes.masked(), None);
    }

    #[test]
    fn test_validation_failures() {
        let f = fixture();
        let err = f
            .ops
            .create(&f.ctx(f.admin), f.vault, NewCredential::new("  ", CredentialType::Login))
            .unwrap_err();
        assert!(err.is_validation());

        let mut input = NewCredential::new("Key", CredentialType::ApiKey);
        input.rotation_interval_days = Some(0);
        assert!(f.ops.create(&f.ctx(f.admin), f.vault, input).unwrap_err().is_validation());
    }

    #[test]
    fn test_rotation_interval_is_bounded() {
        let f = fixture();
        let ctx = f.ctx(f.admin);

        let mut input = NewCredential::new("Forever", CredentialType::ApiKey);
        input.rotation_interval_days = Some(i64::MAX / 2);
        let err = f.ops.create(&ctx, f.vault, input).unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "rotation_interval_days"));

        let mut input = NewCredential::new("Century", CredentialType::ApiKey);
        input.secret = Some("k-1".into());
        input.rotation_interval_days = Some(MAX_ROTATION_INTERVAL_DAYS);
        let credential = f.ops.create(&ctx, f.vault, input).unwrap();
        assert_eq!(credential.rotation_status(Utc::now()), RotationStatus::Ok);

        let too_long = CredentialUpdate {
            rotation_interval_days: Some(Some(MAX_ROTATION_INTERVAL_DAYS + 1)),
            ..Default::default()
        };
        assert!(f.ops.update(&ctx, credential.id, too_long).unwrap_err().is_validation());
    }

    #[test]
    fn test_stored_huge_interval_degrades_on_read() {
        let f = fixture();
        let credential = f.bank_login();
        f.store
            .write(|tx| {
                tx.execute(
                    "UPDATE credentials SET rotation_interval_days = ?1 WHERE id = ?2",
                    params![i64::MAX / 2, credential.id.get()],
                )
                .map_err(storage)
            })
            .unwrap();

        let ctx = f.ctx(f.viewer);
        let summary = f.ops.show(&ctx, credential.id).unwrap();
        assert_eq!(summary.rotation_status, RotationStatus::Ok);
        assert!(summary.days_until_rotation.unwrap() > MAX_ROTATION_INTERVAL_DAYS);
        assert_eq!(f.ops.list(&ctx, f.vault, &CredentialFilter::default()).unwrap().len(), 1);

        let stats = VaultManager::new(f.store.clone())
            .stats(&ctx, f.vault, Utc::now())
            .unwrap();
        assert_eq!(stats.credential_count, 1);
        assert_eq!(stats.overdue_rotation_count, 0);
    }

    #[test]
    fn test_reveal_field_and_copy_are_logged_with_field_name() {
        let f = fixture();
        let credential = f.bank_login();
        let ctx = f.ctx(f.revealer);

        let username = f.ops.reveal_field(&ctx, credential.id, "username").unwrap();
        assert_eq!(username.unwrap(), "ops-team");
        f.ops.copy(&ctx, credential.id, "secret").unwrap();

        assert!(f
            .ops
            .reveal_field(&ctx, credential.id, "title")
            .unwrap_err()
            .is_validation());
        assert!(f.ops.copy(&ctx, credential.id, "pin").unwrap_err().is_validation());

        let records = f.audit(AuditQuery::all().by_actor(f.revealer));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, AuditAction::CopySecret);
        assert_eq!(records[0].field_name(), Some("secret"));
        assert_eq!(records[1].action, AuditAction::ViewDecryptedField);
        assert_eq!(records[1].field_name(), Some("username"));
    }

    #[test]
    fn test_custom_fields() {
        let f = fixture();
        let credential = f.bank_login();
        let ctx = f.ctx(f.admin);

        let mut pin = NewField::secret("Card PIN", FieldType::Pin, "0042");
        pin.sort_order = 2;
        f.ops.add_field(&ctx, credential.id, pin).unwrap();
        let mut token = NewField::secret("API token", FieldType::Token, "tok_live_abcdef");
        token.sort_order = 1;
        f.ops.add_field(&ctx, credential.id, token).unwrap();

        let fields = f.ops.fields(&f.ctx(f.viewer), credential.id).unwrap();
        let labels: Vec<_> = fields.iter().map(|f| f.label.as_str()).collect();
        assert_eq!(labels, ["API token", "Card PIN"]);
        assert_eq!(fields[0].masked_value().as_deref(), Some("••••cdef"));
        assert_eq!(fields[1].masked_value().as_deref(), Some(dealvault_crypto::PRESENT_INDICATOR));

        let revealed = f.ops.reveal(&ctx, credential.id).unwrap();
        assert_eq!(revealed.fields.len(), 2);
        assert_eq!(revealed.fields[1].value.as_ref().unwrap(), &"0042");

        f.ops.copy(&f.ctx(f.revealer), credential.id, "Card PIN").unwrap();
        assert!(f
            .ops
            .add_field(&f.ctx(f.viewer), credential.id, NewField::secret("x", FieldType::Text, "y"))
            .unwrap_err()
            .is_access_denied());
    }

    #[test]
    fn test_update_and_remove_custom_field() {
        let f = fixture();
        let credential = f.bank_login();
        let ctx = f.ctx(f.editor);
        let pin = f
            .ops
            .add_field(&ctx, credential.id, NewField::secret("Card PIN", FieldType::Pin, "004217"))
            .unwrap();
        let note = f
            .ops
            .add_field(&ctx, credential.id, NewField::secret("Branch", FieldType::Text, "Main St"))
            .unwrap();

        let updated = f
            .ops
            .update_field(
                &ctx,
                pin.id,
                FieldUpdate {
                    label: Some(" Debit PIN ".into()),
                    value: Some("771234".into()),
                    sort_order: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.label, "Debit PIN");
        assert_eq!(updated.masked_value().as_deref(), Some("••••1234"));

        // Reordering alone is not a secret change.
        f.ops
            .update_field(
                &ctx,
                note.id,
                FieldUpdate {
                    sort_order: Some(9),
                    ..Default::default()
                },
            )
            .unwrap();
        let labels: Vec<_> = f
            .ops
            .fields(&ctx, credential.id)
            .unwrap()
            .into_iter()
            .map(|field| field.label)
            .collect();
        assert_eq!(labels, ["Debit PIN", "Branch"]);

        f.ops.remove_field(&ctx, note.id).unwrap();
        assert_eq!(f.ops.fields(&ctx, credential.id).unwrap().len(), 1);
        assert!(matches!(f.ops.remove_field(&ctx, note.id), Err(Error::NotFound(_))));

        let changes: Vec<_> = f
            .audit(AuditQuery::updates().by_actor(f.editor))
            .into_iter()
            .map(|r| r.metadata["change"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(changes, ["field_removed", "field_updated", "field_added", "field_added"]);

        let viewer = f.ctx(f.viewer);
        let blank = FieldUpdate {
            label: Some("  ".into()),
            ..Default::default()
        };
        assert!(f.ops.update_field(&ctx, pin.id, blank).unwrap_err().is_validation());
        assert!(f
            .ops
            .update_field(&viewer, pin.id, FieldUpdate::default())
            .unwrap_err()
            .is_access_denied());
        assert!(f.ops.remove_field(&viewer, pin.id).unwrap_err().is_access_denied());
        assert_eq!(f.audit(AuditQuery::denials().by_actor(f.viewer)).len(), 2);
    }

    #[test]
    fn test_add_link_rejects_duplicate() {
        let f = fixture();
        let credential = f.bank_login();
        let ctx = f.ctx(f.editor);
        let org = LinkTarget::Organization(31);

        let link = f.ops.add_link(&ctx, credential.id, org, LinkRelationship::Admin).unwrap();
        assert_eq!(link.target, org);

        let err = f
            .ops
            .add_link(&ctx, credential.id, org, LinkRelationship::Admin)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "linkable_id"));

        // Another relationship to the same record is a distinct link, and
        // find-or-create returns the existing one.
        f.ops.add_link(&ctx, credential.id, org, LinkRelationship::Backup).unwrap();
        let found = f.ops.link_to(&ctx, credential.id, org, LinkRelationship::Admin).unwrap();
        assert_eq!(found, link);
        assert_eq!(f.ops.links(&ctx, credential.id).unwrap().len(), 2);
    }

    #[test]
    fn test_links_are_idempotent_and_filterable() {
        let f = fixture();
        let credential = f.bank_login();
        let ctx = f.ctx(f.editor);
        let entity = LinkTarget::LegalEntity(LegalEntityId::new(12));

        let first = f.ops.link_to(&ctx, credential.id, entity, LinkRelationship::Login).unwrap();
        let again = f.ops.link_to(&ctx, credential.id, entity, LinkRelationship::Login).unwrap();
        assert_eq!(first, again);
        f.ops
            .link_to(&ctx, credential.id, entity, LinkRelationship::Backup)
            .unwrap();
        f.ops
            .link_to(&ctx, credential.id, LinkTarget::Deal(4), LinkRelationship::General)
            .unwrap();
        assert_eq!(f.ops.links(&ctx, credential.id).unwrap().len(), 3);

        let filter = CredentialFilter {
            linked_to: Some(LinkTarget::Deal(4)),
            ..Default::default()
        };
        assert_eq!(f.ops.list(&ctx, f.vault, &filter).unwrap().len(), 1);

        assert_eq!(
            f.ops
                .unlink_from(&ctx, credential.id, entity, Some(LinkRelationship::Login))
                .unwrap(),
            1
        );
        assert_eq!(f.ops.unlink_from(&ctx, credential.id, entity, None).unwrap(), 1);
        assert_eq!(f.ops.links(&ctx, credential.id).unwrap().len(), 1);
    }

    #[test]
    fn test_list_filters() {
        let f = fixture();
        f.bank_login();
        let ctx = f.ctx(f.admin);
        let mut key = NewCredential::new("AWS root", CredentialType::CloudProvider);
        key.secret = Some("AKIAEXAMPLE".into());
        key.url = Some("https://aws.example.com".into());
        f.ops.create(&ctx, f.vault, key).unwrap();
        let mut stale = NewCredential::new("Old DB", CredentialType::Database);
        stale.rotation_interval_days = Some(30);
        f.ops.create(&ctx, f.vault, stale).unwrap();

        let titles = |filter: CredentialFilter| -> Vec<String> {
            f.ops
                .list(&f.ctx(f.viewer), f.vault, &filter)
                .unwrap()
                .into_iter()
                .map(|s| s.title)
                .collect()
        };

        assert_eq!(titles(CredentialFilter::default()), ["AWS root", "Chase portal", "Old DB"]);
        assert_eq!(
            titles(CredentialFilter {
                credential_type: Some(CredentialType::CloudProvider),
                ..Default::default()
            }),
            ["AWS root"]
        );
        assert_eq!(
            titles(CredentialFilter {
                search: Some("CHASE".into()),
                ..Default::default()
            }),
            ["Chase portal"]
        );
        assert_eq!(
            titles(CredentialFilter {
                rotation_status: Some(RotationStatus::Overdue),
                ..Default::default()
            }),
            ["Old DB"]
        );
    }

    #[test]
    fn test_mark_rotated_and_delete() {
        let f = fixture();
        let mut input = NewCredential::new("Legacy", CredentialType::Login);
        input.rotation_interval_days = Some(30);
        let credential = f.ops.create(&f.ctx(f.admin), f.vault, input).unwrap();
        f.ops
            .add_field(&f.ctx(f.admin), credential.id, NewField::secret("PIN", FieldType::Pin, "123456"))
            .unwrap();

        let rotated = f.ops.mark_secret_rotated(&f.ctx(f.editor), credential.id).unwrap();
        assert_eq!(rotated.rotation_status(Utc::now()), RotationStatus::Ok);

        f.ops.delete(&f.ctx(f.editor), credential.id).unwrap();
        assert!(matches!(
            f.ops.show(&f.ctx(f.admin), credential.id),
            Err(Error::NotFound(_))
        ));
        let orphaned: i64 = f
            .store
            .read(|conn| {
                conn.query_row("SELECT COUNT(*) FROM credential_fields", [], |row| row.get(0))
                    .map_err(storage)
            })
            .unwrap();
        assert_eq!(orphaned, 0);

        let deletes = f.audit(AuditQuery::updates().by_actor(f.editor));
        assert_eq!(deletes[0].action, AuditAction::DeleteSecret);
        assert_eq!(deletes[0].metadata["title"], "Legacy");
    }
}
