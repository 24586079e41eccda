//! Legal entities and their tax IDs.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::access::UserRole;
use crate::audit::{self, AuditAction, AuditEntry, AuditTarget};
use crate::context::RequestContext;
use crate::store::{from_db_tag, from_db_time, granted, not_found, storage, to_db_time, Gated, Store};
use crate::tag::tagged_enum;
use crate::users;
use dealvault_common::{Error, LegalEntityId, Result, SensitiveString};
use dealvault_crypto::{EncryptedField, EncryptionEngine, FieldSpec};

pub const TAX_ID: FieldSpec = FieldSpec::compact("ein", 4);

tagged_enum! {
    pub enum EntityType in "entity_type" {
        Llc => ("llc", "LLC"),
        CCorp => ("c_corp", "C Corporation"),
        SCorp => ("s_corp", "S Corporation"),
        Lp => ("lp", "Limited Partnership"),
        Trust => ("trust", "Trust"),
        SeriesLlc => ("series_llc", "Series LLC"),
        Other => ("other", "Other"),
    }
}

tagged_enum! {
    pub enum EntityStatus in "status" {
        Active => ("active", "Active"),
        Inactive => ("inactive", "Inactive"),
        Dissolved => ("dissolved", "Dissolved"),
    }
}

impl Default for EntityStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// A legal entity that owns bank accounts.
#[derive(Debug, Clone)]
pub struct LegalEntity {
    pub id: LegalEntityId,
    pub name_legal: String,
    pub name_short: Option<String>,
    pub entity_type: EntityType,
    pub status: EntityStatus,
    pub(crate) tax_id: EncryptedField,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const COLUMNS: &str =
    "id, name_legal, name_short, entity_type, status, ein_ciphertext, ein_last4, created_at, updated_at";

impl LegalEntity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: LegalEntityId::new(row.get(0)?),
            name_legal: row.get(1)?,
            name_short: row.get(2)?,
            entity_type: from_db_tag(&row.get::<_, String>(3)?)?,
            status: from_db_tag(&row.get::<_, String>(4)?)?,
            tax_id: EncryptedField::restore(TAX_ID, row.get(5)?, row.get(6)?),
            created_at: from_db_time(&row.get::<_, String>(7)?)?,
            updated_at: from_db_time(&row.get::<_, String>(8)?)?,
        })
    }

    /// Short name if set, otherwise the legal name.
    pub fn display_name(&self) -> &str {
        self.name_short
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name_legal)
    }

    pub fn masked_tax_id(&self) -> Option<String> {
        self.tax_id.masked()
    }
}

/// Input for a new legal entity.
#[derive(Debug, Clone)]
pub struct NewLegalEntity {
    pub name_legal: String,
    pub name_short: Option<String>,
    pub entity_type: EntityType,
    pub status: EntityStatus,
    pub tax_id: Option<String>,
}

impl NewLegalEntity {
    pub fn new(name_legal: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            name_legal: name_legal.into(),
            name_short: None,
            entity_type,
            status: EntityStatus::default(),
            tax_id: None,
        }
    }
}

/// Masked view of a legal entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegalEntitySummary {
    pub id: LegalEntityId,
    pub display_name: String,
    pub entity_type: EntityType,
    pub status: EntityStatus,
    pub tax_id: Option<String>,
}

pub(crate) fn get(conn: &Connection, id: LegalEntityId) -> Result<LegalEntity> {
    conn.query_row(
        &format!("SELECT {} FROM legal_entities WHERE id = ?1", COLUMNS),
        [id.get()],
        LegalEntity::from_row,
    )
    .map_err(not_found("legal entity", id.get()))
}

fn tax_id_update(
    conn: &Connection,
    ctx: &RequestContext,
    entity: &LegalEntity,
    change: &str,
) -> Result<()> {
    let entry = AuditEntry::new(ctx.actor()?, AuditAction::UpdateSecret, AuditTarget::LegalEntity(entity.id))
        .with("field_name", TAX_ID.name)
        .with("change", change)
        .with_context(ctx);
    audit::record(conn, entry).map(|_| ())
}

/// Legal entity records and audited tax ID access.
///
/// Managing and revealing tax IDs needs an admin or ops organisation role.
pub struct LegalEntities {
    store: Arc<Store>,
    engine: Arc<EncryptionEngine>,
}

impl LegalEntities {
    pub fn new(store: Arc<Store>, engine: Arc<EncryptionEngine>) -> Self {
        Self { store, engine }
    }

    pub fn create(&self, ctx: &RequestContext, input: NewLegalEntity) -> Result<LegalEntity> {
        let actor = ctx.actor()?;
        let name_legal = input.name_legal.trim().to_string();
        if name_legal.is_empty() {
            return Err(Error::validation("name_legal", "can't be blank"));
        }
        let name_short = input
            .name_short
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let mut tax_id = EncryptedField::new(TAX_ID);
        tax_id.set(&self.engine, input.tax_id.as_deref())?;

        let entity = self.store.write_gated(|tx| {
            granted!(users::authorize(
                tx,
                ctx,
                actor,
                UserRole::can_manage_bank_accounts,
                AuditTarget::User(actor),
                "create_legal_entity",
            )?);
            let now = to_db_time(&Utc::now());
            tx.execute(
                "INSERT INTO legal_entities (name_legal, name_short, entity_type, status, ein_ciphertext, ein_last4, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    name_legal,
                    name_short,
                    input.entity_type.as_str(),
                    input.status.as_str(),
                    tax_id.ciphertext(),
                    tax_id.last_suffix(),
                    now,
                ],
            )
            .map_err(storage)?;
            let entity = get(tx, LegalEntityId::new(tx.last_insert_rowid()))?;
            if entity.tax_id.present() {
                tax_id_update(tx, ctx, &entity, "created")?;
            }
            Ok(Gated::Done(entity))
        })?;

        info!(legal_entity_id = %entity.id, "Legal entity created");
        Ok(entity)
    }

    pub fn get(&self, id: LegalEntityId) -> Result<LegalEntity> {
        self.store.read(|conn| get(conn, id))
    }

    /// Masked views of all entities, by legal name.
    pub fn list(&self) -> Result<Vec<LegalEntitySummary>> {
        self.store.read(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM legal_entities ORDER BY name_legal, id", COLUMNS))
                .map_err(storage)?;
            let entities = stmt
                .query_map([], LegalEntity::from_row)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(entities.iter().map(Self::summary).collect())
        })
    }

    pub fn summary(entity: &LegalEntity) -> LegalEntitySummary {
        LegalEntitySummary {
            id: entity.id,
            display_name: entity.display_name().to_string(),
            entity_type: entity.entity_type,
            status: entity.status,
            tax_id: entity.masked_tax_id(),
        }
    }

    /// Replace or clear (`None` or blank) the tax ID.
    pub fn set_tax_id(&self, ctx: &RequestContext, id: LegalEntityId, tax_id: Option<&str>) -> Result<LegalEntity> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let mut entity = get(tx, id)?;
            granted!(users::authorize(
                tx,
                ctx,
                actor,
                UserRole::can_manage_bank_accounts,
                AuditTarget::LegalEntity(id),
                "update_tax_id",
            )?);
            entity.tax_id.set(&self.engine, tax_id)?;
            tx.execute(
                "UPDATE legal_entities SET ein_ciphertext = ?1, ein_last4 = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    entity.tax_id.ciphertext(),
                    entity.tax_id.last_suffix(),
                    to_db_time(&Utc::now()),
                    id.get(),
                ],
            )
            .map_err(storage)?;
            let change = if entity.tax_id.present() { "updated" } else { "cleared" };
            tax_id_update(tx, ctx, &entity, change)?;
            get(tx, id).map(Gated::Done)
        })
    }

    /// Decrypt the tax ID.
    ///
    /// `None` means no tax ID on file (or an unreadable one); the reveal is
    /// recorded either way.
    pub fn reveal_tax_id(&self, ctx: &RequestContext, id: LegalEntityId) -> Result<Option<SensitiveString>> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let entity = get(tx, id)?;
            granted!(users::authorize(
                tx,
                ctx,
                actor,
                UserRole::can_reveal_secrets,
                AuditTarget::LegalEntity(id),
                "reveal_secret",
            )?);
            let entry = AuditEntry::new(actor, AuditAction::RevealSecret, AuditTarget::LegalEntity(id))
                .with("field_name", TAX_ID.name)
                .with("present", entity.tax_id.present())
                .with_context(ctx);
            audit::record(tx, entry)?;
            Ok(Gated::Done(entity.tax_id.decrypted(&self.engine)))
        })
    }
}
