//! Vaults and memberships.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::access::{Capability, Role};
use crate::audit::{self, AuditAction, AuditEntry, AuditTarget};
use crate::context::RequestContext;
use crate::rotation::{RotationPolicy, RotationStatus};
use crate::store::{
    constraint, from_db_json, from_db_tag, from_db_time, granted, not_found, storage, to_db_time,
    Gated, Store,
};
use crate::users;
use dealvault_common::{Error, MembershipId, Result, UserId, VaultId};

/// A vault: a named container of credentials with its own membership list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vault {
    pub id: VaultId,
    pub name: String,
    pub description: Option<String>,
    pub metadata: Value,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A user's role in one vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub id: MembershipId,
    pub vault_id: VaultId,
    pub user_id: UserId,
    pub role: Role,
    pub created_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate credential counts for a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VaultStats {
    pub credential_count: usize,
    pub overdue_rotation_count: usize,
    pub due_soon_rotation_count: usize,
}

/// Changes to a vault. `None` leaves a field as it is; a description of
/// `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct VaultUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub metadata: Option<Value>,
}

const VAULT_COLUMNS: &str = "id, name, description, metadata, created_by_id, created_at, updated_at";
const MEMBERSHIP_COLUMNS: &str =
    "id, vault_id, user_id, role, created_by_id, created_at, updated_at";

fn vault_from_row(row: &Row<'_>) -> rusqlite::Result<Vault> {
    Ok(Vault {
        id: VaultId::new(row.get(0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        metadata: from_db_json(&row.get::<_, String>(3)?)?,
        created_by: row.get::<_, Option<i64>>(4)?.map(UserId::new),
        created_at: from_db_time(&row.get::<_, String>(5)?)?,
        updated_at: from_db_time(&row.get::<_, String>(6)?)?,
    })
}

fn membership_from_row(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: MembershipId::new(row.get(0)?),
        vault_id: VaultId::new(row.get(1)?),
        user_id: UserId::new(row.get(2)?),
        role: from_db_tag(&row.get::<_, String>(3)?)?,
        created_by: row.get::<_, Option<i64>>(4)?.map(UserId::new),
        created_at: from_db_time(&row.get::<_, String>(5)?)?,
        updated_at: from_db_time(&row.get::<_, String>(6)?)?,
    })
}

pub(crate) fn get(conn: &Connection, id: VaultId) -> Result<Vault> {
    conn.query_row(
        &format!("SELECT {} FROM vaults WHERE id = ?1", VAULT_COLUMNS),
        [id.get()],
        vault_from_row,
    )
    .map_err(not_found("vault", id.get()))
}

pub(crate) fn membership_for(
    conn: &Connection,
    vault_id: VaultId,
    user_id: UserId,
) -> Result<Option<Membership>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM vault_memberships WHERE vault_id = ?1 AND user_id = ?2",
            MEMBERSHIP_COLUMNS
        ),
        [vault_id.get(), user_id.get()],
        membership_from_row,
    )
    .optional()
    .map_err(storage)
}

pub(crate) fn role_for(conn: &Connection, vault_id: VaultId, user_id: UserId) -> Result<Option<Role>> {
    Ok(membership_for(conn, vault_id, user_id)?.map(|m| m.role))
}

/// Resolve the caller's role in a vault and check a capability.
///
/// A failed check writes one `access_denied` record naming the attempted
/// operation and the caller's current role (if any).
pub(crate) fn authorize(
    conn: &Connection,
    ctx: &RequestContext,
    actor: UserId,
    vault_id: VaultId,
    capability: Capability,
    target: AuditTarget,
    attempted: &str,
) -> Result<Gated<Role>> {
    let role = role_for(conn, vault_id, actor)?;
    match role {
        Some(role) if role.allows(capability) => Ok(Gated::Done(role)),
        _ => {
            let mut extra = Map::new();
            extra.insert("vault_id".into(), vault_id.get().into());
            extra.insert("required_capability".into(), capability.as_str().into());
            extra.insert(
                "role".into(),
                role.map_or(Value::Null, |r| Value::from(r.as_str())),
            );
            audit::deny(conn, ctx, actor, target, attempted, extra)
        }
    }
}

fn admin_count(conn: &Connection, vault_id: VaultId) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM vault_memberships WHERE vault_id = ?1 AND role = 'admin'",
        [vault_id.get()],
        |row| row.get(0),
    )
    .map_err(storage)
}

/// Reject a change that would leave the vault without an admin.
fn ensure_admin_remains(conn: &Connection, current: &Membership, new_role: Option<Role>) -> Result<()> {
    if current.role == Role::Admin
        && new_role != Some(Role::Admin)
        && admin_count(conn, current.vault_id)? <= 1
    {
        return Err(Error::validation("role", "vault must keep at least one admin"));
    }
    Ok(())
}

fn insert_membership(
    conn: &Connection,
    vault_id: VaultId,
    user_id: UserId,
    role: Role,
    created_by: UserId,
) -> Result<Membership> {
    let now = to_db_time(&Utc::now());
    conn.execute(
        "INSERT INTO vault_memberships (vault_id, user_id, role, created_by_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![vault_id.get(), user_id.get(), role.as_str(), created_by.get(), now],
    )
    .map_err(constraint("user_id", "is already a member of this vault"))?;
    membership_for(conn, vault_id, user_id)?
        .ok_or_else(|| Error::Storage("membership vanished after insert".to_string()))
}

#[allow(clippy::too_many_arguments)]
fn permission_change(
    conn: &Connection,
    ctx: &RequestContext,
    actor: UserId,
    vault_id: VaultId,
    member: UserId,
    change: &str,
    previous: Option<Role>,
    role: Option<Role>,
) -> Result<()> {
    let entry = AuditEntry::new(actor, AuditAction::PermissionChange, AuditTarget::Vault(vault_id))
        .with("member_user_id", member.get())
        .with("change", change)
        .with("previous_role", previous.map(|r| r.as_str()))
        .with("role", role.map(|r| r.as_str()))
        .with_context(ctx);
    audit::record(conn, entry).map(|_| ())
}

/// Vault lifecycle, membership and permission queries.
pub struct VaultManager {
    store: Arc<Store>,
}

impl VaultManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a vault. The creator becomes its first admin.
    ///
    /// # Errors
    /// - `Error::Unauthenticated` without an actor
    /// - Validation failure on blank or duplicate name
    pub fn create(&self, ctx: &RequestContext, name: &str, description: Option<&str>) -> Result<Vault> {
        let actor = ctx.actor()?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("name", "can't be blank"));
        }
        let description = description.map(str::trim).filter(|d| !d.is_empty());

        let vault = self.store.write(|tx| {
            users::get(tx, actor)?;
            let now = to_db_time(&Utc::now());
            tx.execute(
                "INSERT INTO vaults (name, description, metadata, created_by_id, created_at, updated_at)
                 VALUES (?1, ?2, '{}', ?3, ?4, ?4)",
                params![name, description, actor.get(), now],
            )
            .map_err(constraint("name", "has already been taken"))?;
            let vault_id = VaultId::new(tx.last_insert_rowid());
            insert_membership(tx, vault_id, actor, Role::Admin, actor)?;
            permission_change(tx, ctx, actor, vault_id, actor, "added", None, Some(Role::Admin))?;
            get(tx, vault_id)
        })?;

        info!(vault_id = %vault.id, created_by = %actor, "Vault created");
        Ok(vault)
    }

    pub fn get(&self, id: VaultId) -> Result<Vault> {
        self.store.read(|conn| get(conn, id))
    }

    /// Vaults the user holds any membership in, by name.
    pub fn accessible_by(&self, user_id: UserId) -> Result<Vec<Vault>> {
        self.store.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT v.id, v.name, v.description, v.metadata, v.created_by_id, v.created_at, v.updated_at
                     FROM vaults v JOIN vault_memberships m ON m.vault_id = v.id
                     WHERE m.user_id = ?1 ORDER BY v.name",
                )
                .map_err(storage)?;
            let vaults = stmt
                .query_map([user_id.get()], vault_from_row)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(vaults)
        })
    }

    pub fn membership_for(&self, vault_id: VaultId, user_id: UserId) -> Result<Option<Membership>> {
        self.store.read(|conn| membership_for(conn, vault_id, user_id))
    }

    pub fn role_for(&self, vault_id: VaultId, user_id: UserId) -> Result<Option<Role>> {
        self.store.read(|conn| role_for(conn, vault_id, user_id))
    }

    fn allows(&self, vault_id: VaultId, user_id: UserId, capability: Capability) -> Result<bool> {
        Ok(self
            .role_for(vault_id, user_id)?
            .is_some_and(|role| role.allows(capability)))
    }

    pub fn can_view(&self, vault_id: VaultId, user_id: UserId) -> Result<bool> {
        self.allows(vault_id, user_id, Capability::View)
    }

    pub fn can_edit(&self, vault_id: VaultId, user_id: UserId) -> Result<bool> {
        self.allows(vault_id, user_id, Capability::Edit)
    }

    pub fn can_reveal(&self, vault_id: VaultId, user_id: UserId) -> Result<bool> {
        self.allows(vault_id, user_id, Capability::Reveal)
    }

    pub fn can_manage_members(&self, vault_id: VaultId, user_id: UserId) -> Result<bool> {
        self.allows(vault_id, user_id, Capability::ManageMembers)
    }

    /// Members of a vault, admins first.
    pub fn members(&self, ctx: &RequestContext, vault_id: VaultId) -> Result<Vec<Membership>> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            get(tx, vault_id)?;
            granted!(authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::View,
                AuditTarget::Vault(vault_id),
                "list_members",
            )?);
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT {} FROM vault_memberships WHERE vault_id = ?1
                     ORDER BY CASE role WHEN 'admin' THEN 0 WHEN 'editor' THEN 1 WHEN 'revealer' THEN 2 ELSE 3 END, id",
                    MEMBERSHIP_COLUMNS
                ))
                .map_err(storage)?;
            let members = stmt
                .query_map([vault_id.get()], membership_from_row)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(Gated::Done(members))
        })
    }

    /// Grant a user a role in a vault.
    ///
    /// # Preconditions
    /// - Caller holds `manage_members` in the vault
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) without `manage_members`
    /// - Validation failure if the user is already a member
    pub fn add_member(
        &self,
        ctx: &RequestContext,
        vault_id: VaultId,
        user_id: UserId,
        role: Role,
    ) -> Result<Membership> {
        let actor = ctx.actor()?;
        let membership = self.store.write_gated(|tx| {
            get(tx, vault_id)?;
            granted!(authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::ManageMembers,
                AuditTarget::Vault(vault_id),
                "add_member",
            )?);
            users::get(tx, user_id)?;
            let membership = insert_membership(tx, vault_id, user_id, role, actor)?;
            permission_change(tx, ctx, actor, vault_id, user_id, "added", None, Some(role))?;
            Ok(Gated::Done(membership))
        })?;

        info!(vault_id = %vault_id, user_id = %user_id, role = %role, "Member added");
        Ok(membership)
    }

    /// Change a member's role.
    ///
    /// # Errors
    /// - Validation failure when demoting the last admin
    pub fn update_role(
        &self,
        ctx: &RequestContext,
        vault_id: VaultId,
        user_id: UserId,
        role: Role,
    ) -> Result<Membership> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            granted!(authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::ManageMembers,
                AuditTarget::Vault(vault_id),
                "update_member_role",
            )?);
            let current = membership_for(tx, vault_id, user_id)?.ok_or_else(|| {
                Error::NotFound(format!("membership of user {} in vault {}", user_id, vault_id))
            })?;
            if current.role == role {
                return Ok(Gated::Done(current));
            }
            ensure_admin_remains(tx, &current, Some(role))?;

            tx.execute(
                "UPDATE vault_memberships SET role = ?1, updated_at = ?2 WHERE id = ?3",
                params![role.as_str(), to_db_time(&Utc::now()), current.id.get()],
            )
            .map_err(storage)?;
            permission_change(
                tx,
                ctx,
                actor,
                vault_id,
                user_id,
                "role_changed",
                Some(current.role),
                Some(role),
            )?;
            debug!(vault_id = %vault_id, user_id = %user_id, from = %current.role, to = %role, "Member role changed");

            membership_for(tx, vault_id, user_id)?
                .map(Gated::Done)
                .ok_or_else(|| Error::Storage("membership vanished after update".to_string()))
        })
    }

    /// Revoke a user's membership.
    ///
    /// # Errors
    /// - Validation failure when removing the last admin
    pub fn remove_member(&self, ctx: &RequestContext, vault_id: VaultId, user_id: UserId) -> Result<()> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            granted!(authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::ManageMembers,
                AuditTarget::Vault(vault_id),
                "remove_member",
            )?);
            let current = membership_for(tx, vault_id, user_id)?.ok_or_else(|| {
                Error::NotFound(format!("membership of user {} in vault {}", user_id, vault_id))
            })?;
            ensure_admin_remains(tx, &current, None)?;

            tx.execute("DELETE FROM vault_memberships WHERE id = ?1", [current.id.get()])
                .map_err(storage)?;
            permission_change(tx, ctx, actor, vault_id, user_id, "removed", Some(current.role), None)?;
            Ok(Gated::Done(()))
        })?;

        info!(vault_id = %vault_id, user_id = %user_id, "Member removed");
        Ok(())
    }

    /// Delete a vault with all its credentials and memberships.
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) unless the caller is a vault admin
    pub fn delete(&self, ctx: &RequestContext, vault_id: VaultId) -> Result<()> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            let vault = get(tx, vault_id)?;
            granted!(authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::ManageMembers,
                AuditTarget::Vault(vault_id),
                "delete_vault",
            )?);
            let credential_count: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM credentials WHERE vault_id = ?1",
                    [vault_id.get()],
                    |row| row.get(0),
                )
                .map_err(storage)?;

            let entry = AuditEntry::new(actor, AuditAction::DeleteSecret, AuditTarget::Vault(vault_id))
                .with("vault_name", vault.name.as_str())
                .with("credential_count", credential_count)
                .with_context(ctx);
            audit::record(tx, entry)?;
            tx.execute("DELETE FROM vaults WHERE id = ?1", [vault_id.get()])
                .map_err(storage)?;
            Ok(Gated::Done(()))
        })?;

        info!(vault_id = %vault_id, "Vault deleted");
        Ok(())
    }

    /// Rename a vault or change its description or metadata.
    ///
    /// # Preconditions
    /// - Caller is a vault admin
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) unless the caller is a vault admin
    /// - Validation failure on blank or duplicate name, or non-object metadata
    pub fn update(&self, ctx: &RequestContext, vault_id: VaultId, changes: VaultUpdate) -> Result<Vault> {
        let actor = ctx.actor()?;
        let name = match changes.name.as_deref().map(str::trim) {
            Some("") => return Err(Error::validation("name", "can't be blank")),
            other => other.map(str::to_string),
        };
        let description = changes
            .description
            .map(|d| d.as_deref().map(str::trim).filter(|d| !d.is_empty()).map(str::to_string));
        if let Some(metadata) = &changes.metadata {
            if !metadata.is_object() {
                return Err(Error::validation("metadata", "must be a JSON object"));
            }
        }

        self.store.write_gated(|tx| {
            let mut vault = get(tx, vault_id)?;
            granted!(authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::ManageMembers,
                AuditTarget::Vault(vault_id),
                "update_vault",
            )?);

            let mut changed = Vec::new();
            if let Some(name) = name {
                if name != vault.name {
                    vault.name = name;
                    changed.push("name");
                }
            }
            if let Some(description) = description {
                if description != vault.description {
                    vault.description = description;
                    changed.push("description");
                }
            }
            if let Some(metadata) = changes.metadata {
                if metadata != vault.metadata {
                    vault.metadata = metadata;
                    changed.push("metadata");
                }
            }
            if changed.is_empty() {
                return Ok(Gated::Done(vault));
            }

            tx.execute(
                "UPDATE vaults SET name = ?1, description = ?2, metadata = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    vault.name,
                    vault.description,
                    vault.metadata.to_string(),
                    to_db_time(&Utc::now()),
                    vault_id.get(),
                ],
            )
            .map_err(constraint("name", "has already been taken"))?;
            let entry = AuditEntry::new(actor, AuditAction::UpdateSecret, AuditTarget::Vault(vault_id))
                .with("fields_changed", changed.clone())
                .with("change", "vault_updated")
                .with_context(ctx);
            audit::record(tx, entry)?;
            debug!(vault_id = %vault_id, fields = changed.len(), "Vault updated");
            get(tx, vault_id).map(Gated::Done)
        })
    }

    /// Credential count and rotation counts as of `now`.
    ///
    /// # Errors
    /// - `Error::AccessDenied` (recorded) unless the caller is a member
    pub fn stats(&self, ctx: &RequestContext, vault_id: VaultId, now: DateTime<Utc>) -> Result<VaultStats> {
        let actor = ctx.actor()?;
        self.store.write_gated(|tx| {
            get(tx, vault_id)?;
            granted!(authorize(
                tx,
                ctx,
                actor,
                vault_id,
                Capability::View,
                AuditTarget::Vault(vault_id),
                "view_vault",
            )?);
            let mut stmt = tx
                .prepare(
                    "SELECT rotation_interval_days, secret_last_rotated_at FROM credentials WHERE vault_id = ?1",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map([vault_id.get()], |row| {
                    let last: Option<String> = row.get(1)?;
                    Ok(RotationPolicy::new(
                        row.get(0)?,
                        last.as_deref().map(from_db_time).transpose()?,
                    ))
                })
                .map_err(storage)?;

            let mut stats = VaultStats::default();
            for policy in rows {
                let policy = policy.map_err(storage)?;
                stats.credential_count += 1;
                match policy.status(now) {
                    RotationStatus::Overdue => stats.overdue_rotation_count += 1,
                    RotationStatus::DueSoon => stats.due_soon_rotation_count += 1,
                    RotationStatus::Ok | RotationStatus::NoPolicy => {}
                }
            }
            Ok(Gated::Done(stats))
        })
    }
}
