//! Users, as far as the vault needs them: identity for audit records and
//! the organisation role for non-vault permissions.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::access::UserRole;
use crate::audit::{self, AuditTarget};
use crate::context::RequestContext;
use crate::store::{
    constraint, from_db_tag, from_db_time, not_found, storage, to_db_time, Gated, Store,
};
use dealvault_common::{Error, Result, UserId};

/// A user record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

const COLUMNS: &str = "id, email, full_name, role, created_at";

fn from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: UserId::new(row.get(0)?),
        email: row.get(1)?,
        full_name: row.get(2)?,
        role: from_db_tag(&row.get::<_, String>(3)?)?,
        created_at: from_db_time(&row.get::<_, String>(4)?)?,
    })
}

pub(crate) fn get(conn: &Connection, id: UserId) -> Result<User> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?1", COLUMNS),
        [id.get()],
        from_row,
    )
    .map_err(not_found("user", id.get()))
}

/// Check an organisation-level permission, recording a denial.
///
/// Used for records that live outside vaults.
pub(crate) fn authorize(
    conn: &Connection,
    ctx: &RequestContext,
    actor: UserId,
    allowed: fn(&UserRole) -> bool,
    target: AuditTarget,
    attempted: &str,
) -> Result<Gated<User>> {
    let user = get(conn, actor)?;
    if allowed(&user.role) {
        return Ok(Gated::Done(user));
    }
    let mut extra = serde_json::Map::new();
    extra.insert("user_role".into(), user.role.as_str().into());
    audit::deny(conn, ctx, actor, target, attempted, extra)
}

/// Users directory.
pub struct UserDirectory {
    store: Arc<Store>,
}

impl UserDirectory {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Register a user.
    ///
    /// # Errors
    /// - Validation failure on blank name/email or duplicate email
    pub fn create(&self, email: &str, full_name: &str, role: UserRole) -> Result<User> {
        let email = email.trim();
        let full_name = full_name.trim();
        if email.is_empty() {
            return Err(Error::validation("email", "can't be blank"));
        }
        if full_name.is_empty() {
            return Err(Error::validation("full_name", "can't be blank"));
        }

        let user = self.store.write(|tx| {
            tx.execute(
                "INSERT INTO users (email, full_name, role, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![email, full_name, role.as_str(), to_db_time(&Utc::now())],
            )
            .map_err(constraint("email", "has already been taken"))?;
            get(tx, UserId::new(tx.last_insert_rowid()))
        })?;

        info!(user_id = %user.id, role = %user.role, "User created");
        Ok(user)
    }

    pub fn get(&self, id: UserId) -> Result<User> {
        self.store.read(|conn| get(conn, id))
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        self.store.read(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", COLUMNS),
                [email.trim()],
                from_row,
            )
            .optional()
            .map_err(storage)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_lookup() {
        let users = UserDirectory::new(Arc::new(Store::in_memory().unwrap()));
        let user = users.create("ana@example.com", "Ana Ops", UserRole::Ops).unwrap();

        assert_eq!(users.get(user.id).unwrap(), user);
        assert_eq!(
            users.find_by_email("ana@example.com").unwrap().unwrap().id,
            user.id
        );
        assert!(users.find_by_email("nobody@example.com").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let users = UserDirectory::new(Arc::new(Store::in_memory().unwrap()));
        users.create("dup@example.com", "First", UserRole::Member).unwrap();
        let err = users
            .create("dup@example.com", "Second", UserRole::Member)
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_missing_user_not_found() {
        let users = UserDirectory::new(Arc::new(Store::in_memory().unwrap()));
        assert!(matches!(users.get(UserId::new(99)), Err(Error::NotFound(_))));
    }
}
