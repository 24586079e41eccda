//! SQLite-backed persistence for vault records.
//!
//! One connection behind a mutex. Every write runs in a single
//! `BEGIN IMMEDIATE` transaction so a sensitive mutation and its audit
//! record commit or roll back together.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use dealvault_common::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NOT NULL UNIQUE,
    full_name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'member',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vaults (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_by_id INTEGER REFERENCES users(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vault_memberships (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vault_id INTEGER NOT NULL REFERENCES vaults(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id),
    role TEXT NOT NULL DEFAULT 'viewer'
        CHECK (role IN ('admin', 'editor', 'revealer', 'viewer')),
    created_by_id INTEGER REFERENCES users(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE (vault_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_vault_memberships_user ON vault_memberships(user_id);

CREATE TABLE IF NOT EXISTS credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vault_id INTEGER NOT NULL REFERENCES vaults(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    credential_type TEXT NOT NULL DEFAULT 'login',
    url TEXT,
    username_ciphertext TEXT,
    username_last4 TEXT,
    email_ciphertext TEXT,
    email_last4 TEXT,
    secret_ciphertext TEXT,
    secret_last4 TEXT,
    notes_ciphertext TEXT,
    secret_last_rotated_at TEXT,
    rotation_interval_days INTEGER CHECK (rotation_interval_days IS NULL OR rotation_interval_days > 0),
    sensitivity TEXT NOT NULL DEFAULT 'confidential',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_by_id INTEGER REFERENCES users(id),
    updated_by_id INTEGER REFERENCES users(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_credentials_vault ON credentials(vault_id);

CREATE TABLE IF NOT EXISTS credential_fields (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    credential_id INTEGER NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
    label TEXT NOT NULL,
    field_type TEXT NOT NULL DEFAULT 'text',
    value_ciphertext TEXT,
    value_last4 TEXT,
    is_secret INTEGER NOT NULL DEFAULT 1,
    sort_order INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_credential_fields_order ON credential_fields(credential_id, sort_order);

CREATE TABLE IF NOT EXISTS credential_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    credential_id INTEGER NOT NULL REFERENCES credentials(id) ON DELETE CASCADE,
    linkable_type TEXT NOT NULL,
    linkable_id INTEGER NOT NULL,
    relationship TEXT NOT NULL DEFAULT 'general',
    created_by_id INTEGER REFERENCES users(id),
    created_at TEXT NOT NULL,
    UNIQUE (credential_id, linkable_type, linkable_id, relationship)
);
CREATE INDEX IF NOT EXISTS idx_credential_links_target ON credential_links(linkable_type, linkable_id);

CREATE TABLE IF NOT EXISTS legal_entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name_legal TEXT NOT NULL,
    name_short TEXT,
    entity_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    ein_ciphertext TEXT,
    ein_last4 TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bank_accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    legal_entity_id INTEGER NOT NULL REFERENCES legal_entities(id) ON DELETE CASCADE,
    bank_name TEXT,
    account_name TEXT,
    account_type TEXT,
    routing_number_ciphertext TEXT,
    routing_last4 TEXT,
    account_number_ciphertext TEXT,
    account_last4 TEXT,
    swift_ciphertext TEXT,
    nickname TEXT,
    is_primary INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_by_id INTEGER REFERENCES users(id),
    updated_by_id INTEGER REFERENCES users(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bank_accounts_entity ON bank_accounts(legal_entity_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_bank_accounts_unique_primary
    ON bank_accounts(legal_entity_id)
    WHERE is_primary = 1 AND status = 'active';

CREATE TABLE IF NOT EXISTS security_audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_user_id INTEGER NOT NULL REFERENCES users(id),
    action TEXT NOT NULL,
    auditable_type TEXT NOT NULL,
    auditable_id INTEGER NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_security_audit_logs_auditable
    ON security_audit_logs(auditable_type, auditable_id);
CREATE INDEX IF NOT EXISTS idx_security_audit_logs_action ON security_audit_logs(action);
CREATE INDEX IF NOT EXISTS idx_security_audit_logs_created ON security_audit_logs(created_at);
CREATE INDEX IF NOT EXISTS idx_security_audit_logs_actor_action_time
    ON security_audit_logs(actor_user_id, action, created_at);

CREATE TRIGGER IF NOT EXISTS security_audit_logs_no_update
BEFORE UPDATE ON security_audit_logs
BEGIN
    SELECT RAISE(ABORT, 'security audit log is append-only');
END;

CREATE TRIGGER IF NOT EXISTS security_audit_logs_no_delete
BEFORE DELETE ON security_audit_logs
BEGIN
    SELECT RAISE(ABORT, 'security audit log is append-only');
END;
"#;

/// Result of a permission-gated unit of work.
///
/// `Denied` still commits the transaction so the `access_denied` record
/// written inside it persists; the caller then receives the error.
pub(crate) enum Gated<T> {
    Done(T),
    Denied(Error),
}

/// Unwrap a granted [`Gated`] or return the denial from the enclosing closure.
macro_rules! granted {
    ($gate:expr) => {
        match $gate {
            $crate::store::Gated::Done(value) => value,
            $crate::store::Gated::Denied(err) => return Ok($crate::store::Gated::Denied(err)),
        }
    };
}
pub(crate) use granted;

/// Handle to the vault database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Create or open a vault database and apply the schema.
    ///
    /// # Errors
    /// - Database creation or schema failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing and tooling).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;
        info!("Vault store opened successfully");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Connection lock poisoned".to_string()))
    }

    /// Run read-only work against the connection.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run work in one immediate transaction; commit on `Ok`, roll back on `Err`.
    pub fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage)?;
        let value = f(&tx)?;
        tx.commit().map_err(storage)?;
        Ok(value)
    }

    /// Like [`Store::write`], for work that can end in a recorded denial.
    pub(crate) fn write_gated<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<Gated<T>>,
    ) -> Result<T> {
        match self.write(f)? {
            Gated::Done(value) => Ok(value),
            Gated::Denied(err) => {
                debug!(error = %err, "Committed denial record");
                Err(err)
            }
        }
    }
}

/// Map a driver error to a storage error.
pub(crate) fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

/// Map a driver error, turning constraint violations into field-level validation failures.
pub(crate) fn constraint<'a>(
    field: &'a str,
    message: &'a str,
) -> impl FnOnce(rusqlite::Error) -> Error + 'a {
    move |e| {
        if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
            Error::validation(field, message)
        } else {
            storage(e)
        }
    }
}

/// Map a missing-row error to `NotFound`.
pub(crate) fn not_found(what: &str, id: i64) -> impl FnOnce(rusqlite::Error) -> Error + '_ {
    move |e| match e {
        rusqlite::Error::QueryReturnedNoRows => Error::NotFound(format!("{} {}", what, id)),
        other => storage(other),
    }
}

/// Format a timestamp for storage. Fixed width, so text order is time order.
pub(crate) fn to_db_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub(crate) fn from_db_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

/// Parse an optional stored timestamp.
pub(crate) fn from_db_time_opt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(from_db_time).transpose()
}

/// Parse a stored JSON object column.
pub(crate) fn from_db_json(raw: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Parse a stored enum tag.
pub(crate) fn from_db_tag<T>(raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn seed_user(store: &Store) -> i64 {
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO users (email, full_name, role, created_at) VALUES (?1, ?2, 'admin', ?3)",
                    params!["ops@example.com", "Ops User", to_db_time(&Utc::now())],
                )
                .map_err(storage)?;
                Ok(tx.last_insert_rowid())
            })
            .unwrap()
    }

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");

        drop(Store::open(&path).unwrap());
        let store = Store::open(&path).unwrap();
        let count: i64 = store
            .read(|c| {
                c.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(storage)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_write_rolls_back_on_error() {
        let store = Store::in_memory().unwrap();
        let result: Result<()> = store.write(|tx| {
            tx.execute(
                "INSERT INTO users (email, full_name, created_at) VALUES ('a@example.com', 'A', ?1)",
                params![to_db_time(&Utc::now())],
            )
            .map_err(storage)?;
            Err(Error::Audit("simulated".into()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .read(|c| {
                c.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(storage)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_gated_denial_commits() {
        let store = Store::in_memory().unwrap();
        let result: Result<()> = store.write_gated(|tx| {
            tx.execute(
                "INSERT INTO users (email, full_name, created_at) VALUES ('d@example.com', 'D', ?1)",
                params![to_db_time(&Utc::now())],
            )
            .map_err(storage)?;
            Ok(Gated::Denied(Error::AccessDenied("nope".into())))
        });
        assert!(result.unwrap_err().is_access_denied());

        let count: i64 = store
            .read(|c| {
                c.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
                    .map_err(storage)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_audit_table_is_append_only() {
        let store = Store::in_memory().unwrap();
        let user = seed_user(&store);
        store
            .write(|tx| {
                tx.execute(
                    "INSERT INTO security_audit_logs (actor_user_id, action, auditable_type, auditable_id, created_at)
                     VALUES (?1, 'reveal_secret', 'credential', 1, ?2)",
                    params![user, to_db_time(&Utc::now())],
                )
                .map_err(storage)?;
                Ok(())
            })
            .unwrap();

        let update = store.write(|tx| {
            tx.execute("UPDATE security_audit_logs SET action = 'copy_secret'", [])
                .map_err(storage)
        });
        assert!(update.is_err());

        let delete = store.write(|tx| {
            tx.execute("DELETE FROM security_audit_logs", []).map_err(storage)
        });
        assert!(delete.is_err());
    }

    #[test]
    fn test_time_roundtrip_preserves_order() {
        let earlier = Utc::now();
        let later = earlier + chrono::Duration::milliseconds(5);
        let a = to_db_time(&earlier);
        let b = to_db_time(&later);

        assert!(a < b);
        assert_eq!(from_db_time(&a).unwrap().timestamp_micros(), earlier.timestamp_micros());
    }
}
