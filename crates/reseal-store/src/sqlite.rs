//! Object store backed by SQLite
//!
//! Direct rusqlite behind a mutex. Every write takes the next value of one
//! store-wide counter as the row's version, so a token is never reused, not
//! even by an object deleted and created again under the same name.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reseal_core::{
    BackupRecord, BackupSink, ListScope, ObjectRef, ObjectStore, SealedObject, StoreError,
    VersionToken, Versioned,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::debug;

/// SQLite-backed object store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the object database
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Fatal(format!("Failed to create store dir: {e}")))?;
        }

        let conn = Connection::open(path).map_err(sql_error)?;

        // WAL so readers don't block the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(sql_error)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sealed_objects (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                taken_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backups_object ON backups(namespace, name);
            CREATE TABLE IF NOT EXISTS version_counter (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_version INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO version_counter (id, last_version)
                SELECT 1, COALESCE(MAX(version), 0) FROM sealed_objects;",
        )
        .map_err(sql_error)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or overwrite unconditionally
    pub fn put(&self, object: &SealedObject) -> Result<VersionToken, StoreError> {
        let body = encode(object)?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        let version = next_version(&tx)?;
        tx.execute(
            "INSERT INTO sealed_objects (namespace, name, body, version, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (namespace, name)
             DO UPDATE SET body = excluded.body,
                           version = excluded.version,
                           updated_at = excluded.updated_at",
            params![object.namespace, object.name, body, version, Utc::now().to_rfc3339()],
        )
        .map_err(sql_error)?;
        tx.commit().map_err(sql_error)?;
        debug!(namespace = %object.namespace, name = %object.name, version, "stored object");
        Ok(VersionToken(version.to_string()))
    }

    /// Insert only if no object of that name exists; `Conflict` otherwise
    pub fn create(&self, object: &SealedObject) -> Result<VersionToken, StoreError> {
        let body = encode(object)?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        let version = next_version(&tx)?;
        let inserted = tx
            .execute(
                "INSERT INTO sealed_objects (namespace, name, body, version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (namespace, name) DO NOTHING",
                params![object.namespace, object.name, body, version, Utc::now().to_rfc3339()],
            )
            .map_err(sql_error)?;
        if inserted == 0 {
            return Err(StoreError::Conflict(object.object_ref()));
        }
        tx.commit().map_err(sql_error)?;
        debug!(namespace = %object.namespace, name = %object.name, version, "created object");
        Ok(VersionToken(version.to_string()))
    }

    /// Returns false if the object did not exist
    pub fn delete(&self, object: &ObjectRef) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM sealed_objects WHERE namespace = ?1 AND name = ?2",
                params![object.namespace, object.name],
            )
            .map_err(sql_error)?;
        Ok(deleted > 0)
    }

    /// Saved prior versions of one object, oldest first
    pub fn backups(&self, object: &ObjectRef) -> Result<Vec<BackupRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT body, version, taken_at FROM backups
                 WHERE namespace = ?1 AND name = ?2 ORDER BY id",
            )
            .map_err(sql_error)?;
        let rows = stmt
            .query_map(params![object.namespace, object.name], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(sql_error)?;

        let mut records = Vec::new();
        for row in rows {
            let (body, version, taken_at) = row.map_err(sql_error)?;
            let taken_at = DateTime::parse_from_rfc3339(&taken_at)
                .map_err(|e| StoreError::Fatal(format!("bad backup timestamp: {e}")))?
                .with_timezone(&Utc);
            records.push(BackupRecord {
                object: decode(&body)?,
                version: VersionToken(version.to_string()),
                taken_at,
            });
        }
        Ok(records)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Fatal(format!("store lock poisoned: {e}")))
    }
}

#[async_trait]
impl ObjectStore for SqliteStore {
    async fn list(&self, scope: &ListScope) -> Result<Vec<Versioned>, StoreError> {
        let conn = self.lock()?;
        let (sql, namespace) = match scope {
            ListScope::Namespace(ns) => (
                "SELECT body, version FROM sealed_objects WHERE namespace = ?1 ORDER BY namespace, name",
                Some(ns.as_str()),
            ),
            ListScope::AllNamespaces => (
                "SELECT body, version FROM sealed_objects ORDER BY namespace, name",
                None,
            ),
        };

        let mut stmt = conn.prepare(sql).map_err(sql_error)?;
        let map_row = |row: &rusqlite::Row<'_>| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?));
        let rows = match namespace {
            Some(ns) => stmt.query_map(params![ns], map_row),
            None => stmt.query_map([], map_row),
        }
        .map_err(sql_error)?;

        let mut listed = Vec::new();
        for row in rows {
            let (body, version) = row.map_err(sql_error)?;
            listed.push(Versioned {
                object: decode(&body)?,
                version: VersionToken(version.to_string()),
            });
        }
        Ok(listed)
    }

    async fn get(&self, object: &ObjectRef) -> Result<Option<Versioned>, StoreError> {
        let conn = self.lock()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT body, version FROM sealed_objects WHERE namespace = ?1 AND name = ?2",
                params![object.namespace, object.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql_error)?;

        row.map(|(body, version)| {
            Ok(Versioned {
                object: decode(&body)?,
                version: VersionToken(version.to_string()),
            })
        })
        .transpose()
    }

    async fn update(
        &self,
        object: &SealedObject,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let key = object.object_ref();
        let expected: i64 = expected
            .0
            .parse()
            .map_err(|_| StoreError::Fatal(format!("invalid version token {expected}")))?;
        let body = encode(object)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql_error)?;
        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM sealed_objects WHERE namespace = ?1 AND name = ?2",
                params![object.namespace, object.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        match current {
            None => return Err(StoreError::NotFound(key)),
            Some(current) if current != expected => return Err(StoreError::Conflict(key)),
            Some(_) => {}
        }

        let version = next_version(&tx)?;
        tx.execute(
            "UPDATE sealed_objects SET body = ?1, version = ?2, updated_at = ?3
             WHERE namespace = ?4 AND name = ?5",
            params![body, version, Utc::now().to_rfc3339(), object.namespace, object.name],
        )
        .map_err(sql_error)?;
        tx.commit().map_err(sql_error)?;
        Ok(VersionToken(version.to_string()))
    }
}

#[async_trait]
impl BackupSink for SqliteStore {
    async fn backup(&self, previous: &Versioned) -> Result<(), StoreError> {
        let body = encode(&previous.object)?;
        let version: i64 = previous
            .version
            .0
            .parse()
            .map_err(|_| StoreError::Fatal(format!("invalid version token {}", previous.version)))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO backups (namespace, name, version, body, taken_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                previous.object.namespace,
                previous.object.name,
                version,
                body,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(sql_error)?;
        Ok(())
    }
}

/// Claim the next store-wide version inside the caller's transaction
fn next_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row(
        "UPDATE version_counter SET last_version = last_version + 1 WHERE id = 1
         RETURNING last_version",
        [],
        |row| row.get(0),
    )
    .map_err(sql_error)
}

/// Busy and locked databases clear up on their own; anything else does not
fn sql_error(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StoreError::Unavailable(e.to_string())
        }
        _ => StoreError::Fatal(e.to_string()),
    }
}

fn encode(object: &SealedObject) -> Result<String, StoreError> {
    serde_json::to_string(object).map_err(|e| StoreError::Fatal(format!("encode object: {e}")))
}

fn decode(body: &str) -> Result<SealedObject, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Fatal(format!("corrupt object row: {e}")))
}
