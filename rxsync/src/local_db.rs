//! Local SQLite store for offline-first operation
//!
//! Provides:
//! - Key-value storage for sync metadata and preferences
//! - Document lists mirroring each remote collection
//! - The persisted pending-operation queue
//! - The disk tier of the cache
//! - A conflict log

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

/// Configuration for the local database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDbConfig {
    /// Path to the database file, or `:memory:`
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Whether to enable secure deletion (overwrites freed pages)
    pub enable_secure_delete: bool,
}

impl Default for LocalDbConfig {
    fn default() -> Self {
        Self {
            db_path: "rxsync_local.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            enable_secure_delete: true,
        }
    }
}

/// Operation type in the pending queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            _ => Err(SyncError::InvalidOperation(format!("Unknown operation type: {}", s))),
        }
    }
}

/// A write that could not reach the remote store yet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique operation ID
    pub id: Uuid,

    /// Enqueue order, strictly increasing
    pub seq: i64,

    /// Collection the record belongs to (e.g. "prescriptions")
    pub collection: String,

    /// Record ID
    pub record_id: Uuid,

    /// Operation type
    pub operation: OperationType,

    /// Record payload as stored remotely (sensitive fields encrypted)
    pub data: Value,

    /// Timestamp when operation was queued
    pub created_at: DateTime<Utc>,

    /// Number of failed replay attempts
    pub retry_count: u32,

    /// Last error message (if any)
    pub last_error: Option<String>,
}

/// Entry in the conflict log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictLogEntry {
    pub id: Uuid,
    pub collection: String,
    pub record_id: Uuid,
    pub local_version: Value,
    pub remote_version: Value,
    pub strategy: String,
    pub resolved_version: u64,
    pub created_at: DateTime<Utc>,
}

/// Local database handle
#[derive(Clone)]
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open (or create) the local database
    pub async fn new(config: LocalDbConfig) -> SyncResult<Self> {
        let in_memory = config.db_path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}", config.db_path)
        };

        let mut options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .pragma("secure_delete", if config.enable_secure_delete { "ON" } else { "OFF" });

        if config.enable_wal && !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to ":memory:" is its own database, keep exactly one alive
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect_with(options)
                .await?
        };

        let db = Self { pool };
        db.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local database");

        Ok(db)
    }

    /// Private in-memory database
    pub async fn in_memory() -> SyncResult<Self> {
        Self::new(LocalDbConfig {
            db_path: ":memory:".to_string(),
            max_connections: 1,
            enable_wal: false,
            enable_secure_delete: true,
        })
        .await
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_operations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pending_record
             ON pending_operations(collection, record_id)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflict_log (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                local_version TEXT NOT NULL,
                remote_version TEXT NOT NULL,
                strategy TEXT NOT NULL,
                resolved_version INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conflict_record ON conflict_log(collection, record_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Key-value storage
    // ------------------------------------------------------------------

    pub async fn put_value(&self, key: &str, value: &Value) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> SyncResult<Option<Value>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> SyncResult<Value> {
            let raw: String = row.try_get("value")?;
            Ok(serde_json::from_str(&raw)?)
        })
        .transpose()
    }

    pub async fn remove_value(&self, key: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Document lists
    // ------------------------------------------------------------------

    pub async fn upsert_document(
        &self,
        collection: &str,
        id: Uuid,
        data: &Value,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(collection, id) DO UPDATE
            SET data = excluded.data, updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(id.to_string())
        .bind(data.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_document(&self, collection: &str, id: Uuid) -> SyncResult<Option<Value>> {
        let row = sqlx::query("SELECT data FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> SyncResult<Value> {
            let raw: String = row.try_get("data")?;
            Ok(serde_json::from_str(&raw)?)
        })
        .transpose()
    }

    /// Returns whether a document was removed
    pub async fn delete_document(&self, collection: &str, id: Uuid) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_documents(&self, collection: &str) -> SyncResult<Vec<Value>> {
        let rows = sqlx::query("SELECT data FROM documents WHERE collection = ? ORDER BY id ASC")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> SyncResult<Value> {
                let raw: String = row.try_get("data")?;
                Ok(serde_json::from_str(&raw)?)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Pending operation queue
    // ------------------------------------------------------------------

    /// Queue an operation for replay.
    ///
    /// A create/update for a record that already has a queued create/update
    /// replaces that entry's payload in place. A delete drops every earlier
    /// queued entry for the record before being queued itself.
    pub async fn enqueue_operation(
        &self,
        collection: &str,
        record_id: Uuid,
        operation: OperationType,
        data: &Value,
    ) -> SyncResult<PendingOperation> {
        let mut tx = self.pool.begin().await?;

        match operation {
            OperationType::Create | OperationType::Update => {
                let existing = sqlx::query(
                    r#"
                    SELECT id FROM pending_operations
                    WHERE collection = ? AND record_id = ?
                      AND operation IN ('create', 'update')
                    ORDER BY seq DESC
                    LIMIT 1
                    "#,
                )
                .bind(collection)
                .bind(record_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;

                if let Some(row) = existing {
                    let existing_id: String = row.try_get("id")?;
                    sqlx::query(
                        "UPDATE pending_operations
                         SET data = ?, retry_count = 0, last_error = NULL
                         WHERE id = ?",
                    )
                    .bind(data.to_string())
                    .bind(&existing_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;

                    tracing::debug!(
                        operation_id = %existing_id,
                        collection = collection,
                        record_id = %record_id,
                        "Coalesced pending operation"
                    );

                    let id = parse_uuid(&existing_id)?;
                    return self
                        .pending_operation(id)
                        .await?
                        .ok_or_else(|| SyncError::NotFound(format!("pending operation {}", id)));
                }
            }
            OperationType::Delete => {
                sqlx::query(
                    "DELETE FROM pending_operations WHERE collection = ? AND record_id = ?",
                )
                .bind(collection)
                .bind(record_id.to_string())
                .execute(&mut *tx)
                .await?;
            }
        }

        let operation_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO pending_operations (
                id, collection, record_id, operation, data, created_at, retry_count
            ) VALUES (?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(operation_id.to_string())
        .bind(collection)
        .bind(record_id.to_string())
        .bind(operation.as_str())
        .bind(data.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(
            operation_id = %operation_id,
            collection = collection,
            record_id = %record_id,
            operation = ?operation,
            "Queued operation for sync"
        );

        self.pending_operation(operation_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("pending operation {}", operation_id)))
    }

    pub async fn pending_operation(&self, id: Uuid) -> SyncResult<Option<PendingOperation>> {
        let row = sqlx::query(
            r#"
            SELECT seq, id, collection, record_id, operation, data, created_at,
                   retry_count, last_error
            FROM pending_operations
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(pending_from_row).transpose()
    }

    /// Queued operations in enqueue order, optionally limited to one collection
    pub async fn pending_operations(
        &self,
        collection: Option<&str>,
    ) -> SyncResult<Vec<PendingOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT seq, id, collection, record_id, operation, data, created_at,
                   retry_count, last_error
            FROM pending_operations
            WHERE ?1 IS NULL OR collection = ?1
            ORDER BY seq ASC
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pending_from_row).collect()
    }

    pub async fn pending_count(&self, collection: Option<&str>) -> SyncResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM pending_operations WHERE ?1 IS NULL OR collection = ?1",
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;

        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    /// Remove a replayed operation from the queue
    pub async fn mark_synced(&self, operation_id: Uuid) -> SyncResult<()> {
        sqlx::query("DELETE FROM pending_operations WHERE id = ?")
            .bind(operation_id.to_string())
            .execute(&self.pool)
            .await?;

        tracing::debug!(operation_id = %operation_id, "Operation synced and dequeued");

        Ok(())
    }

    /// Mark operation as failed and increment retry count
    pub async fn mark_failed(&self, operation_id: Uuid, error: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_operations
            SET retry_count = retry_count + 1,
                last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(error)
        .bind(operation_id.to_string())
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            operation_id = %operation_id,
            error = error,
            "Operation sync failed"
        );

        Ok(())
    }

    // ------------------------------------------------------------------
    // Cache disk tier (timestamps in unix milliseconds)
    // ------------------------------------------------------------------

    /// Returns the value and its expiry
    pub async fn cache_get(&self, key: &str) -> SyncResult<Option<(Value, i64)>> {
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> SyncResult<(Value, i64)> {
            let raw: String = row.try_get("value")?;
            let expires_at: i64 = row.try_get("expires_at")?;
            Ok((serde_json::from_str(&raw)?, expires_at))
        })
        .transpose()
    }

    pub async fn cache_put(
        &self,
        key: &str,
        value: &Value,
        expires_at: i64,
        now: i64,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, expires_at, last_accessed) VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                last_accessed = excluded.last_accessed
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cache_touch(&self, key: &str, now: i64) -> SyncResult<()> {
        sqlx::query("UPDATE cache_entries SET last_accessed = ? WHERE key = ?")
            .bind(now)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cache_remove(&self, key: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cache_remove_prefix(&self, prefix: &str) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1")
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn cache_purge_expired(&self, now: i64) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Evict least recently accessed rows until at most `max_entries` remain
    pub async fn cache_evict_to(&self, max_entries: u64) -> SyncResult<u64> {
        let len = self.cache_len().await?;
        if len <= max_entries {
            return Ok(0);
        }

        let excess = i64::try_from(len - max_entries).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entries WHERE key IN (
                SELECT key FROM cache_entries
                ORDER BY last_accessed ASC
                LIMIT ?
            )
            "#,
        )
        .bind(excess)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn cache_len(&self) -> SyncResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    pub async fn cache_clear(&self) -> SyncResult<()> {
        sqlx::query("DELETE FROM cache_entries").execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conflict log
    // ------------------------------------------------------------------

    pub async fn log_conflict(&self, entry: &ConflictLogEntry) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                id, collection, record_id, local_version, remote_version,
                strategy, resolved_version, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.collection)
        .bind(entry.record_id.to_string())
        .bind(entry.local_version.to_string())
        .bind(entry.remote_version.to_string())
        .bind(&entry.strategy)
        .bind(i64::try_from(entry.resolved_version).unwrap_or(i64::MAX))
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent conflicts first
    pub async fn conflicts(&self, limit: i64) -> SyncResult<Vec<ConflictLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, collection, record_id, local_version, remote_version,
                   strategy, resolved_version, created_at
            FROM conflict_log
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> SyncResult<ConflictLogEntry> {
                let id: String = row.try_get("id")?;
                let record_id: String = row.try_get("record_id")?;
                let local_version: String = row.try_get("local_version")?;
                let remote_version: String = row.try_get("remote_version")?;
                let resolved_version: i64 = row.try_get("resolved_version")?;
                let created_at: String = row.try_get("created_at")?;

                Ok(ConflictLogEntry {
                    id: parse_uuid(&id)?,
                    collection: row.try_get("collection")?,
                    record_id: parse_uuid(&record_id)?,
                    local_version: serde_json::from_str(&local_version)?,
                    remote_version: serde_json::from_str(&remote_version)?,
                    strategy: row.try_get("strategy")?,
                    resolved_version: u64::try_from(resolved_version).unwrap_or(0),
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn pending_from_row(row: &SqliteRow) -> SyncResult<PendingOperation> {
    let id: String = row.try_get("id")?;
    let record_id: String = row.try_get("record_id")?;
    let operation: String = row.try_get("operation")?;
    let data: String = row.try_get("data")?;
    let created_at: String = row.try_get("created_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;

    Ok(PendingOperation {
        id: parse_uuid(&id)?,
        seq: row.try_get("seq")?,
        collection: row.try_get("collection")?,
        record_id: parse_uuid(&record_id)?,
        operation: OperationType::parse(&operation)?,
        data: serde_json::from_str(&data)?,
        created_at: parse_timestamp(&created_at)?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
    })
}

fn parse_uuid(raw: &str) -> SyncResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| SyncError::Internal(format!("Invalid UUID: {}", e)))
}

fn parse_timestamp(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn create_test_db() -> LocalDatabase {
        LocalDatabase::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn test_file_database_creation() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("local.db").to_str().unwrap().to_string();

        let db = LocalDatabase::new(LocalDbConfig {
            db_path,
            ..Default::default()
        })
        .await
        .unwrap();

        let row = sqlx::query("PRAGMA secure_delete").fetch_one(db.pool()).await.unwrap();
        let secure_delete: i64 = row.try_get(0).unwrap();
        assert_eq!(secure_delete, 1, "secure_delete should be enabled");
    }

    #[tokio::test]
    async fn test_key_value_roundtrip() {
        let db = create_test_db().await;

        assert!(db.get_value("last_sync").await.unwrap().is_none());
        db.put_value("last_sync", &json!("2026-10-01T00:00:00Z")).await.unwrap();
        db.put_value("last_sync", &json!("2026-10-02T00:00:00Z")).await.unwrap();
        assert_eq!(db.get_value("last_sync").await.unwrap(), Some(json!("2026-10-02T00:00:00Z")));

        db.remove_value("last_sync").await.unwrap();
        assert!(db.get_value("last_sync").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_document_lists_are_per_collection() {
        let db = create_test_db().await;
        let id = Uuid::new_v4();

        db.upsert_document("prescriptions", id, &json!({"v": 1})).await.unwrap();
        db.upsert_document("prescriptions", id, &json!({"v": 2})).await.unwrap();
        db.upsert_document("medications", Uuid::new_v4(), &json!({"v": 9})).await.unwrap();

        let prescriptions = db.list_documents("prescriptions").await.unwrap();
        assert_eq!(prescriptions, vec![json!({"v": 2})]);
        assert_eq!(db.list_documents("medications").await.unwrap().len(), 1);

        assert!(db.delete_document("prescriptions", id).await.unwrap());
        assert!(!db.delete_document("prescriptions", id).await.unwrap());
        assert!(db.get_document("prescriptions", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_preserves_enqueue_order() {
        let db = create_test_db().await;

        let first = db
            .enqueue_operation(
                "prescriptions",
                Uuid::new_v4(),
                OperationType::Create,
                &json!({"n": 1}),
            )
            .await
            .unwrap();
        let second = db
            .enqueue_operation(
                "medications",
                Uuid::new_v4(),
                OperationType::Create,
                &json!({"n": 2}),
            )
            .await
            .unwrap();
        let third = db
            .enqueue_operation(
                "prescriptions",
                Uuid::new_v4(),
                OperationType::Delete,
                &json!({"n": 3}),
            )
            .await
            .unwrap();

        let all: Vec<Uuid> =
            db.pending_operations(None).await.unwrap().iter().map(|op| op.id).collect();
        assert_eq!(all, vec![first.id, second.id, third.id]);

        let prescriptions = db.pending_operations(Some("prescriptions")).await.unwrap();
        assert_eq!(prescriptions.len(), 2);
        assert_eq!(db.pending_count(Some("medications")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_coalesces_into_pending_create() {
        let db = create_test_db().await;
        let record_id = Uuid::new_v4();

        let create = db
            .enqueue_operation(
                "prescriptions",
                record_id,
                OperationType::Create,
                &json!({"name": "a"}),
            )
            .await
            .unwrap();
        let update = db
            .enqueue_operation(
                "prescriptions",
                record_id,
                OperationType::Update,
                &json!({"name": "b"}),
            )
            .await
            .unwrap();

        assert_eq!(create.id, update.id);
        assert_eq!(update.operation, OperationType::Create);
        assert_eq!(update.data, json!({"name": "b"}));
        assert_eq!(db.pending_count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_supersedes_pending_writes() {
        let db = create_test_db().await;
        let record_id = Uuid::new_v4();

        db.enqueue_operation("prescriptions", record_id, OperationType::Update, &json!({}))
            .await
            .unwrap();
        db.enqueue_operation("prescriptions", record_id, OperationType::Delete, &json!({}))
            .await
            .unwrap();

        let pending = db.pending_operations(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OperationType::Delete);
    }

    #[tokio::test]
    async fn test_mark_synced_and_failed() {
        let db = create_test_db().await;

        let op = db
            .enqueue_operation("prescriptions", Uuid::new_v4(), OperationType::Update, &json!({}))
            .await
            .unwrap();

        db.mark_failed(op.id, "Network error").await.unwrap();
        let pending = db.pending_operations(None).await.unwrap();
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("Network error"));

        db.mark_synced(op.id).await.unwrap();
        assert_eq!(db.pending_count(None).await.unwrap(), 0);

        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_operations")
            .fetch_one(db.pool())
            .await
            .unwrap();
        let rows: i64 = row.try_get("n").unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_cache_rows_prefix_and_eviction() {
        let db = create_test_db().await;

        db.cache_put("prescriptions:a", &json!(1), 1_000, 10).await.unwrap();
        db.cache_put("prescriptions:b", &json!(2), 1_000, 20).await.unwrap();
        db.cache_put("medications:a", &json!(3), 1_000, 30).await.unwrap();

        assert_eq!(db.cache_remove_prefix("prescriptions:").await.unwrap(), 2);
        assert_eq!(db.cache_len().await.unwrap(), 1);

        db.cache_put("x", &json!(4), 1_000, 40).await.unwrap();
        db.cache_put("y", &json!(5), 1_000, 50).await.unwrap();
        db.cache_touch("medications:a", 60).await.unwrap();
        assert_eq!(db.cache_evict_to(2).await.unwrap(), 1);
        assert!(db.cache_get("x").await.unwrap().is_none());
        assert!(db.cache_get("medications:a").await.unwrap().is_some());

        assert_eq!(db.cache_purge_expired(1_000).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_conflict_log_roundtrip() {
        let db = create_test_db().await;
        let entry = ConflictLogEntry {
            id: Uuid::new_v4(),
            collection: "prescriptions".to_string(),
            record_id: Uuid::new_v4(),
            local_version: json!({"version": 2}),
            remote_version: json!({"version": 3}),
            strategy: "newer_wins".to_string(),
            resolved_version: 4,
            created_at: Utc::now(),
        };

        db.log_conflict(&entry).await.unwrap();
        let logged = db.conflicts(10).await.unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].resolved_version, 4);
        assert_eq!(logged[0].remote_version, json!({"version": 3}));
    }
}
