// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL provider (MySQL or SQLite through the sqlx `Any` driver).
//!
//! Poll-only. Ordering is done server-side with `ORDER BY`, and
//! set-membership queries are split into `IN (...)` lists of at most
//! `max_batch_size` ids.
//!
//! ```sql
//! CREATE TABLE sync_records (
//!   kind        VARCHAR(32)  NOT NULL,
//!   id          VARCHAR(64)  NOT NULL,
//!   owner_id    VARCHAR(255) NOT NULL,  -- author
//!   scope_owner VARCHAR(255) NOT NULL,  -- recipient / parent for addressed kinds
//!   visibility  VARCHAR(16),
//!   timestamp   BIGINT       NOT NULL,
//!   status      VARCHAR(32),
//!   record      LONGTEXT     NOT NULL,  -- full record as JSON
//!   PRIMARY KEY (kind, id)
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL `LONGTEXT` comes back as bytes through `Any`, so text columns are
//! read as `String` first and `Vec<u8>` second.
//!
//! The pool is created with `connect_lazy`: constructing the store does no
//! I/O, and the schema is created on first use.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::traits::{query_in_batches, RecordStore, StoreError};
use crate::provider::{LatencyClass, ProviderDescriptor, ProviderId};
use crate::record::{Record, RecordKind, Visibility, VisibilityFilter};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Classify a sqlx error for the fallback policy.
pub(crate) fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(e.to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Malformed(e.to_string())
        }
        _ => StoreError::Backend(e.to_string()),
    }
}

/// Read a text column that may arrive as `String` (SQLite) or bytes (MySQL).
pub(crate) fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

/// Decode the `record` JSON column.
pub(crate) fn decode_record(row: &AnyRow) -> Result<Record, StoreError> {
    let json = text_column(row, "record").ok_or_else(|| StoreError::Malformed("record column missing".into()))?;
    serde_json::from_str(&json).map_err(|e| StoreError::Malformed(format!("invalid record JSON: {}", e)))
}

/// `visibility IS NULL OR visibility IN (?, ...)` for a filter, plus its bind values.
pub(crate) fn visibility_clause(filter: &VisibilityFilter) -> (String, Vec<&'static str>) {
    let allowed: Vec<&'static str> = filter.allowed().iter().map(Visibility::as_str).collect();
    if allowed.is_empty() {
        return ("visibility IS NULL".to_string(), allowed);
    }
    let placeholders = vec!["?"; allowed.len()].join(", ");
    (format!("(visibility IS NULL OR visibility IN ({}))", placeholders), allowed)
}

#[derive(Debug, Clone)]
pub struct SqlStoreOptions {
    /// Largest `IN (...)` list sent in one query
    pub max_batch_size: usize,
    pub max_payload_bytes: usize,
    pub max_connections: u32,
}

impl Default for SqlStoreOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_payload_bytes: 1024 * 1024,
            max_connections: 10,
        }
    }
}

pub struct SqlRecordStore {
    pool: AnyPool,
    is_sqlite: bool,
    descriptor: ProviderDescriptor,
    max_payload_bytes: usize,
    schema: OnceCell<()>,
}

impl SqlRecordStore {
    /// Create a store over a lazily connected pool. Fails only on a
    /// malformed connection string.
    pub fn connect_lazy(connection_string: &str, options: SqlStoreOptions) -> Result<Self, StoreError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");
        let pool = AnyPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy(connection_string)
            .map_err(|e| StoreError::Backend(format!("invalid SQL connection string: {}", e)))?;

        Ok(Self {
            pool,
            is_sqlite,
            descriptor: ProviderDescriptor {
                id: ProviderId::SQL,
                native_push: false,
                set_membership_query: true,
                max_batch_size: Some(options.max_batch_size.max(1)),
                latency: LatencyClass::Low,
            },
            max_payload_bytes: options.max_payload_bytes,
            schema: OnceCell::new(),
        })
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn ready(&self) -> Result<&AnyPool, StoreError> {
        self.schema.get_or_try_init(|| self.init_schema()).await?;
        Ok(&self.pool)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                "PRAGMA journal_mode = WAL",
                "PRAGMA synchronous = NORMAL",
                r#"
                CREATE TABLE IF NOT EXISTS sync_records (
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    owner_id TEXT NOT NULL,
                    scope_owner TEXT NOT NULL,
                    visibility TEXT,
                    timestamp INTEGER NOT NULL,
                    status TEXT,
                    record TEXT NOT NULL,
                    PRIMARY KEY (kind, id)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_sync_records_scope ON sync_records (kind, scope_owner, timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_sync_records_owner ON sync_records (kind, owner_id, timestamp)",
                "CREATE INDEX IF NOT EXISTS idx_sync_records_visibility ON sync_records (kind, visibility, timestamp)",
            ]
        } else {
            &[r#"
                CREATE TABLE IF NOT EXISTS sync_records (
                    kind VARCHAR(32) NOT NULL,
                    id VARCHAR(64) NOT NULL,
                    owner_id VARCHAR(255) NOT NULL,
                    scope_owner VARCHAR(255) NOT NULL,
                    visibility VARCHAR(16),
                    timestamp BIGINT NOT NULL,
                    status VARCHAR(32),
                    record LONGTEXT NOT NULL,
                    PRIMARY KEY (kind, id),
                    INDEX idx_scope (kind, scope_owner, timestamp),
                    INDEX idx_owner (kind, owner_id, timestamp),
                    INDEX idx_visibility (kind, visibility, timestamp)
                )
                "#]
        };

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx_error)?;
        }
        info!(sqlite = self.is_sqlite, "SQL record schema ready");
        Ok(())
    }

    async fn fetch_owner_batch(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError> {
        let pool = self.ready().await?;
        let (vis_sql, vis_binds) = visibility_clause(filter);
        let placeholders = vec!["?"; owner_ids.len()].join(", ");
        let sql = format!(
            "SELECT record FROM sync_records WHERE kind = ? AND owner_id IN ({}) AND {} ORDER BY timestamp DESC, id ASC",
            placeholders, vis_sql
        );

        let mut query = sqlx::query(&sql).bind(kind.as_str());
        for id in owner_ids {
            query = query.bind(id.as_str());
        }
        for v in vis_binds {
            query = query.bind(v);
        }

        let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;
        rows.iter().map(decode_record).collect()
    }
}

#[async_trait]
impl RecordStore for SqlRecordStore {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn create(&self, record: &Record) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut stored = record.clone();
        stored.id = id.clone();

        let json = serde_json::to_string(&stored).map_err(|e| StoreError::Rejected(e.to_string()))?;
        if json.len() > self.max_payload_bytes {
            return Err(StoreError::Rejected(format!(
                "record is {} bytes (max {})",
                json.len(),
                self.max_payload_bytes
            )));
        }

        let pool = self.ready().await?;
        sqlx::query(
            "INSERT INTO sync_records (kind, id, owner_id, scope_owner, visibility, timestamp, status, record) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(stored.kind.as_str())
        .bind(&id)
        .bind(&stored.owner_id)
        .bind(stored.scope_owner())
        .bind(stored.visibility.map(|v| v.as_str()))
        .bind(stored.timestamp)
        .bind(&stored.status)
        .bind(&json)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!(kind = %stored.kind, id = %id, "Record inserted");
        Ok(id)
    }

    async fn query_by_owner(&self, kind: RecordKind, owner_id: &str) -> Result<Vec<Record>, StoreError> {
        let pool = self.ready().await?;
        let rows = sqlx::query(
            "SELECT record FROM sync_records WHERE kind = ? AND scope_owner = ? ORDER BY timestamp DESC, id ASC",
        )
        .bind(kind.as_str())
        .bind(owner_id)
        .fetch_all(pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(decode_record).collect()
    }

    async fn query_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError> {
        query_in_batches(owner_ids, self.descriptor.max_batch_size, |batch| async move {
            self.fetch_owner_batch(kind, &batch, filter).await
        })
        .await
    }

    async fn query_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError> {
        let pool = self.ready().await?;
        let rows = sqlx::query(
            "SELECT record FROM sync_records WHERE kind = ? AND visibility = ? ORDER BY timestamp DESC, id ASC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(Visibility::Public.as_str())
        .bind(limit as i64)
        .fetch_all(pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(decode_record).collect()
    }

    async fn update_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Record, StoreError> {
        let pool = self.ready().await?;
        let row = sqlx::query("SELECT record FROM sync_records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;

        let mut record = decode_record(&row)?;
        record.status = Some(status.to_string());
        let json = serde_json::to_string(&record).map_err(|e| StoreError::Malformed(e.to_string()))?;

        sqlx::query("UPDATE sync_records SET status = ?, record = ? WHERE kind = ? AND id = ?")
            .bind(status)
            .bind(&json)
            .bind(kind.as_str())
            .bind(id)
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(record)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<Record, StoreError> {
        let pool = self.ready().await?;
        let row = sqlx::query("SELECT record FROM sync_records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        let record = decode_record(&row)?;

        let result = sqlx::query("DELETE FROM sync_records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
        // Removed by someone else in between
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            });
        }

        debug!(kind = %kind, id = %id, "Record deleted");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir, batch: usize) -> SqlRecordStore {
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("records.db").display());
        SqlRecordStore::connect_lazy(
            &url,
            SqlStoreOptions {
                max_batch_size: batch,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn entry(owner: &str, visibility: Visibility, ts: i64) -> Record {
        let mut r = Record::new(RecordKind::LogEntry, owner, json!({"lat": 25.0, "lng": 121.5})).with_visibility(visibility);
        r.timestamp = ts;
        r
    }

    #[tokio::test]
    async fn test_create_and_query_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);

        let first = store.create(&entry("a@x", Visibility::Public, 100)).await.unwrap();
        let second = store.create(&entry("a@x", Visibility::Private, 200)).await.unwrap();
        store.create(&entry("b@x", Visibility::Public, 300)).await.unwrap();

        let owned = store.query_by_owner(RecordKind::LogEntry, "a@x").await.unwrap();
        let ids: Vec<&str> = owned.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec![second.as_str(), first.as_str()]);
    }

    #[tokio::test]
    async fn test_addressed_kinds_listed_under_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);

        let request = Record::new(RecordKind::RelationshipRequest, "a@x", json!({}))
            .with_target("b@x")
            .with_status("pending");
        store.create(&request).await.unwrap();

        assert_eq!(store.query_by_owner(RecordKind::RelationshipRequest, "b@x").await.unwrap().len(), 1);
        assert!(store.query_by_owner(RecordKind::RelationshipRequest, "a@x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_owner_set_batches_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 2);

        let owners: Vec<String> = (0..5).map(|i| format!("user{}@x", i)).collect();
        for (i, owner) in owners.iter().enumerate() {
            store.create(&entry(owner, Visibility::Relations, i as i64)).await.unwrap();
            store.create(&entry(owner, Visibility::Private, 100 + i as i64)).await.unwrap();
        }

        let result = store
            .query_by_owner_set(RecordKind::LogEntry, &owners, &VisibilityFilter::relations())
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        let ts: Vec<i64> = result.iter().map(|r| r.timestamp).collect();
        assert_eq!(ts, vec![4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_public_feed_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);
        for ts in 0..6 {
            store.create(&entry("a@x", Visibility::Public, ts)).await.unwrap();
        }
        store.create(&entry("a@x", Visibility::Relations, 99)).await.unwrap();

        let public = store.query_public(RecordKind::LogEntry, 4).await.unwrap();
        assert_eq!(public.len(), 4);
        assert_eq!(public[0].timestamp, 5);
    }

    #[tokio::test]
    async fn test_update_status_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);

        let request = Record::new(RecordKind::RelationshipRequest, "a@x", json!({}))
            .with_target("b@x")
            .with_status("pending");
        let id = store.create(&request).await.unwrap();

        let updated = store
            .update_status(RecordKind::RelationshipRequest, &id, "accepted")
            .await
            .unwrap();
        assert_eq!(updated.status.as_deref(), Some("accepted"));

        let listed = store.query_by_owner(RecordKind::RelationshipRequest, "b@x").await.unwrap();
        assert_eq!(listed[0].status.as_deref(), Some("accepted"));
        assert_eq!(listed[0].timestamp, request.timestamp);

        let err = store
            .update_status(RecordKind::RelationshipRequest, "nope", "accepted")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_and_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir, 10);

        let keep = store.create(&entry("a@x", Visibility::Public, 1)).await.unwrap();
        let gone = store.create(&entry("a@x", Visibility::Public, 2)).await.unwrap();

        let removed = store.delete(RecordKind::LogEntry, &gone).await.unwrap();
        assert_eq!(removed.id, gone);

        let owned = store.query_by_owner(RecordKind::LogEntry, "a@x").await.unwrap();
        assert_eq!(owned.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec![keep.as_str()]);
        assert_eq!(store.query_public(RecordKind::LogEntry, 10).await.unwrap().len(), 1);

        let err = store.delete(RecordKind::LogEntry, &gone).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("small.db").display());
        let store = SqlRecordStore::connect_lazy(
            &url,
            SqlStoreOptions {
                max_payload_bytes: 128,
                ..Default::default()
            },
        )
        .unwrap();

        let big = Record::new(RecordKind::LogEntry, "a@x", json!({"note": "y".repeat(500)}));
        assert!(matches!(store.create(&big).await, Err(StoreError::Rejected(_))));
    }

    #[test]
    fn test_visibility_clause() {
        let (sql, binds) = visibility_clause(&VisibilityFilter::relations());
        assert_eq!(sql, "(visibility IS NULL OR visibility IN (?, ?))");
        assert_eq!(binds, vec!["relations", "public"]);

        let (sql, binds) = visibility_clause(&VisibilityFilter::new([]));
        assert_eq!(sql, "visibility IS NULL");
        assert!(binds.is_empty());
    }

    #[test]
    fn test_unreachable_database_is_unavailable() {
        let err = map_sqlx_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(!err.is_caller_facing());
    }
}
