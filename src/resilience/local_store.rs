//! Durable local storage for records that could not reach a remote provider.
//!
//! This is NOT a provider tier - it's a durability buffer. Records written
//! here carry `pending_sync = 1` until a reconciliation job pushes them
//! upstream and calls [`LocalStore::mark_synced`]. Status changes that could
//! not be applied remotely are queued in `pending_status_updates`, deletes
//! in `pending_deletes`.
//!
//! ```sql
//! CREATE TABLE local_records (
//!   kind TEXT, id TEXT, owner_id TEXT, scope_owner TEXT, visibility TEXT,
//!   timestamp INTEGER, record TEXT, pending_sync INTEGER,
//!   PRIMARY KEY (kind, id)
//! )
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::{debug, info, warn};

use crate::record::{now_millis, sort_newest_first, Record, RecordKind, Visibility, VisibilityFilter};
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::sql::{decode_record, install_drivers, map_sqlx_error, text_column, visibility_clause};
use crate::storage::traits::{query_in_batches, StoreError};

/// Largest id list bound into one SQLite statement.
const LOCAL_BATCH_SIZE: usize = 500;

/// A status change recorded while the remote was unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStatusUpdate {
    pub kind: RecordKind,
    pub id: String,
    pub status: String,
    pub recorded_at: i64,
}

/// A delete of a remote record recorded while the remote was unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelete {
    pub kind: RecordKind,
    pub id: String,
    pub recorded_at: i64,
}

/// Local store counters for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalStoreStats {
    /// Records written since startup
    pub total_written: u64,
    /// Records marked synced since startup
    pub total_synced: u64,
    /// Records still pending sync when the store was opened
    pub pending_at_open: u64,
}

#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, record: &Record, pending_sync: bool) -> Result<(), StoreError>;

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError>;

    /// Records listed under `scope_owner`, newest first.
    async fn list_by_scope_owner(&self, kind: RecordKind, scope_owner: &str) -> Result<Vec<Record>, StoreError>;

    /// Records authored by any of `owner_ids` passing `filter`, newest first.
    async fn list_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError>;

    async fn list_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError>;

    /// Apply `status` to a locally held record, returning it if present.
    async fn set_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Option<Record>, StoreError>;

    /// Queue a status change for later reconciliation.
    async fn record_status_update(&self, kind: RecordKind, id: &str, status: &str) -> Result<(), StoreError>;

    /// Records of `kind` not yet confirmed by a remote provider, oldest first.
    async fn pending_sync(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError>;

    async fn pending_status_updates(&self, kind: RecordKind) -> Result<Vec<PendingStatusUpdate>, StoreError>;

    /// Remove a locally held record, returning it if present.
    async fn remove(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError>;

    /// Queue a delete for later reconciliation.
    async fn record_delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError>;

    /// Queued deletes of `kind`, oldest first.
    async fn pending_deletes(&self, kind: RecordKind) -> Result<Vec<PendingDelete>, StoreError>;

    /// Clear the pending flag, queued status updates and queued deletes for
    /// `ids`. Returns the number of records updated.
    async fn mark_synced(&self, kind: RecordKind, ids: &[String]) -> Result<u64, StoreError>;
}

/// [`LocalStore`] backed by SQLite.
pub struct SqliteLocalStore {
    pool: AnyPool,
    /// Path to SQLite file (for display)
    path: String,
    total_written: AtomicU64,
    total_synced: AtomicU64,
    pending_at_open: u64,
}

impl SqliteLocalStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let url = format!("sqlite://{}?mode=rwc", path_str);
        info!(path = %path_str, "Opening local record store");

        install_drivers();
        // Use startup config: fail fast on a bad path instead of hanging
        let pool = retry("local_store_open", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(4)
                .acquire_timeout(Duration::from_secs(10))
                .connect(&url)
                .await
                .map_err(map_sqlx_error)
        })
        .await?;

        Self::init(pool, path_str).await
    }

    /// Store that lives only as long as this instance.
    pub async fn in_memory() -> Result<Self, StoreError> {
        install_drivers();
        // Each SQLite memory connection is its own database: pin exactly one
        let pool = AnyPoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(map_sqlx_error)?;

        Self::init(pool, ":memory:".to_string()).await
    }

    async fn init(pool: AnyPool, path: String) -> Result<Self, StoreError> {
        let statements = [
            "PRAGMA journal_mode = WAL",
            "PRAGMA synchronous = NORMAL",
            r#"
            CREATE TABLE IF NOT EXISTS local_records (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                scope_owner TEXT NOT NULL,
                visibility TEXT,
                timestamp INTEGER NOT NULL,
                record TEXT NOT NULL,
                pending_sync INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (kind, id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_local_records_scope ON local_records (kind, scope_owner)",
            r#"
            CREATE TABLE IF NOT EXISTS pending_status_updates (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                status TEXT NOT NULL,
                recorded_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pending_deletes (
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (kind, id)
            )
            "#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&pool).await.map_err(map_sqlx_error)?;
        }

        // Records left over from a previous run
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM local_records WHERE pending_sync = 1")
            .fetch_one(&pool)
            .await
            .map_err(map_sqlx_error)?;
        let pending: i64 = row.try_get("cnt").map_err(map_sqlx_error)?;
        if pending > 0 {
            warn!(pending, "Local store has records pending sync from a previous run");
        }

        Ok(Self {
            pool,
            path,
            total_written: AtomicU64::new(0),
            total_synced: AtomicU64::new(0),
            pending_at_open: pending as u64,
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn stats(&self) -> LocalStoreStats {
        LocalStoreStats {
            total_written: self.total_written.load(Ordering::Relaxed),
            total_synced: self.total_synced.load(Ordering::Relaxed),
            pending_at_open: self.pending_at_open,
        }
    }

    fn decode_all(rows: &[sqlx::any::AnyRow]) -> Result<Vec<Record>, StoreError> {
        rows.iter().map(decode_record).collect()
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn put(&self, record: &Record, pending_sync: bool) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(|e| StoreError::Malformed(e.to_string()))?;

        sqlx::query(
            "INSERT INTO local_records (kind, id, owner_id, scope_owner, visibility, timestamp, record, pending_sync) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(kind, id) DO UPDATE SET \
                owner_id = excluded.owner_id, \
                scope_owner = excluded.scope_owner, \
                visibility = excluded.visibility, \
                timestamp = excluded.timestamp, \
                record = excluded.record, \
                pending_sync = excluded.pending_sync",
        )
        .bind(record.kind.as_str())
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(record.scope_owner())
        .bind(record.visibility.map(|v| v.as_str()))
        .bind(record.timestamp)
        .bind(&json)
        .bind(i64::from(pending_sync))
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.total_written.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %record.kind, id = %record.id, pending_sync, "Record written to local store");
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query("SELECT record FROM local_records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(decode_record).transpose()
    }

    async fn list_by_scope_owner(&self, kind: RecordKind, scope_owner: &str) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM local_records WHERE kind = ? AND scope_owner = ? ORDER BY timestamp DESC, id ASC",
        )
        .bind(kind.as_str())
        .bind(scope_owner)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Self::decode_all(&rows)
    }

    async fn list_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError> {
        query_in_batches(owner_ids, Some(LOCAL_BATCH_SIZE), |batch| async move {
            let (vis_sql, vis_binds) = visibility_clause(filter);
            let sql = format!(
                "SELECT record FROM local_records WHERE kind = ? AND owner_id IN ({}) AND {}",
                vec!["?"; batch.len()].join(", "),
                vis_sql
            );
            let mut query = sqlx::query(&sql).bind(kind.as_str());
            for id in &batch {
                query = query.bind(id.as_str());
            }
            for v in vis_binds {
                query = query.bind(v);
            }
            let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;
            Self::decode_all(&rows)
        })
        .await
    }

    async fn list_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM local_records WHERE kind = ? AND visibility = ? ORDER BY timestamp DESC, id ASC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(Visibility::Public.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Self::decode_all(&rows)
    }

    async fn set_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Option<Record>, StoreError> {
        let Some(mut record) = self.get(kind, id).await? else {
            return Ok(None);
        };
        record.status = Some(status.to_string());
        let json = serde_json::to_string(&record).map_err(|e| StoreError::Malformed(e.to_string()))?;

        sqlx::query("UPDATE local_records SET record = ? WHERE kind = ? AND id = ?")
            .bind(&json)
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Some(record))
    }

    async fn record_status_update(&self, kind: RecordKind, id: &str, status: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO pending_status_updates (kind, id, status, recorded_at) VALUES (?, ?, ?, ?)")
            .bind(kind.as_str())
            .bind(id)
            .bind(status)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        debug!(kind = %kind, id = %id, status = %status, "Status update queued locally");
        Ok(())
    }

    async fn pending_sync(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query(
            "SELECT record FROM local_records WHERE kind = ? AND pending_sync = 1 ORDER BY timestamp ASC, id ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Self::decode_all(&rows)
    }

    async fn pending_status_updates(&self, kind: RecordKind) -> Result<Vec<PendingStatusUpdate>, StoreError> {
        let rows = sqlx::query(
            "SELECT kind, id, status, recorded_at FROM pending_status_updates WHERE kind = ? ORDER BY seq ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                let kind = text_column(row, "kind")
                    .ok_or_else(|| StoreError::Malformed("kind column missing".into()))?
                    .parse::<RecordKind>()
                    .map_err(StoreError::Malformed)?;
                Ok(PendingStatusUpdate {
                    kind,
                    id: text_column(row, "id").unwrap_or_default(),
                    status: text_column(row, "status").unwrap_or_default(),
                    recorded_at: row.try_get("recorded_at").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    async fn remove(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError> {
        let Some(record) = self.get(kind, id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM local_records WHERE kind = ? AND id = ?")
            .bind(kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        debug!(kind = %kind, id = %id, "Record removed from local store");
        Ok(Some(record))
    }

    async fn record_delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        // A repeated delete keeps its first timestamp
        sqlx::query("INSERT INTO pending_deletes (kind, id, recorded_at) VALUES (?, ?, ?) ON CONFLICT(kind, id) DO NOTHING")
            .bind(kind.as_str())
            .bind(id)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        debug!(kind = %kind, id = %id, "Delete queued locally");
        Ok(())
    }

    async fn pending_deletes(&self, kind: RecordKind) -> Result<Vec<PendingDelete>, StoreError> {
        let rows = sqlx::query("SELECT id, recorded_at FROM pending_deletes WHERE kind = ? ORDER BY recorded_at ASC, id ASC")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                Ok(PendingDelete {
                    kind,
                    id: text_column(row, "id").ok_or_else(|| StoreError::Malformed("id column missing".into()))?,
                    recorded_at: row.try_get("recorded_at").map_err(map_sqlx_error)?,
                })
            })
            .collect()
    }

    async fn mark_synced(&self, kind: RecordKind, ids: &[String]) -> Result<u64, StoreError> {
        let mut updated = 0u64;
        for chunk in ids.chunks(LOCAL_BATCH_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");

            let sql = format!(
                "UPDATE local_records SET pending_sync = 0 WHERE kind = ? AND pending_sync = 1 AND id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(kind.as_str());
            for id in chunk {
                query = query.bind(id.as_str());
            }
            let result = query.execute(&self.pool).await.map_err(map_sqlx_error)?;
            updated += result.rows_affected();

            for table in ["pending_status_updates", "pending_deletes"] {
                let sql = format!("DELETE FROM {} WHERE kind = ? AND id IN ({})", table, placeholders);
                let mut query = sqlx::query(&sql).bind(kind.as_str());
                for id in chunk {
                    query = query.bind(id.as_str());
                }
                query.execute(&self.pool).await.map_err(map_sqlx_error)?;
            }
        }

        self.total_synced.fetch_add(updated, Ordering::Relaxed);
        info!(kind = %kind, updated, "Local records marked synced");
        Ok(updated)
    }
}


/// [`LocalStore`] held in process memory. Nothing survives a restart; meant
/// for tests and hosts without a writable filesystem.
#[derive(Default)]
pub struct MemoryLocalStore {
    records: Mutex<HashMap<(RecordKind, String), (Record, bool)>>,
    status_updates: Mutex<Vec<PendingStatusUpdate>>,
    deletes: Mutex<Vec<PendingDelete>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn list(&self, kind: RecordKind, pred: impl Fn(&Record) -> bool) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .records
            .lock()
            .iter()
            .filter(|((k, _), (r, _))| *k == kind && pred(r))
            .map(|(_, (r, _))| r.clone())
            .collect();
        sort_newest_first(&mut out);
        out
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn put(&self, record: &Record, pending_sync: bool) -> Result<(), StoreError> {
        self.records
            .lock()
            .insert((record.kind, record.id.clone()), (record.clone(), pending_sync));
        Ok(())
    }

    async fn get(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.lock().get(&(kind, id.to_string())).map(|(r, _)| r.clone()))
    }

    async fn list_by_scope_owner(&self, kind: RecordKind, scope_owner: &str) -> Result<Vec<Record>, StoreError> {
        Ok(self.list(kind, |r| r.scope_owner() == scope_owner))
    }

    async fn list_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(self.list(kind, |r| owner_ids.contains(&r.owner_id) && filter.accepts(r.visibility)))
    }

    async fn list_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError> {
        let mut out = self.list(kind, Record::is_public);
        out.truncate(limit);
        Ok(out)
    }

    async fn set_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Option<Record>, StoreError> {
        let mut records = self.records.lock();
        Ok(records.get_mut(&(kind, id.to_string())).map(|(r, _)| {
            r.status = Some(status.to_string());
            r.clone()
        }))
    }

    async fn record_status_update(&self, kind: RecordKind, id: &str, status: &str) -> Result<(), StoreError> {
        self.status_updates.lock().push(PendingStatusUpdate {
            kind,
            id: id.to_string(),
            status: status.to_string(),
            recorded_at: now_millis(),
        });
        Ok(())
    }

    async fn pending_sync(&self, kind: RecordKind) -> Result<Vec<Record>, StoreError> {
        let mut out: Vec<Record> = self
            .records
            .lock()
            .iter()
            .filter(|((k, _), (_, pending))| *k == kind && *pending)
            .map(|(_, (r, _))| r.clone())
            .collect();
        out.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn pending_status_updates(&self, kind: RecordKind) -> Result<Vec<PendingStatusUpdate>, StoreError> {
        Ok(self
            .status_updates
            .lock()
            .iter()
            .filter(|u| u.kind == kind)
            .cloned()
            .collect())
    }

    async fn remove(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.records.lock().remove(&(kind, id.to_string())).map(|(r, _)| r))
    }

    async fn record_delete(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        let mut deletes = self.deletes.lock();
        if !deletes.iter().any(|d| d.kind == kind && d.id == id) {
            deletes.push(PendingDelete {
                kind,
                id: id.to_string(),
                recorded_at: now_millis(),
            });
        }
        Ok(())
    }

    async fn pending_deletes(&self, kind: RecordKind) -> Result<Vec<PendingDelete>, StoreError> {
        Ok(self.deletes.lock().iter().filter(|d| d.kind == kind).cloned().collect())
    }

    async fn mark_synced(&self, kind: RecordKind, ids: &[String]) -> Result<u64, StoreError> {
        let mut updated = 0;
        {
            let mut records = self.records.lock();
            for id in ids {
                if let Some((_, pending)) = records.get_mut(&(kind, id.clone())) {
                    if *pending {
                        *pending = false;
                        updated += 1;
                    }
                }
            }
        }
        self.status_updates
            .lock()
            .retain(|u| !(u.kind == kind && ids.contains(&u.id)));
        self.deletes
            .lock()
            .retain(|d| !(d.kind == kind && ids.contains(&d.id)));
        Ok(updated)
    }
}
