//! Redis provider.
//!
//! Records are stored as JSON strings; sorted sets scored by creation time
//! give server-side newest-first ordering:
//!
//! ```text
//! {prefix}rec:{kind}:{id}          STRING  record JSON
//! {prefix}own:{kind}:{scope_owner} ZSET    ids listed under an identity
//! {prefix}by:{kind}:{owner_id}     ZSET    ids authored by an identity
//! {prefix}pub:{kind}               ZSET    ids of public records
//! {prefix}chg:{kind}               CHANNEL record JSON published on every write
//! ```
//!
//! Change notification is native: every create, status update and delete
//! is published on the kind's channel and subscribers filter by scope.
//! Set-membership queries are unbounded and pipelined.
//!
//! Status updates and deletes read the record, then apply the change in a
//! Lua script that only proceeds if the stored JSON is still what was read.
//! A concurrent change makes the script refuse and the call starts over.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{pipe, Client, RedisError, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::traits::{
    query_in_batches, ChangeCallback, FeedStatus, PushRegistration, PushStore, RecordStore, StoreError,
};
use crate::provider::{LatencyClass, ProviderDescriptor, ProviderId};
use crate::record::{sort_newest_first, Record, RecordKind, VisibilityFilter};
use crate::scope::ScopeDescriptor;

/// KEYS: record, channel. ARGV: expected JSON, new JSON.
/// Returns 1 when applied, 0 when the record is gone, -1 when it changed.
const SET_IF_UNCHANGED: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
if current ~= ARGV[1] then return -1 end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('PUBLISH', KEYS[2], ARGV[2])
return 1
"#;

/// KEYS: record, scope index, author index, public index, channel.
/// ARGV: expected JSON, id. Same return codes as [`SET_IF_UNCHANGED`].
const DELETE_IF_UNCHANGED: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then return 0 end
if current ~= ARGV[1] then return -1 end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[2])
redis.call('ZREM', KEYS[3], ARGV[2])
redis.call('ZREM', KEYS[4], ARGV[2])
redis.call('PUBLISH', KEYS[5], ARGV[1])
return 1
"#;

/// Compare-and-set rounds before giving up on a hot record.
const CAS_ATTEMPTS: usize = 5;

/// Outcome of a compare-and-set script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CasOutcome {
    Applied,
    Missing,
    Changed,
}

impl CasOutcome {
    fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Applied,
            0 => Self::Missing,
            _ => Self::Changed,
        }
    }
}

/// Classify a redis error for the fallback policy.
fn map_redis_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Backend(e.to_string())
    }
}

pub struct RedisRecordStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    /// Optional key prefix for namespacing (e.g., "myapp:" → "myapp:rec:log_entry:...")
    prefix: String,
    descriptor: ProviderDescriptor,
    max_payload_bytes: usize,
    set_if_unchanged: Script,
    delete_if_unchanged: Script,
}

impl RedisRecordStore {
    /// Create a store. No connection is made until the first operation;
    /// only a malformed URL fails here.
    pub fn new(connection_string: &str, prefix: Option<&str>, max_payload_bytes: usize) -> Result<Self, StoreError> {
        let client = Client::open(connection_string)
            .map_err(|e| StoreError::Backend(format!("invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            prefix: prefix.unwrap_or("").to_string(),
            descriptor: ProviderDescriptor {
                id: ProviderId::REDIS,
                native_push: true,
                set_membership_query: true,
                max_batch_size: None,
                latency: LatencyClass::Low,
            },
            max_payload_bytes,
            set_if_unchanged: Script::new(SET_IF_UNCHANGED),
            delete_if_unchanged: Script::new(DELETE_IF_UNCHANGED),
        })
    }

    /// Get the configured prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!(prefix = %self.prefix, "Redis connection established");
                Ok::<_, RedisError>(manager)
            })
            .await
            .map_err(map_redis_error)?;
        Ok(manager.clone())
    }

    fn record_key(&self, kind: RecordKind, id: &str) -> String {
        format!("{}rec:{}:{}", self.prefix, kind, id)
    }

    fn scope_index(&self, kind: RecordKind, scope_owner: &str) -> String {
        format!("{}own:{}:{}", self.prefix, kind, scope_owner)
    }

    fn author_index(&self, kind: RecordKind, owner_id: &str) -> String {
        format!("{}by:{}:{}", self.prefix, kind, owner_id)
    }

    fn public_index(&self, kind: RecordKind) -> String {
        format!("{}pub:{}", self.prefix, kind)
    }

    fn channel(&self, kind: RecordKind) -> String {
        format!("{}chg:{}", self.prefix, kind)
    }

    /// Raw and decoded form of one stored record.
    async fn fetch_one(
        &self,
        conn: &mut ConnectionManager,
        kind: RecordKind,
        id: &str,
    ) -> Result<(String, Record), StoreError> {
        let json: Option<String> = redis::cmd("GET")
            .arg(self.record_key(kind, id))
            .query_async(conn)
            .await
            .map_err(map_redis_error)?;
        let json = json.ok_or_else(|| not_found(kind, id))?;
        let record =
            serde_json::from_str(&json).map_err(|e| StoreError::Malformed(format!("invalid record JSON: {}", e)))?;
        Ok((json, record))
    }

    /// MGET the record keys for `ids`, skipping ids whose record is gone.
    async fn load(&self, conn: &mut ConnectionManager, kind: RecordKind, ids: &[String]) -> Result<Vec<Record>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.record_key(kind, id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(conn)
            .await
            .map_err(map_redis_error)?;

        raw.into_iter()
            .flatten()
            .map(|json| {
                serde_json::from_str::<Record>(&json)
                    .map_err(|e| StoreError::Malformed(format!("invalid record JSON: {}", e)))
            })
            .collect()
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
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

        let mut conn = self.conn().await?;
        let kind = stored.kind;
        let mut pipeline = pipe();
        pipeline.atomic();
        pipeline.set(self.record_key(kind, &id), &json).ignore();
        pipeline
            .zadd(self.scope_index(kind, stored.scope_owner()), &id, stored.timestamp)
            .ignore();
        pipeline
            .zadd(self.author_index(kind, &stored.owner_id), &id, stored.timestamp)
            .ignore();
        if stored.is_public() {
            pipeline.zadd(self.public_index(kind), &id, stored.timestamp).ignore();
        }
        pipeline.publish(self.channel(kind), &json).ignore();

        let _: () = pipeline.query_async(&mut conn).await.map_err(map_redis_error)?;
        debug!(kind = %kind, id = %id, "Record stored in Redis");
        Ok(id)
    }

    async fn query_by_owner(&self, kind: RecordKind, owner_id: &str) -> Result<Vec<Record>, StoreError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.scope_index(kind, owner_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut records = self.load(&mut conn, kind, &ids).await?;
        // Equal scores come back in lexical member order reversed; normalize ties
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn query_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError> {
        query_in_batches(owner_ids, self.descriptor.max_batch_size, |batch| async move {
            let mut conn = self.conn().await?;
            let mut pipeline = pipe();
            for owner in &batch {
                pipeline.cmd("ZREVRANGE").arg(self.author_index(kind, owner)).arg(0).arg(-1);
            }
            let per_owner: Vec<Vec<String>> = pipeline.query_async(&mut conn).await.map_err(map_redis_error)?;
            let ids: Vec<String> = per_owner.into_iter().flatten().collect();

            let records = self.load(&mut conn, kind, &ids).await?;
            Ok(records.into_iter().filter(|r| filter.accepts(r.visibility)).collect())
        })
        .await
    }

    async fn query_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.public_index(kind))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let mut records = self.load(&mut conn, kind, &ids).await?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn update_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Record, StoreError> {
        let mut conn = self.conn().await?;
        for _ in 0..CAS_ATTEMPTS {
            let (current, mut record) = self.fetch_one(&mut conn, kind, id).await?;
            record.status = Some(status.to_string());
            let updated = serde_json::to_string(&record).map_err(|e| StoreError::Malformed(e.to_string()))?;

            let code: i64 = self
                .set_if_unchanged
                .key(self.record_key(kind, id))
                .key(self.channel(kind))
                .arg(&current)
                .arg(&updated)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            match CasOutcome::from_code(code) {
                CasOutcome::Applied => return Ok(record),
                CasOutcome::Missing => return Err(not_found(kind, id)),
                CasOutcome::Changed => debug!(kind = %kind, id = %id, "Record changed during status update, retrying"),
            }
        }
        Err(contended(kind, id))
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<Record, StoreError> {
        let mut conn = self.conn().await?;
        for _ in 0..CAS_ATTEMPTS {
            let (current, record) = self.fetch_one(&mut conn, kind, id).await?;

            let code: i64 = self
                .delete_if_unchanged
                .key(self.record_key(kind, id))
                .key(self.scope_index(kind, record.scope_owner()))
                .key(self.author_index(kind, &record.owner_id))
                .key(self.public_index(kind))
                .key(self.channel(kind))
                .arg(&current)
                .arg(id)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            match CasOutcome::from_code(code) {
                CasOutcome::Applied => {
                    debug!(kind = %kind, id = %id, "Record deleted from Redis");
                    return Ok(record);
                }
                CasOutcome::Missing => return Err(not_found(kind, id)),
                CasOutcome::Changed => debug!(kind = %kind, id = %id, "Record changed during delete, retrying"),
            }
        }
        Err(contended(kind, id))
    }

    fn as_push(&self) -> Option<&dyn PushStore> {
        Some(self)
    }
}

#[async_trait]
impl PushStore for RedisRecordStore {
    async fn subscribe(
        &self,
        kind: RecordKind,
        scope: &ScopeDescriptor,
        on_change: ChangeCallback,
    ) -> Result<PushRegistration, StoreError> {
        let channel = self.channel(kind);
        let mut pubsub = self.client.get_async_pubsub().await.map_err(map_redis_error)?;
        pubsub.subscribe(&channel).await.map_err(map_redis_error)?;
        debug!(channel = %channel, "Subscribed to Redis change channel");

        let scope = scope.clone();
        let feed = FeedStatus::new();
        let status = feed.clone();
        let handle = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Undecodable change message");
                        continue;
                    }
                };
                match serde_json::from_str::<Record>(&payload) {
                    Ok(record) if scope.could_include(&record) => on_change(),
                    Ok(_) => {}
                    // Unknown shape: let the listener re-fetch rather than miss a change
                    Err(_) => on_change(),
                }
            }
            // Connection lost: nothing more will arrive on this stream
            warn!(channel = %channel, "Redis change stream ended");
            status.end();
            on_change();
        });

        Ok(PushRegistration::new(move || handle.abort()).with_feed(feed))
    }
}

fn not_found(kind: RecordKind, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn contended(kind: RecordKind, id: &str) -> StoreError {
    StoreError::Backend(format!(
        "{} '{}' kept changing, gave up after {} attempts",
        kind, id, CAS_ATTEMPTS
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_is_lazy() {
        // Nothing listens here; construction must still succeed
        let store = RedisRecordStore::new("redis://127.0.0.1:1", Some("t:"), 1024).unwrap();
        assert_eq!(store.prefix(), "t:");
        assert!(store.descriptor().native_push);
        assert_eq!(store.descriptor().max_batch_size, None);
    }

    #[test]
    fn test_cas_outcome_codes() {
        assert_eq!(CasOutcome::from_code(1), CasOutcome::Applied);
        assert_eq!(CasOutcome::from_code(0), CasOutcome::Missing);
        assert_eq!(CasOutcome::from_code(-1), CasOutcome::Changed);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(RedisRecordStore::new("not a url", None, 1024).is_err());
    }

    #[test]
    fn test_key_layout() {
        let store = RedisRecordStore::new("redis://127.0.0.1", Some("app:"), 1024).unwrap();
        assert_eq!(store.record_key(RecordKind::LogEntry, "abc"), "app:rec:log_entry:abc");
        assert_eq!(store.scope_index(RecordKind::Comment, "entry-1"), "app:own:comment:entry-1");
        assert_eq!(store.author_index(RecordKind::LogEntry, "a@x"), "app:by:log_entry:a@x");
        assert_eq!(store.public_index(RecordKind::LogEntry), "app:pub:log_entry");
        assert_eq!(store.channel(RecordKind::RelationshipRequest), "app:chg:relationship_request");
    }
}
