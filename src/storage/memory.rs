//! In-process provider.
//!
//! Backed by a `DashMap`, with a capability profile chosen at build time so
//! the same store can stand in for a push-capable provider, a poll-only one,
//! or one with a bounded "in" filter. Change notification rides a tokio
//! broadcast channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::traits::{
    query_in_batches, ChangeCallback, FeedStatus, PushRegistration, PushStore, RecordStore, StoreError,
};
use crate::provider::{LatencyClass, ProviderDescriptor, ProviderId};
use crate::record::{sort_newest_first, Record, RecordKind, VisibilityFilter};
use crate::scope::ScopeDescriptor;

const CHANGE_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Builder for [`MemoryRecordStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreBuilder {
    descriptor: ProviderDescriptor,
    max_payload_bytes: usize,
}

impl MemoryStoreBuilder {
    #[must_use]
    pub fn native_push(mut self, enabled: bool) -> Self {
        self.descriptor.native_push = enabled;
        self
    }

    /// Without set-membership queries, relation reads issue one owner
    /// query per id.
    #[must_use]
    pub fn set_membership_query(mut self, enabled: bool) -> Self {
        self.descriptor.set_membership_query = enabled;
        self
    }

    #[must_use]
    pub fn max_batch_size(mut self, limit: Option<usize>) -> Self {
        self.descriptor.max_batch_size = limit;
        self
    }

    #[must_use]
    pub fn latency(mut self, latency: LatencyClass) -> Self {
        self.descriptor.latency = latency;
        self
    }

    #[must_use]
    pub fn max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = limit;
        self
    }

    #[must_use]
    pub fn build(self) -> MemoryRecordStore {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        MemoryRecordStore {
            descriptor: self.descriptor,
            max_payload_bytes: self.max_payload_bytes,
            data: DashMap::new(),
            changes,
            queries: AtomicU64::new(0),
        }
    }
}

pub struct MemoryRecordStore {
    descriptor: ProviderDescriptor,
    max_payload_bytes: usize,
    /// Keyed by `kind:id`
    data: DashMap<String, Record>,
    changes: broadcast::Sender<Record>,
    queries: AtomicU64,
}

impl MemoryRecordStore {
    /// Start building a store. Defaults: poll-only, set queries supported,
    /// unbounded batches, local latency.
    #[must_use]
    pub fn builder(id: ProviderId) -> MemoryStoreBuilder {
        MemoryStoreBuilder {
            descriptor: ProviderDescriptor {
                id,
                native_push: false,
                set_membership_query: true,
                max_batch_size: None,
                latency: LatencyClass::Local,
            },
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Poll-only store registered under [`ProviderId::MEMORY`].
    #[must_use]
    pub fn new() -> Self {
        Self::builder(ProviderId::MEMORY).build()
    }

    fn key(kind: RecordKind, id: &str) -> String {
        format!("{}:{}", kind, id)
    }

    /// Number of stored records across all kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&self) {
        self.data.clear();
    }

    /// Read queries served so far (creates and status updates excluded).
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Insert a record as-is, bypassing id assignment and notification.
    /// For seeding state in tests and embedded setups.
    pub fn insert_raw(&self, record: Record) {
        self.data.insert(Self::key(record.kind, &record.id), record);
    }

    fn collect(&self, kind: RecordKind, pred: impl Fn(&Record) -> bool) -> Vec<Record> {
        let mut out: Vec<Record> = self
            .data
            .iter()
            .filter(|e| e.value().kind == kind && pred(e.value()))
            .map(|e| e.value().clone())
            .collect();
        // DashMap iteration order is arbitrary
        sort_newest_first(&mut out);
        out
    }

    fn notify(&self, record: &Record) {
        if self.descriptor.native_push {
            // No receivers is fine
            let _ = self.changes.send(record.clone());
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn create(&self, record: &Record) -> Result<String, StoreError> {
        let size = record.encoded_len();
        if size > self.max_payload_bytes {
            return Err(StoreError::Rejected(format!(
                "record is {} bytes (max {})",
                size, self.max_payload_bytes
            )));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut stored = record.clone();
        stored.id = id.clone();
        self.data.insert(Self::key(stored.kind, &id), stored.clone());
        debug!(provider = %self.descriptor.id, kind = %stored.kind, id = %id, "Record stored in memory");

        self.notify(&stored);
        Ok(id)
    }

    async fn query_by_owner(&self, kind: RecordKind, owner_id: &str) -> Result<Vec<Record>, StoreError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        Ok(self.collect(kind, |r| r.scope_owner() == owner_id))
    }

    async fn query_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError> {
        let batch_size = if self.descriptor.set_membership_query {
            self.descriptor.max_batch_size
        } else {
            Some(1)
        };
        query_in_batches(owner_ids, batch_size, |batch| async move {
            self.queries.fetch_add(1, Ordering::Relaxed);
            Ok(self.collect(kind, |r| batch.contains(&r.owner_id) && filter.accepts(r.visibility)))
        })
        .await
    }

    async fn query_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let mut out = self.collect(kind, Record::is_public);
        out.truncate(limit);
        Ok(out)
    }

    async fn update_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Record, StoreError> {
        let updated = {
            let mut entry = self.data.get_mut(&Self::key(kind, id)).ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;
            entry.status = Some(status.to_string());
            entry.value().clone()
        };
        self.notify(&updated);
        Ok(updated)
    }

    async fn delete(&self, kind: RecordKind, id: &str) -> Result<Record, StoreError> {
        let (_, removed) = self.data.remove(&Self::key(kind, id)).ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })?;
        debug!(provider = %self.descriptor.id, kind = %kind, id = %id, "Record removed from memory");
        self.notify(&removed);
        Ok(removed)
    }

    fn as_push(&self) -> Option<&dyn PushStore> {
        if self.descriptor.native_push {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl PushStore for MemoryRecordStore {
    async fn subscribe(
        &self,
        kind: RecordKind,
        scope: &ScopeDescriptor,
        on_change: ChangeCallback,
    ) -> Result<PushRegistration, StoreError> {
        let mut rx = self.changes.subscribe();
        let scope = scope.clone();
        let feed = FeedStatus::new();
        let status = feed.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(record) => {
                        if record.kind == kind && scope.could_include(&record) {
                            on_change();
                        }
                    }
                    // Missed events: something changed, let the listener re-fetch
                    Err(broadcast::error::RecvError::Lagged(_)) => on_change(),
                    Err(broadcast::error::RecvError::Closed) => {
                        status.end();
                        on_change();
                        break;
                    }
                }
            }
        });

        Ok(PushRegistration::new(move || handle.abort()).with_feed(feed))
    }
}
