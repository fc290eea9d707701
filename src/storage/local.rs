// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The local store as a provider.
//!
//! Selected when the runtime is offline or nothing remote is configured.
//! Records created through it get a `local-` id and stay pending until a
//! reconciliation pass pushes them upstream.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::traits::{RecordStore, StoreError};
use crate::provider::{LatencyClass, ProviderDescriptor, ProviderId};
use crate::record::{Record, RecordKind, VisibilityFilter};
use crate::resilience::local_store::LocalStore;

/// Prefix of ids assigned without a remote provider.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// New id for a record created while no remote provider is reachable.
#[must_use]
pub fn local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4().simple())
}

pub struct LocalRecordStore {
    descriptor: ProviderDescriptor,
    inner: Arc<dyn LocalStore>,
}

impl LocalRecordStore {
    pub fn new(inner: Arc<dyn LocalStore>) -> Self {
        Self {
            descriptor: ProviderDescriptor {
                id: ProviderId::LOCAL,
                native_push: false,
                set_membership_query: true,
                max_batch_size: None,
                latency: LatencyClass::Local,
            },
            inner,
        }
    }

    /// The durable store underneath.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn LocalStore> {
        &self.inner
    }
}

#[async_trait]
impl RecordStore for LocalRecordStore {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn create(&self, record: &Record) -> Result<String, StoreError> {
        let mut stored = record.clone();
        stored.id = local_id();
        self.inner.put(&stored, true).await?;
        debug!(kind = %stored.kind, id = %stored.id, "Record stored locally, pending sync");
        Ok(stored.id)
    }

    async fn query_by_owner(&self, kind: RecordKind, owner_id: &str) -> Result<Vec<Record>, StoreError> {
        self.inner.list_by_scope_owner(kind, owner_id).await
    }

    async fn query_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError> {
        self.inner.list_by_owner_set(kind, owner_ids, filter).await
    }

    async fn query_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError> {
        self.inner.list_public(kind, limit).await
    }

    async fn update_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Record, StoreError> {
        let updated = self
            .inner
            .set_status(kind, id, status)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })?;
        self.inner.record_status_update(kind, id, status).await?;
        Ok(updated)
    }

    /// Removes the local copy. Deletes of records that came from a remote
    /// provider are queued for reconciliation.
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<Record, StoreError> {
        let removed = self.inner.remove(kind, id).await?.ok_or_else(|| StoreError::NotFound {
            kind,
            id: id.to_string(),
        })?;
        if !id.starts_with(LOCAL_ID_PREFIX) {
            self.inner.record_delete(kind, id).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Visibility;
    use crate::resilience::local_store::SqliteLocalStore;
    use serde_json::json;

    async fn store() -> (LocalRecordStore, Arc<SqliteLocalStore>) {
        let inner = Arc::new(SqliteLocalStore::in_memory().await.unwrap());
        (LocalRecordStore::new(inner.clone()), inner)
    }

    #[tokio::test]
    async fn test_create_assigns_local_id_and_pends() {
        let (store, inner) = store().await;
        let record = Record::new(RecordKind::LogEntry, "a@x", json!({"rating": 5})).with_visibility(Visibility::Public);

        let id = store.create(&record).await.unwrap();
        assert!(id.starts_with(LOCAL_ID_PREFIX));

        let pending = inner.pending_sync(RecordKind::LogEntry).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        let owned = store.query_by_owner(RecordKind::LogEntry, "a@x").await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(store.query_public(RecordKind::LogEntry, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_status_queues_change() {
        let (store, inner) = store().await;
        let request = Record::new(RecordKind::RelationshipRequest, "a@x", json!({}))
            .with_target("b@x")
            .with_status("pending");
        let id = store.create(&request).await.unwrap();

        let updated = store
            .update_status(RecordKind::RelationshipRequest, &id, "accepted")
            .await
            .unwrap();
        assert_eq!(updated.status.as_deref(), Some("accepted"));

        let queued = inner.pending_status_updates(RecordKind::RelationshipRequest).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].status, "accepted");
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let (store, _) = store().await;
        let err = store
            .update_status(RecordKind::RelationshipRequest, "missing", "accepted")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_queues_only_remote_ids() {
        let (store, inner) = store().await;
        let id = store
            .create(&Record::new(RecordKind::Reaction, "a@x", json!({})).with_target("entry-1"))
            .await
            .unwrap();

        let removed = store.delete(RecordKind::Reaction, &id).await.unwrap();
        assert_eq!(removed.id, id);
        assert!(inner.pending_deletes(RecordKind::Reaction).await.unwrap().is_empty());

        let mut mirrored = Record::new(RecordKind::Reaction, "a@x", json!({})).with_target("entry-1");
        mirrored.id = "remote-1".into();
        inner.put(&mirrored, false).await.unwrap();
        store.delete(RecordKind::Reaction, "remote-1").await.unwrap();
        assert_eq!(inner.pending_deletes(RecordKind::Reaction).await.unwrap().len(), 1);

        let err = store.delete(RecordKind::Reaction, "remote-1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn test_local_id_format() {
        let id = local_id();
        assert!(id.starts_with("local-"));
        assert_eq!(id.len(), LOCAL_ID_PREFIX.len() + 32);
    }
}
