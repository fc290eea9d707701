//! CRUD, provider control and the reconciliation hook.

use tracing::debug;

use crate::cache::CacheStats;
use crate::provider::ProviderId;
use crate::record::{Record, RecordKind, VisibilityFilter};
use crate::resilience::health::HealthSnapshot;
use crate::resilience::local_store::{LocalStore, PendingDelete, PendingStatusUpdate};
use crate::scope::{ScopeDescriptor, ScopeKey};

use super::{RecordSync, SyncError};

impl RecordSync {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Records
    // ═══════════════════════════════════════════════════════════════════════════

    /// Persist a new record and return its id.
    ///
    /// A transport failure does not surface: the record is written to the
    /// local store with a `local-` id and `degraded_mode()` turns true.
    ///
    /// # Errors
    /// - [`SyncError::ValidationRejected`] when the provider refuses the payload
    /// - [`SyncError::AllProvidersExhausted`] when the local store failed too
    #[tracing::instrument(skip(self, record), fields(kind = %record.kind))]
    pub async fn create(&self, record: &Record) -> Result<String, SyncError> {
        let stored = self.store.create(record).await?;
        let woken = self.subscriptions.trigger(stored.kind, &stored);
        debug!(id = %stored.id, woken, "Record created");
        Ok(stored.id)
    }

    /// Records listed under `owner_id`, newest first.
    #[tracing::instrument(skip(self))]
    pub async fn get_owned(&self, kind: RecordKind, owner_id: &str) -> Result<Vec<Record>, SyncError> {
        self.store
            .read(&ScopeKey::new(kind, ScopeDescriptor::owner(owner_id)))
            .await
    }

    /// Records authored by any of `relation_ids` whose visibility passes
    /// `filter`, newest first. An empty id set never reaches a provider.
    #[tracing::instrument(skip(self, relation_ids), fields(relations = relation_ids.len()))]
    pub async fn get_from_relations(
        &self,
        kind: RecordKind,
        relation_ids: &[String],
        filter: VisibilityFilter,
    ) -> Result<Vec<Record>, SyncError> {
        if relation_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .read(&ScopeKey::new(kind, ScopeDescriptor::relations(relation_ids.iter().cloned(), filter)))
            .await
    }

    /// Newest public records. A `limit` of 0 means the configured default.
    #[tracing::instrument(skip(self))]
    pub async fn get_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, SyncError> {
        let limit = self.public_limit(limit);
        self.store.read(&ScopeKey::new(kind, ScopeDescriptor::public(limit))).await
    }

    /// Change a record's status (e.g. accept a relationship request).
    ///
    /// # Errors
    /// - [`SyncError::NotFound`] when the active remote does not know `id`
    /// - [`SyncError::AllProvidersExhausted`] when the local store failed too
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<(), SyncError> {
        if let Some(updated) = self.store.update_status(kind, id, status).await? {
            self.subscriptions.trigger(kind, &updated);
        }
        Ok(())
    }

    /// Delete a record (unfriend, remove a comment, take back a reaction).
    ///
    /// With the remote unreachable the local copy is removed and, for
    /// records that came from a remote, the delete is queued for
    /// reconciliation.
    ///
    /// # Errors
    /// - [`SyncError::NotFound`] when the active remote does not know `id`
    /// - [`SyncError::AllProvidersExhausted`] when the local store failed too
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<(), SyncError> {
        if let Some(removed) = self.store.delete(kind, id).await? {
            let woken = self.subscriptions.trigger(kind, &removed);
            debug!(woken, "Record deleted");
        }
        Ok(())
    }

    pub(super) fn public_limit(&self, limit: usize) -> usize {
        if limit == 0 {
            self.config.public_default_limit
        } else {
            limit
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Providers & status
    // ═══════════════════════════════════════════════════════════════════════════

    /// Drop the cached provider decision; the next call re-selects.
    pub fn invalidate_provider_selection(&self) {
        self.selector.invalidate();
    }

    /// Pin every call to the local store (or release the pin), effective
    /// immediately.
    pub fn set_force_offline(&self, offline: bool) {
        self.selector.set_force_offline(offline);
        self.selector.invalidate();
    }

    /// The provider serving calls right now, selecting one if needed.
    pub async fn active_provider(&self) -> ProviderId {
        self.store.active().await.id
    }

    /// True when the last write was not confirmed by a remote provider.
    #[must_use]
    pub fn degraded_mode(&self) -> bool {
        self.store.health().is_degraded()
    }

    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        self.store.health().snapshot()
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Empty the read cache.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Reconciliation hook
    // ═══════════════════════════════════════════════════════════════════════════

    /// Records of `kind` written locally and not yet confirmed upstream,
    /// oldest first.
    pub async fn pending_sync(&self, kind: RecordKind) -> Result<Vec<Record>, SyncError> {
        let pending = self.local.pending_sync(kind).await.map_err(SyncError::from_store)?;
        crate::metrics::set_pending_sync(kind, pending.len());
        Ok(pending)
    }

    /// Status changes that could not reach a remote provider, oldest first.
    pub async fn pending_status_updates(&self, kind: RecordKind) -> Result<Vec<PendingStatusUpdate>, SyncError> {
        self.local
            .pending_status_updates(kind)
            .await
            .map_err(SyncError::from_store)
    }

    /// Deletes that could not reach a remote provider, oldest first.
    pub async fn pending_deletes(&self, kind: RecordKind) -> Result<Vec<PendingDelete>, SyncError> {
        self.local.pending_deletes(kind).await.map_err(SyncError::from_store)
    }

    /// Mark `ids` as pushed upstream, clearing their queued status updates
    /// and deletes. Returns how many pending records changed.
    pub async fn mark_synced(&self, kind: RecordKind, ids: &[String]) -> Result<u64, SyncError> {
        let marked = self.local.mark_synced(kind, ids).await.map_err(SyncError::from_store)?;
        debug!(kind = %kind, marked, "Records marked synced");
        Ok(marked)
    }
}
