// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Try-remote, fall-back-to-local.
//!
//! Every CRUD call from the facade goes through [`ResilientStore`]:
//!
//! ```text
//! call
//!   │
//!   ├─ read: cache hit? ─────────────────────────→ cached records
//!   │
//!   ├─ active provider, one attempt
//!   │     ├─ ok        → invalidate (writes) / populate cache (reads,
//!   │     │              unless a write invalidated the key meanwhile)
//!   │     ├─ Rejected  → ValidationRejected
//!   │     ├─ NotFound  → NotFound
//!   │     └─ otherwise → local store
//!   │
//!   └─ local store fails too ───────────────────→ AllProvidersExhausted
//! ```
//!
//! There are no retries. A remote that keeps failing stays selected until
//! the selection TTL runs out; every call in between lands locally.
//!
//! Subscription workers read through [`ResilientStore::refresh`]: the same
//! remote-then-local order, but a local answer never enters the cache.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::RecordCache;
use crate::coordinator::SyncError;
use crate::provider::{ActiveProvider, ProviderSelector};
use crate::record::{Record, RecordKind};
use crate::resilience::health::ProviderHealth;
use crate::resilience::local_store::LocalStore;
use crate::scope::{ScopeDescriptor, ScopeKey};
use crate::storage::local::{LocalRecordStore, LOCAL_ID_PREFIX};
use crate::storage::traits::{query_scope, RecordStore, StoreError};

pub struct ResilientStore {
    selector: Arc<ProviderSelector>,
    cache: Arc<RecordCache>,
    health: Arc<ProviderHealth>,
    local: Arc<dyn LocalStore>,
    /// Same store, behind the provider contract
    local_provider: LocalRecordStore,
}

impl ResilientStore {
    pub fn new(
        selector: Arc<ProviderSelector>,
        cache: Arc<RecordCache>,
        health: Arc<ProviderHealth>,
        local: Arc<dyn LocalStore>,
    ) -> Self {
        Self {
            selector,
            cache,
            health,
            local_provider: LocalRecordStore::new(local.clone()),
            local,
        }
    }

    /// Resolve the active provider. A change of provider since the last
    /// decision empties the cache: nothing is migrated between providers.
    pub async fn active(&self) -> ActiveProvider {
        let active = self.selector.select().await;
        if let Some(previous) = active.switched_from {
            if previous != active.id {
                self.cache.clear();
                debug!(from = %previous, to = %active.id, "Provider switched, cache cleared");
            }
        }
        active
    }

    #[must_use]
    pub fn health(&self) -> &Arc<ProviderHealth> {
        &self.health
    }

    /// Persist `record`, returning the stored copy with its id.
    pub async fn create(&self, record: &Record) -> Result<Record, SyncError> {
        let active = self.active().await;

        if active.is_local() {
            return self.create_locally(record).await;
        }

        let timer = crate::metrics::LatencyTimer::new(active.id.as_str(), "create");
        match active.store.create(record).await {
            Ok(id) => {
                timer.finish("success");
                self.health.record_success();
                self.health.record_write(true);

                let mut stored = record.clone();
                stored.id = id;
                self.invalidate_for(&stored);
                Ok(stored)
            }
            Err(e) if e.is_caller_facing() => {
                timer.finish(e.label());
                Err(SyncError::from_store(e))
            }
            Err(e) => {
                timer.finish(e.label());
                self.note_fallback(&active, "create", &e);
                self.create_locally(record).await
            }
        }
    }

    async fn create_locally(&self, record: &Record) -> Result<Record, SyncError> {
        let id = self
            .local_provider
            .create(record)
            .await
            .map_err(|e| exhausted("create", e))?;
        self.health.record_write(false);

        let mut stored = record.clone();
        stored.id = id;
        self.invalidate_for(&stored);
        Ok(stored)
    }

    /// Read a scope, serving from the cache while fresh.
    pub async fn read(&self, key: &ScopeKey) -> Result<Vec<Record>, SyncError> {
        let active = self.active().await;

        if let Some(cached) = self.cache.get(key) {
            return Ok(cached);
        }
        let ticket = self.cache.ticket();

        if active.is_local() {
            let records = query_scope(&self.local_provider, key)
                .await
                .map_err(|e| exhausted("read", e))?;
            self.cache.set_if_current(key, records.clone(), ticket);
            return Ok(records);
        }

        let timer = crate::metrics::LatencyTimer::new(active.id.as_str(), "read");
        match query_scope(active.store.as_ref(), key).await {
            Ok(records) => {
                timer.finish("success");
                self.health.record_success();
                self.cache.set_if_current(key, records.clone(), ticket);
                Ok(records)
            }
            Err(e) if e.is_caller_facing() => {
                timer.finish(e.label());
                Err(SyncError::from_store(e))
            }
            Err(e) => {
                timer.finish(e.label());
                self.note_fallback(&active, "read", &e);
                // Not cached: the next call should try the remote again
                query_scope(&self.local_provider, key)
                    .await
                    .map_err(|e| exhausted("read", e))
            }
        }
    }

    /// Fetch a scope for a subscription, bypassing the cache lookup.
    ///
    /// A remote answer refreshes the cache; when the remote fails the local
    /// store answers instead and the cache is left alone. Remote failures
    /// here are routine (a poll every second while offline), so they are
    /// logged at debug and do not count against provider health.
    pub async fn refresh(&self, key: &ScopeKey) -> Result<Vec<Record>, SyncError> {
        let active = self.active().await;
        let ticket = self.cache.ticket();

        if active.is_local() {
            let records = query_scope(&self.local_provider, key)
                .await
                .map_err(|e| exhausted("subscription_fetch", e))?;
            self.cache.set_if_current(key, records.clone(), ticket);
            return Ok(records);
        }

        match query_scope(active.store.as_ref(), key).await {
            Ok(records) => {
                self.cache.set_if_current(key, records.clone(), ticket);
                Ok(records)
            }
            Err(e) if e.is_caller_facing() => Err(SyncError::from_store(e)),
            Err(e) => {
                debug!(key = %key, provider = %active.id, error = %e, "Subscription fetch failed, reading local store");
                crate::metrics::record_remote_error(active.id.as_str(), "subscription_fetch", &e);
                crate::metrics::record_fallback(active.id.as_str(), "subscription_fetch");
                query_scope(&self.local_provider, key)
                    .await
                    .map_err(|e| exhausted("subscription_fetch", e))
            }
        }
    }

    /// Change a record's status. Returns the updated record when one is
    /// known (remotely, or locally on the fallback path).
    pub async fn update_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Option<Record>, SyncError> {
        let active = self.active().await;

        if active.is_local() {
            return self.update_status_locally(kind, id, status).await;
        }

        let timer = crate::metrics::LatencyTimer::new(active.id.as_str(), "update_status");
        match active.store.update_status(kind, id, status).await {
            Ok(updated) => {
                timer.finish("success");
                self.health.record_success();
                self.health.record_write(true);
                self.invalidate_for(&updated);
                Ok(Some(updated))
            }
            Err(e) if e.is_caller_facing() => {
                timer.finish(e.label());
                Err(SyncError::from_store(e))
            }
            Err(e) => {
                timer.finish(e.label());
                self.note_fallback(&active, "update_status", &e);
                self.update_status_locally(kind, id, status).await
            }
        }
    }

    /// Apply the change to the local copy if there is one, and queue it for
    /// reconciliation either way.
    async fn update_status_locally(
        &self,
        kind: RecordKind,
        id: &str,
        status: &str,
    ) -> Result<Option<Record>, SyncError> {
        let updated = self
            .local
            .set_status(kind, id, status)
            .await
            .map_err(|e| exhausted("update_status", e))?;
        self.local
            .record_status_update(kind, id, status)
            .await
            .map_err(|e| exhausted("update_status", e))?;
        self.health.record_write(false);

        match &updated {
            Some(record) => self.invalidate_for(record),
            None => {
                // Unknown scope: drop every key of the kind
                self.cache.invalidate_prefix(&ScopeKey::kind_prefix(kind));
            }
        }
        Ok(updated)
    }

    /// Delete a record. Returns the removed record when one is known
    /// (remotely, or locally on the fallback path).
    pub async fn delete(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, SyncError> {
        let active = self.active().await;

        if active.is_local() {
            return self.delete_locally(kind, id).await;
        }

        let timer = crate::metrics::LatencyTimer::new(active.id.as_str(), "delete");
        match active.store.delete(kind, id).await {
            Ok(removed) => {
                timer.finish("success");
                self.health.record_success();
                self.health.record_write(true);
                self.invalidate_for(&removed);
                Ok(Some(removed))
            }
            Err(e) if e.is_caller_facing() => {
                timer.finish(e.label());
                Err(SyncError::from_store(e))
            }
            Err(e) => {
                timer.finish(e.label());
                self.note_fallback(&active, "delete", &e);
                self.delete_locally(kind, id).await
            }
        }
    }

    /// Drop the local copy if there is one. Records that only ever existed
    /// locally are gone for good (NotFound if already gone); anything else
    /// is queued so reconciliation can delete it upstream.
    async fn delete_locally(&self, kind: RecordKind, id: &str) -> Result<Option<Record>, SyncError> {
        let removed = self
            .local
            .remove(kind, id)
            .await
            .map_err(|e| exhausted("delete", e))?;
        if id.starts_with(LOCAL_ID_PREFIX) {
            if removed.is_none() {
                return Err(SyncError::NotFound {
                    kind,
                    id: id.to_string(),
                });
            }
        } else {
            self.local
                .record_delete(kind, id)
                .await
                .map_err(|e| exhausted("delete", e))?;
        }
        self.health.record_write(false);

        match &removed {
            Some(record) => self.invalidate_for(record),
            None => {
                self.cache.invalidate_prefix(&ScopeKey::kind_prefix(kind));
            }
        }
        Ok(removed)
    }

    /// Drop the cache keys a write to `record` can affect: the owner key(s),
    /// plus every public key of the kind for public records. Relation-set
    /// keys are left to expire.
    pub fn invalidate_for(&self, record: &Record) {
        let kind = record.kind;
        self.cache
            .invalidate(&ScopeKey::new(kind, ScopeDescriptor::owner(record.scope_owner())));
        if record.owner_id != record.scope_owner() {
            self.cache
                .invalidate(&ScopeKey::new(kind, ScopeDescriptor::owner(record.owner_id.as_str())));
        }
        if record.is_public() {
            self.cache.invalidate_prefix(&ScopeKey::public_prefix(kind));
        }
    }

    fn note_fallback(&self, active: &ActiveProvider, operation: &'static str, err: &StoreError) {
        warn!(
            provider = %active.id,
            operation,
            error = %err,
            "Remote call failed, using local store"
        );
        self.health.record_failure(active.id);
        crate::metrics::record_fallback(active.id.as_str(), operation);
    }
}

fn exhausted(operation: &str, err: StoreError) -> SyncError {
    crate::metrics::record_error("local", operation, err.label());
    SyncError::AllProvidersExhausted(format!("local store {} failed: {}", operation, err))
}
