// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The uniform contract every provider adapter implements.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::provider::ProviderDescriptor;
use crate::record::{sort_newest_first, Record, RecordKind, VisibilityFilter};
use crate::scope::{ScopeDescriptor, ScopeKey};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Transport or connectivity failure, including timeouts
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The backend refused the payload (size limit, schema)
    #[error("payload rejected: {0}")]
    Rejected(String),
    #[error("{kind} '{id}' not found")]
    NotFound { kind: RecordKind, id: String },
    /// The backend answered with something we could not decode
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Errors the caller must see; everything else goes to the local fallback.
    #[must_use]
    pub fn is_caller_facing(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::NotFound { .. })
    }

    /// Label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
            Self::NotFound { .. } => "not_found",
            Self::Malformed(_) => "malformed",
            Self::Backend(_) => "backend",
        }
    }
}

/// Invoked by a push-capable provider whenever something under a
/// subscribed scope may have changed. Carries no data: the listener re-fetches.
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Liveness of a native change feed, shared by the adapter's listener task
/// and the [`PushRegistration`] it hands out.
///
/// An adapter whose feed stops (connection dropped, channel closed) calls
/// [`end`](Self::end) and then the change callback once, so the listener
/// wakes, sees the feed is gone and stops relying on it.
#[derive(Debug, Clone, Default)]
pub struct FeedStatus {
    ended: Arc<AtomicBool>,
}

impl FeedStatus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn end(&self) {
        self.ended.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// Handle to a native push listener. Cancelling (or dropping) unregisters it.
pub struct PushRegistration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
    feed: FeedStatus,
}

impl PushRegistration {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
            feed: FeedStatus::new(),
        }
    }

    /// Report the liveness of the feed behind this registration.
    #[must_use]
    pub fn with_feed(mut self, feed: FeedStatus) -> Self {
        self.feed = feed;
        self
    }

    /// Whether the adapter's feed stopped delivering events.
    #[must_use]
    pub fn feed_ended(&self) -> bool {
        self.feed.has_ended()
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for PushRegistration {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for PushRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRegistration")
            .field("active", &self.cancel.is_some())
            .field("feed_ended", &self.feed_ended())
            .finish()
    }
}

/// Record store contract implemented by every provider adapter.
///
/// Query results are always newest first. Adapters whose backend gives no
/// ordering guarantee sort client-side.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Static capability metadata for this provider.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Persist a new record, returning the provider-assigned id.
    async fn create(&self, record: &Record) -> Result<String, StoreError>;

    /// Records listed under `owner_id` (see [`Record::scope_owner`]).
    async fn query_by_owner(&self, kind: RecordKind, owner_id: &str) -> Result<Vec<Record>, StoreError>;

    /// Records authored by any of `owner_ids` passing `filter`.
    ///
    /// Batch limits of the backend are hidden from the caller.
    async fn query_by_owner_set(
        &self,
        kind: RecordKind,
        owner_ids: &[String],
        filter: &VisibilityFilter,
    ) -> Result<Vec<Record>, StoreError>;

    /// Newest public records, at most `limit`.
    async fn query_public(&self, kind: RecordKind, limit: usize) -> Result<Vec<Record>, StoreError>;

    /// Change a record's status. Fails with [`StoreError::NotFound`] when the
    /// id does not exist at this provider. Returns the updated record.
    async fn update_status(&self, kind: RecordKind, id: &str, status: &str) -> Result<Record, StoreError>;

    /// Remove a record, returning what was removed. Fails with
    /// [`StoreError::NotFound`] when the id does not exist at this provider.
    async fn delete(&self, kind: RecordKind, id: &str) -> Result<Record, StoreError>;

    /// Native push surface, present only on push-capable providers.
    fn as_push(&self) -> Option<&dyn PushStore> {
        None
    }
}

/// Native change notification offered by push-capable providers.
#[async_trait]
pub trait PushStore: Send + Sync {
    async fn subscribe(
        &self,
        kind: RecordKind,
        scope: &ScopeDescriptor,
        on_change: ChangeCallback,
    ) -> Result<PushRegistration, StoreError>;
}

/// Read everything a scope key covers from `store`.
pub async fn query_scope(store: &dyn RecordStore, key: &ScopeKey) -> Result<Vec<Record>, StoreError> {
    match &key.scope {
        ScopeDescriptor::Owner(owner) => store.query_by_owner(key.kind, owner).await,
        ScopeDescriptor::Relations { ids, filter } => store.query_by_owner_set(key.kind, ids, filter).await,
        ScopeDescriptor::Public { limit } => store.query_public(key.kind, *limit).await,
    }
}

/// Run a set-membership query in chunks of at most `max_batch_size` ids,
/// concurrently, then merge, de-duplicate by id and sort newest first.
///
/// A `None` batch size sends every id in one query.
pub async fn query_in_batches<F, Fut>(
    owner_ids: &[String],
    max_batch_size: Option<usize>,
    fetch: F,
) -> Result<Vec<Record>, StoreError>
where
    F: Fn(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<Record>, StoreError>>,
{
    if owner_ids.is_empty() {
        return Ok(Vec::new());
    }

    let chunk = max_batch_size.filter(|n| *n > 0).unwrap_or(owner_ids.len());
    let batches = owner_ids.chunks(chunk).map(|c| fetch(c.to_vec()));
    let results = futures::future::try_join_all(batches).await?;

    let mut seen = HashSet::new();
    let mut merged: Vec<Record> = results
        .into_iter()
        .flatten()
        .filter(|r| seen.insert(r.id.clone()))
        .collect();
    sort_newest_first(&mut merged);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn entry(id: &str, owner: &str, ts: i64) -> Record {
        let mut r = Record::new(RecordKind::LogEntry, owner, json!({}));
        r.id = id.to_string();
        r.timestamp = ts;
        r
    }

    #[tokio::test]
    async fn test_batches_respect_limit() {
        let ids: Vec<String> = (0..23).map(|i| format!("user-{}", i)).collect();
        let calls = AtomicUsize::new(0);
        let largest = AtomicUsize::new(0);

        let result = query_in_batches(&ids, Some(10), |batch| {
            calls.fetch_add(1, Ordering::SeqCst);
            largest.fetch_max(batch.len(), Ordering::SeqCst);
            async move {
                Ok(batch
                    .iter()
                    .enumerate()
                    .map(|(i, owner)| entry(&format!("{}-e", owner), owner, i as i64))
                    .collect())
            }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(largest.load(Ordering::SeqCst), 10);
        assert_eq!(result.len(), 23);
    }

    #[tokio::test]
    async fn test_unbounded_sends_single_query() {
        let ids: Vec<String> = (0..50).map(|i| format!("user-{}", i)).collect();
        let calls = AtomicUsize::new(0);

        query_in_batches(&ids, None, |_batch| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Vec::new()) }
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_merge_dedups_and_sorts() {
        let ids = vec!["a".to_string(), "b".to_string()];

        let result = query_in_batches(&ids, Some(1), |batch| async move {
            // Both batches return the shared record
            Ok(vec![entry("shared", "a", 5), entry(&format!("{}-own", batch[0]), &batch[0], 10)])
        })
        .await
        .unwrap();

        let ids: Vec<&str> = result.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a-own", "b-own", "shared"]);
    }

    #[tokio::test]
    async fn test_empty_owner_set_skips_backend() {
        let calls = AtomicUsize::new(0);
        let result = query_in_batches(&[], Some(10), |_batch| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Vec::new()) }
        })
        .await
        .unwrap();

        assert!(result.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_any_batch_failure_fails_query() {
        let ids: Vec<String> = (0..4).map(|i| i.to_string()).collect();
        let result = query_in_batches(&ids, Some(2), |batch| async move {
            if batch.contains(&"3".to_string()) {
                Err(StoreError::Unavailable("connection reset".into()))
            } else {
                Ok(Vec::new())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), StoreError::Unavailable("connection reset".into()));
    }

    #[test]
    fn test_push_registration_cancels_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let reg = PushRegistration::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        reg.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        {
            let _reg = PushRegistration::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_feed_status_is_shared() {
        let feed = FeedStatus::new();
        let reg = PushRegistration::new(|| {}).with_feed(feed.clone());
        assert!(!reg.feed_ended());

        feed.end();
        assert!(reg.feed_ended());
        // Plain registrations report a live feed
        assert!(!PushRegistration::new(|| {}).feed_ended());
    }
}
