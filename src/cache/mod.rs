// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read cache with per-scope expiry.
//!
//! Entries are keyed by the rendered [`ScopeKey`], so invalidation can match
//! every key of a kind, or every public-feed key, by prefix. The TTL comes
//! from the scope class, never from the caller.
//!
//! # Flow
//!
//! ```text
//! get(key)
//!   │
//!   ├─→ present and now < expires_at → hit
//!   │
//!   ├─→ present but expired → evict, miss
//!   │
//!   └─→ absent → miss
//! ```
//!
//! Expired entries nobody asks for are removed by the reaper task.
//!
//! # Read/invalidate races
//!
//! A fetch that started before a write may finish after the write has
//! invalidated its key. Such a fetch takes a [`CacheTicket`] before going to
//! the provider and stores through [`TtlCache::set_if_current`], which drops
//! the value if any invalidation covering the key happened in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::record::Record;
use crate::scope::{ScopeClass, ScopeKey};

/// Cached value with its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: String,
    pub data: T,
    pub cached_at: Instant,
    pub expires_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// TTL per scope class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    pub owner: Duration,
    pub relations: Duration,
    pub public: Duration,
}

impl TtlPolicy {
    #[must_use]
    pub fn ttl_for(&self, class: ScopeClass) -> Duration {
        match class {
            ScopeClass::Owner => self.owner,
            ScopeClass::Relations => self.relations,
            ScopeClass::Public => self.public,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            owner: Duration::from_secs(120),
            relations: Duration::from_secs(300),
            public: Duration::from_secs(300),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because they expired (on lookup or by the reaper)
    pub expired: u64,
    /// Entries dropped by explicit invalidation
    pub invalidated: u64,
    /// Current number of entries, including expired ones not yet reaped
    pub entry_count: usize,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

/// Invalidation epoch observed when a fetch started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CacheTicket(u64);

/// When each key, prefix and the whole cache were last invalidated.
///
/// Key marks are forgotten after `retention`; tickets older than the newest
/// forgotten mark are treated as stale.
#[derive(Default)]
struct Invalidations {
    epoch: u64,
    keys: HashMap<String, (u64, Instant)>,
    /// Bounded by the number of kinds: only kind and public prefixes are used
    prefixes: HashMap<String, u64>,
    cleared: u64,
    forgotten: u64,
}

impl Invalidations {
    fn bump(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn is_stale(&self, rendered: &str, ticket: CacheTicket) -> bool {
        let since = ticket.0;
        since < self.forgotten
            || self.cleared > since
            || self.keys.get(rendered).is_some_and(|(e, _)| *e > since)
            || self
                .prefixes
                .iter()
                .any(|(p, e)| *e > since && rendered.starts_with(p.as_str()))
    }
}

pub struct TtlCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
    /// Write-locked by invalidations, read-locked by conditional sets
    invalidations: RwLock<Invalidations>,
    policy: TtlPolicy,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    invalidated: AtomicU64,
}

/// The cache the facade uses for query results.
pub type RecordCache = TtlCache<Vec<Record>>;

impl<T: Clone> TtlCache<T> {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            invalidations: RwLock::new(Invalidations::default()),
            policy,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            invalidated: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn policy(&self) -> TtlPolicy {
        self.policy
    }

    /// Look up a live entry. Expired entries are evicted and count as a miss.
    pub fn get(&self, key: &ScopeKey) -> Option<T> {
        let rendered = key.render();
        let now = Instant::now();

        if let Some(entry) = self.entries.get(&rendered) {
            if entry.is_live(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_lookup(key.class(), true);
                return Some(entry.data.clone());
            }
            drop(entry); // Release read lock before removing
            if self.entries.remove_if(&rendered, |_, e| !e.is_live(now)).is_some() {
                self.expired.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_cache_lookup(key.class(), false);
        None
    }

    /// Take a ticket before fetching data meant for [`set_if_current`](Self::set_if_current).
    #[must_use]
    pub fn ticket(&self) -> CacheTicket {
        CacheTicket(self.invalidations.read().epoch)
    }

    /// Store `data` unless `key` was invalidated after `ticket` was taken.
    /// Returns whether the value was stored.
    pub fn set_if_current(&self, key: &ScopeKey, data: T, ticket: CacheTicket) -> bool {
        let rendered = key.render();
        // Held across the insert so no invalidation slips in between
        let invalidations = self.invalidations.read();
        if invalidations.is_stale(&rendered, ticket) {
            debug!(key = %rendered, "Dropped result of a fetch overtaken by invalidation");
            return false;
        }
        self.insert(rendered, key.class(), data);
        true
    }

    /// Store `data` under `key` with the TTL of the key's scope class.
    pub fn set(&self, key: &ScopeKey, data: T) {
        self.insert(key.render(), key.class(), data);
    }

    fn insert(&self, rendered: String, class: ScopeClass, data: T) {
        let now = Instant::now();
        let ttl = self.policy.ttl_for(class);
        self.entries.insert(
            rendered.clone(),
            CacheEntry {
                key: rendered,
                data,
                cached_at: now,
                expires_at: now + ttl,
            },
        );
    }

    /// Drop one key. Returns whether it was present.
    pub fn invalidate(&self, key: &ScopeKey) -> bool {
        let rendered = key.render();
        let mut invalidations = self.invalidations.write();
        let epoch = invalidations.bump();
        let removed = self.entries.remove(&rendered).is_some();
        invalidations.keys.insert(rendered, (epoch, Instant::now()));
        drop(invalidations);
        if removed {
            self.invalidated.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Drop every key starting with `prefix`. Returns how many were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut invalidations = self.invalidations.write();
        let epoch = invalidations.bump();
        invalidations.prefixes.insert(prefix.to_string(), epoch);
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before.saturating_sub(self.entries.len());
        drop(invalidations);
        self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            debug!(prefix = %prefix, removed, "Cache prefix invalidated");
        }
        removed
    }

    pub fn clear(&self) {
        let mut invalidations = self.invalidations.write();
        invalidations.cleared = invalidations.bump();
        let removed = self.entries.len();
        self.entries.clear();
        drop(invalidations);
        self.invalidated.fetch_add(removed as u64, Ordering::Relaxed);
    }

    /// Remove every expired entry. Returns how many were removed.
    ///
    /// Also forgets key invalidations older than the longest TTL.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        self.forget_invalidations(now);
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn forget_invalidations(&self, now: Instant) {
        let retention = self.policy.owner.max(self.policy.relations).max(self.policy.public);
        let mut invalidations = self.invalidations.write();
        let mut forgotten = invalidations.forgotten;
        invalidations.keys.retain(|_, (epoch, at)| {
            let keep = now.duration_since(*at) < retention;
            if !keep {
                forgotten = forgotten.max(*epoch);
            }
            keep
        });
        invalidations.forgotten = forgotten;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live entry exists, without touching the hit counters.
    #[must_use]
    pub fn contains(&self, key: &ScopeKey) -> bool {
        self.entries
            .get(&key.render())
            .map(|e| e.is_live(Instant::now()))
            .unwrap_or(false)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            expired: self.expired.load(Ordering::Relaxed),
            invalidated: self.invalidated.load(Ordering::Relaxed),
            entry_count: self.entries.len(),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

/// Spawn the background reaper. Stops when `shutdown` flips to true or its
/// sender is dropped.
pub fn spawn_reaper<T>(cache: Arc<TtlCache<T>>, every: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = cache.reap_expired();
                    if removed > 0 {
                        debug!(removed, remaining = cache.len(), "Reaped expired cache entries");
                    }
                    crate::metrics::set_cache_entries(cache.len());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Cache reaper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use crate::scope::ScopeDescriptor;

    fn owner_key(owner: &str) -> ScopeKey {
        ScopeKey::new(RecordKind::LogEntry, ScopeDescriptor::owner(owner))
    }

    fn public_key(limit: usize) -> ScopeKey {
        ScopeKey::new(RecordKind::LogEntry, ScopeDescriptor::public(limit))
    }

    #[tokio::test(start_paused = true)]
    async fn test_hit_then_expiry() {
        let cache: TtlCache<u32> = TtlCache::default();
        let key = owner_key("a@x");

        cache.set(&key, 7);
        assert_eq!(cache.get(&key), Some(7));

        tokio::time::advance(Duration::from_secs(119)).await;
        assert_eq!(cache.get(&key), Some(7));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&key), None);
        // Lazily evicted
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_by_scope_class() {
        let cache: TtlCache<u32> = TtlCache::default();
        let owner = owner_key("a@x");
        let public = public_key(50);
        cache.set(&owner, 1);
        cache.set(&public, 2);

        tokio::time::advance(Duration::from_secs(150)).await;
        assert!(cache.get(&owner).is_none());
        assert_eq!(cache.get(&public), Some(2));
    }

    #[test]
    fn test_invalidate_prefix_matches_only_prefix() {
        let cache: TtlCache<u32> = TtlCache::default();
        cache.set(&public_key(50), 1);
        cache.set(&public_key(10), 2);
        cache.set(&owner_key("a@x"), 3);
        cache.set(&ScopeKey::new(RecordKind::Comment, ScopeDescriptor::public(50)), 4);

        let removed = cache.invalidate_prefix(&ScopeKey::public_prefix(RecordKind::LogEntry));
        assert_eq!(removed, 2);
        assert!(cache.contains(&owner_key("a@x")));
        assert!(cache.contains(&ScopeKey::new(RecordKind::Comment, ScopeDescriptor::public(50))));
    }

    #[test]
    fn test_invalidate_single_key() {
        let cache: TtlCache<u32> = TtlCache::default();
        cache.set(&owner_key("a@x"), 1);
        cache.set(&owner_key("b@x"), 2);

        assert!(cache.invalidate(&owner_key("a@x")));
        assert!(!cache.invalidate(&owner_key("a@x")));
        assert!(cache.contains(&owner_key("b@x")));
        assert_eq!(cache.stats().invalidated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_expired() {
        let cache: TtlCache<u32> = TtlCache::default();
        cache.set(&owner_key("a@x"), 1);
        cache.set(&public_key(50), 2);

        tokio::time::advance(Duration::from_secs(121)).await;
        assert_eq!(cache.reap_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_task_runs_and_stops() {
        let cache: Arc<TtlCache<u32>> = Arc::new(TtlCache::default());
        cache.set(&owner_key("a@x"), 1);
        let (tx, rx) = watch::channel(false);

        let handle = spawn_reaper(cache.clone(), Duration::from_secs(60), rx);

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert!(cache.is_empty());

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_fetch_overtaken_by_invalidation_is_dropped() {
        let cache: TtlCache<u32> = TtlCache::default();
        let key = owner_key("a@x");

        // Fetch starts, a write lands and invalidates, the fetch finishes
        let ticket = cache.ticket();
        cache.invalidate(&key);
        assert!(!cache.set_if_current(&key, 1, ticket));
        assert!(!cache.contains(&key));

        // Fetches started after the write are cached normally
        let ticket = cache.ticket();
        assert!(cache.set_if_current(&key, 2, ticket));
        assert_eq!(cache.get(&key), Some(2));
    }

    #[test]
    fn test_invalidation_of_other_keys_does_not_block() {
        let cache: TtlCache<u32> = TtlCache::default();
        let ticket = cache.ticket();
        cache.invalidate(&owner_key("b@x"));
        cache.invalidate_prefix(&ScopeKey::public_prefix(RecordKind::Comment));

        assert!(cache.set_if_current(&owner_key("a@x"), 1, ticket));
    }

    #[test]
    fn test_prefix_and_clear_overtake_fetches() {
        let cache: TtlCache<u32> = TtlCache::default();

        let ticket = cache.ticket();
        cache.invalidate_prefix(&ScopeKey::public_prefix(RecordKind::LogEntry));
        assert!(!cache.set_if_current(&public_key(50), 1, ticket));
        assert!(cache.set_if_current(&owner_key("a@x"), 1, ticket));

        let ticket = cache.ticket();
        cache.clear();
        assert!(!cache.set_if_current(&owner_key("a@x"), 2, ticket));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_invalidations_stay_conservative() {
        let cache: TtlCache<u32> = TtlCache::default();
        let key = owner_key("a@x");

        let old = cache.ticket();
        cache.invalidate(&key);
        tokio::time::advance(Duration::from_secs(301)).await;
        cache.reap_expired();

        // The mark is gone, but a ticket from before it is still refused
        assert!(!cache.set_if_current(&key, 1, old));
        assert!(cache.set_if_current(&key, 2, cache.ticket()));
    }

    #[test]
    fn test_clear_and_hit_rate() {
        let cache: TtlCache<u32> = TtlCache::default();
        assert_eq!(cache.stats().hit_rate, 0.0);

        cache.set(&owner_key("a@x"), 1);
        cache.get(&owner_key("a@x"));
        cache.get(&owner_key("b@x"));
        assert_eq!(cache.stats().hit_rate, 0.5);

        cache.clear();
        assert!(cache.is_empty());
    }
}
