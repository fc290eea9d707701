// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry mapping provider ids to adapter instances.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::descriptor::ProviderId;
use crate::storage::traits::RecordStore;

struct ProviderEntry {
    store: Arc<dyn RecordStore>,
    configured: AtomicBool,
    registered_at: usize,
}

/// Remote providers in preference order, plus the local terminal fallback.
///
/// Entries are kept sorted most capable first; among equally capable
/// providers the one registered first wins.
pub struct ProviderRegistry {
    entries: RwLock<Vec<Arc<ProviderEntry>>>,
    local: Arc<dyn RecordStore>,
}

impl ProviderRegistry {
    /// Create a registry whose terminal fallback is `local`.
    pub fn new(local: Arc<dyn RecordStore>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            local,
        }
    }

    /// Register a remote provider. `configured` says whether its required
    /// configuration is present; unconfigured providers are never selected.
    ///
    /// Registering an id twice replaces the earlier entry.
    pub fn register(&self, store: Arc<dyn RecordStore>, configured: bool) {
        let id = store.descriptor().id;
        let mut entries = self.entries.write();
        let registered_at = entries
            .iter()
            .map(|e| e.registered_at + 1)
            .max()
            .unwrap_or(0);
        entries.retain(|e| e.store.descriptor().id != id);
        entries.push(Arc::new(ProviderEntry {
            store,
            configured: AtomicBool::new(configured),
            registered_at,
        }));
        entries.sort_by(|a, b| {
            b.store
                .descriptor()
                .capability_rank()
                .cmp(&a.store.descriptor().capability_rank())
                .then(a.registered_at.cmp(&b.registered_at))
        });
        debug!(provider = %id, configured, "Provider registered");
    }

    /// Flip whether a provider's configuration is present. Returns `false`
    /// for unknown ids.
    pub fn set_configured(&self, id: ProviderId, configured: bool) -> bool {
        let entries = self.entries.read();
        match entries.iter().find(|e| e.store.descriptor().id == id) {
            Some(entry) => {
                entry.configured.store(configured, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// First configured provider in preference order.
    pub(crate) fn first_configured(&self) -> Option<Arc<dyn RecordStore>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.configured.load(Ordering::Acquire))
            .map(|e| e.store.clone())
    }

    /// Look up a provider (including the local one) by id.
    #[must_use]
    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn RecordStore>> {
        if id.is_local() {
            return Some(self.local.clone());
        }
        self.entries
            .read()
            .iter()
            .find(|e| e.store.descriptor().id == id)
            .map(|e| e.store.clone())
    }

    #[must_use]
    pub fn is_configured(&self, id: ProviderId) -> bool {
        if id.is_local() {
            return true;
        }
        self.entries
            .read()
            .iter()
            .any(|e| e.store.descriptor().id == id && e.configured.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn local(&self) -> Arc<dyn RecordStore> {
        self.local.clone()
    }

    /// Ids in the order the selector evaluates them, local last.
    #[must_use]
    pub fn preference_order(&self) -> Vec<ProviderId> {
        let mut order: Vec<ProviderId> = self
            .entries
            .read()
            .iter()
            .map(|e| e.store.descriptor().id)
            .collect();
        order.push(ProviderId::LOCAL);
        order
    }
}
