// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Provider selection.
//!
//! The decision is made once and cached for a TTL (10 minutes by default):
//!
//! ```text
//! select()
//!   │
//!   ├─ cached decision still fresh? ──────────────→ reuse it
//!   │
//!   ├─ offline (probe or forced)? ────────────────→ local
//!   │
//!   └─ first configured provider in preference order, else local
//! ```
//!
//! No live round-trip is made to a remote provider while selecting. A
//! provider that fails at call time is not demoted: the resilience wrapper
//! falls back to local storage per call until the TTL runs out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::descriptor::{ProviderDescriptor, ProviderId};
use super::registry::ProviderRegistry;
use crate::storage::traits::RecordStore;

/// Reports whether the runtime currently has network connectivity.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_online(&self) -> bool;
}

/// Probe for environments without a connectivity signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn is_online(&self) -> bool {
        true
    }
}

/// Probe driven by the host application (e.g. from OS network events).
#[derive(Debug)]
pub struct ManualConnectivity {
    online: AtomicBool,
}

impl ManualConnectivity {
    #[must_use]
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }
}

#[async_trait]
impl ConnectivityProbe for ManualConnectivity {
    async fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }
}

/// A cached provider decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSelection {
    pub provider_id: ProviderId,
    pub decided_at: Instant,
    pub ttl: Duration,
}

impl ProviderSelection {
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.decided_at.elapsed() < self.ttl
    }
}

/// Selection state owned by one facade instance.
#[derive(Debug, Default)]
pub struct SelectorState {
    current: RwLock<Option<ProviderSelection>>,
    last_provider: RwLock<Option<ProviderId>>,
}

impl SelectorState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Option<ProviderSelection> {
        *self.current.read()
    }

    fn fresh(&self) -> Option<ProviderSelection> {
        self.current().filter(ProviderSelection::is_fresh)
    }

    /// Store a decision, returning the previously active provider when it differs.
    fn record(&self, selection: ProviderSelection) -> Option<ProviderId> {
        *self.current.write() = Some(selection);
        let mut last = self.last_provider.write();
        let previous = last.replace(selection.provider_id);
        previous.filter(|p| *p != selection.provider_id)
    }

    pub fn invalidate(&self) {
        *self.current.write() = None;
    }
}

/// The provider serving the current call.
#[derive(Clone)]
pub struct ActiveProvider {
    pub id: ProviderId,
    pub store: Arc<dyn RecordStore>,
    /// Set when this call produced a new decision that replaced another provider
    pub switched_from: Option<ProviderId>,
}

impl ActiveProvider {
    #[must_use]
    pub fn descriptor(&self) -> &ProviderDescriptor {
        self.store.descriptor()
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.id.is_local()
    }
}

impl std::fmt::Debug for ActiveProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveProvider")
            .field("id", &self.id)
            .field("switched_from", &self.switched_from)
            .finish()
    }
}

pub struct ProviderSelector {
    registry: Arc<ProviderRegistry>,
    state: Arc<SelectorState>,
    probe: Arc<dyn ConnectivityProbe>,
    ttl: Duration,
    force_offline: AtomicBool,
    /// Serializes fresh decisions so concurrent first calls probe once
    deciding: Mutex<()>,
}

impl ProviderSelector {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        state: Arc<SelectorState>,
        probe: Arc<dyn ConnectivityProbe>,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            state,
            probe,
            ttl,
            force_offline: AtomicBool::new(false),
            deciding: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn state(&self) -> &Arc<SelectorState> {
        &self.state
    }

    /// Pin the selection to local storage regardless of connectivity.
    /// Takes effect at the next decision; pair with [`invalidate`](Self::invalidate).
    pub fn set_force_offline(&self, offline: bool) {
        self.force_offline.store(offline, Ordering::Release);
    }

    /// Resolve the active provider, reusing the cached decision while fresh.
    pub async fn select(&self) -> ActiveProvider {
        if let Some(active) = self.cached() {
            return active;
        }

        let _guard = self.deciding.lock().await;
        // Another caller may have decided while we waited
        if let Some(active) = self.cached() {
            return active;
        }

        let online = !self.force_offline.load(Ordering::Acquire) && self.probe.is_online().await;
        let store = if online {
            self.registry.first_configured().unwrap_or_else(|| self.registry.local())
        } else {
            self.registry.local()
        };
        let id = store.descriptor().id;

        let switched_from = self.state.record(ProviderSelection {
            provider_id: id,
            decided_at: Instant::now(),
            ttl: self.ttl,
        });

        info!(
            provider = %id,
            online,
            ttl_secs = self.ttl.as_secs(),
            switched_from = ?switched_from,
            "Provider selected"
        );
        crate::metrics::set_active_provider(id.as_str());

        ActiveProvider {
            id,
            store,
            switched_from,
        }
    }

    fn cached(&self) -> Option<ActiveProvider> {
        let selection = self.state.fresh()?;
        if !self.registry.is_configured(selection.provider_id) {
            debug!(provider = %selection.provider_id, "Cached provider no longer configured");
            return None;
        }
        let store = self.registry.get(selection.provider_id)?;
        Some(ActiveProvider {
            id: selection.provider_id,
            store,
            switched_from: None,
        })
    }

    /// Drop the cached decision; the next call re-selects.
    pub fn invalidate(&self) {
        self.state.invalidate();
        info!("Provider selection invalidated");
    }
}
