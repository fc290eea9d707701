// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The record-sync facade.
//!
//! [`RecordSync`] is the only entry point. It ties together:
//! - the provider registry and selector
//! - the read cache and its reaper
//! - the resilience wrapper (remote first, local fallback)
//! - the subscription registry
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use record_sync::{EngineState, Record, RecordKind, RecordSync, SyncConfig, Visibility};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), record_sync::SyncError> {
//! let config = SyncConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     local_path: Some("./record_sync_local.db".into()),
//!     ..Default::default()
//! };
//! let sync = RecordSync::open(config).await?;
//! sync.start();
//! assert_eq!(sync.state(), EngineState::Running);
//!
//! let entry = Record::new(RecordKind::LogEntry, "a@example.com", json!({"rating": 4}))
//!     .with_visibility(Visibility::Public);
//! let id = sync.create(&entry).await?;
//! let mine = sync.get_owned(RecordKind::LogEntry, "a@example.com").await?;
//! assert!(mine.iter().any(|r| r.id == id));
//!
//! sync.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod subscribe_api;
mod types;

pub use types::{EngineState, SyncError};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::RecordCache;
use crate::config::SyncConfig;
use crate::provider::{AlwaysOnline, ConnectivityProbe, ProviderRegistry, ProviderSelector, SelectorState};
use crate::resilience::fallback::ResilientStore;
use crate::resilience::health::ProviderHealth;
use crate::resilience::local_store::{LocalStore, SqliteLocalStore};
use crate::storage::local::LocalRecordStore;
use crate::storage::redis::RedisRecordStore;
use crate::storage::sql::{SqlRecordStore, SqlStoreOptions};
use crate::storage::traits::{RecordStore, StoreError};
use crate::subscription::SubscriptionRegistry;

/// Multi-provider record store with caching, change notification and a
/// local fallback.
///
/// # Thread Safety
///
/// `RecordSync` is `Send + Sync`; share it behind an `Arc`. Every call takes
/// `&self`.
pub struct RecordSync {
    pub(super) config: SyncConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) registry: Arc<ProviderRegistry>,
    pub(super) selector: Arc<ProviderSelector>,
    pub(super) cache: Arc<RecordCache>,
    pub(super) local: Arc<dyn LocalStore>,

    /// Try-remote, fall-back-to-local for every CRUD call and subscription read
    pub(super) store: Arc<ResilientStore>,

    pub(super) subscriptions: Arc<SubscriptionRegistry>,

    /// Flipped to true on shutdown; dropping it stops every background task
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Assembles a [`RecordSync`] from configuration plus injected parts.
pub struct RecordSyncBuilder {
    config: SyncConfig,
    providers: Vec<Arc<dyn RecordStore>>,
    local: Option<Arc<dyn LocalStore>>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    selector_state: Option<Arc<SelectorState>>,
}

impl RecordSyncBuilder {
    /// Register an extra provider. Ranked with the configured ones by
    /// capability.
    #[must_use]
    pub fn provider(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.providers.push(store);
        self
    }

    /// Use `local` instead of the SQLite store named by `local_path`.
    #[must_use]
    pub fn local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    #[must_use]
    pub fn connectivity(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share a selection state (defaults to a fresh one per instance).
    #[must_use]
    pub fn selector_state(mut self, state: Arc<SelectorState>) -> Self {
        self.selector_state = Some(state);
        self
    }

    pub async fn build(self) -> Result<RecordSync, SyncError> {
        let config = self.config;
        config.validate()?;

        let local: Arc<dyn LocalStore> = match self.local {
            Some(local) => local,
            None => open_local(&config).await?,
        };

        let registry = Arc::new(ProviderRegistry::new(Arc::new(LocalRecordStore::new(local.clone()))));
        for store in configured_providers(&config)? {
            registry.register(store, true);
        }
        for store in self.providers {
            registry.register(store, true);
        }
        info!(providers = ?registry.preference_order(), "Provider registry ready");

        let selector = Arc::new(ProviderSelector::new(
            registry.clone(),
            self.selector_state.unwrap_or_default(),
            self.probe.unwrap_or_else(|| Arc::new(AlwaysOnline)),
            config.selection_ttl(),
        ));
        selector.set_force_offline(config.force_offline);

        let cache = Arc::new(RecordCache::new(config.ttl_policy()));
        let store = Arc::new(ResilientStore::new(
            selector.clone(),
            cache.clone(),
            Arc::new(ProviderHealth::new()),
            local.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let subscriptions = SubscriptionRegistry::new(store.clone(), shutdown_rx);
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        Ok(RecordSync {
            config,
            state: state_tx,
            state_rx,
            registry,
            selector,
            cache,
            local,
            store,
            subscriptions,
            shutdown_tx,
            reaper: Mutex::new(None),
        })
    }
}

async fn open_local(config: &SyncConfig) -> Result<Arc<dyn LocalStore>, SyncError> {
    let opened = match &config.local_path {
        Some(path) => SqliteLocalStore::open(path).await,
        None => SqliteLocalStore::in_memory().await,
    };
    let local = opened.map_err(|e| SyncError::AllProvidersExhausted(format!("local store: {}", e)))?;
    Ok(Arc::new(local))
}

/// Adapters for the URLs present in `config`. Nothing connects yet.
fn configured_providers(config: &SyncConfig) -> Result<Vec<Arc<dyn RecordStore>>, SyncError> {
    let mut providers: Vec<Arc<dyn RecordStore>> = Vec::new();

    if let Some(url) = &config.redis_url {
        let store = RedisRecordStore::new(url, config.redis_prefix.as_deref(), config.max_payload_bytes)
            .map_err(remote_setup_error)?;
        providers.push(Arc::new(store));
    }

    if let Some(url) = &config.sql_url {
        let options = SqlStoreOptions {
            max_batch_size: config.sql_max_batch_size,
            max_payload_bytes: config.max_payload_bytes,
            ..Default::default()
        };
        let store = SqlRecordStore::connect_lazy(url, options).map_err(remote_setup_error)?;
        providers.push(Arc::new(store));
    }

    Ok(providers)
}

fn remote_setup_error(err: StoreError) -> SyncError {
    SyncError::RemoteUnavailable(err.to_string())
}

impl RecordSync {
    /// Start assembling an instance.
    #[must_use]
    pub fn builder(config: SyncConfig) -> RecordSyncBuilder {
        RecordSyncBuilder {
            config,
            providers: Vec::new(),
            local: None,
            probe: None,
            selector_state: None,
        }
    }

    /// Build from configuration alone. Remote adapters connect lazily, so
    /// this succeeds while the network is down.
    pub async fn open(config: SyncConfig) -> Result<Self, SyncError> {
        Self::builder(config).build().await
    }

    /// Get current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The provider registry, for toggling configuration at runtime.
    #[must_use]
    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }
}
