// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change notification, normalized across providers.
//!
//! Every active `(kind, scope)` key owns exactly one worker task. Further
//! subscribers to the same key join it and are counted; the worker stops
//! when the last one cancels.
//!
//! ```text
//! subscribe(key)
//!   │
//!   ├─ key active? ──→ join, replay last snapshot
//!   │
//!   └─ spawn worker
//!        ├─ provider has native push → register once, debounce, re-fetch
//!        │                             (feed lost → poll from then on)
//!        └─ otherwise               → poll, diff, notify on change
//! ```
//!
//! Fetches go through the resilience wrapper, so a subscriber keeps seeing
//! the local copy (including its own offline writes) while the remote is
//! down. Callbacks receive the full snapshot, only when it differs
//! structurally from the last one delivered for that key.

mod timing;
mod worker;

pub use timing::{debounce_window, poll_interval};

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{watch, Notify};
use tracing::{debug, info};

use crate::record::{Record, RecordKind};
use crate::resilience::fallback::ResilientStore;
use crate::scope::ScopeKey;
use crate::storage::local::LOCAL_ID_PREFIX;

/// Receives the current snapshot of a subscribed scope.
pub type SnapshotCallback = Arc<dyn Fn(&[Record]) + Send + Sync>;

/// Delivery gate of one listener.
///
/// Callbacks run while holding it and `cancel` closes it under the same
/// lock: once `cancel` returns, no callback of that listener is running on
/// another thread or will start. The lock is re-entrant so a callback may
/// cancel its own handle.
struct ListenerGate {
    open: ReentrantMutex<Cell<bool>>,
}

impl ListenerGate {
    fn new() -> Self {
        Self {
            open: ReentrantMutex::new(Cell::new(true)),
        }
    }

    /// Run `callback` if the gate is open. Returns whether it ran.
    fn deliver(&self, callback: &SnapshotCallback, snapshot: &[Record]) -> bool {
        let open = self.open.lock();
        if !open.get() {
            return false;
        }
        callback(snapshot);
        true
    }

    /// Close the gate, returning whether it was open.
    fn close(&self) -> bool {
        self.open.lock().replace(false)
    }

    fn is_open(&self) -> bool {
        self.open.lock().get()
    }
}

struct ListenerEntry {
    id: u64,
    gate: Arc<ListenerGate>,
    callback: SnapshotCallback,
}

/// Bookkeeping for one active key.
pub(crate) struct Subscription {
    key: ScopeKey,
    listeners: Mutex<Vec<ListenerEntry>>,
    last_observed: Mutex<Option<Vec<Record>>>,
    wake: Notify,
    /// Set by push events and triggers, cleared right before a fetch
    dirty: AtomicBool,
    push: AtomicBool,
    closed: AtomicBool,
    cancel: watch::Sender<bool>,
}

impl Subscription {
    fn new(key: ScopeKey, cancel: watch::Sender<bool>) -> Self {
        Self {
            key,
            listeners: Mutex::new(Vec::new()),
            last_observed: Mutex::new(None),
            wake: Notify::new(),
            dirty: AtomicBool::new(false),
            push: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel,
        }
    }

    pub(crate) fn key(&self) -> &ScopeKey {
        &self.key
    }

    fn add(&self, entry: ListenerEntry) {
        self.listeners.lock().push(entry);
    }

    /// Remove a listener, returning how many remain.
    fn remove(&self, id: u64) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.id != id);
        listeners.len()
    }

    fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Ask the worker to re-fetch.
    pub(crate) fn wake(&self) {
        self.dirty.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.cancel.send(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_push(&self) -> bool {
        self.push.load(Ordering::Acquire)
    }

    /// Record a fetched snapshot and deliver it if it changed.
    /// Returns whether listeners were notified.
    pub(crate) fn observe(&self, snapshot: Vec<Record>) -> bool {
        if self.is_closed() {
            return false;
        }
        {
            let mut last = self.last_observed.lock();
            if last.as_ref() == Some(&snapshot) {
                return false;
            }
            *last = Some(snapshot.clone());
        }

        // Callbacks run without holding the listener lock so they may cancel
        // or subscribe re-entrantly
        let targets: Vec<(Arc<ListenerGate>, SnapshotCallback)> = self
            .listeners
            .lock()
            .iter()
            .map(|l| (l.gate.clone(), l.callback.clone()))
            .collect();

        for (gate, callback) in targets {
            if self.is_closed() {
                break;
            }
            gate.deliver(&callback, &snapshot);
        }
        true
    }
}

/// Handle returned by `subscribe`.
///
/// Cancelling is explicit: dropping the handle leaves the subscription
/// running until the registry shuts down.
pub struct SubscriptionHandle {
    key: ScopeKey,
    listener_id: u64,
    gate: Arc<ListenerGate>,
    registry: Weak<SubscriptionRegistry>,
}

impl SubscriptionHandle {
    /// Stop receiving callbacks. A second call is a no-op.
    ///
    /// If this listener's callback is running on another thread, waits for
    /// it to return. Two callbacks cancelling each other's handles from
    /// different threads deadlock.
    pub fn cancel(&self) {
        if !self.gate.close() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.key, self.listener_id);
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    #[must_use]
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key.render())
            .field("active", &self.is_active())
            .finish()
    }
}

/// Reference-counted subscriptions keyed by `(kind, scope)`.
pub struct SubscriptionRegistry {
    subs: DashMap<ScopeKey, Arc<Subscription>>,
    next_listener: AtomicU64,
    store: Arc<ResilientStore>,
    shutdown: watch::Receiver<bool>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<ResilientStore>, shutdown: watch::Receiver<bool>) -> Arc<Self> {
        Arc::new(Self {
            subs: DashMap::new(),
            next_listener: AtomicU64::new(1),
            store,
            shutdown,
        })
    }

    /// Join or start the subscription for `key`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(self: &Arc<Self>, key: ScopeKey, callback: SnapshotCallback) -> SubscriptionHandle {
        let listener_id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(ListenerGate::new());
        let entry = ListenerEntry {
            id: listener_id,
            gate: gate.clone(),
            callback: callback.clone(),
        };

        let sub = match self.subs.entry(key.clone()) {
            Entry::Occupied(e) => {
                e.get().add(entry);
                debug!(key = %key, listeners = e.get().listener_count(), "Joined existing subscription");
                e.get().clone()
            }
            Entry::Vacant(v) => {
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let sub = Arc::new(Subscription::new(key.clone(), cancel_tx));
                sub.add(entry);
                v.insert(sub.clone());

                tokio::spawn(worker::run(sub.clone(), self.store.clone(), cancel_rx, self.shutdown.clone()));
                info!(key = %key, "Subscription started");
                sub
            }
        };
        crate::metrics::set_active_subscriptions(self.subs.len());

        // New subscribers see the last snapshot right away
        let replay = sub.last_observed.lock().clone();
        if let Some(snapshot) = replay {
            gate.deliver(&callback, &snapshot);
        }

        SubscriptionHandle {
            key,
            listener_id,
            gate,
            registry: Arc::downgrade(self),
        }
    }

    fn release(&self, key: &ScopeKey, listener_id: u64) {
        if let Entry::Occupied(e) = self.subs.entry(key.clone()) {
            let remaining = e.get().remove(listener_id);
            if remaining == 0 {
                e.get().close();
                e.remove();
                info!(key = %key, "Subscription stopped");
            } else {
                debug!(key = %key, remaining, "Subscriber left");
            }
        }
        crate::metrics::set_active_subscriptions(self.subs.len());
    }

    /// Wake every poll-path subscription whose scope could include `record`.
    /// Push-path subscriptions are woken too when the record only exists
    /// locally, since their native feed never hears of it.
    /// Returns how many were woken.
    pub fn trigger(&self, kind: RecordKind, record: &Record) -> usize {
        let local_only = record.id.starts_with(LOCAL_ID_PREFIX);
        let mut woken = 0;
        for entry in self.subs.iter() {
            let sub = entry.value();
            if sub.key().kind == kind
                && (local_only || !sub.is_push())
                && sub.key().scope.could_include(record)
            {
                sub.wake();
                woken += 1;
            }
        }
        if woken > 0 {
            debug!(kind = %kind, woken, "Poll subscriptions triggered");
        }
        woken
    }

    /// Number of keys with a running worker.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.subs.len()
    }

    #[must_use]
    pub fn listener_count(&self, key: &ScopeKey) -> usize {
        self.subs.get(key).map(|s| s.listener_count()).unwrap_or(0)
    }

    /// Stop every worker and forget all subscriptions.
    pub fn close_all(&self) {
        for entry in self.subs.iter() {
            entry.value().close();
        }
        self.subs.clear();
        crate::metrics::set_active_subscriptions(0);
    }
}
