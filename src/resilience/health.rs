//! Remote provider health and the degraded-mode flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::provider::ProviderId;

/// Consecutive failures before the active provider is reported unhealthy.
const UNHEALTHY_AFTER: u64 = 3;

/// Snapshot for status panels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub degraded: bool,
    pub consecutive_failures: u64,
    pub total_fallbacks: u64,
    pub last_failed_provider: Option<ProviderId>,
}

/// Tracks remote call outcomes.
///
/// Health is informational only: it never demotes the selected provider.
/// `degraded` reflects the most recent write, true when it was not
/// confirmed by a remote provider.
pub struct ProviderHealth {
    healthy: AtomicBool,
    degraded: AtomicBool,
    failures: AtomicU64,
    fallbacks: AtomicU64,
    last_failed: Mutex<Option<ProviderId>>,
}

impl ProviderHealth {
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true), // Assume healthy until proven otherwise
            degraded: AtomicBool::new(false),
            failures: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            last_failed: Mutex::new(None),
        }
    }

    /// Record a successful remote call.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
    }

    /// Record a failed remote call that went to the local fallback.
    pub fn record_failure(&self, provider: ProviderId) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= UNHEALTHY_AFTER {
            self.healthy.store(false, Ordering::Release);
        }
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        *self.last_failed.lock() = Some(provider);
    }

    /// Record the outcome of a write.
    pub fn record_write(&self, confirmed_remotely: bool) {
        self.degraded.store(!confirmed_remotely, Ordering::Release);
        crate::metrics::set_degraded(!confirmed_remotely);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Get consecutive failure count.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            healthy: self.is_healthy(),
            degraded: self.is_degraded(),
            consecutive_failures: self.failure_count(),
            total_fallbacks: self.fallbacks.load(Ordering::Relaxed),
            last_failed_provider: *self.last_failed.lock(),
        }
    }
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self::new()
    }
}
