// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for record-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for installing an exporter.
//!
//! # Metric Naming Convention
//! - `record_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `provider`: redis, sql, memory, local, ...
//! - `operation`: create, read, update_status, subscription_fetch
//! - `status`: success, unavailable, rejected, not_found, malformed, backend
//! - `scope`: owner, relations, public
//! - `kind`: log_entry, comment, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::record::RecordKind;
use crate::scope::ScopeClass;
use crate::storage::traits::StoreError;

// ═══════════════════════════════════════════════════════════════════════════
// PROVIDERS - Remote calls and selection
// ═══════════════════════════════════════════════════════════════════════════

/// Record a provider call outcome
pub fn record_operation(provider: &str, operation: &str, status: &str) {
    counter!(
        "record_sync_operations_total",
        "provider" => provider.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record provider call latency
pub fn record_latency(provider: &str, operation: &str, duration: Duration) {
    histogram!(
        "record_sync_operation_seconds",
        "provider" => provider.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a failed provider call outside the CRUD path
pub fn record_remote_error(provider: &str, operation: &str, err: &StoreError) {
    record_operation(provider, operation, err.label());
}

/// Record an error with category for alerting
pub fn record_error(provider: &str, operation: &str, error_type: &str) {
    counter!(
        "record_sync_errors_total",
        "provider" => provider.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a call that went to the local store after a remote failure
pub fn record_fallback(provider: &str, operation: &str) {
    counter!(
        "record_sync_fallbacks_total",
        "provider" => provider.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Track which provider is serving (1 for the active one)
pub fn set_active_provider(provider: &str) {
    counter!(
        "record_sync_provider_selections_total",
        "provider" => provider.to_string()
    )
    .increment(1);
    gauge!(
        "record_sync_active_provider",
        "provider" => provider.to_string()
    )
    .set(1.0);
}

/// Set degraded mode (1 = last write not confirmed remotely)
pub fn set_degraded(degraded: bool) {
    gauge!("record_sync_degraded").set(if degraded { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cache lookup
pub fn record_cache_lookup(scope: ScopeClass, hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "record_sync_cache_lookups_total",
        "scope" => scope.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("record_sync_cache_entries").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SUBSCRIPTIONS
// ═══════════════════════════════════════════════════════════════════════════

/// Set number of subscribed keys with a running worker
pub fn set_active_subscriptions(count: usize) {
    gauge!("record_sync_active_subscriptions").set(count as f64);
}

/// Record one poll of a poll-path subscription
pub fn record_poll_tick(kind: RecordKind) {
    counter!(
        "record_sync_poll_ticks_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

/// Record a changed snapshot delivered to subscribers
pub fn record_notification(kind: RecordKind) {
    counter!(
        "record_sync_notifications_total",
        "kind" => kind.as_str()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a facade state transition
pub fn set_engine_state(state: &str) {
    counter!(
        "record_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set records waiting for reconciliation
pub fn set_pending_sync(kind: RecordKind, count: usize) {
    gauge!(
        "record_sync_pending_records",
        "kind" => kind.as_str()
    )
    .set(count as f64);
}

/// A timing guard for one provider call.
///
/// Call [`finish`](Self::finish) with the outcome; a timer dropped without
/// finishing still records its latency.
pub struct LatencyTimer {
    provider: &'static str,
    operation: &'static str,
    start: Instant,
    finished: bool,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(provider: &'static str, operation: &'static str) -> Self {
        Self {
            provider,
            operation,
            start: Instant::now(),
            finished: false,
        }
    }

    /// Record latency and the call's outcome.
    pub fn finish(mut self, status: &str) {
        self.finished = true;
        record_latency(self.provider, self.operation, self.start.elapsed());
        record_operation(self.provider, self.operation, status);
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        if !self.finished {
            record_latency(self.provider, self.operation, self.start.elapsed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only verify the calls don't panic without an installed recorder.

    #[test]
    fn test_provider_metrics() {
        record_operation("redis", "create", "success");
        record_latency("sql", "read", Duration::from_millis(5));
        record_remote_error("redis", "subscription_fetch", &StoreError::Unavailable("reset".into()));
        record_error("local", "create", "backend");
        record_fallback("redis", "create");
        set_active_provider("local");
        set_degraded(true);
        set_degraded(false);
    }

    #[test]
    fn test_cache_and_subscription_metrics() {
        record_cache_lookup(ScopeClass::Owner, true);
        record_cache_lookup(ScopeClass::Public, false);
        set_cache_entries(12);
        set_active_subscriptions(3);
        record_poll_tick(RecordKind::LogEntry);
        record_notification(RecordKind::Comment);
        set_pending_sync(RecordKind::LogEntry, 4);
        set_engine_state("Running");
    }

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new("memory", "read");
        std::thread::sleep(Duration::from_micros(10));
        timer.finish("success");

        {
            let _timer = LatencyTimer::new("memory", "create");
        }
        // Recorded on drop
    }
}
