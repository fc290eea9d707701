// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Static capability metadata per provider.

use std::cmp::Reverse;
use std::fmt;

/// Identifier of a provider in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(&'static str);

impl ProviderId {
    pub const REDIS: ProviderId = ProviderId("redis");
    pub const SQL: ProviderId = ProviderId("sql");
    pub const MEMORY: ProviderId = ProviderId("memory");
    /// Local durable storage, the terminal fallback
    pub const LOCAL: ProviderId = ProviderId("local");

    #[must_use]
    pub const fn new(id: &'static str) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.0
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        *self == Self::LOCAL
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Typical round-trip latency of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LatencyClass {
    /// In-process or on-device
    Local,
    /// Same region, single-digit milliseconds
    Low,
    /// Cross-region or HTTP gateway
    High,
}

/// What a provider can do, consumed by the selector, the batching logic and
/// the change-notification normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    /// Provider notifies on change without polling
    pub native_push: bool,
    /// Provider can answer "owner in (...)" queries natively
    pub set_membership_query: bool,
    /// Largest "in" filter the provider accepts; `None` means unbounded
    pub max_batch_size: Option<usize>,
    pub latency: LatencyClass,
}

impl ProviderDescriptor {
    /// Sort key, greater is more capable: push, then set queries, then
    /// larger batches, then lower latency.
    #[must_use]
    pub fn capability_rank(&self) -> (bool, bool, usize, Reverse<LatencyClass>) {
        (
            self.native_push,
            self.set_membership_query,
            self.max_batch_size.unwrap_or(usize::MAX),
            Reverse(self.latency),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(push: bool, set: bool, batch: Option<usize>, latency: LatencyClass) -> ProviderDescriptor {
        ProviderDescriptor {
            id: ProviderId::new("t"),
            native_push: push,
            set_membership_query: set,
            max_batch_size: batch,
            latency,
        }
    }

    #[test]
    fn test_push_outranks_everything() {
        let push = descriptor(true, false, Some(1), LatencyClass::High);
        let rich = descriptor(false, true, None, LatencyClass::Local);
        assert!(push.capability_rank() > rich.capability_rank());
    }

    #[test]
    fn test_unbounded_batch_outranks_bounded() {
        let bounded = descriptor(false, true, Some(10), LatencyClass::Low);
        let unbounded = descriptor(false, true, None, LatencyClass::Low);
        assert!(unbounded.capability_rank() > bounded.capability_rank());
    }

    #[test]
    fn test_lower_latency_breaks_ties() {
        let slow = descriptor(false, true, Some(10), LatencyClass::High);
        let fast = descriptor(false, true, Some(10), LatencyClass::Low);
        assert!(fast.capability_rank() > slow.capability_rank());
    }

    #[test]
    fn test_provider_id_display() {
        assert_eq!(ProviderId::REDIS.to_string(), "redis");
        assert!(ProviderId::LOCAL.is_local());
        assert!(!ProviderId::SQL.is_local());
    }
}
