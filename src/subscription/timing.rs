//! Poll intervals and push debounce windows.

use std::time::Duration;

use crate::record::RecordKind;
use crate::scope::{ScopeDescriptor, ScopeKey};

/// How often a poll-path key is re-fetched.
///
/// | scope                               | interval |
/// |-------------------------------------|----------|
/// | relationship requests               | 2 s      |
/// | comments / reactions on one record  | 500 ms   |
/// | public feeds                        | 3 s      |
/// | own log entries                     | 1 s      |
/// | anything else                       | 2 s      |
#[must_use]
pub fn poll_interval(key: &ScopeKey) -> Duration {
    match (key.kind, &key.scope) {
        (RecordKind::RelationshipRequest, _) => Duration::from_secs(2),
        (RecordKind::Comment | RecordKind::Reaction, ScopeDescriptor::Owner(_)) => Duration::from_millis(500),
        (_, ScopeDescriptor::Public { .. }) => Duration::from_secs(3),
        (RecordKind::LogEntry, ScopeDescriptor::Owner(_)) => Duration::from_secs(1),
        _ => Duration::from_secs(2),
    }
}

/// Quiet period after a native push event before the snapshot is re-fetched.
#[must_use]
pub fn debounce_window(key: &ScopeKey) -> Duration {
    match key.kind {
        RecordKind::RelationshipRequest => Duration::from_secs(2),
        _ => Duration::from_secs(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VisibilityFilter;

    fn key(kind: RecordKind, scope: ScopeDescriptor) -> ScopeKey {
        ScopeKey::new(kind, scope)
    }

    #[test]
    fn test_poll_intervals() {
        assert_eq!(
            poll_interval(&key(RecordKind::LogEntry, ScopeDescriptor::owner("a@x"))),
            Duration::from_secs(1)
        );
        assert_eq!(
            poll_interval(&key(RecordKind::RelationshipRequest, ScopeDescriptor::owner("a@x"))),
            Duration::from_secs(2)
        );
        assert_eq!(
            poll_interval(&key(RecordKind::Comment, ScopeDescriptor::owner("entry-1"))),
            Duration::from_millis(500)
        );
        assert_eq!(
            poll_interval(&key(RecordKind::Reaction, ScopeDescriptor::owner("entry-1"))),
            Duration::from_millis(500)
        );
        assert_eq!(
            poll_interval(&key(RecordKind::LogEntry, ScopeDescriptor::public(50))),
            Duration::from_secs(3)
        );
        assert_eq!(
            poll_interval(&key(
                RecordKind::LogEntry,
                ScopeDescriptor::relations(["b@x"], VisibilityFilter::relations())
            )),
            Duration::from_secs(2)
        );
        assert_eq!(
            poll_interval(&key(RecordKind::InventoryItem, ScopeDescriptor::owner("a@x"))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_debounce_windows() {
        assert_eq!(
            debounce_window(&key(RecordKind::LogEntry, ScopeDescriptor::owner("a@x"))),
            Duration::from_secs(1)
        );
        assert_eq!(
            debounce_window(&key(RecordKind::RelationshipRequest, ScopeDescriptor::owner("a@x"))),
            Duration::from_secs(2)
        );
    }
}
