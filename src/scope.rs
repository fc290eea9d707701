// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scope descriptors and the keys derived from them.
//!
//! A scope names the subset of records a read or subscription targets. The
//! same `(kind, scope)` pair keys the read cache, the subscription registry
//! and the local fallback reads, so two callers asking for the same relation
//! set in a different order land on the same entry.
//!
//! Rendered keys look like:
//!
//! ```text
//! log_entry:owner:a@example.com
//! log_entry:relations:3f9a0c1d2e4b5a69:relations+public
//! log_entry:public:50
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::record::{Record, RecordKind, VisibilityFilter};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeDescriptor {
    /// Records listed under one identity
    Owner(String),
    /// Records authored by any of a set of relations
    Relations {
        /// Sorted and de-duplicated
        ids: Vec<String>,
        filter: VisibilityFilter,
    },
    /// The public feed
    Public { limit: usize },
}

impl ScopeDescriptor {
    pub fn owner(id: impl Into<String>) -> Self {
        Self::Owner(id.into())
    }

    /// Relation-set scope. Ordering and duplicates in `ids` do not matter.
    pub fn relations<I, S>(ids: I, filter: VisibilityFilter) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        ids.sort();
        ids.dedup();
        Self::Relations { ids, filter }
    }

    #[must_use]
    pub fn public(limit: usize) -> Self {
        Self::Public { limit }
    }

    /// Whether `record` could appear in a read of this scope.
    #[must_use]
    pub fn could_include(&self, record: &Record) -> bool {
        match self {
            Self::Owner(owner) => record.scope_owner() == owner,
            Self::Relations { ids, filter } => {
                ids.binary_search(&record.owner_id).is_ok() && filter.accepts(record.visibility)
            }
            Self::Public { .. } => record.is_public(),
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Owner(owner) => format!("owner:{}", owner),
            Self::Relations { ids, filter } => {
                format!("relations:{}:{}", relation_set_hash(ids), filter.tag())
            }
            Self::Public { limit } => format!("public:{}", limit),
        }
    }
}

/// Short, order-independent digest of a normalized id set.
fn relation_set_hash(sorted_ids: &[String]) -> String {
    let mut hasher = Sha256::new();
    for id in sorted_ids {
        hasher.update(id.as_bytes());
        // Separator so ["ab", "c"] and ["a", "bc"] differ
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Key shared by the read cache and the subscription registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub kind: RecordKind,
    pub scope: ScopeDescriptor,
}

impl ScopeKey {
    pub fn new(kind: RecordKind, scope: ScopeDescriptor) -> Self {
        Self { kind, scope }
    }

    /// String form used as the cache map key and in logs.
    #[must_use]
    pub fn render(&self) -> String {
        format!("{}:{}", self.kind, self.scope.render())
    }

    /// Prefix matching every key of a kind.
    #[must_use]
    pub fn kind_prefix(kind: RecordKind) -> String {
        format!("{}:", kind)
    }

    /// Prefix matching every public-feed key of a kind, whatever its limit.
    #[must_use]
    pub fn public_prefix(kind: RecordKind) -> String {
        format!("{}:public:", kind)
    }

    /// TTL class of this key.
    #[must_use]
    pub fn class(&self) -> ScopeClass {
        match self.scope {
            ScopeDescriptor::Owner(_) => ScopeClass::Owner,
            ScopeDescriptor::Relations { .. } => ScopeClass::Relations,
            ScopeDescriptor::Public { .. } => ScopeClass::Public,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Coarse scope category, used for TTL and interval selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeClass {
    Owner,
    Relations,
    Public,
}

impl ScopeClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Relations => "relations",
            Self::Public => "public",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Visibility;
    use serde_json::json;

    #[test]
    fn test_relation_sets_ignore_order_and_duplicates() {
        let a = ScopeDescriptor::relations(["c@x", "a@x", "b@x"], VisibilityFilter::relations());
        let b = ScopeDescriptor::relations(["b@x", "c@x", "a@x", "a@x"], VisibilityFilter::relations());

        assert_eq!(a, b);
        assert_eq!(
            ScopeKey::new(RecordKind::LogEntry, a).render(),
            ScopeKey::new(RecordKind::LogEntry, b).render()
        );
    }

    #[test]
    fn test_relation_hash_uses_separator() {
        let a = ScopeDescriptor::relations(["ab", "c"], VisibilityFilter::relations());
        let b = ScopeDescriptor::relations(["a", "bc"], VisibilityFilter::relations());
        assert_ne!(
            ScopeKey::new(RecordKind::LogEntry, a).render(),
            ScopeKey::new(RecordKind::LogEntry, b).render()
        );
    }

    #[test]
    fn test_rendered_keys() {
        let owner = ScopeKey::new(RecordKind::LogEntry, ScopeDescriptor::owner("a@example.com"));
        assert_eq!(owner.render(), "log_entry:owner:a@example.com");

        let public = ScopeKey::new(RecordKind::LogEntry, ScopeDescriptor::public(50));
        assert_eq!(public.render(), "log_entry:public:50");
        assert!(public.render().starts_with(&ScopeKey::public_prefix(RecordKind::LogEntry)));
        assert!(public.render().starts_with(&ScopeKey::kind_prefix(RecordKind::LogEntry)));
    }

    #[test]
    fn test_could_include() {
        let entry = Record::new(RecordKind::LogEntry, "a@x", json!({})).with_visibility(Visibility::Public);

        assert!(ScopeDescriptor::owner("a@x").could_include(&entry));
        assert!(!ScopeDescriptor::owner("b@x").could_include(&entry));
        assert!(ScopeDescriptor::public(10).could_include(&entry));
        assert!(ScopeDescriptor::relations(["a@x"], VisibilityFilter::relations()).could_include(&entry));

        let private = Record::new(RecordKind::LogEntry, "a@x", json!({})).with_visibility(Visibility::Private);
        assert!(!ScopeDescriptor::public(10).could_include(&private));
        assert!(!ScopeDescriptor::relations(["a@x"], VisibilityFilter::relations()).could_include(&private));
    }

    #[test]
    fn test_classes() {
        assert_eq!(ScopeKey::new(RecordKind::Comment, ScopeDescriptor::owner("e1")).class(), ScopeClass::Owner);
        assert_eq!(ScopeKey::new(RecordKind::LogEntry, ScopeDescriptor::public(5)).class(), ScopeClass::Public);
    }
}
