// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record data structure.
//!
//! A [`Record`] is the unit that flows through every provider, the cache and
//! the local fallback store. Common metadata lives in typed fields; the
//! kind-specific fields (coordinates, rating, comment text, ...) travel in
//! `payload` as JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of persisted records.
///
/// The kind decides which logical table a record lives in, how long reads are
/// cached, and how often subscriptions on it are polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A location-tagged log entry with rating and visibility
    LogEntry,
    /// An accepted relationship between two users
    Relationship,
    /// A pending relationship request, addressed to its recipient
    RelationshipRequest,
    /// A comment on another record
    Comment,
    /// A reaction (like) on another record
    Reaction,
    /// An item held in a user's inventory
    InventoryItem,
    /// A directed interaction from one user to another
    InteractionEvent,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        RecordKind::LogEntry,
        RecordKind::Relationship,
        RecordKind::RelationshipRequest,
        RecordKind::Comment,
        RecordKind::Reaction,
        RecordKind::InventoryItem,
        RecordKind::InteractionEvent,
    ];

    /// Stable identifier used in cache keys, table columns and channel names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogEntry => "log_entry",
            Self::Relationship => "relationship",
            Self::RelationshipRequest => "relationship_request",
            Self::Comment => "comment",
            Self::Reaction => "reaction",
            Self::InventoryItem => "inventory_item",
            Self::InteractionEvent => "interaction_event",
        }
    }

    /// Whether records of this kind are listed under their `target_id`
    /// rather than under their author.
    #[must_use]
    pub fn is_addressed(&self) -> bool {
        matches!(
            self,
            Self::RelationshipRequest | Self::InteractionEvent | Self::Comment | Self::Reaction
        )
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown record kind '{}'", s))
    }
}

/// Who may see a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    /// Visible to the owner's relations
    Relations,
    Public,
}

impl Visibility {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Relations => "relations",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "relations" => Ok(Self::Relations),
            "public" => Ok(Self::Public),
            other => Err(format!("unknown visibility '{}'", other)),
        }
    }
}

/// Set of visibilities a relation-set query accepts.
///
/// Records without a visibility (relationships, inventory items, ...) always
/// pass the filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisibilityFilter {
    allowed: Vec<Visibility>,
}

impl VisibilityFilter {
    /// Build a filter from the given visibilities (order and duplicates ignored).
    pub fn new(allowed: impl IntoIterator<Item = Visibility>) -> Self {
        let mut allowed: Vec<Visibility> = allowed.into_iter().collect();
        allowed.sort();
        allowed.dedup();
        Self { allowed }
    }

    /// What a relation normally sees: relation-only and public entries.
    #[must_use]
    pub fn relations() -> Self {
        Self::new([Visibility::Relations, Visibility::Public])
    }

    #[must_use]
    pub fn any() -> Self {
        Self::new([Visibility::Private, Visibility::Relations, Visibility::Public])
    }

    #[must_use]
    pub fn allowed(&self) -> &[Visibility] {
        &self.allowed
    }

    #[must_use]
    pub fn accepts(&self, visibility: Option<Visibility>) -> bool {
        match visibility {
            Some(v) => self.allowed.contains(&v),
            None => true,
        }
    }

    /// Compact form used in cache keys, e.g. `public+relations`.
    #[must_use]
    pub fn tag(&self) -> String {
        self.allowed
            .iter()
            .map(Visibility::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl Default for VisibilityFilter {
    fn default() -> Self {
        Self::relations()
    }
}

/// A persisted entity.
///
/// # Example
///
/// ```
/// use record_sync::{Record, RecordKind, Visibility};
/// use serde_json::json;
///
/// let entry = Record::new(RecordKind::LogEntry, "a@example.com", json!({"lat": 25.03, "lng": 121.56, "rating": 4.5}))
///     .with_visibility(Visibility::Public);
///
/// assert!(entry.id.is_empty()); // assigned by the provider
/// assert_eq!(entry.scope_owner(), "a@example.com");
/// assert!(entry.timestamp > 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Provider-assigned id (empty until created)
    #[serde(default)]
    pub id: String,
    pub kind: RecordKind,
    /// Identity of the acting user, immutable after creation
    pub owner_id: String,
    /// Creation time (epoch millis), never mutated
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    /// Recipient user or parent record, for addressed kinds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Kind-specific fields
    #[serde(default)]
    pub payload: Value,
}

impl Record {
    /// Create a record stamped with the current time.
    pub fn new(kind: RecordKind, owner_id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: String::new(),
            kind,
            owner_id: owner_id.into(),
            timestamp: now_millis(),
            visibility: None,
            target_id: None,
            status: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    #[must_use]
    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// The identity this record is listed under by owner-scoped queries.
    #[must_use]
    pub fn scope_owner(&self) -> &str {
        if self.kind.is_addressed() {
            if let Some(target) = self.target_id.as_deref() {
                return target;
            }
        }
        &self.owner_id
    }

    #[must_use]
    pub fn is_public(&self) -> bool {
        self.visibility == Some(Visibility::Public)
    }

    /// Serialized size, used for payload limits.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Sort newest first, breaking timestamp ties by id so results are stable.
pub fn sort_newest_first(records: &mut [Record]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record() {
        let record = Record::new(RecordKind::LogEntry, "a@example.com", json!({"rating": 3}));

        assert!(record.id.is_empty());
        assert_eq!(record.owner_id, "a@example.com");
        assert!(record.timestamp > 0);
        assert!(record.visibility.is_none());
        assert!(record.target_id.is_none());
        assert!(record.status.is_none());
    }

    #[test]
    fn test_scope_owner_for_addressed_kinds() {
        let request = Record::new(RecordKind::RelationshipRequest, "a@example.com", json!({}))
            .with_target("b@example.com");
        assert_eq!(request.scope_owner(), "b@example.com");

        let comment = Record::new(RecordKind::Comment, "a@example.com", json!({"content": "nice"}))
            .with_target("entry-1");
        assert_eq!(comment.scope_owner(), "entry-1");

        // Addressed kind without a target falls back to the author
        let orphan = Record::new(RecordKind::Reaction, "a@example.com", json!({}));
        assert_eq!(orphan.scope_owner(), "a@example.com");

        // Non-addressed kinds ignore the target
        let entry = Record::new(RecordKind::LogEntry, "a@example.com", json!({}))
            .with_target("elsewhere");
        assert_eq!(entry.scope_owner(), "a@example.com");
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        for kind in RecordKind::ALL {
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
        assert!("poop".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_visibility_filter_normalizes() {
        let a = VisibilityFilter::new([Visibility::Public, Visibility::Relations, Visibility::Public]);
        let b = VisibilityFilter::new([Visibility::Relations, Visibility::Public]);
        assert_eq!(a, b);
        assert_eq!(a.tag(), "relations+public");
    }

    #[test]
    fn test_visibility_filter_accepts() {
        let filter = VisibilityFilter::relations();
        assert!(filter.accepts(Some(Visibility::Public)));
        assert!(filter.accepts(Some(Visibility::Relations)));
        assert!(!filter.accepts(Some(Visibility::Private)));
        assert!(filter.accepts(None));
    }

    #[test]
    fn test_sort_newest_first() {
        let mut records: Vec<Record> = [3, 9, 1]
            .iter()
            .map(|ts| {
                let mut r = Record::new(RecordKind::LogEntry, "a", json!({}));
                r.timestamp = *ts;
                r.id = format!("id-{}", ts);
                r
            })
            .collect();

        sort_newest_first(&mut records);

        let order: Vec<i64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(order, vec![9, 3, 1]);
    }

    #[test]
    fn test_serialized_shape_is_camel_case() {
        let record = Record::new(RecordKind::RelationshipRequest, "a@example.com", json!({}))
            .with_target("b@example.com")
            .with_status("pending");

        let json_str = serde_json::to_string(&record).unwrap();
        assert!(json_str.contains("\"ownerId\""));
        assert!(json_str.contains("\"targetId\""));
        assert!(json_str.contains("\"relationship_request\""));
        assert!(!json_str.contains("visibility"));

        let back: Record = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back, record);
    }
}
