//! Property-based tests (fuzzing) for record-sync.
//!
//! Uses proptest to generate random and malformed inputs and verify that key
//! derivation, ordering and the providers hold their invariants and never
//! panic.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use proptest::prelude::*;
use serde_json::{json, Value};

use record_sync::record::sort_newest_first;
use record_sync::storage::traits::query_in_batches;
use record_sync::{
    MemoryRecordStore, ProviderId, Record, RecordKind, RecordStore, ScopeDescriptor, ScopeKey, StoreError,
    SyncConfig, Visibility, VisibilityFilter,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn kind_strategy() -> impl Strategy<Value = RecordKind> {
    prop::sample::select(RecordKind::ALL.to_vec())
}

fn visibility_strategy() -> impl Strategy<Value = Option<Visibility>> {
    prop_oneof![
        Just(None),
        Just(Some(Visibility::Private)),
        Just(Some(Visibility::Relations)),
        Just(Some(Visibility::Public)),
    ]
}

/// Identities like "a3@x"; a small alphabet so sets overlap
fn identity_strategy() -> impl Strategy<Value = String> {
    "[a-e][0-9]@x"
}

fn record_strategy() -> impl Strategy<Value = Record> {
    (
        kind_strategy(),
        identity_strategy(),
        prop::option::of(identity_strategy()),
        visibility_strategy(),
        0i64..1_000,
        "[a-z0-9]{1,8}",
    )
        .prop_map(|(kind, owner, target, visibility, timestamp, id)| {
            let mut record = Record::new(kind, owner, json!({}));
            record.id = id;
            record.timestamp = timestamp;
            record.visibility = visibility;
            record.target_id = target;
            record
        })
}

fn filter_strategy() -> impl Strategy<Value = VisibilityFilter> {
    prop::collection::vec(
        prop_oneof![
            Just(Visibility::Private),
            Just(Visibility::Relations),
            Just(Visibility::Public),
        ],
        0..4,
    )
    .prop_map(VisibilityFilter::new)
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,  // depth
        64, // max nodes
        10, // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10).prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

// =============================================================================
// Scope keys
// =============================================================================

proptest! {
    /// Relation-set keys ignore id order and duplicates
    #[test]
    fn relation_key_is_order_and_duplicate_independent(
        ids in prop::collection::vec(identity_strategy(), 0..20),
        filter in filter_strategy(),
        kind in kind_strategy(),
    ) {
        let mut shuffled = ids.clone();
        shuffled.reverse();
        shuffled.extend(ids.iter().take(3).cloned());

        let a = ScopeKey::new(kind, ScopeDescriptor::relations(ids, filter.clone()));
        let b = ScopeKey::new(kind, ScopeDescriptor::relations(shuffled, filter));
        prop_assert_eq!(a.render(), b.render());
        prop_assert_eq!(a, b);
    }

    /// Different id sets give different keys
    #[test]
    fn relation_key_distinguishes_sets(
        a in prop::collection::hash_set(identity_strategy(), 1..10),
        b in prop::collection::hash_set(identity_strategy(), 1..10),
    ) {
        prop_assume!(a != b);
        let filter = VisibilityFilter::relations();
        let ka = ScopeKey::new(RecordKind::LogEntry, ScopeDescriptor::relations(a, filter.clone()));
        let kb = ScopeKey::new(RecordKind::LogEntry, ScopeDescriptor::relations(b, filter));
        prop_assert_ne!(ka.render(), kb.render());
    }

    /// Every key of a kind falls under its kind prefix, and only public
    /// keys under the public prefix
    #[test]
    fn key_prefixes_partition(
        kind in kind_strategy(),
        owner in identity_strategy(),
        limit in 0usize..500,
    ) {
        let owner_key = ScopeKey::new(kind, ScopeDescriptor::owner(owner)).render();
        let public_key = ScopeKey::new(kind, ScopeDescriptor::public(limit)).render();

        prop_assert!(owner_key.starts_with(&ScopeKey::kind_prefix(kind)));
        prop_assert!(public_key.starts_with(&ScopeKey::kind_prefix(kind)));
        prop_assert!(public_key.starts_with(&ScopeKey::public_prefix(kind)));
        prop_assert!(!owner_key.starts_with(&ScopeKey::public_prefix(kind)));
    }

    /// A record always belongs to the owner scope it is listed under, and to
    /// no other owner scope
    #[test]
    fn could_include_matches_scope_owner(record in record_strategy(), other in identity_strategy()) {
        prop_assert!(ScopeDescriptor::owner(record.scope_owner()).could_include(&record));
        if other != record.scope_owner() {
            prop_assert!(!ScopeDescriptor::owner(other).could_include(&record));
        }
        prop_assert_eq!(ScopeDescriptor::public(10).could_include(&record), record.is_public());
    }

    /// Relation scopes include exactly the records their filter accepts from
    /// listed authors
    #[test]
    fn could_include_relations(
        record in record_strategy(),
        ids in prop::collection::vec(identity_strategy(), 0..10),
        filter in filter_strategy(),
    ) {
        let expected = ids.contains(&record.owner_id) && filter.accepts(record.visibility);
        let scope = ScopeDescriptor::relations(ids, filter);
        prop_assert_eq!(scope.could_include(&record), expected);
    }
}

// =============================================================================
// Ordering and batching
// =============================================================================

proptest! {
    /// Sorted output is newest first, ties by id, whatever the input order
    #[test]
    fn sort_newest_first_is_total(records in prop::collection::vec(record_strategy(), 0..50)) {
        let mut forward = records.clone();
        let mut backward: Vec<Record> = records.into_iter().rev().collect();
        sort_newest_first(&mut forward);
        sort_newest_first(&mut backward);

        for pair in forward.windows(2) {
            prop_assert!(
                pair[0].timestamp > pair[1].timestamp
                    || (pair[0].timestamp == pair[1].timestamp && pair[0].id <= pair[1].id)
            );
        }
        let f: Vec<(i64, &str)> = forward.iter().map(|r| (r.timestamp, r.id.as_str())).collect();
        let b: Vec<(i64, &str)> = backward.iter().map(|r| (r.timestamp, r.id.as_str())).collect();
        prop_assert_eq!(f, b);
    }

    /// Batches never exceed the limit, cover every id once, and the merge
    /// has no duplicate records
    #[test]
    fn batching_respects_limit_and_dedups(
        ids in prop::collection::hash_set("[a-z]{1,6}", 0..60),
        limit in prop::option::of(0usize..15),
    ) {
        let ids: Vec<String> = ids.into_iter().collect();
        let calls = AtomicUsize::new(0);
        let seen = parking_lot::Mutex::new(Vec::<String>::new());

        let merged = futures::executor::block_on(query_in_batches(&ids, limit, |batch| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(n) = limit.filter(|n| *n > 0) {
                assert!(batch.len() <= n);
            }
            seen.lock().extend(batch.iter().cloned());
            async move {
                // Every batch also returns a shared record
                let mut out: Vec<Record> = batch
                    .iter()
                    .map(|owner| {
                        let mut r = Record::new(RecordKind::LogEntry, owner.as_str(), json!({}));
                        r.id = format!("own-{}", owner);
                        r.timestamp = owner.len() as i64;
                        r
                    })
                    .collect();
                let mut shared = Record::new(RecordKind::LogEntry, "shared", json!({}));
                shared.id = "shared".into();
                shared.timestamp = 0;
                out.push(shared);
                Ok::<_, StoreError>(out)
            }
        }))
        .unwrap();

        let mut covered = seen.into_inner();
        covered.sort();
        let mut expected = ids.clone();
        expected.sort();
        prop_assert_eq!(covered, expected);

        let unique: HashSet<&str> = merged.iter().map(|r| r.id.as_str()).collect();
        prop_assert_eq!(unique.len(), merged.len());
        if ids.is_empty() {
            prop_assert!(merged.is_empty());
            prop_assert_eq!(calls.load(Ordering::SeqCst), 0);
        } else {
            prop_assert_eq!(merged.len(), ids.len() + 1);
            let chunk = limit.filter(|n| *n > 0).unwrap_or(ids.len());
            prop_assert_eq!(calls.load(Ordering::SeqCst), (ids.len() + chunk - 1) / chunk);
        }
    }
}

// =============================================================================
// Malformed input
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Decoding garbage as a record returns an error or a record, never panics
    #[test]
    fn record_decoding_never_panics(value in arbitrary_json_strategy()) {
        let _ = serde_json::from_value::<Record>(value.clone());
        let _ = serde_json::from_str::<Record>(&value.to_string());
    }

    /// Any payload is either stored and readable, or cleanly rejected
    #[test]
    fn memory_store_accepts_or_rejects_any_payload(
        payload in arbitrary_json_strategy(),
        owner in ".{0,40}",
        limit in 16usize..4096,
    ) {
        let store = MemoryRecordStore::builder(ProviderId::new("fuzz")).max_payload_bytes(limit).build();
        let record = Record::new(RecordKind::Comment, owner.as_str(), payload);

        runtime().block_on(async {
            match store.create(&record).await {
                Ok(id) => {
                    let owned = store.query_by_owner(RecordKind::Comment, &owner).await.unwrap();
                    assert!(owned.iter().any(|r| r.id == id && r.payload == record.payload));
                }
                Err(StoreError::Rejected(_)) => {
                    assert!(record.encoded_len() > limit);
                    assert!(store.is_empty());
                }
                Err(other) => panic!("unexpected error: {}", other),
            }
        });
    }

    /// Configuration validation is total: zero-valued knobs are errors,
    /// positive ones are not
    #[test]
    fn config_validation_never_panics(
        ttl in 0u64..5,
        batch in 0usize..5,
        payload in 0usize..5,
        sql_url in prop::option::of("[a-z]{0,8}:[a-z/]{0,10}"),
    ) {
        let config = SyncConfig {
            selection_ttl_secs: ttl,
            sql_max_batch_size: batch,
            max_payload_bytes: payload,
            sql_url: sql_url.clone(),
            ..Default::default()
        };
        let result = config.validate();
        if ttl == 0 || batch == 0 || payload == 0 {
            prop_assert!(result.is_err());
        }
        let scheme_ok = sql_url
            .as_deref()
            .map_or(true, |u| u.starts_with("sqlite:") || u.starts_with("mysql:"));
        if ttl > 0 && batch > 0 && payload > 0 && scheme_ok {
            prop_assert!(result.is_ok());
        }
    }
}
