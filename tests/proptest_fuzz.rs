// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests for normalization, diffs and the fan-out policy.
//!
//! Uses proptest to generate random and malformed inputs and verify the
//! engine never panics and keeps its invariants.
//!
//! Run with: `cargo test --test proptest_fuzz`

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use replica_sync::{
    compute_diff, Account, Actor, AuditEvent, InMemoryStore, Normalizer, Record, ReplicaConfig, ReplicaEngine,
    ReplicaError, Role, StoreAdapter, StoreTarget,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn normalizer() -> Normalizer {
    Normalizer::from_config(&ReplicaConfig::default()).unwrap()
}

/// Mostly-empty strings, so fallbacks get exercised.
fn sparse_string() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(String::new()),
        Just("   ".to_string()),
        "[A-Za-z0-9_]{1,12}",
    ]
}

fn sparse_option() -> impl Strategy<Value = Option<String>> {
    prop_oneof![Just(None), sparse_string().prop_map(Some)]
}

fn audit_event_strategy() -> impl Strategy<Value = AuditEvent> {
    (
        prop::option::of(0i64..4_000_000_000_000),
        sparse_string(),
        sparse_string(),
        sparse_string(),
        sparse_string(),
        sparse_option(),
        sparse_option(),
        sparse_option(),
    )
        .prop_map(|(timestamp_ms, actor_id, actor_name, action, entity_kind, entity_id, payload, origin)| {
            AuditEvent {
                timestamp_ms,
                actor_id,
                actor_name,
                action,
                entity_kind,
                entity_id,
                payload,
                origin,
                details: None,
            }
        })
}

/// Flat JSON objects with a few shared keys so diffs see overlap.
fn flat_object_strategy() -> impl Strategy<Value = Map<String, Value>> {
    let key = prop_oneof![
        Just("role".to_string()),
        Just("description".to_string()),
        Just("active".to_string()),
        Just("password_hash".to_string()),
        Just("id".to_string()),
        "[a-z]{1,6}",
    ];
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z]{0,5}".prop_map(Value::String),
    ];
    prop::collection::btree_map(key, leaf, 0..6).prop_map(|m| m.into_iter().collect())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Normalizer properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_normalized_audit_has_no_blank_required_fields(event in audit_event_strategy()) {
        let validated = normalizer().normalize(Record::AuditEvent(event), 1_700_000_000_000).unwrap();
        let event = validated.record().as_audit_event().unwrap().clone();

        prop_assert!(!event.actor_id.trim().is_empty());
        prop_assert!(!event.actor_name.trim().is_empty());
        prop_assert!(!event.action.trim().is_empty());
        prop_assert!(!event.entity_kind.trim().is_empty());
        prop_assert!(event.timestamp_ms.is_some());
        prop_assert!(event.origin.as_deref().is_some_and(|o| !o.trim().is_empty()));
    }

    #[test]
    fn prop_normalization_is_idempotent(event in audit_event_strategy(), later in 0i64..1000) {
        let n = normalizer();
        let once = n.normalize(Record::AuditEvent(event), 1_700_000_000_000).unwrap().into_inner();
        // A second pass with a different clock must not change anything.
        let twice = n.normalize(once.clone(), 1_700_000_000_000 + later + 1).unwrap().into_inner();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_supplied_fields_are_preserved(
        actor_id in "[A-Za-z0-9]{1,10}",
        actor_name in "[A-Za-z0-9]{1,10}",
        action in "[A-Z]{1,10}",
        ts in 0i64..4_000_000_000_000,
    ) {
        let event = AuditEvent {
            timestamp_ms: Some(ts),
            actor_id: actor_id.clone(),
            actor_name: actor_name.clone(),
            action: action.clone(),
            entity_kind: "ACCOUNT".into(),
            ..Default::default()
        };
        let out = normalizer().normalize(Record::AuditEvent(event), 0).unwrap().into_inner();
        let out = out.as_audit_event().unwrap();
        prop_assert_eq!(&out.actor_id, &actor_id);
        prop_assert_eq!(&out.actor_name, &actor_name);
        prop_assert_eq!(&out.action, &action);
        prop_assert_eq!(out.timestamp_ms, Some(ts));
    }

    #[test]
    fn prop_username_validation_matches_six_digits(username in "[0-9a-z #*\u{0660}-\u{0669}\u{FF10}-\u{FF19}]{0,8}") {
        let account = Account::new(username.clone(), "hash", Role::User);
        let accepted = normalizer().normalize(Record::Account(account), 0).is_ok();
        let six_digits = username.len() == 6 && username.chars().all(|c| c.is_ascii_digit());
        prop_assert_eq!(accepted, six_digits);
    }

    #[test]
    fn prop_reference_code_validation_never_panics(code in ".{0,16}") {
        let _ = normalizer().validate_key(replica_sync::EntityKind::ReferenceCode, &code);
    }
}

// =============================================================================
// Diff properties
// =============================================================================

proptest! {
    #[test]
    fn prop_diff_of_identical_snapshots_is_empty(obj in flat_object_strategy()) {
        let value = Value::Object(obj);
        prop_assert!(compute_diff(&value, &value).is_empty());
    }

    #[test]
    fn prop_diff_never_leaks_excluded_fields(before in flat_object_strategy(), after in flat_object_strategy()) {
        let diff = compute_diff(&Value::Object(before), &Value::Object(after));
        for excluded in ["id", "password_hash", "password", "timestamp", "timestamp_ms"] {
            prop_assert!(!diff.contains_key(excluded));
        }
    }

    #[test]
    fn prop_diff_entries_describe_the_change(before in flat_object_strategy(), after in flat_object_strategy()) {
        let diff = compute_diff(&Value::Object(before.clone()), &Value::Object(after.clone()));

        for (field, change) in &diff {
            let change = change.as_object().unwrap();
            match (before.get(field), after.get(field)) {
                (Some(old), Some(new)) => {
                    prop_assert_ne!(old, new);
                    prop_assert_eq!(change.get("old"), Some(old));
                    prop_assert_eq!(change.get("new"), Some(new));
                }
                (None, Some(new)) => {
                    prop_assert!(!change.contains_key("old"));
                    prop_assert_eq!(change.get("new"), Some(new));
                }
                (Some(old), None) => {
                    prop_assert_eq!(change.get("old"), Some(old));
                    prop_assert_eq!(change.get("new"), Some(&Value::Null));
                }
                (None, None) => prop_assert!(false, "diff invented field {}", field),
            }
        }
    }

    #[test]
    fn prop_fingerprint_tracks_action(event in audit_event_strategy(), suffix in "[A-Z]{1,4}") {
        let mut changed = event.clone();
        changed.action = format!("{}{}", event.action, suffix);
        prop_assert_eq!(event.fingerprint(), event.clone().fingerprint());
        prop_assert_ne!(event.fingerprint(), changed.fingerprint());
    }
}

// =============================================================================
// Fan-out / read policy properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_write_succeeds_iff_some_store_is_up(up in prop::collection::vec(any::<bool>(), 1..5)) {
        runtime().block_on(async {
            let stores: Vec<Arc<InMemoryStore>> = up.iter().map(|_| Arc::new(InMemoryStore::new())).collect();
            let targets = stores
                .iter()
                .enumerate()
                .map(|(i, s)| StoreTarget::new(format!("s{i}"), s.clone()))
                .collect();
            let engine = ReplicaEngine::new(ReplicaConfig::default(), targets).unwrap();
            for (store, up) in stores.iter().zip(&up) {
                store.set_available(*up);
            }

            let result = engine
                .create_account(Account::new("123456", "hash", Role::User), &Actor::new("1", "t"))
                .await;
            let expected_up = up.iter().filter(|u| **u).count();

            match result {
                Ok(report) => {
                    assert!(expected_up > 0);
                    assert_eq!(report.succeeded, expected_up);
                }
                Err(ReplicaError::AllTargetsFailed { failures, .. }) => {
                    assert_eq!(expected_up, 0);
                    assert_eq!(failures.len(), up.len());
                }
                Err(other) => panic!("unexpected {other:?}"),
            }

            for (store, up) in stores.iter().zip(&up) {
                store.set_available(true);
                assert_eq!(store.account("123456").is_some(), *up);
            }
        });
    }

    #[test]
    fn prop_read_served_by_first_up_store_holding_record(
        layout in prop::collection::vec((any::<bool>(), any::<bool>()), 1..5)
    ) {
        runtime().block_on(async {
            let stores: Vec<Arc<InMemoryStore>> = layout.iter().map(|_| Arc::new(InMemoryStore::new())).collect();
            for (store, (_, holds)) in stores.iter().zip(&layout) {
                if *holds {
                    store
                        .upsert_by_natural_key(&Record::Account(Account::new("123456", "hash", Role::User)))
                        .await
                        .unwrap();
                }
            }
            for (store, (up, _)) in stores.iter().zip(&layout) {
                store.set_available(*up);
            }
            let targets = stores
                .iter()
                .enumerate()
                .map(|(i, s)| StoreTarget::new(format!("s{i}"), s.clone()))
                .collect();
            let engine = ReplicaEngine::new(ReplicaConfig::default(), targets).unwrap();

            let expected = layout.iter().position(|(up, holds)| *up && *holds);
            let any_up = layout.iter().any(|(up, _)| *up);

            match engine.find_account_by_username("123456").await {
                Ok(found) => assert_eq!(Some(found.source), expected.map(|i| format!("s{i}"))),
                Err(ReplicaError::NotFound { .. }) => assert!(expected.is_none() && any_up),
                Err(ReplicaError::Unavailable { .. }) => assert!(!any_up),
                Err(other) => panic!("unexpected {other:?}"),
            }
        });
    }
}
