// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos testing for the replica engine.
//!
//! Failures are injected with wrapper adapters:
//! 1. **FailingStore** - errors at specific call counts, optionally per operation
//! 2. **HangingStore** - never answers, exercising per-store timeouts
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use replica_sync::{
    Account, Actor, AuditEvent, CircuitConfig, EngineState, EntityKind, InMemoryStore, Record, ReplicaConfig,
    ReplicaEngine, ReplicaError, Role, StorageError, StoreAdapter, StoreId, StoreTarget, StoredRecord,
    TargetOutcome, UpsertOutcome,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps an in-memory store and fails chosen calls.
///
/// Only calls to operations in `operations` are counted (all when `None`).
pub struct FailingStore {
    inner: Arc<InMemoryStore>,
    call_count: AtomicU64,
    /// Fail on these call numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every counted call from this number on
    fail_from: Option<u64>,
    operations: Option<Vec<&'static str>>,
}

impl FailingStore {
    pub fn new(inner: Arc<InMemoryStore>, fail_on_calls: Vec<u64>) -> Self {
        Self { inner, call_count: AtomicU64::new(0), fail_on_calls, fail_from: None, operations: None }
    }

    /// Fail permanently after `n` successful calls.
    pub fn fail_after(inner: Arc<InMemoryStore>, n: u64) -> Self {
        let mut store = Self::new(inner, Vec::new());
        store.fail_from = Some(n + 1);
        store
    }

    pub fn only(mut self, operations: &[&'static str]) -> Self {
        self.operations = Some(operations.to_vec());
        self
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self, operation: &'static str) -> Result<(), StorageError> {
        if let Some(ops) = &self.operations {
            if !ops.contains(&operation) {
                return Ok(());
            }
        }
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        let fail = self.fail_on_calls.contains(&count) || self.fail_from.is_some_and(|from| count >= from);
        if fail {
            Err(StorageError::Backend(format!("injected failure on {operation} call {count}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreAdapter for FailingStore {
    async fn upsert_by_natural_key(&self, record: &Record) -> Result<UpsertOutcome, StorageError> {
        self.maybe_fail("upsert")?;
        self.inner.upsert_by_natural_key(record).await
    }

    async fn insert(&self, record: &Record) -> Result<StoreId, StorageError> {
        self.maybe_fail("insert")?;
        self.inner.insert(record).await
    }

    async fn exists_by_id(&self, kind: EntityKind, id: StoreId) -> Result<bool, StorageError> {
        self.maybe_fail("exists_by_id")?;
        self.inner.exists_by_id(kind, id).await
    }

    async fn find_all(&self, kind: EntityKind) -> Result<Vec<StoredRecord>, StorageError> {
        self.maybe_fail("find_all")?;
        self.inner.find_all(kind).await
    }

    async fn find_by_natural_key(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        self.maybe_fail("find_by_natural_key")?;
        self.inner.find_by_natural_key(kind, key).await
    }

    async fn delete_by_natural_key(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError> {
        self.maybe_fail("delete")?;
        self.inner.delete_by_natural_key(kind, key).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.maybe_fail("ping")?;
        self.inner.ping().await
    }
}

/// Never answers.
struct HangingStore;

impl HangingStore {
    async fn hang<T: Send>() -> Result<T, StorageError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(StorageError::Unavailable("woke up".into()))
    }
}

#[async_trait]
impl StoreAdapter for HangingStore {
    async fn upsert_by_natural_key(&self, _record: &Record) -> Result<UpsertOutcome, StorageError> {
        Self::hang().await
    }

    async fn insert(&self, _record: &Record) -> Result<StoreId, StorageError> {
        Self::hang().await
    }

    async fn exists_by_id(&self, _kind: EntityKind, _id: StoreId) -> Result<bool, StorageError> {
        Self::hang().await
    }

    async fn find_all(&self, _kind: EntityKind) -> Result<Vec<StoredRecord>, StorageError> {
        Self::hang().await
    }

    async fn find_by_natural_key(&self, _kind: EntityKind, _key: &str) -> Result<Option<StoredRecord>, StorageError> {
        Self::hang().await
    }

    async fn delete_by_natural_key(&self, _kind: EntityKind, _key: &str) -> Result<bool, StorageError> {
        Self::hang().await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Self::hang().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn admin() -> Actor {
    Actor::new("000001", "admin")
}

fn user(username: &str) -> Account {
    Account::new(username, "$2b$10$hash", Role::User)
}

fn engine_over(targets: Vec<StoreTarget>, config: ReplicaConfig) -> ReplicaEngine {
    ReplicaEngine::new(config, targets).unwrap()
}

// =============================================================================
// Chaos Tests
// =============================================================================

#[tokio::test]
async fn chaos_audit_failure_never_fails_the_mutation() {
    let a = Arc::new(InMemoryStore::new());
    let b = Arc::new(InMemoryStore::new());
    let engine = engine_over(
        vec![
            StoreTarget::new("a", Arc::new(FailingStore::fail_after(a.clone(), 0).only(&["insert"]))),
            StoreTarget::new("b", Arc::new(FailingStore::fail_after(b.clone(), 0).only(&["insert"]))),
        ],
        ReplicaConfig::default(),
    );

    let report = engine.create_account(user("123456"), &admin()).await.unwrap();

    assert_eq!(report.succeeded, 2);
    assert!(a.account("123456").is_some());
    assert!(a.audit_events().is_empty());
    assert_eq!(engine.audit().dropped(), 1);
    assert_eq!(engine.audit().recorded(), 0);
}

#[tokio::test]
async fn chaos_hanging_store_times_out_and_others_serve() {
    let b = Arc::new(InMemoryStore::new());
    let config = ReplicaConfig { store_timeout_ms: 50, ..Default::default() };
    let engine = engine_over(vec![StoreTarget::new("slow", Arc::new(HangingStore)), StoreTarget::new("b", b.clone())], config);

    let report = engine.create_account(user("123456"), &admin()).await.unwrap();

    assert_eq!(report.succeeded, 1);
    assert_eq!(
        report.outcome_for("slow"),
        Some(&TargetOutcome::Failure(StorageError::Timeout(Duration::from_millis(50))))
    );
    assert!(b.account("123456").is_some());

    let found = engine.find_account_by_username("123456").await.unwrap();
    assert_eq!(found.source, "b");

    let health = engine.health_check().await;
    assert_eq!(health.reachable_stores, 1);
    assert!(!health.stores[0].reachable);
}

#[tokio::test]
async fn chaos_failed_record_does_not_abort_pass() {
    let a = Arc::new(InMemoryStore::new());
    let b = Arc::new(InMemoryStore::new());
    for name in ["111111", "222222", "333333"] {
        a.upsert_by_natural_key(&Record::Account(user(name))).await.unwrap();
    }
    let flaky = Arc::new(FailingStore::new(b.clone(), vec![1]).only(&["upsert"]));
    let engine = engine_over(vec![StoreTarget::new("a", a.clone()), StoreTarget::new("b", flaky.clone())], ReplicaConfig::default());

    let first = engine.reconcile_now().await;
    let accounts = first.report().unwrap().kind(EntityKind::Account);
    assert_eq!(accounts.failed, 1);
    assert_eq!(accounts.written, 2);
    assert_eq!(b.len(EntityKind::Account), 2);

    let second = engine.reconcile_now().await;
    assert_eq!(second.report().unwrap().kind(EntityKind::Account).written, 1);
    assert_eq!(b.len(EntityKind::Account), 3);
}

#[tokio::test]
async fn chaos_unreadable_source_is_reported_and_skipped() {
    let a = Arc::new(InMemoryStore::new());
    let b = Arc::new(InMemoryStore::new());
    let c = Arc::new(InMemoryStore::new());
    c.upsert_by_natural_key(&Record::Account(user("123456"))).await.unwrap();
    let broken_reads = Arc::new(FailingStore::fail_after(a.clone(), 0).only(&["find_all"]));
    let engine = engine_over(vec![StoreTarget::new("a", broken_reads), StoreTarget::new("b", b.clone()), StoreTarget::new("c", c.clone())], ReplicaConfig::default());

    let outcome = engine.reconcile_now().await;
    let report = outcome.report().unwrap();

    assert_eq!(report.unreadable_sources.len(), 1);
    assert_eq!(report.unreadable_sources[0].store, "a");
    // c → b lands; c → a is skipped because a's rows cannot be read.
    assert!(b.account("123456").is_some());
    assert!(a.account("123456").is_none());
}

#[tokio::test]
async fn chaos_circuit_breaker_short_circuits_dead_store() {
    let a = Arc::new(InMemoryStore::new());
    let b = Arc::new(InMemoryStore::new());
    let dead = Arc::new(FailingStore::fail_after(a.clone(), 0));
    let circuit = CircuitConfig {
        failure_rate: 0.5,
        window: 2,
        half_open_calls: 1,
        recovery_timeout: Duration::from_secs(60),
    };
    let targets = vec![
        StoreTarget::new("dead", dead.clone()).with_circuit(circuit),
        StoreTarget::new("b", b.clone()),
    ];
    let engine = ReplicaEngine::new(ReplicaConfig::default(), targets).unwrap();

    let mut last = None;
    for name in ["111111", "222222", "333333", "444444"] {
        last = Some(engine.create_account(user(name), &admin()).await.unwrap());
    }

    let last = last.unwrap();
    assert_eq!(last.outcome_for("dead"), Some(&TargetOutcome::Failure(StorageError::CircuitOpen)));
    assert!(dead.calls() < 12, "open circuit must stop calls reaching the store");
    assert_eq!(b.len(EntityKind::Account), 4);
}

#[tokio::test]
async fn chaos_strict_store_accepts_completed_audit_events() {
    let strict = Arc::new(InMemoryStore::new().strict());
    let lenient = Arc::new(InMemoryStore::new());
    let engine = engine_over(vec![StoreTarget::new("strict", strict.clone()), StoreTarget::new("lenient", lenient.clone())], ReplicaConfig::default());

    engine.create_account(user("123456"), &Actor::anonymous()).await.unwrap();

    let events = strict.audit_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor_id, "SYSTEM");
    assert_eq!(events[0].actor_name, "SYSTEM");
    assert_eq!(events[0].origin.as_deref(), Some("0.0.0.0"));
    assert_eq!(lenient.audit_events(), events);

    // The same event without completion is rejected by the strict store only.
    let raw = Record::AuditEvent(AuditEvent { action: "LOGIN".into(), ..Default::default() });
    assert!(matches!(strict.insert(&raw).await, Err(StorageError::Constraint { .. })));
    assert!(lenient.insert(&raw).await.is_ok());
}

#[tokio::test]
async fn chaos_delete_missed_by_down_store_is_copied_back() {
    let a = Arc::new(InMemoryStore::new());
    let b = Arc::new(InMemoryStore::new());
    let engine = engine_over(vec![StoreTarget::new("a", a.clone()), StoreTarget::new("b", b.clone())], ReplicaConfig::default());
    engine.create_account(user("123456"), &admin()).await.unwrap();

    b.set_available(false);
    let report = engine.delete_account("123456", &admin()).await.unwrap();
    assert_eq!(report.succeeded, 1);
    b.set_available(true);

    assert!(a.account("123456").is_none());
    assert!(b.account("123456").is_some(), "b missed the delete");

    // No tombstones: the next pass treats b's copy as missing from a.
    engine.reconcile_now().await;
    assert!(a.account("123456").is_some());
}

#[tokio::test]
async fn chaos_double_start_and_shutdown_without_start() {
    let engine = engine_over(vec![StoreTarget::new("a", Arc::new(InMemoryStore::new()))], ReplicaConfig::default());

    engine.shutdown().await;
    assert_eq!(engine.state(), EngineState::Stopped);

    let fresh = engine_over(vec![StoreTarget::new("a", Arc::new(InMemoryStore::new()))], ReplicaConfig::default());
    fresh.start().await;
    fresh.start().await;
    assert_eq!(fresh.state(), EngineState::Running);
    fresh.shutdown().await;
    fresh.shutdown().await;
    assert_eq!(fresh.state(), EngineState::Stopped);
}

#[tokio::test]
async fn chaos_operations_after_shutdown_still_reach_stores() {
    let a = Arc::new(InMemoryStore::new());
    let engine = engine_over(vec![StoreTarget::new("a", a.clone())], ReplicaConfig::default());
    engine.start().await;
    engine.shutdown().await;

    engine.create_account(user("123456"), &admin()).await.unwrap();
    assert!(a.account("123456").is_some());
}

#[tokio::test]
async fn chaos_concurrent_creates_while_store_flaps() {
    let a = Arc::new(InMemoryStore::new());
    let b = Arc::new(InMemoryStore::new());
    let engine = Arc::new(engine_over(vec![StoreTarget::new("a", a.clone()), StoreTarget::new("b", b.clone())], ReplicaConfig::default()));

    let mut handles = Vec::new();
    for i in 0..20u32 {
        let engine = engine.clone();
        let a = a.clone();
        handles.push(tokio::spawn(async move {
            if i % 5 == 0 {
                a.set_available(i % 10 != 0);
            }
            engine.create_account(user(&format!("{:06}", 100_000 + i)), &admin()).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.is_ok(), "b stays up, so every create must succeed: {result:?}");
    }
    a.set_available(true);

    assert_eq!(b.len(EntityKind::Account), 20);
    engine.reconcile_now().await;
    assert_eq!(a.len(EntityKind::Account), 20);
}

#[tokio::test]
async fn chaos_all_stores_failing_reads_is_unavailable() {
    let a = Arc::new(InMemoryStore::new());
    let engine = engine_over(
        vec![StoreTarget::new("a", Arc::new(FailingStore::fail_after(a, 0)))],
        ReplicaConfig::default(),
    );

    let err = engine.list_accounts().await.unwrap_err();
    match err {
        ReplicaError::Unavailable { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].store, "a");
        }
        other => panic!("unexpected {other:?}"),
    }
}
