// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background reconciliation of drift between stores.
//!
//! A pass walks every (source, target) pair with `source != target` and pushes
//! records the target is missing or holds with different values. Kinds are
//! processed in [`EntityKind::ALL`] order and sources in priority order; a
//! source is read at the moment it is processed, so when two stores disagree
//! the earlier store's value wins the pass.
//!
//! Natural-keyed kinds are compared by key and value. Audit events have no
//! natural key and are deduplicated according to [`AuditDedup`]: by content
//! fingerprint, or by asking the target whether the source's primary key
//! exists in its own key space.
//!
//! A failure on one record, one target or one source is counted in the
//! [`ReconcileReport`] and never aborts the pass. At most one pass runs at a
//! time; a pass requested while another is in flight returns
//! [`PassOutcome::Skipped`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::AuditDedup;
use crate::error::TargetFailure;
use crate::fanout::{WriteFanout, WriteOp};
use crate::normalizer::{Normalizer, Validated};
use crate::record::{AuditEvent, EntityKind, Record, StoreId, StoredRecord};
use crate::storage::target::StoreTarget;
use crate::storage::traits::StorageError;

/// Which stores and kinds a pass covers. Store names not configured are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassScope {
    /// `None` = every store.
    pub sources: Option<Vec<String>>,
    /// `None` = every store.
    pub targets: Option<Vec<String>>,
    pub kinds: Vec<EntityKind>,
}

impl Default for PassScope {
    fn default() -> Self {
        Self::full()
    }
}

impl PassScope {
    #[must_use]
    pub fn full() -> Self {
        Self { sources: None, targets: None, kinds: EntityKind::ALL.to_vec() }
    }

    /// Push everything from `store` to the others.
    pub fn from_store(store: impl Into<String>) -> Self {
        Self { sources: Some(vec![store.into()]), ..Self::full() }
    }

    /// Fill `store` from the others.
    pub fn to_store(store: impl Into<String>) -> Self {
        Self { targets: Some(vec![store.into()]), ..Self::full() }
    }

    #[must_use]
    pub fn with_kinds(mut self, kinds: &[EntityKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    fn includes(filter: &Option<Vec<String>>, store: &str) -> bool {
        filter.as_ref().map_or(true, |names| names.iter().any(|n| n == store))
    }
}

/// Per-kind counts for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindReport {
    /// Source records compared against a target.
    pub examined: usize,
    /// Records written to a target.
    pub written: usize,
    /// Records the target already held.
    pub unchanged: usize,
    /// Records that could not be checked or written.
    pub failed: usize,
}

impl KindReport {
    fn add(&mut self, other: &KindReport) {
        self.examined += other.examined;
        self.written += other.written;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kinds: Vec<(EntityKind, KindReport)>,
    /// Sources whose records could not be read at all.
    pub unreadable_sources: Vec<TargetFailure>,
    pub duration: Duration,
}

impl ReconcileReport {
    #[must_use]
    pub fn kind(&self, kind: EntityKind) -> KindReport {
        self.kinds
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, report)| *report)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn totals(&self) -> KindReport {
        let mut total = KindReport::default();
        for (_, report) in &self.kinds {
            total.add(report);
        }
        total
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(ReconcileReport),
    /// Another pass was already running.
    Skipped,
}

impl PassOutcome {
    #[must_use]
    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped => None,
        }
    }
}

/// Clock used when completing records during a pass.
///
/// Must not depend on the wall clock: an event stored without a timestamp has
/// to complete to the same fingerprint on every pass and in every store.
const RECONCILE_CLOCK_MS: i64 = 0;

/// What reconciliation knows about one target's current rows.
enum TargetView {
    Keyed(HashMap<String, Record>),
    Fingerprints(HashSet<String>),
    /// `StoreId` dedup asks the target per record.
    ById,
    Unreadable(StorageError),
}

/// Clears the in-flight flag when the pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Reconciler {
    targets: Vec<StoreTarget>,
    fanout: WriteFanout,
    normalizer: Arc<Normalizer>,
    dedup: AuditDedup,
    running: AtomicBool,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("stores", &self.targets.len())
            .field("dedup", &self.dedup)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Reconciler {
    #[must_use]
    pub fn new(fanout: WriteFanout, normalizer: Arc<Normalizer>, dedup: AuditDedup) -> Self {
        Self {
            targets: fanout.targets().to_vec(),
            fanout,
            normalizer,
            dedup,
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Full pass over every store pair and kind.
    pub async fn run_pass(&self) -> PassOutcome {
        self.run_scoped(&PassScope::full()).await
    }

    #[tracing::instrument(skip(self), fields(stores = self.targets.len()))]
    pub async fn run_scoped(&self, scope: &PassScope) -> PassOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Reconciliation pass already running, skipping");
            crate::metrics::record_reconcile_pass("skipped");
            return PassOutcome::Skipped;
        }
        let _guard = PassGuard(&self.running);

        let start = Instant::now();
        let mut report = ReconcileReport::default();

        for kind in &scope.kinds {
            let kind_report = self.reconcile_kind(*kind, scope, &mut report.unreadable_sources).await;
            crate::metrics::record_reconcile_records(kind.as_str(), "written", kind_report.written);
            crate::metrics::record_reconcile_records(kind.as_str(), "unchanged", kind_report.unchanged);
            crate::metrics::record_reconcile_records(kind.as_str(), "failed", kind_report.failed);
            report.kinds.push((*kind, kind_report));
        }

        report.duration = start.elapsed();
        let totals = report.totals();
        crate::metrics::record_reconcile_pass("completed");
        crate::metrics::record_reconcile_duration(report.duration);
        info!(
            written = totals.written,
            unchanged = totals.unchanged,
            failed = totals.failed,
            unreadable_sources = report.unreadable_sources.len(),
            duration_ms = report.duration.as_millis() as u64,
            "Reconciliation pass complete"
        );

        PassOutcome::Completed(report)
    }

    async fn reconcile_kind(
        &self,
        kind: EntityKind,
        scope: &PassScope,
        unreadable: &mut Vec<TargetFailure>,
    ) -> KindReport {
        let mut report = KindReport::default();
        let mut views: HashMap<String, TargetView> = HashMap::new();
        let timeout = self.fanout.timeout();

        for source in self.targets.iter().filter(|t| PassScope::includes(&scope.sources, t.name())) {
            let rows = match source
                .call("find_all", timeout, |adapter| async move { adapter.find_all(kind).await })
                .await
            {
                Ok(rows) => rows,
                Err(error) => {
                    warn!(source = %source.name(), kind = %kind, error = %error, "Reconciliation source unreadable");
                    if !unreadable.iter().any(|f| f.store == source.name()) {
                        unreadable.push(TargetFailure { store: source.name().to_string(), error });
                    }
                    continue;
                }
            };
            debug!(source = %source.name(), kind = %kind, records = rows.len(), "Reconciling from source");

            for target in self
                .targets
                .iter()
                .filter(|t| t.name() != source.name() && PassScope::includes(&scope.targets, t.name()))
            {
                if !views.contains_key(target.name()) {
                    let view = self.load_view(kind, target).await;
                    views.insert(target.name().to_string(), view);
                }
                let Some(view) = views.get_mut(target.name()) else {
                    continue;
                };

                let pair = self.reconcile_pair(kind, &rows, target, view).await;
                if pair.written > 0 || pair.failed > 0 {
                    info!(
                        kind = %kind,
                        source = %source.name(),
                        target = %target.name(),
                        written = pair.written,
                        failed = pair.failed,
                        "Reconciled store pair"
                    );
                }
                report.add(&pair);
            }
        }

        report
    }

    async fn load_view(&self, kind: EntityKind, target: &StoreTarget) -> TargetView {
        if kind == EntityKind::AuditEvent && self.dedup == AuditDedup::StoreId {
            return TargetView::ById;
        }

        let rows = target
            .call("find_all", self.fanout.timeout(), |adapter| async move { adapter.find_all(kind).await })
            .await;

        match rows {
            Err(error) => {
                warn!(target = %target.name(), kind = %kind, error = %error, "Reconciliation target unreadable");
                TargetView::Unreadable(error)
            }
            Ok(rows) if kind.has_natural_key() => TargetView::Keyed(
                rows.into_iter()
                    .filter_map(|row| row.record.natural_key().map(str::to_string).map(|k| (k, row.record)))
                    .collect(),
            ),
            Ok(rows) => TargetView::Fingerprints(
                rows.into_iter()
                    .filter_map(|row| self.normalizer.normalize(row.record, RECONCILE_CLOCK_MS).ok())
                    .filter_map(|v| v.record().as_audit_event().map(AuditEvent::fingerprint))
                    .collect(),
            ),
        }
    }

    async fn reconcile_pair(
        &self,
        kind: EntityKind,
        rows: &[StoredRecord],
        target: &StoreTarget,
        view: &mut TargetView,
    ) -> KindReport {
        let mut report = KindReport { examined: rows.len(), ..Default::default() };

        if let TargetView::Unreadable(error) = view {
            debug!(target = %target.name(), kind = %kind, error = %error, "Skipping pair, target unreadable");
            report.failed = rows.len();
            return report;
        }

        for row in rows {
            let validated = match self.normalizer.normalize(row.record.clone(), RECONCILE_CLOCK_MS) {
                Ok(v) => v,
                Err(e) => {
                    warn!(target = %target.name(), kind = %kind, error = %e, "Source record failed validation");
                    report.failed += 1;
                    continue;
                }
            };

            match self.already_present(row.id, &validated, target, view).await {
                Ok(true) => {
                    report.unchanged += 1;
                    continue;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(target = %target.name(), kind = %kind, error = %error, "Existence check failed");
                    report.failed += 1;
                    continue;
                }
            }

            let record = validated.record().clone();
            let written = self
                .fanout
                .write_to(
                    &format!("reconcile_{}", kind.as_str().to_lowercase()),
                    WriteOp::store(validated),
                    std::slice::from_ref(target),
                )
                .await;

            if written.is_applied() {
                report.written += 1;
                remember(view, record);
            } else {
                report.failed += 1;
            }
        }

        report
    }

    async fn already_present(
        &self,
        source_id: StoreId,
        validated: &Validated,
        target: &StoreTarget,
        view: &TargetView,
    ) -> Result<bool, StorageError> {
        let record = validated.record();
        match view {
            TargetView::Keyed(rows) => Ok(record
                .natural_key()
                .and_then(|key| rows.get(key))
                .is_some_and(|existing| existing == record)),
            TargetView::Fingerprints(seen) => Ok(record
                .as_audit_event()
                .is_some_and(|event| seen.contains(&event.fingerprint()))),
            TargetView::ById => {
                target
                    .call("exists_by_id", self.fanout.timeout(), |adapter| async move {
                        adapter.exists_by_id(EntityKind::AuditEvent, source_id).await
                    })
                    .await
            }
            TargetView::Unreadable(error) => Err(error.clone()),
        }
    }

    /// Run passes every `interval` until the handle is stopped.
    ///
    /// A tick that comes due while a pass is still running is dropped.
    pub fn spawn(self: Arc<Self>, interval: Duration, run_immediately: bool) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if !run_immediately {
                // interval's first tick completes immediately
                ticker.tick().await;
            }
            info!(interval_secs = interval.as_secs(), "Reconciliation scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_pass().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Reconciliation scheduler stopped");
        });

        ReconcilerHandle { shutdown: shutdown_tx, task }
    }
}

fn remember(view: &mut TargetView, record: Record) {
    match view {
        TargetView::Keyed(rows) => {
            if let Some(key) = record.natural_key().map(str::to_string) {
                rows.insert(key, record);
            }
        }
        TargetView::Fingerprints(seen) => {
            if let Some(event) = record.as_audit_event() {
                seen.insert(event.fingerprint());
            }
        }
        TargetView::ById | TargetView::Unreadable(_) => {}
    }
}

/// Control handle for the background scheduler.
#[derive(Debug)]
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the scheduler and wait for it. A pass in flight completes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciliation scheduler task failed");
        }
    }
}
