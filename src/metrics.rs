// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the replication engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter.
//!
//! # Metric Naming Convention
//! - `replica_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: configured store name
//! - `operation`: upsert, insert, delete, find_all, ...
//! - `outcome` / `status`: success, failure, timeout, skipped

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record one target's outcome within a fan-out
pub fn record_target_write(store: &str, operation: &str, outcome: &str) {
    counter!(
        "replica_target_writes_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record the aggregate result of a fan-out (applied / rejected)
pub fn record_fanout(operation: &str, succeeded: usize, total: usize) {
    let status = if succeeded == 0 {
        "rejected"
    } else if succeeded == total {
        "complete"
    } else {
        "partial"
    };
    counter!(
        "replica_fanout_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record latency of one store call
pub fn record_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "replica_target_latency_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a store call that hit its timeout
pub fn record_timeout(store: &str, operation: &str) {
    counter!(
        "replica_timeouts_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record which store answered a read (or why it didn't)
pub fn record_read(operation: &str, store: &str, status: &str) {
    counter!(
        "replica_reads_total",
        "operation" => operation.to_string(),
        "store" => store.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a rejected record
pub fn record_validation_failure(kind: &str) {
    counter!(
        "replica_validation_failures_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// RECONCILIATION
// ═══════════════════════════════════════════════════════════════════════════

/// Record per-record reconciliation results
pub fn record_reconcile_records(kind: &str, status: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "replica_reconcile_records_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(count as u64);
}

/// Record a pass (completed or skipped because one was in flight)
pub fn record_reconcile_pass(status: &str) {
    counter!(
        "replica_reconcile_passes_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record pass duration
pub fn record_reconcile_duration(duration: Duration) {
    histogram!("replica_reconcile_pass_seconds").record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// AUDIT
// ═══════════════════════════════════════════════════════════════════════════

/// Record an audit write result (recorded / dropped)
pub fn record_audit(action: &str, status: &str) {
    counter!(
        "replica_audit_events_total",
        "action" => action.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORE HEALTH
// ═══════════════════════════════════════════════════════════════════════════

/// Set store health status (1 = reachable, 0 = unreachable)
pub fn set_store_healthy(store: &str, healthy: bool) {
    gauge!(
        "replica_store_healthy",
        "store" => store.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "replica_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_fanout_status_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_fanout("create_account", 0, 3);
            record_fanout("create_account", 2, 3);
            record_fanout("create_account", 3, 3);
            record_reconcile_records("ACCOUNT", "written", 0);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let statuses: Vec<String> = snapshot
            .iter()
            .filter(|(key, _, _, _)| key.key().name() == "replica_fanout_total")
            .filter_map(|(key, _, _, value)| {
                assert!(matches!(value, DebugValue::Counter(1)));
                key.key()
                    .labels()
                    .find(|l| l.key() == "status")
                    .map(|l| l.value().to_string())
            })
            .collect();

        assert_eq!(statuses.len(), 3);
        assert!(statuses.contains(&"rejected".to_string()));
        assert!(statuses.contains(&"partial".to_string()));
        assert!(statuses.contains(&"complete".to_string()));

        // zero counts are not emitted
        assert!(!snapshot
            .iter()
            .any(|(key, _, _, _)| key.key().name() == "replica_reconcile_records_total"));
    }
}
