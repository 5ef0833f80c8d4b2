// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic replica-sync usage example.
//!
//! Demonstrates:
//! 1. Three stores: two in-memory, one SQLite file
//! 2. A write while one store is down (succeeds on the others)
//! 3. Priority-ordered reads falling back past the dead store
//! 4. A reconciliation pass repairing the drift
//! 5. Role update with an audit diff, audit queries
//! 6. Health check, captured metrics, clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use replica_sync::{
    Account, Actor, AuditFilter, EntityKind, InMemoryStore, ReferenceCode, ReplicaConfig, ReplicaEngine, Role,
    SqlStore, StoreTarget,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           replica-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Stores in priority order
    // ─────────────────────────────────────────────────────────────────────────
    let db_path = std::env::temp_dir().join("replica_sync_demo.db");
    let _ = std::fs::remove_file(&db_path);

    let primary = Arc::new(InMemoryStore::new());
    let secondary = Arc::new(SqlStore::connect(&format!("sqlite://{}?mode=rwc", db_path.display()), 1).await?);
    let tertiary = Arc::new(InMemoryStore::new());

    let config = ReplicaConfig { reconcile_interval_secs: 0, ..Default::default() };
    let engine = ReplicaEngine::new(
        config,
        vec![
            StoreTarget::new("primary", primary.clone()),
            StoreTarget::new("secondary", secondary),
            StoreTarget::new("tertiary", tertiary.clone()),
        ],
    )?;
    engine.start().await;
    println!("📦 Engine running over {:?}", engine.store_names());

    let admin = Actor::new("000001", "admin").with_origin("10.0.0.7");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write with the primary down
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✍️  Creating account 123456 with primary offline...");
    primary.set_available(false);
    let report = engine
        .create_account(Account::new("123456", "$2b$10$demo", Role::User), &admin)
        .await?;
    println!("   accepted by {}/{} stores", report.succeeded, report.total());
    for failure in report.failures() {
        println!("   ⚠️  {failure}");
    }

    engine
        .create_reference_code(ReferenceCode::new("*100#", "balance", true), &admin)
        .await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read falls back
    // ─────────────────────────────────────────────────────────────────────────
    let found = engine.find_account_by_username("123456").await?;
    println!("\n🔍 Found {} ({}) via {}", found.value.username, found.value.role, found.source);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Repair drift
    // ─────────────────────────────────────────────────────────────────────────
    primary.set_available(true);
    println!("\n🔁 Primary back; missing rows: {}", primary.len(EntityKind::Account) == 0);
    if let Some(report) = engine.reconcile_now().await.report() {
        for (kind, counts) in &report.kinds {
            println!(
                "   {kind}: examined={} written={} unchanged={} failed={}",
                counts.examined, counts.written, counts.unchanged, counts.failed
            );
        }
    }
    let found = engine.find_account_by_username("123456").await?;
    println!("   now served by {}", found.source);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Update and audit
    // ─────────────────────────────────────────────────────────────────────────
    engine.update_account_role("123456", Role::Admin, &admin).await?;
    let updates = engine.list_audit_events(&AuditFilter::ByAction("UPDATE".into())).await?;
    for event in &updates.value {
        println!(
            "\n📝 {} {} {} by {}: {}",
            event.action,
            event.entity_kind,
            event.entity_id.as_deref().unwrap_or("-"),
            event.actor_name,
            event.payload.as_deref().unwrap_or("{}")
        );
    }
    let all = engine.list_audit_events(&AuditFilter::All).await?;
    println!("   {} audit events in total (from {})", all.value.len(), all.source);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Health, metrics, shutdown
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health_check().await;
    println!("\n🩺 Health:\n{}", serde_json::to_string_pretty(&health)?);

    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    let _ = std::fs::remove_file(&db_path);
    Ok(())
}

/// Dump all captured metrics
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters: Vec<(String, String, u64)> = Vec::new();
    let mut gauges: Vec<(String, String, f64)> = Vec::new();
    let mut histograms: Vec<(String, String, usize, f64)> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };
        let name = key.name().to_string();

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, samples.len(), sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    println!("   ┌─ Counters");
    for (name, labels, value) in &counters {
        println!("   │  └─ {name}{labels} = {value}");
    }
    println!("   ├─ Gauges");
    for (name, labels, value) in &gauges {
        println!("   │  └─ {name}{labels} = {value:.0}");
    }
    println!("   └─ Histograms");
    for (name, labels, count, sum) in &histograms {
        println!("      └─ {name}{labels} count={count} sum={sum:.4}");
    }
}
