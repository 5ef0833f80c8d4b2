// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Audit trail writer.
//!
//! Builds [`AuditEvent`]s for mutations and appends them to every store via
//! the fan-out. Update events carry a shallow field diff; create and delete
//! events carry a snapshot of the entity. Secret and identity fields never
//! appear in either.
//!
//! Writing an audit event cannot fail the operation that triggered it: every
//! method returns an [`AuditOutcome`] and a dropped event is only logged and
//! counted.
//!
//! # Diff format
//!
//! ```text
//! before {a:1, b:2, password:"x"}
//! after  {a:1, b:3, c:4, password:"y"}
//! diff   {b: {old:2, new:3}, c: {new:4}}
//! ```
//!
//! A removed field is recorded as `{old: v, new: null}`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use crate::fanout::{WriteFanout, WriteOp};
use crate::normalizer::Normalizer;
use crate::record::{now_millis, AuditAction, AuditEvent, Record};

/// Fields left out of diffs and snapshots.
pub const EXCLUDED_FIELDS: &[&str] = &["id", "timestamp", "timestamp_ms", "password", "password_hash"];

/// Who triggered a mutation, and from where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub display_name: String,
    pub origin: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            origin: None,
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// No identity; the normalizer attributes the event to the system actor.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    /// Appended at this many stores.
    Recorded { stores: usize },
    /// Not stored anywhere.
    Dropped { reason: String },
}

impl AuditOutcome {
    #[must_use]
    pub fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded { .. })
    }
}

/// Shallow field-level diff between two JSON objects.
///
/// Non-object inputs are treated as empty objects.
#[must_use]
pub fn compute_diff(before: &Value, after: &Value) -> Map<String, Value> {
    let empty = Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);
    let mut diff = Map::new();

    for (field, new) in after {
        if EXCLUDED_FIELDS.contains(&field.as_str()) {
            continue;
        }
        match before.get(field) {
            None => {
                let mut change = Map::new();
                change.insert("new".into(), new.clone());
                diff.insert(field.clone(), Value::Object(change));
            }
            Some(old) if old != new => {
                let mut change = Map::new();
                change.insert("old".into(), old.clone());
                change.insert("new".into(), new.clone());
                diff.insert(field.clone(), Value::Object(change));
            }
            Some(_) => {}
        }
    }

    for (field, old) in before {
        if EXCLUDED_FIELDS.contains(&field.as_str()) || after.contains_key(field) {
            continue;
        }
        let mut change = Map::new();
        change.insert("old".into(), old.clone());
        change.insert("new".into(), Value::Null);
        diff.insert(field.clone(), Value::Object(change));
    }

    diff
}

/// Serialize an entity and strip excluded fields.
#[must_use]
pub fn snapshot<T: Serialize>(entity: &T) -> Value {
    let mut value = serde_json::to_value(entity).unwrap_or(Value::Null);
    strip_excluded(&mut value);
    value
}

fn strip_excluded(value: &mut Value) {
    if let Some(fields) = value.as_object_mut() {
        fields.retain(|field, _| !EXCLUDED_FIELDS.contains(&field.as_str()));
    }
}

pub struct AuditWriter {
    fanout: WriteFanout,
    normalizer: Arc<Normalizer>,
    recorded: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for AuditWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditWriter")
            .field("recorded", &self.recorded())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl AuditWriter {
    #[must_use]
    pub fn new(fanout: WriteFanout, normalizer: Arc<Normalizer>) -> Self {
        Self {
            fanout,
            normalizer,
            recorded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Events stored on at least one store.
    #[must_use]
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Events lost because no store accepted them.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn record_create(
        &self,
        entity_kind: &str,
        entity_id: &str,
        entity: &Value,
        actor: &Actor,
    ) -> AuditOutcome {
        let payload = wrap_snapshot(&AuditAction::Create, entity);
        self.record_action(AuditAction::Create, entity_kind, Some(entity_id), Some(payload), None, actor)
            .await
    }

    pub async fn record_update(
        &self,
        entity_kind: &str,
        entity_id: &str,
        before: &Value,
        after: &Value,
        actor: &Actor,
    ) -> AuditOutcome {
        let diff = Value::Object(compute_diff(before, after));
        self.record_action(AuditAction::Update, entity_kind, Some(entity_id), Some(diff), None, actor)
            .await
    }

    pub async fn record_delete(
        &self,
        entity_kind: &str,
        entity_id: &str,
        entity: &Value,
        actor: &Actor,
    ) -> AuditOutcome {
        let payload = wrap_snapshot(&AuditAction::Delete, entity);
        self.record_action(AuditAction::Delete, entity_kind, Some(entity_id), Some(payload), None, actor)
            .await
    }

    /// Record an action outside CREATE/UPDATE/DELETE (e.g. `LOGIN`).
    pub async fn record_custom(
        &self,
        action: &str,
        entity_kind: &str,
        entity_id: Option<&str>,
        details: Option<&str>,
        actor: &Actor,
    ) -> AuditOutcome {
        self.record_action(
            AuditAction::Custom(action.to_uppercase()),
            entity_kind,
            entity_id,
            None,
            details.map(str::to_string),
            actor,
        )
        .await
    }

    async fn record_action(
        &self,
        action: AuditAction,
        entity_kind: &str,
        entity_id: Option<&str>,
        payload: Option<Value>,
        details: Option<String>,
        actor: &Actor,
    ) -> AuditOutcome {
        let event = AuditEvent {
            timestamp_ms: None,
            actor_id: actor.id.clone(),
            actor_name: actor.display_name.clone(),
            action: action.as_str().to_string(),
            entity_kind: entity_kind.to_string(),
            entity_id: entity_id.map(str::to_string),
            payload: payload.map(|p| p.to_string()),
            origin: actor.origin.clone(),
            details,
        };
        self.record(event).await
    }

    /// Normalize and append an arbitrary event.
    pub async fn record(&self, event: AuditEvent) -> AuditOutcome {
        let action = event.action.clone();

        let validated = match self.normalizer.normalize(Record::AuditEvent(event), now_millis()) {
            Ok(validated) => validated,
            Err(e) => return self.drop_event(&action, e.to_string()),
        };

        let report = self.fanout.write("audit", WriteOp::store(validated)).await;
        if report.is_applied() {
            self.recorded.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_audit(&action, "recorded");
            debug!(action = %action, stores = report.succeeded, "Audit event recorded");
            AuditOutcome::Recorded { stores: report.succeeded }
        } else {
            let reason = report
                .failures()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            self.drop_event(&action, reason)
        }
    }

    fn drop_event(&self, action: &str, reason: String) -> AuditOutcome {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_audit(action, "dropped");
        error!(action = %action, reason = %reason, "Audit event dropped");
        AuditOutcome::Dropped { reason }
    }
}

fn wrap_snapshot(action: &AuditAction, entity: &Value) -> Value {
    let mut redacted = entity.clone();
    strip_excluded(&mut redacted);
    let mut payload = Map::new();
    payload.insert(action.as_str().to_lowercase(), redacted);
    Value::Object(payload)
}
