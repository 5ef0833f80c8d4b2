// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write fan-out across every configured store.
//!
//! One logical write becomes one independent attempt per target, dispatched
//! concurrently. Each attempt ends as a [`TargetOutcome`] value; a failing
//! store never stops the others and is never raised on its own. The write as
//! a whole is applied when at least one target succeeded.
//!
//! ```text
//!                 ┌──────────► store A ──► Success(Upserted)
//!  WriteOp ──────►├──────────► store B ──► Failure(Timeout)
//!                 └──────────► store C ──► Success(Upserted)
//!                                   │
//!                     FanoutReport { succeeded: 2 }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{ReplicaError, TargetFailure};
use crate::normalizer::Validated;
use crate::record::{EntityKind, StoreId};
use crate::storage::target::StoreTarget;
use crate::storage::traits::{StorageError, UpsertOutcome};

/// The write to perform at each target.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Locate by natural key and overwrite, or insert fresh.
    Upsert(Validated),
    /// Append; the target assigns its own primary key.
    Insert(Validated),
    /// Remove by natural key. Absent keys are not an error.
    Delete { kind: EntityKind, key: String },
}

impl WriteOp {
    /// Upsert for natural-keyed kinds, insert for append-only ones.
    #[must_use]
    pub fn store(record: Validated) -> Self {
        if record.kind().has_natural_key() {
            Self::Upsert(record)
        } else {
            Self::Insert(record)
        }
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Upsert(r) | Self::Insert(r) => r.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Insert(_) => "insert",
            Self::Delete { .. } => "delete",
        }
    }
}

/// What a successful attempt did at its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted(UpsertOutcome),
    Inserted(StoreId),
    /// Whether a row was actually removed.
    Deleted(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Success(Applied),
    Failure(StorageError),
}

impl TargetOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub store: String,
    pub outcome: TargetOutcome,
}

/// Per-target outcomes of one fan-out, in target order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    pub operation: String,
    pub outcomes: Vec<StoreOutcome>,
    /// Number of targets that neither errored nor timed out.
    pub succeeded: usize,
}

impl FanoutReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// At least one target accepted the write.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.succeeded > 0
    }

    #[must_use]
    pub fn outcome_for(&self, store: &str) -> Option<&TargetOutcome> {
        self.outcomes.iter().find(|o| o.store == store).map(|o| &o.outcome)
    }

    #[must_use]
    pub fn failures(&self) -> Vec<TargetFailure> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                TargetOutcome::Failure(error) => Some(TargetFailure {
                    store: o.store.clone(),
                    error: error.clone(),
                }),
                TargetOutcome::Success(_) => None,
            })
            .collect()
    }

    /// Apply the at-least-one policy.
    pub fn into_result(self) -> Result<Self, ReplicaError> {
        if self.is_applied() {
            Ok(self)
        } else {
            Err(ReplicaError::AllTargetsFailed {
                failures: self.failures(),
                operation: self.operation,
            })
        }
    }
}

/// Writes one operation to many stores.
#[derive(Debug, Clone)]
pub struct WriteFanout {
    targets: Vec<StoreTarget>,
    timeout: Duration,
}

impl WriteFanout {
    #[must_use]
    pub fn new(targets: Vec<StoreTarget>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }

    #[must_use]
    pub fn targets(&self) -> &[StoreTarget] {
        &self.targets
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Write to every configured target.
    pub async fn write(&self, operation: &str, op: WriteOp) -> FanoutReport {
        self.write_to(operation, op, &self.targets).await
    }

    /// Write to the given targets only. Blocks until each has answered or
    /// timed out.
    pub async fn write_to(&self, operation: &str, op: WriteOp, targets: &[StoreTarget]) -> FanoutReport {
        let succeeded = Arc::new(AtomicUsize::new(0));
        let op = Arc::new(op);
        let mut tasks = JoinSet::new();

        for (index, target) in targets.iter().enumerate() {
            let target = target.clone();
            let op = op.clone();
            let succeeded = succeeded.clone();
            let timeout = self.timeout;
            let operation = operation.to_string();

            tasks.spawn(async move {
                let outcome = apply(&target, &op, timeout).await;
                match &outcome {
                    TargetOutcome::Success(applied) => {
                        succeeded.fetch_add(1, Ordering::SeqCst);
                        debug!(store = %target.name(), operation = %operation, ?applied, "Target write applied");
                        crate::metrics::record_target_write(target.name(), &operation, "success");
                    }
                    TargetOutcome::Failure(error) => {
                        warn!(store = %target.name(), operation = %operation, error = %error, "Target write failed");
                        let label = if matches!(error, StorageError::Timeout(_)) { "timeout" } else { "failure" };
                        crate::metrics::record_target_write(target.name(), &operation, label);
                    }
                }
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<TargetOutcome>> = vec![None; targets.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => warn!(operation = %operation, error = %e, "Fan-out task aborted"),
            }
        }

        let outcomes: Vec<StoreOutcome> = targets
            .iter()
            .zip(slots)
            .map(|(target, slot)| StoreOutcome {
                store: target.name().to_string(),
                outcome: slot.unwrap_or_else(|| {
                    TargetOutcome::Failure(StorageError::Backend("write task aborted".into()))
                }),
            })
            .collect();

        let succeeded = succeeded.load(Ordering::SeqCst);
        crate::metrics::record_fanout(operation, succeeded, outcomes.len());

        FanoutReport {
            operation: operation.to_string(),
            outcomes,
            succeeded,
        }
    }
}

async fn apply(target: &StoreTarget, op: &WriteOp, timeout: Duration) -> TargetOutcome {
    let result = match op {
        WriteOp::Upsert(record) => target
            .call("upsert", timeout, |adapter| async move {
                adapter.upsert_by_natural_key(record.record()).await
            })
            .await
            .map(Applied::Upserted),
        WriteOp::Insert(record) => target
            .call("insert", timeout, |adapter| async move { adapter.insert(record.record()).await })
            .await
            .map(Applied::Inserted),
        WriteOp::Delete { kind, key } => target
            .call("delete", timeout, |adapter| async move {
                adapter.delete_by_natural_key(*kind, key).await
            })
            .await
            .map(Applied::Deleted),
    };

    match result {
        Ok(applied) => TargetOutcome::Success(applied),
        Err(error) => TargetOutcome::Failure(error),
    }
}
