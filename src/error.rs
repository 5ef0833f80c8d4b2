// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing errors.
//!
//! Failures are recovered at the smallest possible scope. A single store
//! failing is a [`StorageError`] value inside a fan-out report; it only
//! becomes a [`ReplicaError`] when no store made progress.

use thiserror::Error;

use crate::record::EntityKind;
use crate::storage::traits::StorageError;

/// A record was rejected before any store was touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("username '{username}' does not match pattern {pattern}")]
    InvalidUsername { username: String, pattern: String },
    #[error("reference code '{code}' does not match pattern {pattern}")]
    InvalidReferenceCode { code: String, pattern: String },
    #[error("account '{username}' has no password hash")]
    MissingPasswordHash { username: String },
}

/// One store's failure within an aggregate error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub store: String,
    pub error: StorageError,
}

impl std::fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.store, self.error)
    }
}

fn join_failures(failures: &[TargetFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Every target rejected the write; the operation was not applied.
    #[error("{operation} failed on every store: {}", join_failures(.failures))]
    AllTargetsFailed {
        operation: String,
        failures: Vec<TargetFailure>,
    },

    /// At least one store answered cleanly without a matching record.
    #[error("{kind} '{key}' not found")]
    NotFound { kind: EntityKind, key: String },

    /// Every store in the read order errored.
    #[error("{operation} unavailable, every store errored: {}", join_failures(.failures))]
    Unavailable {
        operation: String,
        failures: Vec<TargetFailure>,
    },

    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: EntityKind, key: String },

    #[error("no stores configured")]
    NoStores,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ReplicaError {
    /// Per-store reasons, when the error aggregates them.
    #[must_use]
    pub fn failures(&self) -> &[TargetFailure] {
        match self {
            Self::AllTargetsFailed { failures, .. } | Self::Unavailable { failures, .. } => failures,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_error_lists_every_store() {
        let err = ReplicaError::AllTargetsFailed {
            operation: "create_account".into(),
            failures: vec![
                TargetFailure { store: "a".into(), error: StorageError::Unavailable("down".into()) },
                TargetFailure { store: "b".into(), error: StorageError::Backend("boom".into()) },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("create_account"));
        assert!(msg.contains("a: Store unavailable: down"));
        assert!(msg.contains("b: Storage backend error: boom"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn test_validation_converts() {
        let err: ReplicaError = ValidationError::MissingPasswordHash { username: "123456".into() }.into();
        assert!(matches!(err, ReplicaError::Validation(_)));
        assert!(err.failures().is_empty());
    }
}
