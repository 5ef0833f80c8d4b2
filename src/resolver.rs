// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority-ordered read fallback.
//!
//! Stores are queried one at a time in configured order. An error moves on to
//! the next store; the first answer wins. No attempt is made to compare values
//! between stores, so a lagging store earlier in the order can serve a stale
//! value.
//!
//! Two policies exist because "absent" means different things to different
//! reads:
//!
//! - [`ReadResolver::first_success`]: any clean answer ends the search, an
//!   empty list included. Used for listings.
//! - [`ReadResolver::first_present`]: absence falls through to the next store;
//!   `NotFound` is returned only after the whole order was walked and at least
//!   one store answered cleanly. Used for single-record lookups.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{ReplicaError, TargetFailure};
use crate::record::EntityKind;
use crate::storage::target::StoreTarget;
use crate::storage::traits::{StorageError, StoreAdapter};

/// A value together with the store that served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: String,
}

impl<T> Resolved<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        Resolved { value: f(self.value), source: self.source }
    }
}

#[derive(Debug, Clone)]
pub struct ReadResolver {
    targets: Vec<StoreTarget>,
    timeout: Duration,
}

impl ReadResolver {
    #[must_use]
    pub fn new(targets: Vec<StoreTarget>, timeout: Duration) -> Self {
        Self { targets, timeout }
    }

    #[must_use]
    pub fn targets(&self) -> &[StoreTarget] {
        &self.targets
    }

    /// Return the first answer that is not an error.
    pub async fn first_success<T, F, Fut>(&self, operation: &str, read: F) -> Result<Resolved<T>, ReplicaError>
    where
        F: Fn(Arc<dyn StoreAdapter>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        if self.targets.is_empty() {
            return Err(ReplicaError::NoStores);
        }

        let mut failures = Vec::new();
        for target in &self.targets {
            match target.call(operation, self.timeout, &read).await {
                Ok(value) => {
                    crate::metrics::record_read(operation, target.name(), "hit");
                    debug!(operation, store = %target.name(), "Read served");
                    return Ok(Resolved { value, source: target.name().to_string() });
                }
                Err(error) => {
                    crate::metrics::record_read(operation, target.name(), "error");
                    warn!(operation, store = %target.name(), error = %error, "Read failed, trying next store");
                    failures.push(TargetFailure { store: target.name().to_string(), error });
                }
            }
        }

        Err(ReplicaError::Unavailable { operation: operation.to_string(), failures })
    }

    /// Return the first `Some`, falling through on errors and on absence.
    pub async fn first_present<T, F, Fut>(
        &self,
        operation: &str,
        kind: EntityKind,
        key: &str,
        read: F,
    ) -> Result<Resolved<T>, ReplicaError>
    where
        F: Fn(Arc<dyn StoreAdapter>) -> Fut,
        Fut: Future<Output = Result<Option<T>, StorageError>>,
    {
        if self.targets.is_empty() {
            return Err(ReplicaError::NoStores);
        }

        let mut failures = Vec::new();
        let mut answered_absent = false;
        for target in &self.targets {
            match target.call(operation, self.timeout, &read).await {
                Ok(Some(value)) => {
                    crate::metrics::record_read(operation, target.name(), "hit");
                    debug!(operation, store = %target.name(), key, "Read served");
                    return Ok(Resolved { value, source: target.name().to_string() });
                }
                Ok(None) => {
                    crate::metrics::record_read(operation, target.name(), "absent");
                    answered_absent = true;
                }
                Err(error) => {
                    crate::metrics::record_read(operation, target.name(), "error");
                    warn!(operation, store = %target.name(), key, error = %error, "Read failed, trying next store");
                    failures.push(TargetFailure { store: target.name().to_string(), error });
                }
            }
        }

        if answered_absent {
            Err(ReplicaError::NotFound { kind, key: key.to_string() })
        } else {
            Err(ReplicaError::Unavailable { operation: operation.to_string(), failures })
        }
    }
}
