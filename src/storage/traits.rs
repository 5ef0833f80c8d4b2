use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::record::{AuditEvent, EntityKind, Record, StoreId, StoredRecord};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Constraint violated on {kind}: {detail}")]
    Constraint { kind: EntityKind, detail: String },
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Circuit breaker open, request rejected")]
    CircuitOpen,
    #[error("Unsupported operation for {kind}: {operation}")]
    Unsupported { kind: EntityKind, operation: &'static str },
}

/// What an upsert did at the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row had the natural key; a fresh row was inserted.
    Inserted(StoreId),
    /// An existing row was overwritten.
    Updated(StoreId),
    /// An existing row already held identical values.
    Unchanged(StoreId),
}

impl UpsertOutcome {
    #[must_use]
    pub fn id(&self) -> StoreId {
        match self {
            Self::Inserted(id) | Self::Updated(id) | Self::Unchanged(id) => *id,
        }
    }
}

/// Filters accepted by audit queries. Results are newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditFilter {
    All,
    ByActor(String),
    /// Matched case-insensitively.
    ByAction(String),
    /// Matched case-insensitively.
    ByEntityKind(String),
    ByEntity { kind: String, id: String },
    /// Inclusive bounds, epoch millis.
    TimeRange { start_ms: i64, end_ms: i64 },
}

impl AuditFilter {
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        match self {
            Self::All => true,
            Self::ByActor(actor) => &event.actor_id == actor,
            Self::ByAction(action) => event.action.eq_ignore_ascii_case(action),
            Self::ByEntityKind(kind) => event.entity_kind.eq_ignore_ascii_case(kind),
            Self::ByEntity { kind, id } => {
                event.entity_kind.eq_ignore_ascii_case(kind)
                    && event.entity_id.as_deref() == Some(id.as_str())
            }
            Self::TimeRange { start_ms, end_ms } => event
                .timestamp_ms
                .is_some_and(|ts| ts >= *start_ms && ts <= *end_ms),
        }
    }
}

/// Uniform access to one physical backend.
///
/// Every method reports failure as a [`StorageError`] value. Adapters own
/// their connection/session and assign their own primary keys; those keys
/// never leave the adapter as anything but an opaque [`StoreId`].
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Locate a row by the record's natural key and overwrite its mutable
    /// fields, or insert a fresh row. Last writer wins; no version check.
    async fn upsert_by_natural_key(&self, record: &Record) -> Result<UpsertOutcome, StorageError>;

    /// Append a record; the store assigns the primary key.
    async fn insert(&self, record: &Record) -> Result<StoreId, StorageError>;

    async fn exists_by_id(&self, kind: EntityKind, id: StoreId) -> Result<bool, StorageError>;

    async fn find_all(&self, kind: EntityKind) -> Result<Vec<StoredRecord>, StorageError>;

    async fn find_by_natural_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> Result<Option<StoredRecord>, StorageError>;

    /// Returns whether a row was removed. Removing an absent key is not an error.
    async fn delete_by_natural_key(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError>;

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Query audit events. Default implementation filters `find_all`.
    async fn find_audit_events(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StorageError> {
        let mut events: Vec<AuditEvent> = self
            .find_all(EntityKind::AuditEvent)
            .await?
            .into_iter()
            .filter_map(|stored| match stored.record {
                Record::AuditEvent(event) if filter.matches(&event) => Some(event),
                _ => None,
            })
            .collect();
        events.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(events)
    }
}
