use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use crate::record::{Account, AuditEvent, EntityKind, Record, ReferenceCode, StoreId, StoredRecord};
use super::traits::{StorageError, StoreAdapter, UpsertOutcome};

/// In-process store adapter.
///
/// Used for embedded deployments and as the backend in tests: it can be taken
/// offline with [`set_available`](Self::set_available), can start its id
/// sequence at an arbitrary offset, and can enforce NOT-NULL constraints on
/// audit events the way the strictest relational backends do.
pub struct InMemoryStore {
    accounts: DashMap<String, (StoreId, Account)>,
    codes: DashMap<String, (StoreId, ReferenceCode)>,
    audit: DashMap<StoreId, AuditEvent>,
    next_id: AtomicI64,
    available: AtomicBool,
    strict: bool,
    inserts: AtomicU64,
    updates: AtomicU64,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_id_offset(1)
    }

    /// Start the primary-key sequence at `first_id`.
    #[must_use]
    pub fn with_id_offset(first_id: StoreId) -> Self {
        Self {
            accounts: DashMap::new(),
            codes: DashMap::new(),
            audit: DashMap::new(),
            next_id: AtomicI64::new(first_id),
            available: AtomicBool::new(true),
            strict: false,
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
        }
    }

    /// Reject audit events with blank required fields or no timestamp.
    #[must_use]
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Simulate the backend going offline / coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Rows inserted since creation (all kinds).
    #[must_use]
    pub fn insert_count(&self) -> u64 {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Rows overwritten since creation.
    #[must_use]
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Account => self.accounts.len(),
            EntityKind::ReferenceCode => self.codes.len(),
            EntityKind::AuditEvent => self.audit.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.codes.is_empty() && self.audit.is_empty()
    }

    /// Direct lookup, bypassing availability. For assertions.
    #[must_use]
    pub fn account(&self, username: &str) -> Option<Account> {
        self.accounts.get(username).map(|r| r.value().1.clone())
    }

    /// Direct lookup, bypassing availability. For assertions.
    #[must_use]
    pub fn reference_code(&self, code: &str) -> Option<ReferenceCode> {
        self.codes.get(code).map(|r| r.value().1.clone())
    }

    /// All audit events, oldest id first. Bypasses availability.
    #[must_use]
    pub fn audit_events(&self) -> Vec<AuditEvent> {
        let mut rows: Vec<(StoreId, AuditEvent)> =
            self.audit.iter().map(|r| (*r.key(), r.value().clone())).collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, e)| e).collect()
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StorageError::Unavailable("in-memory store offline".into()))
        }
    }

    fn allocate_id(&self) -> StoreId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn check_audit_constraints(&self, event: &AuditEvent) -> Result<(), StorageError> {
        if !self.strict {
            return Ok(());
        }
        let missing = [
            ("actor_id", event.actor_id.trim().is_empty()),
            ("actor_name", event.actor_name.trim().is_empty()),
            ("action", event.action.trim().is_empty()),
            ("entity_kind", event.entity_kind.trim().is_empty()),
            ("timestamp_ms", event.timestamp_ms.is_none()),
        ]
        .into_iter()
        .find(|(_, missing)| *missing);

        match missing {
            Some((column, _)) => Err(StorageError::Constraint {
                kind: EntityKind::AuditEvent,
                detail: format!("NOT NULL constraint failed: audit_events.{column}"),
            }),
            None => Ok(()),
        }
    }

    fn upsert_row<T: Clone + PartialEq>(
        &self,
        map: &DashMap<String, (StoreId, T)>,
        key: &str,
        value: &T,
    ) -> UpsertOutcome {
        match map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (id, current) = occupied.get_mut();
                if current == value {
                    UpsertOutcome::Unchanged(*id)
                } else {
                    *current = value.clone();
                    self.updates.fetch_add(1, Ordering::SeqCst);
                    UpsertOutcome::Updated(*id)
                }
            }
            Entry::Vacant(vacant) => {
                let id = self.allocate_id();
                vacant.insert((id, value.clone()));
                self.inserts.fetch_add(1, Ordering::SeqCst);
                UpsertOutcome::Inserted(id)
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    async fn upsert_by_natural_key(&self, record: &Record) -> Result<UpsertOutcome, StorageError> {
        self.check_available()?;
        match record {
            Record::Account(account) => Ok(self.upsert_row(&self.accounts, &account.username, account)),
            Record::ReferenceCode(code) => Ok(self.upsert_row(&self.codes, &code.code, code)),
            Record::AuditEvent(_) => Err(StorageError::Unsupported {
                kind: EntityKind::AuditEvent,
                operation: "upsert_by_natural_key",
            }),
        }
    }

    async fn insert(&self, record: &Record) -> Result<StoreId, StorageError> {
        self.check_available()?;
        match record {
            Record::AuditEvent(event) => {
                self.check_audit_constraints(event)?;
                let id = self.allocate_id();
                self.audit.insert(id, event.clone());
                self.inserts.fetch_add(1, Ordering::SeqCst);
                Ok(id)
            }
            other => {
                // Natural-keyed rows keep per-store uniqueness on insert too
                let key = other.natural_key().unwrap_or_default();
                let exists = match other {
                    Record::Account(_) => self.accounts.contains_key(key),
                    _ => self.codes.contains_key(key),
                };
                if exists {
                    return Err(StorageError::Constraint {
                        kind: other.kind(),
                        detail: format!("duplicate natural key '{key}'"),
                    });
                }
                Ok(self.upsert_by_natural_key(other).await?.id())
            }
        }
    }

    async fn exists_by_id(&self, kind: EntityKind, id: StoreId) -> Result<bool, StorageError> {
        self.check_available()?;
        Ok(match kind {
            EntityKind::Account => self.accounts.iter().any(|r| r.value().0 == id),
            EntityKind::ReferenceCode => self.codes.iter().any(|r| r.value().0 == id),
            EntityKind::AuditEvent => self.audit.contains_key(&id),
        })
    }

    async fn find_all(&self, kind: EntityKind) -> Result<Vec<StoredRecord>, StorageError> {
        self.check_available()?;
        let mut rows: Vec<StoredRecord> = match kind {
            EntityKind::Account => self
                .accounts
                .iter()
                .map(|r| StoredRecord { id: r.value().0, record: Record::Account(r.value().1.clone()) })
                .collect(),
            EntityKind::ReferenceCode => self
                .codes
                .iter()
                .map(|r| StoredRecord { id: r.value().0, record: Record::ReferenceCode(r.value().1.clone()) })
                .collect(),
            EntityKind::AuditEvent => self
                .audit
                .iter()
                .map(|r| StoredRecord { id: *r.key(), record: Record::AuditEvent(r.value().clone()) })
                .collect(),
        };
        rows.sort_by_key(|row| row.id);
        Ok(rows)
    }

    async fn find_by_natural_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> Result<Option<StoredRecord>, StorageError> {
        self.check_available()?;
        Ok(match kind {
            EntityKind::Account => self
                .accounts
                .get(key)
                .map(|r| StoredRecord { id: r.value().0, record: Record::Account(r.value().1.clone()) }),
            EntityKind::ReferenceCode => self
                .codes
                .get(key)
                .map(|r| StoredRecord { id: r.value().0, record: Record::ReferenceCode(r.value().1.clone()) }),
            EntityKind::AuditEvent => {
                return Err(StorageError::Unsupported { kind, operation: "find_by_natural_key" })
            }
        })
    }

    async fn delete_by_natural_key(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError> {
        self.check_available()?;
        match kind {
            EntityKind::Account => Ok(self.accounts.remove(key).is_some()),
            EntityKind::ReferenceCode => Ok(self.codes.remove(key).is_some()),
            EntityKind::AuditEvent => Err(StorageError::Unsupported { kind, operation: "delete_by_natural_key" }),
        }
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check_available()
    }
}
