//! Inbound operations.
//!
//! Mutations:
//! - `create_account()` / `create_reference_code()` - reject duplicates, fan out, audit CREATE
//! - `update_account_role()` / `update_reference_code()` - resolve, upsert, audit UPDATE with diff
//! - `delete_account()` / `delete_reference_code()` - resolve, delete everywhere, audit DELETE
//!
//! Reads go through the resolver in store priority order:
//! - `find_account_by_username()`, `find_reference_code()`
//! - `list_accounts()`, `list_reference_codes()`, `list_audit_events()`
//!
//! A mutation returns `Ok` as soon as one store accepted it. The
//! [`FanoutReport`] says which stores did not.

use tracing::{debug, info, warn};

use crate::audit::{snapshot, Actor};
use crate::error::ReplicaError;
use crate::fanout::{FanoutReport, WriteOp};
use crate::record::{now_millis, Account, AuditEvent, Entity, ReferenceCode, Role};
use crate::resolver::Resolved;
use crate::storage::traits::{AuditFilter, StorageError};

use super::ReplicaEngine;

impl ReplicaEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // Accounts
    // ═══════════════════════════════════════════════════════════════════════════

    /// Create an account on every reachable store.
    ///
    /// Fails with [`ReplicaError::AlreadyExists`] if any store already holds
    /// the username, and with [`ReplicaError::AllTargetsFailed`] if no store
    /// accepted the write.
    #[tracing::instrument(skip(self, account, actor), fields(username = %account.username, actor = %actor.id))]
    pub async fn create_account(&self, account: Account, actor: &Actor) -> Result<FanoutReport, ReplicaError> {
        self.create_entity("create_account", account, actor).await
    }

    /// Change an account's role. The full current record is written, so a
    /// store that was missing the account receives it.
    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn update_account_role(
        &self,
        username: &str,
        role: Role,
        actor: &Actor,
    ) -> Result<FanoutReport, ReplicaError> {
        self.normalizer.validate_key(Account::KIND, username)?;
        let current = self.find_entity::<Account>("update_account_role", username).await?;

        let before = current.value;
        let mut after = before.clone();
        after.role = role;

        self.update_entity("update_account_role", username, &before, after, actor).await
    }

    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn delete_account(&self, username: &str, actor: &Actor) -> Result<FanoutReport, ReplicaError> {
        self.delete_entity::<Account>("delete_account", username, actor).await
    }

    /// Look an account up in store priority order.
    ///
    /// `NotFound` means at least one store answered and none had it;
    /// `Unavailable` means every store errored.
    #[tracing::instrument(skip(self))]
    pub async fn find_account_by_username(&self, username: &str) -> Result<Resolved<Account>, ReplicaError> {
        self.normalizer.validate_key(Account::KIND, username)?;
        self.find_entity("find_account", username).await
    }

    pub async fn list_accounts(&self) -> Result<Resolved<Vec<Account>>, ReplicaError> {
        self.list_entities("list_accounts").await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Reference codes
    // ═══════════════════════════════════════════════════════════════════════════

    #[tracing::instrument(skip(self, code, actor), fields(code = %code.code, actor = %actor.id))]
    pub async fn create_reference_code(
        &self,
        code: ReferenceCode,
        actor: &Actor,
    ) -> Result<FanoutReport, ReplicaError> {
        self.create_entity("create_reference_code", code, actor).await
    }

    /// Replace description and active flag of an existing code.
    #[tracing::instrument(skip(self, code, actor), fields(code = %code.code, actor = %actor.id))]
    pub async fn update_reference_code(
        &self,
        code: ReferenceCode,
        actor: &Actor,
    ) -> Result<FanoutReport, ReplicaError> {
        self.normalizer.validate_key(ReferenceCode::KIND, &code.code)?;
        let current = self.find_entity::<ReferenceCode>("update_reference_code", &code.code).await?;
        let key = code.code.clone();

        self.update_entity("update_reference_code", &key, &current.value, code, actor).await
    }

    #[tracing::instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn delete_reference_code(&self, code: &str, actor: &Actor) -> Result<FanoutReport, ReplicaError> {
        self.delete_entity::<ReferenceCode>("delete_reference_code", code, actor).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn find_reference_code(&self, code: &str) -> Result<Resolved<ReferenceCode>, ReplicaError> {
        self.normalizer.validate_key(ReferenceCode::KIND, code)?;
        self.find_entity("find_reference_code", code).await
    }

    pub async fn list_reference_codes(&self) -> Result<Resolved<Vec<ReferenceCode>>, ReplicaError> {
        self.list_entities("list_reference_codes").await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Audit trail
    // ═══════════════════════════════════════════════════════════════════════════

    /// Audit events matching `filter`, newest first, from the first store
    /// that answers.
    #[tracing::instrument(skip(self))]
    pub async fn list_audit_events(&self, filter: &AuditFilter) -> Result<Resolved<Vec<AuditEvent>>, ReplicaError> {
        self.resolver
            .first_success("list_audit_events", |adapter| {
                let filter = filter.clone();
                async move { adapter.find_audit_events(&filter).await }
            })
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Shared paths
    // ═══════════════════════════════════════════════════════════════════════════

    async fn create_entity<E: Entity>(
        &self,
        operation: &str,
        entity: E,
        actor: &Actor,
    ) -> Result<FanoutReport, ReplicaError> {
        let after = snapshot(&entity);
        let validated = self.normalizer.normalize(entity.into_record(), now_millis())?;
        let key = validated.record().natural_key().unwrap_or_default().to_string();

        match self.find_entity::<E>(operation, &key).await {
            Ok(existing) => {
                debug!(operation, key = %key, store = %existing.source, "Duplicate create rejected");
                return Err(ReplicaError::AlreadyExists { kind: E::KIND, key });
            }
            Err(ReplicaError::NotFound { .. }) => {}
            Err(ReplicaError::Unavailable { .. }) => {
                warn!(operation, key = %key, "Duplicate check unavailable, proceeding with create");
            }
            Err(e) => return Err(e),
        }

        let report = self.fanout.write(operation, WriteOp::store(validated)).await.into_result()?;
        info!(operation, key = %key, stores = report.succeeded, of = report.total(), "Created");

        self.audit.record_create(E::KIND.as_str(), &key, &after, actor).await;
        Ok(report)
    }

    async fn update_entity<E: Entity>(
        &self,
        operation: &str,
        key: &str,
        before: &E,
        after: E,
        actor: &Actor,
    ) -> Result<FanoutReport, ReplicaError> {
        let before = snapshot(before);
        let after_snapshot = snapshot(&after);
        let validated = self.normalizer.normalize(after.into_record(), now_millis())?;

        let report = self.fanout.write(operation, WriteOp::store(validated)).await.into_result()?;
        info!(operation, key, stores = report.succeeded, of = report.total(), "Updated");

        self.audit
            .record_update(E::KIND.as_str(), key, &before, &after_snapshot, actor)
            .await;
        Ok(report)
    }

    async fn delete_entity<E: Entity>(
        &self,
        operation: &str,
        key: &str,
        actor: &Actor,
    ) -> Result<FanoutReport, ReplicaError> {
        self.normalizer.validate_key(E::KIND, key)?;
        let current = self.find_entity::<E>(operation, key).await?;

        let op = WriteOp::Delete { kind: E::KIND, key: key.to_string() };
        let report = self.fanout.write(operation, op).await.into_result()?;
        info!(operation, key, stores = report.succeeded, of = report.total(), "Deleted");

        self.audit
            .record_delete(E::KIND.as_str(), key, &snapshot(&current.value), actor)
            .await;
        Ok(report)
    }

    async fn find_entity<E: Entity>(&self, operation: &str, key: &str) -> Result<Resolved<E>, ReplicaError> {
        let kind = E::KIND;
        let resolved = self
            .resolver
            .first_present(operation, kind, key, |adapter| {
                let key = key.to_string();
                async move { adapter.find_by_natural_key(kind, &key).await }
            })
            .await?;

        let source = resolved.source;
        match E::from_record(resolved.value.record) {
            Some(value) => Ok(Resolved { value, source }),
            None => Err(ReplicaError::Storage(StorageError::Backend(format!(
                "store '{source}' returned a record of the wrong kind for {kind} '{key}'"
            )))),
        }
    }

    async fn list_entities<E: Entity>(&self, operation: &str) -> Result<Resolved<Vec<E>>, ReplicaError> {
        let kind = E::KIND;
        let resolved = self
            .resolver
            .first_success(operation, |adapter| async move { adapter.find_all(kind).await })
            .await?;

        Ok(resolved.map(|rows| rows.into_iter().filter_map(|row| E::from_record(row.record)).collect()))
    }
}
