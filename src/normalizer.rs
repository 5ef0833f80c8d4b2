// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Record normalization and validation.
//!
//! Every record passes through [`Normalizer::normalize`] before any store sees
//! it. Accounts and reference codes are only checked: a malformed natural key
//! or a missing password hash is a [`ValidationError`], never a substitution.
//! Audit events are completed instead, in a fixed order:
//!
//! 1. blank entity kind → `UNKNOWN_ENTITY`
//! 2. blank action → `UNKNOWN_ACTION`
//! 3. blank actor id → actor name, else the system actor
//! 4. blank actor name → actor id
//! 5. missing timestamp → the supplied clock value
//! 6. blank origin → `0.0.0.0`
//!
//! The substitutions are idempotent, so a record may be normalized again when
//! reconciliation copies it to another store.
//!
//! # Example
//!
//! ```
//! use replica_sync::{AuditEvent, Normalizer, Record, ReplicaConfig};
//!
//! let normalizer = Normalizer::from_config(&ReplicaConfig::default()).unwrap();
//! let event = AuditEvent { actor_name: "alice".into(), ..Default::default() };
//!
//! let validated = normalizer.normalize(Record::from(event), 1_700_000_000_000).unwrap();
//! let event = validated.record().as_audit_event().unwrap();
//! assert_eq!(event.actor_id, "alice");
//! assert_eq!(event.timestamp_ms, Some(1_700_000_000_000));
//! ```

use regex::Regex;
use tracing::warn;

use crate::config::ReplicaConfig;
use crate::error::{ReplicaError, ValidationError};
use crate::record::{AuditEvent, EntityKind, Record};

pub const UNKNOWN_ENTITY: &str = "UNKNOWN_ENTITY";
pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
pub const ZERO_ADDRESS: &str = "0.0.0.0";

/// A record that has passed normalization. Only [`Normalizer`] can make one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated(Record);

impl Validated {
    #[must_use]
    pub fn record(&self) -> &Record {
        &self.0
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        self.0.kind()
    }

    #[must_use]
    pub fn into_inner(self) -> Record {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    username: Regex,
    reference_code: Regex,
    system_actor: String,
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

impl Normalizer {
    pub fn new(
        username_pattern: &str,
        reference_code_pattern: &str,
        system_actor: impl Into<String>,
    ) -> Result<Self, ReplicaError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| ReplicaError::Config(format!("bad pattern {pattern}: {e}")))
        };
        Ok(Self {
            username: compile(username_pattern)?,
            reference_code: compile(reference_code_pattern)?,
            system_actor: system_actor.into(),
        })
    }

    pub fn from_config(config: &ReplicaConfig) -> Result<Self, ReplicaError> {
        Self::new(
            &config.username_pattern,
            &config.reference_code_pattern,
            config.system_actor.clone(),
        )
    }

    #[must_use]
    pub fn system_actor(&self) -> &str {
        &self.system_actor
    }

    /// Validate and complete `record`. Pure apart from logging; `now_ms` is the
    /// clock value used for a missing audit timestamp.
    pub fn normalize(&self, record: Record, now_ms: i64) -> Result<Validated, ValidationError> {
        let result = match record {
            Record::Account(account) => {
                self.check_username(&account.username)?;
                if blank(&account.password_hash) {
                    crate::metrics::record_validation_failure(EntityKind::Account.as_str());
                    return Err(ValidationError::MissingPasswordHash { username: account.username });
                }
                Record::Account(account)
            }
            Record::ReferenceCode(code) => {
                self.check_reference_code(&code.code)?;
                Record::ReferenceCode(code)
            }
            Record::AuditEvent(event) => Record::AuditEvent(self.complete_audit(event, now_ms)),
        };
        Ok(Validated(result))
    }

    /// Check a bare natural key (lookups and deletes carry no record).
    pub fn validate_key(&self, kind: EntityKind, key: &str) -> Result<(), ValidationError> {
        match kind {
            EntityKind::Account => self.check_username(key),
            EntityKind::ReferenceCode => self.check_reference_code(key),
            EntityKind::AuditEvent => Ok(()),
        }
    }

    fn check_username(&self, username: &str) -> Result<(), ValidationError> {
        if self.username.is_match(username) {
            return Ok(());
        }
        crate::metrics::record_validation_failure(EntityKind::Account.as_str());
        Err(ValidationError::InvalidUsername {
            username: username.to_string(),
            pattern: self.username.as_str().to_string(),
        })
    }

    fn check_reference_code(&self, code: &str) -> Result<(), ValidationError> {
        if self.reference_code.is_match(code) {
            return Ok(());
        }
        crate::metrics::record_validation_failure(EntityKind::ReferenceCode.as_str());
        Err(ValidationError::InvalidReferenceCode {
            code: code.to_string(),
            pattern: self.reference_code.as_str().to_string(),
        })
    }

    fn complete_audit(&self, mut event: AuditEvent, now_ms: i64) -> AuditEvent {
        if blank(&event.entity_kind) {
            warn!("Audit event without entity kind, using {}", UNKNOWN_ENTITY);
            event.entity_kind = UNKNOWN_ENTITY.to_string();
        }
        if blank(&event.action) {
            warn!(entity_kind = %event.entity_kind, "Audit event without action, using {}", UNKNOWN_ACTION);
            event.action = UNKNOWN_ACTION.to_string();
        }
        if blank(&event.actor_id) {
            event.actor_id = if blank(&event.actor_name) {
                warn!(action = %event.action, "Audit event without actor, attributing to {}", self.system_actor);
                self.system_actor.clone()
            } else {
                event.actor_name.clone()
            };
        }
        if blank(&event.actor_name) {
            event.actor_name = event.actor_id.clone();
        }
        if event.timestamp_ms.is_none() {
            event.timestamp_ms = Some(now_ms);
        }
        if event.origin.as_deref().map_or(true, blank) {
            event.origin = Some(ZERO_ADDRESS.to_string());
        }
        event
    }
}
