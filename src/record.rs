// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated record types.
//!
//! Three entity kinds are replicated independently across stores. None of them
//! carries a global identifier: [`Account`] and [`ReferenceCode`] are correlated
//! across stores by their natural key (username / code string), while
//! [`AuditEvent`] is append-only and each store assigns its own primary key.
//!
//! # Example
//!
//! ```
//! use replica_sync::{Account, Record, Role, EntityKind};
//!
//! let account = Account::new("123456", "$2b$10$hash", Role::User);
//! let record = Record::from(account);
//!
//! assert_eq!(record.kind(), EntityKind::Account);
//! assert_eq!(record.natural_key(), Some("123456"));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Storage-local primary key. Never comparable across stores.
pub type StoreId = i64;

/// The replicated entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Account,
    ReferenceCode,
    AuditEvent,
}

impl EntityKind {
    /// All kinds, in reconciliation order.
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Account,
        EntityKind::ReferenceCode,
        EntityKind::AuditEvent,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Account => "ACCOUNT",
            Self::ReferenceCode => "REFERENCE_CODE",
            Self::AuditEvent => "AUDIT_EVENT",
        }
    }

    /// Whether records of this kind are located by natural key (upsert) rather
    /// than appended (insert).
    #[must_use]
    pub fn has_natural_key(&self) -> bool {
        !matches!(self, Self::AuditEvent)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "ADMIN",
            Self::User => "USER",
        }
    }

    /// Parse the stored representation (case-insensitive).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ADMIN" => Some(Self::Admin),
            "USER" => Some(Self::User),
            _ => None,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::User
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user account. Natural key: `username`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    /// Already-hashed password. Hashing happens outside the engine.
    pub password_hash: String,
    pub role: Role,
}

impl Account {
    pub fn new(username: impl Into<String>, password_hash: impl Into<String>, role: Role) -> Self {
        Self {
            username: username.into(),
            password_hash: password_hash.into(),
            role,
        }
    }
}

/// A reference code (e.g. a USSD short code). Natural key: `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCode {
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub active: bool,
}

impl ReferenceCode {
    pub fn new(code: impl Into<String>, description: impl Into<String>, active: bool) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
            active,
        }
    }
}

/// Well-known audit actions. Anything else is a custom tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
    Custom(String),
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Custom(tag) => tag,
        }
    }
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}/{} by {}",
            self.timestamp_ms.unwrap_or_default(),
            self.action,
            self.entity_kind,
            self.entity_id.as_deref().unwrap_or("-"),
            self.actor_id
        )
    }
}

/// One append-only audit record.
///
/// Required fields are plain strings that may be empty until the record has
/// passed through the [`Normalizer`](crate::Normalizer); after normalization
/// they are guaranteed non-blank and `timestamp_ms` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Creation time (epoch millis). Immutable once assigned.
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub actor_id: String,
    #[serde(default)]
    pub actor_name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub entity_kind: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Serialized diff or snapshot (JSON text).
    #[serde(default)]
    pub payload: Option<String>,
    /// Origin network address of the triggering request.
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

impl AuditEvent {
    /// Content fingerprint used to deduplicate audit events across stores.
    ///
    /// Covers everything that identifies the logical event (time, actor,
    /// action, subject, payload, details) and nothing store-local. Origin is
    /// left out: the normalizer may fill it in differently over time.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp_ms.unwrap_or_default().to_be_bytes());
        for part in [
            self.actor_id.as_str(),
            self.action.as_str(),
            self.entity_kind.as_str(),
            self.entity_id.as_deref().unwrap_or_default(),
            self.payload.as_deref().unwrap_or_default(),
            self.details.as_deref().unwrap_or_default(),
        ] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// A record of any kind, as it flows through the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Record {
    Account(Account),
    ReferenceCode(ReferenceCode),
    AuditEvent(AuditEvent),
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Account(_) => EntityKind::Account,
            Self::ReferenceCode(_) => EntityKind::ReferenceCode,
            Self::AuditEvent(_) => EntityKind::AuditEvent,
        }
    }

    /// Natural key, or `None` for append-only kinds.
    #[must_use]
    pub fn natural_key(&self) -> Option<&str> {
        match self {
            Self::Account(a) => a.natural_key(),
            Self::ReferenceCode(c) => c.natural_key(),
            Self::AuditEvent(e) => e.natural_key(),
        }
    }

    #[must_use]
    pub fn as_account(&self) -> Option<&Account> {
        match self {
            Self::Account(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_reference_code(&self) -> Option<&ReferenceCode> {
        match self {
            Self::ReferenceCode(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_audit_event(&self) -> Option<&AuditEvent> {
        match self {
            Self::AuditEvent(e) => Some(e),
            _ => None,
        }
    }
}

/// A record together with the primary key one particular store assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: StoreId,
    pub record: Record,
}

/// Typed access to one entity kind: its tag and natural-key extractor.
///
/// The fan-out and reconciliation code is written once against [`Record`];
/// this trait lets callers move between the typed entities and the record
/// enum without matching by hand.
pub trait Entity: Clone + Serialize + Sized + Send + Sync + 'static {
    const KIND: EntityKind;

    fn natural_key(&self) -> Option<&str>;

    fn into_record(self) -> Record;

    fn from_record(record: Record) -> Option<Self>;
}

impl Entity for Account {
    const KIND: EntityKind = EntityKind::Account;

    fn natural_key(&self) -> Option<&str> {
        Some(&self.username)
    }

    fn into_record(self) -> Record {
        Record::Account(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::Account(a) => Some(a),
            _ => None,
        }
    }
}

impl Entity for ReferenceCode {
    const KIND: EntityKind = EntityKind::ReferenceCode;

    fn natural_key(&self) -> Option<&str> {
        Some(&self.code)
    }

    fn into_record(self) -> Record {
        Record::ReferenceCode(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::ReferenceCode(c) => Some(c),
            _ => None,
        }
    }
}

impl Entity for AuditEvent {
    const KIND: EntityKind = EntityKind::AuditEvent;

    fn natural_key(&self) -> Option<&str> {
        None
    }

    fn into_record(self) -> Record {
        Record::AuditEvent(self)
    }

    fn from_record(record: Record) -> Option<Self> {
        match record {
            Record::AuditEvent(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Account> for Record {
    fn from(value: Account) -> Self {
        value.into_record()
    }
}

impl From<ReferenceCode> for Record {
    fn from(value: ReferenceCode) -> Self {
        value.into_record()
    }
}

impl From<AuditEvent> for Record {
    fn from(value: AuditEvent) -> Self {
        value.into_record()
    }
}

/// Current wall-clock time in epoch millis.
#[must_use]
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
