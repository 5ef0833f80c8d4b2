// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational store adapter over the sqlx `Any` driver.
//!
//! One adapter instance owns one pool against one backend. SQLite, MySQL and
//! PostgreSQL are supported; the dialect is picked from the URL scheme and
//! only affects DDL and placeholder syntax.
//!
//! Schema (SQLite flavour):
//! ```sql
//! CREATE TABLE accounts (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,
//!   username TEXT NOT NULL UNIQUE,
//!   password_hash TEXT NOT NULL,
//!   role TEXT NOT NULL
//! );
//! CREATE TABLE reference_codes (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,
//!   code TEXT NOT NULL UNIQUE,
//!   description TEXT NOT NULL DEFAULT '',
//!   active INTEGER NOT NULL
//! );
//! CREATE TABLE audit_events (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,
//!   timestamp_ms INTEGER NOT NULL,
//!   actor_id TEXT NOT NULL,
//!   actor_name TEXT NOT NULL,
//!   action TEXT NOT NULL,
//!   entity_kind TEXT NOT NULL,
//!   entity_id TEXT, payload TEXT, origin TEXT, details TEXT
//! );
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver may hand TEXT columns back as BLOB on MySQL, so text is
//! read as `String` first and as `Vec<u8>` on failure. Booleans are stored as
//! integers because `Any` has no portable boolean mapping.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::traits::{AuditFilter, StorageError, StoreAdapter, UpsertOutcome};
use crate::record::{Account, AuditEvent, EntityKind, Record, ReferenceCode, Role, StoreId, StoredRecord};
use crate::resilience::retry::{retry, retry_if, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, StorageError> {
        let scheme = url.split(':').next().unwrap_or_default().to_ascii_lowercase();
        match scheme.as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(StorageError::Backend(format!("unsupported database scheme '{other}'"))),
        }
    }

    /// Rewrite `?` placeholders to `$n` where the backend needs it.
    fn placeholders(&self, sql: &str) -> String {
        if *self != Self::Postgres {
            return sql.to_string();
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0;
        for ch in sql.chars() {
            if ch == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                out.push(ch);
            }
        }
        out
    }

    fn schema(&self) -> [&'static str; 3] {
        match self {
            Self::Sqlite => [
                "CREATE TABLE IF NOT EXISTS accounts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    role TEXT NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS reference_codes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    code TEXT NOT NULL UNIQUE,
                    description TEXT NOT NULL DEFAULT '',
                    active INTEGER NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS audit_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp_ms INTEGER NOT NULL,
                    actor_id TEXT NOT NULL,
                    actor_name TEXT NOT NULL,
                    action TEXT NOT NULL,
                    entity_kind TEXT NOT NULL,
                    entity_id TEXT,
                    payload TEXT,
                    origin TEXT,
                    details TEXT
                )",
            ],
            Self::MySql => [
                "CREATE TABLE IF NOT EXISTS accounts (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    username VARCHAR(64) NOT NULL UNIQUE,
                    password_hash VARCHAR(255) NOT NULL,
                    role VARCHAR(16) NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS reference_codes (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    code VARCHAR(64) NOT NULL UNIQUE,
                    description TEXT NOT NULL,
                    active BIGINT NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS audit_events (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    timestamp_ms BIGINT NOT NULL,
                    actor_id VARCHAR(255) NOT NULL,
                    actor_name VARCHAR(255) NOT NULL,
                    action VARCHAR(64) NOT NULL,
                    entity_kind VARCHAR(64) NOT NULL,
                    entity_id VARCHAR(255),
                    payload LONGTEXT,
                    origin VARCHAR(64),
                    details TEXT,
                    INDEX idx_audit_timestamp (timestamp_ms),
                    INDEX idx_audit_entity (entity_kind, entity_id)
                )",
            ],
            Self::Postgres => [
                "CREATE TABLE IF NOT EXISTS accounts (
                    id BIGSERIAL PRIMARY KEY,
                    username VARCHAR(64) NOT NULL UNIQUE,
                    password_hash VARCHAR(255) NOT NULL,
                    role VARCHAR(16) NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS reference_codes (
                    id BIGSERIAL PRIMARY KEY,
                    code VARCHAR(64) NOT NULL UNIQUE,
                    description TEXT NOT NULL DEFAULT '',
                    active BIGINT NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS audit_events (
                    id BIGSERIAL PRIMARY KEY,
                    timestamp_ms BIGINT NOT NULL,
                    actor_id VARCHAR(255) NOT NULL,
                    actor_name VARCHAR(255) NOT NULL,
                    action VARCHAR(64) NOT NULL,
                    entity_kind VARCHAR(64) NOT NULL,
                    entity_id VARCHAR(255),
                    payload TEXT,
                    origin VARCHAR(64),
                    details TEXT
                )",
            ],
        }
    }
}

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Account => "accounts",
        EntityKind::ReferenceCode => "reference_codes",
        EntityKind::AuditEvent => "audit_events",
    }
}

fn key_column(kind: EntityKind) -> Result<&'static str, StorageError> {
    match kind {
        EntityKind::Account => Ok("username"),
        EntityKind::ReferenceCode => Ok("code"),
        EntityKind::AuditEvent => Err(StorageError::Unsupported { kind, operation: "natural key lookup" }),
    }
}

fn map_err(kind: EntityKind, err: sqlx::Error) -> StorageError {
    match &err {
        sqlx::Error::Database(db)
            if matches!(
                db.kind(),
                sqlx::error::ErrorKind::UniqueViolation | sqlx::error::ErrorKind::NotNullViolation
            ) =>
        {
            StorageError::Constraint { kind, detail: db.message().to_string() }
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_) => {
            StorageError::Unavailable(err.to_string())
        }
        _ => StorageError::Backend(err.to_string()),
    }
}

/// Read a text column, tolerating the `Any` driver returning it as bytes.
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    })
}

fn required_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| StorageError::Backend(format!("column '{column}' missing or null")))
}

fn id(row: &AnyRow) -> Result<StoreId, StorageError> {
    row.try_get::<i64, _>("id")
        .map_err(|e| StorageError::Backend(format!("bad id column: {e}")))
}

fn decode(kind: EntityKind, row: &AnyRow) -> Result<StoredRecord, StorageError> {
    let record = match kind {
        EntityKind::Account => {
            let role = required_text(row, "role")?;
            Record::Account(Account {
                username: required_text(row, "username")?,
                password_hash: required_text(row, "password_hash")?,
                role: Role::parse(&role)
                    .ok_or_else(|| StorageError::Backend(format!("unknown role '{role}'")))?,
            })
        }
        EntityKind::ReferenceCode => Record::ReferenceCode(ReferenceCode {
            code: required_text(row, "code")?,
            description: text(row, "description").unwrap_or_default(),
            active: row.try_get::<i64, _>("active").unwrap_or(0) != 0,
        }),
        EntityKind::AuditEvent => Record::AuditEvent(AuditEvent {
            timestamp_ms: row.try_get::<i64, _>("timestamp_ms").ok(),
            actor_id: text(row, "actor_id").unwrap_or_default(),
            actor_name: text(row, "actor_name").unwrap_or_default(),
            action: text(row, "action").unwrap_or_default(),
            entity_kind: text(row, "entity_kind").unwrap_or_default(),
            entity_id: text(row, "entity_id"),
            payload: text(row, "payload"),
            origin: text(row, "origin"),
            details: text(row, "details"),
        }),
    };
    Ok(StoredRecord { id: id(row)?, record })
}

fn columns(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Account => "id, username, password_hash, role",
        EntityKind::ReferenceCode => "id, code, description, active",
        EntityKind::AuditEvent => {
            "id, timestamp_ms, actor_id, actor_name, action, entity_kind, entity_id, payload, origin, details"
        }
    }
}

pub struct SqlStore {
    pool: AnyPool,
    dialect: Dialect,
    schema_ready: OnceCell<()>,
}

impl SqlStore {
    /// Build a store without touching the network.
    ///
    /// The pool connects on first use and the schema is created on the first
    /// call that needs it, so an unreachable backend at startup only shows up
    /// as per-call failures.
    pub fn lazy(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();
        let dialect = Dialect::from_url(url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy(url)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(Self { pool, dialect, schema_ready: OnceCell::new() })
    }

    /// Connect eagerly with retries and create the schema (fails if the backend
    /// stays unreachable).
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        install_drivers();
        let dialect = Dialect::from_url(url)?;

        let pool = retry_if(
            "sql_connect",
            &RetryConfig::connect(),
            || async {
                AnyPoolOptions::new()
                    .max_connections(max_connections.max(1))
                    .acquire_timeout(Duration::from_secs(10))
                    .idle_timeout(Duration::from_secs(300))
                    .connect(url)
                    .await
                    .map_err(|e| map_err(EntityKind::Account, e))
            },
            |e| matches!(e, StorageError::Unavailable(_)),
        )
        .await?;

        let store = Self { pool, dialect, schema_ready: OnceCell::new() };
        store.ensure_schema().await?;
        info!(dialect = ?dialect, "SQL store connected");
        Ok(store)
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn ensure_schema(&self) -> Result<(), StorageError> {
        self.schema_ready
            .get_or_try_init(|| async {
                retry("sql_init_schema", &RetryConfig::schema(), || async {
                    for ddl in self.dialect.schema() {
                        sqlx::query(ddl)
                            .execute(&self.pool)
                            .await
                            .map_err(|e| map_err(EntityKind::Account, e))?;
                    }
                    Ok::<(), StorageError>(())
                })
                .await?;
                debug!(dialect = ?self.dialect, "SQL schema ready");
                Ok::<(), StorageError>(())
            })
            .await
            .map(|_| ())
    }

    fn sql(&self, template: &str) -> String {
        self.dialect.placeholders(template)
    }

    async fn find_row(&self, kind: EntityKind, key: &str) -> Result<Option<StoredRecord>, StorageError> {
        let sql = self.sql(&format!(
            "SELECT {} FROM {} WHERE {} = ?",
            columns(kind),
            table(kind),
            key_column(kind)?
        ));
        let row = sqlx::query(&sql)
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err(kind, e))?;
        row.map(|r| decode(kind, &r)).transpose()
    }

    async fn insert_returning_id(&self, kind: EntityKind, sql: &str, binds: Vec<Bind>) -> Result<StoreId, StorageError> {
        if self.dialect == Dialect::Postgres {
            let sql = self.sql(&format!("{sql} RETURNING id"));
            let row = bind_all(sqlx::query(&sql), binds)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_err(kind, e))?;
            return id(&row);
        }

        let result = bind_all(sqlx::query(sql), binds)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err(kind, e))?;
        result
            .last_insert_id()
            .ok_or_else(|| StorageError::Backend(format!("{} insert returned no id", table(kind))))
    }

    async fn insert_row(&self, record: &Record) -> Result<StoreId, StorageError> {
        let kind = record.kind();
        match record {
            Record::Account(a) => {
                self.insert_returning_id(
                    kind,
                    "INSERT INTO accounts (username, password_hash, role) VALUES (?, ?, ?)",
                    vec![
                        Bind::Text(a.username.clone()),
                        Bind::Text(a.password_hash.clone()),
                        Bind::Text(a.role.as_str().to_string()),
                    ],
                )
                .await
            }
            Record::ReferenceCode(c) => {
                self.insert_returning_id(
                    kind,
                    "INSERT INTO reference_codes (code, description, active) VALUES (?, ?, ?)",
                    vec![
                        Bind::Text(c.code.clone()),
                        Bind::Text(c.description.clone()),
                        Bind::Int(i64::from(c.active)),
                    ],
                )
                .await
            }
            Record::AuditEvent(e) => {
                self.insert_returning_id(
                    kind,
                    "INSERT INTO audit_events \
                     (timestamp_ms, actor_id, actor_name, action, entity_kind, entity_id, payload, origin, details) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    vec![
                        Bind::OptInt(e.timestamp_ms),
                        Bind::Text(e.actor_id.clone()),
                        Bind::Text(e.actor_name.clone()),
                        Bind::Text(e.action.clone()),
                        Bind::Text(e.entity_kind.clone()),
                        Bind::OptText(e.entity_id.clone()),
                        Bind::OptText(e.payload.clone()),
                        Bind::OptText(e.origin.clone()),
                        Bind::OptText(e.details.clone()),
                    ],
                )
                .await
            }
        }
    }

    async fn update_row(&self, id: StoreId, record: &Record) -> Result<(), StorageError> {
        let kind = record.kind();
        let (sql, binds) = match record {
            Record::Account(a) => (
                "UPDATE accounts SET password_hash = ?, role = ? WHERE id = ?",
                vec![
                    Bind::Text(a.password_hash.clone()),
                    Bind::Text(a.role.as_str().to_string()),
                    Bind::Int(id),
                ],
            ),
            Record::ReferenceCode(c) => (
                "UPDATE reference_codes SET description = ?, active = ? WHERE id = ?",
                vec![
                    Bind::Text(c.description.clone()),
                    Bind::Int(i64::from(c.active)),
                    Bind::Int(id),
                ],
            ),
            Record::AuditEvent(_) => {
                return Err(StorageError::Unsupported { kind, operation: "update" });
            }
        };
        let sql = self.sql(sql);
        bind_all(sqlx::query(&sql), binds)
            .execute(&self.pool)
            .await
            .map_err(|e| map_err(kind, e))?;
        Ok(())
    }
}

/// Owned bind values, so statements can be assembled before execution.
enum Bind {
    Text(String),
    OptText(Option<String>),
    Int(i64),
    OptInt(Option<i64>),
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>>,
    binds: Vec<Bind>,
) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
    for bind in binds {
        query = match bind {
            Bind::Text(v) => query.bind(v),
            Bind::OptText(v) => query.bind(v),
            Bind::Int(v) => query.bind(v),
            Bind::OptInt(v) => query.bind(v),
        };
    }
    query
}

#[async_trait]
impl StoreAdapter for SqlStore {
    async fn upsert_by_natural_key(&self, record: &Record) -> Result<UpsertOutcome, StorageError> {
        let kind = record.kind();
        let key = record
            .natural_key()
            .ok_or(StorageError::Unsupported { kind, operation: "upsert_by_natural_key" })?;
        self.ensure_schema().await?;

        if let Some(existing) = self.find_row(kind, key).await? {
            if existing.record == *record {
                return Ok(UpsertOutcome::Unchanged(existing.id));
            }
            self.update_row(existing.id, record).await?;
            return Ok(UpsertOutcome::Updated(existing.id));
        }

        match self.insert_row(record).await {
            Ok(id) => Ok(UpsertOutcome::Inserted(id)),
            // Lost a race with a concurrent insert of the same key
            Err(StorageError::Constraint { .. }) => match self.find_row(kind, key).await? {
                Some(existing) => {
                    self.update_row(existing.id, record).await?;
                    Ok(UpsertOutcome::Updated(existing.id))
                }
                None => Err(StorageError::Backend(format!("{kind} '{key}' vanished during upsert"))),
            },
            Err(e) => Err(e),
        }
    }

    async fn insert(&self, record: &Record) -> Result<StoreId, StorageError> {
        self.ensure_schema().await?;
        self.insert_row(record).await
    }

    async fn exists_by_id(&self, kind: EntityKind, id: StoreId) -> Result<bool, StorageError> {
        self.ensure_schema().await?;
        let sql = self.sql(&format!("SELECT id FROM {} WHERE id = ?", table(kind)));
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_err(kind, e))?;
        Ok(row.is_some())
    }

    async fn find_all(&self, kind: EntityKind) -> Result<Vec<StoredRecord>, StorageError> {
        self.ensure_schema().await?;
        let sql = format!("SELECT {} FROM {} ORDER BY id", columns(kind), table(kind));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(kind, e))?;
        rows.iter().map(|row| decode(kind, row)).collect()
    }

    async fn find_by_natural_key(
        &self,
        kind: EntityKind,
        key: &str,
    ) -> Result<Option<StoredRecord>, StorageError> {
        key_column(kind)?;
        self.ensure_schema().await?;
        self.find_row(kind, key).await
    }

    async fn delete_by_natural_key(&self, kind: EntityKind, key: &str) -> Result<bool, StorageError> {
        let column = key_column(kind)?;
        self.ensure_schema().await?;
        let sql = self.sql(&format!("DELETE FROM {} WHERE {} = ?", table(kind), column));
        let result = sqlx::query(&sql)
            .bind(key.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| map_err(kind, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn find_audit_events(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, StorageError> {
        self.ensure_schema().await?;
        let kind = EntityKind::AuditEvent;

        let (clause, binds) = match filter {
            AuditFilter::All => ("", vec![]),
            AuditFilter::ByActor(actor) => (" WHERE actor_id = ?", vec![Bind::Text(actor.clone())]),
            AuditFilter::ByAction(action) => (" WHERE UPPER(action) = ?", vec![Bind::Text(action.to_uppercase())]),
            AuditFilter::ByEntityKind(k) => (" WHERE UPPER(entity_kind) = ?", vec![Bind::Text(k.to_uppercase())]),
            AuditFilter::ByEntity { kind: k, id } => (
                " WHERE UPPER(entity_kind) = ? AND entity_id = ?",
                vec![Bind::Text(k.to_uppercase()), Bind::Text(id.clone())],
            ),
            AuditFilter::TimeRange { start_ms, end_ms } => (
                " WHERE timestamp_ms >= ? AND timestamp_ms <= ?",
                vec![Bind::Int(*start_ms), Bind::Int(*end_ms)],
            ),
        };

        let sql = self.sql(&format!(
            "SELECT {} FROM audit_events{} ORDER BY timestamp_ms DESC, id DESC",
            columns(kind),
            clause
        ));
        let rows = bind_all(sqlx::query(&sql), binds)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_err(kind, e))?;

        rows.iter()
            .map(|row| {
                decode(kind, row).map(|stored| match stored.record {
                    Record::AuditEvent(event) => event,
                    _ => AuditEvent::default(),
                })
            })
            .collect()
    }
}
