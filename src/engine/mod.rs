// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine.
//!
//! The [`ReplicaEngine`] wires the components together and is the only thing
//! the application layer talks to:
//! - [`Normalizer`] validates every record before any store sees it
//! - [`WriteFanout`] applies each mutation to all stores (at least one must accept)
//! - [`ReadResolver`] serves reads in store priority order
//! - [`AuditWriter`] appends an audit event alongside every mutation
//! - [`Reconciler`] repairs drift in the background
//!
//! Stores are injected as [`StoreTarget`]s; their order is the read priority.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use replica_sync::{Account, Actor, EngineState, InMemoryStore, ReplicaConfig, ReplicaEngine, Role, StoreTarget};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let targets = vec![
//!     StoreTarget::new("a", Arc::new(InMemoryStore::new())),
//!     StoreTarget::new("b", Arc::new(InMemoryStore::new())),
//! ];
//! let engine = ReplicaEngine::new(ReplicaConfig::default(), targets).unwrap();
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! let admin = Actor::new("000001", "admin");
//! engine.create_account(Account::new("123456", "$2b$10$hash", Role::User), &admin).await.unwrap();
//!
//! let found = engine.find_account_by_username("123456").await.unwrap();
//! assert_eq!(found.source, "a");
//! # }
//! ```

mod types;
mod api;
mod lifecycle;

pub use types::{EngineState, HealthCheck, StoreHealth};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

use crate::audit::AuditWriter;
use crate::config::ReplicaConfig;
use crate::error::ReplicaError;
use crate::fanout::WriteFanout;
use crate::normalizer::Normalizer;
use crate::reconcile::{Reconciler, ReconcilerHandle};
use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resolver::ReadResolver;
use crate::storage::sql::SqlStore;
use crate::storage::target::StoreTarget;
use crate::storage::traits::StoreAdapter;

/// Multi-store replication engine.
///
/// `Send + Sync`; share it behind an `Arc`. All inbound operations take
/// `&self`.
pub struct ReplicaEngine {
    pub(super) config: ReplicaConfig,
    pub(super) normalizer: Arc<Normalizer>,
    pub(super) fanout: WriteFanout,
    pub(super) resolver: ReadResolver,
    pub(super) audit: AuditWriter,
    pub(super) reconciler: Arc<Reconciler>,

    /// Background scheduler, present while running
    pub(super) scheduler: Mutex<Option<ReconcilerHandle>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,
}

impl std::fmt::Debug for ReplicaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaEngine")
            .field("state", &self.state())
            .field("stores", &self.store_names())
            .finish()
    }
}

impl ReplicaEngine {
    /// Build an engine over already-constructed stores, in priority order.
    pub fn new(config: ReplicaConfig, targets: Vec<StoreTarget>) -> Result<Self, ReplicaError> {
        if targets.is_empty() {
            return Err(ReplicaError::NoStores);
        }

        let targets: Vec<StoreTarget> = if config.circuit_breaker {
            targets
                .into_iter()
                .map(|t| if t.circuit().is_some() { t } else { t.with_circuit(CircuitConfig::default()) })
                .collect()
        } else {
            targets
        };

        let normalizer = Arc::new(Normalizer::from_config(&config)?);
        let timeout = config.store_timeout();
        let fanout = WriteFanout::new(targets.clone(), timeout);
        let resolver = ReadResolver::new(targets, timeout);
        let audit = AuditWriter::new(fanout.clone(), normalizer.clone());
        let reconciler = Arc::new(Reconciler::new(fanout.clone(), normalizer.clone(), config.audit_dedup));
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        info!(stores = ?resolver.targets().iter().map(StoreTarget::name).collect::<Vec<_>>(), "Replica engine created");

        Ok(Self {
            config,
            normalizer,
            fanout,
            resolver,
            audit,
            reconciler,
            scheduler: Mutex::new(None),
            state: state_tx,
            state_rx,
        })
    }

    /// Build an engine over the SQL stores listed in `config.stores`.
    ///
    /// Pools connect lazily, so a store that is down at startup only degrades
    /// the operations that touch it.
    pub fn connect(config: ReplicaConfig) -> Result<Self, ReplicaError> {
        if config.stores.is_empty() {
            return Err(ReplicaError::NoStores);
        }

        let mut targets = Vec::with_capacity(config.stores.len());
        for store in &config.stores {
            let adapter = SqlStore::lazy(&store.url, store.max_connections)
                .map_err(|e| ReplicaError::Config(format!("store '{}': {}", store.name, e)))?;
            info!(store = %store.name, dialect = ?adapter.dialect(), "Configured SQL store");
            let adapter: Arc<dyn StoreAdapter> = Arc::new(adapter);
            targets.push(StoreTarget::new(store.name.clone(), adapter));
        }

        Self::new(config, targets)
    }

    #[must_use]
    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    #[must_use]
    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    #[must_use]
    pub fn audit(&self) -> &AuditWriter {
        &self.audit
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Store names in priority order.
    #[must_use]
    pub fn store_names(&self) -> Vec<String> {
        self.fanout.targets().iter().map(|t| t.name().to_string()).collect()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Probe every store concurrently.
    pub async fn health_check(&self) -> HealthCheck {
        let timeout = self.config.store_timeout();
        let mut probes = JoinSet::new();

        for (index, target) in self.fanout.targets().iter().enumerate() {
            let target = target.clone();
            probes.spawn(async move {
                let start = Instant::now();
                let result = target
                    .call("ping", timeout, |adapter| async move { adapter.ping().await })
                    .await;
                let health = StoreHealth {
                    name: target.name().to_string(),
                    reachable: result.is_ok(),
                    latency_ms: start.elapsed().as_millis() as u64,
                    error: result.err().map(|e| e.to_string()),
                };
                crate::metrics::set_store_healthy(&health.name, health.reachable);
                (index, health)
            });
        }

        let mut stores: Vec<(usize, StoreHealth)> = Vec::new();
        while let Some(joined) = probes.join_next().await {
            if let Ok(probe) = joined {
                stores.push(probe);
            }
        }
        stores.sort_by_key(|(index, _)| *index);
        let stores: Vec<StoreHealth> = stores.into_iter().map(|(_, health)| health).collect();

        let state = self.state();
        let reachable_stores = stores.iter().filter(|s| s.reachable).count();
        let healthy = reachable_stores > 0 && matches!(state, EngineState::Created | EngineState::Running);

        HealthCheck {
            state,
            stores,
            reachable_stores,
            reconciling: self.reconciler.is_running(),
            audit_dropped: self.audit.dropped(),
            healthy,
        }
    }
}
