//! Public types for the replication engine.

use serde::Serialize;

/// Engine lifecycle state.
///
/// Use [`super::ReplicaEngine::state()`] to check the current state or
/// [`super::ReplicaEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Constructed; inbound operations work, no background reconciliation
    Created,
    /// Background reconciliation scheduled
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    /// Scheduler stopped
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Live probe result for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    pub name: String,
    pub reachable: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot returned by [`super::ReplicaEngine::health_check()`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// One entry per store, in priority order.
    pub stores: Vec<StoreHealth>,
    pub reachable_stores: usize,
    /// A reconciliation pass is in flight.
    pub reconciling: bool,
    /// Audit events no store accepted since startup.
    pub audit_dropped: u64,
    /// Writes can be applied (at least one store reachable) and the engine is not stopping.
    pub healthy: bool,
}
