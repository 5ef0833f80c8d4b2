//! Engine lifecycle: start, shutdown, manual reconciliation.

use std::time::Instant;
use tracing::{info, warn};

use crate::reconcile::{PassOutcome, PassScope};

use super::{EngineState, ReplicaEngine};

impl ReplicaEngine {
    /// Start background reconciliation.
    ///
    /// With `reconcile_interval_secs = 0` no scheduler is spawned; if
    /// `reconcile_on_start` is set a single pass still runs before this
    /// returns. Inbound operations work in every state, start or not.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) {
        // Claim the Created -> Running transition so concurrent starts spawn one scheduler
        let claimed = self.state.send_if_modified(|state| {
            if *state == EngineState::Created {
                *state = EngineState::Running;
                true
            } else {
                false
            }
        });
        if !claimed {
            warn!(state = %self.state(), "Engine already started");
            return;
        }

        info!(stores = ?self.store_names(), "Starting replica engine");

        match self.config.reconcile_interval() {
            Some(interval) => {
                let mut slot = self.scheduler.lock();
                // shutdown flips the state before taking the slot
                if self.state() == EngineState::Running {
                    *slot = Some(
                        self.reconciler
                            .clone()
                            .spawn(interval, self.config.reconcile_on_start),
                    );
                }
            }
            None => {
                info!("Periodic reconciliation disabled");
                if self.config.reconcile_on_start {
                    self.reconcile_now().await;
                }
            }
        }

        info!("Replica engine running");
    }

    /// Stop the scheduler, letting an in-flight pass finish.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.state() == EngineState::Stopped {
            return;
        }

        let shutdown_start = Instant::now();
        info!("Initiating replica engine shutdown...");
        let _ = self.state.send(EngineState::ShuttingDown);

        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let _ = self.state.send(EngineState::Stopped);
        info!(
            elapsed_ms = shutdown_start.elapsed().as_millis() as u64,
            audit_recorded = self.audit.recorded(),
            audit_dropped = self.audit.dropped(),
            "Replica engine shutdown complete"
        );
    }

    /// Run a full pass now. Returns `Skipped` if one is already running.
    pub async fn reconcile_now(&self) -> PassOutcome {
        self.reconciler.run_pass().await
    }

    /// Run a restricted pass, e.g. "everything from `a`" or "everything to `b`".
    pub async fn reconcile_scoped(&self, scope: &PassScope) -> PassOutcome {
        self.reconciler.run_scoped(scope).await
    }
}
