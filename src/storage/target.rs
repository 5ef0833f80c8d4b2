//! A named store as seen by the fan-out and the read resolver.
//!
//! Every call made through a [`StoreTarget`] is bounded by a timeout and,
//! when configured, passes through the store's circuit breaker. Whatever
//! happens, the caller gets a `Result` back; nothing panics or propagates
//! across targets.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
use super::traits::{StorageError, StoreAdapter};

#[derive(Clone)]
pub struct StoreTarget {
    name: Arc<str>,
    adapter: Arc<dyn StoreAdapter>,
    circuit: Option<Arc<CircuitBreaker>>,
}

impl std::fmt::Debug for StoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTarget")
            .field("name", &self.name)
            .field("circuit", &self.circuit.is_some())
            .finish()
    }
}

impl StoreTarget {
    pub fn new(name: impl Into<String>, adapter: Arc<dyn StoreAdapter>) -> Self {
        Self {
            name: Arc::from(name.into()),
            adapter,
            circuit: None,
        }
    }

    /// Wrap this store's calls in a circuit breaker.
    #[must_use]
    pub fn with_circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = Some(Arc::new(CircuitBreaker::new(self.name.to_string(), config)));
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn adapter(&self) -> &Arc<dyn StoreAdapter> {
        &self.adapter
    }

    #[must_use]
    pub fn circuit(&self) -> Option<&CircuitBreaker> {
        self.circuit.as_deref()
    }

    /// Run one adapter call with a timeout and the circuit breaker (if any).
    pub async fn call<T, F, Fut>(&self, operation: &str, timeout: Duration, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(Arc<dyn StoreAdapter>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let start = Instant::now();
        let adapter = self.adapter.clone();
        let bounded = async move {
            match tokio::time::timeout(timeout, f(adapter)).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout(timeout)),
            }
        };

        let result = match &self.circuit {
            Some(circuit) => circuit.call(|| bounded).await.map_err(|e| match e {
                CircuitError::Rejected => StorageError::CircuitOpen,
                CircuitError::Inner(inner) => inner,
            }),
            None => bounded.await,
        };

        crate::metrics::record_latency(&self.name, operation, start.elapsed());
        if matches!(result, Err(StorageError::Timeout(_))) {
            crate::metrics::record_timeout(&self.name, operation);
        }
        result
    }
}

/// Build targets from adapters, in priority order.
pub fn targets<I, S>(stores: I) -> Vec<StoreTarget>
where
    I: IntoIterator<Item = (S, Arc<dyn StoreAdapter>)>,
    S: Into<String>,
{
    stores
        .into_iter()
        .map(|(name, adapter)| StoreTarget::new(name, adapter))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EntityKind;
    use crate::storage::memory::InMemoryStore;

    #[tokio::test]
    async fn test_call_passes_through() {
        let store = Arc::new(InMemoryStore::new());
        let target = StoreTarget::new("a", store);

        let result = target
            .call("find_all", Duration::from_secs(1), |a| async move {
                a.find_all(EntityKind::Account).await
            })
            .await;
        assert_eq!(result.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let store = Arc::new(InMemoryStore::new());
        let target = StoreTarget::new("slow", store);

        let result: Result<(), StorageError> = target
            .call("sleep", Duration::from_millis(10), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(result, Err(StorageError::Timeout(Duration::from_millis(10))));
    }

    #[tokio::test]
    async fn test_open_circuit_maps_to_circuit_open() {
        let store = Arc::new(InMemoryStore::new());
        store.set_available(false);
        let target = StoreTarget::new("down", store).with_circuit(CircuitConfig {
            failure_rate: 0.5,
            window: 1,
            half_open_calls: 1,
            recovery_timeout: Duration::from_secs(60),
        });

        let mut errors = Vec::new();
        for _ in 0..3 {
            errors.push(
                target
                    .call("ping", Duration::from_secs(1), |a| async move { a.ping().await })
                    .await
                    .unwrap_err(),
            );
        }

        assert!(matches!(errors[0], StorageError::Unavailable(_)));
        assert!(errors.contains(&StorageError::CircuitOpen));
    }
}
