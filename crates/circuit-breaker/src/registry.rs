//! Registry of named circuits.

use crate::circuit::{Admission, Circuit};
use crate::{CircuitBreakerError, CircuitBreakerOptions, CircuitState};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns every circuit in the process.
///
/// Each circuit sits behind its own mutex, held only for bookkeeping and
/// never across the guarded call.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    circuits: RwLock<HashMap<String, Arc<Mutex<Circuit>>>>,
    default_options: CircuitBreakerOptions,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose lazily created circuits use `options`.
    pub fn with_default_options(options: CircuitBreakerOptions) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            default_options: options,
        }
    }

    /// Register a circuit. Returns `false` and leaves the existing circuit
    /// untouched when the name is already registered.
    pub fn create_circuit(&self, name: &str, options: CircuitBreakerOptions) -> bool {
        let mut circuits = self.circuits.write();
        if circuits.contains_key(name) {
            warn!(circuit = name, "Circuit breaker already exists");
            return false;
        }

        info!(
            circuit = name,
            failure_threshold = options.failure_threshold,
            recovery_timeout_ms = options.recovery_timeout.as_millis() as u64,
            success_threshold = options.success_threshold,
            timeout_ms = options.timeout.as_millis() as u64,
            "Circuit breaker created"
        );
        circuits.insert(name.to_string(), Arc::new(Mutex::new(Circuit::new(options))));
        true
    }

    fn circuit(&self, name: &str) -> Arc<Mutex<Circuit>> {
        if let Some(circuit) = self.circuits.read().get(name) {
            return circuit.clone();
        }

        self.circuits
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = name, "Creating circuit breaker with default options");
                Arc::new(Mutex::new(Circuit::new(self.default_options.clone())))
            })
            .clone()
    }

    /// Run `operation` through the named circuit.
    ///
    /// Unknown names get a new CLOSED circuit with the registry's default
    /// options. An OPEN circuit fails fast without calling `operation`.
    pub async fn execute<F, Fut, T, E>(
        &self,
        name: &str,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let circuit = self.circuit(name);

        let admission = circuit.lock().admit(name);
        let timeout = match admission {
            Admission::Admitted { timeout } => timeout,
            Admission::Rejected => {
                return Err(CircuitBreakerError::Open {
                    name: name.to_string(),
                })
            }
        };

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                circuit.lock().on_success(name);
                Ok(value)
            }
            Ok(Err(e)) => {
                circuit.lock().on_failure(name);
                Err(CircuitBreakerError::Operation(e))
            }
            Err(_) => {
                circuit.lock().on_failure(name);
                Err(CircuitBreakerError::Timeout {
                    name: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Snapshot of a circuit, if registered.
    pub fn get_state(&self, name: &str) -> Option<CircuitState> {
        let circuit = self.circuits.read().get(name).cloned()?;
        let snapshot = circuit.lock().snapshot(name);
        Some(snapshot)
    }

    /// Registered circuit names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.circuits.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshots of every circuit, sorted by name.
    pub fn states(&self) -> Vec<CircuitState> {
        self.names()
            .iter()
            .filter_map(|name| self.get_state(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Boom;

    fn options() -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(1_000),
            success_threshold: 2,
            timeout: Duration::from_millis(100),
        }
    }

    async fn fail(registry: &CircuitBreakerRegistry, name: &str) -> CircuitBreakerError<Boom> {
        registry
            .execute(name, || async { Err::<(), _>(Boom) })
            .await
            .unwrap_err()
    }

    async fn succeed(registry: &CircuitBreakerRegistry, name: &str) -> Result<u32, CircuitBreakerError<Boom>> {
        registry.execute(name, || async { Ok::<_, Boom>(7) }).await
    }

    fn status(registry: &CircuitBreakerRegistry, name: &str) -> CircuitStatus {
        registry.get_state(name).unwrap().state
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_circuit_is_idempotent() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.create_circuit("svc", options()));

        let mut other = options();
        other.failure_threshold = 1;
        assert!(!registry.create_circuit("svc", other));

        // Threshold of 3 from the first registration still applies.
        fail(&registry, "svc").await;
        assert_eq!(status(&registry, "svc"), CircuitStatus::Closed);
        assert_eq!(registry.names(), vec!["svc".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_name_is_created_lazily_with_defaults() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.get_state("lazy").is_none());

        assert_eq!(succeed(&registry, "lazy").await.unwrap(), 7);
        let state = registry.get_state("lazy").unwrap();
        assert_eq!(state.state, CircuitStatus::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(state.last_failure_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let registry = CircuitBreakerRegistry::new();
        registry.create_circuit("svc", options());

        for _ in 0..3 {
            assert!(matches!(fail(&registry, "svc").await, CircuitBreakerError::Operation(Boom)));
        }
        let state = registry.get_state("svc").unwrap();
        assert_eq!(state.state, CircuitStatus::Open);
        assert_eq!(state.failure_count, 3);
        assert!(state.last_failure_at.is_some());

        let calls = AtomicUsize::new(0);
        let result = registry
            .execute("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Boom>(1)
            })
            .await;
        assert!(result.unwrap_err().is_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(succeed(&registry, "svc").await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes_after_threshold() {
        let registry = CircuitBreakerRegistry::new();
        registry.create_circuit("svc", options());
        for _ in 0..3 {
            fail(&registry, "svc").await;
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;

        let calls = AtomicUsize::new(0);
        let first = registry
            .execute("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Boom>(1)
            })
            .await;
        assert_eq!(first.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let state = registry.get_state("svc").unwrap();
        assert_eq!(state.state, CircuitStatus::HalfOpen);
        assert_eq!(state.success_count, 1);
        assert_eq!(state.failure_count, 0);

        succeed(&registry, "svc").await.unwrap();
        let state = registry.get_state("svc").unwrap();
        assert_eq!(state.state, CircuitStatus::Closed);
        assert_eq!(state.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let registry = CircuitBreakerRegistry::new();
        registry.create_circuit("svc", options());
        for _ in 0..3 {
            fail(&registry, "svc").await;
        }

        tokio::time::advance(Duration::from_millis(1_000)).await;
        succeed(&registry, "svc").await.unwrap();
        assert_eq!(status(&registry, "svc"), CircuitStatus::HalfOpen);

        fail(&registry, "svc").await;
        let state = registry.get_state("svc").unwrap();
        assert_eq!(state.state, CircuitStatus::Open);
        assert_eq!(state.success_count, 0);

        // Recovery window restarts from the failed trial.
        assert!(succeed(&registry, "svc").await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let registry = CircuitBreakerRegistry::new();
        let mut opts = options();
        opts.failure_threshold = 1;
        registry.create_circuit("slow", opts);

        let result = registry
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, Boom>(1)
            })
            .await;

        match result {
            Err(CircuitBreakerError::Timeout { name, timeout_ms }) => {
                assert_eq!(name, "slow");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(status(&registry, "slow"), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_failures_are_not_lost() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let mut opts = options();
        opts.failure_threshold = 1_000;
        registry.create_circuit("busy", opts);

        let calls = (0..50).map(|i| {
            let registry = registry.clone();
            async move {
                registry
                    .execute("busy", || async move {
                        tokio::time::sleep(Duration::from_millis(i % 7)).await;
                        Err::<(), _>(Boom)
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(registry.get_state("busy").unwrap().failure_count, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_half_open_successes_are_not_lost() {
        let registry = Arc::new(CircuitBreakerRegistry::new());
        let mut opts = options();
        opts.failure_threshold = 1;
        opts.success_threshold = 100;
        registry.create_circuit("recovering", opts);

        fail(&registry, "recovering").await;
        assert_eq!(status(&registry, "recovering"), CircuitStatus::Open);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        let calls = (0..20u64).map(|i| {
            let registry = registry.clone();
            async move {
                registry
                    .execute("recovering", || async move {
                        tokio::time::sleep(Duration::from_millis(i % 5)).await;
                        Ok::<_, Boom>(i)
                    })
                    .await
            }
        });
        let results = futures_util::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let state = registry.get_state("recovering").unwrap();
        assert_eq!(state.state, CircuitStatus::HalfOpen);
        assert_eq!(state.success_count, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_states_snapshot_serializes() {
        let registry = CircuitBreakerRegistry::new();
        registry.create_circuit("b", options());
        registry.create_circuit("a", options());

        let states = registry.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].name, "a");

        let json = serde_json::to_value(&states[0]).unwrap();
        assert_eq!(json["state"], "CLOSED");
    }
}
