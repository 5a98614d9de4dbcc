use std::{
    future::Future,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result};
use chrono::Utc;
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    clients::state_store::StateStore,
    error::{CircuitOpenError, CircuitTimeoutError},
    models::circuit_breaker::{
        CircuitConfig, CircuitMetrics, CircuitRuntimeState, CircuitState, PersistedCircuitState,
        Transition,
    },
    utils::elapsed_since,
};

/// Per-dependency circuit breaker whose state lives in a [`StateStore`].
///
/// A call holds the circuit's lock while it loads the stored state, runs the
/// protected operation and writes the state back, so concurrent callers of
/// one circuit are serialized while other circuits are unaffected.
///
/// A failure observed while half-open reopens the circuit straight away,
/// whatever the failure count.
pub struct CircuitBreaker {
    config: CircuitConfig,
    store: Arc<dyn StateStore>,
    state: Mutex<CircuitRuntimeState>,
    published: RwLock<CircuitRuntimeState>,
    blocked_calls: AtomicU64,
    fallback_calls: AtomicU64,
    timeouts: AtomicU64,
}

enum Admission {
    Proceed,
    Blocked { retry_after: Duration },
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, store: Arc<dyn StateStore>) -> Self {
        info!(
            circuit = %config.name,
            failure_threshold = config.failure_threshold,
            recovery_timeout_secs = config.recovery_timeout.as_secs_f64(),
            backend = store.backend_name(),
            "Circuit breaker initialized"
        );

        Self {
            config,
            store,
            state: Mutex::new(CircuitRuntimeState::default()),
            published: RwLock::new(CircuitRuntimeState::default()),
            blocked_calls: AtomicU64::new(0),
            fallback_calls: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.execute(operation, None::<fn() -> std::future::Ready<Result<T, Error>>>)
            .await
    }

    /// Like [`call`](Self::call), but an open circuit answers with `fallback`
    /// instead of [`CircuitOpenError`].
    pub async fn call_with_fallback<F, Fut, G, GFut, T>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, Error>>,
    {
        self.execute(operation, Some(fallback)).await
    }

    async fn execute<F, Fut, G, GFut, T>(
        &self,
        operation: F,
        fallback: Option<G>,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = Result<T, Error>>,
    {
        let mut state = self.state.lock().await;
        self.load(&mut state).await;
        self.publish(&state);
        state.total_calls += 1;

        if let Admission::Blocked { retry_after } = self.admit(&mut state) {
            self.blocked_calls.fetch_add(1, Ordering::Relaxed);
            state.total_failures += 1;
            self.persist(&state).await;
            drop(state);

            self.record_outcome("blocked");

            if let Some(fallback) = fallback {
                self.fallback_calls.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.config.name, "Circuit open, serving fallback");
                return fallback().await;
            }

            warn!(
                circuit = %self.config.name,
                retry_after_ms = retry_after.as_millis() as u64,
                "Circuit breaker is open, rejecting request"
            );
            return Err(CircuitOpenError {
                circuit: self.config.name.clone(),
                retry_after,
            }
            .into());
        }

        let outcome = match self.config.call_timeout {
            Some(limit) => match timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    Err(CircuitTimeoutError {
                        circuit: self.config.name.clone(),
                        timeout: limit,
                    }
                    .into())
                }
            },
            None => operation().await,
        };

        match &outcome {
            Ok(_) => {
                self.on_success(&mut state);
                self.record_outcome("success");
            }
            Err(e) if self.config.trips_on(e) => {
                self.on_failure(&mut state, e);
                self.record_outcome("failure");
            }
            Err(e) => {
                debug!(
                    circuit = %self.config.name,
                    error = %e,
                    "Error outside failure classification, not counted"
                );
                self.record_outcome("ignored");
            }
        }

        self.persist(&state).await;
        outcome
    }

    fn admit(&self, state: &mut CircuitRuntimeState) -> Admission {
        match state.state {
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_time
                    .map(elapsed_since)
                    .unwrap_or(self.config.recovery_timeout);

                if elapsed >= self.config.recovery_timeout {
                    state.success_count = 0;
                    self.transition(state, CircuitState::HalfOpen);
                    Admission::Proceed
                } else {
                    Admission::Blocked {
                        retry_after: self.config.recovery_timeout - elapsed,
                    }
                }
            }
            CircuitState::HalfOpen => {
                if state.success_count >= self.config.half_open_max_calls {
                    // Stale record: enough probes already succeeded elsewhere.
                    self.close(state);
                }
                Admission::Proceed
            }
            CircuitState::Closed => Admission::Proceed,
        }
    }

    fn on_success(&self, state: &mut CircuitRuntimeState) {
        state.last_success_time = Some(Utc::now());
        state.total_successes += 1;

        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                debug!(
                    circuit = %self.config.name,
                    successes = state.success_count,
                    threshold = self.config.half_open_max_calls,
                    "Half-open probe succeeded"
                );

                if state.success_count >= self.config.half_open_max_calls {
                    self.close(state);
                    info!(circuit = %self.config.name, "Circuit breaker closed after successful recovery");
                }
            }
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, state: &mut CircuitRuntimeState, error: &Error) {
        state.failure_count += 1;
        state.total_failures += 1;
        state.last_failure_time = Some(Utc::now());

        debug!(
            circuit = %self.config.name,
            failures = state.failure_count,
            threshold = self.config.failure_threshold,
            error = %error,
            "Circuit breaker failure recorded"
        );

        match state.state {
            CircuitState::HalfOpen => {
                self.transition(state, CircuitState::Open);
                warn!(
                    circuit = %self.config.name,
                    "Circuit breaker reopened after failed recovery attempt"
                );
            }
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                self.transition(state, CircuitState::Open);
                warn!(
                    circuit = %self.config.name,
                    failures = state.failure_count,
                    "Circuit breaker opened due to consecutive failures"
                );
            }
            _ => {}
        }
    }

    // Closing is treated as the start of a fresh closed period.
    fn close(&self, state: &mut CircuitRuntimeState) {
        self.transition(state, CircuitState::Closed);
        state.success_count = 0;
        state.failure_count = 0;
    }

    fn transition(&self, state: &mut CircuitRuntimeState, to: CircuitState) {
        if let Some(transition) = state.transition_to(to) {
            info!(
                circuit = %self.config.name,
                from = %transition.from_state,
                to = %transition.to_state,
                failure_count = transition.failure_count,
                "Circuit breaker state transition"
            );
            metrics::gauge!("circuit_breaker_state", "circuit" => self.config.name.clone())
                .set(to.gauge_value());
        }
    }

    async fn load(&self, state: &mut CircuitRuntimeState) {
        let key = self.config.state_key();

        match self.store.get(&key).await {
            Ok(Some(blob)) => match PersistedCircuitState::decode(&blob) {
                Ok(record) => state.apply(&record),
                Err(e) => warn!(
                    circuit = %self.config.name,
                    error = %e,
                    "Discarding undecodable circuit state"
                ),
            },
            Ok(None) => state.clear_shared(),
            Err(e) => warn!(
                circuit = %self.config.name,
                error = %e,
                "Failed to load circuit state, using cached copy"
            ),
        }
    }

    async fn persist(&self, state: &CircuitRuntimeState) {
        self.publish(state);
        let key = self.config.state_key();

        let blob = match state.to_persisted().encode() {
            Ok(blob) => blob,
            Err(e) => {
                warn!(circuit = %self.config.name, error = %e, "Failed to encode circuit state");
                return;
            }
        };

        if let Err(e) = self.store.set(&key, &blob).await {
            warn!(circuit = %self.config.name, error = %e, "Failed to persist circuit state");
        }
    }

    fn publish(&self, state: &CircuitRuntimeState) {
        *self.published.write().unwrap_or_else(PoisonError::into_inner) = state.clone();
    }

    fn published(&self) -> CircuitRuntimeState {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // Latest copy overlaid with the stored record, without waiting on calls.
    async fn observe(&self) -> CircuitRuntimeState {
        let mut view = self.published();
        self.load(&mut view).await;
        view
    }

    fn record_outcome(&self, outcome: &'static str) {
        metrics::counter!(
            "circuit_breaker_calls_total",
            "circuit" => self.config.name.clone(),
            "outcome" => outcome
        )
        .increment(1);
    }

    pub async fn force_open(&self) {
        let mut state = self.state.lock().await;
        self.load(&mut state).await;

        state.failure_count = state.failure_count.max(self.config.failure_threshold);
        state.last_failure_time = Some(Utc::now());
        self.transition(&mut state, CircuitState::Open);
        warn!(circuit = %self.config.name, "Circuit breaker forced open");

        self.persist(&state).await;
    }

    pub async fn force_close(&self) {
        let mut state = self.state.lock().await;
        self.load(&mut state).await;

        self.close(&mut state);
        info!(circuit = %self.config.name, "Circuit breaker forced closed");

        self.persist(&state).await;
    }

    /// Back to a fresh closed circuit. Lifetime totals are kept.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.load(&mut state).await;

        self.close(&mut state);
        state.last_failure_time = None;
        state.last_success_time = None;
        info!(circuit = %self.config.name, "Circuit breaker reset");

        self.persist(&state).await;
    }

    pub async fn state(&self) -> CircuitState {
        self.observe().await.state
    }

    pub async fn transitions(&self) -> Vec<Transition> {
        self.published().transitions.into_iter().collect()
    }

    pub async fn metrics(&self) -> CircuitMetrics {
        let state = self.observe().await;

        CircuitMetrics {
            name: self.config.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_calls: state.total_calls,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            blocked_calls: self.blocked_calls.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            transitions: state.transitions.iter().cloned().collect(),
            config: self.config.snapshot(),
        }
    }
}
