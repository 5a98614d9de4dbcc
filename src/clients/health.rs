use std::{
    any::Any,
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::{FutureExt, future::BoxFuture};
use reqwest::Client;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, state_store::StateStore},
    models::{
        circuit_breaker::CircuitState,
        health::{HealthCheckResult, HealthStatus, ProbeOutcome},
    },
};

pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

pub type ProbeFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<HashMap<String, Value>, Error>> + Send + Sync>;

pub type OutcomeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<ProbeOutcome, Error>> + Send + Sync>;

/// A health probe for one service.
///
/// Implementations only write [`probe`](HealthChecker::probe); callers use
/// [`check`](HealthChecker::check), which bounds the probe by
/// [`timeout`](HealthChecker::timeout) and turns errors, panics and timeouts
/// into an unhealthy result.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    fn timeout(&self) -> Duration {
        DEFAULT_CHECK_TIMEOUT
    }

    async fn probe(&self) -> Result<ProbeOutcome, Error>;

    async fn check(&self) -> HealthCheckResult {
        let start = Instant::now();
        let limit = self.timeout();
        let guarded = AssertUnwindSafe(self.probe()).catch_unwind();

        match timeout(limit, guarded).await {
            Ok(Ok(Ok(outcome))) => {
                debug!(
                    service = self.name(),
                    status = %outcome.status,
                    response_time_ms = start.elapsed().as_millis() as u64,
                    "Health check completed"
                );
                HealthCheckResult::from_outcome(self.name(), outcome, start.elapsed())
            }
            Ok(Ok(Err(e))) => {
                warn!(service = self.name(), error = %e, "Health check failed");
                HealthCheckResult::unhealthy(self.name(), format!("{:#}", e), start.elapsed())
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!(service = self.name(), panic = %message, "Health probe panicked");
                HealthCheckResult::unhealthy(
                    self.name(),
                    format!("health probe panicked: {}", message),
                    start.elapsed(),
                )
            }
            Err(_) => {
                warn!(service = self.name(), timeout_ms = limit.as_millis() as u64, "Health check timed out");
                HealthCheckResult::unhealthy(
                    self.name(),
                    format!("health check timed out after {:?}", limit),
                    start.elapsed(),
                )
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct HttpHealthChecker {
    name: String,
    url: String,
    http_client: Client,
    timeout: Duration,
    expected_status: Option<u16>,
    degraded_after: Option<Duration>,
}

impl HttpHealthChecker {
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            name: name.into(),
            url: url.into(),
            http_client,
            timeout,
            expected_status: None,
            degraded_after: None,
        })
    }

    /// Only this status counts as healthy; by default any 2xx does.
    pub fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = Some(status);
        self
    }

    /// Healthy responses slower than `threshold` are reported as degraded.
    pub fn with_degraded_after(mut self, threshold: Duration) -> Self {
        self.degraded_after = Some(threshold);
        self
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn probe(&self) -> Result<ProbeOutcome, Error> {
        let start = Instant::now();
        let response = self.http_client.get(&self.url).send().await?;
        let elapsed = start.elapsed();
        let status = response.status();

        let accepted = match self.expected_status {
            Some(expected) => status.as_u16() == expected,
            None => status.is_success(),
        };

        if !accepted {
            return Err(anyhow!("{} returned status {}", self.url, status));
        }

        let outcome = ProbeOutcome::healthy()
            .with_detail("url", self.url.clone())
            .with_detail("status_code", status.as_u16());

        match self.degraded_after {
            Some(threshold) if elapsed > threshold => Ok(outcome
                .with_status(HealthStatus::Degraded)
                .with_detail("reason", "slow response")),
            _ => Ok(outcome),
        }
    }
}

pub struct StateStoreHealthChecker {
    name: String,
    store: Arc<dyn StateStore>,
    timeout: Duration,
}

impl StateStoreHealthChecker {
    pub fn new(name: impl Into<String>, store: Arc<dyn StateStore>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            store,
            timeout,
        }
    }
}

#[async_trait]
impl HealthChecker for StateStoreHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn probe(&self) -> Result<ProbeOutcome, Error> {
        self.store.ping().await?;
        Ok(ProbeOutcome::healthy().with_detail("backend", self.store.backend_name()))
    }
}

/// Checks a dependency through its own probe function. With a circuit
/// breaker attached, an open or half-open circuit reports degraded without
/// touching the dependency.
pub struct DependencyHealthChecker {
    name: String,
    probe: ProbeFn,
    breaker: Option<Arc<CircuitBreaker>>,
    timeout: Duration,
}

impl DependencyHealthChecker {
    pub fn new<F, Fut>(name: impl Into<String>, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<String, Value>, Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            probe: Arc::new(move || Box::pin(probe())),
            breaker: None,
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthChecker for DependencyHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn probe(&self) -> Result<ProbeOutcome, Error> {
        let circuit_state = match &self.breaker {
            Some(breaker) => Some(breaker.state().await),
            None => None,
        };

        match circuit_state {
            Some(CircuitState::Open) => {
                return Ok(ProbeOutcome::degraded("circuit breaker open")
                    .with_detail("circuit_breaker", CircuitState::Open.as_str()));
            }
            Some(CircuitState::HalfOpen) => {
                return Ok(ProbeOutcome::degraded("circuit breaker in recovery mode")
                    .with_detail("circuit_breaker", CircuitState::HalfOpen.as_str()));
            }
            _ => {}
        }

        let details = (self.probe)().await?;
        let mut outcome = ProbeOutcome::healthy().with_details(details);
        if let Some(state) = circuit_state {
            outcome = outcome.with_detail("circuit_breaker", state.as_str());
        }

        Ok(outcome)
    }
}

pub struct CallbackHealthChecker {
    name: String,
    callback: OutcomeFn,
    timeout: Duration,
}

impl CallbackHealthChecker {
    pub fn new<F, Fut>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ProbeOutcome, Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(move || Box::pin(callback())),
            timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HealthChecker for CallbackHealthChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn probe(&self) -> Result<ProbeOutcome, Error> {
        (self.callback)().await
    }
}
