use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use anyhow::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    clients::{
        circuit_breaker::CircuitBreaker,
        degradation::ServiceDegradationManager,
        health::{HttpHealthChecker, StateStoreHealthChecker},
        health_monitor::HealthMonitor,
        recovery::RecoveryManager,
        redis::RedisStateStore,
        state_store::{FallbackStateStore, StateStore},
    },
    config::Config,
    models::{
        circuit_breaker::{CircuitConfig, CircuitMetrics},
        health::HealthReport,
        recovery::RecoveryStats,
    },
};

pub const STATE_STORE_CHECKER: &str = "state_store";

/// Owns every resilience component of the process. Built once in `main` and
/// shared behind an `Arc`.
pub struct Registry {
    config: Config,
    store: Arc<dyn StateStore>,
    circuits: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    monitor: Arc<HealthMonitor>,
    recovery: Arc<RecoveryManager>,
    degradation: Arc<ServiceDegradationManager<Value>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub store_backend: &'static str,
    pub monitor_running: bool,
    pub circuits: Vec<CircuitMetrics>,
    pub health: HealthReport,
    pub recovery: RecoveryStats,
}

impl Registry {
    pub async fn init(config: &Config) -> Result<Self, Error> {
        let store = build_state_store(config).await;
        Self::with_store(config, store)
    }

    pub fn with_store(config: &Config, store: Arc<dyn StateStore>) -> Result<Self, Error> {
        let monitor = Arc::new(HealthMonitor::new(config.health_check_interval()));
        let recovery = Arc::new(RecoveryManager::from_config(config)?);
        monitor.set_failure_handler(recovery.clone());

        for (name, url) in config.health_endpoints()? {
            let checker = HttpHealthChecker::new(name, url, config.health_check_timeout())?;
            monitor.register_checker(Arc::new(checker));
        }

        monitor.register_checker(Arc::new(StateStoreHealthChecker::new(
            STATE_STORE_CHECKER,
            Arc::clone(&store),
            config.health_check_timeout(),
        )));

        info!(backend = store.backend_name(), "Resilience registry initialized");

        Ok(Self {
            config: config.clone(),
            store,
            circuits: RwLock::new(HashMap::new()),
            monitor,
            recovery,
            degradation: Arc::new(ServiceDegradationManager::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    pub fn monitor(&self) -> Arc<HealthMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn recovery(&self) -> Arc<RecoveryManager> {
        Arc::clone(&self.recovery)
    }

    pub fn degradation(&self) -> Arc<ServiceDegradationManager<Value>> {
        Arc::clone(&self.degradation)
    }

    /// Returns the circuit named by `config`, creating it on first use. An
    /// existing circuit keeps its original configuration.
    pub fn circuit_breaker(&self, config: CircuitConfig) -> Arc<CircuitBreaker> {
        let mut circuits = self.circuits.write().unwrap_or_else(PoisonError::into_inner);

        let breaker = circuits
            .entry(config.name.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config, Arc::clone(&self.store))));

        Arc::clone(breaker)
    }

    pub fn circuit(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn circuit_defaults(&self, name: &str) -> CircuitConfig {
        self.config.circuit_config(name)
    }

    pub fn circuits(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut circuits: Vec<Arc<CircuitBreaker>> = self
            .circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        circuits.sort_by(|a, b| a.name().cmp(b.name()));
        circuits
    }

    pub fn start(&self) {
        self.monitor.start();
    }

    pub async fn shutdown(&self) {
        info!("Shutting down resilience registry");
        self.monitor.stop().await;
    }

    pub async fn status(&self) -> RegistryStatus {
        let mut circuits = Vec::new();
        for breaker in self.circuits() {
            circuits.push(breaker.metrics().await);
        }

        RegistryStatus {
            store_backend: self.store.backend_name(),
            monitor_running: self.monitor.is_running(),
            circuits,
            health: self.monitor.health_report(),
            recovery: self.recovery.recovery_stats(),
        }
    }
}

async fn build_state_store(config: &Config) -> Arc<dyn StateStore> {
    if config.redis_url.is_none() {
        info!("REDIS_URL not set, circuit state kept in memory");
        return Arc::new(FallbackStateStore::memory_only());
    }

    match RedisStateStore::connect(config).await {
        Ok(redis) => Arc::new(FallbackStateStore::new(Arc::new(redis), config.store_timeout())),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, circuit state kept in memory");
            Arc::new(FallbackStateStore::memory_only())
        }
    }
}
