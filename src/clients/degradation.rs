use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

use anyhow::{Error, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::{clients::circuit_breaker::CircuitBreaker, error::DegradationExhaustedError};

/// A re-invocable, zero-argument async operation.
pub type Operation<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, Error>> + Send + Sync>;

pub fn operation<T, F, Fut>(f: F) -> Operation<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[async_trait]
pub trait DegradationStrategy<T: Send + 'static>: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, primary: &Operation<T>) -> Result<T, Error>;
}

pub struct FallbackStrategy<T> {
    name: String,
    fallback: Operation<T>,
}

impl<T> FallbackStrategy<T> {
    pub fn new(name: impl Into<String>, fallback: Operation<T>) -> Self {
        Self {
            name: name.into(),
            fallback,
        }
    }
}

#[async_trait]
impl<T> DegradationStrategy<T> for FallbackStrategy<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, primary: &Operation<T>) -> Result<T, Error> {
        match primary().await {
            Ok(value) => Ok(value),
            Err(e) => {
                debug!(strategy = %self.name, error = %e, "Primary failed, invoking fallback");
                (self.fallback)().await
            }
        }
    }
}

struct CachedValue<T> {
    value: T,
    stored_at: Instant,
}

pub struct CacheFirstStrategy<T> {
    name: String,
    ttl: Duration,
    cache: Mutex<Option<CachedValue<T>>>,
    secondary: Option<Operation<T>>,
}

impl<T> CacheFirstStrategy<T>
where
    T: Clone,
{
    pub fn new(name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            ttl,
            cache: Mutex::new(None),
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Operation<T>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn cached(&self) -> Option<T> {
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache
            .as_ref()
            .filter(|entry| entry.stored_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn store(&self, value: T) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        *cache = Some(CachedValue {
            value,
            stored_at: Instant::now(),
        });
    }

    pub fn invalidate(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        *cache = None;
    }
}

#[async_trait]
impl<T> DegradationStrategy<T> for CacheFirstStrategy<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, primary: &Operation<T>) -> Result<T, Error> {
        if let Some(value) = self.cached() {
            debug!(strategy = %self.name, "Serving cached value");
            return Ok(value);
        }

        match primary().await {
            Ok(value) => {
                self.store(value.clone());
                Ok(value)
            }
            Err(e) => match &self.secondary {
                Some(secondary) => {
                    debug!(strategy = %self.name, error = %e, "Cache miss and primary failed, using secondary");
                    secondary().await
                }
                None => Err(e),
            },
        }
    }
}

pub struct DegradedModeStrategy<T> {
    name: String,
    response: T,
}

impl<T> DegradedModeStrategy<T> {
    pub fn new(name: impl Into<String>, response: T) -> Self {
        Self {
            name: name.into(),
            response,
        }
    }
}

#[async_trait]
impl<T> DegradationStrategy<T> for DegradedModeStrategy<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, primary: &Operation<T>) -> Result<T, Error> {
        match primary().await {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(strategy = %self.name, error = %e, "Serving degraded response");
                Ok(self.response.clone())
            }
        }
    }
}

pub struct CircuitBreakerStrategy {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerStrategy {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl<T> DegradationStrategy<T> for CircuitBreakerStrategy
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        self.breaker.name()
    }

    async fn execute(&self, primary: &Operation<T>) -> Result<T, Error> {
        let primary = Arc::clone(primary);
        self.breaker.call(move || primary()).await
    }
}

struct RankedStrategy<T: Send + 'static> {
    strategy: Arc<dyn DegradationStrategy<T>>,
    priority: i32,
}

pub struct DegradationManager<T: Send + 'static> {
    service: String,
    strategies: RwLock<Vec<RankedStrategy<T>>>,
}

impl<T> DegradationManager<T>
where
    T: Send + 'static,
{
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            strategies: RwLock::new(Vec::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Keeps the chain sorted by descending priority; equal priorities run in
    /// registration order.
    pub fn add_strategy(&self, strategy: Arc<dyn DegradationStrategy<T>>, priority: i32) {
        let mut strategies = self
            .strategies
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let position = strategies
            .iter()
            .position(|ranked| ranked.priority < priority)
            .unwrap_or(strategies.len());

        strategies.insert(position, RankedStrategy { strategy, priority });
    }

    pub fn strategy_names(&self) -> Vec<String> {
        let strategies = self.strategies.read().unwrap_or_else(PoisonError::into_inner);
        strategies
            .iter()
            .map(|ranked| ranked.strategy.name().to_string())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    pub async fn execute_with_degradation(&self, primary: &Operation<T>) -> Result<T, Error> {
        let chain: Vec<Arc<dyn DegradationStrategy<T>>> = {
            let strategies = self.strategies.read().unwrap_or_else(PoisonError::into_inner);
            strategies
                .iter()
                .map(|ranked| Arc::clone(&ranked.strategy))
                .collect()
        };

        if chain.is_empty() {
            return primary().await;
        }

        let mut failures = Vec::with_capacity(chain.len());

        for strategy in chain {
            match strategy.execute(primary).await {
                Ok(value) => {
                    debug!(service = %self.service, strategy = strategy.name(), "Strategy succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    debug!(service = %self.service, strategy = strategy.name(), error = %e, "Strategy failed");
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        warn!(
            service = %self.service,
            attempts = failures.len(),
            "All degradation strategies failed"
        );

        Err(DegradationExhaustedError {
            service: self.service.clone(),
            failures,
        }
        .into())
    }
}

pub const GLOBAL_CHAIN: &str = "global";

pub struct ServiceDegradationManager<T: Send + 'static> {
    services: RwLock<HashMap<String, Arc<DegradationManager<T>>>>,
    global: Arc<DegradationManager<T>>,
}

impl<T> Default for ServiceDegradationManager<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ServiceDegradationManager<T>
where
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            global: Arc::new(DegradationManager::new(GLOBAL_CHAIN)),
        }
    }

    /// Returns the service's chain, creating an empty one on first use.
    pub fn service(&self, service: &str) -> Arc<DegradationManager<T>> {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let manager = services.entry(service.to_string()).or_insert_with(|| {
            info!(service, "Degradation chain registered");
            Arc::new(DegradationManager::new(service))
        });
        Arc::clone(manager)
    }

    pub fn global(&self) -> Arc<DegradationManager<T>> {
        Arc::clone(&self.global)
    }

    pub fn add_strategy(&self, service: &str, strategy: Arc<dyn DegradationStrategy<T>>, priority: i32) {
        self.service(service).add_strategy(strategy, priority);
    }

    pub fn add_global_strategy(&self, strategy: Arc<dyn DegradationStrategy<T>>, priority: i32) {
        self.global.add_strategy(strategy, priority);
    }

    pub fn services(&self) -> Vec<String> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        services.keys().cloned().collect()
    }

    pub async fn call(&self, service: &str, primary: &Operation<T>) -> Result<T, Error> {
        let manager = {
            let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
            services.get(service).cloned()
        };

        let service_error = match manager {
            Some(manager) if !manager.is_empty() => {
                match manager.execute_with_degradation(primary).await {
                    Ok(value) => return Ok(value),
                    Err(e) => e,
                }
            }
            _ => return self.global.execute_with_degradation(primary).await,
        };

        if self.global.is_empty() {
            return Err(service_error);
        }

        info!(service, "Service chain exhausted, trying global fallback chain");
        self.global
            .execute_with_degradation(primary)
            .await
            .map_err(|global_error| {
                let mut failures = Vec::new();
                for error in [&service_error, &global_error] {
                    match error.downcast_ref::<DegradationExhaustedError>() {
                        Some(exhausted) => failures.extend(exhausted.failures.iter().cloned()),
                        None => failures.push(error.to_string()),
                    }
                }
                DegradationExhaustedError {
                    service: service.to_string(),
                    failures,
                }
                .into()
            })
    }
}
