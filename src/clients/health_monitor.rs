use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use tokio::{
    sync::watch,
    task::{self, JoinHandle, JoinSet},
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};

use crate::{
    clients::health::HealthChecker,
    models::health::{HealthCheckResult, HealthReport, HealthStatus, HealthTransition, ServiceHealth},
};

pub type HealthChangeCallback = Arc<dyn Fn(HealthTransition) -> BoxFuture<'static, ()> + Send + Sync>;

pub type RecoveryCompleteCallback =
    Arc<dyn Fn(HealthTransition) -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives unhealthy results from the monitor.
#[async_trait]
pub trait FailureHandler: Send + Sync {
    async fn handle_service_failure(
        &self,
        service: &str,
        result: &HealthCheckResult,
        consecutive_failures: u32,
    );
}

pub struct HealthMonitor {
    check_interval: Duration,
    checkers: RwLock<HashMap<String, Arc<dyn HealthChecker>>>,
    health: RwLock<HashMap<String, ServiceHealth>>,
    change_callbacks: RwLock<Vec<HealthChangeCallback>>,
    recovery_callbacks: RwLock<HashMap<String, Vec<RecoveryCompleteCallback>>>,
    failure_handler: RwLock<Option<Arc<dyn FailureHandler>>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(check_interval: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            check_interval,
            checkers: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            change_callbacks: RwLock::new(Vec::new()),
            recovery_callbacks: RwLock::new(HashMap::new()),
            failure_handler: RwLock::new(None),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn register_checker(&self, checker: Arc<dyn HealthChecker>) {
        let service = checker.name().to_string();

        self.health
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.clone())
            .or_insert_with(|| ServiceHealth::new(&service));

        let replaced = self
            .checkers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.clone(), checker)
            .is_some();

        info!(service = %service, replaced, "Health checker registered");
    }

    pub fn unregister_checker(&self, service: &str) -> bool {
        let removed = self
            .checkers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service)
            .is_some();

        // The service's health entry stays for the life of the process.
        if removed {
            info!(service, "Health checker unregistered");
        }
        removed
    }

    pub fn on_health_change<F, Fut>(&self, callback: F)
    where
        F: Fn(HealthTransition) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: HealthChangeCallback = Arc::new(move |transition| Box::pin(callback(transition)));
        self.change_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Runs `callback` whenever `service` returns to healthy from a
    /// degraded or unhealthy state.
    pub fn on_recovery<F, Fut>(&self, service: &str, callback: F)
    where
        F: Fn(HealthTransition) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: RecoveryCompleteCallback =
            Arc::new(move |transition| Box::pin(callback(transition)));
        self.recovery_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_default()
            .push(callback);
    }

    pub fn set_failure_handler(&self, handler: Arc<dyn FailureHandler>) {
        *self
            .failure_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn failure_handler(&self) -> Option<Arc<dyn FailureHandler>> {
        self.failure_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);

        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("Health monitor already running");
            return;
        }

        self.shutdown.send_replace(false);
        let shutdown = self.shutdown.subscribe();
        let monitor = Arc::clone(self);

        *task = Some(tokio::spawn(monitor.run(shutdown)));

        info!(
            interval_secs = self.check_interval.as_secs_f64(),
            checkers = self.checker_count(),
            "Health monitor started"
        );
    }

    pub async fn stop(&self) {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(handle) = handle else {
            return;
        };

        self.shutdown.send_replace(true);

        if let Err(e) = handle.await {
            error!(error = %e, "Health monitor task terminated abnormally");
        }

        info!("Health monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut recoveries = JoinSet::new();
        // At most one recovery task per service.
        let mut in_flight: HashMap<task::Id, String> = HashMap::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let failures = self.run_checks().await;

                    if let Some(handler) = self.failure_handler() {
                        for (result, consecutive_failures) in failures {
                            if in_flight.values().any(|service| *service == result.service) {
                                debug!(service = %result.service, "Recovery already in progress, not dispatching");
                                continue;
                            }

                            let service = result.service.clone();
                            let handler = Arc::clone(&handler);
                            let spawned = recoveries.spawn(async move {
                                handler
                                    .handle_service_failure(&result.service, &result, consecutive_failures)
                                    .await;
                            });
                            in_flight.insert(spawned.id(), service);
                        }
                    }
                }
                Some(joined) = recoveries.join_next_with_id(), if !recoveries.is_empty() => {
                    let id = match joined {
                        Ok((id, ())) => id,
                        Err(e) => {
                            error!(error = %e, "Recovery task failed");
                            e.id()
                        }
                    };
                    in_flight.remove(&id);
                }
            }
        }

        if !recoveries.is_empty() {
            debug!(pending = recoveries.len(), "Aborting in-flight recovery tasks");
        }
        recoveries.shutdown().await;
    }

    fn checker_count(&self) -> usize {
        self.checkers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn snapshot_checkers(&self) -> Vec<Arc<dyn HealthChecker>> {
        self.checkers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Runs every checker once and folds the results in. Returns the
    /// unhealthy results with their consecutive failure counts.
    async fn run_checks(&self) -> Vec<(HealthCheckResult, u32)> {
        let checkers = self.snapshot_checkers();
        let results = join_all(checkers.iter().map(|checker| checker.check())).await;

        let mut failures = Vec::new();
        for result in results {
            if let Some(consecutive_failures) = self.process_result(&result).await {
                failures.push((result, consecutive_failures));
            }
        }

        failures
    }

    async fn process_result(&self, result: &HealthCheckResult) -> Option<u32> {
        let (old_status, consecutive_failures) = {
            let mut health = self.health.write().unwrap_or_else(PoisonError::into_inner);
            let entry = health
                .entry(result.service.clone())
                .or_insert_with(|| ServiceHealth::new(&result.service));

            let old_status = entry.status;
            entry.record(result);
            (old_status, entry.consecutive_failures)
        };

        metrics::counter!(
            "health_checks_total",
            "service" => result.service.clone(),
            "status" => result.status.as_str()
        )
        .increment(1);

        if old_status != result.status {
            let transition = HealthTransition {
                service: result.service.clone(),
                old_status,
                new_status: result.status,
                result: result.clone(),
            };
            self.notify_change(&transition).await;
        }

        (result.status == HealthStatus::Unhealthy).then_some(consecutive_failures)
    }

    async fn notify_change(&self, transition: &HealthTransition) {
        info!(
            service = %transition.service,
            from = %transition.old_status,
            to = %transition.new_status,
            "Service health changed"
        );

        let callbacks = self
            .change_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for callback in callbacks {
            invoke(&transition.service, "health change", callback(transition.clone())).await;
        }

        let recovered = transition.new_status == HealthStatus::Healthy
            && matches!(
                transition.old_status,
                HealthStatus::Degraded | HealthStatus::Unhealthy
            );

        if !recovered {
            return;
        }

        info!(service = %transition.service, "Service recovered");

        let callbacks = self
            .recovery_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&transition.service)
            .cloned()
            .unwrap_or_default();

        for callback in callbacks {
            invoke(&transition.service, "recovery", callback(transition.clone())).await;
        }
    }

    pub async fn check_now(&self) -> Vec<HealthCheckResult> {
        let checkers = self.snapshot_checkers();
        let results = join_all(checkers.iter().map(|checker| checker.check())).await;

        for result in &results {
            if let Some(consecutive_failures) = self.process_result(result).await {
                self.forward_failure(result, consecutive_failures).await;
            }
        }

        results
    }

    pub async fn check_service(&self, service: &str) -> Option<HealthCheckResult> {
        let checker = self
            .checkers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()?;

        let result = checker.check().await;
        if let Some(consecutive_failures) = self.process_result(&result).await {
            self.forward_failure(&result, consecutive_failures).await;
        }

        Some(result)
    }

    async fn forward_failure(&self, result: &HealthCheckResult, consecutive_failures: u32) {
        if let Some(handler) = self.failure_handler() {
            handler
                .handle_service_failure(&result.service, result, consecutive_failures)
                .await;
        }
    }

    pub fn service_health(&self, service: &str) -> Option<ServiceHealth> {
        self.health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    pub fn health_report(&self) -> HealthReport {
        let services = self
            .health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        HealthReport::from_services(services)
    }
}

// Callback panics are logged and swallowed.
async fn invoke(service: &str, kind: &'static str, callback: BoxFuture<'static, ()>) {
    if AssertUnwindSafe(callback).catch_unwind().await.is_err() {
        error!(service, callback = kind, "Health callback panicked");
    }
}
