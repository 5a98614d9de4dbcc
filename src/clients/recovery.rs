use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::{Duration, Instant},
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use futures_util::FutureExt;
use tokio::{process::Command, sync::Mutex as AsyncMutex, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    clients::health_monitor::FailureHandler,
    config::Config,
    models::{
        health::HealthCheckResult,
        recovery::{RecoveryAction, RecoveryActionKind, RecoveryAttempt, RecoveryRule, RecoveryStats},
    },
    utils::exponential_delay,
};

const RECENT_FAILURES: usize = 10;

/// Carries out the built-in recovery actions.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, service: &str, action: RecoveryActionKind) -> Result<(), Error>;
}

/// Runs a shell command template per action. `{service}` in the template is
/// replaced with the failing service's name.
#[derive(Debug, Clone, Default)]
pub struct CommandActionRunner {
    commands: HashMap<RecoveryActionKind, String>,
}

impl CommandActionRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        let mut runner = Self::new();

        for kind in [
            RecoveryActionKind::Restart,
            RecoveryActionKind::ClearCache,
            RecoveryActionKind::ReconnectDependency,
            RecoveryActionKind::ReloadConfig,
            RecoveryActionKind::ScaleUp,
            RecoveryActionKind::ScaleDown,
        ] {
            if let Some(template) = config.recovery_command(kind) {
                runner = runner.with_command(kind, template);
            }
        }

        runner
    }

    pub fn with_command(mut self, action: RecoveryActionKind, template: impl Into<String>) -> Self {
        self.commands.insert(action, template.into());
        self
    }

    pub fn has_command(&self, action: RecoveryActionKind) -> bool {
        self.commands.contains_key(&action)
    }
}

#[async_trait]
impl ActionRunner for CommandActionRunner {
    async fn run(&self, service: &str, action: RecoveryActionKind) -> Result<(), Error> {
        let template = self
            .commands
            .get(&action)
            .ok_or_else(|| anyhow!("No command configured for {} on '{}'", action, service))?;

        let command = template.replace("{service}", service);
        debug!(service, action = %action, command = %command, "Running recovery command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn recovery command '{}': {}", command, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "Recovery command '{}' exited with {}: {}",
                command,
                output.status,
                stderr.trim()
            ));
        }

        Ok(())
    }
}

/// Rule-driven recovery for failing services.
///
/// At most one recovery runs per service at a time, and a service is not
/// retried within its rule's cooldown of the previous attempt. Failures
/// never reach the caller; they only show up in the attempt history.
pub struct RecoveryManager {
    rules: RwLock<Vec<RecoveryRule>>,
    runner: Arc<dyn ActionRunner>,
    service_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    last_attempt: Mutex<HashMap<String, Instant>>,
    active: Mutex<HashSet<String>>,
    history: RwLock<Vec<RecoveryAttempt>>,
    history_retention: Duration,
}

impl RecoveryManager {
    pub fn new(runner: Arc<dyn ActionRunner>, history_retention: Duration) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            runner,
            service_locks: Mutex::new(HashMap::new()),
            last_attempt: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            history: RwLock::new(Vec::new()),
            history_retention,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        let manager = Self::new(
            Arc::new(CommandActionRunner::from_config(config)),
            config.history_retention(),
        );

        for rule in config.recovery_rules()? {
            manager.add_rule(rule);
        }

        Ok(manager)
    }

    pub fn add_rule(&self, rule: RecoveryRule) {
        info!(
            service = %rule.service,
            action = %rule.action.kind(),
            threshold = rule.failure_threshold,
            "Recovery rule added"
        );
        self.rules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rule);
    }

    pub fn remove_rules(&self, service: &str) -> usize {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|rule| rule.service != service);
        before - rules.len()
    }

    pub fn set_rule_enabled(&self, service: &str, enabled: bool) -> usize {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let mut updated = 0;
        for rule in rules.iter_mut().filter(|rule| rule.service == service) {
            rule.enabled = enabled;
            updated += 1;
        }
        updated
    }

    pub fn rules(&self, service: &str) -> Vec<RecoveryRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|rule| rule.service == service)
            .cloned()
            .collect()
    }

    fn matching_rule(&self, service: &str, consecutive_failures: u32) -> Option<RecoveryRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|rule| {
                rule.service == service
                    && rule.enabled
                    && consecutive_failures >= rule.failure_threshold
            })
            .cloned()
    }

    fn service_lock(&self, service: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .service_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(service.to_string()).or_default())
    }

    fn in_cooldown(&self, service: &str, cooldown: Duration) -> bool {
        self.last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .is_some_and(|last| last.elapsed() < cooldown)
    }

    fn touch(&self, service: &str) {
        self.last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), Instant::now());
    }

    fn set_active(&self, service: &str, active: bool) {
        let mut recovering = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active {
            recovering.insert(service.to_string());
        } else {
            recovering.remove(service);
        }
    }

    fn record(&self, attempt: RecoveryAttempt) {
        metrics::counter!(
            "recovery_attempts_total",
            "service" => attempt.service.clone(),
            "action" => attempt.action.as_str(),
            "success" => if attempt.success { "true" } else { "false" }
        )
        .increment(1);

        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(attempt);
    }

    pub async fn handle_service_failure(
        &self,
        service: &str,
        result: &HealthCheckResult,
        consecutive_failures: u32,
    ) {
        let Some(rule) = self.matching_rule(service, consecutive_failures) else {
            debug!(service, consecutive_failures, "No recovery rule matched");
            return;
        };

        let lock = self.service_lock(service);
        let _guard = lock.lock().await;

        if self.in_cooldown(service, rule.cooldown_period) {
            debug!(service, "Recovery skipped, service in cooldown");
            return;
        }

        let active = ActiveRecovery::begin(self, service);
        self.execute_rule(&rule, result).await;
        drop(active);

        self.cleanup_history();
    }

    async fn execute_rule(&self, rule: &RecoveryRule, result: &HealthCheckResult) {
        let service = rule.service.as_str();
        let kind = rule.action.kind();

        if let RecoveryAction::ManualIntervention = rule.action {
            self.touch(service);
            error!(
                severity = "critical",
                service,
                error = result.error.as_deref().unwrap_or("unknown"),
                "Manual intervention required"
            );
            self.record(
                RecoveryAttempt::new(service, kind, 1)
                    .failed("manual intervention required".to_string()),
            );
            return;
        }

        info!(service, action = %kind, attempts = rule.retry_attempts, "Starting recovery");

        for attempt in 0..rule.retry_attempts {
            self.touch(service);

            match self.dispatch(service, &rule.action).await {
                Ok(()) => {
                    info!(service, action = %kind, attempt = attempt + 1, "Recovery succeeded");
                    self.record(RecoveryAttempt::new(service, kind, attempt + 1).succeeded());
                    return;
                }
                Err(e) => {
                    warn!(
                        service,
                        action = %kind,
                        attempt = attempt + 1,
                        error = %e,
                        "Recovery attempt failed"
                    );
                    self.record(RecoveryAttempt::new(service, kind, attempt + 1).failed(e.to_string()));

                    if attempt + 1 < rule.retry_attempts {
                        sleep(exponential_delay(rule.retry_delay, attempt)).await;
                    }
                }
            }
        }

        error!(
            severity = "critical",
            service,
            action = %kind,
            attempts = rule.retry_attempts,
            "Recovery failed after all retry attempts"
        );
    }

    async fn dispatch(&self, service: &str, action: &RecoveryAction) -> Result<(), Error> {
        match action {
            RecoveryAction::Custom(callback) => AssertUnwindSafe(callback())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow!("recovery callback panicked"))),
            other => self.runner.run(service, other.kind()).await,
        }
    }

    pub fn history(&self, service: &str) -> Vec<RecoveryAttempt> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|attempt| attempt.service == service)
            .cloned()
            .collect()
    }

    /// Drops attempts older than the retention window. Returns how many were
    /// removed.
    pub fn cleanup_history(&self) -> usize {
        let Some(cutoff) = TimeDelta::from_std(self.history_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let before = history.len();
        history.retain(|attempt| attempt.timestamp >= cutoff);
        let removed = before - history.len();

        if removed > 0 {
            debug!(removed, "Pruned recovery history");
        }
        removed
    }

    /// `success_rate` is a fraction in `0.0..=1.0`.
    pub fn recovery_stats(&self) -> RecoveryStats {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);

        let total_attempts = history.len();
        let successful_attempts = history.iter().filter(|attempt| attempt.success).count();
        let failed_attempts = total_attempts - successful_attempts;

        let mut attempts_by_action = HashMap::new();
        for attempt in history.iter() {
            *attempts_by_action.entry(attempt.action).or_insert(0) += 1;
        }

        let recent_failures: Vec<RecoveryAttempt> = history
            .iter()
            .rev()
            .filter(|attempt| !attempt.success)
            .take(RECENT_FAILURES)
            .cloned()
            .collect();

        let mut active_recoveries: Vec<String> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        active_recoveries.sort();

        RecoveryStats {
            total_attempts,
            successful_attempts,
            failed_attempts,
            success_rate: if total_attempts == 0 {
                0.0
            } else {
                successful_attempts as f64 / total_attempts as f64
            },
            attempts_by_action,
            recent_failures,
            active_recoveries,
        }
    }
}

// Clears the active marker even when the recovery future is dropped mid-way.
struct ActiveRecovery<'a> {
    manager: &'a RecoveryManager,
    service: &'a str,
}

impl<'a> ActiveRecovery<'a> {
    fn begin(manager: &'a RecoveryManager, service: &'a str) -> Self {
        manager.set_active(service, true);
        Self { manager, service }
    }
}

impl Drop for ActiveRecovery<'_> {
    fn drop(&mut self) {
        self.manager.set_active(self.service, false);
    }
}

#[async_trait]
impl FailureHandler for RecoveryManager {
    async fn handle_service_failure(
        &self,
        service: &str,
        result: &HealthCheckResult,
        consecutive_failures: u32,
    ) {
        RecoveryManager::handle_service_failure(self, service, result, consecutive_failures).await;
    }
}
