use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RecoveryCallback = Arc<dyn Fn() -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionKind {
    Restart,
    ClearCache,
    ReconnectDependency,
    ReloadConfig,
    ScaleUp,
    ScaleDown,
    ManualIntervention,
    Custom,
}

impl RecoveryActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryActionKind::Restart => "restart",
            RecoveryActionKind::ClearCache => "clear_cache",
            RecoveryActionKind::ReconnectDependency => "reconnect_dependency",
            RecoveryActionKind::ReloadConfig => "reload_config",
            RecoveryActionKind::ScaleUp => "scale_up",
            RecoveryActionKind::ScaleDown => "scale_down",
            RecoveryActionKind::ManualIntervention => "manual_intervention",
            RecoveryActionKind::Custom => "custom",
        }
    }
}

impl fmt::Display for RecoveryActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecoveryActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "restart" => Ok(RecoveryActionKind::Restart),
            "clear_cache" => Ok(RecoveryActionKind::ClearCache),
            "reconnect_dependency" | "reconnect" => Ok(RecoveryActionKind::ReconnectDependency),
            "reload_config" | "reload" => Ok(RecoveryActionKind::ReloadConfig),
            "scale_up" => Ok(RecoveryActionKind::ScaleUp),
            "scale_down" => Ok(RecoveryActionKind::ScaleDown),
            "manual_intervention" | "manual" => Ok(RecoveryActionKind::ManualIntervention),
            other => Err(anyhow!("Unknown recovery action '{}'", other)),
        }
    }
}

#[derive(Clone)]
pub enum RecoveryAction {
    Restart,
    ClearCache,
    ReconnectDependency,
    ReloadConfig,
    ScaleUp,
    ScaleDown,
    ManualIntervention,
    Custom(RecoveryCallback),
}

impl RecoveryAction {
    pub fn custom<F, Fut>(callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        RecoveryAction::Custom(Arc::new(move || Box::pin(callback())))
    }

    pub fn kind(&self) -> RecoveryActionKind {
        match self {
            RecoveryAction::Restart => RecoveryActionKind::Restart,
            RecoveryAction::ClearCache => RecoveryActionKind::ClearCache,
            RecoveryAction::ReconnectDependency => RecoveryActionKind::ReconnectDependency,
            RecoveryAction::ReloadConfig => RecoveryActionKind::ReloadConfig,
            RecoveryAction::ScaleUp => RecoveryActionKind::ScaleUp,
            RecoveryAction::ScaleDown => RecoveryActionKind::ScaleDown,
            RecoveryAction::ManualIntervention => RecoveryActionKind::ManualIntervention,
            RecoveryAction::Custom(_) => RecoveryActionKind::Custom,
        }
    }
}

impl From<RecoveryActionKind> for RecoveryAction {
    fn from(kind: RecoveryActionKind) -> Self {
        match kind {
            RecoveryActionKind::Restart => RecoveryAction::Restart,
            RecoveryActionKind::ClearCache => RecoveryAction::ClearCache,
            RecoveryActionKind::ReconnectDependency => RecoveryAction::ReconnectDependency,
            RecoveryActionKind::ReloadConfig => RecoveryAction::ReloadConfig,
            RecoveryActionKind::ScaleUp => RecoveryAction::ScaleUp,
            RecoveryActionKind::ScaleDown => RecoveryAction::ScaleDown,
            RecoveryActionKind::ManualIntervention | RecoveryActionKind::Custom => {
                RecoveryAction::ManualIntervention
            }
        }
    }
}

impl fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryAction::Custom(_) => f.write_str("Custom(<callback>)"),
            other => write!(f, "{:?}", other.kind()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryRule {
    pub service: String,
    pub failure_threshold: u32,
    pub action: RecoveryAction,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub cooldown_period: Duration,
    pub enabled: bool,
}

impl RecoveryRule {
    pub fn new(service: impl Into<String>, action: RecoveryAction) -> Self {
        Self {
            service: service.into(),
            failure_threshold: 3,
            action,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(5),
            cooldown_period: Duration::from_secs(300),
            enabled: true,
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_period = cooldown;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Parses `service=action[:threshold]`, filling the rest from `template`.
    pub fn parse(spec: &str, template: &RecoveryRule) -> Result<Self, Error> {
        let (service, action) = spec
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid recovery rule '{}', expected service=action", spec))?;

        let (action, threshold) = match action.split_once(':') {
            Some((action, threshold)) => (
                action,
                Some(
                    threshold
                        .trim()
                        .parse::<u32>()
                        .map_err(|e| anyhow!("Invalid threshold in rule '{}': {}", spec, e))?,
                ),
            ),
            None => (action, None),
        };

        let service = service.trim();
        if service.is_empty() {
            return Err(anyhow!("Recovery rule '{}' has no service name", spec));
        }

        let kind: RecoveryActionKind = action.parse()?;

        let mut rule = template.clone();
        rule.service = service.to_string();
        rule.action = kind.into();
        if let Some(threshold) = threshold {
            rule = rule.with_failure_threshold(threshold);
        }

        Ok(rule)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAttempt {
    pub id: Uuid,
    pub service: String,
    pub action: RecoveryActionKind,
    pub attempt_number: u32,
    pub timestamp: DateTime<Utc>,
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl RecoveryAttempt {
    pub fn new(service: &str, action: RecoveryActionKind, attempt_number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: service.to_string(),
            action,
            attempt_number,
            timestamp: Utc::now(),
            success: false,
            error_message: None,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.success = true;
        self
    }

    pub fn failed(mut self, error: String) -> Self {
        self.success = false;
        self.error_message = Some(error);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryStats {
    pub total_attempts: usize,
    pub successful_attempts: usize,
    pub failed_attempts: usize,
    pub success_rate: f64,
    pub attempts_by_action: HashMap<RecoveryActionKind, usize>,
    pub recent_failures: Vec<RecoveryAttempt>,
    pub active_recoveries: Vec<String>,
}
