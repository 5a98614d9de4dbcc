use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{
    circuit_breaker::CircuitConfig,
    recovery::{RecoveryAction, RecoveryActionKind, RecoveryRule},
    retry::RetryConfig,
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_circuit_key_ttl")]
    pub redis_circuit_key_ttl_seconds: u64,
    #[serde(default = "default_key_ttl")]
    pub redis_key_ttl_seconds: u64,
    #[serde(default = "default_store_timeout")]
    pub state_store_timeout_ms: u64,

    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub circuit_breaker_recovery_timeout_seconds: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub circuit_breaker_half_open_max_calls: u32,
    #[serde(default = "default_call_timeout")]
    pub circuit_breaker_call_timeout_seconds: u64,

    #[serde(default = "default_health_interval")]
    pub health_check_interval_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub health_check_timeout_seconds: u64,
    #[serde(default)]
    pub health_endpoints: Vec<String>,

    #[serde(default)]
    pub recovery_rules: Vec<String>,
    #[serde(default = "default_recovery_threshold")]
    pub recovery_failure_threshold: u32,
    #[serde(default = "default_recovery_retry_attempts")]
    pub recovery_retry_attempts: u32,
    #[serde(default = "default_recovery_retry_delay")]
    pub recovery_retry_delay_ms: u64,
    #[serde(default = "default_recovery_cooldown")]
    pub recovery_cooldown_seconds: u64,
    #[serde(default = "default_history_retention")]
    pub recovery_history_retention_hours: u64,

    #[serde(default)]
    pub recovery_restart_command: Option<String>,
    #[serde(default)]
    pub recovery_clear_cache_command: Option<String>,
    #[serde(default)]
    pub recovery_reconnect_dependency_command: Option<String>,
    #[serde(default)]
    pub recovery_reload_config_command: Option<String>,
    #[serde(default)]
    pub recovery_scale_up_command: Option<String>,
    #[serde(default)]
    pub recovery_scale_down_command: Option<String>,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_circuit_key_ttl() -> u64 {
    10
}

fn default_key_ttl() -> u64 {
    3600
}

fn default_store_timeout() -> u64 {
    500
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_half_open_max_calls() -> u32 {
    3
}

fn default_call_timeout() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_recovery_threshold() -> u32 {
    3
}

fn default_recovery_retry_attempts() -> u32 {
    3
}

fn default_recovery_retry_delay() -> u64 {
    5_000
}

fn default_recovery_cooldown() -> u64 {
    300
}

fn default_history_retention() -> u64 {
    24
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay() -> u64 {
    200
}

fn default_max_retry_delay() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_circuit_key_ttl_seconds: default_circuit_key_ttl(),
            redis_key_ttl_seconds: default_key_ttl(),
            state_store_timeout_ms: default_store_timeout(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_recovery_timeout_seconds: default_recovery_timeout(),
            circuit_breaker_half_open_max_calls: default_half_open_max_calls(),
            circuit_breaker_call_timeout_seconds: default_call_timeout(),
            health_check_interval_seconds: default_health_interval(),
            health_check_timeout_seconds: default_health_timeout(),
            health_endpoints: Vec::new(),
            recovery_rules: Vec::new(),
            recovery_failure_threshold: default_recovery_threshold(),
            recovery_retry_attempts: default_recovery_retry_attempts(),
            recovery_retry_delay_ms: default_recovery_retry_delay(),
            recovery_cooldown_seconds: default_recovery_cooldown(),
            recovery_history_retention_hours: default_history_retention(),
            recovery_restart_command: None,
            recovery_clear_cache_command: None,
            recovery_reconnect_dependency_command: None,
            recovery_reload_config_command: None,
            recovery_scale_up_command: None,
            recovery_scale_down_command: None,
            max_retry_attempts: default_max_retry_attempts(),
            initial_retry_delay_ms: default_initial_retry_delay(),
            max_retry_delay_ms: default_max_retry_delay(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            server_port: default_server_port(),
            log_format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid environment configuration: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::from_config(self)
    }

    pub fn circuit_config(&self, name: &str) -> CircuitConfig {
        let call_timeout = match self.circuit_breaker_call_timeout_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds)),
        };

        CircuitConfig::new(name)
            .with_failure_threshold(self.circuit_breaker_failure_threshold)
            .with_recovery_timeout(Duration::from_secs(
                self.circuit_breaker_recovery_timeout_seconds,
            ))
            .with_half_open_max_calls(self.circuit_breaker_half_open_max_calls)
            .with_call_timeout(call_timeout)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds.max(1))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_seconds.max(1))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.state_store_timeout_ms)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.recovery_history_retention_hours * 3600)
    }

    /// `name=url` pairs from `HEALTH_ENDPOINTS`.
    pub fn health_endpoints(&self) -> Result<Vec<(String, String)>, Error> {
        self.health_endpoints
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                let (name, url) = entry.split_once('=').ok_or_else(|| {
                    anyhow!("Invalid health endpoint '{}', expected name=url", entry)
                })?;
                Ok((name.trim().to_string(), url.trim().to_string()))
            })
            .collect()
    }

    pub fn recovery_rules(&self) -> Result<Vec<RecoveryRule>, Error> {
        let template = RecoveryRule::new("", RecoveryAction::ManualIntervention)
            .with_failure_threshold(self.recovery_failure_threshold)
            .with_retry_attempts(self.recovery_retry_attempts)
            .with_retry_delay(Duration::from_millis(self.recovery_retry_delay_ms))
            .with_cooldown(Duration::from_secs(self.recovery_cooldown_seconds));

        self.recovery_rules
            .iter()
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| RecoveryRule::parse(entry, &template))
            .collect()
    }

    pub fn recovery_command(&self, kind: RecoveryActionKind) -> Option<&str> {
        match kind {
            RecoveryActionKind::Restart => self.recovery_restart_command.as_deref(),
            RecoveryActionKind::ClearCache => self.recovery_clear_cache_command.as_deref(),
            RecoveryActionKind::ReconnectDependency => {
                self.recovery_reconnect_dependency_command.as_deref()
            }
            RecoveryActionKind::ReloadConfig => self.recovery_reload_config_command.as_deref(),
            RecoveryActionKind::ScaleUp => self.recovery_scale_up_command.as_deref(),
            RecoveryActionKind::ScaleDown => self.recovery_scale_down_command.as_deref(),
            RecoveryActionKind::ManualIntervention | RecoveryActionKind::Custom => None,
        }
    }
}
