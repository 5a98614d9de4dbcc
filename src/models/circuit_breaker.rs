use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};

use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::CircuitTimeoutError,
    utils::{from_epoch_seconds, to_epoch_seconds},
};

pub const STATE_KEY_PREFIX: &str = "circuit_breaker:";
pub const MAX_TRANSITIONS: usize = 10;
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn from_string(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "open" => CircuitState::Open,
            "half_open" | "halfopen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Numeric encoding used for the state gauge.
    pub fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error classes a circuit can be configured to count as failures.
///
/// The kind is derived from the error chain:
///
/// | Kind | Source |
/// |------|--------|
/// | `Timeout` | `CircuitTimeoutError`, `tokio::time::error::Elapsed`, timed out `reqwest` calls |
/// | `Transport` | any other `reqwest::Error` |
/// | `Storage` | `redis::RedisError` |
/// | `Io` | `std::io::Error` |
/// | `Operation` | everything else raised by the protected operation |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Transport,
    Storage,
    Io,
    Operation,
}

impl FailureKind {
    pub const ALL: [FailureKind; 5] = [
        FailureKind::Timeout,
        FailureKind::Transport,
        FailureKind::Storage,
        FailureKind::Io,
        FailureKind::Operation,
    ];

    pub fn classify(error: &Error) -> Self {
        for cause in error.chain() {
            if cause.is::<CircuitTimeoutError>() || cause.is::<tokio::time::error::Elapsed>() {
                return FailureKind::Timeout;
            }
            if let Some(http_error) = cause.downcast_ref::<reqwest::Error>() {
                return if http_error.is_timeout() {
                    FailureKind::Timeout
                } else {
                    FailureKind::Transport
                };
            }
            if cause.is::<redis::RedisError>() {
                return FailureKind::Storage;
            }
            if cause.is::<std::io::Error>() {
                return FailureKind::Io;
            }
        }

        FailureKind::Operation
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub name: String,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
    pub call_timeout: Option<Duration>,
    pub trip_on: HashSet<FailureKind>,
}

impl CircuitConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            call_timeout: Some(Duration::from_secs(30)),
            trip_on: FailureKind::ALL.into_iter().collect(),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_trip_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.trip_on = kinds.into_iter().collect();
        self
    }

    pub fn trips_on(&self, error: &Error) -> bool {
        self.trip_on.contains(&FailureKind::classify(error))
    }

    pub fn state_key(&self) -> String {
        format!("{}{}", STATE_KEY_PREFIX, self.name)
    }

    pub fn snapshot(&self) -> CircuitConfigSnapshot {
        let mut trip_on: Vec<FailureKind> = self.trip_on.iter().copied().collect();
        trip_on.sort_by_key(|kind| *kind as u8);

        CircuitConfigSnapshot {
            name: self.name.clone(),
            failure_threshold: self.failure_threshold,
            recovery_timeout_secs: self.recovery_timeout.as_secs_f64(),
            half_open_max_calls: self.half_open_max_calls,
            call_timeout_secs: self.call_timeout.map(|t| t.as_secs_f64()),
            trip_on,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub failure_count: u32,
}

#[derive(Debug, Clone)]
pub struct CircuitRuntimeState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub transitions: VecDeque<Transition>,
}

impl Default for CircuitRuntimeState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            total_calls: 0,
            total_failures: 0,
            total_successes: 0,
            transitions: VecDeque::with_capacity(MAX_TRANSITIONS),
        }
    }
}

impl CircuitRuntimeState {
    /// Moves to `to`, appending to the bounded history. No-op when already there.
    pub fn transition_to(&mut self, to: CircuitState) -> Option<Transition> {
        if self.state == to {
            return None;
        }

        let transition = Transition {
            from_state: self.state,
            to_state: to,
            timestamp: Utc::now(),
            failure_count: self.failure_count,
        };

        if self.transitions.len() == MAX_TRANSITIONS {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition.clone());
        self.state = to;

        Some(transition)
    }

    /// Replaces the shared fields with a stored record, keeping local history.
    pub fn apply(&mut self, record: &PersistedCircuitState) {
        self.state = record.state;
        self.failure_count = record.failure_count;
        self.success_count = record.success_count;
        self.last_failure_time = from_epoch_seconds(record.last_failure_time);
        self.last_success_time = from_epoch_seconds(record.last_success_time);
        self.total_calls = record.total_calls;
        self.total_failures = record.total_failures;
        self.total_successes = record.total_successes;
    }

    /// Resets the shared fields as if the circuit had never been stored.
    pub fn clear_shared(&mut self) {
        let transitions = std::mem::take(&mut self.transitions);
        *self = Self {
            transitions,
            ..Self::default()
        };
    }

    pub fn to_persisted(&self) -> PersistedCircuitState {
        PersistedCircuitState {
            version: CURRENT_SCHEMA_VERSION,
            state: self.state,
            failure_count: self.failure_count,
            last_failure_time: to_epoch_seconds(self.last_failure_time),
            success_count: self.success_count,
            last_success_time: to_epoch_seconds(self.last_success_time),
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
        }
    }
}

/// Wire record stored under `circuit_breaker:<name>`.
///
/// Fields missing from a stored blob take their defaults and unknown fields
/// are ignored, so new fields can be added without bumping the version.
/// Bump `CURRENT_SCHEMA_VERSION` only when an existing field changes meaning,
/// and teach `migrate` how to rewrite the older layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedCircuitState {
    #[serde(default)]
    pub version: u32,
    pub state: CircuitState,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_failure_time: f64,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub last_success_time: f64,
    #[serde(default)]
    pub total_calls: u64,
    #[serde(default)]
    pub total_failures: u64,
    #[serde(default)]
    pub total_successes: u64,
}

impl PersistedCircuitState {
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(blob: &str) -> Result<Self, Error> {
        let mut value: Value = serde_json::from_str(blob)?;
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if version < u64::from(CURRENT_SCHEMA_VERSION) {
            debug!(from_version = version, "Migrating stored circuit state");
            Self::migrate(&mut value);
        }

        Ok(serde_json::from_value(value)?)
    }

    // Version 0 blobs carried no version field and wrote the state in
    // whatever casing the writer used ("OPEN", "half-open", ...).
    fn migrate(value: &mut Value) {
        let Some(fields) = value.as_object_mut() else {
            return;
        };

        let state = fields
            .get("state")
            .and_then(Value::as_str)
            .map(CircuitState::from_string)
            .unwrap_or(CircuitState::Closed);

        fields.insert("state".to_string(), Value::from(state.as_str()));
        fields.insert("version".to_string(), Value::from(CURRENT_SCHEMA_VERSION));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitConfigSnapshot {
    pub name: String,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: f64,
    pub half_open_max_calls: u32,
    pub call_timeout_secs: Option<f64>,
    pub trip_on: Vec<FailureKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub blocked_calls: u64,
    pub fallback_calls: u64,
    pub timeouts: u64,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub transitions: Vec<Transition>,
    pub config: CircuitConfigSnapshot,
}
