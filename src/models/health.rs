use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a probe implementation reports when it completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub details: HashMap<String, Value>,
}

impl ProbeOutcome {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            details: HashMap::new(),
        }
    }

    pub fn degraded(reason: impl Into<String>) -> Self {
        Self::healthy()
            .with_status(HealthStatus::Degraded)
            .with_detail("reason", reason.into())
    }

    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_details(mut self, details: HashMap<String, Value>) -> Self {
        self.details.extend(details);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub service: String,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub details: HashMap<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl HealthCheckResult {
    pub fn from_outcome(service: &str, outcome: ProbeOutcome, elapsed: Duration) -> Self {
        Self {
            service: service.to_string(),
            status: outcome.status,
            response_time_ms: elapsed.as_millis() as u64,
            details: outcome.details,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn unhealthy(service: &str, error: String, elapsed: Duration) -> Self {
        Self {
            service: service.to_string(),
            status: HealthStatus::Unhealthy,
            response_time_ms: elapsed.as_millis() as u64,
            details: HashMap::new(),
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    pub details: HashMap<String, Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceHealth {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: None,
            response_time_ms: None,
            details: HashMap::new(),
            error: None,
        }
    }

    /// Folds a check result in. Healthy results extend the success streak,
    /// every other status extends the failure streak.
    pub fn record(&mut self, result: &HealthCheckResult) {
        if result.is_healthy() {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }

        self.status = result.status;
        self.last_check = Some(result.timestamp);
        self.response_time_ms = Some(result.response_time_ms);
        self.details = result.details.clone();
        self.error = result.error.clone();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthTransition {
    pub service: String,
    pub old_status: HealthStatus,
    pub new_status: HealthStatus,
    pub result: HealthCheckResult,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

impl HealthSummary {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            match status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.healthy + self.degraded + self.unhealthy + self.unknown
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub services: HashMap<String, ServiceHealth>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn from_services(services: HashMap<String, ServiceHealth>) -> Self {
        let summary = HealthSummary::tally(services.values().map(|health| &health.status));

        let status = if summary.unhealthy > 0 {
            HealthStatus::Unhealthy
        } else if summary.degraded > 0 {
            HealthStatus::Degraded
        } else if summary.healthy > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        };

        Self {
            status,
            timestamp: Utc::now(),
            services,
            summary,
        }
    }
}
