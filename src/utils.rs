use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{config::Config, models::retry::RetryConfig};

impl RetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            initial_delay_ms: config.initial_retry_delay_ms,
            max_delay_ms: config.max_retry_delay_ms,
            backoff_multiplier: config.retry_backoff_multiplier,
        }
    }
}

pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(attempt, max_attempts, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= max_attempts {
                    warn!(
                        max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    attempt,
                    max_attempts,
                    delay_ms,
                    error = %e,
                    "Retry attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);
                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(
                    delay_ms.saturating_mul(config.backoff_multiplier),
                    config.max_delay_ms,
                );
            }
        }
    }
}

/// `retry_delay * 2^attempt`, saturating instead of overflowing.
pub fn exponential_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

/// Epoch seconds as stored in circuit records; `0.0` means "never".
pub fn to_epoch_seconds(timestamp: Option<DateTime<Utc>>) -> f64 {
    timestamp
        .map(|t| t.timestamp_micros() as f64 / 1_000_000.0)
        .unwrap_or(0.0)
}

pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return None;
    }

    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64)
}

/// Time elapsed since `timestamp`, zero when it lies in the future.
pub fn elapsed_since(timestamp: DateTime<Utc>) -> Duration {
    (Utc::now() - timestamp).to_std().unwrap_or(Duration::ZERO)
}

pub fn init_tracing(log_format: &str) -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(true);

    let installed = if log_format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.pretty().try_init()
    };

    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))
}
