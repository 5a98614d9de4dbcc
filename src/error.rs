use std::time::Duration;

use anyhow::Error;
use thiserror::Error as ThisError;

/// Returned when a call is rejected because the circuit is open and no
/// fallback was supplied.
#[derive(Debug, Clone, ThisError)]
#[error("circuit '{circuit}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub circuit: String,
    pub retry_after: Duration,
}

/// Returned when the protected operation outlives the circuit's call timeout.
#[derive(Debug, Clone, ThisError)]
#[error("call through circuit '{circuit}' timed out after {timeout:?}")]
pub struct CircuitTimeoutError {
    pub circuit: String,
    pub timeout: Duration,
}

/// Every strategy of a degradation chain failed.
#[derive(Debug, Clone, ThisError)]
#[error("all degradation strategies failed for '{service}': {}", .failures.join("; "))]
pub struct DegradationExhaustedError {
    pub service: String,
    pub failures: Vec<String>,
}

pub fn is_circuit_open(error: &Error) -> bool {
    error.downcast_ref::<CircuitOpenError>().is_some()
}

pub fn is_circuit_timeout(error: &Error) -> bool {
    error.downcast_ref::<CircuitTimeoutError>().is_some()
}

pub fn is_degradation_exhausted(error: &Error) -> bool {
    error.downcast_ref::<DegradationExhaustedError>().is_some()
}
