pub mod circuit_breaker;
pub mod degradation;
pub mod health;
pub mod health_monitor;
pub mod recovery;
pub mod redis;
pub mod state_store;
