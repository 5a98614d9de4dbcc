pub mod circuit_breaker;
pub mod health;
pub mod recovery;
pub mod response;
pub mod retry;
