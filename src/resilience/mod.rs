pub mod retry;
pub mod circuit_breaker;
