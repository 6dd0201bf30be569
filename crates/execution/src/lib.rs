pub mod circuit_breaker;
pub mod manager;
pub mod paper;
pub mod retry;

pub use circuit_breaker::{
    BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
};
pub use manager::ExecutionManager;
pub use paper::{PaperBroker, PaperPosition};
pub use retry::RetryPolicy;
