pub mod mock;
pub mod provider;
pub mod resilience;

pub use mock::{MockModel, MockReply};
pub use provider::{HttpModel, ModelConfig};
pub use resilience::{BreakerConfig, BreakerState, CircuitBreaker, Resilience, RetryPolicy};
