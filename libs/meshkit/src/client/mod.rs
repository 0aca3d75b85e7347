pub mod circuit_breaker;
mod factory;
mod service_client;
mod typed;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use factory::ServiceClientFactory;
pub use service_client::{Decoded, RequestSpec, ServiceClient};
pub use typed::{CrudServiceInterface, ServiceCallResult, TypedServiceClient};
