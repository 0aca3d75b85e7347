//! MeshKit - client-side service discovery and resilient inter-service calls
//!
//! The [`ServiceRegistry`] tracks instances in memory and watches them with a
//! background health loop. [`ServiceClient`] resolves endpoints through it and
//! wraps each call in retries and a per-endpoint circuit breaker.
//! [`ServiceSdk`] bundles both for host applications, and [`resilience`] offers
//! the same retry policy and a TTL result cache for arbitrary async calls.

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod resilience;
pub mod sdk;
pub mod transport;
pub mod version;

pub use client::{
    CircuitBreaker, CircuitState, CrudServiceInterface, Decoded, RequestSpec, ServiceCallResult,
    ServiceClient, ServiceClientFactory, TypedServiceClient,
};
pub use config::{CircuitBreakerConfig, ClientConfig, RegistryConfig};
pub use error::{ClientResult, ModelError, ServiceClientError, TransportError, TypedServiceError};
pub use model::{Endpoint, ServiceDefinition, ServiceInstance, ServiceStatus};
pub use registry::{async_handler, sync_handler, EventHandler, LoadBalancer, RegistryEvent, ServiceRegistry};
pub use resilience::{retry, retry_if, TtlCache};
pub use sdk::{ServiceCall, ServiceRegistration, ServiceSdk, ServiceStatusReport};
pub use transport::{HttpTransport, ReqwestTransport, TransportRequest, TransportResponse};
pub use version::VersionInfo;
