//! Error taxonomy for discovery, transport and service calls

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

/// Invalid model data or unparseable names
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("service '{service}' has no endpoints")]
    NoEndpoints { service: String },

    #[error("invalid version format: {version}")]
    InvalidVersion { version: String },

    #[error("unknown registry event: {0}")]
    UnknownEvent(String),

    #[error("unknown load balancer strategy: {0}")]
    UnknownLoadBalancer(String),
}

/// Failures below HTTP semantics: nothing usable came back
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("failed to read response body from {url}: {message}")]
    Body { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum ServiceClientError {
    #[error("no healthy instances of service '{service}' found")]
    ServiceUnavailable { service: String },

    #[error("circuit breaker is open for {service} ({endpoint})")]
    CircuitOpen { service: String, endpoint: String },

    #[error("client error: {status}")]
    ClientStatus { status: u16, body: String },

    #[error("server error: {status}")]
    ServerStatus { status: u16 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request to {service} failed after {attempts} attempts")]
    RetriesExhausted {
        service: String,
        attempts: u32,
        #[source]
        last: Box<ServiceClientError>,
    },

    #[error("failed to encode request body: {0}")]
    Encode(String),

    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(String),
}

impl ServiceClientError {
    /// Server errors and transport failures are retried; everything else surfaces at once.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceClientError::ServerStatus { .. } | ServiceClientError::Transport(_)
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ServiceClientError::ClientStatus { status, .. }
            | ServiceClientError::ServerStatus { status } => Some(*status),
            ServiceClientError::RetriesExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ServiceClientError>;

/// Errors raised by the typed client wrapper
#[derive(Debug, Error)]
pub enum TypedServiceError {
    #[error("request body for {service} could not be serialized: {message}")]
    RequestSerialization { service: String, message: String },

    #[error("response validation failed for {service}")]
    Validation {
        service: String,
        errors: BTreeMap<String, Vec<String>>,
    },

    #[error("service call failed: {message}")]
    Failed {
        service: String,
        message: String,
        status_code: Option<u16>,
    },

    #[error("service call succeeded but returned no data")]
    NoData { service: String },
}

impl TypedServiceError {
    pub fn service_name(&self) -> &str {
        match self {
            TypedServiceError::RequestSerialization { service, .. }
            | TypedServiceError::Validation { service, .. }
            | TypedServiceError::Failed { service, .. }
            | TypedServiceError::NoData { service } => service,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            TypedServiceError::Validation { .. } => Some(422),
            TypedServiceError::Failed { status_code, .. } => *status_code,
            _ => None,
        }
    }
}
