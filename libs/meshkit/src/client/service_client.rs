//! Resilient HTTP client bound to one logical service
//!
//! Every call resolves an endpoint through the registry, consults the client's
//! own circuit breaker before each attempt and retries server errors and transport
//! failures with exponential backoff. Client errors (4xx) surface at once and do
//! not count against the breaker.

use http::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerState};
use crate::config::ClientConfig;
use crate::error::{ClientResult, ServiceClientError};
use crate::model::Endpoint;
use crate::registry::ServiceRegistry;
use crate::transport::{HttpTransport, ReqwestTransport, TransportRequest, TransportResponse};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// One logical request: method, path relative to the endpoint, and optional extras
#[derive(Clone, Debug)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Parse a method name (case-insensitive); only GET, POST, PUT and DELETE are accepted
    pub fn from_method_name(method: &str, path: impl Into<String>) -> ClientResult<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::get(path)),
            "POST" => Ok(Self::post(path)),
            "PUT" => Ok(Self::put(path)),
            "DELETE" => Ok(Self::delete(path)),
            _ => Err(ServiceClientError::UnsupportedMethod(method.to_string())),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json_from<T: Serialize + ?Sized>(self, body: &T) -> ClientResult<Self> {
        let value =
            serde_json::to_value(body).map_err(|e| ServiceClientError::Encode(e.to_string()))?;
        Ok(self.json(value))
    }
}

/// Result of a lenient typed decode
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    Model(T),
    /// The body did not match `T`; the decoded JSON is returned as-is
    Raw(Value),
}

impl<T> Decoded<T> {
    pub fn model(self) -> Option<T> {
        match self {
            Decoded::Model(m) => Some(m),
            Decoded::Raw(_) => None,
        }
    }

    pub fn is_model(&self) -> bool {
        matches!(self, Decoded::Model(_))
    }
}

/// Successful response plus the endpoint that served it
#[derive(Debug, Clone)]
pub(crate) struct Served {
    pub(crate) response: TransportResponse,
    pub(crate) endpoint: Endpoint,
}

pub struct ServiceClient {
    service_name: String,
    registry: ServiceRegistry,
    config: ClientConfig,
    breaker: CircuitBreaker,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient")
            .field("service_name", &self.service_name)
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl ServiceClient {
    pub fn new(service_name: impl Into<String>, registry: ServiceRegistry, config: ClientConfig) -> Self {
        let transport = Arc::new(ReqwestTransport::new(config.session_ttl));
        Self::with_transport(service_name, registry, config, transport)
    }

    pub fn with_transport(
        service_name: impl Into<String>,
        registry: ServiceRegistry,
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.circuit.clone());
        Self {
            service_name: service_name.into(),
            registry,
            config,
            breaker,
            transport,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Breaker state for one `host:port` key, or every key when `None`
    pub fn circuit_state(&self, key: Option<&str>) -> HashMap<String, CircuitBreakerState> {
        match key {
            Some(key) => self
                .breaker
                .state(key)
                .map(|st| HashMap::from([(key.to_string(), st)]))
                .unwrap_or_default(),
            None => self.breaker.states(),
        }
    }

    pub async fn get(&self, path: &str) -> ClientResult<Value> {
        self.send(RequestSpec::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> ClientResult<Value> {
        self.send(RequestSpec::post(path).json(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> ClientResult<Value> {
        self.send(RequestSpec::put(path).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> ClientResult<Value> {
        self.send(RequestSpec::delete(path)).await
    }

    /// Execute `spec` and decode the body: JSON content becomes a JSON value,
    /// anything else a string.
    pub async fn send(&self, spec: RequestSpec) -> ClientResult<Value> {
        let served = self.execute(spec).await?;
        Ok(decode_body(&served.response))
    }

    /// Like [`ServiceClient::send`] but converts the body into `T`, falling back to
    /// the raw value (with a warning) when it does not fit.
    pub async fn send_as<T: DeserializeOwned>(&self, spec: RequestSpec) -> ClientResult<Decoded<T>> {
        let value = self.send(spec).await?;
        match serde_json::from_value::<T>(value.clone()) {
            Ok(model) => Ok(Decoded::Model(model)),
            Err(e) => {
                tracing::warn!(service = %self.service_name, error = %e, "response validation failed, returning raw body");
                Ok(Decoded::Raw(value))
            }
        }
    }

    #[tracing::instrument(
        name = "meshkit.client.request",
        skip_all,
        fields(service = %self.service_name, method = %spec.method, path = %spec.path)
    )]
    pub(crate) async fn execute(&self, spec: RequestSpec) -> ClientResult<Served> {
        let endpoint = self
            .registry
            .get_service_endpoint(
                &self.service_name,
                self.config.version.as_deref(),
                self.config.load_balancer,
            )
            .ok_or_else(|| ServiceClientError::ServiceUnavailable {
                service: self.service_name.clone(),
            })?;

        let key = endpoint.key();
        let url = build_url(&endpoint, &spec.path);
        let timeout = spec.timeout.unwrap_or(self.config.circuit.request_timeout);
        let headers = self.merged_headers(&spec.headers);
        let max_attempts = self.config.circuit.retry_attempts.max(1);

        let mut last_error: Option<ServiceClientError> = None;
        let mut attempts = 0;

        for attempt in 0..max_attempts {
            if !self.breaker.can_execute(&key) {
                if last_error.is_none() {
                    return Err(ServiceClientError::CircuitOpen {
                        service: self.service_name.clone(),
                        endpoint: key,
                    });
                }
                tracing::warn!(endpoint = %key, attempt, "circuit opened during retries, giving up");
                break;
            }

            attempts += 1;
            let request = TransportRequest {
                method: spec.method.clone(),
                url: url.clone(),
                query: spec.query.clone(),
                headers: headers.clone(),
                body: spec.body.clone(),
                timeout,
            };

            let error = match self.transport.send(request).await {
                Ok(response) if response.is_success() => {
                    self.breaker.record_success(&key);
                    tracing::debug!(endpoint = %key, status = response.status, attempt, "request succeeded");
                    return Ok(Served { response, endpoint });
                }
                Ok(response) if response.status >= 500 => {
                    self.breaker.record_failure(&key);
                    ServiceClientError::ServerStatus {
                        status: response.status,
                    }
                }
                Ok(response) => {
                    return Err(ServiceClientError::ClientStatus {
                        status: response.status,
                        body: String::from_utf8_lossy(&response.body).into_owned(),
                    });
                }
                Err(e) => {
                    self.breaker.record_failure(&key);
                    ServiceClientError::Transport(e)
                }
            };

            if attempt + 1 < max_attempts {
                let delay = self.config.circuit.backoff_delay(attempt);
                tracing::warn!(
                    endpoint = %key,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "request failed, retrying"
                );
                last_error = Some(error);
                tokio::time::sleep(delay).await;
            } else {
                last_error = Some(error);
            }
        }

        match last_error {
            Some(last) => Err(ServiceClientError::RetriesExhausted {
                service: self.service_name.clone(),
                attempts,
                last: Box::new(last),
            }),
            None => Err(ServiceClientError::ServiceUnavailable {
                service: self.service_name.clone(),
            }),
        }
    }

    /// GET `/health` with a short timeout; any error counts as unhealthy
    pub async fn health_check(&self) -> bool {
        match self
            .send(RequestSpec::get("/health").timeout(HEALTH_CHECK_TIMEOUT))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(service = %self.service_name, error = %e, "health check failed");
                false
            }
        }
    }

    /// Drop pooled connections; the next request opens a fresh session
    pub async fn close(&self) {
        self.transport.close().await;
    }

    fn merged_headers(&self, overrides: &[(String, String)]) -> Vec<(String, String)> {
        let mut merged: Vec<(String, String)> = self
            .config
            .default_headers
            .iter()
            .filter(|(name, _)| !overrides.iter().any(|(o, _)| o.eq_ignore_ascii_case(name)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        merged.extend(overrides.iter().cloned());
        merged
    }
}

fn build_url(endpoint: &Endpoint, path: &str) -> String {
    let base = endpoint.url();
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

pub(crate) fn decode_body(response: &TransportResponse) -> Value {
    if response.body.is_empty() {
        return Value::Null;
    }
    if response.is_json() {
        match serde_json::from_slice(&response.body) {
            Ok(value) => return value,
            Err(e) => {
                tracing::warn!(error = %e, "malformed JSON body, returning text");
            }
        }
    }
    Value::String(String::from_utf8_lossy(&response.body).into_owned())
}
