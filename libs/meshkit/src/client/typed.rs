//! Typed wrapper over [`ServiceClient`]
//!
//! Request bodies are serialized from `Req` before anything goes on the wire, and
//! responses must deserialize into `Resp` (or the per-call override). Unlike the raw
//! client a mismatching response is an error here, carrying per-field messages.
//! Transport-level failures are folded into a failed [`ServiceCallResult`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use super::service_client::{decode_body, RequestSpec, ServiceClient};
use crate::error::{ServiceClientError, TypedServiceError};

/// Outcome envelope of a typed call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceCallResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub status_code: Option<u16>,
    pub service_name: String,
    /// Request path the call was made against
    pub endpoint: Option<String>,
}

impl<T> ServiceCallResult<T> {
    pub fn ok(service_name: impl Into<String>, endpoint: impl Into<String>, data: Option<T>, status_code: u16) -> Self {
        Self {
            success: true,
            data,
            error: None,
            status_code: Some(status_code),
            service_name: service_name.into(),
            endpoint: Some(endpoint.into()),
        }
    }

    pub fn failed(service_name: impl Into<String>, endpoint: impl Into<String>, err: &ServiceClientError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(err.to_string()),
            status_code: err.status_code(),
            service_name: service_name.into(),
            endpoint: Some(endpoint.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success && self.error.is_none()
    }

    /// The payload, or why there is none
    pub fn into_data(self) -> Result<T, TypedServiceError> {
        if !self.is_success() {
            return Err(TypedServiceError::Failed {
                service: self.service_name,
                message: self.error.unwrap_or_default(),
                status_code: self.status_code,
            });
        }
        self.data.ok_or(TypedServiceError::NoData {
            service: self.service_name,
        })
    }

    /// Payload of a successful call.
    ///
    /// # Panics
    /// If the call failed or returned no data.
    pub fn unwrap(self) -> T {
        match self.into_data() {
            Ok(data) => data,
            Err(e) => panic!("{e}"),
        }
    }
}

pub struct TypedServiceClient<Req, Resp> {
    client: Arc<ServiceClient>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for TypedServiceClient<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> std::fmt::Debug for TypedServiceClient<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedServiceClient")
            .field("service", &self.client.service_name())
            .field("request", &std::any::type_name::<Req>())
            .field("response", &std::any::type_name::<Resp>())
            .finish()
    }
}

impl<Req, Resp> TypedServiceClient<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    pub fn new(client: Arc<ServiceClient>) -> Self {
        Self {
            client,
            _types: PhantomData,
        }
    }

    pub fn service_name(&self) -> &str {
        self.client.service_name()
    }

    pub fn inner(&self) -> &Arc<ServiceClient> {
        &self.client
    }

    pub async fn get(&self, path: &str) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        self.call(RequestSpec::get(path)).await
    }

    /// GET with query parameters
    pub async fn get_with_query<K, V>(
        &self,
        path: &str,
        query: &[(K, V)],
    ) -> Result<ServiceCallResult<Resp>, TypedServiceError>
    where
        K: Display,
        V: Display,
    {
        let spec = query
            .iter()
            .fold(RequestSpec::get(path), |spec, (k, v)| spec.query(k.to_string(), v.to_string()));
        self.call(spec).await
    }

    /// GET decoding into `T` instead of `Resp`
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<ServiceCallResult<T>, TypedServiceError> {
        self.call(RequestSpec::get(path)).await
    }

    pub async fn post(&self, path: &str, body: &Req) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        let spec = self.with_body(RequestSpec::post(path), body)?;
        self.call(spec).await
    }

    /// POST an untyped JSON body
    pub async fn post_json(&self, path: &str, body: Value) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        self.call(RequestSpec::post(path).json(body)).await
    }

    pub async fn put(&self, path: &str, body: &Req) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        let spec = self.with_body(RequestSpec::put(path), body)?;
        self.call(spec).await
    }

    pub async fn delete(&self, path: &str) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        self.call(RequestSpec::delete(path)).await
    }

    /// Run an arbitrary request and decode into `T`
    #[tracing::instrument(name = "meshkit.typed.call", skip_all, fields(service = %self.client.service_name(), path = %spec.path))]
    pub async fn call<T: DeserializeOwned>(
        &self,
        spec: RequestSpec,
    ) -> Result<ServiceCallResult<T>, TypedServiceError> {
        let service = self.client.service_name().to_string();
        let path = spec.path.clone();

        let served = match self.client.execute(spec).await {
            Ok(served) => served,
            Err(e) => {
                tracing::error!(service = %service, error = %e, "service client error");
                return Ok(ServiceCallResult::failed(service, path, &e));
            }
        };

        let status = served.response.status;
        let value = decode_body(&served.response);
        if value.is_null() {
            return Ok(ServiceCallResult::ok(service, path, None, status));
        }

        match serde_json::from_value::<T>(value) {
            Ok(data) => Ok(ServiceCallResult::ok(service, path, Some(data), status)),
            Err(e) => {
                tracing::error!(service = %service, error = %e, "response validation failed");
                Err(TypedServiceError::Validation {
                    service,
                    errors: validation_errors(&e),
                })
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.get_as::<Value>("/health").await {
            Ok(result) => result.is_success(),
            Err(_) => false,
        }
    }

    pub async fn close(&self) {
        self.client.close().await;
    }

    fn with_body(&self, spec: RequestSpec, body: &Req) -> Result<RequestSpec, TypedServiceError> {
        spec.json_from(body)
            .map_err(|e| TypedServiceError::RequestSerialization {
                service: self.client.service_name().to_string(),
                message: e.to_string(),
            })
    }
}

/// Field -> messages; serde names the field in backticks when it knows it
fn validation_errors(err: &serde_json::Error) -> BTreeMap<String, Vec<String>> {
    let message = err.to_string();
    let field = message
        .split('`')
        .nth(1)
        .filter(|f| !f.is_empty())
        .unwrap_or("body")
        .to_string();
    BTreeMap::from([(field, vec![message])])
}

/// Create/read/update/delete/list over `base_path` on top of a typed client
#[derive(Debug, Clone)]
pub struct CrudServiceInterface<Req, Resp> {
    client: TypedServiceClient<Req, Resp>,
    base_path: String,
}

impl<Req, Resp> CrudServiceInterface<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    pub fn new(client: TypedServiceClient<Req, Resp>, base_path: impl Into<String>) -> Self {
        let base_path: String = base_path.into();
        Self {
            client,
            base_path: base_path.trim_end_matches('/').to_string(),
        }
    }

    fn path(&self, suffix: &str) -> String {
        if suffix.is_empty() || suffix.starts_with('/') {
            format!("{}{}", self.base_path, suffix)
        } else {
            format!("{}/{}", self.base_path, suffix)
        }
    }

    pub async fn create(&self, data: &Req) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        self.client.post(&self.path(""), data).await
    }

    pub async fn get(&self, id: impl Display) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        self.client.get(&self.path(&id.to_string())).await
    }

    pub async fn update(&self, id: impl Display, data: &Req) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        self.client.put(&self.path(&id.to_string()), data).await
    }

    pub async fn delete(&self, id: impl Display) -> Result<ServiceCallResult<Resp>, TypedServiceError> {
        self.client.delete(&self.path(&id.to_string())).await
    }

    pub async fn list(&self, query: &[(&str, &str)]) -> Result<ServiceCallResult<Vec<Resp>>, TypedServiceError> {
        let spec = query
            .iter()
            .fold(RequestSpec::get(self.path("")), |spec, (k, v)| spec.query(*k, *v));
        self.client.call(spec).await
    }

    pub async fn health_check(&self) -> bool {
        self.client.health_check().await
    }
}
