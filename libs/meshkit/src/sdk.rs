//! High-level façade over the registry and the client factory
//!
//! Owned by the host's composition root; there is no process-wide instance.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{RequestSpec, ServiceClient, ServiceClientFactory, TypedServiceClient};
use crate::config::ClientConfig;
use crate::error::ClientResult;
use crate::model::{Endpoint, ServiceInstance, ServiceStatus};
use crate::registry::{EventHandler, RegistryEvent, ServiceRegistry};

/// Parameters for registering an instance through the SDK
#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub metadata: HashMap<String, Value>,
    pub health_check_path: Option<String>,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            host: host.into(),
            port,
            protocol: "http".to_string(),
            metadata: HashMap::new(),
            health_check_path: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_health_check_path(mut self, path: impl Into<String>) -> Self {
        self.health_check_path = Some(path.into());
        self
    }

    fn into_instance(self) -> ServiceInstance {
        let endpoint = Endpoint::new(&self.host, self.port).with_protocol(&self.protocol);
        let mut instance = ServiceInstance::new(self.name, self.version, endpoint);
        instance.metadata = self.metadata;
        if let Some(path) = self.health_check_path {
            let path = if path.starts_with('/') { path } else { format!("/{path}") };
            instance.health_check_url = format!("{}://{}:{}{}", self.protocol, self.host, self.port, path);
        }
        instance
    }
}

/// One entry of a batch call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service_name: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub data: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ServiceCall {
    pub fn get(service_name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            method: default_method(),
            path: path.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    NotFound,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointReport {
    pub url: String,
    pub status: ServiceStatus,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatusReport {
    pub service: String,
    pub status: ReportStatus,
    pub instances: usize,
    pub healthy_instances: usize,
    pub endpoints: Vec<EndpointReport>,
}

pub struct ServiceSdk {
    registry: ServiceRegistry,
    factory: ServiceClientFactory,
    current: Mutex<Option<Arc<ServiceInstance>>>,
}

impl std::fmt::Debug for ServiceSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSdk")
            .field("registry", &self.registry)
            .field("factory", &self.factory)
            .field("current", &self.current.lock().as_ref().map(|i| i.name.clone()))
            .finish()
    }
}

impl ServiceSdk {
    pub fn new(factory: ServiceClientFactory) -> Self {
        Self {
            registry: factory.registry().clone(),
            factory,
            current: Mutex::new(None),
        }
    }

    pub fn from_parts(registry: ServiceRegistry, client_defaults: ClientConfig) -> Self {
        Self::new(ServiceClientFactory::new(registry, client_defaults))
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn factory(&self) -> &ServiceClientFactory {
        &self.factory
    }

    pub fn current_service(&self) -> Option<Arc<ServiceInstance>> {
        self.current.lock().clone()
    }

    /// Register this process; the health URL defaults to `/health` on the given host/port
    pub async fn register_current_service(&self, registration: ServiceRegistration) -> Arc<ServiceInstance> {
        let registration = if registration.health_check_path.is_none() {
            registration.with_health_check_path("/health")
        } else {
            registration
        };
        let instance = self
            .registry
            .register_service(registration.into_instance(), true)
            .await;
        *self.current.lock() = Some(instance.clone());
        instance
    }

    pub async fn deregister_current_service(&self) {
        let current = self.current.lock().take();
        if let Some(instance) = current {
            self.registry
                .deregister_service(&instance.name, Some(instance.endpoints()))
                .await;
        }
    }

    /// Register a service this process does not run
    pub async fn register_external_service(&self, registration: ServiceRegistration) -> Arc<ServiceInstance> {
        tracing::info!(service = %registration.name, host = %registration.host, port = registration.port, "registering external service");
        self.registry
            .register_service(registration.into_instance(), true)
            .await
    }

    pub fn discover_services(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        self.registry.discover_service(name, None)
    }

    /// URL of an endpoint picked with the default load balancer
    pub fn get_service_endpoint(&self, name: &str) -> Option<String> {
        self.registry
            .get_service_endpoint(name, None, self.factory.defaults().load_balancer)
            .map(|ep| ep.url())
    }

    pub fn list_all_services(&self) -> HashMap<String, Vec<Arc<ServiceInstance>>> {
        self.registry.list_services()
    }

    pub fn get_client(&self, name: &str) -> Arc<ServiceClient> {
        self.factory.get_client(name)
    }

    /// Client with a specific request timeout and attempt count
    pub fn get_client_with(&self, name: &str, timeout: Duration, retry_attempts: u32) -> Arc<ServiceClient> {
        let mut config = self.factory.defaults().clone();
        config.circuit.request_timeout = timeout;
        config.circuit.retry_attempts = retry_attempts;
        self.factory.get_client_with(name, config)
    }

    pub fn typed_client<Req, Resp>(&self, name: &str) -> TypedServiceClient<Req, Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        TypedServiceClient::new(self.get_client(name))
    }

    /// Call by method name: GET, POST, PUT or DELETE; `data` is sent only with POST and PUT
    #[tracing::instrument(name = "meshkit.sdk.call", skip(self, data))]
    pub async fn call_service(
        &self,
        name: &str,
        method: &str,
        path: &str,
        data: Option<Value>,
    ) -> ClientResult<Value> {
        let mut spec = RequestSpec::from_method_name(method, path)?;
        if spec.method == http::Method::POST || spec.method == http::Method::PUT {
            if let Some(body) = data {
                spec = spec.json(body);
            }
        }
        self.get_client(name).send(spec).await
    }

    /// GET `path` with query parameters
    pub async fn get_from_service(
        &self,
        name: &str,
        path: &str,
        params: &[(&str, &str)],
    ) -> ClientResult<Value> {
        let spec = params
            .iter()
            .fold(RequestSpec::get(path), |spec, (k, v)| spec.query(*k, *v));
        self.get_client(name).send(spec).await
    }

    /// POST `body` serialized as JSON
    pub async fn post_to_service<B: Serialize + ?Sized>(
        &self,
        name: &str,
        path: &str,
        body: &B,
    ) -> ClientResult<Value> {
        let spec = RequestSpec::post(path).json_from(body)?;
        self.get_client(name).send(spec).await
    }

    pub async fn check_service_health(&self, name: &str) -> bool {
        self.get_client(name).health_check().await
    }

    /// Registered instances of `name`, healthy or not
    pub fn get_service_status(&self, name: &str) -> ServiceStatusReport {
        let instances = self.registry.instances_of(name);
        if instances.is_empty() {
            return ServiceStatusReport {
                service: name.to_string(),
                status: ReportStatus::NotFound,
                instances: 0,
                healthy_instances: 0,
                endpoints: Vec::new(),
            };
        }

        let healthy = instances.iter().filter(|i| i.is_healthy()).count();
        let endpoints = instances
            .iter()
            .flat_map(|inst| {
                let status = inst.status();
                inst.endpoints().iter().map(move |ep| EndpointReport {
                    url: ep.url(),
                    status,
                    version: inst.version.clone(),
                })
            })
            .collect();

        ServiceStatusReport {
            service: name.to_string(),
            status: if healthy > 0 {
                ReportStatus::Healthy
            } else {
                ReportStatus::Unhealthy
            },
            instances: instances.len(),
            healthy_instances: healthy,
            endpoints,
        }
    }

    /// Health-check every name concurrently
    pub async fn check_multiple_services(&self, names: &[&str]) -> HashMap<String, bool> {
        let checks = names.iter().map(|name| async move {
            (name.to_string(), self.check_service_health(name).await)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Run every call concurrently; each slot holds that call's own outcome
    pub async fn call_multiple_services(&self, calls: Vec<ServiceCall>) -> Vec<ClientResult<Value>> {
        let pending = calls.into_iter().map(|call| async move {
            self.call_service(&call.service_name, &call.method, &call.path, call.data)
                .await
        });
        join_all(pending).await
    }

    pub fn on_service_registered(&self, handler: EventHandler) {
        self.registry.add_handler(RegistryEvent::ServiceRegistered, handler);
    }

    pub fn on_service_deregistered(&self, handler: EventHandler) {
        self.registry.add_handler(RegistryEvent::ServiceDeregistered, handler);
    }

    pub fn on_service_unhealthy(&self, handler: EventHandler) {
        self.registry.add_handler(RegistryEvent::ServiceUnhealthy, handler);
    }

    pub fn on_service_healthy(&self, handler: EventHandler) {
        self.registry.add_handler(RegistryEvent::ServiceHealthy, handler);
    }

    /// Deregister this process, close every client, stop the health loop
    pub async fn shutdown(&self) {
        self.deregister_current_service().await;
        self.factory.close_all().await;
        self.registry.shutdown().await;
    }
}
