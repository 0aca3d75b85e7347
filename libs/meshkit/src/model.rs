//! Endpoint & instance model - value types shared by the registry and the clients

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// A single network address where a service instance can be reached
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub path: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_weight() -> u32 {
    100
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: default_protocol(),
            path: String::new(),
            weight: default_weight(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `protocol://host:port` followed by the path, with a leading `/` enforced
    pub fn url(&self) -> String {
        let base = format!("{}://{}:{}", self.protocol, self.host, self.port);
        if self.path.is_empty() || self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }

    /// Circuit-breaker key for this address
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

/// Two endpoint lists describe the same instance iff their (host, port) sets are equal.
pub fn same_endpoints(a: &[Endpoint], b: &[Endpoint]) -> bool {
    let left: HashSet<(&str, u16)> = a.iter().map(|e| (e.host.as_str(), e.port)).collect();
    let right: HashSet<(&str, u16)> = b.iter().map(|e| (e.host.as_str(), e.port)).collect();
    left == right
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Starting,
    Stopping,
    Unknown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of an instance (guarded by RwLock, shared between clones)
#[derive(Clone, Debug)]
pub struct InstanceRuntimeState {
    pub status: ServiceStatus,
    pub last_heartbeat: Instant,
}

/// One running copy of a named service
#[derive(Debug)]
pub struct ServiceInstance {
    pub name: String,
    pub version: String,
    /// Never empty; the first entry is the primary endpoint
    endpoints: Vec<Endpoint>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub health_check_url: String,
    inner: Arc<RwLock<InstanceRuntimeState>>,
}

impl Clone for ServiceInstance {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            endpoints: self.endpoints.clone(),
            metadata: self.metadata.clone(),
            health_check_url: self.health_check_url.clone(),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ServiceInstance {
    /// Create an instance reachable at `primary`; further endpoints are added with
    /// [`ServiceInstance::with_endpoint`], so the endpoint list is never empty.
    pub fn new(name: impl Into<String>, version: impl Into<String>, primary: Endpoint) -> Self {
        let health_check_url = format!("{}/health", primary.url());
        Self {
            name: name.into(),
            version: version.into(),
            endpoints: vec![primary],
            metadata: HashMap::new(),
            health_check_url,
            inner: Arc::new(RwLock::new(InstanceRuntimeState {
                status: ServiceStatus::Healthy,
                last_heartbeat: Instant::now(),
            })),
        }
    }

    pub fn with_endpoint(mut self, ep: Endpoint) -> Self {
        self.endpoints.push(ep);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = url.into();
        self
    }

    pub fn with_status(self, status: ServiceStatus) -> Self {
        self.inner.write().status = status;
        self
    }

    pub fn primary_endpoint(&self) -> &Endpoint {
        // `new` seeds the list and nothing removes from it
        &self.endpoints[0]
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.read().status
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.inner.read().last_heartbeat
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == ServiceStatus::Healthy
    }

    pub fn same_endpoints_as(&self, endpoints: &[Endpoint]) -> bool {
        same_endpoints(&self.endpoints, endpoints)
    }

    pub(crate) fn touch(&self, at: Instant) {
        self.inner.write().last_heartbeat = at;
    }

    /// Set the status, returning the previous one
    pub(crate) fn set_status(&self, status: ServiceStatus) -> ServiceStatus {
        let mut state = self.inner.write();
        std::mem::replace(&mut state.status, status)
    }

    /// Move `from -> to` atomically; false if the instance was not in `from`
    pub(crate) fn transition(&self, from: ServiceStatus, to: ServiceStatus) -> bool {
        let mut state = self.inner.write();
        if state.status != from {
            return false;
        }
        state.status = to;
        true
    }
}

/// Serializable description of an instance, as found in configuration files
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub health_check_url: Option<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl ServiceDefinition {
    pub fn into_instance(self) -> Result<ServiceInstance, crate::error::ModelError> {
        let mut endpoints = self.endpoints.into_iter();
        let primary = endpoints
            .next()
            .ok_or_else(|| crate::error::ModelError::NoEndpoints {
                service: self.name.clone(),
            })?;

        let mut instance = ServiceInstance::new(self.name, self.version, primary);
        for ep in endpoints {
            instance = instance.with_endpoint(ep);
        }
        instance.metadata = self.metadata;
        if let Some(url) = self.health_check_url {
            instance.health_check_url = url;
        }
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_normalizes_path() {
        assert_eq!(Endpoint::new("h1", 80).url(), "http://h1:80");
        assert_eq!(
            Endpoint::new("h1", 80).with_path("api").url(),
            "http://h1:80/api"
        );
        assert_eq!(
            Endpoint::new("h1", 443)
                .with_protocol("https")
                .with_path("/v1")
                .url(),
            "https://h1:443/v1"
        );
        assert_eq!(Endpoint::new("h1", 80).key(), "h1:80");
    }

    #[test]
    fn test_same_endpoints_ignores_order_and_other_fields() {
        let a = vec![Endpoint::new("h1", 1), Endpoint::new("h2", 2)];
        let b = vec![
            Endpoint::new("h2", 2).with_weight(5),
            Endpoint::new("h1", 1).with_protocol("https"),
        ];
        assert!(same_endpoints(&a, &b));
        assert!(!same_endpoints(&a, &b[..1]));
        assert!(!same_endpoints(&[Endpoint::new("h1", 1)], &[Endpoint::new("h1", 2)]));
    }

    #[test]
    fn test_default_health_check_url() {
        let inst = ServiceInstance::new("a", "1.0.0", Endpoint::new("h1", 8080));
        assert_eq!(inst.health_check_url, "http://h1:8080/health");
        assert!(inst.is_healthy());

        let custom = ServiceInstance::new("a", "1.0.0", Endpoint::new("h1", 8080))
            .with_health_check_url("http://h1:8080/ready");
        assert_eq!(custom.health_check_url, "http://h1:8080/ready");
    }

    #[test]
    fn test_primary_endpoint_is_first_of_endpoints() {
        let inst = ServiceInstance::new("a", "1.0.0", Endpoint::new("h1", 1))
            .with_endpoint(Endpoint::new("h2", 2))
            .with_endpoint(Endpoint::new("h3", 3));
        let keys: Vec<String> = inst.endpoints().iter().map(Endpoint::key).collect();
        assert_eq!(keys, ["h1:1", "h2:2", "h3:3"]);
        assert_eq!(inst.primary_endpoint().key(), "h1:1");
        assert!(inst.same_endpoints_as(inst.endpoints()));
    }

    #[test]
    fn test_clones_share_runtime_state() {
        let inst = ServiceInstance::new("a", "1.0.0", Endpoint::new("h1", 1));
        let copy = inst.clone();
        copy.set_status(ServiceStatus::Unhealthy);
        assert_eq!(inst.status(), ServiceStatus::Unhealthy);
    }

    #[test]
    fn test_definition_requires_endpoints() {
        let def = ServiceDefinition {
            name: "orders".into(),
            version: "1.0.0".into(),
            endpoints: vec![],
            metadata: HashMap::new(),
            health_check_url: None,
        };
        assert!(def.into_instance().is_err());
    }

    #[test]
    fn test_definition_deserializes_with_defaults() {
        let def: ServiceDefinition = serde_json::from_value(serde_json::json!({
            "name": "orders",
            "endpoints": [{"host": "10.0.0.1", "port": 9000}]
        }))
        .unwrap();
        let inst = def.into_instance().unwrap();
        assert_eq!(inst.version, "1.0.0");
        assert_eq!(inst.primary_endpoint().weight, 100);
        assert_eq!(inst.primary_endpoint().protocol, "http");
        assert_eq!(inst.health_check_url, "http://10.0.0.1:9000/health");
    }
}
