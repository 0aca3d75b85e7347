//! Service Registry - in-memory directory of live service instances

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{async_handler, sync_handler, CallbackRegistry, EventHandler, RegistryEvent};
use super::health_checker::{run_health_tick, spawn_health_loop};
use super::selection::{round_robin_index, unix_now_secs, weighted_index, LoadBalancer};
use crate::config::RegistryConfig;
use crate::model::{Endpoint, ServiceInstance, ServiceStatus};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::version::VersionInfo;

struct HealthTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub(crate) struct RegistryInner {
    pub(crate) config: RegistryConfig,
    pub(crate) services: DashMap<String, Vec<Arc<ServiceInstance>>>,
    pub(crate) callbacks: CallbackRegistry,
    pub(crate) transport: Arc<dyn HttpTransport>,
    rng: Mutex<Box<dyn RngCore + Send>>,
    health_task: Mutex<Option<HealthTask>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

/// Central registry of service instances.
///
/// Cheap to clone; clones share state. Instances are identified within a service by
/// their endpoint `(host, port)` set, so registering the same set again replaces the
/// previous entry.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services: Vec<String> = self
            .inner
            .services
            .iter()
            .map(|e| format!("{}({})", e.key(), e.value().len()))
            .collect();
        f.debug_struct("ServiceRegistry")
            .field("services", &services)
            .field("config", &self.inner.config)
            .field("callbacks", &self.inner.callbacks)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_transport(config, Arc::new(ReqwestTransport::default()))
    }

    /// Use a custom transport for health checks
    pub fn with_transport(config: RegistryConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                services: DashMap::new(),
                callbacks: CallbackRegistry::default(),
                transport,
                rng: Mutex::new(Box::new(StdRng::from_os_rng())),
                health_task: Mutex::new(None),
            }),
        }
    }

    /// Replace the randomness source used by weighted selection
    pub fn with_rng(self, rng: impl RngCore + Send + 'static) -> Self {
        *self.inner.rng.lock() = Box::new(rng);
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Start the background health loop. Idempotent; must run inside a tokio runtime.
    pub fn start(&self) {
        let mut slot = self.inner.health_task.lock();
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let interval = self.inner.config.health_check_interval;
        let handle = spawn_health_loop(Arc::downgrade(&self.inner), interval, cancel.clone());
        *slot = Some(HealthTask { cancel, handle });
        tracing::info!(interval = ?interval, ttl = ?self.inner.config.service_ttl, "health check loop started");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .health_task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Stop the health loop and wait for it to finish. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let task = self.inner.health_task.lock().take();
        let Some(task) = task else {
            return;
        };

        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            if !e.is_cancelled() {
                tracing::debug!(error = %e, "health check loop ended abnormally");
            }
        }
        tracing::info!("service registry shut down");
    }

    /// Register (or replace) an instance and stamp its heartbeat.
    ///
    /// With `auto_heartbeat` the health loop is started if it is not running yet.
    #[tracing::instrument(name = "meshkit.registry.register", skip_all, fields(service = %instance.name))]
    pub async fn register_service(
        &self,
        instance: ServiceInstance,
        auto_heartbeat: bool,
    ) -> Arc<ServiceInstance> {
        instance.touch(Instant::now());
        let instance = Arc::new(instance);

        {
            let mut list = self
                .inner
                .services
                .entry(instance.name.clone())
                .or_default();
            list.retain(|existing| !existing.same_endpoints_as(instance.endpoints()));
            list.push(instance.clone());
        }

        tracing::info!(
            service = %instance.name,
            version = %instance.version,
            endpoint = %instance.primary_endpoint(),
            "registered service"
        );
        self.inner
            .callbacks
            .dispatch(RegistryEvent::ServiceRegistered, instance.clone())
            .await;

        if auto_heartbeat {
            self.start();
        }
        instance
    }

    /// Remove the instance matching `endpoints`, or every instance of `name` when
    /// `endpoints` is `None`. Returns how many instances were removed.
    #[tracing::instrument(name = "meshkit.registry.deregister", skip(self, endpoints))]
    pub async fn deregister_service(&self, name: &str, endpoints: Option<&[Endpoint]>) -> usize {
        let removed: Vec<Arc<ServiceInstance>> = match endpoints {
            Some(endpoints) => {
                let mut removed = Vec::new();
                let mut emptied = false;
                if let Some(mut list) = self.inner.services.get_mut(name) {
                    let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *list)
                        .into_iter()
                        .partition(|inst| inst.same_endpoints_as(endpoints));
                    *list = kept;
                    removed = gone;
                    emptied = list.is_empty();
                }
                if emptied {
                    self.inner.services.remove_if(name, |_, list| list.is_empty());
                }
                removed
            }
            None => self
                .inner
                .services
                .remove(name)
                .map(|(_, list)| list)
                .unwrap_or_default(),
        };

        if removed.is_empty() {
            return 0;
        }

        tracing::info!(service = %name, instances = removed.len(), "deregistered service");
        let count = removed.len();
        for inst in removed {
            self.inner
                .callbacks
                .dispatch(RegistryEvent::ServiceDeregistered, inst)
                .await;
        }
        count
    }

    /// Healthy instances of `name`, optionally narrowed to versions compatible with
    /// `version` (equal, or same major).
    ///
    /// Filtering is lenient: if the requested version or any candidate's version
    /// cannot be parsed, all healthy instances are returned unfiltered.
    pub fn discover_service(&self, name: &str, version: Option<&str>) -> Vec<Arc<ServiceInstance>> {
        let healthy: Vec<Arc<ServiceInstance>> = self
            .inner
            .services
            .get(name)
            .map(|list| list.iter().filter(|i| i.is_healthy()).cloned().collect())
            .unwrap_or_default();

        let Some(requested) = version else {
            return healthy;
        };

        match filter_compatible(&healthy, requested) {
            Ok(filtered) => filtered,
            Err(e) => {
                tracing::debug!(service = %name, error = %e, "version filter skipped");
                healthy
            }
        }
    }

    /// Resolve one endpoint of a healthy instance using `strategy`
    pub fn get_service_endpoint(
        &self,
        name: &str,
        version: Option<&str>,
        strategy: LoadBalancer,
    ) -> Option<Endpoint> {
        let instances = self.discover_service(name, version);
        if instances.is_empty() {
            return None;
        }

        let idx = match strategy {
            LoadBalancer::RoundRobin => round_robin_index(unix_now_secs(), instances.len()),
            LoadBalancer::Weighted => {
                let weights: Vec<u64> = instances
                    .iter()
                    .map(|i| i.endpoints().iter().map(|e| u64::from(e.weight)).sum())
                    .collect();
                let mut rng = self.inner.rng.lock();
                weighted_index(&mut **rng, &weights)
            }
            LoadBalancer::First => 0,
        };

        instances
            .get(idx)
            .map(|inst| inst.primary_endpoint().clone())
    }

    /// Refresh the heartbeat of the matching instance; a non-healthy instance is
    /// flipped back to healthy. Returns false if nothing matched.
    pub async fn heartbeat(&self, name: &str, endpoints: &[Endpoint]) -> bool {
        let matched = self.inner.services.get(name).and_then(|list| {
            list.iter()
                .find(|inst| inst.same_endpoints_as(endpoints))
                .cloned()
        });
        let Some(inst) = matched else {
            tracing::debug!(service = %name, "heartbeat for unknown instance");
            return false;
        };

        inst.touch(Instant::now());
        let previous = inst.set_status(ServiceStatus::Healthy);
        if previous != ServiceStatus::Healthy {
            tracing::info!(service = %name, from = %previous, "service recovered via heartbeat");
            self.inner
                .callbacks
                .dispatch(RegistryEvent::ServiceHealthy, inst)
                .await;
        }
        true
    }

    /// Snapshot of every registered instance, healthy or not
    pub fn list_services(&self) -> HashMap<String, Vec<Arc<ServiceInstance>>> {
        self.inner
            .services
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// All instances of `name` regardless of status
    pub fn instances_of(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        self.inner
            .services
            .get(name)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Run one health tick now (TTL eviction, then health checks)
    pub async fn run_health_checks(&self) {
        run_health_tick(&self.inner).await;
    }

    pub fn add_handler(&self, event: RegistryEvent, handler: EventHandler) {
        self.inner.callbacks.add(event, handler);
    }

    /// Subscribe an async handler
    pub fn add_callback<F, Fut>(&self, event: RegistryEvent, f: F)
    where
        F: Fn(Arc<ServiceInstance>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_handler(event, async_handler(f));
    }

    /// Subscribe a synchronous handler
    pub fn add_sync_callback<F>(&self, event: RegistryEvent, f: F)
    where
        F: Fn(&ServiceInstance) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(event, sync_handler(f));
    }

    pub fn callback_count(&self, event: RegistryEvent) -> usize {
        self.inner.callbacks.len(event)
    }
}

fn filter_compatible(
    instances: &[Arc<ServiceInstance>],
    requested: &str,
) -> Result<Vec<Arc<ServiceInstance>>, crate::error::ModelError> {
    let requested: VersionInfo = requested.parse()?;
    let mut filtered = Vec::new();
    for inst in instances {
        let version: VersionInfo = inst.version.parse()?;
        if version == requested || version.is_compatible_with(&requested) {
            filtered.push(inst.clone());
        }
    }
    Ok(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::testing::ScriptedTransport;
    use crate::transport::TransportResponse;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry_with(transport: Arc<ScriptedTransport>) -> ServiceRegistry {
        ServiceRegistry::with_transport(RegistryConfig::default(), transport)
    }

    fn registry() -> ServiceRegistry {
        registry_with(Arc::new(ScriptedTransport::new()))
    }

    fn inst(name: &str, version: &str, host: &str, port: u16) -> ServiceInstance {
        ServiceInstance::new(name, version, Endpoint::new(host, port))
    }

    fn counter(reg: &ServiceRegistry, event: RegistryEvent) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        reg.add_sync_callback(event, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[tokio::test]
    async fn test_register_same_endpoints_replaces() {
        let reg = registry();
        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        reg.register_service(
            inst("a", "1.0.0", "h1", 1).with_metadata("zone", serde_json::json!("b")),
            false,
        )
        .await;

        let all = reg.instances_of("a");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].metadata.get("zone"), Some(&serde_json::json!("b")));

        reg.register_service(inst("a", "1.0.0", "h2", 1), false).await;
        assert_eq!(reg.instances_of("a").len(), 2);
        assert!(!reg.is_running());
    }

    #[tokio::test]
    async fn test_register_fires_callback_and_starts_loop_once() {
        let reg = registry();
        let registered = counter(&reg, RegistryEvent::ServiceRegistered);

        reg.register_service(inst("a", "1.0.0", "h1", 1), true).await;
        reg.register_service(inst("b", "1.0.0", "h2", 1), true).await;

        assert_eq!(registered.load(Ordering::SeqCst), 2);
        assert!(reg.is_running());

        reg.shutdown().await;
        assert!(!reg.is_running());
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn test_discover_only_returns_healthy() {
        let reg = registry();
        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        reg.register_service(
            inst("a", "1.0.0", "h2", 1).with_status(ServiceStatus::Unhealthy),
            false,
        )
        .await;
        reg.register_service(
            inst("a", "1.0.0", "h3", 1).with_status(ServiceStatus::Starting),
            false,
        )
        .await;

        let found = reg.discover_service("a", None);
        assert_eq!(found.len(), 1);
        assert!(found.iter().all(|i| i.is_healthy()));
        assert!(reg.discover_service("missing", None).is_empty());
    }

    #[tokio::test]
    async fn test_discover_version_compatibility() {
        let reg = registry();
        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        reg.register_service(inst("a", "2.1.0", "h2", 1), false).await;

        let found = reg.discover_service("a", Some("1.5.0"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "1.0.0");

        let found = reg.discover_service("a", Some("v2"));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, "2.1.0");

        assert!(reg.discover_service("a", Some("3.0.0")).is_empty());
        // malformed request falls back to every healthy instance
        assert_eq!(reg.discover_service("a", Some("latest")).len(), 2);
    }

    #[tokio::test]
    async fn test_deregister_specific_and_all() {
        let reg = registry();
        let deregistered = counter(&reg, RegistryEvent::ServiceDeregistered);
        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        reg.register_service(inst("a", "1.0.0", "h2", 1), false).await;
        reg.register_service(inst("a", "1.0.0", "h3", 1), false).await;

        let removed = reg
            .deregister_service("a", Some(&[Endpoint::new("h2", 1)]))
            .await;
        assert_eq!(removed, 1);
        assert_eq!(reg.instances_of("a").len(), 2);
        assert_eq!(deregistered.load(Ordering::SeqCst), 1);

        assert_eq!(reg.deregister_service("a", None).await, 2);
        assert_eq!(deregistered.load(Ordering::SeqCst), 3);
        assert!(!reg.list_services().contains_key("a"));
    }

    #[tokio::test]
    async fn test_deregister_absent_is_noop() {
        let reg = registry();
        let deregistered = counter(&reg, RegistryEvent::ServiceDeregistered);
        assert_eq!(reg.deregister_service("ghost", None).await, 0);
        assert_eq!(
            reg.deregister_service("ghost", Some(&[Endpoint::new("h", 1)]))
                .await,
            0
        );
        assert_eq!(deregistered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deregister_last_instance_drops_service() {
        let reg = registry();
        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        reg.deregister_service("a", Some(&[Endpoint::new("h1", 1)]))
            .await;
        assert!(reg.list_services().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_recovers_unhealthy_instance() {
        let reg = registry();
        let healthy = counter(&reg, RegistryEvent::ServiceHealthy);
        let instance = reg
            .register_service(
                inst("a", "1.0.0", "h1", 1).with_status(ServiceStatus::Unhealthy),
                false,
            )
            .await;

        assert!(reg.heartbeat("a", &[Endpoint::new("h1", 1)]).await);
        assert!(instance.is_healthy());
        assert_eq!(healthy.load(Ordering::SeqCst), 1);

        // already healthy: no event
        assert!(reg.heartbeat("a", &[Endpoint::new("h1", 1)]).await);
        assert_eq!(healthy.load(Ordering::SeqCst), 1);

        assert!(!reg.heartbeat("a", &[Endpoint::new("h9", 1)]).await);
        assert!(!reg.heartbeat("b", &[Endpoint::new("h1", 1)]).await);
    }

    #[tokio::test]
    async fn test_endpoint_strategies() {
        let reg = registry().with_seed(3);
        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        reg.register_service(
            ServiceInstance::new("a", "1.0.0", Endpoint::new("h2", 1).with_weight(0)),
            false,
        )
        .await;

        let first = reg
            .get_service_endpoint("a", None, LoadBalancer::First)
            .unwrap();
        assert_eq!(first.host, "h1");

        for _ in 0..50 {
            let picked = reg
                .get_service_endpoint("a", None, LoadBalancer::Weighted)
                .unwrap();
            assert_eq!(picked.host, "h1");
        }

        let rr = reg
            .get_service_endpoint("a", None, LoadBalancer::RoundRobin)
            .unwrap();
        assert!(rr.host == "h1" || rr.host == "h2");

        assert!(reg
            .get_service_endpoint("missing", None, LoadBalancer::First)
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_removes_and_fires_once() {
        let reg = registry();
        let deregistered = counter(&reg, RegistryEvent::ServiceDeregistered);
        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        reg.register_service(inst("b", "1.0.0", "h2", 1), false).await;

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(reg.heartbeat("b", &[Endpoint::new("h2", 1)]).await);
        tokio::time::advance(Duration::from_secs(31)).await;

        reg.run_health_checks().await;
        assert!(!reg.list_services().contains_key("a"));
        assert_eq!(reg.instances_of("b").len(), 1);
        assert_eq!(deregistered.load(Ordering::SeqCst), 1);

        reg.run_health_checks().await;
        assert_eq!(deregistered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_check_transitions() {
        let transport = Arc::new(ScriptedTransport::new());
        let reg = registry_with(transport.clone());
        let unhealthy = counter(&reg, RegistryEvent::ServiceUnhealthy);
        let healthy = counter(&reg, RegistryEvent::ServiceHealthy);

        let good = reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        let bad = reg.register_service(inst("a", "1.0.0", "h2", 1), false).await;
        let dead = reg.register_service(inst("a", "1.0.0", "h3", 1), false).await;

        transport.route(
            "http://h1:1/health",
            Ok(TransportResponse::json(200, &serde_json::json!({}))),
        );
        transport.route(
            "http://h2:1/health",
            Ok(TransportResponse::json(503, &serde_json::json!({}))),
        );
        transport.route(
            "http://h3:1/health",
            Err(TransportError::Connect {
                url: "http://h3:1/health".into(),
                message: "refused".into(),
            }),
        );

        reg.run_health_checks().await;
        assert!(good.is_healthy());
        assert_eq!(bad.status(), ServiceStatus::Unhealthy);
        assert_eq!(dead.status(), ServiceStatus::Unhealthy);
        assert_eq!(unhealthy.load(Ordering::SeqCst), 2);
        assert_eq!(healthy.load(Ordering::SeqCst), 0);

        // still failing: no repeated event
        reg.run_health_checks().await;
        assert_eq!(unhealthy.load(Ordering::SeqCst), 2);

        transport.route(
            "http://h2:1/health",
            Ok(TransportResponse::json(200, &serde_json::json!({}))),
        );
        reg.run_health_checks().await;
        assert!(bad.is_healthy());
        assert_eq!(healthy.load(Ordering::SeqCst), 1);
        assert_eq!(reg.discover_service("a", None).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_runs_on_interval() {
        let transport = Arc::new(ScriptedTransport::new());
        let reg = registry_with(transport.clone());
        reg.register_service(inst("a", "1.0.0", "h1", 1), true).await;

        // loop sleeps before its first tick
        tokio::task::yield_now().await;
        assert_eq!(transport.attempts(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(transport.requests()[0].url, "http://h1:1/health");
        assert_eq!(transport.requests()[0].timeout, Duration::from_secs(5));

        reg.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_callback_failure_does_not_abort_registration() {
        let reg = registry();
        reg.add_sync_callback(RegistryEvent::ServiceRegistered, |_| {
            anyhow::bail!("listener down")
        });
        let after = counter(&reg, RegistryEvent::ServiceRegistered);

        reg.register_service(inst("a", "1.0.0", "h1", 1), false).await;
        assert_eq!(reg.instances_of("a").len(), 1);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(reg.callback_count(RegistryEvent::ServiceRegistered), 2);
    }
}
