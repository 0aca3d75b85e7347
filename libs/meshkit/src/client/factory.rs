//! Client cache keyed by service name and the full client config

use dashmap::DashMap;
use std::sync::Arc;

use super::service_client::ServiceClient;
use crate::config::ClientConfig;
use crate::registry::ServiceRegistry;
use crate::transport::HttpTransport;

pub struct ServiceClientFactory {
    registry: ServiceRegistry,
    defaults: ClientConfig,
    transport: Option<Arc<dyn HttpTransport>>,
    clients: DashMap<String, Arc<ServiceClient>>,
}

impl std::fmt::Debug for ServiceClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("ServiceClientFactory")
            .field("clients", &keys)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl ServiceClientFactory {
    pub fn new(registry: ServiceRegistry, defaults: ClientConfig) -> Self {
        Self {
            registry,
            defaults,
            transport: None,
            clients: DashMap::new(),
        }
    }

    /// Share one transport between all clients instead of one session per client
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn defaults(&self) -> &ClientConfig {
        &self.defaults
    }

    pub fn get_client(&self, service_name: &str) -> Arc<ServiceClient> {
        self.get_client_with(service_name, self.defaults.clone())
    }

    /// Cached client for `service_name` with `config`; any differing setting
    /// yields a separate client with its own breaker state.
    pub fn get_client_with(&self, service_name: &str, config: ClientConfig) -> Arc<ServiceClient> {
        let key = format!("{service_name}#{}", config.fingerprint());
        self.clients
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(service = %service_name, "creating service client");
                let client = match &self.transport {
                    Some(transport) => ServiceClient::with_transport(
                        service_name,
                        self.registry.clone(),
                        config,
                        transport.clone(),
                    ),
                    None => ServiceClient::new(service_name, self.registry.clone(), config),
                };
                Arc::new(client)
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close and forget every cached client
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        let drained: Vec<Arc<ServiceClient>> = keys
            .iter()
            .filter_map(|k| self.clients.remove(k).map(|(_, c)| c))
            .collect();

        for client in &drained {
            client.close().await;
        }
        if !drained.is_empty() {
            tracing::info!(clients = drained.len(), "closed service clients");
        }
    }
}
