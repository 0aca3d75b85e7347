//! Registry event hooks
//!
//! Handlers are stored in one async shape regardless of how they were
//! registered. Dispatch runs them in registration order; a failing or
//! panicking handler is logged and never reaches the code that raised the event.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::ModelError;
use crate::model::ServiceInstance;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegistryEvent {
    ServiceRegistered,
    ServiceDeregistered,
    ServiceUnhealthy,
    ServiceHealthy,
}

impl RegistryEvent {
    pub const ALL: [RegistryEvent; 4] = [
        RegistryEvent::ServiceRegistered,
        RegistryEvent::ServiceDeregistered,
        RegistryEvent::ServiceUnhealthy,
        RegistryEvent::ServiceHealthy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryEvent::ServiceRegistered => "service_registered",
            RegistryEvent::ServiceDeregistered => "service_deregistered",
            RegistryEvent::ServiceUnhealthy => "service_unhealthy",
            RegistryEvent::ServiceHealthy => "service_healthy",
        }
    }
}

impl fmt::Display for RegistryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistryEvent {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RegistryEvent::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ModelError::UnknownEvent(s.to_string()))
    }
}

/// Normalized handler shape
pub type EventHandler =
    Arc<dyn Fn(Arc<ServiceInstance>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure
pub fn async_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Arc<ServiceInstance>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |instance| f(instance).boxed())
}

/// Wrap a plain closure; it runs inline when the handler is invoked
pub fn sync_handler<F>(f: F) -> EventHandler
where
    F: Fn(&ServiceInstance) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |instance| futures::future::ready(f(&instance)).boxed())
}

#[derive(Default)]
pub(crate) struct CallbackRegistry {
    handlers: RwLock<HashMap<RegistryEvent, Vec<EventHandler>>>,
}

impl CallbackRegistry {
    pub(crate) fn add(&self, event: RegistryEvent, handler: EventHandler) {
        self.handlers.write().entry(event).or_default().push(handler);
    }

    pub(crate) fn len(&self, event: RegistryEvent) -> usize {
        self.handlers.read().get(&event).map_or(0, Vec::len)
    }

    pub(crate) async fn dispatch(&self, event: RegistryEvent, instance: Arc<ServiceInstance>) {
        // snapshot so handlers may register further handlers
        let handlers = self.handlers.read().get(&event).cloned().unwrap_or_default();

        for handler in handlers {
            let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(instance.clone())))
            {
                Ok(fut) => fut,
                Err(_) => {
                    tracing::error!(event = %event, service = %instance.name, "event handler panicked");
                    continue;
                }
            };

            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(event = %event, service = %instance.name, error = %e, "event handler failed");
                }
                Err(_) => {
                    tracing::error!(event = %event, service = %instance.name, "event handler panicked");
                }
            }
        }
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<&'static str, usize> = self
            .handlers
            .read()
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("CallbackRegistry")
            .field("handlers", &counts)
            .finish()
    }
}
