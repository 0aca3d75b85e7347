pub mod events;
mod health_checker;
pub mod selection;
mod service_registry;

pub use events::{async_handler, sync_handler, EventHandler, RegistryEvent};
pub use selection::LoadBalancer;
pub use service_registry::ServiceRegistry;
