//! Host-side plumbing for MeshKit processes: layered configuration,
//! rotating file logging and shutdown signals.

pub mod config;
pub mod logging;
pub mod signals;

pub use config::*;
pub use logging::*;
pub use signals::*;
