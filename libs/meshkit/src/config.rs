//! Tunables for the registry, the circuit breaker and service clients

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::registry::LoadBalancer;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Period of the background health loop
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,
    /// Timeout of a single health check request
    #[serde(default = "default_health_check_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,
    /// Instances without a heartbeat for longer than this are evicted
    #[serde(default = "default_service_ttl", with = "humantime_serde")]
    pub service_ttl: Duration,
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_service_ttl() -> Duration {
    Duration::from_secs(90)
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: default_health_check_interval(),
            health_check_timeout: default_health_check_timeout(),
            service_ttl: default_service_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    /// Open -> half-open delay
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    pub retry_backoff: f64,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// `retry_delay * retry_backoff ^ attempt` for the zero-based attempt index
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.retry_backoff.powi(attempt as i32);
        if !factor.is_finite() || factor < 0.0 {
            return self.retry_delay;
        }
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }

    /// Stable identity of the settings, used as part of the client cache key
    pub(crate) fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            self.failure_threshold,
            self.success_threshold,
            self.timeout.as_millis(),
            self.retry_attempts,
            self.retry_delay.as_millis(),
            self.retry_backoff.to_bits(),
            self.request_timeout.as_millis()
        )
    }
}

/// Per-client settings layered on top of the breaker config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClientConfig {
    pub circuit: CircuitBreakerConfig,
    /// Sent with every request; per-request headers win on conflict
    pub default_headers: HashMap<String, String>,
    /// Version pin used when resolving endpoints
    pub version: Option<String>,
    pub load_balancer: LoadBalancer,
    /// Lifetime of the pooled HTTP session before it is rebuilt
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            circuit: CircuitBreakerConfig::default(),
            default_headers: HashMap::new(),
            version: None,
            load_balancer: LoadBalancer::RoundRobin,
            session_ttl: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    /// Stable identity of every setting; header order does not matter
    pub(crate) fn fingerprint(&self) -> String {
        let mut headers: Vec<_> = self
            .default_headers
            .iter()
            .map(|(k, v)| format!("{}={v}", k.to_ascii_lowercase()))
            .collect();
        headers.sort_unstable();
        format!(
            "{}|v={}|lb={:?}|ttl={}|h={}",
            self.circuit.fingerprint(),
            self.version.as_deref().unwrap_or("*"),
            self.load_balancer,
            self.session_ttl.as_millis(),
            headers.join(",")
        )
    }
}
