//! Per-endpoint circuit breaker
//!
//! State lives in the owning client; two clients hitting the same address keep
//! separate counters. Open circuits move to half-open lazily, when the next
//! request is evaluated after `timeout` has passed since the last failure.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<Instant>,
    pub last_request_time: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_request_time: None,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a request to `key` may go out now. Records the request time.
    pub fn can_execute(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut states = self.states.lock();
        let st = states.entry(key.to_string()).or_default();
        st.last_request_time = Some(now);

        match st.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = st
                    .last_failure_time
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(self.config.timeout);
                if elapsed >= self.config.timeout {
                    st.state = CircuitState::HalfOpen;
                    st.success_count = 0;
                    tracing::info!(endpoint = %key, "circuit half-open, allowing trial request");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, key: &str) {
        let mut states = self.states.lock();
        let st = states.entry(key.to_string()).or_default();

        match st.state {
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.success_threshold {
                    st.state = CircuitState::Closed;
                    st.failure_count = 0;
                    st.success_count = 0;
                    tracing::info!(endpoint = %key, "circuit closed");
                }
            }
            CircuitState::Closed => st.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str) {
        let mut states = self.states.lock();
        let st = states.entry(key.to_string()).or_default();
        st.failure_count += 1;
        st.last_failure_time = Some(Instant::now());

        match st.state {
            CircuitState::Closed => {
                if st.failure_count >= self.config.failure_threshold {
                    st.state = CircuitState::Open;
                    tracing::warn!(endpoint = %key, failures = st.failure_count, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                st.success_count = 0;
                tracing::warn!(endpoint = %key, "trial request failed, circuit re-opened");
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, key: &str) -> Option<CircuitBreakerState> {
        self.states.lock().get(key).cloned()
    }

    pub fn states(&self) -> HashMap<String, CircuitBreakerState> {
        self.states.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker(failures: u32, successes: u32, timeout_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: failures,
            success_threshold: successes,
            timeout: Duration::from_secs(timeout_secs),
            ..Default::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_waits_for_timeout() {
        let cb = breaker(2, 2, 60);
        assert!(cb.can_execute("h:1"));
        cb.record_failure("h:1");
        assert_eq!(cb.state("h:1").unwrap().state, CircuitState::Closed);
        cb.record_failure("h:1");
        assert_eq!(cb.state("h:1").unwrap().state, CircuitState::Open);

        assert!(!cb.can_execute("h:1"));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!cb.can_execute("h:1"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.can_execute("h:1"));
        assert_eq!(cb.state("h:1").unwrap().state, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let cb = breaker(1, 2, 10);
        cb.record_failure("k");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.can_execute("k"));

        cb.record_success("k");
        assert_eq!(cb.state("k").unwrap().state, CircuitState::HalfOpen);
        cb.record_success("k");
        let st = cb.state("k").unwrap();
        assert_eq!(st.state, CircuitState::Closed);
        assert_eq!(st.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = breaker(1, 3, 10);
        cb.record_failure("k");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cb.can_execute("k"));
        cb.record_success("k");
        cb.record_failure("k");

        let st = cb.state("k").unwrap();
        assert_eq!(st.state, CircuitState::Open);
        assert_eq!(st.success_count, 0);
        assert!(!cb.can_execute("k"));
    }

    #[test]
    fn test_success_resets_failures_while_closed() {
        let cb = breaker(3, 1, 10);
        cb.record_failure("k");
        cb.record_failure("k");
        cb.record_success("k");
        cb.record_failure("k");
        cb.record_failure("k");
        assert_eq!(cb.state("k").unwrap().state, CircuitState::Closed);
        assert_eq!(cb.state("k").unwrap().failure_count, 2);
    }

    #[test]
    fn test_keys_are_independent() {
        let cb = breaker(1, 1, 60);
        cb.record_failure("a:1");
        assert!(!cb.can_execute("a:1"));
        assert!(cb.can_execute("b:1"));
        assert_eq!(cb.states().len(), 2);
        assert!(cb.state("c:1").is_none());
    }
}
