//! Background health loop: TTL eviction followed by concurrent HTTP health checks

use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::RegistryEvent;
use super::service_registry::RegistryInner;
use crate::model::{ServiceInstance, ServiceStatus};
use crate::transport::TransportRequest;

/// Sleeps first, then runs a tick; exits on cancellation or once the registry is gone.
pub(crate) fn spawn_health_loop(
    registry: Weak<RegistryInner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let Some(inner) = registry.upgrade() else {
                break;
            };

            let tick = AssertUnwindSafe(run_health_tick(&inner)).catch_unwind();
            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = tick => {
                    if outcome.is_err() {
                        tracing::error!("health check tick panicked; continuing on next tick");
                    }
                }
            }
        }
        tracing::debug!("health check loop stopped");
    })
}

#[tracing::instrument(name = "meshkit.registry.health_tick", skip_all)]
pub(crate) async fn run_health_tick(inner: &RegistryInner) {
    let now = Instant::now();
    let ttl = inner.config.service_ttl;

    let mut expired = Vec::new();
    let mut to_check = Vec::new();
    let mut emptied = Vec::new();

    for mut entry in inner.services.iter_mut() {
        let list = entry.value_mut();
        list.retain(|inst| {
            if now.saturating_duration_since(inst.last_heartbeat()) > ttl {
                expired.push(inst.clone());
                false
            } else {
                true
            }
        });

        if list.is_empty() {
            emptied.push(entry.key().clone());
        } else {
            to_check.extend(
                list.iter()
                    .filter(|inst| !inst.health_check_url.is_empty())
                    .cloned(),
            );
        }
    }

    for name in emptied {
        inner.services.remove_if(&name, |_, list| list.is_empty());
    }

    for inst in expired {
        tracing::warn!(service = %inst.name, endpoint = %inst.primary_endpoint(), "service TTL expired, removing instance");
        inner
            .callbacks
            .dispatch(RegistryEvent::ServiceDeregistered, inst)
            .await;
    }

    join_all(to_check.into_iter().map(|inst| check_instance(inner, inst))).await;
}

async fn check_instance(inner: &RegistryInner, inst: Arc<ServiceInstance>) {
    let request = TransportRequest::get(
        inst.health_check_url.clone(),
        inner.config.health_check_timeout,
    );

    let failure = match inner.transport.send(request).await {
        Ok(resp) if resp.status == 200 => {
            let previous = inst.set_status(ServiceStatus::Healthy);
            if previous != ServiceStatus::Healthy {
                tracing::info!(service = %inst.name, endpoint = %inst.primary_endpoint(), from = %previous, "service became healthy");
                inner
                    .callbacks
                    .dispatch(RegistryEvent::ServiceHealthy, inst)
                    .await;
            }
            return;
        }
        Ok(resp) => format!("health endpoint returned {}", resp.status),
        Err(e) => e.to_string(),
    };

    if inst.transition(ServiceStatus::Healthy, ServiceStatus::Unhealthy) {
        tracing::warn!(service = %inst.name, endpoint = %inst.primary_endpoint(), error = %failure, "health check failed");
        inner
            .callbacks
            .dispatch(RegistryEvent::ServiceUnhealthy, inst)
            .await;
    } else {
        tracing::debug!(service = %inst.name, error = %failure, "health check still failing");
    }
}
