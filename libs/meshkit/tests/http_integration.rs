//! End-to-end behavior against real HTTP servers

use httpmock::prelude::*;
use meshkit::{
    CircuitBreakerConfig, ClientConfig, Endpoint, HttpTransport, LoadBalancer, RegistryConfig,
    RegistryEvent, ReqwestTransport, ServiceClient, ServiceClientError, ServiceInstance,
    ServiceRegistry, ServiceStatus, TransportError, TransportRequest,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn instance_for(server: &MockServer, name: &str) -> ServiceInstance {
    ServiceInstance::new(name, "1.0.0", Endpoint::new(server.host(), server.port()))
}

fn quick_client(registry: ServiceRegistry, name: &str, attempts: u32) -> ServiceClient {
    let config = ClientConfig {
        circuit: CircuitBreakerConfig {
            retry_attempts: attempts,
            retry_delay: Duration::from_millis(10),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        },
        load_balancer: LoadBalancer::First,
        default_headers: [("x-caller".to_string(), "it".to_string())].into(),
        ..Default::default()
    };
    ServiceClient::new(name, registry, config)
}

#[tokio::test]
async fn test_reqwest_transport_round_trip() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/echo")
                .query_param("mode", "fast")
                .header("x-trace", "abc");
            then.status(201)
                .header("content-type", "application/json")
                .json_body(json!({"ok": true}));
        })
        .await;

    let transport = ReqwestTransport::new(Duration::from_secs(60));
    let mut request = TransportRequest::new(
        http::Method::POST,
        server.url("/echo"),
        Duration::from_secs(2),
    );
    request.query.push(("mode".into(), "fast".into()));
    request.headers.push(("x-trace".into(), "abc".into()));
    request.body = Some(json!({"n": 1}));

    let response = transport.send(request).await.unwrap();
    mock.assert_async().await;
    assert_eq!(response.status, 201);
    assert!(response.is_json());
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn test_reqwest_transport_timeout_and_connect_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(Duration::from_millis(500));
        })
        .await;

    let transport = ReqwestTransport::default();
    let err = transport
        .send(TransportRequest::get(
            server.url("/slow"),
            Duration::from_millis(50),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }), "{err:?}");

    // nothing listens on port 1
    let err = transport
        .send(TransportRequest::get(
            "http://127.0.0.1:1/health",
            Duration::from_secs(1),
        ))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::Connect { .. } | TransportError::Request { .. }),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_client_calls_registered_service() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/orders/7").header("x-caller", "it");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"id": 7, "state": "paid"}));
        })
        .await;

    let registry = ServiceRegistry::new(RegistryConfig::default());
    registry
        .register_service(instance_for(&server, "orders"), false)
        .await;
    let client = quick_client(registry, "orders", 3);

    let body = client.get("/orders/7").await.unwrap();
    mock.assert_async().await;
    assert_eq!(body["state"], "paid");
    // no /health route on this server
    assert!(!client.health_check().await);
}

#[tokio::test]
async fn test_client_error_surfaces_immediately() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(DELETE).path("/orders/1");
            then.status(409).body("conflict");
        })
        .await;

    let registry = ServiceRegistry::new(RegistryConfig::default());
    registry
        .register_service(instance_for(&server, "orders"), false)
        .await;
    let client = quick_client(registry, "orders", 3);

    let err = client.delete("/orders/1").await.unwrap_err();
    mock.assert_async().await;
    match err {
        ServiceClientError::ClientStatus { status, body } => {
            assert_eq!(status, 409);
            assert_eq!(body, "conflict");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503);
        })
        .await;

    let registry = ServiceRegistry::new(RegistryConfig::default());
    registry
        .register_service(instance_for(&server, "flaky"), false)
        .await;
    let client = quick_client(registry, "flaky", 2);

    let err = client.get("/flaky").await.unwrap_err();
    assert!(matches!(
        err,
        ServiceClientError::RetriesExhausted { attempts: 2, .. }
    ));
    assert_eq!(err.status_code(), Some(503));
    let key = format!("{}:{}", server.host(), server.port());
    assert_eq!(client.circuit_breaker().state(&key).unwrap().failure_count, 2);
}

#[tokio::test]
async fn test_health_checker_hits_real_endpoints() {
    let up = MockServer::start_async().await;
    up.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(200);
    })
    .await;
    let down = MockServer::start_async().await;
    down.mock_async(|when, then| {
        when.method(GET).path("/health");
        then.status(500);
    })
    .await;

    let registry = ServiceRegistry::new(RegistryConfig {
        health_check_timeout: Duration::from_secs(1),
        ..Default::default()
    });
    let unhealthy = Arc::new(AtomicUsize::new(0));
    let u = unhealthy.clone();
    registry.add_callback(RegistryEvent::ServiceUnhealthy, move |inst| {
        let u = u.clone();
        async move {
            assert_eq!(inst.status(), ServiceStatus::Unhealthy);
            u.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let good = registry
        .register_service(instance_for(&up, "api"), false)
        .await;
    let bad = registry
        .register_service(instance_for(&down, "api"), false)
        .await;

    registry.run_health_checks().await;
    assert!(good.is_healthy());
    assert_eq!(bad.status(), ServiceStatus::Unhealthy);
    assert_eq!(unhealthy.load(Ordering::SeqCst), 1);
    assert_eq!(registry.discover_service("api", None).len(), 1);
}
