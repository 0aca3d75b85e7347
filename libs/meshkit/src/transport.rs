//! Outbound HTTP seam shared by service clients and the health checker

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::TransportError;

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub timeout: Duration,
}

impl TransportRequest {
    pub fn new(method: Method, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout,
        }
    }

    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self::new(Method::GET, url, timeout)
    }
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: u16, content_type: Option<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(
            status,
            Some("application/json".to_string()),
            value.to_string().into_bytes(),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue one request. Any HTTP status is a successful transport outcome.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Release pooled connections; the transport stays usable afterwards.
    async fn close(&self) {}
}

struct Session {
    client: reqwest::Client,
    created_at: Instant,
}

/// `reqwest`-backed transport that rebuilds its pooled client after `session_ttl`
pub struct ReqwestTransport {
    session_ttl: Duration,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport")
            .field("session_ttl", &self.session_ttl)
            .field("has_session", &self.session.lock().is_some())
            .finish()
    }
}

impl ReqwestTransport {
    pub fn new(session_ttl: Duration) -> Self {
        Self {
            session_ttl,
            session: Mutex::new(None),
        }
    }

    fn client(&self, url: &str) -> Result<reqwest::Client, TransportError> {
        let mut slot = self.session.lock();
        if let Some(session) = slot.as_ref() {
            if session.created_at.elapsed() < self.session_ttl {
                return Ok(session.client.clone());
            }
            tracing::debug!(ttl = ?self.session_ttl, "recycling HTTP session");
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Request {
                url: url.to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        *slot = Some(Session {
            client: client.clone(),
            created_at: Instant::now(),
        });
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

fn map_reqwest_error(url: &str, timeout: Duration, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
            timeout,
        }
    } else if err.is_connect() {
        TransportError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        TransportError::Request {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client(&request.url)?;
        let url = request.url;
        let timeout = request.timeout;

        let mut builder = client.request(request.method, &url).timeout(timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            let payload = serde_json::to_vec(body).map_err(|e| TransportError::Request {
                url: url.clone(),
                message: format!("failed to encode JSON body: {e}"),
            })?;
            builder = builder
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(payload);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(&url, timeout, e))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout {
                    url: url.clone(),
                    timeout,
                }
            } else {
                TransportError::Body {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        Ok(TransportResponse {
            status,
            content_type,
            body,
        })
    }

    async fn close(&self) {
        if self.session.lock().take().is_some() {
            tracing::debug!("HTTP session closed");
        }
    }
}
