//! Health and status HTTP surface.
//!
//! Keeps the per-endpoint connection counters and serves them on a local
//! HTTP port. The counter side implements the forwarder's `StatusSink`
//! capability; the listener manager only ever sees that trait.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ngrokd_forward::StatusSink;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{error, info};

pub const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:8081";

/// Status of a single endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub local_address: String,
    pub target_uri: String,
    pub active: bool,
    pub connections: i64,
    pub total_connections: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    pub errors: i64,
}

/// Full status document served at `/status`
#[derive(Debug, Serialize)]
pub struct Status {
    pub healthy: bool,
    pub ready: bool,
    pub uptime: String,
    pub start_time: DateTime<Utc>,
    pub endpoints: HashMap<String, EndpointStatus>,
}

struct Inner {
    ready: bool,
    endpoints: HashMap<String, EndpointStatus>,
}

/// Shared counter state behind the HTTP surface.
pub struct HealthState {
    started_at: Instant,
    start_time: DateTime<Utc>,
    inner: RwLock<Inner>,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started_at: Instant::now(),
            start_time: Utc::now(),
            inner: RwLock::new(Inner {
                ready: false,
                endpoints: HashMap::new(),
            }),
        })
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.write().unwrap().ready = ready;
    }

    /// Start tracking an endpoint; `active` reflects whether its listener
    /// came up.
    pub fn register_endpoint(&self, name: &str, local_address: &str, target_uri: &str, active: bool) {
        let mut inner = self.inner.write().unwrap();
        inner.endpoints.insert(
            name.to_string(),
            EndpointStatus {
                name: name.to_string(),
                local_address: local_address.to_string(),
                target_uri: target_uri.to_string(),
                active,
                connections: 0,
                total_connections: 0,
                last_activity: None,
                errors: 0,
            },
        );
    }

    pub fn unregister_endpoint(&self, name: &str) {
        self.inner.write().unwrap().endpoints.remove(name);
    }

    pub fn snapshot(&self) -> Status {
        let inner = self.inner.read().unwrap();
        Status {
            healthy: inner.endpoints.values().any(|ep| ep.active),
            ready: inner.ready,
            uptime: format_uptime(self.started_at.elapsed().as_secs()),
            start_time: self.start_time,
            endpoints: inner.endpoints.clone(),
        }
    }
}

impl StatusSink for HealthState {
    fn record_connection(&self, endpoint_name: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(ep) = inner.endpoints.get_mut(endpoint_name) {
            ep.connections += 1;
            ep.total_connections += 1;
            ep.last_activity = Some(Utc::now());
        }
    }

    fn record_connection_close(&self, endpoint_name: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(ep) = inner.endpoints.get_mut(endpoint_name) {
            ep.connections -= 1;
        }
    }

    fn record_error(&self, endpoint_name: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(ep) = inner.endpoints.get_mut(endpoint_name) {
            ep.errors += 1;
        }
    }
}

fn format_uptime(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h{}m{}s", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
    }
}

/// Serve the health endpoints until the process exits.
pub async fn serve(state: Arc<HealthState>, addr: SocketAddr) {
    let router = Router::new()
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/readyz", get(handle_ready))
        .route("/status", get(handle_status))
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %addr, error = %e, "failed to bind health server");
            return;
        }
    };

    info!(address = %addr, "health server listening");
    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "health server error");
    }
}

async fn handle_health(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.snapshot().healthy {
        (StatusCode::OK, "healthy\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy\n")
    }
}

async fn handle_ready(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.snapshot().ready {
        (StatusCode::OK, "ready\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
    }
}

async fn handle_status(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unhealthy_until_an_endpoint_is_active() {
        let state = HealthState::new();
        assert!(!state.snapshot().healthy);

        state.register_endpoint("ep_1", "10.107.0.2:443", "https://a.example:443", false);
        assert!(!state.snapshot().healthy);

        state.register_endpoint("ep_2", "10.107.0.3:5432", "tcp://b.example:5432", true);
        assert!(state.snapshot().healthy);

        state.unregister_endpoint("ep_2");
        assert!(!state.snapshot().healthy);
    }

    #[test]
    fn connection_counters() {
        let state = HealthState::new();
        state.register_endpoint("ep_1", "10.107.0.2:443", "https://a.example:443", true);

        state.record_connection("ep_1");
        state.record_connection("ep_1");
        state.record_connection_close("ep_1");
        state.record_error("ep_1");

        let status = state.snapshot();
        let ep = &status.endpoints["ep_1"];
        assert_eq!(ep.connections, 1);
        assert_eq!(ep.total_connections, 2);
        assert_eq!(ep.errors, 1);
        assert!(ep.last_activity.is_some());
    }

    #[test]
    fn unknown_endpoints_are_ignored_by_the_sink() {
        let state = HealthState::new();
        state.record_connection("ghost");
        state.record_error("ghost");
        assert!(state.snapshot().endpoints.is_empty());
    }

    #[test]
    fn ready_flag_is_explicit() {
        let state = HealthState::new();
        assert!(!state.snapshot().ready);
        state.set_ready(true);
        assert!(state.snapshot().ready);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(30), "30s");
        assert_eq!(format_uptime(90), "1m30s");
        assert_eq!(format_uptime(3725), "1h2m5s");
    }

    #[tokio::test]
    async fn status_endpoint_serves_json() {
        let state = HealthState::new();
        state.register_endpoint("ep_1", "10.107.0.2:443", "https://a.example:443", true);
        state.set_ready(true);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        tokio::spawn(serve(state, addr));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let body: serde_json::Value = http_get(&format!("http://{addr}/status")).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["ready"], true);
        assert_eq!(body["endpoints"]["ep_1"]["target_uri"], "https://a.example:443");
    }

    async fn http_get(url: &str) -> serde_json::Value {
        // Plain TCP fetch to avoid pulling an HTTP client into dev-deps.
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let url = url.strip_prefix("http://").unwrap();
        let (addr, path) = url.split_once('/').unwrap();
        let mut conn = tokio::net::TcpStream::connect(addr).await.unwrap();
        conn.write_all(
            format!("GET /{path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();

        let mut response = Vec::new();
        conn.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8(response).unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        serde_json::from_str(body).unwrap()
    }
}
