//! Health and metrics HTTP server
//!
//! Serves the liveness, readiness and full health checks, a `/stats` summary
//! of the relay and the Prometheus scrape endpoint on a port of their own.
//! Every check route goes through one handler; the [`Check`] it is mounted
//! with decides how much of [`HealthCheck`] runs.

use crate::metrics::collector::MetricsCollector;
use crate::relay::RelayStats;
use crate::service::app::ServiceHandle;
use crate::service::health::{ComponentCheck, HealthCheck, HealthStatus};
use crate::types::InstanceId;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "chattr-relay";

#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    /// Typically "0.0.0.0" for all interfaces
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Which question a check route answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Check {
    /// Every component, with details
    Health,
    /// Room directory and bus usable
    Ready,
    /// Process is running
    Alive,
}

impl Check {
    fn path(&self) -> &'static str {
        match self {
            Check::Health => "/health",
            Check::Ready => "/ready",
            Check::Alive => "/alive",
        }
    }

    async fn run(&self, service: &ServiceHandle) -> Result<(HealthStatus, Vec<ComponentCheck>)> {
        match self {
            Check::Health => {
                let health = HealthCheck::check(service).await?;
                Ok((health.status, health.checks))
            }
            Check::Ready => Ok((HealthCheck::readiness_check(service).await?, Vec::new())),
            Check::Alive => Ok((HealthCheck::liveness_check(service).await?, Vec::new())),
        }
    }
}

/// Body of every check route
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub check: Check,
    pub status: HealthStatus,
    pub service: String,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckReport {
    fn unavailable(check: Check, error: String) -> Self {
        Self {
            check,
            status: HealthStatus::Unhealthy,
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION"),
            instance_id: None,
            components: Vec::new(),
            error: Some(error),
        }
    }

    /// Degraded still serves traffic
    pub fn status_code(&self) -> StatusCode {
        match self.status {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for CheckReport {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSummary {
    pub name: String,
    pub version: &'static str,
    pub status: HealthStatus,
    pub instance_id: InstanceId,
    pub uptime_seconds: u64,
    pub coordinates_matchmaking: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub active: usize,
    pub opened: u64,
    pub closed: u64,
    pub pending_grace_timers: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub local: usize,
    pub online_users: usize,
}

/// Body of `/stats`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub service: ServiceSummary,
    pub waiting_users: usize,
    pub rooms: RoomSummary,
    pub connections: ConnectionSummary,
    pub relay: RelayStats,
    pub components: Vec<ComponentCheck>,
    pub timestamp: DateTime<Utc>,
}

impl StatsReport {
    pub async fn gather(service: &ServiceHandle) -> Result<Self> {
        let health = HealthCheck::check(service).await?;
        let relay = service.relay();
        let stats = health.stats;

        Ok(Self {
            service: ServiceSummary {
                name: health.service,
                version: env!("CARGO_PKG_VERSION"),
                status: health.status,
                instance_id: relay.instance_id(),
                uptime_seconds: stats.uptime_seconds,
                coordinates_matchmaking: relay.coordinates_matchmaking(),
            },
            waiting_users: stats.waiting_users,
            rooms: RoomSummary {
                active: stats.active_rooms,
                opened: stats.rooms_opened,
                closed: stats.rooms_closed,
                pending_grace_timers: stats.pending_grace_timers,
            },
            connections: ConnectionSummary {
                local: stats.local_connections,
                online_users: stats.online_users,
            },
            relay: relay.stats(),
            components: health.checks,
            timestamp: health.timestamp,
        })
    }
}

#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub service: Option<ServiceHandle>,
}

pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                service: None,
            },
            shutdown_tx,
        }
    }

    /// Attach the running service; until then every check reports unhealthy
    pub fn with_service(mut self, service: ServiceHandle) -> Self {
        self.state.service = Some(service);
        self
    }

    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr).await?;
        info!("Health server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Health server shutdown signal received");
            })
            .await?;

        info!("Health server stopped");
        Ok(())
    }

    pub fn create_router(&self) -> Router {
        let mut router = Router::new()
            .route("/", get(index_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler));
        for check in [Check::Health, Check::Ready, Check::Alive] {
            router = router.route(
                check.path(),
                get(move |state: State<HealthServerState>| check_handler(state, check)),
            );
        }
        router.with_state(self.state.clone())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to health server: {}", e);
        }
        info!("Health server stop signal sent");
        Ok(())
    }
}

async fn index_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/health", "/ready", "/alive", "/metrics", "/stats"]
    }))
}

async fn check_handler(State(state): State<HealthServerState>, check: Check) -> CheckReport {
    debug!("{:?} check requested", check);

    let Some(service) = &state.service else {
        return CheckReport::unavailable(check, "Service not initialized".to_string());
    };
    match check.run(service).await {
        Ok((status, components)) => CheckReport {
            check,
            status,
            service: service.name().to_string(),
            version: env!("CARGO_PKG_VERSION"),
            instance_id: Some(service.relay().instance_id()),
            components,
            error: None,
        },
        Err(e) => {
            error!("{:?} check failed: {}", check, e);
            CheckReport::unavailable(check, e.to_string())
        }
    }
}

/// Prometheus text exposition of every registered metric
pub fn encode_metrics(metrics_collector: &MetricsCollector) -> Result<String> {
    let metric_families = metrics_collector.registry().gather();
    TextEncoder::new()
        .encode_to_string(&metric_families)
        .context("Failed to encode metrics")
}

async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    match encode_metrics(&state.metrics_collector) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("{}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn stats_handler(State(state): State<HealthServerState>) -> Response {
    let Some(service) = &state.service else {
        return CheckReport::unavailable(Check::Health, "Service not initialized".to_string())
            .into_response();
    };
    match StatsReport::gather(service).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => {
            error!("Failed to gather stats: {}", e);
            CheckReport::unavailable(Check::Health, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router() -> Router {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        HealthServer::new(HealthServerConfig::default(), collector).create_router()
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_checks_without_service_are_unavailable() {
        let app = router();
        for check in [Check::Health, Check::Ready, Check::Alive] {
            let response = get(app.clone(), check.path()).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(body["status"], "unhealthy");
            assert_eq!(body["check"], serde_json::to_value(check).unwrap());
            assert_eq!(body["error"], "Service not initialized");
        }

        let response = get(app, "/stats").await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_degraded_still_serves() {
        let mut report = CheckReport::unavailable(Check::Ready, "bus down".to_string());
        assert_eq!(report.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        report.status = HealthStatus::Degraded;
        assert_eq!(report.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_are_exposed_as_text() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        collector.record_room_opened(crate::types::ChatMode::Friends);
        assert!(encode_metrics(&collector)
            .unwrap()
            .contains("chattr_rooms_opened_total"));

        let app = HealthServer::new(HealthServerConfig::default(), collector).create_router();
        let response = get(app, "/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));
    }

    #[tokio::test]
    async fn test_unknown_paths_are_not_found() {
        assert_eq!(get(router(), "/").await.status(), StatusCode::OK);
        assert_eq!(get(router(), "/nonexistent").await.status(), StatusCode::NOT_FOUND);
    }
}
