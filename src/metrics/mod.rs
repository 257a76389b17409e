//! Metrics and monitoring for the chattr relay
//!
//! Prometheus collection plus the health/metrics HTTP server.

pub mod collector;
pub mod health;

pub use collector::{
    MatchmakingMetrics, MetricsCollector, MetricsTimer, RelayMetrics, RoomMetrics, ServiceMetrics,
};
pub use health::{CheckReport, HealthServer, HealthServerConfig, StatsReport};

use std::sync::Arc;

/// Metrics collector together with the server that exposes it
#[derive(Clone)]
pub struct MetricsService {
    collector: Arc<MetricsCollector>,
    health_server: Arc<HealthServer>,
}

impl MetricsService {
    pub fn new(collector: Arc<MetricsCollector>, health_server: Arc<HealthServer>) -> Self {
        Self {
            collector,
            health_server,
        }
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn health_server(&self) -> Arc<HealthServer> {
        self.health_server.clone()
    }

    /// Serve the health endpoints until stopped
    pub async fn start(&self) -> anyhow::Result<()> {
        self.health_server.start().await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.health_server.stop().await
    }
}
