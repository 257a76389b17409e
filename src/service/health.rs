//! Health checks and monitoring
//!
//! Aggregates component checks into a single Healthy/Degraded/Unhealthy status
//! for the readiness and liveness checks.

use crate::service::app::ServiceHandle;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value for `chattr_health_status`
    pub fn gauge_value(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    /// Combine with another status, keeping the worse of the two
    fn worst(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "✅ healthy"),
            HealthStatus::Degraded => write!(f, "⚠️  degraded"),
            HealthStatus::Unhealthy => write!(f, "❌ unhealthy"),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Set when the component is not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub active_rooms: usize,
    pub waiting_users: usize,
    pub local_connections: usize,
    pub online_users: usize,
    pub rooms_opened: u64,
    pub rooms_closed: u64,
    pub pending_grace_timers: usize,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Perform a full health check of the service
    pub async fn check(service: &ServiceHandle) -> Result<Self> {
        let checks = vec![
            Self::check_service_running(service),
            Self::check_room_manager(service),
            Self::check_waiting_pool(service),
            Self::check_message_bus(service),
        ];

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));

        Ok(HealthCheck {
            status,
            service: service.name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats: Self::gather_service_stats(service),
        })
    }

    /// Liveness only asks whether the service is running
    pub async fn liveness_check(service: &ServiceHandle) -> Result<HealthStatus> {
        if service.is_running() {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness additionally requires the room directory and the bus
    pub async fn readiness_check(service: &ServiceHandle) -> Result<HealthStatus> {
        if !service.is_running() {
            return Ok(HealthStatus::Unhealthy);
        }

        Ok(Self::check_room_manager(service)
            .status
            .worst(Self::check_message_bus(service).status))
    }

    fn check_service_running(service: &ServiceHandle) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = if service.is_running() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_room_manager(service: &ServiceHandle) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = match service.relay().rooms().get_stats() {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!("Room manager stats check failed: {}", e);
                (
                    HealthStatus::Unhealthy,
                    Some(format!("Stats check failed: {}", e)),
                )
            }
        };

        ComponentCheck {
            name: "room_manager".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn check_waiting_pool(service: &ServiceHandle) -> ComponentCheck {
        let start = Instant::now();
        let (status, message) = match service.relay().matcher().pool().size_by_mode() {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => (
                HealthStatus::Unhealthy,
                Some(format!("Waiting pool unavailable: {}", e)),
            ),
        };

        ComponentCheck {
            name: "waiting_pool".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// A broken bus only affects cross-instance traffic, so it degrades
    fn check_message_bus(service: &ServiceHandle) -> ComponentCheck {
        let start = Instant::now();
        let bus = service.bus();
        let (status, message) = if bus.is_healthy() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Degraded,
                Some(format!("{} bus is not connected", bus.name())),
            )
        };

        ComponentCheck {
            name: format!("{}_bus", bus.name()),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    fn gather_service_stats(service: &ServiceHandle) -> ServiceStats {
        let relay = service.relay();
        let relay_stats = relay.stats();
        let mut stats = ServiceStats {
            waiting_users: relay.matcher().pool().len(),
            local_connections: relay_stats.local_connections,
            online_users: relay_stats.online_users,
            uptime_seconds: service.uptime().as_secs(),
            ..ServiceStats::default()
        };

        match relay.rooms().get_stats() {
            Ok(room_stats) => {
                stats.active_rooms = room_stats.active_rooms;
                stats.rooms_opened = room_stats.rooms_opened;
                stats.rooms_closed = room_stats.rooms_closed;
                stats.pending_grace_timers = room_stats.pending_grace_timers;
            }
            Err(e) => debug!("Failed to get room stats for health check: {}", e),
        }
        stats
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
