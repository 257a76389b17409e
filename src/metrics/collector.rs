//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the chattr relay using
//! Prometheus metrics. All metric names share the `chattr_` prefix.

use crate::types::{ChatMode, CloseReason};
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the relay
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    service_metrics: ServiceMetrics,
    matchmaking_metrics: MatchmakingMetrics,
    room_metrics: RoomMetrics,
    relay_metrics: RelayMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Bus envelopes handled, by operation and status
    pub bus_messages_total: IntCounterVec,

    /// Bus failures by operation
    pub bus_errors_total: IntCounterVec,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Waiting pool and matcher metrics
#[derive(Clone)]
pub struct MatchmakingMetrics {
    pub search_requests_total: IntCounterVec,
    pub matches_total: IntCounterVec,
    pub match_failures_total: IntCounter,
    pub cancellations_total: IntCounterVec,
    pub searches_expired_total: IntCounter,
    pub waiting_users: IntGaugeVec,
    pub wait_time_seconds: HistogramVec,
    pub match_duration_seconds: Histogram,
}

/// Room lifecycle metrics
#[derive(Clone)]
pub struct RoomMetrics {
    pub active_rooms: IntGauge,
    pub rooms_opened_total: IntCounterVec,
    pub rooms_closed_total: IntCounterVec,
    pub room_lifetime_seconds: Histogram,
    pub archive_failures_total: IntCounter,
}

/// Real-time relay metrics
#[derive(Clone)]
pub struct RelayMetrics {
    pub messages_total: IntCounterVec,
    pub typing_total: IntCounterVec,
    pub read_receipts_total: IntCounter,
    pub active_connections: IntGauge,
    pub connections_superseded_total: IntCounter,
    pub backlog_replays_total: IntCounter,
    pub message_processing_duration: Histogram,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let matchmaking_metrics = MatchmakingMetrics::new(&registry)?;
        let room_metrics = RoomMetrics::new(&registry)?;
        let relay_metrics = RelayMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            matchmaking_metrics,
            room_metrics,
            relay_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    pub fn matchmaking(&self) -> &MatchmakingMetrics {
        &self.matchmaking_metrics
    }

    pub fn room(&self) -> &RoomMetrics {
        &self.room_metrics
    }

    pub fn relay(&self) -> &RelayMetrics {
        &self.relay_metrics
    }

    fn mode_label(mode: ChatMode) -> &'static str {
        match mode {
            ChatMode::Friends => "friends",
            ChatMode::Dating => "dating",
            ChatMode::Random => "random",
            ChatMode::Networking => "networking",
        }
    }

    /// Record a START_SEARCH request
    pub fn record_search_request(&self, mode: ChatMode) {
        self.matchmaking_metrics
            .search_requests_total
            .with_label_values(&[Self::mode_label(mode)])
            .inc();
    }

    /// Record a successful match and how long the earlier user waited
    pub fn record_match(&self, mode: ChatMode, waited: Duration, processing: Duration) {
        let mode = Self::mode_label(mode);
        self.matchmaking_metrics
            .matches_total
            .with_label_values(&[mode])
            .inc();
        self.matchmaking_metrics
            .wait_time_seconds
            .with_label_values(&[mode])
            .observe(waited.as_secs_f64());
        self.matchmaking_metrics
            .match_duration_seconds
            .observe(processing.as_secs_f64());
    }

    pub fn record_match_failure(&self) {
        self.matchmaking_metrics.match_failures_total.inc();
    }

    /// Record a cancellation by outcome (cancelled, not_queued, too_late)
    pub fn record_cancel(&self, outcome: &str) {
        self.matchmaking_metrics
            .cancellations_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_search_expired(&self, count: usize) {
        self.matchmaking_metrics
            .searches_expired_total
            .inc_by(count as u64);
    }

    /// Update the waiting pool gauges
    pub fn update_waiting_users(&self, by_mode: &HashMap<ChatMode, usize>) {
        for mode in [
            ChatMode::Friends,
            ChatMode::Dating,
            ChatMode::Random,
            ChatMode::Networking,
        ] {
            self.matchmaking_metrics
                .waiting_users
                .with_label_values(&[Self::mode_label(mode)])
                .set(by_mode.get(&mode).copied().unwrap_or(0) as i64);
        }
    }

    pub fn record_room_opened(&self, mode: ChatMode) {
        self.room_metrics
            .rooms_opened_total
            .with_label_values(&[Self::mode_label(mode)])
            .inc();
        self.room_metrics.active_rooms.inc();
    }

    pub fn record_room_closed(&self, reason: CloseReason, lifetime: Duration) {
        self.room_metrics
            .rooms_closed_total
            .with_label_values(&[reason.as_str()])
            .inc();
        self.room_metrics.active_rooms.dec();
        self.room_metrics
            .room_lifetime_seconds
            .observe(lifetime.as_secs_f64());
    }

    pub fn record_archive_failure(&self) {
        self.room_metrics.archive_failures_total.inc();
    }

    /// Record a MESSAGE action by outcome (delivered, duplicate, failed)
    pub fn record_message(&self, outcome: &str, duration: Duration) {
        self.relay_metrics
            .messages_total
            .with_label_values(&[outcome])
            .inc();
        self.relay_metrics
            .message_processing_duration
            .observe(duration.as_secs_f64());
    }

    pub fn record_typing(&self, suppressed: bool) {
        let outcome = if suppressed { "suppressed" } else { "broadcast" };
        self.relay_metrics
            .typing_total
            .with_label_values(&[outcome])
            .inc();
    }

    pub fn record_read_receipt(&self) {
        self.relay_metrics.read_receipts_total.inc();
    }

    pub fn record_connection_opened(&self, superseded: bool) {
        if superseded {
            self.relay_metrics.connections_superseded_total.inc();
        } else {
            self.relay_metrics.active_connections.inc();
        }
    }

    pub fn record_connection_closed(&self) {
        self.relay_metrics.active_connections.dec();
    }

    pub fn record_backlog_replay(&self) {
        self.relay_metrics.backlog_replays_total.inc();
    }

    /// Record a bus operation
    pub fn record_bus_operation(&self, operation: &str, success: bool) {
        let status = if success { "success" } else { "error" };

        self.service_metrics
            .bus_messages_total
            .with_label_values(&[operation, status])
            .inc();

        if !success {
            self.service_metrics
                .bus_errors_total
                .with_label_values(&[operation])
                .inc();
        }
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds = IntGauge::new("chattr_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let bus_messages_total = IntCounterVec::new(
            Opts::new("chattr_bus_messages_total", "Total bus envelopes handled"),
            &["operation", "status"],
        )?;
        registry.register(Box::new(bus_messages_total.clone()))?;

        let bus_errors_total = IntCounterVec::new(
            Opts::new("chattr_bus_errors_total", "Total bus errors"),
            &["operation"],
        )?;
        registry.register(Box::new(bus_errors_total.clone()))?;

        let health_status = IntGauge::new(
            "chattr_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("chattr_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            bus_messages_total,
            bus_errors_total,
            health_status,
            component_health,
        })
    }
}

impl MatchmakingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let search_requests_total = IntCounterVec::new(
            Opts::new("chattr_search_requests_total", "Total search requests"),
            &["mode"],
        )?;
        registry.register(Box::new(search_requests_total.clone()))?;

        let matches_total = IntCounterVec::new(
            Opts::new("chattr_matches_total", "Total pairs matched"),
            &["mode"],
        )?;
        registry.register(Box::new(matches_total.clone()))?;

        let match_failures_total = IntCounter::new(
            "chattr_match_failures_total",
            "Matches rolled back because the room could not be created",
        )?;
        registry.register(Box::new(match_failures_total.clone()))?;

        let cancellations_total = IntCounterVec::new(
            Opts::new("chattr_search_cancellations_total", "Search cancellations"),
            &["outcome"],
        )?;
        registry.register(Box::new(cancellations_total.clone()))?;

        let searches_expired_total = IntCounter::new(
            "chattr_searches_expired_total",
            "Searches removed after the maximum wait",
        )?;
        registry.register(Box::new(searches_expired_total.clone()))?;

        let waiting_users = IntGaugeVec::new(
            Opts::new("chattr_matchmaking_queue_depth", "Users waiting for a match"),
            &["mode"],
        )?;
        registry.register(Box::new(waiting_users.clone()))?;

        let wait_time_seconds = HistogramVec::new(
            HistogramOpts::new("chattr_match_wait_seconds", "Time spent waiting for a match")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]),
            &["mode"],
        )?;
        registry.register(Box::new(wait_time_seconds.clone()))?;

        let match_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "chattr_matchmaking_duration_seconds",
                "Time to claim a pair and open its room",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(match_duration_seconds.clone()))?;

        Ok(Self {
            search_requests_total,
            matches_total,
            match_failures_total,
            cancellations_total,
            searches_expired_total,
            waiting_users,
            wait_time_seconds,
            match_duration_seconds,
        })
    }
}

impl RoomMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let active_rooms = IntGauge::new("chattr_active_rooms", "Number of active rooms")?;
        registry.register(Box::new(active_rooms.clone()))?;

        let rooms_opened_total = IntCounterVec::new(
            Opts::new("chattr_rooms_opened_total", "Total rooms opened"),
            &["mode"],
        )?;
        registry.register(Box::new(rooms_opened_total.clone()))?;

        let rooms_closed_total = IntCounterVec::new(
            Opts::new("chattr_rooms_closed_total", "Total rooms closed"),
            &["reason"],
        )?;
        registry.register(Box::new(rooms_closed_total.clone()))?;

        let room_lifetime_seconds = Histogram::with_opts(
            HistogramOpts::new("chattr_room_lifetime_seconds", "Room lifetime")
                .buckets(vec![10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
        )?;
        registry.register(Box::new(room_lifetime_seconds.clone()))?;

        let archive_failures_total = IntCounter::new(
            "chattr_archive_failures_total",
            "Room archive requests that failed after retries",
        )?;
        registry.register(Box::new(archive_failures_total.clone()))?;

        Ok(Self {
            active_rooms,
            rooms_opened_total,
            rooms_closed_total,
            room_lifetime_seconds,
            archive_failures_total,
        })
    }
}

impl RelayMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let messages_total = IntCounterVec::new(
            Opts::new("chattr_messages_total", "Total MESSAGE actions"),
            &["outcome"],
        )?;
        registry.register(Box::new(messages_total.clone()))?;

        let typing_total = IntCounterVec::new(
            Opts::new("chattr_typing_total", "Total TYPING actions"),
            &["outcome"],
        )?;
        registry.register(Box::new(typing_total.clone()))?;

        let read_receipts_total =
            IntCounter::new("chattr_read_receipts_total", "Total read receipts relayed")?;
        registry.register(Box::new(read_receipts_total.clone()))?;

        let active_connections =
            IntGauge::new("chattr_active_connections", "Live connections on this instance")?;
        registry.register(Box::new(active_connections.clone()))?;

        let connections_superseded_total = IntCounter::new(
            "chattr_connections_superseded_total",
            "Connections replaced by a newer one for the same user",
        )?;
        registry.register(Box::new(connections_superseded_total.clone()))?;

        let backlog_replays_total =
            IntCounter::new("chattr_backlog_replays_total", "Backlog replays served")?;
        registry.register(Box::new(backlog_replays_total.clone()))?;

        let message_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "chattr_message_processing_duration_seconds",
                "Time from MESSAGE receipt to acknowledgment",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(message_processing_duration.clone()))?;

        Ok(Self {
            messages_total,
            typing_total,
            read_receipts_total,
            active_connections,
            connections_superseded_total,
            backlog_replays_total,
            message_processing_duration,
        })
    }
}
