//! Main application state and service coordination
//!
//! [`AppState`] wires every component explicitly, owns the chat and health
//! servers and runs the background maintenance tasks.

use crate::amqp::{AmqpBus, AmqpBusConfig, AmqpConfig, AmqpConnection};
use crate::auth::{SessionAuthenticator, StaticTokenAuthenticator, TrustedUserIdAuthenticator};
use crate::bus::{BusHandler, LocalBus, MessageBus};
use crate::config::{AppConfig, BusKind};
use crate::connection::{ConnectionRegistry, PresenceTracker, UserNotifier};
use crate::matcher::{HardFilterPolicy, Matcher};
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector, MetricsService};
use crate::moderation::Moderation;
use crate::pool::WaitingPool;
use crate::profile::StaticProfileDirectory;
use crate::relay::{ChatServer, ChatServerConfig, Relay, RelayComponents, RelayConfig, StoreSequencer};
use crate::room::{RoomManager, RoomManagerConfig};
use crate::service::health::{HealthCheck, HealthStatus};
use crate::storage::{ChatStore, InMemoryChatStore};
use crate::types::{CloseReason, InstanceId};
use crate::utils::generate_instance_id;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Message bus error: {message}")]
    BusConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Cheap, cloneable view of the running service for health checks
#[derive(Clone)]
pub struct ServiceHandle {
    name: String,
    relay: Arc<Relay>,
    bus: Arc<dyn MessageBus>,
    running: Arc<AtomicBool>,
    started_at: Instant,
}

impl ServiceHandle {
    pub fn new(name: impl Into<String>, relay: Arc<Relay>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            name: name.into(),
            relay,
            bus,
            running: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Build the relay and everything it depends on from configuration
pub fn build_relay(
    config: &AppConfig,
    instance_id: InstanceId,
    store: Arc<dyn ChatStore>,
    bus: Arc<dyn MessageBus>,
    metrics_collector: Arc<MetricsCollector>,
) -> Arc<Relay> {
    let registry = Arc::new(ConnectionRegistry::new());
    let presence = Arc::new(PresenceTracker::new());
    let moderation = Arc::new(Moderation::new(config.skip_cooldown()));

    let rooms = Arc::new(RoomManager::new(
        store.clone(),
        registry.clone(),
        presence.clone(),
        moderation.clone(),
        bus.clone(),
        instance_id,
        RoomManagerConfig {
            grace_period: config.grace_period(),
            closed_retention: config.closed_room_retention(),
            archive_retry: config.archive_retry(),
        },
        metrics_collector.clone(),
    ));

    let notifier = Arc::new(UserNotifier::new(
        registry.clone(),
        bus.clone(),
        instance_id,
        metrics_collector.clone(),
    ));

    let matcher = Arc::new(Matcher::new(
        Arc::new(WaitingPool::new()),
        rooms.clone(),
        Arc::new(HardFilterPolicy::new(moderation)),
        notifier.clone(),
        metrics_collector.clone(),
    ));

    Arc::new(Relay::new(
        RelayComponents {
            instance_id,
            registry,
            presence,
            rooms,
            matcher,
            sequencer: Arc::new(StoreSequencer::new(store.clone())),
            store,
            bus,
            notifier,
            profiles: Arc::new(StaticProfileDirectory::new(config.chat.profiles.clone())),
            metrics_collector,
        },
        RelayConfig {
            typing_debounce: config.typing_debounce(),
            history_limit: config.chat.history_limit,
            persist_retry: config.persist_retry(),
            coordinates_matchmaking: config.matchmaking.coordinator,
            search_limit: config.search_limit(),
            message_limit: config.message_limit(),
        },
    ))
}

/// Pick the session authenticator configured in `[auth]`
pub fn build_authenticator(config: &AppConfig) -> Arc<dyn SessionAuthenticator> {
    if config.auth.trust_user_ids {
        warn!("Trusting client-supplied user ids; do not use this outside development");
        Arc::new(TrustedUserIdAuthenticator)
    } else {
        Arc::new(StaticTokenAuthenticator::new(config.auth.tokens.clone()))
    }
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    instance_id: InstanceId,
    relay: Arc<Relay>,
    bus: Arc<dyn MessageBus>,
    chat_server: Arc<ChatServer>,
    metrics_service: Arc<MetricsService>,
    handle: ServiceHandle,
    background_tasks: Vec<JoinHandle<()>>,
}

impl AppState {
    /// Initialize the application, connecting the configured bus
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let instance_id = generate_instance_id();
        info!(
            "Initializing {} (instance {}, bus {:?})",
            config.service.name, instance_id, config.bus.kind
        );

        let bus = Self::initialize_bus(&config, instance_id).await?;
        if config.bus.kind == BusKind::Amqp {
            // Event ids and client tokens are only coordinated through a shared store.
            warn!("The in-memory chat store is not shared between instances");
        }
        Self::with_components(config, instance_id, bus, Arc::new(InMemoryChatStore::new()))
    }

    /// Initialize the application around an existing bus and store
    pub fn with_components(
        config: AppConfig,
        instance_id: InstanceId,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn ChatStore>,
    ) -> Result<Self, ServiceError> {
        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let relay = build_relay(
            &config,
            instance_id,
            store,
            bus.clone(),
            metrics_collector.clone(),
        );
        let handle = ServiceHandle::new(config.service.name.clone(), relay.clone(), bus.clone());

        let chat_server = Arc::new(ChatServer::new(
            ChatServerConfig {
                host: config.chat.host.clone(),
                port: config.chat.port,
                heartbeat_interval: config.heartbeat_interval(),
                admin_token: config.chat.admin_token.clone(),
            },
            relay.clone(),
            build_authenticator(&config),
        ));

        let health_server = HealthServer::new(
            HealthServerConfig {
                port: config.service.health_port,
                host: "0.0.0.0".to_string(),
            },
            metrics_collector.clone(),
        )
        .with_service(handle.clone());
        let metrics_service = Arc::new(MetricsService::new(
            metrics_collector,
            Arc::new(health_server),
        ));

        Ok(Self {
            config,
            instance_id,
            relay,
            bus,
            chat_server,
            metrics_service,
            handle,
            background_tasks: Vec::new(),
        })
    }

    async fn initialize_bus(
        config: &AppConfig,
        instance_id: InstanceId,
    ) -> Result<Arc<dyn MessageBus>, ServiceError> {
        match config.bus.kind {
            BusKind::Local => {
                info!("Using the local bus (single instance)");
                Ok(Arc::new(LocalBus))
            }
            BusKind::Amqp => {
                info!("Connecting to AMQP broker: {}", config.bus.amqp_url);
                let mut amqp_config = AmqpConfig::from_url(&config.bus.amqp_url).map_err(|e| {
                    ServiceError::Configuration {
                        message: format!("Failed to parse AMQP URL: {}", e),
                    }
                })?;
                amqp_config.max_retries = config.bus.max_retry_attempts;
                amqp_config.retry_delay_ms = config.bus.retry_delay_ms;

                let connection = AmqpConnection::new(amqp_config).await.map_err(|e| {
                    ServiceError::BusConnection {
                        message: format!("Failed to connect to AMQP: {}", e),
                    }
                })?;
                let bus = AmqpBus::new(connection, instance_id, AmqpBusConfig::default())
                    .await
                    .map_err(|e| ServiceError::BusConnection {
                        message: format!("Failed to set up the AMQP bus: {}", e),
                    })?;
                Ok(Arc::new(bus))
            }
        }
    }

    /// Subscribe to the bus and start the servers and background tasks
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {}", self.config.service.name);
        self.handle.set_running(true);

        let handler: Arc<dyn BusHandler> = self.relay.clone();
        self.bus
            .subscribe(handler)
            .await
            .map_err(|e| ServiceError::BusConnection {
                message: format!("Failed to subscribe to the {} bus: {}", self.bus.name(), e),
            })?;
        info!("Relay subscribed to the {} bus", self.bus.name());

        self.start_servers();
        self.start_background_tasks();

        // Give the listeners a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!(
            "✅ {} started: chat on port {}, health on port {}",
            self.config.service.name, self.config.chat.port, self.config.service.health_port
        );
        Ok(())
    }

    fn start_servers(&mut self) {
        let metrics_service = self.metrics_service.clone();
        self.background_tasks.push(tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Health server failed: {}", e);
            }
        }));

        let chat_server = self.chat_server.clone();
        self.background_tasks.push(tokio::spawn(async move {
            if let Err(e) = chat_server.start().await {
                error!("Chat server failed: {}", e);
            }
        }));
    }

    fn start_background_tasks(&mut self) {
        info!("Starting background maintenance tasks...");

        let metrics_task = {
            let handle = self.handle.clone();
            let metrics_collector = self.metrics_service.collector();
            let every = self.config.metrics_refresh_interval();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                while handle.is_running() {
                    interval.tick().await;
                    refresh_metrics(&handle, &metrics_collector).await;
                }
                debug!("Metrics refresh task stopped");
            })
        };
        self.background_tasks.push(metrics_task);

        let rooms = self.relay.rooms().clone();
        self.background_tasks
            .push(rooms.start_cleanup_task(self.config.cleanup_interval()));

        self.background_tasks.push(
            self.relay
                .clone()
                .start_maintenance_task(self.config.maintenance_interval()),
        );

        match self.config.max_wait() {
            _ if !self.config.matchmaking.coordinator => {
                info!("Matchmaking is coordinated by another instance")
            }
            Some(max_wait) => {
                let matcher = self.relay.matcher().clone();
                self.background_tasks.push(
                    matcher.start_expiry_task(max_wait, self.config.expiry_sweep_interval()),
                );
            }
            None => info!("Search expiry disabled; users may wait indefinitely"),
        }

        info!(
            "{} background tasks running",
            self.background_tasks.len()
        );
    }

    /// Stop accepting traffic, close connections and stop every task
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of {}", self.config.service.name);
        self.handle.set_running(false);

        if let Err(e) = self.chat_server.stop().await {
            warn!("Failed to stop chat server: {}", e);
        }

        if let Err(e) = self.relay.shutdown() {
            warn!("Failed to close client connections: {}", e);
        }

        // Without a bus no other instance can keep these rooms alive
        if self.config.bus.kind == BusKind::Local {
            match self.relay.rooms().close_all(CloseReason::Admin).await {
                Ok(closed) => info!("Closed {} active room(s)", closed),
                Err(e) => warn!("Failed to close active rooms: {}", e),
            }
        }

        self.stop_background_tasks().await;

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }

        if let Err(e) = self.bus.close().await {
            warn!("Failed to close the {} bus: {}", self.bus.name(), e);
        }

        let final_stats = self
            .relay
            .rooms()
            .get_stats()
            .map_err(|e| ServiceError::BackgroundTask {
                message: format!("Failed to get final stats: {}", e),
            })?;
        info!("Final room statistics: {:?}", final_stats);
        info!("✅ {} shutdown completed", self.config.service.name);
        Ok(())
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("All {} background tasks stopped", task_count);
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    pub fn bus(&self) -> Arc<dyn MessageBus> {
        self.bus.clone()
    }

    pub fn chat_server(&self) -> Arc<ChatServer> {
        self.chat_server.clone()
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

/// Refresh gauges that are sampled rather than counted
async fn refresh_metrics(handle: &ServiceHandle, metrics_collector: &MetricsCollector) {
    metrics_collector
        .service()
        .uptime_seconds
        .set(handle.uptime().as_secs() as i64);

    let relay = handle.relay();
    if let Err(e) = relay.matcher().refresh_metrics() {
        warn!("Failed to refresh matchmaking metrics: {}", e);
    }
    metrics_collector
        .room()
        .active_rooms
        .set(relay.rooms().active_room_count() as i64);

    match HealthCheck::check(handle).await {
        Ok(health) => {
            metrics_collector.update_health_status(health.status.gauge_value());
            for check in &health.checks {
                metrics_collector.update_component_health(
                    &check.name,
                    check.status != HealthStatus::Unhealthy,
                );
            }
            debug!(
                "Metrics refreshed: {} active rooms, {} waiting",
                health.stats.active_rooms, health.stats.waiting_users
            );
        }
        Err(e) => warn!("Health check during metrics refresh failed: {}", e),
    }
}
