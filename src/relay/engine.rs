//! Relay engine
//!
//! Per-room delivery of messages, typing indicators and read receipts, plus the
//! connection lifecycle (register, presence, auto-bind, history replay) and the
//! bus handler that re-delivers traffic produced on other instances.
//!
//! Message ordering: a per-room async lock is held from event id allocation
//! through persistence, local broadcast and bus publish, so local delivery order
//! and bus order both equal event id order. Across instances the store's
//! conditional insert decides which of two concurrent sends keeps an id; the
//! other allocates again.
//!
//! Matchmaking runs on one coordinator instance. Other instances forward
//! START_SEARCH and CANCEL_SEARCH over the bus and the coordinator answers
//! through the user notifier.

use super::debounce::TypingDebouncer;
use super::delivery::DeliveryLog;
use super::limiter::{LimitedAction, RateLimit, RateLimiter};
use super::receipts::ReadState;
use super::sequencer::EventSequencer;
use crate::bus::{BusEnvelope, BusHandler, BusPayload, MessageBus};
use crate::connection::{ConnectionHandle, ConnectionRegistry, PresenceTracker, UserNotifier};
use crate::error::{ChatError, Result};
use crate::matcher::{MatchOutcome, Matcher};
use crate::metrics::MetricsCollector;
use crate::profile::ProfileDirectory;
use crate::protocol::ClientAction;
use crate::protocol::ServerEvent;
use crate::room::{CloseOutcome, RoomManager};
use crate::storage::{load_recent, ChatStore, PersistOutcome, RetryPolicy};
use crate::types::{
    ChatEvent, CloseReason, EventId, InstanceId, PreferenceRecord, ProfileCard, Room, RoomId,
    SearchPreferences,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Close code sent to every connection when the relay shuts down
pub const CLOSE_CODE_GOING_AWAY: u16 = 1001;

/// Times a send may lose its event id to another instance before it gives up
const MAX_ID_CONFLICTS: usize = 16;

/// Relay tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Minimum interval between TYPING re-broadcasts per user per room
    pub typing_debounce: Duration,
    /// Events replayed as HISTORY on connect
    pub history_limit: usize,
    /// Retry policy for event persistence
    pub persist_retry: RetryPolicy,
    /// This instance owns the waiting pool; others forward searches to it
    pub coordinates_matchmaking: bool,
    pub search_limit: Option<RateLimit>,
    pub message_limit: Option<RateLimit>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            typing_debounce: Duration::from_secs(1),
            history_limit: 50,
            persist_retry: RetryPolicy::default(),
            coordinates_matchmaking: true,
            search_limit: Some(RateLimit::per_minute(10)),
            message_limit: Some(RateLimit::per_minute(60)),
        }
    }
}

/// Everything the relay talks to
pub struct RelayComponents {
    pub instance_id: InstanceId,
    pub registry: Arc<ConnectionRegistry>,
    pub presence: Arc<PresenceTracker>,
    pub rooms: Arc<RoomManager>,
    pub matcher: Arc<Matcher>,
    pub store: Arc<dyn ChatStore>,
    pub bus: Arc<dyn MessageBus>,
    pub sequencer: Arc<dyn EventSequencer>,
    pub notifier: Arc<UserNotifier>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub metrics_collector: Arc<MetricsCollector>,
}

/// Snapshot for the stats endpoint
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RelayStats {
    pub local_connections: usize,
    pub online_users: usize,
    pub tracked_rooms: usize,
}

#[derive(Debug, Default)]
struct RoomLog {
    /// The sequencer has been moved past everything already persisted
    seeded: bool,
    tokens: HashMap<String, EventId>,
    /// Id taken by a send whose persistence failed; the next send reuses it
    reserved: Option<EventId>,
}

pub struct Relay {
    instance_id: InstanceId,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    rooms: Arc<RoomManager>,
    matcher: Arc<Matcher>,
    store: Arc<dyn ChatStore>,
    bus: Arc<dyn MessageBus>,
    sequencer: Arc<dyn EventSequencer>,
    notifier: Arc<UserNotifier>,
    profiles: Arc<dyn ProfileDirectory>,
    metrics_collector: Arc<MetricsCollector>,
    debouncer: TypingDebouncer,
    reads: ReadState,
    limiter: RateLimiter,
    logs: Mutex<HashMap<RoomId, Arc<AsyncMutex<RoomLog>>>>,
    deliveries: DeliveryLog,
    config: RelayConfig,
}

impl Relay {
    pub fn new(components: RelayComponents, config: RelayConfig) -> Self {
        let RelayComponents {
            instance_id,
            registry,
            presence,
            rooms,
            matcher,
            store,
            bus,
            sequencer,
            notifier,
            profiles,
            metrics_collector,
        } = components;

        Self {
            instance_id,
            registry,
            presence,
            rooms,
            matcher,
            store,
            bus,
            sequencer,
            notifier,
            profiles,
            metrics_collector,
            debouncer: TypingDebouncer::new(config.typing_debounce),
            reads: ReadState::new(),
            limiter: RateLimiter::new(config.search_limit, config.message_limit),
            logs: Mutex::new(HashMap::new()),
            deliveries: DeliveryLog::new(),
            config,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    pub fn coordinates_matchmaking(&self) -> bool {
        self.config.coordinates_matchmaking
    }

    /// A new persistent connection finished its handshake
    pub async fn connect(&self, handle: ConnectionHandle) -> Result<()> {
        let user_id = handle.user_id().clone();
        let previous = self.registry.register(handle.clone())?;
        if let Some(previous) = &previous {
            info!(
                "{} reconnected, connection {} superseded by {}",
                user_id,
                previous.id(),
                handle.id()
            );
        }
        self.metrics_collector
            .record_connection_opened(previous.is_some());

        if let Some(change) = self.presence.mark_online(&user_id, handle.id())? {
            self.announce_presence(&change.user_id, change.online).await;
        }
        self.rooms.participant_reconnected(&user_id)?;

        if let Some(room) = self.rooms.active_room_of(&user_id)? {
            self.registry.bind_room(&user_id, room.room_id)?;
            match load_recent(self.store.as_ref(), room.room_id, self.config.history_limit).await {
                Ok(events) => {
                    self.metrics_collector.record_backlog_replay();
                    handle.send(ServerEvent::History {
                        room_id: room.room_id,
                        events,
                    });
                }
                Err(e) => warn!("Could not load history of room {}: {}", room.room_id, e),
            }
        }

        debug!("{} connected with handle {}", user_id, handle.id());
        Ok(())
    }

    /// A connection ended; stale handles are ignored
    ///
    /// On a forwarding instance the search is dropped by the coordinator once
    /// the offline presence change reaches it.
    pub async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()> {
        let user_id = handle.user_id();
        if !self.registry.unregister(handle)? {
            debug!(
                "Handle {} of {} was already superseded",
                handle.id(),
                user_id
            );
            return Ok(());
        }
        self.metrics_collector.record_connection_closed();

        if let Some(change) = self.presence.mark_offline(user_id, handle.id())? {
            self.announce_presence(&change.user_id, change.online).await;
        }
        if self.config.coordinates_matchmaking && self.matcher.drop_search(user_id)? {
            info!("{} disconnected while searching, search dropped", user_id);
        }
        self.rooms.participant_disconnected(user_id)?;

        debug!("{} disconnected (handle {})", user_id, handle.id());
        Ok(())
    }

    /// Dispatch one client action; replies go to `handle`
    pub async fn handle_action(&self, handle: &ConnectionHandle, action: ClientAction) -> Result<()> {
        let user_id = handle.user_id().as_str();
        match action {
            ClientAction::StartSearch { preferences } => {
                self.limiter.check(user_id, LimitedAction::Search)?;
                if self.config.coordinates_matchmaking {
                    return self.start_search(user_id, &preferences).await;
                }
                // Bad preferences are rejected here rather than by the coordinator.
                PreferenceRecord::from_preferences(user_id, &preferences)?;
                self.forward(BusPayload::SearchRequest {
                    user_id: user_id.to_string(),
                    preferences,
                })
                .await
            }
            ClientAction::CancelSearch => {
                self.limiter.check(user_id, LimitedAction::Search)?;
                if self.config.coordinates_matchmaking {
                    return self.cancel_search(user_id).await;
                }
                self.forward(BusPayload::SearchCancel {
                    user_id: user_id.to_string(),
                })
                .await
            }
            ClientAction::SendMessage {
                room_id,
                content,
                client_token,
            } => {
                self.limiter.check(user_id, LimitedAction::Message)?;
                match self
                    .send_message(user_id, room_id, content, client_token.clone())
                    .await
                {
                    Ok(event_id) => {
                        handle.send(ServerEvent::MessageAck {
                            room_id,
                            client_token,
                            event_id,
                        });
                        Ok(())
                    }
                    Err(e) if is_delivery_failure(&e) => {
                        handle.send(ServerEvent::DeliveryFailed {
                            room_id,
                            client_token,
                        });
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            ClientAction::Typing { room_id } => self.typing(user_id, room_id).await,
            ClientAction::MarkRead {
                room_id,
                up_to_event_id,
            } => self.mark_read(user_id, room_id, up_to_event_id).await,
            ClientAction::JoinRoom {
                room_id,
                since_event_id,
            } => self.join_room(handle, room_id, since_event_id).await,
            ClientAction::Skip { room_id } => self
                .rooms
                .close_by(room_id, CloseReason::Skip, user_id)
                .await
                .map(|_| ()),
            ClientAction::Block { room_id } => self
                .rooms
                .close_by(room_id, CloseReason::Block, user_id)
                .await
                .map(|_| ()),
        }
    }

    /// Run a search on this instance's matcher and answer the user wherever it is connected
    async fn start_search(&self, user_id: &str, preferences: &SearchPreferences) -> Result<()> {
        match self.matcher.start_search(user_id, preferences).await? {
            MatchOutcome::Matched(room) => self.announce_match(&room).await,
            MatchOutcome::AlreadyInRoom(room) => {
                let other_user = match room.other_participant(user_id) {
                    Some(other) => self.profile_of(other).await,
                    None => ProfileCard::anonymous(user_id),
                };
                self.registry.bind_room(user_id, room.room_id)?;
                self.notifier
                    .notify(
                        user_id,
                        ServerEvent::MatchFound {
                            room_id: room.room_id,
                            other_user,
                        },
                    )
                    .await
                    .map(|_| ())
            }
            MatchOutcome::Pending(status) => self
                .notifier
                .notify(user_id, ServerEvent::SearchStatus { status })
                .await
                .map(|_| ()),
        }
    }

    async fn cancel_search(&self, user_id: &str) -> Result<()> {
        self.matcher.cancel(user_id)?;
        let status = self.matcher.status(user_id)?;
        self.notifier
            .notify(user_id, ServerEvent::SearchStatus { status })
            .await
            .map(|_| ())
    }

    /// Send MATCH_FOUND to both participants and bind their local handles
    ///
    /// A participant that cannot be reached does not keep the other from
    /// hearing about the match; it sees the room on reconnect.
    pub async fn announce_match(&self, room: &Room) -> Result<()> {
        for user_id in room.participants() {
            let Some(other) = room.other_participant(user_id) else {
                continue;
            };
            let other_user = self.profile_of(other).await;
            if let Err(e) = self.registry.bind_room(user_id, room.room_id) {
                warn!("Could not bind {} to room {}: {}", user_id, room.room_id, e);
            }
            let notice = ServerEvent::MatchFound {
                room_id: room.room_id,
                other_user,
            };
            if let Err(e) = self.notifier.notify(user_id, notice).await {
                warn!(
                    "MATCH_FOUND for room {} not delivered to {}: {}",
                    room.room_id, user_id, e
                );
            }
        }
        Ok(())
    }

    async fn profile_of(&self, user_id: &str) -> ProfileCard {
        match self.profiles.profile(user_id).await {
            Ok(card) => card,
            Err(e) => {
                warn!("Profile lookup for {} failed: {}", user_id, e);
                ProfileCard::anonymous(user_id)
            }
        }
    }

    fn room_log(&self, room_id: RoomId) -> Result<Arc<AsyncMutex<RoomLog>>> {
        let mut logs = self.logs.lock().map_err(|_| ChatError::lock("room logs"))?;
        Ok(logs.entry(room_id).or_default().clone())
    }

    /// Record, persist and deliver a message; returns its event id
    ///
    /// A resend with a known client token returns the original event id and
    /// produces no new event, even when the original went through another
    /// instance. Fails with `DeliveryFailed` once persistence has exhausted its
    /// retries.
    pub async fn send_message(
        &self,
        sender_id: &str,
        room_id: RoomId,
        content: String,
        client_token: String,
    ) -> Result<EventId> {
        let started = Instant::now();
        if client_token.trim().is_empty() {
            return Err(ChatError::InvalidRequest {
                reason: "clientToken must not be empty".to_string(),
            }
            .into());
        }
        if content.trim().is_empty() {
            return Err(ChatError::InvalidRequest {
                reason: "message content must not be empty".to_string(),
            }
            .into());
        }
        self.rooms.require_active(room_id, sender_id)?;

        let log = self.room_log(room_id)?;
        let mut log = log.lock().await;

        if let Some(event_id) = log.tokens.get(&client_token) {
            debug!(
                "Duplicate token {} in room {}, acknowledging event {}",
                client_token, room_id, event_id
            );
            self.metrics_collector
                .record_message("duplicate", started.elapsed());
            return Ok(*event_id);
        }

        if !log.seeded {
            let last = self.store.last_event_id(room_id).await?;
            self.sequencer.observe(room_id, last);
            log.seeded = true;
        }

        let mut conflicts = 0;
        let (event_id, event) = loop {
            let event_id = match log.reserved.take() {
                Some(event_id) if event_id > self.deliveries.latest(room_id)? => event_id,
                _ => self.sequencer.next_event_id(room_id).await?,
            };
            let event = ChatEvent::message(
                event_id,
                room_id,
                sender_id.to_string(),
                content.clone(),
                client_token.clone(),
            );

            let store = self.store.clone();
            let persisted = self
                .config
                .persist_retry
                .run_unless(
                    "persist event",
                    || {
                        let store = store.clone();
                        let event = event.clone();
                        async move { store.persist(&event).await }
                    },
                    is_id_taken,
                )
                .await;

            match persisted {
                Ok(PersistOutcome::Stored) => break (event_id, event),
                // An earlier attempt of this very write got through.
                Ok(PersistOutcome::Duplicate { event_id: stored }) if stored == event_id => {
                    break (event_id, event)
                }
                Ok(PersistOutcome::Duplicate { event_id: stored }) => {
                    debug!(
                        "Token {} in room {} already stored as event {}",
                        client_token, room_id, stored
                    );
                    log.reserved = Some(event_id);
                    log.tokens.insert(client_token, stored);
                    self.metrics_collector
                        .record_message("duplicate", started.elapsed());
                    return Ok(stored);
                }
                Err(e) if is_id_taken(&e) && conflicts < MAX_ID_CONFLICTS => {
                    conflicts += 1;
                    debug!(
                        "Event id {} of room {} was taken by another instance, allocating again",
                        event_id, room_id
                    );
                    self.sequencer.observe(room_id, event_id);
                }
                Err(e) => {
                    if !is_id_taken(&e) {
                        log.reserved = Some(event_id);
                    }
                    self.metrics_collector
                        .record_message("delivery_failed", started.elapsed());
                    return Err(ChatError::DeliveryFailed {
                        room_id,
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        };

        log.tokens.insert(client_token, event_id);
        self.deliveries.record(&event)?;

        let delivered = self.registry.broadcast_to_room(
            room_id,
            &ServerEvent::Message {
                room_id,
                event: event.clone(),
            },
            Some(sender_id),
        )?;
        self.publish(BusPayload::ChatEvent { event }).await;
        drop(log);

        self.metrics_collector
            .record_message("delivered", started.elapsed());
        debug!(
            "Event {} in room {} from {} delivered to {} local handle(s)",
            event_id, room_id, sender_id, delivered
        );
        Ok(event_id)
    }

    pub async fn typing(&self, user_id: &str, room_id: RoomId) -> Result<()> {
        self.rooms.require_active(room_id, user_id)?;
        if !self.debouncer.should_broadcast(user_id, room_id) {
            self.metrics_collector.record_typing(true);
            return Ok(());
        }
        self.metrics_collector.record_typing(false);

        self.registry.broadcast_to_room(
            room_id,
            &ServerEvent::Typing {
                room_id,
                user_id: user_id.to_string(),
            },
            Some(user_id),
        )?;
        self.publish(BusPayload::Typing {
            room_id,
            user_id: user_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Advance the reader's mark; it can only cover events that exist
    pub async fn mark_read(&self, user_id: &str, room_id: RoomId, up_to: EventId) -> Result<()> {
        self.rooms.require_active(room_id, user_id)?;
        if up_to == 0 {
            return Err(ChatError::InvalidRequest {
                reason: "upToEventId must be at least 1".to_string(),
            }
            .into());
        }
        let mut latest = self.deliveries.latest(room_id)?;
        if up_to > latest {
            // Delivered here or not, the store knows every event of the room.
            latest = latest.max(self.store.last_event_id(room_id).await?);
        }
        if up_to > latest {
            return Err(ChatError::InvalidRequest {
                reason: format!(
                    "upToEventId {} is past the last event {} of room {}",
                    up_to, latest, room_id
                ),
            }
            .into());
        }

        let Some(mark) = self.reads.advance(room_id, user_id, up_to)? else {
            return Ok(());
        };
        self.metrics_collector.record_read_receipt();

        self.registry.broadcast_to_room(
            room_id,
            &ServerEvent::ReadReceipt {
                room_id,
                user_id: user_id.to_string(),
                up_to_event_id: mark,
            },
            Some(user_id),
        )?;
        self.publish(BusPayload::ReadReceipt {
            room_id,
            user_id: user_id.to_string(),
            up_to_event_id: mark,
        })
        .await;
        Ok(())
    }

    /// Bind the handle to a room and replay backlog after the cursor
    pub async fn join_room(
        &self,
        handle: &ConnectionHandle,
        room_id: RoomId,
        since_event_id: Option<EventId>,
    ) -> Result<()> {
        let user_id = handle.user_id().as_str();
        self.rooms.require_active(room_id, user_id)?;
        self.registry.bind_room(user_id, room_id)?;

        let events = match since_event_id {
            Some(cursor) => self.store.load_backlog(room_id, cursor).await?,
            None => load_recent(self.store.as_ref(), room_id, self.config.history_limit).await?,
        };
        self.metrics_collector.record_backlog_replay();
        debug!(
            "Replaying {} event(s) of room {} to {}",
            events.len(),
            room_id,
            user_id
        );
        handle.send(ServerEvent::History { room_id, events });
        Ok(())
    }

    /// Backlog by cursor for a participant (HTTP surface)
    pub async fn backlog(
        &self,
        user_id: &str,
        room_id: RoomId,
        since_event_id: EventId,
    ) -> Result<Vec<ChatEvent>> {
        self.rooms.require_participant(room_id, user_id)?;
        self.store.load_backlog(room_id, since_event_id).await
    }

    /// Administrative close
    pub async fn admin_close(&self, room_id: RoomId) -> Result<CloseOutcome> {
        info!("Administrative close of room {}", room_id);
        self.rooms.close(room_id, CloseReason::Admin).await
    }

    /// Tell the user's partner, local or remote, about a presence change
    async fn announce_presence(&self, user_id: &str, online: bool) {
        self.deliver_presence_to_partner(user_id, online);
        self.publish(BusPayload::Presence {
            user_id: user_id.to_string(),
            online,
        })
        .await;
    }

    fn deliver_presence_to_partner(&self, user_id: &str, online: bool) {
        let room = match self.rooms.active_room_of(user_id) {
            Ok(Some(room)) => room,
            Ok(None) => return,
            Err(e) => {
                warn!("Presence of {} not delivered: {}", user_id, e);
                return;
            }
        };
        if let Some(other) = room.other_participant(user_id) {
            let event = ServerEvent::Presence {
                user_id: user_id.to_string(),
                online,
            };
            if let Err(e) = self.registry.send(other, event) {
                warn!("Presence of {} not delivered to {}: {}", user_id, other, e);
            }
        }
    }

    /// Deliver a chat event produced on another instance
    async fn deliver_remote_event(&self, event: ChatEvent) -> Result<()> {
        self.sequencer.observe(event.room_id, event.event_id);
        if !self.deliveries.record(&event)? {
            debug!(
                "Dropping duplicate event {} of room {}",
                event.event_id, event.room_id
            );
            return Ok(());
        }

        let room_id = event.room_id;
        let sender = event.sender_id.clone();
        self.registry.broadcast_to_room(
            room_id,
            &ServerEvent::Message { room_id, event },
            Some(&sender),
        )?;
        Ok(())
    }

    /// A search action from a user connected to another instance
    async fn handle_forwarded_search(&self, payload: BusPayload) -> Result<()> {
        if !self.config.coordinates_matchmaking {
            return Ok(());
        }
        let (user_id, result) = match payload {
            BusPayload::SearchRequest {
                user_id,
                preferences,
            } => {
                let result = self.start_search(&user_id, &preferences).await;
                (user_id, result)
            }
            BusPayload::SearchCancel { user_id } => {
                let result = self.cancel_search(&user_id).await;
                (user_id, result)
            }
            _ => return Ok(()),
        };

        if let Err(e) = result {
            warn!("Forwarded search action of {} failed: {}", user_id, e);
            self.notifier
                .notify(&user_id, ServerEvent::from_error(&e))
                .await?;
        }
        Ok(())
    }

    /// Publish a payload the caller's request depends on
    async fn forward(&self, payload: BusPayload) -> Result<()> {
        let name = payload.name();
        let result = self
            .bus
            .publish(BusEnvelope::new(self.instance_id, payload))
            .await;
        self.metrics_collector
            .record_bus_operation("publish", result.is_ok());
        result.map_err(|e| {
            ChatError::BusConnectionFailed {
                message: format!("could not forward {}: {}", name, e),
            }
            .into()
        })
    }

    async fn publish(&self, payload: BusPayload) {
        let name = payload.name();
        let result = self
            .bus
            .publish(BusEnvelope::new(self.instance_id, payload))
            .await;
        if let Err(e) = &result {
            warn!("Failed to publish {} on the bus: {}", name, e);
        }
        self.metrics_collector
            .record_bus_operation("publish", result.is_ok());
    }

    /// Drop per-room state for rooms that are closed or gone
    pub fn prune_closed_rooms(&self) -> Result<usize> {
        let mut tracked: Vec<RoomId> = {
            let logs = self.logs.lock().map_err(|_| ChatError::lock("room logs"))?;
            logs.keys().copied().collect()
        };
        tracked.extend(self.deliveries.rooms()?);
        tracked.sort_unstable();
        tracked.dedup();

        let mut pruned = 0;
        for room_id in tracked {
            let active = self.rooms.get(room_id)?.is_some_and(|room| room.is_active());
            if !active && self.forget_room(room_id)? {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!("Pruned relay state of {} closed room(s)", pruned);
        }

        let idle = self.limiter.prune()?;
        if idle > 0 {
            debug!("Dropped {} idle rate limit bucket(s)", idle);
        }
        Ok(pruned)
    }

    fn forget_room(&self, room_id: RoomId) -> Result<bool> {
        let had_log = self
            .logs
            .lock()
            .map_err(|_| ChatError::lock("room logs"))?
            .remove(&room_id)
            .is_some();
        let had_deliveries = self.deliveries.forget(room_id)?;
        self.debouncer.forget_room(room_id);
        self.reads.forget_room(room_id);
        self.sequencer.forget(room_id);
        Ok(had_log || had_deliveries)
    }

    /// Start the task that prunes relay state of closed rooms
    pub fn start_maintenance_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let relay = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tick.tick().await;
                if let Err(e) = relay.prune_closed_rooms() {
                    error!("Relay maintenance failed: {}", e);
                }
            }
        });
        info!("Started relay maintenance task");
        handle
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            local_connections: self.registry.connection_count(),
            online_users: self.presence.online_users().len(),
            tracked_rooms: self.logs.lock().map(|logs| logs.len()).unwrap_or(0),
        }
    }

    /// Close every local connection, used on shutdown
    pub fn shutdown(&self) -> Result<usize> {
        let closed = self
            .registry
            .close_all(CLOSE_CODE_GOING_AWAY, "server shutting down")?;
        info!("Closed {} connection(s) on shutdown", closed);
        Ok(closed)
    }
}

fn is_delivery_failure(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChatError>(),
        Some(ChatError::DeliveryFailed { .. })
    )
}

fn is_id_taken(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChatError>(),
        Some(ChatError::EventIdTaken { .. })
    )
}

#[async_trait]
impl BusHandler for Relay {
    async fn handle(&self, envelope: BusEnvelope) -> Result<()> {
        if envelope.origin == self.instance_id {
            return Ok(());
        }
        debug!(
            "Bus {} from instance {} ({})",
            envelope.payload.name(),
            envelope.origin,
            envelope.key
        );

        match envelope.payload {
            BusPayload::ChatEvent { event } => self.deliver_remote_event(event).await,
            BusPayload::Typing { room_id, user_id } => {
                self.registry.broadcast_to_room(
                    room_id,
                    &ServerEvent::Typing {
                        room_id,
                        user_id: user_id.clone(),
                    },
                    Some(&user_id),
                )?;
                Ok(())
            }
            BusPayload::ReadReceipt {
                room_id,
                user_id,
                up_to_event_id,
            } => {
                self.registry.broadcast_to_room(
                    room_id,
                    &ServerEvent::ReadReceipt {
                        room_id,
                        user_id: user_id.clone(),
                        up_to_event_id,
                    },
                    Some(&user_id),
                )?;
                Ok(())
            }
            BusPayload::Presence { user_id, online } => {
                let Some(change) = self
                    .presence
                    .apply_remote(&user_id, envelope.origin, online)?
                else {
                    return Ok(());
                };
                self.deliver_presence_to_partner(&change.user_id, change.online);
                if change.online {
                    self.rooms.participant_reconnected(&change.user_id)
                } else {
                    if self.config.coordinates_matchmaking
                        && self.matcher.drop_search(&change.user_id)?
                    {
                        info!(
                            "{} went offline on another instance, search dropped",
                            change.user_id
                        );
                    }
                    self.rooms.participant_disconnected(&change.user_id)
                }
            }
            BusPayload::UserEvent { user_id, event } => {
                if let ServerEvent::MatchFound { room_id, .. } = &event {
                    self.registry.bind_room(&user_id, *room_id)?;
                }
                self.registry.send(&user_id, event)?;
                Ok(())
            }
            BusPayload::RoomOpened { room } => self.rooms.apply_remote_open(room),
            BusPayload::RoomClosed {
                room_id,
                reason,
                initiator,
            } => {
                self.rooms
                    .apply_remote_close(room_id, reason, initiator.as_deref())?;
                self.forget_room(room_id).map(|_| ())
            }
            payload @ (BusPayload::SearchRequest { .. } | BusPayload::SearchCancel { .. }) => {
                self.handle_forwarded_search(payload).await
            }
        }
    }
}
