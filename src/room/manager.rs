//! Room manager implementation
//!
//! Owns every room's lifecycle (ACTIVE -> CLOSED), the user -> active room index,
//! the BOTH_DISCONNECTED grace timers, and the archive hand-off to storage.
//! Rooms opened or closed on other instances are mirrored from the bus so every
//! instance can validate actions against the same directory.

use crate::bus::{BusEnvelope, BusPayload, MessageBus};
use crate::connection::{ConnectionRegistry, PresenceTracker};
use crate::error::{ChatError, Result};
use crate::metrics::MetricsCollector;
use crate::moderation::Moderation;
use crate::protocol::ServerEvent;
use crate::storage::{ChatStore, RetryPolicy};
use crate::types::{ChatMode, CloseReason, InstanceId, Room, RoomId, RoomState, UserId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, error, info, warn};

/// Room manager tuning
#[derive(Debug, Clone)]
pub struct RoomManagerConfig {
    /// How long a room survives with both participants offline
    pub grace_period: Duration,
    /// How long closed room records are kept in memory
    pub closed_retention: Duration,
    /// Retry policy for archive requests
    pub archive_retry: RetryPolicy,
}

impl Default for RoomManagerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
            closed_retention: Duration::from_secs(600),
            archive_retry: RetryPolicy::default(),
        }
    }
}

/// Statistics about room manager operations
#[derive(Debug, Clone, Default)]
pub struct RoomManagerStats {
    /// Total rooms opened by this instance
    pub rooms_opened: u64,
    /// Total rooms closed by this instance
    pub rooms_closed: u64,
    /// Rooms mirrored from other instances
    pub rooms_mirrored: u64,
    /// Closed room records purged from memory
    pub rooms_purged: u64,
    /// Current number of active rooms
    pub active_rooms: usize,
    /// Grace timers currently pending
    pub pending_grace_timers: usize,
}

/// Result of a close request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The room transitioned to CLOSED now
    Closed(Room),
    /// The room was already CLOSED; nothing changed
    AlreadyClosed,
    /// A BOTH_DISCONNECTED close is waiting out the grace period
    Pending,
}

#[derive(Debug, Default)]
struct RoomTable {
    rooms: HashMap<RoomId, Room>,
    active_by_user: HashMap<UserId, RoomId>,
}

#[derive(Debug, Default)]
struct GraceTimers {
    next_generation: u64,
    pending: HashMap<RoomId, (u64, JoinHandle<()>)>,
}

/// The room manager
#[derive(Clone)]
pub struct RoomManager {
    table: Arc<RwLock<RoomTable>>,
    timers: Arc<Mutex<GraceTimers>>,
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    moderation: Arc<Moderation>,
    bus: Arc<dyn MessageBus>,
    instance_id: InstanceId,
    config: RoomManagerConfig,
    stats: Arc<RwLock<RoomManagerStats>>,
    metrics_collector: Arc<MetricsCollector>,
}

impl RoomManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        moderation: Arc<Moderation>,
        bus: Arc<dyn MessageBus>,
        instance_id: InstanceId,
        config: RoomManagerConfig,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            table: Arc::new(RwLock::new(RoomTable::default())),
            timers: Arc::new(Mutex::new(GraceTimers::default())),
            store,
            registry,
            presence,
            moderation,
            bus,
            instance_id,
            config,
            stats: Arc::new(RwLock::new(RoomManagerStats::default())),
            metrics_collector,
        }
    }

    fn read_table(&self) -> Result<std::sync::RwLockReadGuard<'_, RoomTable>> {
        self.table.read().map_err(|_| ChatError::lock("rooms").into())
    }

    fn write_table(&self) -> Result<std::sync::RwLockWriteGuard<'_, RoomTable>> {
        self.table.write().map_err(|_| ChatError::lock("rooms").into())
    }

    fn update_stats<F: FnOnce(&mut RoomManagerStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }

    /// Open a room for a freshly claimed pair
    ///
    /// Only the matcher calls this. The room is inserted before the storage
    /// collaborator is told about it and removed again if that fails, so the
    /// "one ACTIVE room per user" check and the insert are a single step.
    pub async fn open(&self, user_a: &str, user_b: &str, mode: ChatMode) -> Result<Room> {
        let room = Room::new(user_a.to_string(), user_b.to_string(), mode);

        {
            let mut table = self.write_table()?;
            if let Some(user) = [user_a, user_b]
                .into_iter()
                .find(|user| table.active_by_user.contains_key(*user))
            {
                error!(
                    "Refusing to open a room for {} and {}: {} already has an active room",
                    user_a, user_b, user
                );
                debug_assert!(false, "user {} matched while in an active room", user);
                return Err(ChatError::MatchCreationFailed {
                    reason: format!("{} already has an active room", user),
                }
                .into());
            }

            table.rooms.insert(room.room_id, room.clone());
            table
                .active_by_user
                .insert(user_a.to_string(), room.room_id);
            table
                .active_by_user
                .insert(user_b.to_string(), room.room_id);
        }

        if let Err(e) = self.store.record_room(&room).await {
            warn!("Storage rejected room {}: {}", room.room_id, e);
            self.forget(&room)?;
            return Err(ChatError::MatchCreationFailed {
                reason: format!("room could not be recorded: {}", e),
            }
            .into());
        }

        info!(
            "Opened room {} for {} and {} (mode {})",
            room.room_id, user_a, user_b, mode
        );
        self.metrics_collector.record_room_opened(mode);
        self.update_stats(|stats| {
            stats.rooms_opened += 1;
            stats.active_rooms += 1;
        });
        self.publish(BusPayload::RoomOpened { room: room.clone() })
            .await;

        Ok(room)
    }

    fn forget(&self, room: &Room) -> Result<()> {
        let mut table = self.write_table()?;
        table.rooms.remove(&room.room_id);
        for user in room.participants() {
            if table.active_by_user.get(user.as_str()) == Some(&room.room_id) {
                table.active_by_user.remove(user.as_str());
            }
        }
        Ok(())
    }

    /// Close a room. Idempotent; BOTH_DISCONNECTED waits out the grace period.
    pub async fn close(&self, room_id: RoomId, reason: CloseReason) -> Result<CloseOutcome> {
        if reason == CloseReason::BothDisconnected {
            return self.schedule_grace_close(room_id);
        }
        self.close_now(room_id, reason, None).await
    }

    /// Close on behalf of a participant (SKIP or BLOCK)
    pub async fn close_by(
        &self,
        room_id: RoomId,
        reason: CloseReason,
        user_id: &str,
    ) -> Result<CloseOutcome> {
        let room = self.get(room_id)?.ok_or(ChatError::RoomNotFound { room_id })?;
        if !room.has_participant(user_id) {
            return Err(ChatError::NotParticipant {
                room_id,
                user_id: user_id.to_string(),
            }
            .into());
        }
        self.close_now(room_id, reason, Some(user_id)).await
    }

    async fn close_now(
        &self,
        room_id: RoomId,
        reason: CloseReason,
        initiator: Option<&str>,
    ) -> Result<CloseOutcome> {
        let room = match self.transition_to_closed(room_id, reason)? {
            Some(room) => room,
            None => {
                debug!("Room {} already closed", room_id);
                return Ok(CloseOutcome::AlreadyClosed);
            }
        };

        self.cancel_grace_timer(room_id);
        self.apply_moderation(&room, reason, initiator)?;
        self.detach_participants(&room, reason)?;
        self.publish(BusPayload::RoomClosed {
            room_id,
            reason,
            initiator: initiator.map(str::to_string),
        })
        .await;
        self.archive(&room).await;

        let lifetime = (Utc::now() - room.created_at).to_std().unwrap_or_default();
        info!(
            "Closed room {} ({}) after {:.1}s",
            room_id,
            reason,
            lifetime.as_secs_f64()
        );
        self.metrics_collector.record_room_closed(reason, lifetime);
        self.update_stats(|stats| {
            stats.rooms_closed += 1;
            stats.active_rooms = stats.active_rooms.saturating_sub(1);
        });

        Ok(CloseOutcome::Closed(room))
    }

    /// Flip the room to CLOSED under the table lock; None if it already was
    fn transition_to_closed(&self, room_id: RoomId, reason: CloseReason) -> Result<Option<Room>> {
        let mut table = self.write_table()?;
        let room = table
            .rooms
            .get_mut(&room_id)
            .ok_or(ChatError::RoomNotFound { room_id })?;
        if room.state == RoomState::Closed {
            return Ok(None);
        }

        room.state = RoomState::Closed;
        room.closed_at = Some(Utc::now());
        room.close_reason = Some(reason);
        let room = room.clone();

        for user in room.participants() {
            if table.active_by_user.get(user.as_str()) == Some(&room_id) {
                table.active_by_user.remove(user.as_str());
            }
        }
        Ok(Some(room))
    }

    fn apply_moderation(
        &self,
        room: &Room,
        reason: CloseReason,
        initiator: Option<&str>,
    ) -> Result<()> {
        match (reason, initiator) {
            (CloseReason::Skip, _) => self
                .moderation
                .record_skip(&room.participant_a, &room.participant_b),
            (CloseReason::Block, Some(blocker)) => match room.other_participant(blocker) {
                Some(blocked) => self.moderation.block(blocker, blocked),
                None => Ok(()),
            },
            _ => Ok(()),
        }
    }

    /// Tell local participants the room ended and unsubscribe every bound handle
    fn detach_participants(&self, room: &Room, reason: CloseReason) -> Result<()> {
        let event = ServerEvent::RoomClosed {
            room_id: room.room_id,
            reason,
        };
        for user in room.participants() {
            self.registry.send(user, event.clone())?;
        }
        let unbound = self.registry.unbind_room(room.room_id)?;
        debug!(
            "Unsubscribed {} handle(s) from room {}",
            unbound.len(),
            room.room_id
        );
        Ok(())
    }

    async fn archive(&self, room: &Room) {
        let store = self.store.clone();
        let room_id = room.room_id;
        let result = self
            .config
            .archive_retry
            .run("archive room", || {
                let store = store.clone();
                async move {
                    let events = store.load_backlog(room_id, 0).await?;
                    store.archive_room(room_id, &events).await?;
                    Ok(events.len())
                }
            })
            .await;

        match result {
            Ok(count) => debug!("Archived room {} with {} events", room_id, count),
            Err(e) => {
                error!("Failed to archive room {}: {}", room_id, e);
                self.metrics_collector.record_archive_failure();
            }
        }
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

    /// A participant lost its last connection
    ///
    /// Starts the grace period once neither participant is online anywhere.
    pub fn participant_disconnected(&self, user_id: &str) -> Result<()> {
        let Some(room) = self.active_room_of(user_id)? else {
            return Ok(());
        };
        let anyone_online = room
            .participants()
            .into_iter()
            .any(|user| self.presence.is_online(user));
        if !anyone_online {
            self.schedule_grace_close(room.room_id)?;
        }
        Ok(())
    }

    /// A participant came back; any pending grace close is cancelled
    pub fn participant_reconnected(&self, user_id: &str) -> Result<()> {
        if let Some(room) = self.active_room_of(user_id)? {
            if self.cancel_grace_timer(room.room_id) {
                info!(
                    "{} reconnected, room {} stays active",
                    user_id, room.room_id
                );
            }
        }
        Ok(())
    }

    fn schedule_grace_close(&self, room_id: RoomId) -> Result<CloseOutcome> {
        match self.get(room_id)? {
            None => return Err(ChatError::RoomNotFound { room_id }.into()),
            Some(room) if !room.is_active() => return Ok(CloseOutcome::AlreadyClosed),
            Some(_) => {}
        }

        let mut timers = self.timers.lock().map_err(|_| ChatError::lock("timers"))?;
        if timers.pending.contains_key(&room_id) {
            return Ok(CloseOutcome::Pending);
        }

        let generation = timers.next_generation;
        timers.next_generation += 1;

        let manager = self.clone();
        let grace = self.config.grace_period;
        let handle = tokio::spawn(async move {
            sleep(grace).await;
            if let Err(e) = manager.grace_expired(room_id, generation).await {
                error!("Grace close of room {} failed: {}", room_id, e);
            }
        });
        timers.pending.insert(room_id, (generation, handle));
        drop(timers);

        info!(
            "Both participants of room {} offline, closing in {:?} unless one returns",
            room_id, grace
        );
        self.update_stats(|stats| stats.pending_grace_timers += 1);
        Ok(CloseOutcome::Pending)
    }

    async fn grace_expired(&self, room_id: RoomId, generation: u64) -> Result<()> {
        {
            let mut timers = self.timers.lock().map_err(|_| ChatError::lock("timers"))?;
            match timers.pending.get(&room_id) {
                Some((current, _)) if *current == generation => {
                    timers.pending.remove(&room_id);
                }
                _ => return Ok(()),
            }
        }
        self.update_stats(|stats| {
            stats.pending_grace_timers = stats.pending_grace_timers.saturating_sub(1)
        });

        let Some(room) = self.get(room_id)? else {
            return Ok(());
        };
        if room
            .participants()
            .into_iter()
            .any(|user| self.presence.is_online(user))
        {
            debug!("Room {} has a participant online again", room_id);
            return Ok(());
        }

        self.close_now(room_id, CloseReason::BothDisconnected, None)
            .await
            .map(|_| ())
    }

    fn cancel_grace_timer(&self, room_id: RoomId) -> bool {
        let removed = self
            .timers
            .lock()
            .ok()
            .and_then(|mut timers| timers.pending.remove(&room_id));
        match removed {
            Some((_, handle)) => {
                handle.abort();
                self.update_stats(|stats| {
                    stats.pending_grace_timers = stats.pending_grace_timers.saturating_sub(1)
                });
                true
            }
            None => false,
        }
    }

    pub fn has_pending_close(&self, room_id: RoomId) -> bool {
        self.timers
            .lock()
            .map(|timers| timers.pending.contains_key(&room_id))
            .unwrap_or(false)
    }

    /// Mirror a room opened on another instance
    pub fn apply_remote_open(&self, room: Room) -> Result<()> {
        let mut table = self.write_table()?;
        if table.rooms.contains_key(&room.room_id) {
            return Ok(());
        }
        for user in room.participants() {
            table.active_by_user.insert(user.clone(), room.room_id);
        }
        debug!("Mirrored room {} from another instance", room.room_id);
        table.rooms.insert(room.room_id, room);
        drop(table);

        self.update_stats(|stats| stats.rooms_mirrored += 1);
        Ok(())
    }

    /// Mirror a close performed on another instance; never archives
    pub fn apply_remote_close(
        &self,
        room_id: RoomId,
        reason: CloseReason,
        initiator: Option<&str>,
    ) -> Result<()> {
        let room = match self.transition_to_closed(room_id, reason) {
            Ok(Some(room)) => room,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!("Ignoring remote close of unknown room {}: {}", room_id, e);
                return Ok(());
            }
        };
        self.cancel_grace_timer(room_id);
        self.apply_moderation(&room, reason, initiator)?;
        self.detach_participants(&room, reason)
    }

    pub fn get(&self, room_id: RoomId) -> Result<Option<Room>> {
        Ok(self.read_table()?.rooms.get(&room_id).cloned())
    }

    pub fn active_room_of(&self, user_id: &str) -> Result<Option<Room>> {
        let table = self.read_table()?;
        Ok(table
            .active_by_user
            .get(user_id)
            .and_then(|room_id| table.rooms.get(room_id))
            .cloned())
    }

    /// The room, if it exists, is ACTIVE, and has `user_id` as a participant
    pub fn require_active(&self, room_id: RoomId, user_id: &str) -> Result<Room> {
        let room = self.get(room_id)?.ok_or(ChatError::RoomNotFound { room_id })?;
        if !room.has_participant(user_id) {
            return Err(ChatError::NotParticipant {
                room_id,
                user_id: user_id.to_string(),
            }
            .into());
        }
        if !room.is_active() {
            return Err(ChatError::RoomClosed { room_id }.into());
        }
        Ok(room)
    }

    /// Room must exist and include the user; CLOSED rooms are allowed
    pub fn require_participant(&self, room_id: RoomId, user_id: &str) -> Result<Room> {
        let room = self.get(room_id)?.ok_or(ChatError::RoomNotFound { room_id })?;
        if !room.has_participant(user_id) {
            return Err(ChatError::NotParticipant {
                room_id,
                user_id: user_id.to_string(),
            }
            .into());
        }
        Ok(room)
    }

    pub fn active_room_count(&self) -> usize {
        self.read_table()
            .map(|table| table.rooms.values().filter(|r| r.is_active()).count())
            .unwrap_or(0)
    }

    /// Drop closed room records older than the retention window
    pub fn purge_closed(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.config.closed_retention)
            .unwrap_or(chrono::Duration::minutes(10));
        let cutoff = Utc::now() - retention;

        let mut table = self.write_table()?;
        let before = table.rooms.len();
        table
            .rooms
            .retain(|_, room| room.is_active() || room.closed_at.is_some_and(|at| at > cutoff));
        let purged = before - table.rooms.len();
        drop(table);

        if purged > 0 {
            info!("Purged {} closed room record(s)", purged);
            self.update_stats(|stats| stats.rooms_purged += purged as u64);
        }
        Ok(purged)
    }

    /// Start the cleanup task that runs periodically
    pub fn start_cleanup_task(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(&self);

        let handle = tokio::spawn(async move {
            let mut cleanup_interval = interval(every);
            loop {
                cleanup_interval.tick().await;
                let started = Instant::now();

                if let Err(e) = manager.purge_closed() {
                    error!("Error during room cleanup: {}", e);
                }
                match manager.moderation.purge_expired() {
                    Ok(n) if n > 0 => debug!("Purged {} expired skip cooldown(s)", n),
                    Ok(_) => {}
                    Err(e) => error!("Error during cooldown cleanup: {}", e),
                }
                debug!(
                    "Room cleanup pass took {:.2}ms",
                    started.elapsed().as_secs_f64() * 1000.0
                );
            }
        });

        info!("Started room cleanup task");
        handle
    }

    /// Close every active room with ADMIN, used on shutdown drains
    pub async fn close_all(&self, reason: CloseReason) -> Result<usize> {
        let active: Vec<RoomId> = self
            .read_table()?
            .rooms
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.room_id)
            .collect();
        let mut closed = 0;
        for room_id in active {
            if let CloseOutcome::Closed(_) = self.close_now(room_id, reason, None).await? {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Get current manager statistics
    pub fn get_stats(&self) -> Result<RoomManagerStats> {
        let mut stats = self
            .stats
            .read()
            .map_err(|_| ChatError::lock("stats"))?
            .clone();
        stats.active_rooms = self.active_room_count();
        Ok(stats)
    }
}
