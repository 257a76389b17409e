//! Matcher: turns waiting records into rooms
//!
//! Matching is triggered by every enqueue. The pool claims the requester and its
//! earliest compatible candidate in one critical section, the room manager opens
//! the room, and only then are the claims released. A failed open restores both
//! records with their original ordering keys.

use super::policy::PairingPolicy;
use crate::connection::UserNotifier;
use crate::error::{ChatError, Result};
use crate::metrics::MetricsCollector;
use crate::pool::{ClaimedPair, RemoveOutcome, WaitingPool};
use crate::protocol::ServerEvent;
use crate::room::RoomManager;
use crate::types::{PreferenceRecord, Room, RoomId, SearchPreferences, SearchStatus, UserId};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Result of a matching attempt
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// A new room was opened for the requester and a waiting partner
    Matched(Room),
    /// The requester already has an active room; nothing was enqueued
    AlreadyInRoom(Room),
    /// No compatible partner yet; the record stays in the pool
    Pending(SearchStatus),
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotQueued,
    /// Too late: the user was already paired. `room_id` is None while the
    /// room is still being opened.
    AlreadyMatched { room_id: Option<RoomId> },
}

impl CancelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOutcome::Cancelled => "cancelled",
            CancelOutcome::NotQueued => "not_queued",
            CancelOutcome::AlreadyMatched { .. } => "already_matched",
        }
    }
}

pub struct Matcher {
    pool: Arc<WaitingPool>,
    rooms: Arc<RoomManager>,
    policy: Arc<dyn PairingPolicy>,
    notifier: Arc<UserNotifier>,
    metrics_collector: Arc<MetricsCollector>,
}

impl Matcher {
    pub fn new(
        pool: Arc<WaitingPool>,
        rooms: Arc<RoomManager>,
        policy: Arc<dyn PairingPolicy>,
        notifier: Arc<UserNotifier>,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            pool,
            rooms,
            policy,
            notifier,
            metrics_collector,
        }
    }

    pub fn pool(&self) -> &Arc<WaitingPool> {
        &self.pool
    }

    /// Handle a START_SEARCH request
    pub async fn start_search(
        &self,
        user_id: &str,
        preferences: &SearchPreferences,
    ) -> Result<MatchOutcome> {
        if let Some(room) = self.rooms.active_room_of(user_id)? {
            debug!(
                "{} asked to search while in room {}",
                user_id, room.room_id
            );
            return Ok(MatchOutcome::AlreadyInRoom(room));
        }

        let record = PreferenceRecord::from_preferences(user_id, preferences)?;
        self.metrics_collector.record_search_request(record.mode);
        self.try_match(record).await
    }

    /// Enqueue `record` and attempt to pair it with a waiting partner
    pub async fn try_match(&self, record: PreferenceRecord) -> Result<MatchOutcome> {
        let started = Instant::now();
        let user_id = record.user_id.clone();

        match self.pool.enqueue(record) {
            Ok(()) => {}
            Err(e) if is_already_queued(&e) => {
                debug!("{} is already searching, rescanning", user_id);
            }
            Err(e) => return Err(e),
        }

        let policy = self.policy.clone();
        let claimed = self
            .pool
            .claim_compatible(&user_id, |a, b| policy.compatible(a, b))?;

        let Some(pair) = claimed else {
            return Ok(MatchOutcome::Pending(self.status(&user_id)?));
        };

        self.open_room(pair, started).await.map(MatchOutcome::Matched)
    }

    async fn open_room(&self, pair: ClaimedPair, started: Instant) -> Result<Room> {
        let (requester, candidate) = pair.user_ids();
        let (requester, candidate) = (requester.clone(), candidate.clone());
        let mode = pair.requester.mode;

        match self.rooms.open(&requester, &candidate, mode).await {
            Ok(room) => {
                self.pool.release(&pair)?;
                let waited = (Utc::now() - pair.candidate.enqueued_at)
                    .to_std()
                    .unwrap_or_default();
                self.metrics_collector
                    .record_match(mode, waited, started.elapsed());
                info!(
                    "Matched {} with {} in room {} ({:.2}ms)",
                    requester,
                    candidate,
                    room.room_id,
                    started.elapsed().as_secs_f64() * 1000.0
                );
                Ok(room)
            }
            Err(e) => {
                warn!(
                    "Room creation for {} and {} failed, re-enqueueing both: {}",
                    requester, candidate, e
                );
                self.pool.restore(pair)?;
                self.metrics_collector.record_match_failure();

                let reason = match e.downcast_ref::<ChatError>() {
                    Some(ChatError::MatchCreationFailed { reason }) => reason.clone(),
                    _ => e.to_string(),
                };
                // The candidate's own request already returned Pending.
                let notice = ServerEvent::from(&ChatError::MatchCreationFailed {
                    reason: reason.clone(),
                });
                if let Err(e) = self.notifier.notify(&candidate, notice).await {
                    warn!("Could not tell {} about the failed match: {}", candidate, e);
                }

                Err(ChatError::MatchCreationFailed { reason }.into())
            }
        }
    }

    /// Handle a CANCEL_SEARCH request
    ///
    /// Safe to call while a match for the same user is in flight: a claimed
    /// user is reported as matched, never silently dropped.
    pub fn cancel(&self, user_id: &str) -> Result<CancelOutcome> {
        let outcome = match self.pool.remove(user_id)? {
            RemoveOutcome::Removed(_) => CancelOutcome::Cancelled,
            RemoveOutcome::Claimed => CancelOutcome::AlreadyMatched {
                room_id: self.rooms.active_room_of(user_id)?.map(|r| r.room_id),
            },
            RemoveOutcome::Absent => match self.rooms.active_room_of(user_id)? {
                Some(room) => CancelOutcome::AlreadyMatched {
                    room_id: Some(room.room_id),
                },
                None => CancelOutcome::NotQueued,
            },
        };

        debug!("Cancel for {}: {}", user_id, outcome.as_str());
        self.metrics_collector.record_cancel(outcome.as_str());
        Ok(outcome)
    }

    /// Where the user currently is in the matchmaking flow
    ///
    /// A claimed user whose room is still opening reports SEARCHING; the room
    /// shows up as MATCHED a moment later.
    pub fn status(&self, user_id: &str) -> Result<SearchStatus> {
        if let Some(record) = self.pool.get(user_id)? {
            return Ok(SearchStatus::Searching {
                since: record.enqueued_at,
            });
        }
        if let Some(room) = self.rooms.active_room_of(user_id)? {
            return Ok(SearchStatus::Matched {
                room_id: room.room_id,
            });
        }
        if self.pool.is_claimed(user_id) {
            return Ok(SearchStatus::Searching { since: Utc::now() });
        }
        Ok(SearchStatus::Idle)
    }

    /// Remove a disconnected user's search, if any
    pub fn drop_search(&self, user_id: &str) -> Result<bool> {
        Ok(matches!(
            self.pool.remove(user_id)?,
            RemoveOutcome::Removed(_)
        ))
    }

    /// Remove entries that waited longer than `max_wait` and tell their owners
    pub async fn expire_stale(&self, max_wait: Duration) -> Result<Vec<UserId>> {
        let max_wait = chrono::Duration::from_std(max_wait).map_err(|e| {
            ChatError::ConfigurationError {
                message: format!("max wait out of range: {}", e),
            }
        })?;
        let expired = self.pool.expire_older_than(Utc::now() - max_wait)?;
        if expired.is_empty() {
            return Ok(Vec::new());
        }

        info!("Expired {} search(es) past the maximum wait", expired.len());
        self.metrics_collector.record_search_expired(expired.len());

        let mut users = Vec::with_capacity(expired.len());
        for record in expired {
            if let Err(e) = self
                .notifier
                .notify(&record.user_id, ServerEvent::SearchExpired)
                .await
            {
                warn!("Could not notify {} of search expiry: {}", record.user_id, e);
            }
            users.push(record.user_id);
        }
        Ok(users)
    }

    /// Start the periodic search expiry sweep
    pub fn start_expiry_task(self: Arc<Self>, max_wait: Duration, every: Duration) -> JoinHandle<()> {
        let matcher = Arc::clone(&self);

        let handle = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(every);
            loop {
                sweep.tick().await;
                if let Err(e) = matcher.expire_stale(max_wait).await {
                    error!("Search expiry sweep failed: {}", e);
                }
            }
        });

        info!(
            "Started search expiry task (max wait {:?}, every {:?})",
            max_wait, every
        );
        handle
    }

    /// Push pool sizes into the metrics gauges
    pub fn refresh_metrics(&self) -> Result<()> {
        let by_mode = self.pool.size_by_mode()?;
        self.metrics_collector.update_waiting_users(&by_mode);
        Ok(())
    }
}

fn is_already_queued(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ChatError>(),
        Some(ChatError::AlreadyQueued { .. })
    )
}
