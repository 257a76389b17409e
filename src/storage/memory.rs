//! In-memory chat store
//!
//! Used by the binary when no external store is configured and by tests.
//! Nothing survives a restart, and instances in different processes do not
//! share it.

use super::{ChatStore, PersistOutcome};
use crate::error::{ChatError, Result};
use crate::types::{ChatEvent, EventId, Room, RoomId, UserId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Ordered events of one room plus the client tokens they were sent with
#[derive(Debug, Default)]
struct RoomEvents {
    events: Vec<ChatEvent>,
    tokens: HashMap<(UserId, String), EventId>,
}

#[derive(Debug, Default)]
pub struct InMemoryChatStore {
    rooms: RwLock<HashMap<RoomId, Room>>,
    events: RwLock<HashMap<RoomId, RoomEvents>>,
    archives: RwLock<HashMap<RoomId, Vec<ChatEvent>>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Archived log of a room, if it has been archived
    pub fn archived(&self, room_id: RoomId) -> Option<Vec<ChatEvent>> {
        self.archives
            .read()
            .ok()
            .and_then(|archives| archives.get(&room_id).cloned())
    }

    pub fn room(&self, room_id: RoomId) -> Option<Room> {
        self.rooms
            .read()
            .ok()
            .and_then(|rooms| rooms.get(&room_id).cloned())
    }

    pub fn event_count(&self, room_id: RoomId) -> usize {
        self.events
            .read()
            .map(|events| events.get(&room_id).map_or(0, |log| log.events.len()))
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn record_room(&self, room: &Room) -> Result<()> {
        self.rooms
            .write()
            .map_err(|_| ChatError::lock("rooms"))?
            .insert(room.room_id, room.clone());
        Ok(())
    }

    async fn persist(&self, event: &ChatEvent) -> Result<PersistOutcome> {
        let mut events = self.events.write().map_err(|_| ChatError::lock("events"))?;
        let log = events.entry(event.room_id).or_default();

        let token_key = event
            .client_token
            .as_ref()
            .map(|token| (event.sender_id.clone(), token.clone()));
        if let Some(existing) = token_key.as_ref().and_then(|key| log.tokens.get(key)) {
            debug!(
                "Token of event {} in room {} already stored as event {}",
                event.event_id, event.room_id, existing
            );
            return Ok(PersistOutcome::Duplicate {
                event_id: *existing,
            });
        }

        match log
            .events
            .binary_search_by_key(&event.event_id, |e| e.event_id)
        {
            Ok(_) => Err(ChatError::EventIdTaken {
                room_id: event.room_id,
                event_id: event.event_id,
            }
            .into()),
            Err(position) => {
                log.events.insert(position, event.clone());
                if let Some(key) = token_key {
                    log.tokens.insert(key, event.event_id);
                }
                Ok(PersistOutcome::Stored)
            }
        }
    }

    async fn last_event_id(&self, room_id: RoomId) -> Result<EventId> {
        let events = self.events.read().map_err(|_| ChatError::lock("events"))?;
        Ok(events
            .get(&room_id)
            .and_then(|log| log.events.last())
            .map_or(0, |event| event.event_id))
    }

    async fn archive_room(&self, room_id: RoomId, events: &[ChatEvent]) -> Result<()> {
        self.archives
            .write()
            .map_err(|_| ChatError::lock("archives"))?
            .insert(room_id, events.to_vec());
        Ok(())
    }

    async fn load_backlog(
        &self,
        room_id: RoomId,
        since_event_id: EventId,
    ) -> Result<Vec<ChatEvent>> {
        let events = self.events.read().map_err(|_| ChatError::lock("events"))?;
        Ok(events
            .get(&room_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.event_id > since_event_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
