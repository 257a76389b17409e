//! Which chat events each room has already delivered
//!
//! Events from other instances can arrive out of id order. An event is only a
//! duplicate when the same `(event_id, client_token)` was delivered before.

use crate::error::{ChatError, Result};
use crate::types::{ChatEvent, EventId, RoomId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Deliveries remembered per room for duplicate detection
const REMEMBERED_PER_ROOM: usize = 512;

type DeliveryKey = (EventId, Option<String>);

#[derive(Debug, Default)]
struct RoomDeliveries {
    latest: EventId,
    seen: HashSet<DeliveryKey>,
    order: VecDeque<DeliveryKey>,
}

#[derive(Debug, Default)]
pub struct DeliveryLog {
    rooms: Mutex<HashMap<RoomId, RoomDeliveries>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery; false if this exact event was delivered before
    pub fn record(&self, event: &ChatEvent) -> Result<bool> {
        let mut rooms = self.rooms.lock().map_err(|_| ChatError::lock("deliveries"))?;
        let room = rooms.entry(event.room_id).or_default();

        let key = (event.event_id, event.client_token.clone());
        if !room.seen.insert(key.clone()) {
            return Ok(false);
        }
        room.order.push_back(key);
        if room.order.len() > REMEMBERED_PER_ROOM {
            if let Some(oldest) = room.order.pop_front() {
                room.seen.remove(&oldest);
            }
        }
        room.latest = room.latest.max(event.event_id);
        Ok(true)
    }

    /// Highest event id delivered in the room
    pub fn latest(&self, room_id: RoomId) -> Result<EventId> {
        let rooms = self.rooms.lock().map_err(|_| ChatError::lock("deliveries"))?;
        Ok(rooms.get(&room_id).map_or(0, |room| room.latest))
    }

    pub fn rooms(&self) -> Result<Vec<RoomId>> {
        let rooms = self.rooms.lock().map_err(|_| ChatError::lock("deliveries"))?;
        Ok(rooms.keys().copied().collect())
    }

    pub fn forget(&self, room_id: RoomId) -> Result<bool> {
        let mut rooms = self.rooms.lock().map_err(|_| ChatError::lock("deliveries"))?;
        Ok(rooms.remove(&room_id).is_some())
    }
}
