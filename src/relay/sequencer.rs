//! Per-room event id allocation

use crate::error::{ChatError, Result};
use crate::storage::ChatStore;
use crate::types::{EventId, RoomId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Allocates strictly increasing event ids per room
#[async_trait]
pub trait EventSequencer: Send + Sync {
    /// Next id for `room_id`; the first id of a room is 1
    async fn next_event_id(&self, room_id: RoomId) -> Result<EventId>;

    /// An id assigned elsewhere was seen; later allocations must exceed it
    fn observe(&self, room_id: RoomId, event_id: EventId);

    /// Forget a room that can no longer receive events
    fn forget(&self, room_id: RoomId);
}

/// In-process counters
///
/// Ids stay monotonic across instances only as far as `observe` sees the
/// other instances' events before the next local allocation. Clustered
/// deployments use [`StoreSequencer`].
#[derive(Debug, Default)]
pub struct LocalSequencer {
    counters: Mutex<HashMap<RoomId, EventId>>,
}

impl LocalSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, room_id: RoomId) -> EventId {
        self.counters
            .lock()
            .map(|counters| counters.get(&room_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventSequencer for LocalSequencer {
    async fn next_event_id(&self, room_id: RoomId) -> Result<EventId> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| ChatError::lock("sequencer"))?;
        let counter = counters.entry(room_id).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    fn observe(&self, room_id: RoomId, event_id: EventId) {
        if let Ok(mut counters) = self.counters.lock() {
            let counter = counters.entry(room_id).or_insert(0);
            *counter = (*counter).max(event_id);
        }
    }

    fn forget(&self, room_id: RoomId) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(&room_id);
        }
    }
}

/// Allocates the id after the highest one in the shared store
///
/// Two instances can still pick the same id; the store's conditional insert
/// rejects the loser, which allocates again after the winner's event is stored.
pub struct StoreSequencer {
    store: Arc<dyn ChatStore>,
}

impl StoreSequencer {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSequencer for StoreSequencer {
    async fn next_event_id(&self, room_id: RoomId) -> Result<EventId> {
        Ok(self.store.last_event_id(room_id).await? + 1)
    }

    fn observe(&self, _room_id: RoomId, _event_id: EventId) {}

    fn forget(&self, _room_id: RoomId) {}
}
