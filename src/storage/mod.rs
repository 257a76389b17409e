//! Storage collaborator interface and implementations
//!
//! The relay only ever writes events, archives closed rooms and replays backlog;
//! it never queries the store for anything else.

pub mod memory;
pub mod retry;

use crate::error::Result;
use crate::types::{ChatEvent, EventId, Room, RoomId};
use async_trait::async_trait;

pub use memory::InMemoryChatStore;
pub use retry::RetryPolicy;

/// What a conditional insert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// The event now holds its id
    Stored,
    /// The same sender already stored a message with this client token
    Duplicate { event_id: EventId },
}

/// Trait for the external chat storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Register a newly opened room; failure aborts room creation
    async fn record_room(&self, room: &Room) -> Result<()>;

    /// Durably persist one event as a conditional insert
    ///
    /// Storing the same message twice (same sender and client token) reports
    /// [`PersistOutcome::Duplicate`] with the id it was first stored under. An id
    /// held by a different event fails with `ChatError::EventIdTaken` so the
    /// caller can allocate a fresh one.
    async fn persist(&self, event: &ChatEvent) -> Result<PersistOutcome>;

    /// Highest stored event id of a room, 0 when it has none
    async fn last_event_id(&self, room_id: RoomId) -> Result<EventId>;

    /// Archive a closed room together with its ordered event log
    async fn archive_room(&self, room_id: RoomId, events: &[ChatEvent]) -> Result<()>;

    /// Events with `event_id > since_event_id`, in increasing `event_id` order
    async fn load_backlog(&self, room_id: RoomId, since_event_id: EventId)
        -> Result<Vec<ChatEvent>>;
}

/// Load at most `limit` of the most recent events of a room
pub async fn load_recent(
    store: &dyn ChatStore,
    room_id: RoomId,
    limit: usize,
) -> Result<Vec<ChatEvent>> {
    let mut events = store.load_backlog(room_id, 0).await?;
    if events.len() > limit {
        events.drain(..events.len() - limit);
    }
    Ok(events)
}
