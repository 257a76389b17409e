//! Read state per room and reader

use crate::error::{ChatError, Result};
use crate::types::{EventId, RoomId, UserId};
use std::collections::HashMap;
use std::sync::RwLock;

/// Highest event id each participant has read, as a contiguous prefix
#[derive(Debug, Default)]
pub struct ReadState {
    marks: RwLock<HashMap<(RoomId, UserId), EventId>>,
}

impl ReadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the reader's mark forward to `up_to`
    ///
    /// Returns the new mark, or None if it did not advance (duplicate or
    /// out-of-order MARK_READ).
    pub fn advance(&self, room_id: RoomId, user_id: &str, up_to: EventId) -> Result<Option<EventId>> {
        let mut marks = self
            .marks
            .write()
            .map_err(|_| ChatError::lock("read state"))?;
        let mark = marks.entry((room_id, user_id.to_string())).or_insert(0);
        if up_to <= *mark {
            return Ok(None);
        }
        *mark = up_to;
        Ok(Some(up_to))
    }

    pub fn read_up_to(&self, room_id: RoomId, user_id: &str) -> EventId {
        self.marks
            .read()
            .ok()
            .and_then(|marks| marks.get(&(room_id, user_id.to_string())).copied())
            .unwrap_or(0)
    }

    pub fn forget_room(&self, room_id: RoomId) {
        if let Ok(mut marks) = self.marks.write() {
            marks.retain(|(room, _), _| *room != room_id);
        }
    }
}
