//! Typing indicator debounce

use crate::types::{RoomId, UserId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum re-broadcast interval per user per room
#[derive(Debug)]
pub struct TypingDebouncer {
    interval: Duration,
    last_sent: Mutex<HashMap<(UserId, RoomId), Instant>>,
}

impl TypingDebouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// True if a TYPING from `user_id` in `room_id` should go out now
    pub fn should_broadcast(&self, user_id: &str, room_id: RoomId) -> bool {
        let Ok(mut last_sent) = self.last_sent.lock() else {
            return true;
        };
        let now = Instant::now();
        let key = (user_id.to_string(), room_id);

        match last_sent.get(&key) {
            Some(at) if now.duration_since(*at) < self.interval => false,
            _ => {
                last_sent.insert(key, now);
                true
            }
        }
    }

    pub fn forget_room(&self, room_id: RoomId) {
        if let Ok(mut last_sent) = self.last_sent.lock() {
            last_sent.retain(|(_, room), _| *room != room_id);
        }
    }

    pub fn len(&self) -> usize {
        self.last_sent.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
