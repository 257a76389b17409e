//! Utility functions for the chat relay

use std::time::Duration;
use uuid::Uuid;

/// Generate a new unique room ID
pub fn generate_room_id() -> Uuid {
    Uuid::new_v4()
}

/// Generate a new unique instance ID
pub fn generate_instance_id() -> Uuid {
    Uuid::new_v4()
}

/// Order-independent key for a pair of users
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Exponential backoff for the given zero-based attempt, capped at `max`
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    initial.saturating_mul(factor).min(max)
}
