//! Error types for the chat relay
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application. Domain failures are raised as [`ChatError`] and
//! recovered at the protocol boundary with `downcast_ref`.

use crate::types::{EventId, RoomId, UserId};

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific matchmaking and relay scenarios
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("User already queued: {user_id}")]
    AlreadyQueued { user_id: UserId },

    #[error("User not in queue: {user_id}")]
    NotInQueue { user_id: UserId },

    #[error("Match creation failed: {reason}")]
    MatchCreationFailed { reason: String },

    #[error("Room not found: {room_id}")]
    RoomNotFound { room_id: RoomId },

    #[error("Room is closed: {room_id}")]
    RoomClosed { room_id: RoomId },

    #[error("User {user_id} is not a participant of room {room_id}")]
    NotParticipant { room_id: RoomId, user_id: UserId },

    #[error("Delivery failed for room {room_id}: {reason}")]
    DeliveryFailed { room_id: RoomId, reason: String },

    #[error("Event {event_id} of room {room_id} is already taken by another event")]
    EventIdTaken { room_id: RoomId, event_id: EventId },

    #[error("Too many {action} requests, retry in {retry_after_ms}ms")]
    RateLimited {
        action: &'static str,
        retry_after_ms: u64,
    },

    #[error("Connection superseded for user: {user_id}")]
    ConnectionSuperseded { user_id: UserId },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Authentication failed: {reason}")]
    Unauthorized { reason: String },

    #[error("Message bus connection failed: {message}")]
    BusConnectionFailed { message: String },

    #[error("Storage operation failed: {message}")]
    StorageFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl ChatError {
    /// Stable wire code reported to clients in `ERROR` events
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::AlreadyQueued { .. } => "ALREADY_QUEUED",
            ChatError::NotInQueue { .. } => "NOT_IN_QUEUE",
            ChatError::MatchCreationFailed { .. } => "MATCH_CREATION_FAILED",
            ChatError::RoomNotFound { .. } => "ROOM_NOT_FOUND",
            ChatError::RoomClosed { .. } => "ROOM_CLOSED",
            ChatError::NotParticipant { .. } => "NOT_PARTICIPANT",
            ChatError::DeliveryFailed { .. } => "DELIVERY_FAILED",
            ChatError::RateLimited { .. } => "RATE_LIMITED",
            ChatError::InvalidRequest { .. } => "INVALID_REQUEST",
            ChatError::Unauthorized { .. } => "UNAUTHORIZED",
            _ => "INTERNAL",
        }
    }

    /// Shorthand for a poisoned or otherwise unavailable lock
    pub fn lock(name: &str) -> Self {
        ChatError::InternalError {
            message: format!("Failed to acquire {} lock", name),
        }
    }
}

/// Maps an arbitrary error to its wire code, falling back to `INTERNAL`
pub fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<ChatError>()
        .map(ChatError::code)
        .unwrap_or("INTERNAL")
}
