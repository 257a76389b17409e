//! Common types used throughout the chat relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque user identity supplied by the session collaborator
pub type UserId = String;

/// Unique identifier for rooms
pub type RoomId = Uuid;

/// Per-room event sequence number, starting at 1
pub type EventId = u64;

/// Identifier of a running relay process
pub type InstanceId = Uuid;

/// Identifier of a single live connection handle
pub type ConnectionId = Uuid;

/// Youngest age accepted by the matchmaking filters
pub const MIN_AGE: u8 = 18;

/// Default upper age bound when a client omits one
pub const DEFAULT_MAX_AGE: u8 = 99;

/// What a user is searching for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatMode {
    Friends,
    Dating,
    Random,
    Networking,
}

impl std::fmt::Display for ChatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatMode::Friends => write!(f, "FRIENDS"),
            ChatMode::Dating => write!(f, "DATING"),
            ChatMode::Random => write!(f, "RANDOM"),
            ChatMode::Networking => write!(f, "NETWORKING"),
        }
    }
}

/// Gender a user declares when searching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    Male,
    Female,
    NonBinary,
    #[default]
    Undisclosed,
}

/// Which declared genders a user is willing to be matched with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenderFilter {
    #[default]
    Any,
    Male,
    Female,
    NonBinary,
}

impl GenderFilter {
    /// Whether this filter accepts a partner who declared `gender`
    pub fn accepts(&self, gender: Gender) -> bool {
        match self {
            GenderFilter::Any => true,
            GenderFilter::Male => gender == Gender::Male,
            GenderFilter::Female => gender == Gender::Female,
            GenderFilter::NonBinary => gender == Gender::NonBinary,
        }
    }
}

/// Inclusive age bounds of an acceptable partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeRange {
    pub min: u8,
    pub max: u8,
}

impl AgeRange {
    pub fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    pub fn overlaps(&self, other: &AgeRange) -> bool {
        self.min <= other.max && self.max >= other.min
    }
}

impl Default for AgeRange {
    fn default() -> Self {
        Self {
            min: MIN_AGE,
            max: DEFAULT_MAX_AGE,
        }
    }
}

/// Client-supplied part of a matchmaking request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPreferences {
    pub mode: ChatMode,
    #[serde(default)]
    pub gender: Gender,
    #[serde(default)]
    pub gender_filter: GenderFilter,
    #[serde(default)]
    pub min_age: Option<u8>,
    #[serde(default)]
    pub max_age: Option<u8>,
}

impl SearchPreferences {
    pub fn new(mode: ChatMode) -> Self {
        Self {
            mode,
            gender: Gender::Undisclosed,
            gender_filter: GenderFilter::Any,
            min_age: None,
            max_age: None,
        }
    }

    pub fn with_gender(mut self, gender: Gender, filter: GenderFilter) -> Self {
        self.gender = gender;
        self.gender_filter = filter;
        self
    }

    pub fn with_ages(mut self, min_age: u8, max_age: u8) -> Self {
        self.min_age = Some(min_age);
        self.max_age = Some(max_age);
        self
    }

    /// Resolve missing bounds and reject impossible ranges
    pub fn age_range(&self) -> crate::error::Result<AgeRange> {
        let range = AgeRange::new(
            self.min_age.unwrap_or(MIN_AGE),
            self.max_age.unwrap_or(DEFAULT_MAX_AGE),
        );
        if range.min < MIN_AGE || range.min > range.max {
            return Err(crate::error::ChatError::InvalidRequest {
                reason: format!("invalid age range {}-{}", range.min, range.max),
            }
            .into());
        }
        Ok(range)
    }
}

/// A user's current matchmaking intent, owned by the waiting pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceRecord {
    pub user_id: UserId,
    pub mode: ChatMode,
    pub gender: Gender,
    pub gender_filter: GenderFilter,
    pub ages: AgeRange,
    pub enqueued_at: DateTime<Utc>,
}

impl PreferenceRecord {
    /// Build a validated record stamped with the current time
    pub fn from_preferences(
        user_id: impl Into<UserId>,
        preferences: &SearchPreferences,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            user_id: user_id.into(),
            mode: preferences.mode,
            gender: preferences.gender,
            gender_filter: preferences.gender_filter,
            ages: preferences.age_range()?,
            enqueued_at: Utc::now(),
        })
    }
}

/// Lifecycle state of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Active,
    Closed,
}

/// Why a room was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Skip,
    Block,
    BothDisconnected,
    Admin,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Skip => "skip",
            CloseReason::Block => "block",
            CloseReason::BothDisconnected => "both_disconnected",
            CloseReason::Admin => "admin",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The conversational context shared by two matched users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: RoomId,
    pub participant_a: UserId,
    pub participant_b: UserId,
    pub mode: ChatMode,
    pub state: RoomState,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
}

impl Room {
    pub fn new(participant_a: UserId, participant_b: UserId, mode: ChatMode) -> Self {
        Self {
            room_id: crate::utils::generate_room_id(),
            participant_a,
            participant_b,
            mode,
            state: RoomState::Active,
            created_at: Utc::now(),
            closed_at: None,
            close_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == RoomState::Active
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// The participant that is not `user_id`, if `user_id` is in the room
    pub fn other_participant(&self, user_id: &str) -> Option<&UserId> {
        if self.participant_a == user_id {
            Some(&self.participant_b)
        } else if self.participant_b == user_id {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn participants(&self) -> [&UserId; 2] {
        [&self.participant_a, &self.participant_b]
    }
}

/// Kind of a chat event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Message,
    Typing,
    Read,
}

/// Durable, ordered unit of conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub kind: EventKind,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
    pub fn message(
        event_id: EventId,
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        client_token: String,
    ) -> Self {
        Self {
            event_id,
            room_id,
            sender_id,
            kind: EventKind::Message,
            payload: content,
            client_token: Some(client_token),
            timestamp: Utc::now(),
        }
    }
}

/// Where a user currently is in the matchmaking flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchStatus {
    Idle,
    #[serde(rename_all = "camelCase")]
    Searching { since: DateTime<Utc> },
    #[serde(rename_all = "camelCase")]
    Matched { room_id: RoomId },
}

/// Display attributes attached to match results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCard {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfileCard {
    pub fn anonymous(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: "Stranger".to_string(),
            avatar_url: None,
        }
    }
}
