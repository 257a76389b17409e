//! Client wire protocol
//!
//! Every frame is a JSON object tagged by `type`. Field names are camelCase.

use crate::error::{error_code, ChatError};
use crate::types::{
    ChatEvent, CloseReason, EventId, ProfileCard, RoomId, SearchPreferences, SearchStatus, UserId,
};
use serde::{Deserialize, Serialize};

/// WebSocket close code sent to a handle replaced by a newer connection
pub const CLOSE_CODE_SUPERSEDED: u16 = 4000;

/// WebSocket close code sent when the heartbeat times out
pub const CLOSE_CODE_HEARTBEAT: u16 = 4001;

/// Actions a client may send after the connection is established
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientAction {
    StartSearch {
        preferences: SearchPreferences,
    },
    CancelSearch,
    #[serde(rename_all = "camelCase")]
    SendMessage {
        room_id: RoomId,
        content: String,
        client_token: String,
    },
    #[serde(rename_all = "camelCase")]
    Typing { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    MarkRead {
        room_id: RoomId,
        up_to_event_id: EventId,
    },
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: RoomId,
        #[serde(default)]
        since_event_id: Option<EventId>,
    },
    #[serde(rename_all = "camelCase")]
    Skip { room_id: RoomId },
    #[serde(rename_all = "camelCase")]
    Block { room_id: RoomId },
}

/// Events the server pushes to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    MatchFound {
        room_id: RoomId,
        other_user: ProfileCard,
    },
    #[serde(rename_all = "camelCase")]
    Message { room_id: RoomId, event: ChatEvent },
    #[serde(rename_all = "camelCase")]
    Typing { room_id: RoomId, user_id: UserId },
    #[serde(rename_all = "camelCase")]
    ReadReceipt {
        room_id: RoomId,
        user_id: UserId,
        up_to_event_id: EventId,
    },
    #[serde(rename_all = "camelCase")]
    Presence { user_id: UserId, online: bool },
    SearchStatus { status: SearchStatus },
    SearchExpired,
    #[serde(rename_all = "camelCase")]
    MessageAck {
        room_id: RoomId,
        client_token: String,
        event_id: EventId,
    },
    #[serde(rename_all = "camelCase")]
    DeliveryFailed {
        room_id: RoomId,
        client_token: String,
    },
    #[serde(rename_all = "camelCase")]
    History {
        room_id: RoomId,
        events: Vec<ChatEvent>,
    },
    #[serde(rename_all = "camelCase")]
    RoomClosed { room_id: RoomId, reason: CloseReason },
    Error { code: String, message: String },
}

impl ServerEvent {
    /// Short name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MatchFound { .. } => "match_found",
            ServerEvent::Message { .. } => "message",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::ReadReceipt { .. } => "read_receipt",
            ServerEvent::Presence { .. } => "presence",
            ServerEvent::SearchStatus { .. } => "search_status",
            ServerEvent::SearchExpired => "search_expired",
            ServerEvent::MessageAck { .. } => "message_ack",
            ServerEvent::DeliveryFailed { .. } => "delivery_failed",
            ServerEvent::History { .. } => "history",
            ServerEvent::RoomClosed { .. } => "room_closed",
            ServerEvent::Error { .. } => "error",
        }
    }

    /// Convert an error returned by a core operation into an `ERROR` frame
    pub fn from_error(err: &anyhow::Error) -> Self {
        ServerEvent::Error {
            code: error_code(err).to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&ChatError> for ServerEvent {
    fn from(err: &ChatError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Decode a client text frame
pub fn parse_action(text: &str) -> crate::error::Result<ClientAction> {
    serde_json::from_str(text).map_err(|e| {
        ChatError::InvalidRequest {
            reason: format!("malformed action: {}", e),
        }
        .into()
    })
}
