//! Message bus used to fan relay traffic out across instances
//!
//! The bus is pluggable: [`LocalBus`] for single-instance deployments,
//! [`InMemoryBus`] for several instances inside one process, and the AMQP
//! adapter in [`crate::amqp`] for clustered deployments. Every envelope carries
//! the id of the instance that produced it so receivers can skip their own
//! traffic.

pub mod memory;

use crate::error::Result;
use crate::protocol::ServerEvent;
use crate::types::{
    ChatEvent, CloseReason, EventId, InstanceId, Room, RoomId, SearchPreferences, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use memory::{InMemoryBus, InMemoryBusHub, LocalBus};

/// What travels on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusPayload {
    ChatEvent {
        event: ChatEvent,
    },
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
    #[serde(rename_all = "camelCase")]
    UserEvent { user_id: UserId, event: ServerEvent },
    RoomOpened {
        room: Room,
    },
    #[serde(rename_all = "camelCase")]
    RoomClosed {
        room_id: RoomId,
        reason: CloseReason,
        #[serde(default)]
        initiator: Option<UserId>,
    },
    /// START_SEARCH forwarded to the matchmaking coordinator
    #[serde(rename_all = "camelCase")]
    SearchRequest {
        user_id: UserId,
        preferences: SearchPreferences,
    },
    /// CANCEL_SEARCH forwarded to the matchmaking coordinator
    #[serde(rename_all = "camelCase")]
    SearchCancel { user_id: UserId },
}

impl BusPayload {
    /// Ordering key; all traffic of one room shares a key
    pub fn key(&self) -> String {
        match self {
            BusPayload::ChatEvent { event } => format!("room.{}", event.room_id),
            BusPayload::Typing { room_id, .. }
            | BusPayload::ReadReceipt { room_id, .. }
            | BusPayload::RoomClosed { room_id, .. } => format!("room.{}", room_id),
            BusPayload::RoomOpened { room } => format!("room.{}", room.room_id),
            BusPayload::Presence { user_id, .. } => format!("presence.{}", user_id),
            BusPayload::UserEvent { user_id, .. } => format!("user.{}", user_id),
            BusPayload::SearchRequest { user_id, .. } | BusPayload::SearchCancel { user_id } => {
                format!("search.{}", user_id)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BusPayload::ChatEvent { .. } => "chat_event",
            BusPayload::Typing { .. } => "typing",
            BusPayload::ReadReceipt { .. } => "read_receipt",
            BusPayload::Presence { .. } => "presence",
            BusPayload::UserEvent { .. } => "user_event",
            BusPayload::RoomOpened { .. } => "room_opened",
            BusPayload::RoomClosed { .. } => "room_closed",
            BusPayload::SearchRequest { .. } => "search_request",
            BusPayload::SearchCancel { .. } => "search_cancel",
        }
    }
}

/// A payload tagged with its origin instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEnvelope {
    pub origin: InstanceId,
    pub key: String,
    pub payload: BusPayload,
    pub published_at: DateTime<Utc>,
}

impl BusEnvelope {
    pub fn new(origin: InstanceId, payload: BusPayload) -> Self {
        Self {
            origin,
            key: payload.key(),
            payload,
            published_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Receiver side of the bus
#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, envelope: BusEnvelope) -> Result<()>;
}

/// Ordered publish/subscribe transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an envelope; ordering is preserved per key
    async fn publish(&self, envelope: BusEnvelope) -> Result<()>;

    /// Deliver every envelope published from now on to `handler`
    async fn subscribe(&self, handler: Arc<dyn BusHandler>) -> Result<()>;

    /// Short name for logs and health reports
    fn name(&self) -> &'static str;

    /// Whether the transport is currently usable
    fn is_healthy(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
