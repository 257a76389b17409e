//! Chattr Relay - preference-based matchmaking and real-time chat
//!
//! Users searching for a conversation wait in a pool until a compatible partner
//! appears; each pair gets a private room whose messages, typing indicators and
//! read receipts are relayed over WebSockets. Several instances can share load
//! through a message bus.

pub mod amqp;
pub mod auth;
pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod matcher;
pub mod metrics;
pub mod moderation;
pub mod pool;
pub mod profile;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod service;
pub mod storage;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{ChatError, Result};
pub use types::*;

// Re-export key components
pub use bus::{BusEnvelope, BusHandler, BusPayload, MessageBus};
pub use matcher::{CancelOutcome, MatchOutcome, Matcher};
pub use pool::WaitingPool;
pub use protocol::{ClientAction, ServerEvent};
pub use relay::Relay;
pub use room::RoomManager;
pub use storage::{ChatStore, InMemoryChatStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
