//! Real-time relay: message sequencing, typing, receipts and the WebSocket gateway

pub mod debounce;
pub mod delivery;
pub mod engine;
pub mod limiter;
pub mod receipts;
pub mod sequencer;
pub mod ws;

pub use debounce::TypingDebouncer;
pub use delivery::DeliveryLog;
pub use engine::{Relay, RelayComponents, RelayConfig, RelayStats, CLOSE_CODE_GOING_AWAY};
pub use limiter::{LimitedAction, RateLimit, RateLimiter};
pub use receipts::ReadState;
pub use sequencer::{EventSequencer, LocalSequencer, StoreSequencer};
pub use ws::{router, ChatServer, ChatServerConfig, GatewayState};
