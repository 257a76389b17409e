//! Live connection handles, the registry that routes to them, and presence

pub mod notifier;
pub mod presence;
pub mod registry;

pub use notifier::{Delivery, UserNotifier};
pub use presence::{PresenceChange, PresenceTracker};
pub use registry::{ConnectionHandle, ConnectionRegistry, Outbound};
