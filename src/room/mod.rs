//! Room lifecycle management

pub mod manager;

pub use manager::{CloseOutcome, RoomManager, RoomManagerConfig, RoomManagerStats};
