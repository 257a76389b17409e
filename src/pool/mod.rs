//! Waiting pool for users seeking a partner

pub mod waiting;

pub use waiting::{ClaimedPair, RemoveOutcome, WaitingPool};
