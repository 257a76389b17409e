//! Matchmaking over the waiting pool

pub mod engine;
pub mod policy;

pub use engine::{CancelOutcome, MatchOutcome, Matcher};
pub use policy::{passes_hard_filters, HardFilterPolicy, PairingPolicy};
