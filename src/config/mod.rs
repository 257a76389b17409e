//! Configuration management for the chattr-relay service
//!
//! Configuration comes from a TOML file or environment variables, with
//! command line overrides applied in `main`, and is validated before use.

pub mod app;

pub use app::{
    validate_config, AppConfig, AuthSettings, BusKind, BusSettings, ChatSettings,
    MatchmakingSettings, RelaySettings, ServiceSettings,
};
