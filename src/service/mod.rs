//! Service layer for the chattr relay
//!
//! Application state, component wiring, health checks and background task
//! management for the running service.

pub mod app;
pub mod health;

pub use app::{build_authenticator, build_relay, AppState, ServiceError, ServiceHandle};
pub use health::{ComponentCheck, HealthCheck, HealthStatus, ServiceStats};
