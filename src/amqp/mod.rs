//! AMQP transport for the relay message bus
//!
//! Used when the service runs as a cluster; single-process deployments use the
//! in-memory buses from [`crate::bus`].

pub mod bus;
pub mod connection;
pub mod messages;

pub use bus::{AmqpBus, AmqpBusConfig};
pub use connection::{AmqpConfig, AmqpConnection};
pub use messages::{instance_queue_name, RELAY_EXCHANGE};
