//! Exchange, queue and property conventions for relay traffic on AMQP

use crate::bus::BusEnvelope;
use crate::types::InstanceId;

/// Topic exchange every instance publishes relay traffic to
pub const RELAY_EXCHANGE: &str = "chattr.relay";

/// Binding key that receives all relay traffic
pub const ALL_TRAFFIC_BINDING: &str = "#";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Per-instance queue name; the queue is exclusive and auto-deleted
pub fn instance_queue_name(instance_id: InstanceId) -> String {
    format!("{}.{}", RELAY_EXCHANGE, instance_id)
}

/// Routing key of an envelope on the topic exchange
///
/// Envelope keys use `kind.id`, which maps directly onto topic segments.
pub fn routing_key(envelope: &BusEnvelope) -> &str {
    &envelope.key
}

/// Message id carried in the AMQP properties
pub fn message_id(envelope: &BusEnvelope) -> String {
    format!("{}:{}", envelope.origin, uuid::Uuid::new_v4())
}
