//! User-directed delivery across instances
//!
//! Sends a server event to whichever instance holds the user's connection: the
//! local registry first, the bus otherwise.

use super::ConnectionRegistry;
use crate::bus::{BusEnvelope, BusPayload, MessageBus};
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::protocol::ServerEvent;
use crate::types::InstanceId;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a user-directed event ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on a handle of this instance
    Local,
    /// Handed to the bus for another instance
    Forwarded,
    /// Nobody could take it; the user is offline
    Dropped,
}

#[derive(Clone)]
pub struct UserNotifier {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<dyn MessageBus>,
    instance_id: InstanceId,
    metrics_collector: Arc<MetricsCollector>,
}

impl UserNotifier {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bus: Arc<dyn MessageBus>,
        instance_id: InstanceId,
        metrics_collector: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            registry,
            bus,
            instance_id,
            metrics_collector,
        }
    }

    pub async fn notify(&self, user_id: &str, event: ServerEvent) -> Result<Delivery> {
        if self.registry.send(user_id, event.clone())? {
            return Ok(Delivery::Local);
        }

        let name = event.name();
        let result = self
            .bus
            .publish(BusEnvelope::new(
                self.instance_id,
                BusPayload::UserEvent {
                    user_id: user_id.to_string(),
                    event,
                },
            ))
            .await;
        self.metrics_collector
            .record_bus_operation("publish", result.is_ok());

        match result {
            Ok(()) => {
                debug!("Forwarded {} for {} to the bus", name, user_id);
                Ok(Delivery::Forwarded)
            }
            Err(e) => {
                warn!("Could not forward {} for {}: {}", name, user_id, e);
                Ok(Delivery::Dropped)
            }
        }
    }
}
