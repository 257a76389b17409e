//! Local and in-process bus implementations

use super::{BusEnvelope, BusHandler, MessageBus};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

/// No-op bus for single-instance deployments
#[derive(Debug, Default, Clone)]
pub struct LocalBus;

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, _envelope: BusEnvelope) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _handler: Arc<dyn BusHandler>) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Shared in-process topic connecting several [`InMemoryBus`] endpoints
#[derive(Debug, Clone)]
pub struct InMemoryBusHub {
    sender: broadcast::Sender<BusEnvelope>,
}

impl InMemoryBusHub {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// A new endpoint attached to this hub
    pub fn connect(&self) -> InMemoryBus {
        InMemoryBus {
            sender: self.sender.clone(),
        }
    }
}

impl Default for InMemoryBusHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Bus endpoint backed by a tokio broadcast channel
///
/// The channel is totally ordered, so per-key order is preserved for free.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    sender: broadcast::Sender<BusEnvelope>,
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, envelope: BusEnvelope) -> Result<()> {
        // No subscribers is not an error: nobody else is listening yet.
        if self.sender.send(envelope).is_err() {
            debug!("In-memory bus has no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn BusHandler>) -> Result<()> {
        let mut stream = BroadcastStream::new(self.sender.subscribe());

        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(envelope) => {
                        if let Err(e) = handler.handle(envelope).await {
                            warn!("Bus handler failed: {}", e);
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!("In-memory bus subscriber lagged, {} envelopes skipped", skipped);
                    }
                }
            }
        });

        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
