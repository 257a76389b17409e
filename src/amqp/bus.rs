//! Message bus on a RabbitMQ topic exchange
//!
//! Every instance publishes to [`RELAY_EXCHANGE`] with the envelope key as the
//! routing key and consumes through its own exclusive queue bound to all
//! traffic. A single consumer per queue keeps per-key ordering.

use super::connection::AmqpConnection;
use super::messages::{
    instance_queue_name, message_id, routing_key, ALL_TRAFFIC_BINDING, CONTENT_TYPE_JSON,
    RELAY_EXCHANGE,
};
use crate::bus::{BusEnvelope, BusHandler, MessageBus};
use crate::error::{ChatError, Result};
use crate::types::InstanceId;
use amqprs::{
    channel::{
        BasicAckArguments, BasicConsumeArguments, BasicPublishArguments, Channel,
        ExchangeDeclareArguments, QueueBindArguments, QueueDeclareArguments,
    },
    consumer::AsyncConsumer,
    BasicProperties, Deliver,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Publish tuning
#[derive(Debug, Clone)]
pub struct AmqpBusConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for AmqpBusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 200,
        }
    }
}

pub struct AmqpBus {
    connection: AmqpConnection,
    publish_channel: Channel,
    consume_channel: Mutex<Option<Channel>>,
    instance_id: InstanceId,
    config: AmqpBusConfig,
}

impl AmqpBus {
    /// Open the publish channel and declare the exchange
    pub async fn new(
        connection: AmqpConnection,
        instance_id: InstanceId,
        config: AmqpBusConfig,
    ) -> Result<Self> {
        let publish_channel = connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to open publish channel: {}", e),
            })?;

        let args = ExchangeDeclareArguments::new(RELAY_EXCHANGE, "topic")
            .durable(true)
            .finish();
        publish_channel
            .exchange_declare(args)
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to declare exchange {}: {}", RELAY_EXCHANGE, e),
            })?;

        info!("Declared relay exchange '{}'", RELAY_EXCHANGE);
        Ok(Self {
            connection,
            publish_channel,
            consume_channel: Mutex::new(None),
            instance_id,
            config,
        })
    }

    async fn try_publish(&self, envelope: &BusEnvelope, payload: Vec<u8>) -> Result<()> {
        let args = BasicPublishArguments::new(RELAY_EXCHANGE, routing_key(envelope));
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&message_id(envelope))
            .with_timestamp(envelope.published_at.timestamp() as u64)
            .with_content_type(CONTENT_TYPE_JSON);

        self.publish_channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to publish: {}", e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, envelope: BusEnvelope) -> Result<()> {
        let payload = envelope.to_bytes()?;
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(&envelope, payload.clone()).await {
                Ok(()) => {
                    debug!("Published {} on {}", envelope.payload.name(), envelope.key);
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish {} after {} retries: {}",
                            envelope.key, self.config.max_retries, e
                        );
                        return Err(e);
                    }
                    warn!(
                        "Publish attempt {} for {} failed: {}. Retrying in {:?}",
                        retry_count, envelope.key, e, delay
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
    }

    async fn subscribe(&self, handler: Arc<dyn BusHandler>) -> Result<()> {
        let channel = self
            .connection
            .connection()
            .open_channel(None)
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to open consumer channel: {}", e),
            })?;

        let queue = instance_queue_name(self.instance_id);
        let args = QueueDeclareArguments::new(&queue)
            .exclusive(true)
            .auto_delete(true)
            .finish();
        channel
            .queue_declare(args)
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to declare queue {}: {}", queue, e),
            })?;

        channel
            .queue_bind(QueueBindArguments::new(
                &queue,
                RELAY_EXCHANGE,
                ALL_TRAFFIC_BINDING,
            ))
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to bind queue {}: {}", queue, e),
            })?;

        let consumer_tag = format!("relay-consumer-{}", self.instance_id);
        channel
            .basic_consume(
                EnvelopeConsumer { handler },
                BasicConsumeArguments::new(&queue, &consumer_tag),
            )
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to start consuming: {}", e),
            })?;

        *self
            .consume_channel
            .lock()
            .map_err(|_| ChatError::lock("consumer channel"))? = Some(channel);
        info!("Consuming relay traffic from queue '{}'", queue);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "amqp"
    }

    fn is_healthy(&self) -> bool {
        self.connection.is_open() && self.publish_channel.is_open()
    }

    async fn close(&self) -> Result<()> {
        let channel = self
            .consume_channel
            .lock()
            .map_err(|_| ChatError::lock("consumer channel"))?
            .take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                warn!("Failed to close consumer channel: {}", e);
            }
        }
        self.connection
            .connection()
            .clone()
            .close()
            .await
            .map_err(|e| ChatError::BusConnectionFailed {
                message: format!("Failed to close connection: {}", e),
            })?;
        info!("AMQP bus closed");
        Ok(())
    }
}

/// Decodes deliveries and hands them to the relay in arrival order
struct EnvelopeConsumer {
    handler: Arc<dyn BusHandler>,
}

#[async_trait]
impl AsyncConsumer for EnvelopeConsumer {
    async fn consume(
        &mut self,
        channel: &Channel,
        deliver: Deliver,
        _basic_properties: BasicProperties,
        content: Vec<u8>,
    ) {
        let delivery_tag = deliver.delivery_tag();

        match BusEnvelope::from_bytes(&content) {
            Ok(envelope) => {
                let name = envelope.payload.name();
                if let Err(e) = self.handler.handle(envelope).await {
                    error!(
                        "Handling {} (delivery_tag {}) failed: {}",
                        name, delivery_tag, e
                    );
                }
            }
            Err(e) => {
                let preview_len = content.len().min(100);
                error!(
                    "Discarding undecodable bus message {}: {} ({:?})",
                    delivery_tag,
                    e,
                    String::from_utf8_lossy(&content[..preview_len])
                );
            }
        }

        if let Err(e) = channel
            .basic_ack(BasicAckArguments::new(delivery_tag, false))
            .await
        {
            warn!("Failed to ack delivery {}: {}", delivery_tag, e);
        }
    }
}
