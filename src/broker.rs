//! AMQP broker connector for the worker pipeline.
//!
//! Owns the broker connection and channel, declares the durable queue and
//! exposes the subscription as a stream of [`RawMessage`]s. Consumption is
//! auto-ack: the broker marks a message delivered before processing
//! completes, so a crash between dequeue and persist loses that message.
//! At-least-once with possible loss is the accepted delivery contract.

use crate::config::{BrokerConfig, StartupFailurePolicy};
use futures::{Stream, StreamExt};
use lapin::message::Delivery;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::protocol::constants::REPLY_SUCCESS;
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer, Queue};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connection(String),

    #[error("Failed to declare queue: {0}")]
    Declaration(String),

    #[error("Failed to subscribe to queue: {0}")]
    Subscription(String),

    #[error("Consumer stream error: {0}")]
    Consume(String),
}

/// A raw message as delivered by the broker
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Whether the broker redelivered this message
    pub redelivered: bool,
    /// Whether an explicit acknowledgment is still owed for this message
    pub requires_ack: bool,
}

/// Connector owning the broker connection and its channel
pub struct BrokerConnector {
    connection: Connection,
    channel: Channel,
}

impl BrokerConnector {
    /// Connect to the broker, applying the configured startup policy.
    ///
    /// With the default `retry` policy this loops with a fixed delay until
    /// the broker accepts the connection; with `fail_fast` the first failure
    /// is returned to the caller.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        info!(url = %config.url, "Connecting to broker");

        let retry_interval = config.startup.retry_interval();

        let connection = loop {
            match Connection::connect(&config.url, ConnectionProperties::default()).await {
                Ok(connection) => break connection,
                Err(e) if config.startup.on_failure == StartupFailurePolicy::Retry => {
                    warn!(
                        error = %e,
                        retry_in_secs = retry_interval.as_secs(),
                        "Broker unavailable, retrying"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
                Err(e) => return Err(BrokerError::Connection(e.to_string())),
            }
        };

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!("Broker connection established");

        Ok(Self {
            connection,
            channel,
        })
    }

    /// Declare the durable queue. Idempotent, safe to call every startup.
    pub async fn declare_queue(&self, name: &str) -> Result<Queue, BrokerError> {
        let queue = self
            .channel
            .queue_declare(name, declare_options(), FieldTable::default())
            .await
            .map_err(|e| BrokerError::Declaration(e.to_string()))?;

        info!(
            queue = name,
            messages = queue.message_count(),
            "Queue declared"
        );

        Ok(queue)
    }

    /// Open an auto-ack subscription on the queue.
    pub async fn subscribe(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Subscription, BrokerError> {
        let options = consume_options();
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Subscription(e.to_string()))?;

        info!(queue = queue, consumer_tag = consumer_tag, "Subscribed to queue");

        Ok(Subscription {
            consumer,
            no_ack: options.no_ack,
        })
    }

    /// Close the broker connection gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "shutting down").await {
            warn!(error = %e, "Failed to close broker connection cleanly");
        }
    }
}

/// An open subscription yielding an unbounded stream of messages
pub struct Subscription {
    consumer: Consumer,
    no_ack: bool,
}

impl Subscription {
    /// Turn the subscription into a message stream.
    ///
    /// The stream is infinite and suspends while the queue is empty. Broker
    /// errors surface as stream items so the caller can log and continue.
    pub fn into_stream(self) -> impl Stream<Item = Result<RawMessage, BrokerError>> {
        let no_ack = self.no_ack;
        self.consumer.map(move |delivery| {
            delivery
                .map(|d| RawMessage::from_delivery(d, no_ack))
                .map_err(|e| BrokerError::Consume(e.to_string()))
        })
    }
}

impl RawMessage {
    fn from_delivery(delivery: Delivery, no_ack: bool) -> Self {
        Self {
            payload: delivery.data,
            redelivered: delivery.redelivered,
            requires_ack: !no_ack,
        }
    }
}

fn declare_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn consume_options() -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_ack: true,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Re-declaring with these options is a no-op on the broker side, which
    // is what makes declare_queue safe to call on every startup.
    #[test]
    fn test_declare_options_are_idempotent_durable() {
        let options = declare_options();
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
        assert!(!options.passive);
    }

    #[test]
    fn test_consume_options_are_auto_ack() {
        let options = consume_options();
        assert!(options.no_ack);
        assert!(!options.exclusive);
    }
}
