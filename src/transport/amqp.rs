//! AMQP 0-9-1 transport via lapin.
//!
//! Every session opens its own connection. Publisher confirms are enabled on
//! the channel so a reply that the broker refuses surfaces as an error
//! instead of vanishing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use uuid::Uuid;

use super::{Acknowledger, Broker, Delivery, DeliveryStream, QueueOptions, Session};
use crate::config::validate_secret_url;
use crate::error::{Error, Result};
use crate::model::Message;

/// Connection factory for a RabbitMQ broker.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: SecretString,
    connection_name: String,
}

impl AmqpBroker {
    /// Validates the URL up front; an empty or non-AMQP address is a
    /// configuration error, not a connection error.
    pub fn new(url: SecretString) -> Result<Self> {
        validate_secret_url(&url)?;
        Ok(Self {
            url,
            connection_name: "base-service".to_string(),
        })
    }

    /// Name shown for this client's connections in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Session = AmqpSession;

    async fn open_session(&self, channel_id: Option<u16>) -> Result<AmqpSession> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect(self.url.expose_secret(), properties)
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;

        if let Some(requested) = channel_id {
            let granted = channel.id();
            if granted != requested {
                let _ = channel.close(200, "channel id unavailable").await;
                let _ = connection.close(200, "channel id unavailable").await;
                return Err(Error::Channel(format!(
                    "channel {requested} is unavailable (broker granted {granted})"
                )));
            }
        }

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;

        debug!(channel_id = channel.id(), "amqp session opened");
        Ok(AmqpSession {
            connection,
            channel,
        })
    }
}

/// One lapin connection and channel. Publishing goes through the default
/// (nameless) exchange.
pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

impl AmqpSession {
    pub fn channel_id(&self) -> u16 {
        self.channel.id()
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let declare = QueueDeclareOptions {
            passive: false,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            nowait: false,
        };
        let queue = self
            .channel
            .queue_declare(name, declare, FieldTable::default())
            .await
            .map_err(|e| declare_error(name, e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Channel(e.to_string()))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let tag = format!("base-service-{}", Uuid::new_v4());
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Channel(e.to_string()))?;

        let stream = consumer.map(|item| {
            item.map(into_delivery)
                .map_err(|e| Error::Channel(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn publish(&self, routing_key: &str, message: Message) -> Result<()> {
        let publish_error = |reason: String| Error::Publish {
            routing_key: routing_key.to_string(),
            reason,
        };

        let timestamp = message.timestamp.unwrap_or_else(Utc::now).timestamp();
        let mut properties = BasicProperties::default().with_timestamp(timestamp.max(0) as u64);
        if let Some(id) = message.correlation_id {
            properties = properties.with_correlation_id(id.into());
        }
        if let Some(reply_to) = message.reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }

        let confirm = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| publish_error(e.to_string()))?
            .await
            .map_err(|e| publish_error(e.to_string()))?;

        if confirm.is_nack() {
            return Err(publish_error("broker nacked the message".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(200, "closing").await {
            debug!("channel close: {e}");
        }
        if let Err(e) = self.connection.close(200, "closing").await {
            debug!("connection close: {e}");
        }
    }
}

fn declare_error(queue: &str, err: lapin::Error) -> Error {
    if let lapin::Error::ProtocolError(ref amqp) = err {
        if matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ) {
            return Error::QueueConflict {
                queue: queue.to_string(),
                reason: amqp.to_string(),
            };
        }
    }
    Error::Channel(err.to_string())
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let timestamp = properties
        .timestamp()
        .as_ref()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(*secs as i64, 0));
    let message = Message {
        body: delivery.data,
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
        timestamp,
    };
    Delivery::new(message, delivery.delivery_tag, AmqpAcker(delivery.acker))
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| Error::Ack(e.to_string()))
    }
}
