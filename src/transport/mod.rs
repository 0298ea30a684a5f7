//! Broker transport: connections, channels, queues, publishing.
//!
//! A [`Session`] is one connection, one channel and the default exchange.
//! Dispatch loops each open their own session; nothing here is shared across
//! loops.
//!
//! Two implementations ship with the crate:
//! - [`amqp::AmqpBroker`] talks AMQP 0-9-1 to RabbitMQ via lapin.
//! - [`memory::MemoryBroker`] is an in-process broker for tests and local runs.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::Message;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Stream of deliveries from a consumed queue. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Something that can open broker sessions.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Session: Session;

    /// Connect, open a channel (optionally at `channel_id`) and bind the
    /// default exchange.
    ///
    /// # Errors
    /// `Error::Connection` if the broker is unreachable or refuses the
    /// address, `Error::Channel` if the channel cannot be opened.
    async fn open_session(&self, channel_id: Option<u16>) -> Result<Self::Session>;
}

/// An open connection + channel pair.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Declare a queue and return its name. Idempotent for compatible
    /// options; `Error::QueueConflict` otherwise. An empty name requests a
    /// server-named queue.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    /// Limit unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Start consuming a declared queue.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    /// Publish to the default exchange; `routing_key` is the queue name.
    async fn publish(&self, routing_key: &str, message: Message) -> Result<()>;

    /// Best-effort teardown of channel and connection.
    async fn close(&self);
}

/// Queue declaration parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Exclusive, auto-deleted queue owned by one connection (RPC replies).
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject { requeue: bool },
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disposition::Ack => f.write_str("ack"),
            Disposition::Reject { requeue: false } => f.write_str("reject"),
            Disposition::Reject { requeue: true } => f.write_str("requeue"),
        }
    }
}

/// Terminal decision on a delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer, plus the means to settle it.
///
/// `ack` and `reject` take `self`, so a delivery is settled at most once.
pub struct Delivery {
    pub message: Message,
    pub delivery_tag: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, delivery_tag: u64, acker: impl Acknowledger + 'static) -> Self {
        Self {
            message,
            delivery_tag,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }

    pub async fn settle(self, disposition: Disposition) -> Result<()> {
        match disposition {
            Disposition::Ack => self.ack().await,
            Disposition::Reject { requeue } => self.reject(requeue).await,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
