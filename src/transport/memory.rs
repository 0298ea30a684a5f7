//! In-process broker for tests and single-process runs.
//!
//! Mirrors the parts of AMQP the dispatch loop relies on: named queues on a
//! default exchange, server-named private queues, competing consumers,
//! ack/reject with optional requeue, and channel-id bookkeeping. Unroutable
//! publishes are dropped, as a real broker would.
//!
//! Every publish and every settlement is recorded so tests can assert on
//! exactly what went over the wire. Faults can be injected per broker:
//! refusing connections, or failing publishes to a given routing key.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Notify, mpsc};
use tracing::debug;

use super::{Acknowledger, Broker, Delivery, DeliveryStream, Disposition, QueueOptions, Session};
use crate::error::{Error, Result};
use crate::model::Message;

/// Shared handle to an in-memory broker. Clones see the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    channels_in_use: HashSet<u16>,
    next_private: u64,
    next_tag: u64,
    refuse_connections: bool,
    failing_routes: HashSet<String>,
    published: Vec<(String, Message)>,
    settlements: Vec<Settlement>,
}

struct MemoryQueue {
    options: QueueOptions,
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl MemoryQueue {
    fn new(options: QueueOptions) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            options,
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
        }
    }
}

/// A recorded ack or reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub queue: String,
    pub delivery_tag: u64,
    pub disposition: Disposition,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent `open_session` calls fail with a connection error.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state().refuse_connections = refuse;
    }

    /// Make publishes to `routing_key` fail until restored.
    pub fn fail_publishes_to(&self, routing_key: &str) {
        self.state().failing_routes.insert(routing_key.to_string());
    }

    pub fn restore_publishes_to(&self, routing_key: &str) {
        self.state().failing_routes.remove(routing_key);
    }

    /// Declare a queue without opening a session.
    pub fn declare(&self, name: &str, options: QueueOptions) -> Result<String> {
        let name = self.declare_locked(&mut self.state(), name, options)?;
        Ok(name)
    }

    /// Put a message straight onto a queue, bypassing sessions and faults.
    pub fn deliver(&self, queue: &str, message: Message) -> Result<()> {
        let state = self.state();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| Error::Other(format!("no such queue: {queue}")))?;
        q.sender
            .send(message)
            .map_err(|_| Error::Other(format!("queue {queue} is closed")))
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains_key(name)
    }

    /// Everything published through sessions, in order, with its routing key.
    pub fn published(&self) -> Vec<(String, Message)> {
        self.state().published.clone()
    }

    pub fn published_to(&self, routing_key: &str) -> Vec<Message> {
        self.state()
            .published
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Acks and rejects recorded for one queue, in settlement order.
    pub fn settlements(&self, queue: &str) -> Vec<Settlement> {
        self.state()
            .settlements
            .iter()
            .filter(|s| s.queue == queue)
            .cloned()
            .collect()
    }

    /// Wait until `queue` has at least `count` settlements.
    pub async fn settled(&self, queue: &str, count: usize) -> Vec<Settlement> {
        self.wait_for(|| {
            let found = self.settlements(queue);
            (found.len() >= count).then_some(found)
        })
        .await
    }

    /// Wait until at least `count` messages were published to `routing_key`.
    pub async fn published_at_least(&self, routing_key: &str, count: usize) -> Vec<Message> {
        self.wait_for(|| {
            let found = self.published_to(routing_key);
            (found.len() >= count).then_some(found)
        })
        .await
    }

    async fn wait_for<T>(&self, check: impl Fn() -> Option<T>) -> T {
        loop {
            let notified = self.changed.notified();
            if let Some(found) = check() {
                return found;
            }
            notified.await;
        }
    }

    fn declare_locked(
        &self,
        state: &mut BrokerState,
        name: &str,
        options: QueueOptions,
    ) -> Result<String> {
        let name = if name.is_empty() {
            state.next_private += 1;
            format!("amq.gen-{}", state.next_private)
        } else {
            name.to_string()
        };

        match state.queues.get(&name) {
            Some(existing) if existing.options == options => Ok(name),
            Some(existing) => Err(Error::QueueConflict {
                queue: name,
                reason: format!(
                    "declared as {:?}, requested {:?}",
                    existing.options, options
                ),
            }),
            None => {
                state.queues.insert(name.clone(), MemoryQueue::new(options));
                Ok(name)
            }
        }
    }

    fn settle(&self, queue: &str, delivery_tag: u64, disposition: Disposition, message: Message) {
        {
            let mut state = self.state();
            if disposition == (Disposition::Reject { requeue: true }) {
                if let Some(q) = state.queues.get(queue) {
                    let _ = q.sender.send(message);
                }
            }
            state.settlements.push(Settlement {
                queue: queue.to_string(),
                delivery_tag,
                disposition,
            });
        }
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Session = MemorySession;

    async fn open_session(&self, channel_id: Option<u16>) -> Result<MemorySession> {
        let mut state = self.state();
        if state.refuse_connections {
            return Err(Error::Connection("connection refused".to_string()));
        }

        let id = match channel_id {
            Some(0) => {
                return Err(Error::Channel("channel 0 is reserved".to_string()));
            }
            Some(id) if state.channels_in_use.contains(&id) => {
                return Err(Error::Channel(format!("channel {id} is already in use")));
            }
            Some(id) => id,
            None => (1..=u16::MAX)
                .find(|id| !state.channels_in_use.contains(id))
                .ok_or_else(|| Error::Channel("no free channel ids".to_string()))?,
        };
        state.channels_in_use.insert(id);

        Ok(MemorySession {
            broker: self.clone(),
            channel_id: id,
            released: AtomicBool::new(false),
        })
    }
}

/// A session on a [`MemoryBroker`]. Releases its channel id on close or
/// drop, whichever comes first.
pub struct MemorySession {
    broker: MemoryBroker,
    channel_id: u16,
    released: AtomicBool,
}

impl MemorySession {
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.broker.state().channels_in_use.remove(&self.channel_id);
        }
    }
}

impl std::fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySession")
            .field("channel_id", &self.channel_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        self.broker
            .declare_locked(&mut self.broker.state(), name, options)
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        // Deliveries are pulled one at a time; nothing to configure.
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let receiver = self
            .broker
            .state()
            .queues
            .get(queue)
            .map(|q| Arc::clone(&q.receiver))
            .ok_or_else(|| Error::Channel(format!("no queue '{queue}' to consume")))?;

        let broker = self.broker.clone();
        let queue = queue.to_string();
        let stream = futures::stream::unfold(
            (receiver, broker, queue),
            |(receiver, broker, queue)| async move {
                let message = receiver.lock().await.recv().await?;
                let delivery_tag = {
                    let mut state = broker.state();
                    state.next_tag += 1;
                    state.next_tag
                };
                let acker = MemoryAcker {
                    broker: broker.clone(),
                    queue: queue.clone(),
                    delivery_tag,
                    message: message.clone(),
                };
                let delivery = Delivery::new(message, delivery_tag, acker);
                Some((Ok(delivery), (receiver, broker, queue)))
            },
        );
        Ok(stream.boxed())
    }

    async fn publish(&self, routing_key: &str, mut message: Message) -> Result<()> {
        {
            let mut state = self.broker.state();
            if state.failing_routes.contains(routing_key) {
                return Err(Error::Publish {
                    routing_key: routing_key.to_string(),
                    reason: "injected publish failure".to_string(),
                });
            }
            if message.timestamp.is_none() {
                message.timestamp = Some(Utc::now());
            }
            state
                .published
                .push((routing_key.to_string(), message.clone()));
            match state.queues.get(routing_key) {
                Some(q) => {
                    let _ = q.sender.send(message);
                }
                None => debug!(routing_key, "unroutable message dropped"),
            }
        }
        self.broker.changed.notify_waiters();
        Ok(())
    }

    async fn close(&self) {
        self.release();
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    delivery_tag: u64,
    message: Message,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(
            &self.queue,
            self.delivery_tag,
            Disposition::Ack,
            self.message.clone(),
        );
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.broker.settle(
            &self.queue,
            self.delivery_tag,
            Disposition::Reject { requeue },
            self.message.clone(),
        );
        Ok(())
    }
}
