//! RPC client: request/reply and fire-and-forget over the broker.
//!
//! A client owns one session and one private, server-named reply queue for
//! its whole lifetime. Calls on a client are serialized, so at most one
//! correlation id is outstanding and any other reply is stale.

use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::codec::Payload;
use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::model::Message;
use crate::telemetry::metrics;
use crate::transport::{Broker, DeliveryStream, QueueOptions, Session};

pub struct RpcClient<B: Broker> {
    session: B::Session,
    reply_queue: String,
    replies: Mutex<DeliveryStream>,
    timeout: Duration,
}

impl<B: Broker> RpcClient<B> {
    /// Open a session and start consuming a private reply queue.
    pub async fn connect(broker: &B, settings: &WorkerSettings) -> Result<Self> {
        let session = broker.open_session(None).await?;
        let reply_queue = session.declare_queue("", QueueOptions::private()).await?;
        let replies = session.consume(&reply_queue).await?;
        debug!(reply_queue = %reply_queue, "rpc client connected");
        Ok(Self {
            session,
            reply_queue,
            replies: Mutex::new(replies),
            timeout: settings.rpc_timeout(),
        })
    }

    /// Name of the queue replies are routed to.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Send `payload` to `queue` and wait for the handler's result.
    ///
    /// # Errors
    /// `Error::Timeout` if no correlated reply arrives within the configured
    /// RPC timeout; transport errors if the request cannot be published.
    pub async fn call(&self, queue: &str, payload: Payload) -> Result<Payload> {
        self.call_with_timeout(queue, payload, self.timeout).await
    }

    pub async fn call_with_timeout(
        &self,
        queue: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Payload> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut replies = self.replies.lock().await;

        let request = Message::from_payload(&payload)
            .correlation_id(correlation_id.clone())
            .reply_to(self.reply_queue.clone())
            .timestamp(Utc::now());
        if let Err(e) = self.session.publish(queue, request).await {
            record_operation(queue, "call", "publish_error");
            return Err(e);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = match tokio::time::timeout_at(deadline, replies.next()).await {
                Ok(next) => next,
                Err(_) => {
                    record_operation(queue, "call", "timeout");
                    return Err(Error::Timeout {
                        queue: queue.to_string(),
                        timeout,
                    });
                }
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(Error::Channel(format!(
                        "reply queue {} closed",
                        self.reply_queue
                    )));
                }
            };

            if delivery.message.correlation_id.as_deref() == Some(correlation_id.as_str()) {
                let result = delivery.message.payload();
                if let Err(e) = delivery.ack().await {
                    warn!(queue, "failed to ack reply: {e}");
                }
                record_operation(queue, "call", "ok");
                return Ok(result);
            }

            let stray = Error::CorrelationMismatch {
                expected: correlation_id.clone(),
                got: delivery.message.correlation_id.clone(),
            };
            debug!(queue, "discarding reply: {stray}");
            metrics::stray_replies().add(1, &[KeyValue::new("queue", queue.to_string())]);
            if let Err(e) = delivery.ack().await {
                warn!(queue, "failed to ack stray reply: {e}");
            }
        }
    }

    /// Publish `payload` to `queue` without asking for a reply.
    ///
    /// Failures are logged and counted, never returned.
    pub async fn send(&self, queue: &str, payload: Payload) {
        let message = Message::from_payload(&payload).timestamp(Utc::now());
        match self.session.publish(queue, message).await {
            Ok(()) => record_operation(queue, "send", "ok"),
            Err(e) => {
                error!(queue, "send failed: {e}");
                record_operation(queue, "send", "publish_error");
            }
        }
    }

    pub async fn close(self) {
        drop(self.replies);
        self.session.close().await;
    }
}

fn record_operation(queue: &str, operation: &'static str, result: &'static str) {
    metrics::client_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
            KeyValue::new("result", result),
        ],
    );
}
