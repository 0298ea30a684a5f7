//! Dispatch loop: turns one queue into an RPC endpoint.
//!
//! Each loop owns its session, consumes its queue one delivery at a time and
//! settles every delivery exactly once before taking the next. Failures while
//! handling a single delivery are contained here; only setup and transport
//! failures end the loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use opentelemetry::KeyValue;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};

use crate::codec::Payload;
use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::handler::{EventKind, Handler};
use crate::model::{Message, ReplyAddress};
use crate::telemetry::dispatch::{
    record_disposition, record_state_transition, start_loop_span, start_message_span,
};
use crate::telemetry::metrics;
use crate::transport::{Broker, Delivery, DeliveryStream, Disposition, QueueOptions, Session};

/// Lifecycle of a dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Connecting,
    Consuming,
    Processing,
    Stopped,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Connecting => "connecting",
            LoopState::Consuming => "consuming",
            LoopState::Processing => "processing",
            LoopState::Stopped => "stopped",
        }
    }
}

/// Why a single delivery could not be handled.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),

    #[error("handler did not finish within {0:?}")]
    HandlerTimeout(Duration),

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("reply to {reply_to} not published: {source}")]
    ReplyPublish {
        reply_to: String,
        #[source]
        source: Error,
    },
}

impl ProcessError {
    /// How the delivery is settled for this failure. Nothing is requeued.
    pub fn disposition(&self) -> Disposition {
        match self {
            ProcessError::Handler(_) => Disposition::Reject { requeue: false },
            ProcessError::HandlerTimeout(_) => Disposition::Reject { requeue: false },
            ProcessError::HandlerPanic(_) => Disposition::Reject { requeue: false },
            ProcessError::ReplyPublish { .. } => Disposition::Reject { requeue: false },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProcessError::Handler(_) => "handler_error",
            ProcessError::HandlerTimeout(_) => "handler_timeout",
            ProcessError::HandlerPanic(_) => "handler_panic",
            ProcessError::ReplyPublish { .. } => "reply_publish_error",
        }
    }
}

/// What happened to a delivery that was handled successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler ran and its result was published to the reply address.
    Replied,
    /// No reply address; handler ran and its result was dropped.
    Handled,
    /// The reply address was unusable; handled as fire-and-forget.
    ReplySkipped,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Replied => "replied",
            Outcome::Handled => "handled",
            Outcome::ReplySkipped => "reply_skipped",
        }
    }
}

/// Per-queue message processing: decode, invoke, reply, settle.
#[derive(Clone)]
pub struct Dispatcher {
    queue: String,
    kind: EventKind,
    handler: Arc<dyn Handler>,
    handler_timeout: Option<Duration>,
    traceback: bool,
}

impl Dispatcher {
    pub fn new(
        queue: impl Into<String>,
        kind: EventKind,
        handler: Arc<dyn Handler>,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            queue: queue.into(),
            kind,
            handler,
            handler_timeout: settings.handler_timeout(),
            traceback: settings.traceback,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Handle one delivery and settle it. Returns the settlement made.
    ///
    /// Never fails: handler and reply errors are reported and turned into a
    /// reject; a failed ack/reject is reported and otherwise ignored.
    pub async fn process<S: Session>(&self, session: &S, delivery: Delivery) -> Disposition {
        let span = start_message_span(
            &self.queue,
            delivery.delivery_tag,
            delivery.message.correlation_id.as_deref(),
        );
        metrics::messages_received().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("kind", self.kind.as_str()),
            ],
        );

        async {
            let result = self.handle_message(session, &delivery.message).await;

            let (disposition, label) = match &result {
                Ok(outcome) => (Disposition::Ack, outcome.label()),
                Err(err) => {
                    self.report(err);
                    (err.disposition(), err.label())
                }
            };

            record_disposition(&span, &disposition.to_string());
            if let Err(e) = delivery.settle(disposition).await {
                error!(queue = %self.queue, %disposition, "failed to settle delivery: {e}");
            }
            metrics::messages_settled().add(
                1,
                &[
                    KeyValue::new("queue", self.queue.clone()),
                    KeyValue::new("disposition", disposition.to_string()),
                    KeyValue::new("outcome", label),
                ],
            );
            disposition
        }
        .instrument(span.clone())
        .await
    }

    async fn handle_message<S: Session>(
        &self,
        session: &S,
        message: &Message,
    ) -> std::result::Result<Outcome, ProcessError> {
        let payload = message.payload();

        let reply_to = match message.reply_to.as_deref() {
            None => None,
            Some(raw) => match ReplyAddress::parse(raw) {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!(queue = %self.queue, "unusable reply address ({e}), handling as fire-and-forget");
                    self.invoke(payload).await?;
                    return Ok(Outcome::ReplySkipped);
                }
            },
        };

        let Some(reply_to) = reply_to else {
            self.invoke(payload).await?;
            return Ok(Outcome::Handled);
        };

        let result = self.invoke(payload).await?;
        let mut reply = Message::from_payload(&result).timestamp(chrono::Utc::now());
        reply.correlation_id = message.correlation_id.clone();

        let published = session.publish(reply_to.as_str(), reply).await;
        metrics::replies_published().add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("result", if published.is_ok() { "ok" } else { "error" }),
            ],
        );
        published.map_err(|source| ProcessError::ReplyPublish {
            reply_to: reply_to.to_string(),
            source,
        })?;

        debug!(queue = %self.queue, reply_to = %reply_to, "reply published");
        Ok(Outcome::Replied)
    }

    async fn invoke(&self, payload: Payload) -> std::result::Result<Payload, ProcessError> {
        let started = Instant::now();
        let call = AssertUnwindSafe(self.handler.handle(payload)).catch_unwind();

        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    self.record_duration(started, "timeout");
                    return Err(ProcessError::HandlerTimeout(limit));
                }
            },
            None => call.await,
        };

        match result {
            Ok(Ok(output)) => {
                self.record_duration(started, "ok");
                Ok(output)
            }
            Ok(Err(e)) => {
                self.record_duration(started, "error");
                Err(ProcessError::Handler(e))
            }
            Err(panic) => {
                self.record_duration(started, "panic");
                Err(ProcessError::HandlerPanic(panic_message(&*panic)))
            }
        }
    }

    fn record_duration(&self, started: Instant, result: &'static str) {
        metrics::handler_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("result", result),
            ],
        );
    }

    fn report(&self, err: &ProcessError) {
        if self.traceback {
            error!(queue = %self.queue, kind = err.label(), "message failed: {err:?}");
        } else {
            error!(queue = %self.queue, kind = err.label(), "message failed: {err}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A long-running consumer for one registered event.
pub struct DispatchLoop<B: Broker> {
    broker: Arc<B>,
    dispatcher: Dispatcher,
    prefetch_count: u16,
    queue_options: QueueOptions,
    channel_id: Option<u16>,
    shutdown: CancellationToken,
    state: watch::Sender<LoopState>,
}

impl<B: Broker> DispatchLoop<B> {
    pub fn new(
        broker: Arc<B>,
        dispatcher: Dispatcher,
        settings: &WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let queue_options = if settings.durable_queues {
            QueueOptions::durable()
        } else {
            QueueOptions::default()
        };
        let (state, _) = watch::channel(LoopState::Idle);
        Self {
            broker,
            dispatcher,
            prefetch_count: settings.prefetch_count,
            queue_options,
            channel_id: None,
            shutdown,
            state,
        }
    }

    /// Ask for a specific channel number when the session opens.
    pub fn with_channel_id(mut self, channel_id: u16) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn queue(&self) -> &str {
        self.dispatcher.queue()
    }

    /// Observe state changes (e.g. to wait until the loop is consuming).
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    /// Run until the shutdown token is cancelled.
    ///
    /// Returns `Ok(())` on shutdown. Setup failures (connection, channel,
    /// queue declaration) and a consumer closed by the broker are returned as
    /// errors; nothing else stops the loop.
    pub async fn run(self) -> Result<()> {
        let span = start_loop_span(self.queue(), self.dispatcher.kind().as_str());
        let result = self.listen(&span).instrument(span.clone()).await;

        self.transition(&span, LoopState::Stopped);
        let labels = [
            KeyValue::new("queue", self.queue().to_string()),
            KeyValue::new("state", if result.is_ok() { "stopped" } else { "failed" }),
        ];
        metrics::loop_transitions().add(1, &labels);
        span.in_scope(|| match &result {
            Ok(()) => info!(queue = %self.queue(), "dispatch loop stopped"),
            Err(e) => error!(queue = %self.queue(), "dispatch loop failed: {e}"),
        });
        result
    }

    async fn listen(&self, span: &Span) -> Result<()> {
        self.transition(span, LoopState::Connecting);
        let (session, mut deliveries) = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Ok(()),
            setup = self.setup() => setup?,
        };

        self.transition(span, LoopState::Consuming);
        metrics::loop_transitions().add(
            1,
            &[
                KeyValue::new("queue", self.queue().to_string()),
                KeyValue::new("state", "consuming"),
            ],
        );
        info!(queue = %self.queue(), kind = %self.dispatcher.kind(), "listening");

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) if e.is_fatal_to_loop() => break Err(e),
                Some(Err(e)) => {
                    warn!(queue = %self.queue(), "skipping unreadable delivery: {e}");
                    continue;
                }
                None => {
                    break Err(Error::Channel(format!(
                        "consumer for {} was closed by the broker",
                        self.queue()
                    )));
                }
            };

            // Once taken, a delivery is processed and settled even if
            // shutdown is requested meanwhile.
            self.transition(span, LoopState::Processing);
            self.dispatcher.process(&session, delivery).await;
            self.transition(span, LoopState::Consuming);
        };

        drop(deliveries);
        session.close().await;
        result
    }

    async fn setup(&self) -> Result<(B::Session, DeliveryStream)> {
        let session = self.broker.open_session(self.channel_id).await?;
        session.set_prefetch(self.prefetch_count).await?;
        let queue = session
            .declare_queue(self.queue(), self.queue_options)
            .await?;
        let deliveries = session.consume(&queue).await?;
        Ok((session, deliveries))
    }

    fn transition(&self, span: &Span, to: LoopState) {
        let from = self.state.send_replace(to);
        if from != to {
            record_state_transition(span, from.as_str(), to.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_failure_is_requeued() {
        let failures = [
            ProcessError::Handler(anyhow::anyhow!("boom")),
            ProcessError::HandlerTimeout(Duration::from_secs(1)),
            ProcessError::HandlerPanic("oops".to_string()),
            ProcessError::ReplyPublish {
                reply_to: "R1".to_string(),
                source: Error::Publish {
                    routing_key: "R1".to_string(),
                    reason: "nack".to_string(),
                },
            },
        ];
        for failure in &failures {
            assert_eq!(failure.disposition(), Disposition::Reject { requeue: false });
        }
    }

    #[test]
    fn handler_error_display_includes_cause_chain() {
        let err = anyhow::anyhow!("db down").context("lookup failed");
        let rendered = ProcessError::Handler(err).to_string();
        assert!(rendered.contains("lookup failed"));
        assert!(rendered.contains("db down"));
    }

    #[test]
    fn panic_payloads_render_as_text() {
        assert_eq!(panic_message(&"static str"), "static str");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
