//! Dispatch span helpers.
//!
//! Provides span creation and state-transition recording for deliveries
//! flowing through a dispatch loop.

use tracing::Span;

/// Start a span for one delivery.
///
/// The `message.disposition` field is declared empty and is filled in by
/// [`record_disposition`] once the delivery is settled.
pub fn start_message_span(queue: &str, delivery_tag: u64, correlation_id: Option<&str>) -> Span {
    tracing::info_span!(
        "message.process",
        "messaging.destination.name" = queue,
        "messaging.delivery_tag" = delivery_tag,
        "messaging.message.conversation_id" = correlation_id.unwrap_or(""),
        "message.disposition" = tracing::field::Empty,
    )
}

/// Start the long-lived span for a dispatch loop.
pub fn start_loop_span(queue: &str, kind: &str) -> Span {
    tracing::info_span!(
        "dispatch.loop",
        "messaging.destination.name" = queue,
        "dispatch.kind" = kind,
    )
}

/// Record a loop state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "state_transition");
    });
}

/// Record how a delivery was settled.
pub fn record_disposition(span: &Span, disposition: &str) {
    span.record("message.disposition", disposition);
}
