//! Metric instrument factories for base-service.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"base-service"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for base-service instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("base-service")
}

/// Counter: deliveries taken off a worker queue.
/// Labels: `queue`, `kind`.
pub fn messages_received() -> Counter<u64> {
    meter()
        .u64_counter("base_service.messages.received")
        .with_description("Number of deliveries consumed by dispatch loops")
        .build()
}

/// Counter: terminal decisions on deliveries.
/// Labels: `queue`, `disposition` ("ack" | "reject" | "requeue"), `outcome`.
pub fn messages_settled() -> Counter<u64> {
    meter()
        .u64_counter("base_service.messages.settled")
        .with_description("Number of deliveries acked or rejected")
        .build()
}

/// Counter: replies published to a caller's reply address.
/// Labels: `queue`, `result` ("ok" | "error").
pub fn replies_published() -> Counter<u64> {
    meter()
        .u64_counter("base_service.replies.published")
        .with_description("Number of RPC replies published")
        .build()
}

/// Histogram: handler invocation time in milliseconds.
/// Labels: `queue`, `result` ("ok" | "error" | "timeout" | "panic").
pub fn handler_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("base_service.handler.duration_ms")
        .with_description("Handler invocation duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: dispatch loop lifecycle (started, stopped, failed).
/// Labels: `queue`, `state`.
pub fn loop_transitions() -> Counter<u64> {
    meter()
        .u64_counter("base_service.loop.transitions")
        .with_description("Dispatch loop state transitions")
        .build()
}

/// Counter: client-side operations.
/// Labels: `queue`, `operation` ("call" | "send"), `result`.
pub fn client_operations() -> Counter<u64> {
    meter()
        .u64_counter("base_service.client.operations")
        .with_description("Number of RPC client calls and sends")
        .build()
}

/// Counter: replies discarded by a client because the correlation id did not
/// match the outstanding call.
pub fn stray_replies() -> Counter<u64> {
    meter()
        .u64_counter("base_service.client.stray_replies")
        .with_description("Replies discarded for correlation mismatch")
        .build()
}
