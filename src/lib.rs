//! # base-service
//!
//! Turns AMQP queues into RPC endpoints. Each registered event name is a
//! queue; a dispatch loop consumes it, hands every message to the bound
//! handler, publishes the result to the caller's reply address (when there
//! is one) and acknowledges the message.
//!
//! Also provides an RPC client for calling those endpoints, an in-memory
//! broker for tests, and OpenTelemetry observability.

pub mod client;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod model;
pub mod telemetry;
pub mod transport;

pub use client::RpcClient;
pub use codec::Payload;
pub use engine::{LoopExit, Service};
pub use error::{Error, Result};
pub use handler::{EventKind, EventRegistry, Handler, handler_fn};
