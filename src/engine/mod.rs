//! Worker engine: per-queue dispatch loops and the service that runs them.

pub mod dispatch;
pub mod service;

pub use dispatch::{DispatchLoop, Dispatcher, LoopState, Outcome, ProcessError};
pub use service::{LoopExit, Service};
