//! Service: runs one dispatch loop per registered event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::dispatch::{DispatchLoop, Dispatcher};
use crate::config::WorkerSettings;
use crate::error::{Error, Result};
use crate::handler::{EventKind, EventRegistry, Handler};
use crate::transport::Broker;

/// How one dispatch loop ended.
#[derive(Debug)]
pub struct LoopExit {
    pub event: String,
    pub kind: EventKind,
    pub result: Result<()>,
}

/// A set of event handlers served from one broker.
pub struct Service<B: Broker> {
    broker: Arc<B>,
    settings: WorkerSettings,
    registry: EventRegistry,
}

impl<B: Broker> Service<B> {
    pub fn new(broker: B, settings: WorkerSettings) -> Self {
        Self::with_shared_broker(Arc::new(broker), settings)
    }

    pub fn with_shared_broker(broker: Arc<B>, settings: WorkerSettings) -> Self {
        Self {
            broker,
            settings,
            registry: EventRegistry::new(),
        }
    }

    /// Bind `handler` to the `event` queue as an RPC handler.
    pub fn add_event_handler(&mut self, event: impl Into<String>, handler: impl Handler) -> &mut Self {
        self.registry.register(EventKind::Rpc, event, handler);
        self
    }

    pub fn register(
        &mut self,
        kind: EventKind,
        event: impl Into<String>,
        handler: impl Handler,
    ) -> &mut Self {
        self.registry.register(kind, event, handler);
        self
    }

    /// Replace the registry wholesale.
    pub fn with_registry(mut self, registry: EventRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Check that the service has something to run.
    pub fn validate(&self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(Error::Config("no event handlers registered".to_string()));
        }
        if let Some((kind, _, _)) = self.registry.iter().find(|(_, name, _)| name.is_empty()) {
            return Err(Error::Config(format!("empty event name registered as {kind}")));
        }
        Ok(())
    }

    /// Run every registered handler until `shutdown` is cancelled.
    ///
    /// Loops are independent: one that fails to start or loses its channel
    /// stops alone, and its error is returned in its [`LoopExit`]. Returns
    /// once every loop has stopped.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<Vec<LoopExit>> {
        self.validate()?;

        for event in self.registry.shared_queues() {
            warn!(event = %event, "event registered as both rpc and basic; consumers will compete for messages");
        }

        let mut loops = JoinSet::new();
        for (kind, event, handler) in self.registry.clone() {
            let dispatcher = Dispatcher::new(event.clone(), kind, handler, &self.settings);
            let dispatch = DispatchLoop::new(
                Arc::clone(&self.broker),
                dispatcher,
                &self.settings,
                shutdown.clone(),
            );
            loops.spawn(async move {
                let result = match AssertUnwindSafe(dispatch.run()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Other(format!("dispatch loop for {event} panicked"))),
                };
                LoopExit {
                    event,
                    kind,
                    result,
                }
            });
        }
        info!(loops = loops.len(), "service started");

        let mut exits = Vec::with_capacity(loops.len());
        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(exit) => {
                    if let Err(e) = &exit.result {
                        error!(event = %exit.event, kind = %exit.kind, "event loop exited: {e}");
                    }
                    exits.push(exit);
                }
                // Loop futures catch their own panics; only runtime shutdown
                // cancels a task out from under us.
                Err(e) => error!("event loop task did not complete: {e}"),
            }
        }

        info!("service stopped");
        Ok(exits)
    }
}
