//! Event handlers and the registry that binds them to queue names.
//!
//! A handler is an async function from a decoded payload to a result
//! payload. The registry is keyed first by category, then by event name; the
//! event name is also the queue the handler listens on.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::Payload;

/// An async handler bound to one event.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, payload: Payload) -> anyhow::Result<Payload>;
}

/// Adapter that turns an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

/// Wrap an async closure as a handler.
///
/// ```
/// use base_service::handler::handler_fn;
/// use base_service::codec::Payload;
///
/// let echo = handler_fn(|payload: Payload| async move { anyhow::Ok(payload) });
/// # let _ = &echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    async fn handle(&self, payload: Payload) -> anyhow::Result<Payload> {
        (self.0)(payload).await
    }
}

/// Handler category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    /// Request/reply handlers; callers normally expect a result.
    Rpc,
    /// Handlers normally fed fire-and-forget messages.
    Basic,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Rpc => "rpc",
            EventKind::Basic => "basic",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rpc" => Ok(EventKind::Rpc),
            "basic" => Ok(EventKind::Basic),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// Registry of handlers, keyed by category then event name.
///
/// Registering the same `(kind, event)` twice replaces the earlier handler.
#[derive(Default, Clone)]
pub struct EventRegistry {
    events: BTreeMap<EventKind, BTreeMap<String, Arc<dyn Handler>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: EventKind,
        event: impl Into<String>,
        handler: impl Handler,
    ) -> &mut Self {
        self.register_arc(kind, event, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        kind: EventKind,
        event: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        self.events
            .entry(kind)
            .or_default()
            .insert(event.into(), handler);
        self
    }

    pub fn get(&self, kind: EventKind, event: &str) -> Option<Arc<dyn Handler>> {
        self.events.get(&kind)?.get(event).cloned()
    }

    pub fn contains(&self, kind: EventKind, event: &str) -> bool {
        self.events
            .get(&kind)
            .is_some_and(|events| events.contains_key(event))
    }

    pub fn len(&self) -> usize {
        self.events.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All `(kind, event, handler)` bindings, rpc first, events sorted.
    pub fn iter(&self) -> impl Iterator<Item = (EventKind, &str, &Arc<dyn Handler>)> {
        self.events.iter().flat_map(|(kind, events)| {
            events
                .iter()
                .map(move |(name, handler)| (*kind, name.as_str(), handler))
        })
    }

    /// Event names registered under more than one category. Each binding
    /// gets its own consumer on the same queue, so these compete for
    /// messages.
    pub fn shared_queues(&self) -> Vec<String> {
        let rpc = self.events.get(&EventKind::Rpc);
        let basic = self.events.get(&EventKind::Basic);
        match (rpc, basic) {
            (Some(rpc), Some(basic)) => rpc
                .keys()
                .filter(|name| basic.contains_key(*name))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }
}

impl IntoIterator for EventRegistry {
    type Item = (EventKind, String, Arc<dyn Handler>);
    type IntoIter = std::vec::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        let mut bindings = Vec::with_capacity(self.len());
        for (kind, events) in self.events {
            bindings.extend(
                events
                    .into_iter()
                    .map(|(name, handler)| (kind, name, handler)),
            );
        }
        bindings.into_iter()
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|(kind, name, _)| format!("{kind}:{name}")))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: serde_json::Value) -> impl Handler {
        handler_fn(move |_| {
            let value = value.clone();
            async move { anyhow::Ok(Payload::Json(value)) }
        })
    }

    #[tokio::test]
    async fn reregistering_overwrites_silently() {
        let mut registry = EventRegistry::new();
        registry.register(EventKind::Rpc, "ping", constant(json!(1)));
        registry.register(EventKind::Rpc, "ping", constant(json!(2)));

        assert_eq!(registry.len(), 1);
        let handler = registry.get(EventKind::Rpc, "ping").unwrap();
        let out = handler.handle(Payload::from("x")).await.unwrap();
        assert_eq!(out, Payload::Json(json!(2)));
    }

    #[test]
    fn categories_are_separate_namespaces() {
        let mut registry = EventRegistry::new();
        registry
            .register(EventKind::Rpc, "audit", constant(json!(null)))
            .register(EventKind::Basic, "audit", constant(json!(null)))
            .register(EventKind::Basic, "log", constant(json!(null)));

        assert_eq!(registry.len(), 3);
        assert!(registry.contains(EventKind::Basic, "log"));
        assert!(!registry.contains(EventKind::Rpc, "log"));
        assert_eq!(registry.shared_queues(), vec!["audit".to_string()]);
    }

    #[test]
    fn event_names_are_case_sensitive() {
        let mut registry = EventRegistry::new();
        registry.register(EventKind::Rpc, "Ping", constant(json!(null)));
        assert!(!registry.contains(EventKind::Rpc, "ping"));
    }

    #[test]
    fn kind_parses_from_str() {
        assert_eq!("rpc".parse::<EventKind>().unwrap(), EventKind::Rpc);
        assert_eq!("basic".parse::<EventKind>().unwrap(), EventKind::Basic);
        assert!("RPC".parse::<EventKind>().is_err());
    }
}
