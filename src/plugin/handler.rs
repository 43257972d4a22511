//! Beat Handlers
//!
//! A plugin supplies one [`Handler`] per handler name used by its
//! sequences. The executor calls it with a [`BeatInvocation`] and merges
//! the returned object, if any, into the baton.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::callbacks::{CallbackDelegate, Payload};
use crate::error::{HandlerError, Result};
use crate::execution::context::{Baton, Priority, RequestId};
use crate::execution::engine::Conductor;
use crate::execution::mutation::{MutationBuffer, MutationOp};
use crate::sequence::Beat;

/// What a handler produces: an optional partial baton, or a beat error.
pub type HandlerResult = std::result::Result<Option<Value>, HandlerError>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

type HandlerFn = dyn Fn(BeatInvocation) -> HandlerFuture + Send + Sync;

/// A callable bound to a handler name.
#[derive(Clone)]
pub struct Handler(Arc<HandlerFn>);

impl Handler {
    /// Wraps an asynchronous handler.
    ///
    /// ```
    /// use conductor::plugin::Handler;
    /// use serde_json::json;
    ///
    /// let handler = Handler::new(|invocation| async move {
    ///     let x = invocation.baton().get("x").unwrap_or_default();
    ///     Ok(Some(json!({"seen": x})))
    /// });
    /// ```
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(BeatInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self(Arc::new(move |invocation| -> HandlerFuture {
            Box::pin(handler(invocation))
        }))
    }

    /// Wraps a synchronous handler. It still runs on the executor's
    /// handler task, so a panic is contained like any other beat error.
    pub fn sync<F>(handler: F) -> Self
    where
        F: Fn(&BeatInvocation) -> HandlerResult + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Self(Arc::new(move |invocation| -> HandlerFuture {
            let handler = Arc::clone(&handler);
            Box::pin(async move { handler(&invocation) })
        }))
    }

    pub(crate) fn call(&self, invocation: BeatInvocation) -> HandlerFuture {
        (self.0)(invocation)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Handler")
    }
}

/// Handler name to callable.
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: HashMap<String, Handler>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, handler: Handler) -> Self {
        self.insert(name, handler);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: Handler) -> Option<Handler> {
        self.handlers.insert(name.into(), handler)
    }

    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Handler names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Handler)> for HandlerMap {
    fn from_iter<I: IntoIterator<Item = (K, Handler)>>(iter: I) -> Self {
        Self {
            handlers: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl fmt::Debug for HandlerMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Everything a handler sees for one beat.
#[derive(Clone)]
pub struct BeatInvocation {
    pub request_id: RequestId,
    pub sequence_id: String,
    pub movement_id: String,
    pub beat: Beat,
    pub(crate) ancestors: Vec<RequestId>,
    pub(crate) baton: Baton,
    pub(crate) conductor: Conductor,
    pub(crate) mutations: MutationBuffer,
}

impl BeatInvocation {
    /// The beat's static data.
    pub fn data(&self) -> &Value {
        &self.beat.data
    }

    /// The execution's shared payload.
    pub fn baton(&self) -> &Baton {
        &self.baton
    }

    pub fn conductor(&self) -> &Conductor {
        &self.conductor
    }

    /// Rehydrates the callback token found at `pointer` in the baton.
    pub fn callback(&self, pointer: &str) -> Option<CallbackDelegate> {
        self.conductor
            .callbacks()
            .delegate_at(&self.baton.snapshot(), pointer)
    }

    /// Every callback token in the baton, keyed by its current pointer.
    pub fn callbacks(&self) -> Vec<(String, CallbackDelegate)> {
        self.conductor.callbacks().rehydrate(&self.baton.snapshot())
    }

    /// Starts a nested sequence on behalf of this execution.
    ///
    /// Resources held by this execution or any execution above it count
    /// as already owned by the nested one. With [`Priority::Chained`] the nested sequence runs to
    /// completion before this returns.
    pub async fn play(
        &self,
        plugin_id: &str,
        sequence_id: &str,
        payload: impl Into<Payload>,
        priority: Priority,
    ) -> Result<RequestId> {
        let mut lineage = Vec::with_capacity(self.ancestors.len() + 1);
        lineage.push(self.request_id.clone());
        lineage.extend(self.ancestors.iter().cloned());

        self.conductor
            .play_from(lineage, plugin_id, sequence_id, payload.into(), priority)
            .await
    }

    /// Queues a declarative mutation for the injected sink.
    pub fn mutate(&self, op: MutationOp) {
        self.mutations.push(op);
    }

    /// Fire-and-forget emission on the conductor's bus.
    pub fn emit(&self, event: &str, data: Value) {
        self.conductor.bus().emit(event, data);
    }
}

impl fmt::Debug for BeatInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatInvocation")
            .field("request_id", &self.request_id)
            .field("sequence_id", &self.sequence_id)
            .field("movement_id", &self.movement_id)
            .field("beat", &self.beat.beat)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handler_map_names_sorted() {
        let map = HandlerMap::new()
            .with("zeta", Handler::sync(|_| Ok(None)))
            .with("alpha", Handler::sync(|_| Ok(None)));

        assert_eq!(map.names(), vec!["alpha", "zeta"]);
        assert!(map.contains("alpha"));
        assert!(!map.contains("beta"));
        assert_eq!(format!("{:?}", map), r#"{"alpha", "zeta"}"#);
    }

    #[test]
    fn test_handler_map_from_iter() {
        let map: HandlerMap = vec![("h1", Handler::sync(|_| Ok(Some(json!({"a": 1})))))]
            .into_iter()
            .collect();
        assert_eq!(map.len(), 1);
        assert!(map.get("h1").is_some());
    }

    #[test]
    fn test_insert_replaces() {
        let mut map = HandlerMap::new();
        assert!(map.insert("h", Handler::sync(|_| Ok(None))).is_none());
        assert!(map.insert("h", Handler::sync(|_| Ok(None))).is_some());
        assert_eq!(map.len(), 1);
    }
}
