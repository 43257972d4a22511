//! Event Bus
//!
//! Publish/subscribe distribution with per-subscriber error isolation.
//!
//! - [`EventBus::emit`] is fire-and-forget: synchronous subscribers run
//!   inline, asynchronous ones are spawned.
//! - [`EventBus::emit_and_await`] returns only after every subscriber has
//!   settled. A failing or panicking subscriber is logged and counted; it
//!   never reaches the emitter or the other subscribers.
//! - [`EventBus::emit_musical`] picks one of the two based on a beat's
//!   timing, and is what the executor uses for beat events.
//!
//! A plugin may hold at most one subscription per event: subscribing again
//! with the same plugin id returns the existing handle.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::sequence::{Dynamics, Timing};
use crate::sync::lock;

/// What a subscriber reports back.
pub type EventResult = Result<(), String>;

/// Future returned by asynchronous subscribers.
pub type EventFuture = Pin<Box<dyn Future<Output = EventResult> + Send>>;

type SyncCallback = dyn Fn(&Value) -> EventResult + Send + Sync;
type AsyncCallback = dyn Fn(Value) -> EventFuture + Send + Sync;

/// A subscriber callback, synchronous or asynchronous.
#[derive(Clone)]
pub enum EventCallback {
    Sync(Arc<SyncCallback>),
    Async(Arc<AsyncCallback>),
}

impl EventCallback {
    /// Wraps a synchronous callback.
    pub fn sync<F>(callback: F) -> Self
    where
        F: Fn(&Value) -> EventResult + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(callback))
    }

    /// Wraps an asynchronous callback.
    pub fn asynchronous<F, Fut>(callback: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EventResult> + Send + 'static,
    {
        Self::Async(Arc::new(move |data| Box::pin(callback(data)) as EventFuture))
    }
}

impl fmt::Debug for EventCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("EventCallback::Sync"),
            Self::Async(_) => f.write_str("EventCallback::Async"),
        }
    }
}

struct SubscriberEntry {
    id: u64,
    plugin_id: Option<String>,
    callback: EventCallback,
}

#[derive(Default)]
struct BusState {
    subscribers: HashMap<String, Vec<SubscriberEntry>>,
    next_id: u64,
    total_emitted: u64,
    failed_deliveries: u64,
    emitted_by_event: HashMap<String, u64>,
}

/// Handle returned by `subscribe`; call [`unsubscribe`](Self::unsubscribe)
/// to remove the subscriber.
#[derive(Clone)]
pub struct Subscription {
    event: String,
    id: u64,
    state: Weak<Mutex<BusState>>,
}

impl Subscription {
    /// Removes the subscriber. Returns `false` if it was already removed.
    pub fn unsubscribe(&self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = lock(&state);
        let Some(entries) = state.subscribers.get_mut(&self.event) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.id != self.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            state.subscribers.remove(&self.event);
        }
        if removed {
            debug!("Unsubscribed #{} from '{}'", self.id, self.event);
        }
        removed
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn is_active(&self) -> bool {
        self.state.upgrade().is_some_and(|state| {
            lock(&state)
                .subscribers
                .get(&self.event)
                .is_some_and(|entries| entries.iter().any(|entry| entry.id == self.id))
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        self.event == other.event && self.id == other.id
    }
}

/// Outcome of an awaited emission.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Diagnostic counters. Not used for control flow.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusDebugInfo {
    pub total_emitted: u64,
    pub failed_deliveries: u64,
    pub subscriber_counts: BTreeMap<String, usize>,
    pub emitted_by_event: BTreeMap<String, u64>,
}

/// Publish/subscribe bus. Cloning shares the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `callback` to `event`.
    ///
    /// With a `plugin_id`, a second subscription for the same event returns
    /// the first handle instead of registering a duplicate.
    pub fn subscribe(
        &self,
        event: &str,
        callback: EventCallback,
        plugin_id: Option<&str>,
    ) -> Subscription {
        let mut state = lock(&self.state);

        if let Some(plugin_id) = plugin_id {
            let existing = state.subscribers.get(event).and_then(|entries| {
                entries
                    .iter()
                    .find(|entry| entry.plugin_id.as_deref() == Some(plugin_id))
                    .map(|entry| entry.id)
            });
            if let Some(id) = existing {
                warn!(
                    "Plugin '{}' is already subscribed to '{}'; keeping the existing subscription",
                    plugin_id, event
                );
                return Subscription {
                    event: event.to_string(),
                    id,
                    state: Arc::downgrade(&self.state),
                };
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        state
            .subscribers
            .entry(event.to_string())
            .or_default()
            .push(SubscriberEntry {
                id,
                plugin_id: plugin_id.map(str::to_string),
                callback,
            });
        debug!("Subscribed #{} to '{}' (plugin: {:?})", id, event, plugin_id);

        Subscription {
            event: event.to_string(),
            id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Subscribes a synchronous closure with no plugin guard.
    pub fn subscribe_fn<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) -> EventResult + Send + Sync + 'static,
    {
        self.subscribe(event, EventCallback::sync(callback), None)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        subscription.unsubscribe()
    }

    /// Emits without waiting for asynchronous subscribers.
    pub fn emit(&self, event: &str, data: Value) {
        let callbacks = self.prepare(event);
        let mut failed = 0;
        for callback in callbacks {
            match callback {
                EventCallback::Sync(f) => {
                    if !invoke_sync(event, &f, &data) {
                        failed += 1;
                    }
                }
                EventCallback::Async(f) => match spawn_async(event, &f, data.clone()) {
                    Some(handle) => {
                        let bus = self.clone();
                        let event = event.to_string();
                        spawn_detached(async move {
                            if !settle(&event, handle).await {
                                bus.record_failures(1);
                            }
                        });
                    }
                    None => failed += 1,
                },
            }
        }
        self.record_failures(failed);
    }

    /// Emits and waits until every subscriber has settled.
    pub async fn emit_and_await(&self, event: &str, data: Value) -> EmitReport {
        let callbacks = self.prepare(event);
        let mut report = EmitReport::default();
        let mut pending: Vec<JoinHandle<EventResult>> = Vec::new();

        for callback in callbacks {
            match callback {
                EventCallback::Sync(f) => {
                    if invoke_sync(event, &f, &data) {
                        report.delivered += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                EventCallback::Async(f) => match spawn_async(event, &f, data.clone()) {
                    Some(handle) => pending.push(handle),
                    None => report.failed += 1,
                },
            }
        }

        for handle in pending {
            if settle(event, handle).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }

        self.record_failures(report.failed as u64);
        report
    }

    /// Timing-aware emission used for beat events.
    ///
    /// `immediate` and `wait-for-signal` beats are delivered before the
    /// executor moves on; deferred timings are delivered on a later tick.
    /// The beat's dynamics and timing are added to object payloads.
    /// Returns `None` when delivery was deferred.
    pub async fn emit_musical(
        &self,
        event: &str,
        mut data: Value,
        dynamics: Dynamics,
        timing: Timing,
    ) -> Option<EmitReport> {
        if let Value::Object(map) = &mut data {
            map.insert("dynamics".to_string(), Value::from(dynamics.as_str()));
            map.insert("timing".to_string(), Value::from(timing.as_str()));
        }
        trace!("Musical emit '{}' ({}, {})", event, dynamics, timing);

        match timing {
            Timing::Immediate | Timing::WaitForSignal => Some(self.emit_and_await(event, data).await),
            Timing::AfterBeat | Timing::NextTick | Timing::Delayed => {
                let bus = self.clone();
                let event = event.to_string();
                spawn_detached(async move {
                    tokio::task::yield_now().await;
                    bus.emit_and_await(&event, data).await;
                });
                None
            }
        }
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        lock(&self.state)
            .subscribers
            .get(event)
            .map_or(0, |entries| entries.len())
    }

    pub fn debug_info(&self) -> BusDebugInfo {
        let state = lock(&self.state);
        BusDebugInfo {
            total_emitted: state.total_emitted,
            failed_deliveries: state.failed_deliveries,
            subscriber_counts: state
                .subscribers
                .iter()
                .map(|(event, entries)| (event.clone(), entries.len()))
                .collect(),
            emitted_by_event: state
                .emitted_by_event
                .iter()
                .map(|(event, count)| (event.clone(), *count))
                .collect(),
        }
    }

    /// Removes every subscriber.
    pub fn clear(&self) {
        lock(&self.state).subscribers.clear();
    }

    /// Counts the emission and snapshots the callbacks so none run under
    /// the lock.
    fn prepare(&self, event: &str) -> Vec<EventCallback> {
        let mut state = lock(&self.state);
        state.total_emitted += 1;
        *state.emitted_by_event.entry(event.to_string()).or_insert(0) += 1;
        state
            .subscribers
            .get(event)
            .map(|entries| entries.iter().map(|entry| entry.callback.clone()).collect())
            .unwrap_or_default()
    }

    fn record_failures(&self, failed: u64) {
        if failed > 0 {
            lock(&self.state).failed_deliveries += failed;
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("events", &lock(&self.state).subscribers.len())
            .finish()
    }
}

/// Runs a synchronous subscriber, containing errors and panics.
fn invoke_sync(event: &str, callback: &Arc<SyncCallback>, data: &Value) -> bool {
    match catch_unwind(AssertUnwindSafe(|| callback(data))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Subscriber for '{}' failed: {}", event, e);
            false
        }
        Err(_) => {
            warn!("Subscriber for '{}' panicked", event);
            false
        }
    }
}

/// Starts an asynchronous subscriber on its own task.
fn spawn_async(event: &str, callback: &Arc<AsyncCallback>, data: Value) -> Option<JoinHandle<EventResult>> {
    let Ok(handle) = Handle::try_current() else {
        warn!("No async runtime; dropping async subscriber for '{}'", event);
        return None;
    };
    match catch_unwind(AssertUnwindSafe(|| callback(data))) {
        Ok(future) => Some(handle.spawn(future)),
        Err(_) => {
            warn!("Subscriber for '{}' panicked", event);
            None
        }
    }
}

async fn settle(event: &str, handle: JoinHandle<EventResult>) -> bool {
    match handle.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("Subscriber for '{}' failed: {}", event, e);
            false
        }
        Err(e) => {
            warn!("Subscriber for '{}' did not settle: {}", event, e);
            false
        }
    }
}

fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("No async runtime; deferred delivery dropped"),
    }
}
