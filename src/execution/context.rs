//! Execution Context
//!
//! Per-request state owned by the executor: identity, priority, cursor,
//! the shared baton, and the control channels used for cancellation,
//! signals and status observation.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::plugin::HandlerMap;
use crate::sequence::Sequence;
use crate::sync::lock;

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of one `play`/`start_sequence` request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh id for a request against `sequence_id`.
    pub fn generate(sequence_id: &str) -> Self {
        let n = NEXT_REQUEST.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "{}-{}-{:x}",
            sequence_id,
            n,
            Utc::now().timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Scheduling priority of a request.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    #[default]
    Normal,
    /// Runs inline inside the calling beat instead of being queued
    Chained,
}

impl Priority {
    /// Weight used for queue ordering and conflict resolution.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 2,
            Self::Normal | Self::Chained => 1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Chained => "CHAINED",
        };
        f.write_str(text)
    }
}

/// Lifecycle state of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Lifecycle event emitted when an execution reaches this state.
    pub fn lifecycle_event(&self) -> Option<&'static str> {
        match self {
            Self::Completed => Some(crate::events::SEQUENCE_COMPLETED),
            Self::Failed => Some(crate::events::SEQUENCE_FAILED),
            Self::Cancelled => Some(crate::events::SEQUENCE_CANCELLED),
            Self::Pending | Self::Active => None,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(text)
    }
}

/// The mutable payload threaded through a sequence's beats.
///
/// Cloning a `Baton` shares the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct Baton {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl Baton {
    /// Wraps start data. Non-object data is kept under `"payload"`.
    pub fn new(data: Value) -> Self {
        let map = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_string(), other);
                map
            }
        };
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.inner).get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        lock(&self.inner).insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        lock(&self.inner).remove(key)
    }

    /// Shallow-merges an object into the baton.
    ///
    /// Returns `false` (and changes nothing) for non-object values.
    pub fn merge(&self, partial: Value) -> bool {
        match partial {
            Value::Object(fields) => {
                let mut map = lock(&self.inner);
                for (key, value) in fields {
                    map.insert(key, value);
                }
                true
            }
            Value::Null => true,
            _ => false,
        }
    }

    /// Looks up a JSON pointer (`/a/0/b`) inside the baton.
    pub fn pointer(&self, pointer: &str) -> Option<Value> {
        self.snapshot().pointer(pointer).cloned()
    }

    /// A copy of the current contents.
    pub fn snapshot(&self) -> Value {
        Value::Object(lock(&self.inner).clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }
}

/// Cancellation, signals and status for one execution.
#[derive(Debug)]
pub struct ExecutionControl {
    cancel_tx: watch::Sender<bool>,
    signals_tx: watch::Sender<HashSet<String>>,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let (signals_tx, _) = watch::channel(HashSet::new());
        let (status_tx, _) = watch::channel(ExecutionStatus::Pending);
        Self {
            cancel_tx,
            signals_tx,
            status_tx,
        }
    }

    /// Requests cooperative cancellation. Returns `false` if already requested.
    pub fn cancel(&self) -> bool {
        !self.cancel_tx.send_replace(true)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Raises a named signal for `wait-for-signal` beats.
    pub fn raise(&self, signal: &str) {
        self.signals_tx.send_modify(|signals| {
            signals.insert(signal.to_string());
        });
    }

    pub fn has_signal(&self, signal: &str) -> bool {
        self.signals_tx.borrow().contains(signal)
    }

    /// Resolves once `signal` has been raised.
    pub async fn signal(&self, signal: &str) {
        let mut rx = self.signals_tx.subscribe();
        let _ = rx.wait_for(|signals| signals.contains(signal)).await;
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        self.status_tx.send_replace(status);
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ExecutionStatus> {
        self.status_tx.subscribe()
    }
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

/// State of one sequence execution, owned by the executor.
#[derive(Debug, Clone)]
pub struct SequenceExecutionContext {
    pub request_id: RequestId,
    pub sequence: Arc<Sequence>,
    pub plugin_id: Option<String>,
    pub priority: Priority,
    /// Executions whose beats started this one, nearest first
    pub ancestors: Vec<RequestId>,
    /// Movement index of the beat currently running
    pub movement_index: usize,
    /// Beat number currently running
    pub beat: Option<u32>,
    pub baton: Baton,
    pub status: ExecutionStatus,
    pub resources: Vec<String>,
    pub correlation_ids: Vec<String>,
    pub fingerprint: String,
    pub instance_number: u32,
    pub handlers: Option<Arc<HandlerMap>>,
    pub control: Arc<ExecutionControl>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SequenceExecutionContext {
    pub fn new(request_id: RequestId, sequence: Arc<Sequence>, data: Value, priority: Priority) -> Self {
        Self {
            request_id,
            sequence,
            plugin_id: None,
            priority,
            ancestors: Vec::new(),
            movement_index: 0,
            beat: None,
            baton: Baton::new(data),
            status: ExecutionStatus::Pending,
            resources: Vec::new(),
            correlation_ids: Vec::new(),
            fingerprint: String::new(),
            instance_number: 0,
            handlers: None,
            control: Arc::new(ExecutionControl::new()),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn sequence_id(&self) -> &str {
        &self.sequence.id
    }

    /// Instance label distinguishing concurrent runs of one sequence.
    pub fn instance_id(&self) -> String {
        format!("{}#{}", self.sequence.id, self.instance_number)
    }

    /// Moves to `status`. Terminal states are only observable through
    /// [`ExecutionControl`] once [`publish`](Self::publish) is called, after
    /// cleanup has run.
    pub(crate) fn transition(&mut self, status: ExecutionStatus) {
        self.status = status;
        match status {
            ExecutionStatus::Active => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        if !status.is_terminal() {
            self.control.set_status(status);
        }
    }

    pub(crate) fn publish(&self) {
        self.control.set_status(self.status);
    }

    /// Wall-clock duration between activation and termination.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{Beat, Movement};
    use serde_json::json;

    fn sequence() -> Arc<Sequence> {
        Arc::new(
            Sequence::new("seq", "Seq")
                .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "e", "h"))),
        )
    }

    #[test]
    fn test_request_ids_unique() {
        let a = RequestId::generate("seq");
        let b = RequestId::generate("seq");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("seq-"));
    }

    #[test]
    fn test_priority_rank() {
        assert!(Priority::High.rank() > Priority::Normal.rank());
        assert_eq!(Priority::Chained.rank(), Priority::Normal.rank());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_status_terminal() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Active.is_terminal());
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert_eq!(
            ExecutionStatus::Failed.lifecycle_event(),
            Some("sequence-failed")
        );
    }

    #[test]
    fn test_baton_wraps_non_object() {
        let baton = Baton::new(json!(5));
        assert_eq!(baton.get("payload"), Some(json!(5)));
        assert!(Baton::new(Value::Null).is_empty());
    }

    #[test]
    fn test_baton_merge() {
        let baton = Baton::new(json!({"x": 1}));
        assert!(baton.merge(json!({"y": 2, "x": 3})));
        assert!(!baton.merge(json!("scalar")));

        assert_eq!(baton.snapshot(), json!({"x": 3, "y": 2}));
    }

    #[test]
    fn test_baton_clone_shares_state() {
        let baton = Baton::new(json!({}));
        let shared = baton.clone();
        shared.set("k", json!(true));
        assert_eq!(baton.get("k"), Some(json!(true)));
    }

    #[test]
    fn test_baton_pointer() {
        let baton = Baton::new(json!({"items": [{"id": "a"}]}));
        assert_eq!(baton.pointer("/items/0/id"), Some(json!("a")));
        assert_eq!(baton.pointer("/items/3"), None);
    }

    #[test]
    fn test_control_cancel_once() {
        let control = ExecutionControl::new();
        assert!(control.cancel());
        assert!(!control.cancel());
        assert!(control.is_cancelled());
    }

    #[tokio::test]
    async fn test_control_signal_wait() {
        let control = Arc::new(ExecutionControl::new());
        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.signal("ready").await })
        };

        control.raise("ready");
        waiter.await.unwrap();
        assert!(control.has_signal("ready"));
    }

    #[tokio::test]
    async fn test_control_cancelled_resolves() {
        let control = Arc::new(ExecutionControl::new());
        control.cancel();
        control.cancelled().await;
    }

    #[test]
    fn test_context_transitions_stamp_times() {
        let mut ctx = SequenceExecutionContext::new(
            RequestId::generate("seq"),
            sequence(),
            json!({"x": 1}),
            Priority::Normal,
        );
        let status_rx = ctx.control.subscribe_status();

        ctx.transition(ExecutionStatus::Active);
        assert!(ctx.started_at.is_some());
        assert_eq!(*status_rx.borrow(), ExecutionStatus::Active);
        ctx.transition(ExecutionStatus::Completed);
        assert!(ctx.finished_at.is_some());
        assert!(ctx.duration_ms().unwrap() >= 0);
        assert_eq!(*status_rx.borrow(), ExecutionStatus::Active);

        ctx.publish();
        assert_eq!(*status_rx.borrow(), ExecutionStatus::Completed);
    }

    #[test]
    fn test_instance_id() {
        let mut ctx =
            SequenceExecutionContext::new(RequestId::from("r"), sequence(), json!({}), Priority::High);
        ctx.instance_number = 3;
        assert_eq!(ctx.instance_id(), "seq#3");
    }
}
