//! Callback Correlation
//!
//! Start data is cloned by value on its way into an execution (it becomes a
//! plain `serde_json::Value` baton), so closures cannot ride along. Before a
//! `play` payload crosses that boundary, every [`Callback`] inside it is
//! moved into the [`CallbackRegistry`] and replaced in place by a token:
//!
//! ```json
//! {"__conductorCallback": {"correlationId": "corr-3-18f2a", "path": "/items/0/onDone"}}
//! ```
//!
//! Downstream handlers turn tokens back into [`CallbackDelegate`]s that look
//! up and invoke the original closure. When a handler forwards a payload
//! that already carries tokens to a nested `play`, the nested request holds
//! those correlation ids too. Callbacks the handler adds on the way get an
//! id of their own, so they never shadow the caller's closures.
//!
//! Each execution carrying a correlation id holds one reference on it; the
//! reference is dropped when that execution emits its terminal lifecycle
//! event. The stored closures are purged once no execution references them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::error::CorrelationError;
use crate::sync::lock;

/// Object key marking a callback placeholder.
pub const CALLBACK_TOKEN_KEY: &str = "__conductorCallback";

static NEXT_CORRELATION: AtomicU64 = AtomicU64::new(1);

type CallbackFn = dyn Fn(Value) -> Value + Send + Sync;

/// A caller-supplied closure carried inside a `play` payload.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    pub fn call(&self, args: Value) -> Value {
        (self.0)(args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback")
    }
}

/// Start data that may contain callbacks at any depth.
///
/// # Example
///
/// ```
/// use conductor::callbacks::Payload;
/// use serde_json::json;
///
/// let payload = Payload::from(json!({"elementId": "btn-1"}))
///     .with("onComplete", Payload::callback(|result| result));
/// assert!(payload.has_callbacks());
/// ```
#[derive(Debug, Clone)]
pub enum Payload {
    Data(Value),
    Object(Vec<(String, Payload)>),
    Array(Vec<Payload>),
    Callback(Callback),
}

impl Payload {
    pub fn callback<F>(callback: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self::Callback(Callback::new(callback))
    }

    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Payload)>,
        K: Into<String>,
    {
        Self::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Payload>,
    {
        Self::Array(items.into_iter().collect())
    }

    /// Sets `key` on an object payload, replacing an existing entry.
    ///
    /// Null data becomes an empty object first; any other non-object
    /// payload is replaced by a fresh object.
    pub fn with(self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        let key = key.into();
        let value = value.into();
        let mut entries = match self {
            Self::Object(entries) => entries,
            Self::Data(Value::Object(map)) => map.into_iter().map(|(k, v)| (k, Self::Data(v))).collect(),
            Self::Data(Value::Null) => Vec::new(),
            other => {
                warn!("Replacing non-object payload {:?} with an object", other);
                Vec::new()
            }
        };

        match entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
        Self::Object(entries)
    }

    pub fn has_callbacks(&self) -> bool {
        match self {
            Self::Callback(_) => true,
            Self::Data(_) => false,
            Self::Object(entries) => entries.iter().any(|(_, v)| v.has_callbacks()),
            Self::Array(items) => items.iter().any(Payload::has_callbacks),
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<Callback> for Payload {
    fn from(callback: Callback) -> Self {
        Self::Callback(callback)
    }
}

/// Result of [`CallbackRegistry::protect`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedPayload {
    /// Payload with every callback replaced by a token
    pub data: Value,
    /// Correlation ids referenced by the payload's tokens
    pub correlation_ids: Vec<String>,
    /// Callbacks newly stored by this call
    pub stored: usize,
}

/// Invocable stand-in for a callback that crossed the clone boundary.
#[derive(Clone)]
pub struct CallbackDelegate {
    correlation_id: String,
    path: String,
    registry: CallbackRegistry,
}

impl CallbackDelegate {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Path at which the callback was originally found.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Invokes the original closure.
    pub fn invoke(&self, args: Value) -> Result<Value, CorrelationError> {
        self.registry.invoke(&self.correlation_id, &self.path, args)
    }
}

impl fmt::Debug for CallbackDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackDelegate")
            .field("correlation_id", &self.correlation_id)
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug)]
struct CorrelationEntry {
    callbacks: HashMap<String, Callback>,
    active: usize,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, CorrelationEntry>,
    purged: u64,
}

/// Reference-counted side table of callbacks keyed by correlation id.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves every callback in `payload` into the registry and returns the
    /// tokenised data.
    ///
    /// New callbacks are stored under a fresh correlation id, listed first
    /// in the result; ids of tokens already in the payload follow. The entry
    /// starts with no active references; see [`retain`](Self::retain).
    pub fn protect(&self, payload: Payload) -> ProtectedPayload {
        let mut correlation_ids = Vec::new();
        collect_payload_tokens(&payload, &mut correlation_ids);

        let target = if payload.has_callbacks() {
            generate_correlation_id()
        } else {
            String::new()
        };

        let mut found = Vec::new();
        let data = strip(payload, String::new(), &target, &mut found);
        let stored = found.len();

        if stored > 0 {
            let mut state = lock(&self.state);
            state.entries.insert(
                target.clone(),
                CorrelationEntry {
                    callbacks: found.into_iter().collect(),
                    active: 0,
                    created_at: Utc::now(),
                },
            );
            debug!("Stored {} callback(s) under correlation '{}'", stored, target);
            correlation_ids.insert(0, target);
        }

        ProtectedPayload {
            data,
            correlation_ids,
            stored,
        }
    }

    /// Adds one active reference. Returns `false` for unknown ids.
    pub fn retain(&self, correlation_id: &str) -> bool {
        let mut state = lock(&self.state);
        match state.entries.get_mut(correlation_id) {
            Some(entry) => {
                entry.active += 1;
                debug!(
                    "Correlation '{}' retained ({} active)",
                    correlation_id, entry.active
                );
                true
            }
            None => {
                warn!("Cannot retain unknown correlation '{}'", correlation_id);
                false
            }
        }
    }

    /// Drops one active reference, purging the entry when none remain.
    ///
    /// Returns `true` if this call purged the entry. Releasing an unknown
    /// or already-purged id is a no-op.
    pub fn release(&self, correlation_id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(entry) = state.entries.get_mut(correlation_id) else {
            return false;
        };

        entry.active = entry.active.saturating_sub(1);
        if entry.active > 0 {
            debug!(
                "Correlation '{}' released ({} still active)",
                correlation_id, entry.active
            );
            return false;
        }

        state.entries.remove(correlation_id);
        state.purged += 1;
        debug!("Correlation '{}' purged", correlation_id);
        true
    }

    /// Purges the entry if no execution holds a reference to it.
    pub fn release_if_unused(&self, correlation_id: &str) -> bool {
        let mut state = lock(&self.state);
        let unused = state
            .entries
            .get(correlation_id)
            .is_some_and(|entry| entry.active == 0);
        if unused {
            state.entries.remove(correlation_id);
            state.purged += 1;
            debug!("Correlation '{}' purged unused", correlation_id);
        }
        unused
    }

    /// Invokes the callback stored at `(correlation_id, path)`.
    pub fn invoke(&self, correlation_id: &str, path: &str, args: Value) -> Result<Value, CorrelationError> {
        let callback = {
            let state = lock(&self.state);
            let entry = state
                .entries
                .get(correlation_id)
                .ok_or_else(|| CorrelationError::UnknownCorrelation(correlation_id.to_string()))?;
            entry
                .callbacks
                .get(path)
                .cloned()
                .ok_or_else(|| CorrelationError::UnknownPath {
                    correlation_id: correlation_id.to_string(),
                    path: path.to_string(),
                })?
        };
        Ok(callback.call(args))
    }

    /// Finds every token in `value`, keyed by its current JSON pointer.
    pub fn rehydrate(&self, value: &Value) -> Vec<(String, CallbackDelegate)> {
        let mut found = Vec::new();
        self.rehydrate_into(value, String::new(), &mut found);
        found
    }

    fn rehydrate_into(&self, value: &Value, pointer: String, found: &mut Vec<(String, CallbackDelegate)>) {
        if let Some((correlation_id, path)) = parse_token(value) {
            found.push((
                pointer,
                CallbackDelegate {
                    correlation_id,
                    path,
                    registry: self.clone(),
                },
            ));
            return;
        }

        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    self.rehydrate_into(child, child_pointer(&pointer, key), found);
                }
            }
            Value::Array(items) => {
                for (index, child) in items.iter().enumerate() {
                    self.rehydrate_into(child, child_pointer(&pointer, &index.to_string()), found);
                }
            }
            _ => {}
        }
    }

    /// Delegate for the token at `pointer` inside `value`, if there is one.
    pub fn delegate_at(&self, value: &Value, pointer: &str) -> Option<CallbackDelegate> {
        let (correlation_id, path) = parse_token(value.pointer(pointer)?)?;
        Some(CallbackDelegate {
            correlation_id,
            path,
            registry: self.clone(),
        })
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        lock(&self.state).entries.contains_key(correlation_id)
    }

    pub fn active_count(&self, correlation_id: &str) -> Option<usize> {
        lock(&self.state)
            .entries
            .get(correlation_id)
            .map(|entry| entry.active)
    }

    /// When the entry was first created.
    pub fn created_at(&self, correlation_id: &str) -> Option<DateTime<Utc>> {
        lock(&self.state)
            .entries
            .get(correlation_id)
            .map(|entry| entry.created_at)
    }

    /// Number of live correlation entries.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    /// Entries purged since creation.
    pub fn purged_count(&self) -> u64 {
        lock(&self.state).purged
    }

    /// Drops every entry regardless of references.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        let count = state.entries.len() as u64;
        state.entries.clear();
        state.purged += count;
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("entries", &self.len())
            .finish()
    }
}

fn generate_correlation_id() -> String {
    let n = NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed);
    format!("corr-{}-{:x}", n, Utc::now().timestamp_millis())
}

/// Builds a placeholder token.
pub fn callback_token(correlation_id: &str, path: &str) -> Value {
    json!({
        CALLBACK_TOKEN_KEY: {
            "correlationId": correlation_id,
            "path": path,
        }
    })
}

/// Reads `(correlation_id, path)` out of a placeholder token.
pub fn parse_token(value: &Value) -> Option<(String, String)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let token = map.get(CALLBACK_TOKEN_KEY)?;
    let correlation_id = token.get("correlationId")?.as_str()?;
    let path = token.get("path")?.as_str()?;
    Some((correlation_id.to_string(), path.to_string()))
}

/// Extends a JSON pointer with one reference token (RFC 6901 escaping).
fn child_pointer(parent: &str, key: &str) -> String {
    format!("{}/{}", parent, key.replace('~', "~0").replace('/', "~1"))
}

fn collect_value_tokens(value: &Value, ids: &mut Vec<String>) {
    if let Some((correlation_id, _)) = parse_token(value) {
        if !ids.contains(&correlation_id) {
            ids.push(correlation_id);
        }
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|child| collect_value_tokens(child, ids)),
        Value::Array(items) => items.iter().for_each(|child| collect_value_tokens(child, ids)),
        _ => {}
    }
}

fn collect_payload_tokens(payload: &Payload, ids: &mut Vec<String>) {
    match payload {
        Payload::Data(value) => collect_value_tokens(value, ids),
        Payload::Object(entries) => entries
            .iter()
            .for_each(|(_, child)| collect_payload_tokens(child, ids)),
        Payload::Array(items) => items.iter().for_each(|child| collect_payload_tokens(child, ids)),
        Payload::Callback(_) => {}
    }
}

/// Converts a payload to plain data, swapping callbacks for tokens.
fn strip(payload: Payload, pointer: String, correlation_id: &str, found: &mut Vec<(String, Callback)>) -> Value {
    match payload {
        Payload::Data(value) => value,
        Payload::Callback(callback) => {
            let token = callback_token(correlation_id, &pointer);
            found.push((pointer, callback));
            token
        }
        Payload::Object(entries) => {
            let mut map = Map::new();
            for (key, child) in entries {
                let child_ptr = child_pointer(&pointer, &key);
                map.insert(key, strip(child, child_ptr, correlation_id, found));
            }
            Value::Object(map)
        }
        Payload::Array(items) => Value::Array(
            items
                .into_iter()
                .enumerate()
                .map(|(index, child)| {
                    strip(child, child_pointer(&pointer, &index.to_string()), correlation_id, found)
                })
                .collect(),
        ),
    }
}
