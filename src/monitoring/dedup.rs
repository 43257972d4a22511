//! Duplicate Request Detection
//!
//! Two start requests are equivalent when they target the same sequence id
//! with structurally equal start data. Object key order does not matter;
//! callback tokens are ordinary data, so requests carrying different
//! callbacks never match. Only in-flight requests are tracked.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde_json::Value;

use crate::execution::context::RequestId;

/// Structural hash of `(sequence_id, data)` as lowercase hex.
pub fn fingerprint(sequence_id: &str, data: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    sequence_id.hash(&mut hasher);
    hash_value(data, &mut hasher);
    format!("{:016x}", hasher.finish())
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            2u8.hash(state);
            n.to_string().hash(state);
        }
        Value::String(s) => {
            3u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            map.len().hash(state);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(state);
                hash_value(&map[key.as_str()], state);
            }
        }
    }
}

/// Maps fingerprints of in-flight requests to their request ids.
#[derive(Debug, Default)]
pub struct DuplicationDetector {
    in_flight: HashMap<String, RequestId>,
}

impl DuplicationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The in-flight request equivalent to `fingerprint`, if any.
    pub fn find(&self, fingerprint: &str) -> Option<&RequestId> {
        self.in_flight.get(fingerprint)
    }

    pub fn track(&mut self, fingerprint: &str, request_id: &RequestId) {
        self.in_flight.insert(fingerprint.to_string(), request_id.clone());
    }

    /// Stops tracking `fingerprint` if it still points at `request_id`.
    pub fn forget(&mut self, fingerprint: &str, request_id: &RequestId) -> bool {
        if self.in_flight.get(fingerprint) == Some(request_id) {
            self.in_flight.remove(fingerprint);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn clear(&mut self) {
        self.in_flight.clear();
    }
}
