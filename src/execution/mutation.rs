//! Mutation Hand-off
//!
//! Handlers describe visual changes as declarative [`MutationOp`]s instead
//! of applying them. After each beat the executor hands the ordered batch
//! to the injected [`MutationSink`], if any. The conductor never interprets
//! the operations.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::context::RequestId;
use crate::sequence::Beat;
use crate::sync::lock;

/// One declarative change for the mutation collaborator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationOp {
    /// What the change applies to (e.g. an element selector)
    pub target: String,
    /// Operation name understood by the sink
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl MutationOp {
    pub fn new(target: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            target: target.into(),
            kind: kind.into(),
            payload,
        }
    }
}

/// Receives the mutation batch produced by a beat.
pub trait MutationSink: Send + Sync {
    fn apply(&self, request_id: &RequestId, beat: &Beat, ops: &[MutationOp]);
}

/// Per-beat buffer filled through [`BeatInvocation::mutate`](crate::plugin::BeatInvocation::mutate).
#[derive(Debug, Clone, Default)]
pub struct MutationBuffer {
    ops: Arc<Mutex<Vec<MutationOp>>>,
}

impl MutationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, op: MutationOp) {
        lock(&self.ops).push(op);
    }

    /// Takes the buffered operations in push order.
    pub fn take(&self) -> Vec<MutationOp> {
        std::mem::take(&mut *lock(&self.ops))
    }

    pub fn len(&self) -> usize {
        lock(&self.ops).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.ops).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_buffer_keeps_push_order() {
        let buffer = MutationBuffer::new();
        buffer.push(MutationOp::new("#a", "addClass", json!("on")));
        buffer.push(MutationOp::new("#b", "remove", Value::Null));

        let ops = buffer.take();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].target, "#a");
        assert_eq!(ops[1].kind, "remove");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_op_deserialize_without_payload() {
        let op: MutationOp = serde_json::from_value(json!({"target": "#x", "kind": "hide"})).unwrap();
        assert_eq!(op.payload, Value::Null);
    }
}
