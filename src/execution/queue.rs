//! Execution Queue
//!
//! Pending executions ordered by priority (HIGH before NORMAL), first in
//! first out within a priority. Chained requests never enter the queue.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::context::{Priority, RequestId, SequenceExecutionContext};

/// Diagnostic view of a queued or active execution.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueuedSummary {
    pub request_id: RequestId,
    pub sequence_id: String,
    pub priority: Priority,
    pub since: DateTime<Utc>,
}

struct QueueEntry {
    order: u64,
    context: SequenceExecutionContext,
}

impl QueueEntry {
    fn key(&self) -> (u8, Reverse<u64>) {
        (self.context.priority.rank(), Reverse(self.order))
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
pub struct ExecutionQueue {
    heap: BinaryHeap<QueueEntry>,
    next_order: u64,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, context: SequenceExecutionContext) {
        let order = self.next_order;
        self.next_order += 1;
        self.heap.push(QueueEntry { order, context });
    }

    /// Removes the highest-priority entry.
    pub fn pop(&mut self) -> Option<SequenceExecutionContext> {
        self.heap.pop().map(|entry| entry.context)
    }

    /// Removes every entry, highest priority first.
    pub fn drain_ordered(&mut self) -> Vec<SequenceExecutionContext> {
        let mut entries = std::mem::take(&mut self.heap).into_sorted_vec();
        entries.reverse();
        entries.into_iter().map(|entry| entry.context).collect()
    }

    /// Puts back entries taken with [`drain_ordered`](Self::drain_ordered),
    /// keeping their relative order.
    pub fn restore(&mut self, contexts: Vec<SequenceExecutionContext>) {
        for context in contexts {
            self.push(context);
        }
    }

    /// Removes a specific request, if queued.
    pub fn remove(&mut self, request_id: &RequestId) -> Option<SequenceExecutionContext> {
        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut removed = None;
        for entry in entries {
            if removed.is_none() && entry.context.request_id == *request_id {
                removed = Some(entry.context);
            } else {
                self.heap.push(entry);
            }
        }
        removed
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.heap.iter().any(|entry| entry.context.request_id == *request_id)
    }

    pub fn get(&self, request_id: &RequestId) -> Option<&SequenceExecutionContext> {
        self.heap
            .iter()
            .map(|entry| &entry.context)
            .find(|context| context.request_id == *request_id)
    }

    /// Queued requests in the order they would run.
    pub fn summaries(&self) -> Vec<QueuedSummary> {
        let mut entries: Vec<&QueueEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|entry| QueuedSummary {
                request_id: entry.context.request_id.clone(),
                sequence_id: entry.context.sequence.id.clone(),
                priority: entry.context.priority,
                since: entry.context.created_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
