//! Sequence Instances
//!
//! Bookkeeping that tells concurrent runs of the same sequence apart.
//! Records are created at enqueue time, updated by the executor, and kept
//! for a retention period after they finish.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::context::{ExecutionStatus, RequestId};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SequenceInstance {
    pub request_id: RequestId,
    pub sequence_id: String,
    /// 1-based counter per sequence id
    pub instance_number: u32,
    pub status: ExecutionStatus,
    pub resources: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct TrackedInstance {
    record: SequenceInstance,
    finished: Option<Instant>,
}

#[derive(Debug)]
pub struct InstanceTracker {
    instances: HashMap<RequestId, TrackedInstance>,
    counters: HashMap<String, u32>,
    retention: Duration,
}

impl InstanceTracker {
    pub fn new(retention: Duration) -> Self {
        Self {
            instances: HashMap::new(),
            counters: HashMap::new(),
            retention,
        }
    }

    pub fn set_retention(&mut self, retention: Duration) {
        self.retention = retention;
    }

    /// Creates a pending record and returns its instance number.
    pub fn create(&mut self, request_id: &RequestId, sequence_id: &str, resources: &[String]) -> u32 {
        self.prune();

        let counter = self.counters.entry(sequence_id.to_string()).or_insert(0);
        *counter += 1;
        let instance_number = *counter;

        let now = Utc::now();
        self.instances.insert(
            request_id.clone(),
            TrackedInstance {
                record: SequenceInstance {
                    request_id: request_id.clone(),
                    sequence_id: sequence_id.to_string(),
                    instance_number,
                    status: ExecutionStatus::Pending,
                    resources: resources.to_vec(),
                    created_at: now,
                    updated_at: now,
                },
                finished: None,
            },
        );
        instance_number
    }

    pub fn update(&mut self, request_id: &RequestId, status: ExecutionStatus) {
        if let Some(tracked) = self.instances.get_mut(request_id) {
            tracked.record.status = status;
            tracked.record.updated_at = Utc::now();
            if status.is_terminal() {
                tracked.finished = Some(Instant::now());
            }
        }
    }

    pub fn get(&self, request_id: &RequestId) -> Option<&SequenceInstance> {
        self.instances.get(request_id).map(|tracked| &tracked.record)
    }

    /// Records for one sequence, ordered by instance number.
    pub fn for_sequence(&self, sequence_id: &str) -> Vec<SequenceInstance> {
        let mut records: Vec<SequenceInstance> = self
            .instances
            .values()
            .filter(|tracked| tracked.record.sequence_id == sequence_id)
            .map(|tracked| tracked.record.clone())
            .collect();
        records.sort_by_key(|record| record.instance_number);
        records
    }

    /// Drops finished records older than the retention period.
    pub fn prune(&mut self) {
        let retention = self.retention;
        self.instances.retain(|_, tracked| {
            tracked
                .finished
                .map_or(true, |finished| finished.elapsed() < retention)
        });
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
