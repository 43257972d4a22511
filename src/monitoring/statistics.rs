//! Execution Statistics
//!
//! Running counters plus a bounded window of finished executions.
//! Nothing here is persisted.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::execution::context::{ExecutionStatus, Priority, RequestId};

/// Summary of one finished execution.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub request_id: RequestId,
    pub sequence_id: String,
    pub plugin_id: Option<String>,
    pub priority: Priority,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub beats_executed: usize,
    pub beats_errored: usize,
    /// Milliseconds per `movement/beat`
    pub beat_durations: BTreeMap<String, u128>,
    pub error: Option<String>,
}

/// Point-in-time view returned by `Conductor::statistics`.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub total_started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub queued: u64,
    pub rejected: u64,
    pub duplicates_prevented: u64,
    pub beats_executed: u64,
    pub beats_errored: u64,
    pub average_duration_ms: f64,
    pub active: usize,
    pub queue_length: usize,
    pub recent: Vec<ExecutionRecord>,
}

#[derive(Debug)]
pub struct Statistics {
    total_started: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    queued: u64,
    rejected: u64,
    duplicates_prevented: u64,
    beats_executed: u64,
    beats_errored: u64,
    total_duration_ms: i64,
    timed: u64,
    window: usize,
    recent: VecDeque<ExecutionRecord>,
}

impl Statistics {
    pub fn new(window: usize) -> Self {
        Self {
            total_started: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            queued: 0,
            rejected: 0,
            duplicates_prevented: 0,
            beats_executed: 0,
            beats_errored: 0,
            total_duration_ms: 0,
            timed: 0,
            window,
            recent: VecDeque::new(),
        }
    }

    pub fn set_window(&mut self, window: usize) {
        self.window = window;
        self.trim();
    }

    pub fn record_started(&mut self) {
        self.total_started += 1;
    }

    pub fn record_queued(&mut self) {
        self.queued += 1;
    }

    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.duplicates_prevented += 1;
    }

    pub fn record_beat(&mut self, errored: bool) {
        self.beats_executed += 1;
        if errored {
            self.beats_errored += 1;
        }
    }

    /// Counts a terminal execution and pushes it into the window.
    pub fn record_finished(&mut self, record: ExecutionRecord) {
        match record.status {
            ExecutionStatus::Completed => self.completed += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
            ExecutionStatus::Pending | ExecutionStatus::Active => {}
        }
        if let Some(ms) = record.duration_ms {
            self.total_duration_ms += ms;
            self.timed += 1;
        }
        self.recent.push_back(record);
        self.trim();
    }

    /// Most recent record for `request_id` still in the window.
    pub fn find(&self, request_id: &RequestId) -> Option<&ExecutionRecord> {
        self.recent
            .iter()
            .rev()
            .find(|record| record.request_id == *request_id)
    }

    pub fn snapshot(&self, active: usize, queue_length: usize) -> StatisticsSnapshot {
        let average_duration_ms = if self.timed == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.timed as f64
        };

        StatisticsSnapshot {
            total_started: self.total_started,
            completed: self.completed,
            failed: self.failed,
            cancelled: self.cancelled,
            queued: self.queued,
            rejected: self.rejected,
            duplicates_prevented: self.duplicates_prevented,
            beats_executed: self.beats_executed,
            beats_errored: self.beats_errored,
            average_duration_ms,
            active,
            queue_length,
            recent: self.recent.iter().cloned().collect(),
        }
    }

    fn trim(&mut self) {
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }
}
