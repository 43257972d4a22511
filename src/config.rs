//! Conductor Configuration
//!
//! Tunables for the orchestrator. Every field has a default, so a config
//! file only needs the values it changes:
//!
//! ```yaml
//! maxConcurrent: 2
//! conflictPolicy:
//!   sameResource: queue
//!   instanceConflict: reject
//! signalTimeoutMs: 5000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::execution::resources::ConflictType;

/// Default cap on concurrently active executions (one per CPU).
pub static DEFAULT_MAX_CONCURRENT: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));

/// Default number of finished executions kept in statistics.
pub const DEFAULT_STATISTICS_WINDOW: usize = 100;

/// Default retention of finished sequence instances.
pub const DEFAULT_INSTANCE_RETENTION_MS: u64 = 30_000;

/// Default time a `wait-for-signal` beat waits.
pub const DEFAULT_SIGNAL_TIMEOUT_MS: u64 = 30_000;

/// What to do when a lower-or-equal priority request hits an owned resource.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictAction {
    Queue,
    Reject,
}

/// Per-conflict-type resolution policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConflictPolicy {
    /// A different sequence at equal priority owns the resource
    pub same_resource: ConflictAction,
    /// A different sequence at higher priority owns the resource
    pub priority_conflict: ConflictAction,
    /// Another instance of the same sequence owns the resource
    pub instance_conflict: ConflictAction,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            same_resource: ConflictAction::Queue,
            priority_conflict: ConflictAction::Queue,
            instance_conflict: ConflictAction::Queue,
        }
    }
}

impl ConflictPolicy {
    pub fn action_for(&self, conflict: ConflictType) -> ConflictAction {
        match conflict {
            ConflictType::SameResource => self.same_resource,
            ConflictType::PriorityConflict => self.priority_conflict,
            ConflictType::InstanceConflict => self.instance_conflict,
        }
    }

    /// Same policy with one conflict type overridden.
    pub fn with(mut self, conflict: ConflictType, action: ConflictAction) -> Self {
        match conflict {
            ConflictType::SameResource => self.same_resource = action,
            ConflictType::PriorityConflict => self.priority_conflict = action,
            ConflictType::InstanceConflict => self.instance_conflict = action,
        }
        self
    }
}

/// Orchestrator configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConductorConfig {
    /// Executions beyond this wait in the queue (`chained` bypasses the cap)
    pub max_concurrent: usize,
    pub conflict_policy: ConflictPolicy,
    /// Finished executions kept for `statistics()`
    pub statistics_window: usize,
    /// How long finished instances stay listed
    pub instance_retention_ms: u64,
    /// How long a `wait-for-signal` beat waits before failing
    pub signal_timeout_ms: u64,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: *DEFAULT_MAX_CONCURRENT,
            conflict_policy: ConflictPolicy::default(),
            statistics_window: DEFAULT_STATISTICS_WINDOW,
            instance_retention_ms: DEFAULT_INSTANCE_RETENTION_MS,
            signal_timeout_ms: DEFAULT_SIGNAL_TIMEOUT_MS,
        }
    }
}

impl ConductorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ConductorConfig = serde_yaml::from_str(content)?;
        Ok(config.normalized())
    }

    /// Loads a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&content)?;
        info!("Loaded conductor config from {}", path.display());
        Ok(config)
    }

    /// Sets the maximum number of concurrently active executions.
    pub fn set_max_concurrent(&mut self, max: usize) {
        self.max_concurrent = max.max(1);
    }

    pub fn set_conflict_policy(&mut self, policy: ConflictPolicy) {
        self.conflict_policy = policy;
    }

    pub fn set_statistics_window(&mut self, window: usize) {
        self.statistics_window = window;
    }

    pub fn set_instance_retention(&mut self, retention: Duration) {
        self.instance_retention_ms = retention.as_millis() as u64;
    }

    pub fn set_signal_timeout(&mut self, timeout: Duration) {
        self.signal_timeout_ms = timeout.as_millis() as u64;
    }

    pub fn instance_retention(&self) -> Duration {
        Duration::from_millis(self.instance_retention_ms)
    }

    pub fn signal_timeout(&self) -> Duration {
        Duration::from_millis(self.signal_timeout_ms)
    }

    fn normalized(mut self) -> Self {
        self.max_concurrent = self.max_concurrent.max(1);
        self
    }
}
