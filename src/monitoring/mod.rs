//! Monitoring
//!
//! Bookkeeping kept alongside execution: counters and a window of
//! finished executions, duplicate detection, and per-beat timelines.

pub mod dedup;
pub mod statistics;
pub mod timeline;

pub use dedup::{fingerprint, DuplicationDetector};
pub use statistics::{ExecutionRecord, Statistics, StatisticsSnapshot};
pub use timeline::{beat_label, BeatPhase, ExecutionTimeline, TimelineEvent};
