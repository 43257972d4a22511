//! Sequence Execution Module
//!
//! The orchestrator and everything it keeps per execution.
//!
//! # Architecture
//!
//! - [`engine`]: [`Conductor`], admission, scheduling and lifecycle
//! - [`beat`]: Timing gates and single-beat execution
//! - [`context`]: Request ids, priorities, the baton and control channels
//! - [`resources`]: Resource ownership and conflict resolution
//! - [`queue`]: Priority-ordered queue of waiting executions
//! - [`instances`]: Per-sequence instance bookkeeping
//! - [`mutation`]: Declarative mutations handed to an injected sink

pub mod beat;
pub mod context;
pub mod engine;
pub mod instances;
pub mod mutation;
pub mod queue;
pub mod resources;

pub use beat::beat_interval;
pub use context::{Baton, ExecutionControl, ExecutionStatus, Priority, RequestId, SequenceExecutionContext};
pub use engine::{Conductor, QueueStatus, CORRELATION_CLEANUP_PLUGIN};
pub use instances::SequenceInstance;
pub use mutation::{MutationBuffer, MutationOp, MutationSink};
pub use queue::QueuedSummary;
pub use resources::{ClaimOutcome, ConflictType, ResourceManager, ResourceOwner};
