//! Conductor - Sequence Orchestration Engine
//!
//! Plugins describe multi-step UI workflows as *sequences*: ordered
//! movements of beats, each beat bound to a named handler. The conductor
//! validates and mounts them, then plays requests against them while
//! keeping concurrent executions from trampling shared resources.
//!
//! # Architecture
//!
//! - [`sequence`]: Sequence definitions, loading, validation and registry
//! - [`plugin`]: Handlers, mount validation and the plugin registry
//! - [`execution`]: The [`Conductor`], scheduling, resources and beat execution
//! - [`events`]: Publish/subscribe bus with musical dynamics and timing
//! - [`callbacks`]: Correlation registry keeping callbacks out of payloads
//! - [`monitoring`]: Statistics, duplicate detection and beat timelines
//! - [`config`]: Orchestrator configuration
//!
//! # Example
//!
//! ```rust,no_run
//! use conductor::{load_sequences, Conductor, ConductorConfig, Handler, HandlerMap, Priority};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conductor = Conductor::new(ConductorConfig::load("conductor.yaml")?);
//!
//!     for sequence in load_sequences("sequences/drag.yaml")? {
//!         let handlers = HandlerMap::new()
//!             .with("start", Handler::sync(|_| Ok(Some(json!({"dragging": true})))))
//!             .with("end", Handler::sync(|_| Ok(None)));
//!         conductor.mount(sequence, handlers, Some("canvas"));
//!     }
//!
//!     let request = conductor
//!         .play("canvas", "drag", json!({"elementId": "rect-1"}), Priority::Normal)
//!         .await?;
//!     conductor.wait_for(&request).await?;
//!     Ok(())
//! }
//! ```

pub mod callbacks;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod monitoring;
pub mod plugin;
pub mod sequence;

mod sync;

// Re-export commonly used types
pub use callbacks::{Callback, CallbackRegistry, Payload};
pub use config::ConductorConfig;
pub use error::{ConductorError, CorrelationError, HandlerError, Result};
pub use events::EventBus;
pub use execution::{Conductor, ExecutionStatus, Priority, RequestId};
pub use plugin::{BeatInvocation, Handler, HandlerMap, MountResult};
pub use sequence::model::{Beat, Movement, Sequence};
pub use sequence::parser::load_sequences;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Conductor";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Conductor");
    }

    #[test]
    fn test_module_exports_beat() {
        let beat = Beat::new(1, "drag:start", "onDragStart");
        assert_eq!(beat.beat, 1);
        assert_eq!(beat.handler, "onDragStart");
    }

    #[test]
    fn test_module_exports_sequence() {
        let sequence = Sequence::new("drag", "Drag");
        assert!(sequence.movements.is_empty());
        assert_eq!(sequence.display_name(), "Drag");
    }
}
