//! Plugin Interface
//!
//! - [`handler`]: handler callables and the per-beat invocation they receive
//! - [`mount`]: mount validation and the plugin registry

pub mod handler;
pub mod mount;

pub use handler::{BeatInvocation, Handler, HandlerFuture, HandlerMap, HandlerResult};
pub use mount::{validate_mount, MountResult, MountedPlugin, PluginRegistry};
