//! Sequence Definition Module
//!
//! Data structures and utilities for defining, loading, validating and
//! registering sequences.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Sequence, Movement, Beat)
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Structural and mount-time validation rules
//! - [`registry`]: Id- and name-indexed store of validated sequences

pub mod model;
pub mod parser;
pub mod registry;
pub mod validator;

pub use model::{Beat, Dynamics, ErrorHandling, Movement, Sequence, Timing};
pub use parser::{load_sequences, save_sequence};
pub use registry::SequenceRegistry;
pub use validator::{validate_handlers, validate_sequence, ValidationIssue};
