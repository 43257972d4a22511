//! Sequence Registry
//!
//! Holds validated sequence definitions, indexed by id and by display name.
//! Definitions are shared as `Arc<Sequence>` so in-flight executions keep
//! the version they started with even if the id is re-registered.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use super::model::Sequence;
use super::validator::validate_sequence;
use crate::error::{ConductorError, Result};

#[derive(Debug, Default)]
pub struct SequenceRegistry {
    by_id: HashMap<String, Arc<Sequence>>,
    by_name: HashMap<String, String>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores a sequence, replacing any previous definition
    /// with the same id.
    pub fn register(&mut self, sequence: Sequence) -> Result<Arc<Sequence>> {
        validate_sequence(&sequence).map_err(|issues| ConductorError::Validation {
            sequence_id: sequence.id.clone(),
            issues,
        })?;

        Ok(self.insert(sequence))
    }

    /// Stores an already-validated sequence.
    pub(crate) fn insert(&mut self, sequence: Sequence) -> Arc<Sequence> {
        if let Some(previous) = self.by_id.get(&sequence.id) {
            info!("Replacing sequence definition '{}'", sequence.id);
            let previous_name = previous.name.clone();
            self.by_name.remove(&previous_name);
        }

        if !sequence.name.is_empty() {
            self.by_name.insert(sequence.name.clone(), sequence.id.clone());
        }

        debug!(
            "Registered sequence '{}' ({} beats)",
            sequence.id,
            sequence.beat_count()
        );

        let sequence = Arc::new(sequence);
        self.by_id.insert(sequence.id.clone(), Arc::clone(&sequence));
        sequence
    }

    /// Removes a sequence. Returns the removed definition, if any.
    pub fn unregister(&mut self, id: &str) -> Option<Arc<Sequence>> {
        let removed = self.by_id.remove(id)?;
        if self.by_name.get(&removed.name).is_some_and(|owner| owner == id) {
            self.by_name.remove(&removed.name);
        }
        info!("Unregistered sequence '{}'", id);
        Some(removed)
    }

    /// Gets a sequence by id.
    pub fn get(&self, id: &str) -> Option<Arc<Sequence>> {
        self.by_id.get(id).cloned()
    }

    /// Resolves a sequence by id, falling back to its display name.
    pub fn resolve(&self, id_or_name: &str) -> Result<Arc<Sequence>> {
        if let Some(sequence) = self.by_id.get(id_or_name) {
            return Ok(Arc::clone(sequence));
        }

        self.by_name
            .get(id_or_name)
            .and_then(|id| self.by_id.get(id))
            .cloned()
            .ok_or_else(|| ConductorError::SequenceNotFound(id_or_name.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
