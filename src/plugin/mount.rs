//! Plugin Mounting
//!
//! A mount pairs a sequence with the handler map that runs it. Before the
//! pair is trusted, the sequence is validated structurally and every beat's
//! handler name is resolved against the map. Failures come back as a
//! [`MountResult`] and leave the registries untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use super::handler::HandlerMap;
use crate::error::{ConductorError, Result};
use crate::sequence::{validate_handlers, validate_sequence, Sequence, ValidationIssue};

/// Outcome of `Conductor::mount`.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountResult {
    pub success: bool,
    pub plugin_id: String,
    pub sequence_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl MountResult {
    pub(crate) fn mounted(plugin_id: &str, sequence_id: &str) -> Self {
        Self {
            success: true,
            plugin_id: plugin_id.to_string(),
            sequence_id: sequence_id.to_string(),
            reason: None,
            issues: Vec::new(),
        }
    }

    pub(crate) fn rejected(plugin_id: &str, sequence_id: &str, issues: &[ValidationIssue]) -> Self {
        let issues: Vec<String> = issues.iter().map(ToString::to_string).collect();
        Self {
            success: false,
            plugin_id: plugin_id.to_string(),
            sequence_id: sequence_id.to_string(),
            reason: Some(format!("Invalid plugin shape: {}", issues.join("; "))),
            issues,
        }
    }
}

/// Runs every mount-time check and returns all violations at once.
pub fn validate_mount(sequence: &Sequence, handlers: &HandlerMap) -> std::result::Result<(), Vec<ValidationIssue>> {
    let mut issues = validate_sequence(sequence).err().unwrap_or_default();
    if let Err(missing) = validate_handlers(sequence, |name| handlers.contains(name)) {
        issues.extend(missing);
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// A mounted plugin and the handler maps of its sequences.
#[derive(Debug, Clone)]
pub struct MountedPlugin {
    pub id: String,
    /// Sequence id to the handlers it was mounted with
    handlers: BTreeMap<String, Arc<HandlerMap>>,
    pub mounted_at: DateTime<Utc>,
}

impl MountedPlugin {
    /// Mounted sequence ids, sorted.
    pub fn sequences(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, MountedPlugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an already-validated mount. Remounting a sequence under the
    /// same plugin replaces its handlers.
    pub fn insert(&mut self, plugin_id: &str, sequence_id: &str, handlers: HandlerMap) {
        let plugin = self
            .plugins
            .entry(plugin_id.to_string())
            .or_insert_with(|| MountedPlugin {
                id: plugin_id.to_string(),
                handlers: BTreeMap::new(),
                mounted_at: Utc::now(),
            });

        if plugin
            .handlers
            .insert(sequence_id.to_string(), Arc::new(handlers))
            .is_some()
        {
            warn!(
                "Plugin '{}' remounted sequence '{}'; handlers replaced",
                plugin_id, sequence_id
            );
        }
        debug!(
            "Plugin '{}' now mounts {} sequence(s)",
            plugin_id,
            plugin.handlers.len()
        );
    }

    /// Handlers `plugin_id` mounted for `sequence_id`.
    pub fn handlers(&self, plugin_id: &str, sequence_id: &str) -> Result<Arc<HandlerMap>> {
        let plugin = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| ConductorError::PluginNotFound(plugin_id.to_string()))?;

        plugin
            .handlers
            .get(sequence_id)
            .cloned()
            .ok_or_else(|| ConductorError::NotMounted {
                plugin_id: plugin_id.to_string(),
                sequence_id: sequence_id.to_string(),
            })
    }

    /// First plugin (by id) that mounted `sequence_id`, with its handlers.
    pub fn find_sequence(&self, sequence_id: &str) -> Option<(String, Arc<HandlerMap>)> {
        let mut owners: Vec<&MountedPlugin> = self
            .plugins
            .values()
            .filter(|plugin| plugin.handlers.contains_key(sequence_id))
            .collect();
        owners.sort_by(|a, b| a.id.cmp(&b.id));

        owners.first().and_then(|plugin| {
            plugin
                .handlers
                .get(sequence_id)
                .map(|handlers| (plugin.id.clone(), Arc::clone(handlers)))
        })
    }

    /// Drops `sequence_id` from every plugin, removing plugins left empty.
    pub fn remove_sequence(&mut self, sequence_id: &str) -> usize {
        let mut removed = 0;
        for plugin in self.plugins.values_mut() {
            if plugin.handlers.remove(sequence_id).is_some() {
                removed += 1;
            }
        }
        self.plugins.retain(|_, plugin| !plugin.handlers.is_empty());
        removed
    }

    pub fn get(&self, plugin_id: &str) -> Option<&MountedPlugin> {
        self.plugins.get(plugin_id)
    }

    /// Plugin ids, sorted.
    pub fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::Handler;
    use crate::sequence::{Beat, Movement};

    fn sequence(id: &str) -> Sequence {
        Sequence::new(id, id.to_uppercase()).with_movement(
            Movement::new("m", "Main")
                .with_beat(Beat::new(1, "create", "h1"))
                .with_beat(Beat::new(2, "notify", "h2")),
        )
    }

    fn handlers(names: &[&str]) -> HandlerMap {
        names
            .iter()
            .map(|name| (*name, Handler::sync(|_| Ok(None))))
            .collect()
    }

    #[test]
    fn test_validate_mount_accepts_complete_map() {
        assert!(validate_mount(&sequence("s"), &handlers(&["h1", "h2"])).is_ok());
    }

    #[test]
    fn test_validate_mount_reports_missing_handler() {
        let issues = validate_mount(&sequence("s"), &handlers(&["h1"])).unwrap_err();
        assert_eq!(
            issues,
            vec![ValidationIssue::MissingHandler {
                movement: "m".to_string(),
                beat: 2,
                handler: "h2".to_string(),
            }]
        );
    }

    #[test]
    fn test_validate_mount_merges_structural_issues() {
        let broken = Sequence::new("s", "S");
        let issues = validate_mount(&broken, &handlers(&[])).unwrap_err();
        assert_eq!(issues, vec![ValidationIssue::NoMovements]);
    }

    #[test]
    fn test_rejected_result_carries_reason() {
        let result = MountResult::rejected("p", "s", &[ValidationIssue::NoMovements]);
        assert!(!result.success);
        assert_eq!(result.issues, vec!["sequence has no movements"]);
        assert!(result.reason.unwrap().contains("no movements"));
    }

    #[test]
    fn test_multiple_sequences_under_one_plugin() {
        let mut registry = PluginRegistry::new();
        registry.insert("p", "a", handlers(&["h1"]));
        registry.insert("p", "b", handlers(&["h2"]));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("p").unwrap().sequences(), vec!["a", "b"]);
        assert!(registry.handlers("p", "a").unwrap().contains("h1"));
        assert!(registry.handlers("p", "b").unwrap().contains("h2"));
    }

    #[test]
    fn test_lookup_errors() {
        let mut registry = PluginRegistry::new();
        registry.insert("p", "a", handlers(&[]));

        assert!(matches!(
            registry.handlers("ghost", "a"),
            Err(ConductorError::PluginNotFound(_))
        ));
        assert!(matches!(
            registry.handlers("p", "b"),
            Err(ConductorError::NotMounted { .. })
        ));
    }

    #[test]
    fn test_find_and_remove_sequence() {
        let mut registry = PluginRegistry::new();
        registry.insert("zeta", "a", handlers(&[]));
        registry.insert("alpha", "a", handlers(&[]));
        registry.insert("alpha", "b", handlers(&[]));

        assert_eq!(registry.find_sequence("a").unwrap().0, "alpha");
        assert_eq!(registry.remove_sequence("a"), 2);
        assert_eq!(registry.plugin_ids(), vec!["alpha"]);
        assert!(registry.find_sequence("a").is_none());
    }
}
