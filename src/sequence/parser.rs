//! Sequence Parser
//!
//! Loads sequence definitions from YAML or JSON. A file may hold a single
//! sequence or a list of them. Parsing does not validate; validation runs
//! when the sequence is registered or mounted.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use super::model::Sequence;
use crate::error::{ConductorError, Result};

/// One sequence or many, as found in a definition file.
#[derive(Deserialize)]
#[serde(untagged)]
enum SequenceDocument {
    Many(Vec<Sequence>),
    One(Box<Sequence>),
}

impl SequenceDocument {
    fn into_vec(self) -> Vec<Sequence> {
        match self {
            Self::Many(sequences) => sequences,
            Self::One(sequence) => vec![*sequence],
        }
    }
}

/// Parses sequences from YAML text.
pub fn parse_yaml(content: &str) -> Result<Vec<Sequence>> {
    let document: SequenceDocument = serde_yaml::from_str(content)?;
    Ok(document.into_vec())
}

/// Parses sequences from JSON text.
pub fn parse_json(content: &str) -> Result<Vec<Sequence>> {
    let document: SequenceDocument = serde_json::from_str(content)?;
    Ok(document.into_vec())
}

/// Loads sequences from a file.
///
/// Files ending in `.json` are parsed as JSON, everything else as YAML.
///
/// # Example
///
/// ```rust,no_run
/// use conductor::sequence::load_sequences;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let sequences = load_sequences("sequences/element.yaml")?;
///     println!("Loaded {} sequences", sequences.len());
///     Ok(())
/// }
/// ```
pub fn load_sequences(path: impl AsRef<Path>) -> Result<Vec<Sequence>> {
    let path = path.as_ref();
    info!("Loading sequences from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        ConductorError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read sequence file '{}': {}", path.display(), e),
        ))
    })?;
    debug!("Sequence file loaded ({} bytes)", content.len());

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let sequences = if is_json {
        parse_json(&content)?
    } else {
        parse_yaml(&content)?
    };

    info!("Parsed {} sequence(s) from {}", sequences.len(), path.display());
    Ok(sequences)
}

/// Saves a sequence to a YAML file.
pub fn save_sequence(sequence: &Sequence, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let yaml_content = serde_yaml::to_string(sequence)?;
    fs::write(path, yaml_content)?;
    info!("Sequence '{}' saved to: {}", sequence.id, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::model::{Beat, Movement, Timing};
    use tempfile::tempdir;

    const SINGLE_YAML: &str = r#"
id: element-create
name: Element Create
movements:
  - id: create
    name: Create
    beats:
      - beat: 1
        event: element:create
        handler: createElement
      - beat: 2
        event: element:notify
        handler: notify
        timing: after-beat
"#;

    #[test]
    fn test_parse_single_yaml() {
        let sequences = parse_yaml(SINGLE_YAML).unwrap();
        assert_eq!(sequences.len(), 1);
        assert_eq!(sequences[0].id, "element-create");
        assert_eq!(sequences[0].movements[0].beats[1].timing, Timing::AfterBeat);
    }

    #[test]
    fn test_parse_yaml_list() {
        let yaml = r#"
- id: a
  movements: []
- id: b
  movements: []
"#;
        let sequences = parse_yaml(yaml).unwrap();
        assert_eq!(sequences.len(), 2);
        assert_eq!(sequences[1].id, "b");
    }

    #[test]
    fn test_parse_json_single() {
        let json = r#"{"id": "s", "name": "S", "movements": [{"id": "m", "beats": []}]}"#;
        let sequences = parse_json(json).unwrap();
        assert_eq!(sequences[0].movements[0].id, "m");
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_yaml("id: [unclosed");
        assert!(matches!(result, Err(ConductorError::Yaml(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_sequences("/nonexistent/sequence.yaml");
        assert!(matches!(result, Err(ConductorError::Io(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip_through_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("saved.yaml");

        let sequence = Sequence::new("saved", "Saved").with_movement(
            Movement::new("m", "M").with_beat(Beat::new(1, "e", "h").waiting_for("ready")),
        );
        save_sequence(&sequence, &path).unwrap();

        let loaded = load_sequences(&path).unwrap();
        assert_eq!(loaded, vec![sequence]);
    }

    #[test]
    fn test_load_json_by_extension() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("seq.json");
        fs::write(&path, r#"[{"id": "j", "movements": []}]"#).unwrap();

        let loaded = load_sequences(&path).unwrap();
        assert_eq!(loaded[0].id, "j");
    }
}
