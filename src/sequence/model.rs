//! Sequence Data Model
//!
//! Core data structures describing a sequence: ordered movements, each an
//! ordered list of beats.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: element-create
//! name: Element Create
//! tempo: 120
//! resources:
//!   - "element:{elementId}"
//! movements:
//!   - id: create
//!     name: Create
//!     beats:
//!       - beat: 1
//!         event: element:create
//!         handler: createElement
//!         dynamics: f
//!         timing: immediate
//!         errorHandling: abort-sequence
//!       - beat: 2
//!         event: element:notify
//!         handler: notify
//!         timing: after-beat
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: u32 = 120;

/// Priority weight of a beat, borrowed from musical notation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Dynamics {
    #[serde(rename = "pp")]
    Pianissimo,
    #[serde(rename = "p")]
    Piano,
    #[serde(rename = "mp")]
    MezzoPiano,
    #[default]
    #[serde(rename = "mf")]
    MezzoForte,
    #[serde(rename = "f")]
    Forte,
    #[serde(rename = "ff")]
    Fortissimo,
}

impl Dynamics {
    /// Short notation used on the wire (`pp`..`ff`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pianissimo => "pp",
            Self::Piano => "p",
            Self::MezzoPiano => "mp",
            Self::MezzoForte => "mf",
            Self::Forte => "f",
            Self::Fortissimo => "ff",
        }
    }
}

impl fmt::Display for Dynamics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a beat begins relative to the one before it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Timing {
    /// Run synchronously right after the previous beat.
    #[default]
    Immediate,
    /// Yield to the scheduler once the previous beat settles.
    AfterBeat,
    /// Yield to the scheduler before running.
    NextTick,
    /// Wait one tempo-derived beat interval.
    Delayed,
    /// Suspend until the beat's named signal has been raised.
    WaitForSignal,
}

impl Timing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::AfterBeat => "after-beat",
            Self::NextTick => "next-tick",
            Self::Delayed => "delayed",
            Self::WaitForSignal => "wait-for-signal",
        }
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a beat failure does to the rest of the execution.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandling {
    /// Keep going with the next beat.
    #[default]
    Continue,
    /// Skip the rest of the current movement.
    Abort,
    /// Fail the whole execution.
    AbortSequence,
}

impl fmt::Display for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Continue => "continue",
            Self::Abort => "abort",
            Self::AbortSequence => "abort-sequence",
        };
        f.write_str(text)
    }
}

/// A single step within a movement.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Beat {
    /// Position within the movement, unique and starting at 1
    pub beat: u32,

    /// Event name emitted when the beat runs
    pub event: String,

    /// Name of the handler bound to this beat
    pub handler: String,

    #[serde(default)]
    pub dynamics: Dynamics,

    #[serde(default)]
    pub timing: Timing,

    /// Static data handed to the handler
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,

    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Event name a `wait-for-signal` beat waits on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl Beat {
    /// Creates an immediate, continue-on-error beat.
    ///
    /// # Example
    ///
    /// ```
    /// use conductor::sequence::{Beat, ErrorHandling, Timing};
    ///
    /// let beat = Beat::new(1, "element:create", "createElement")
    ///     .with_timing(Timing::AfterBeat)
    ///     .with_error_handling(ErrorHandling::AbortSequence);
    /// assert_eq!(beat.beat, 1);
    /// ```
    pub fn new(beat: u32, event: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            beat,
            event: event.into().trim().to_string(),
            handler: handler.into().trim().to_string(),
            dynamics: Dynamics::default(),
            timing: Timing::default(),
            data: Value::Null,
            error_handling: ErrorHandling::default(),
            signal: None,
        }
    }

    pub fn with_dynamics(mut self, dynamics: Dynamics) -> Self {
        self.dynamics = dynamics;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    /// Makes this a `wait-for-signal` beat waiting on `signal`.
    pub fn waiting_for(mut self, signal: impl Into<String>) -> Self {
        self.timing = Timing::WaitForSignal;
        self.signal = Some(signal.into());
        self
    }
}

/// An ordered phase of a sequence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Movement {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub beats: Vec<Beat>,
}

impl Movement {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: name.into(),
            beats: Vec::new(),
        }
    }

    pub fn with_beat(mut self, beat: Beat) -> Self {
        self.beats.push(beat);
        self
    }

    /// Beats in ascending beat-number order.
    pub fn ordered_beats(&self) -> Vec<&Beat> {
        let mut beats: Vec<&Beat> = self.beats.iter().collect();
        beats.sort_by_key(|b| b.beat);
        beats
    }
}

/// A validated, immutable sequence definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sequence {
    pub id: String,

    /// Human-readable name, also resolvable by `start_sequence`
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Beats per minute, drives the `delayed` interval
    #[serde(default = "default_tempo")]
    pub tempo: u32,

    /// Resource ids this sequence mutates; `{key}` reads from start data
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<String>,

    #[serde(default)]
    pub movements: Vec<Movement>,
}

fn default_tempo() -> u32 {
    DEFAULT_TEMPO
}

impl Sequence {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: name.into().trim().to_string(),
            description: None,
            tempo: DEFAULT_TEMPO,
            resources: Vec::new(),
            movements: Vec::new(),
        }
    }

    pub fn with_movement(mut self, movement: Movement) -> Self {
        self.movements.push(movement);
        self
    }

    pub fn with_tempo(mut self, tempo: u32) -> Self {
        self.tempo = tempo;
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    /// All handler names referenced by beats, deduplicated and sorted.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .movements
            .iter()
            .flat_map(|m| m.beats.iter().map(|b| b.handler.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Total number of beats across all movements.
    pub fn beat_count(&self) -> usize {
        self.movements.iter().map(|m| m.beats.len()).sum()
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Resolves declared resources against the start data.
    ///
    /// `{key}` placeholders are replaced with the matching top-level field
    /// of `data`. Resources whose placeholders cannot be resolved are skipped.
    pub fn resolve_resources(&self, data: &Value) -> Vec<String> {
        let mut resolved: Vec<String> = self
            .resources
            .iter()
            .filter_map(|template| substitute_placeholders(template, data))
            .collect();
        resolved.sort();
        resolved.dedup();
        resolved
    }
}

/// Replaces `{key}` with the string form of `data[key]`.
fn substitute_placeholders(template: &str, data: &Value) -> Option<String> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let key = &rest[open + 1..open + close];
        let value = match data.get(key)? {
            Value::String(s) => s.clone(),
            Value::Null => return None,
            other => other.to_string(),
        };
        output.push_str(&rest[..open]);
        output.push_str(&value);
        rest = &rest[open + close + 1..];
    }

    output.push_str(rest);
    Some(output)
}
