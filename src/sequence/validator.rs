//! Sequence Validation
//!
//! Structural checks run before a sequence may be registered:
//! - Identity fields are present
//! - At least one movement, each with at least one beat
//! - Beat numbers start at 1 and are unique within a movement
//! - Every beat names an event and a handler
//! - `wait-for-signal` beats name their signal
//!
//! Mount-time validation additionally checks that every handler name
//! resolves against the plugin's handler map; see
//! [`validate_handlers`].

use std::collections::HashSet;

use log::{debug, warn};
use thiserror::Error;

use super::model::{Sequence, Timing};

/// A single rule violation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationIssue {
    #[error("sequence id is empty")]
    EmptySequenceId,

    #[error("sequence has no movements")]
    NoMovements,

    #[error("tempo must be positive (got {0})")]
    InvalidTempo(u32),

    #[error("movement #{0} has an empty id")]
    EmptyMovementId(usize),

    #[error("duplicate movement id '{0}'")]
    DuplicateMovementId(String),

    #[error("movement '{0}' has no beats")]
    EmptyMovement(String),

    #[error("movement '{movement}': beat numbers start at 1 (got 0)")]
    ZeroBeatNumber { movement: String },

    #[error("movement '{movement}': duplicate beat number {beat}")]
    DuplicateBeat { movement: String, beat: u32 },

    #[error("movement '{movement}' beat {beat}: event name is empty")]
    EmptyEvent { movement: String, beat: u32 },

    #[error("movement '{movement}' beat {beat}: handler name is empty")]
    EmptyHandler { movement: String, beat: u32 },

    #[error("movement '{movement}' beat {beat}: wait-for-signal without a signal name")]
    MissingSignal { movement: String, beat: u32 },

    #[error("movement '{movement}' beat {beat}: handler '{handler}' is not provided")]
    MissingHandler {
        movement: String,
        beat: u32,
        handler: String,
    },
}

/// Validates the structure of a sequence.
///
/// Returns every violation found rather than stopping at the first one.
pub fn validate_sequence(sequence: &Sequence) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if sequence.id.trim().is_empty() {
        issues.push(ValidationIssue::EmptySequenceId);
    }

    if sequence.tempo == 0 {
        issues.push(ValidationIssue::InvalidTempo(sequence.tempo));
    }

    if sequence.movements.is_empty() {
        issues.push(ValidationIssue::NoMovements);
        return Err(issues);
    }

    let mut movement_ids: HashSet<&str> = HashSet::new();
    for (index, movement) in sequence.movements.iter().enumerate() {
        if movement.id.trim().is_empty() {
            issues.push(ValidationIssue::EmptyMovementId(index));
        } else if !movement_ids.insert(movement.id.as_str()) {
            issues.push(ValidationIssue::DuplicateMovementId(movement.id.clone()));
        }

        if movement.beats.is_empty() {
            issues.push(ValidationIssue::EmptyMovement(movement.id.clone()));
            continue;
        }

        let mut beat_numbers: HashSet<u32> = HashSet::new();
        for beat in &movement.beats {
            if beat.beat == 0 {
                issues.push(ValidationIssue::ZeroBeatNumber {
                    movement: movement.id.clone(),
                });
            } else if !beat_numbers.insert(beat.beat) {
                issues.push(ValidationIssue::DuplicateBeat {
                    movement: movement.id.clone(),
                    beat: beat.beat,
                });
            }

            if beat.event.trim().is_empty() {
                issues.push(ValidationIssue::EmptyEvent {
                    movement: movement.id.clone(),
                    beat: beat.beat,
                });
            }

            if beat.handler.trim().is_empty() {
                issues.push(ValidationIssue::EmptyHandler {
                    movement: movement.id.clone(),
                    beat: beat.beat,
                });
            }

            if beat.timing == Timing::WaitForSignal
                && beat.signal.as_deref().map_or(true, |s| s.trim().is_empty())
            {
                issues.push(ValidationIssue::MissingSignal {
                    movement: movement.id.clone(),
                    beat: beat.beat,
                });
            }
        }
    }

    if issues.is_empty() {
        debug!(
            "Sequence '{}' validated: {} movements, {} beats",
            sequence.id,
            sequence.movements.len(),
            sequence.beat_count()
        );
        Ok(())
    } else {
        warn!(
            "Sequence '{}' failed validation with {} issue(s)",
            sequence.id,
            issues.len()
        );
        Err(issues)
    }
}

/// Checks that every beat's handler is present in `available`.
pub fn validate_handlers<F>(sequence: &Sequence, available: F) -> Result<(), Vec<ValidationIssue>>
where
    F: Fn(&str) -> bool,
{
    let issues: Vec<ValidationIssue> = sequence
        .movements
        .iter()
        .flat_map(|movement| {
            movement
                .beats
                .iter()
                .filter(|beat| !beat.handler.trim().is_empty() && !available(&beat.handler))
                .map(move |beat| ValidationIssue::MissingHandler {
                    movement: movement.id.clone(),
                    beat: beat.beat,
                    handler: beat.handler.clone(),
                })
        })
        .collect();

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::model::{Beat, Movement};

    fn valid_sequence() -> Sequence {
        Sequence::new("seq", "Sequence").with_movement(
            Movement::new("m1", "Main")
                .with_beat(Beat::new(1, "create", "h1"))
                .with_beat(Beat::new(2, "notify", "h2")),
        )
    }

    #[test]
    fn test_valid_sequence_passes() {
        assert!(validate_sequence(&valid_sequence()).is_ok());
    }

    #[test]
    fn test_no_movements_rejected() {
        let issues = validate_sequence(&Sequence::new("seq", "S")).unwrap_err();
        assert_eq!(issues, vec![ValidationIssue::NoMovements]);
    }

    #[test]
    fn test_empty_id_and_tempo_reported_together() {
        let sequence = Sequence::new("", "S")
            .with_tempo(0)
            .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, "e", "h")));

        let issues = validate_sequence(&sequence).unwrap_err();
        assert!(issues.contains(&ValidationIssue::EmptySequenceId));
        assert!(issues.contains(&ValidationIssue::InvalidTempo(0)));
    }

    #[test]
    fn test_empty_movement_rejected() {
        let sequence = Sequence::new("seq", "S").with_movement(Movement::new("m", "M"));
        let issues = validate_sequence(&sequence).unwrap_err();
        assert_eq!(issues, vec![ValidationIssue::EmptyMovement("m".to_string())]);
    }

    #[test]
    fn test_duplicate_beat_numbers_rejected() {
        let sequence = Sequence::new("seq", "S").with_movement(
            Movement::new("m", "M")
                .with_beat(Beat::new(1, "a", "h"))
                .with_beat(Beat::new(1, "b", "h")),
        );

        let issues = validate_sequence(&sequence).unwrap_err();
        assert_eq!(
            issues,
            vec![ValidationIssue::DuplicateBeat {
                movement: "m".to_string(),
                beat: 1
            }]
        );
    }

    #[test]
    fn test_same_beat_number_in_different_movements_ok() {
        let sequence = Sequence::new("seq", "S")
            .with_movement(Movement::new("a", "A").with_beat(Beat::new(1, "e", "h")))
            .with_movement(Movement::new("b", "B").with_beat(Beat::new(1, "e", "h")));
        assert!(validate_sequence(&sequence).is_ok());
    }

    #[test]
    fn test_zero_beat_number_rejected() {
        let sequence = Sequence::new("seq", "S")
            .with_movement(Movement::new("m", "M").with_beat(Beat::new(0, "e", "h")));
        let issues = validate_sequence(&sequence).unwrap_err();
        assert!(matches!(issues[0], ValidationIssue::ZeroBeatNumber { .. }));
    }

    #[test]
    fn test_duplicate_movement_ids_rejected() {
        let sequence = Sequence::new("seq", "S")
            .with_movement(Movement::new("m", "A").with_beat(Beat::new(1, "e", "h")))
            .with_movement(Movement::new("m", "B").with_beat(Beat::new(1, "e", "h")));
        let issues = validate_sequence(&sequence).unwrap_err();
        assert_eq!(issues, vec![ValidationIssue::DuplicateMovementId("m".to_string())]);
    }

    #[test]
    fn test_empty_event_and_handler_rejected() {
        let sequence = Sequence::new("seq", "S")
            .with_movement(Movement::new("m", "M").with_beat(Beat::new(1, " ", "")));
        let issues = validate_sequence(&sequence).unwrap_err();
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn test_wait_for_signal_requires_signal() {
        let mut beat = Beat::new(1, "e", "h");
        beat.timing = Timing::WaitForSignal;
        let sequence = Sequence::new("seq", "S").with_movement(Movement::new("m", "M").with_beat(beat));

        let issues = validate_sequence(&sequence).unwrap_err();
        assert!(matches!(issues[0], ValidationIssue::MissingSignal { beat: 1, .. }));
    }

    #[test]
    fn test_validate_handlers_reports_missing() {
        let sequence = valid_sequence();
        let issues = validate_handlers(&sequence, |name| name == "h1").unwrap_err();

        assert_eq!(
            issues,
            vec![ValidationIssue::MissingHandler {
                movement: "m1".to_string(),
                beat: 2,
                handler: "h2".to_string()
            }]
        );
    }

    #[test]
    fn test_validate_handlers_all_present() {
        assert!(validate_handlers(&valid_sequence(), |_| true).is_ok());
    }
}
