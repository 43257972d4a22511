//! Beat Timeline
//!
//! Records when each beat of one execution starts and settles, for the
//! per-beat durations kept in statistics and for a text Gantt view.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Phase of a beat recorded on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeatPhase {
    Started,
    Completed,
    Errored,
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// `movement/beat` label, see [`beat_label`]
    pub beat: String,
    pub phase: BeatPhase,
    pub timestamp: Instant,
}

/// Label identifying a beat within an execution.
pub fn beat_label(movement_id: &str, beat: u32) -> String {
    format!("{}/{}", movement_id, beat)
}

/// Start/settle times of the beats of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record(&mut self, beat: impl Into<String>, phase: BeatPhase) {
        self.events.push(TimelineEvent {
            beat: beat.into(),
            phase,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Milliseconds between each beat's start and its settle event.
    /// Beats that never settled are left out.
    pub fn durations(&self) -> BTreeMap<String, u128> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = BTreeMap::new();

        for event in &self.events {
            match event.phase {
                BeatPhase::Started => {
                    starts.insert(&event.beat, event.timestamp);
                }
                BeatPhase::Completed | BeatPhase::Errored => {
                    if let Some(start) = starts.get(event.beat.as_str()) {
                        durations.insert(
                            event.beat.clone(),
                            event.timestamp.duration_since(*start).as_millis(),
                        );
                    }
                }
            }
        }

        durations
    }

    /// Number of beats that settled with an error.
    pub fn errored(&self) -> usize {
        self.events
            .iter()
            .filter(|event| event.phase == BeatPhase::Errored)
            .count()
    }

    /// ASCII Gantt chart, one bar per beat, scaled to 50 columns.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nBeat Timeline:\n\n");

        let total = self.start_time.elapsed().as_millis();
        if total == 0 {
            return output;
        }
        let scale = 50.0 / total as f64;

        let mut spans: Vec<(&str, u128, u128, BeatPhase)> = Vec::new();
        for event in &self.events {
            let at = event.timestamp.duration_since(self.start_time).as_millis();
            match event.phase {
                BeatPhase::Started => spans.push((&event.beat, at, at, BeatPhase::Started)),
                phase => {
                    if let Some(span) = spans
                        .iter_mut()
                        .rev()
                        .find(|span| span.0 == event.beat && span.3 == BeatPhase::Started)
                    {
                        span.2 = at;
                        span.3 = phase;
                    }
                }
            }
        }

        for (beat, start, end, phase) in spans {
            let offset = (start as f64 * scale) as usize;
            let width = ((end.saturating_sub(start)) as f64 * scale).max(1.0) as usize;
            let fill = if phase == BeatPhase::Errored { "x" } else { "#" };

            output.push_str(&format!(
                "{:12} |{}{}| ({} ms)\n",
                truncate(beat, 12),
                " ".repeat(offset),
                fill.repeat(width),
                end.saturating_sub(start)
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_durations_for_settled_beats() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record(beat_label("m", 1), BeatPhase::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.record(beat_label("m", 1), BeatPhase::Completed);
        timeline.record(beat_label("m", 2), BeatPhase::Started);

        let durations = timeline.durations();
        assert!(durations["m/1"] >= 20);
        assert!(!durations.contains_key("m/2"));
    }

    #[test]
    fn test_errored_beats_counted() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("m/1", BeatPhase::Started);
        timeline.record("m/1", BeatPhase::Errored);
        timeline.record("m/2", BeatPhase::Started);
        timeline.record("m/2", BeatPhase::Completed);

        assert_eq!(timeline.errored(), 1);
        assert_eq!(timeline.durations().len(), 2);
        assert_eq!(timeline.events().len(), 4);
    }

    #[test]
    fn test_gantt_chart_lists_beats() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record("intro/1", BeatPhase::Started);
        thread::sleep(Duration::from_millis(10));
        timeline.record("intro/1", BeatPhase::Completed);
        timeline.record("intro/2", BeatPhase::Started);
        thread::sleep(Duration::from_millis(10));
        timeline.record("intro/2", BeatPhase::Errored);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("intro/1"));
        assert!(chart.contains("intro/2"));
        assert!(chart.contains('x'));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_truncate_long_labels() {
        assert_eq!(truncate("a-very-long-movement/1", 12), "a-very-lo...");
        assert_eq!(truncate("m/1", 5), "m/1  ");
    }
}
