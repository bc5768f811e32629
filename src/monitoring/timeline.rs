//! Execution Timeline
//!
//! Records when each step of one execution started and how it ended, for
//! run reports and ASCII Gantt charts.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Step acquired a slot and began its first attempt
    Started,
    /// Step completed successfully
    Completed,
    /// Step failed and the failure is fatal
    Failed,
    /// Optional step failed; the run continued without it
    Skipped,
}

impl EventType {
    fn is_terminal(self) -> bool {
        !matches!(self, Self::Started)
    }

    fn bar_char(self) -> char {
        match self {
            Self::Started | Self::Completed => '#',
            Self::Failed => 'x',
            Self::Skipped => '~',
        }
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    /// ID of the step
    pub step_id: String,
    /// Type of event
    pub event_type: EventType,
    /// When the event occurred
    pub timestamp: Instant,
}

/// A step's span on the timeline, relative to the timeline start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpan {
    pub step_id: String,
    pub start: Duration,
    pub end: Duration,
    pub outcome: EventType,
}

impl StepSpan {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Tracks the execution timeline of one workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a step, timestamped now.
    pub fn add_event(&mut self, step_id: impl Into<String>, event_type: EventType) {
        self.add_event_at(step_id, event_type, Instant::now());
    }

    /// Records an event that happened at `timestamp`.
    ///
    /// Used for events observed inside worker tasks and reported to the
    /// coordinator after the fact.
    pub fn add_event_at(&mut self, step_id: impl Into<String>, event_type: EventType, timestamp: Instant) {
        self.events.push(TimelineEvent {
            step_id: step_id.into(),
            event_type,
            timestamp: timestamp.max(self.start_time),
        });
    }

    /// Returns all recorded events in recording order.
    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Returns the total elapsed time since timeline creation.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Returns finished steps ordered by start time.
    pub fn spans(&self) -> Vec<StepSpan> {
        let mut starts: HashMap<&str, Duration> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);

            if event.event_type.is_terminal() {
                let start = starts.remove(event.step_id.as_str()).unwrap_or(offset);
                spans.push(StepSpan {
                    step_id: event.step_id.clone(),
                    start,
                    end: offset,
                    outcome: event.event_type,
                });
            } else {
                starts.insert(&event.step_id, offset);
            }
        }

        spans.sort_by_key(|span| span.start);
        spans
    }

    /// Returns step durations in milliseconds.
    pub fn durations(&self) -> HashMap<String, u128> {
        self.spans()
            .into_iter()
            .map(|span| (span.step_id.clone(), span.duration().as_millis()))
            .collect()
    }

    /// Generates an ASCII Gantt chart.
    ///
    /// `#` marks completed steps, `x` fatal failures and `~` skipped
    /// optional steps.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().as_millis();
        if total_time == 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for span in self.spans() {
            let start_pos = (span.start.as_millis() as f64 * scale) as usize;
            let width = (span.duration().as_millis() as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.extend(std::iter::repeat(span.outcome.bar_char()).take(width));

            output.push_str(&format!(
                "{:12} |{:50}| ({} ms)\n",
                truncate(&span.step_id, 12),
                bar,
                span.duration().as_millis()
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a string to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
