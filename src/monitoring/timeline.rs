//! Execution Timeline
//!
//! Records when each state of a run is entered and left. States can be
//! entered more than once (loops through switch states), so every visit is
//! kept as its own span.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What happened to a state at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineEventKind {
    Started,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub state: String,
    pub kind: TimelineEventKind,
    pub timestamp: Instant,
}

/// One visit of a state, from entry until it completed or failed.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSpan {
    pub state: String,
    /// Offset from the start of the timeline
    pub start: Duration,
    pub end: Duration,
    pub failed: bool,
}

impl StateSpan {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Timeline of a single graph run.
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

    pub fn add_event(&mut self, state: &str, kind: TimelineEventKind) {
        self.events.push(TimelineEvent {
            state: state.to_string(),
            kind,
            timestamp: Instant::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Pairs every start with the next completion or failure of the same
    /// state. Visits still open are left out.
    pub fn spans(&self) -> Vec<StateSpan> {
        let mut open: HashMap<&str, Duration> = HashMap::new();
        let mut spans = Vec::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);
            match event.kind {
                TimelineEventKind::Started => {
                    open.insert(&event.state, offset);
                }
                TimelineEventKind::Completed | TimelineEventKind::Failed => {
                    if let Some(start) = open.remove(event.state.as_str()) {
                        spans.push(StateSpan {
                            state: event.state.clone(),
                            start,
                            end: offset,
                            failed: event.kind == TimelineEventKind::Failed,
                        });
                    }
                }
            }
        }

        spans.sort_by_key(|span| span.start);
        spans
    }

    /// Total time spent in each state, summed over its visits.
    pub fn durations(&self) -> HashMap<String, Duration> {
        let mut totals: HashMap<String, Duration> = HashMap::new();
        for span in self.spans() {
            *totals.entry(span.state.clone()).or_default() += span.duration();
        }
        totals
    }

    /// Renders the visits as an ASCII Gantt chart, one row per visit.
    /// Failed visits are drawn with `x` instead of `#`.
    pub fn gantt_chart(&self) -> String {
        const WIDTH: f64 = 50.0;

        let mut output = String::from("\nExecution Timeline:\n\n");
        let total = self.elapsed().as_millis().max(1);
        let scale = WIDTH / total as f64;

        for span in self.spans() {
            let start_ms = span.start.as_millis();
            let duration_ms = span.duration().as_millis();

            let offset = (start_ms as f64 * scale) as usize;
            let length = ((duration_ms as f64 * scale) as usize).max(1);
            let fill = if span.failed { "x" } else { "#" };

            output.push_str(&format!(
                "{} |{}{}| ({} ms)\n",
                label(&span.state, 16),
                " ".repeat(offset),
                fill.repeat(length),
                duration_ms
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

/// Pads or shortens a state name to a fixed column width.
fn label(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        format!("{:width$}", name, width = width)
    } else {
        let head: String = name.chars().take(width - 3).collect();
        format!("{}...", head)
    }
}
