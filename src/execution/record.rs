//! Execution Record
//!
//! Bookkeeping for one run of a state graph: which state is current, how
//! often each state was entered (the cycle guard), the order states were
//! visited in, and the errors the run ended with.
//!
//! A record lives exactly as long as its run.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Transient record of a single graph run.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Workflow (or nested scope) this record belongs to
    pub workflow_id: String,

    /// Name of the state being executed
    pub current_state: Option<String>,

    /// Number of times each state was entered
    pub visits: HashMap<String, usize>,

    /// States in the order they completed
    pub trail: Vec<String>,

    /// Failure messages, in the order they happened
    pub errors: Vec<String>,

    pub started_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Creates an empty record for a run starting now.
    pub fn new(workflow_id: &str) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.to_string(),
            current_state: None,
            visits: HashMap::new(),
            trail: Vec::new(),
            errors: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Marks a state as entered and returns how often it has been entered.
    pub fn enter(&mut self, state: &str) -> usize {
        self.current_state = Some(state.to_string());
        self.updated_at = Utc::now();

        let count = self.visits.entry(state.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Marks a state as completed.
    pub fn mark_completed(&mut self, state: &str) {
        self.trail.push(state.to_string());
        self.updated_at = Utc::now();
    }

    /// Marks a state as failed with the given error.
    pub fn mark_failed(&mut self, state: &str, error: &str) {
        self.current_state = Some(state.to_string());
        self.record_error(error);
    }

    pub fn record_error(&mut self, error: &str) {
        self.errors.push(error.to_string());
        self.updated_at = Utc::now();
    }

    pub fn visit_count(&self, state: &str) -> usize {
        self.visits.get(state).copied().unwrap_or(0)
    }

    pub fn has_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Wall-clock duration of the run so far, in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (self.updated_at - self.started_at).num_milliseconds()
    }
}
