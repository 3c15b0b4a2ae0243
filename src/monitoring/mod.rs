//! Monitoring Module
//!
//! Per-run timing of state visits, logged as a Gantt chart at debug level
//! when a graph run finishes.

pub mod timeline;

pub use timeline::{ExecutionTimeline, StateSpan, TimelineEvent, TimelineEventKind};
