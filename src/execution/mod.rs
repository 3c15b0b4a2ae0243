//! Workflow Execution Module
//!
//! Runs validated workflow definitions.
//!
//! # Architecture
//!
//! - [`engine`]: Walks the state graph and owns the run's collaborators
//! - [`context`]: The run's accumulated data
//! - [`invoker`]: Function calls, retries and action data filters
//! - [`scheduler`]: Fork/join of branches, ForEach items and parallel actions
//! - [`events`]: Where event states get their events from
//! - [`record`]: Visit counts and the trail of a run

pub mod context;
pub mod engine;
pub mod events;
pub mod invoker;
pub mod record;
pub mod scheduler;
pub(crate) mod states;

pub use context::ContextStore;
pub use engine::Engine;
pub use events::{ChannelEventSource, EventOutcome, EventSource};
pub use invoker::{ActionInvoker, ActionOutput, FunctionRegistry, InMemoryFunctionRegistry};
pub use record::ExecutionRecord;
pub use scheduler::{BranchResult, BranchScheduler, BranchStatus, BranchTask, JoinCondition};
