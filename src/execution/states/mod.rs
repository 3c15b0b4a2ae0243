//! State Executors
//!
//! One executor per state type. Each receives the state's input view and
//! returns the state's output together with a routing decision; merging the
//! output into the context is left to the engine.
//!
//! - [`operation`]: runs actions, sequentially or in parallel
//! - [`switch`]: picks the first matching data condition
//! - [`foreach`]: runs a body once per collection item
//! - [`parallel`]: forks branches and joins their results
//! - [`subflow`]: runs another workflow on its own context
//! - [`wait`]: event and delay states

mod foreach;
mod operation;
mod parallel;
mod subflow;
mod switch;
mod wait;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::engine::Runner;
use super::scheduler::{BranchResult, BranchStatus};
use crate::error::StateError;
use crate::workflow::model::{StateDefinition, StateKind};

pub(crate) use operation::run_actions;

/// Where the engine goes after a state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Route {
    /// Follow the state's own `transition` / `end`
    Declared,
    To(String),
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StepOutcome {
    /// `None` leaves the context untouched
    pub output: Option<Value>,
    pub route: Route,
}

impl StepOutcome {
    pub fn output(value: Value) -> Self {
        Self {
            output: Some(value),
            route: Route::Declared,
        }
    }

    pub fn silent() -> Self {
        Self {
            output: None,
            route: Route::Declared,
        }
    }
}

/// Executes a state against its input view.
pub(crate) async fn execute(
    runner: &Runner,
    state: &StateDefinition,
    input: Value,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StateError> {
    match &state.kind {
        StateKind::Operation(op) => operation::execute(runner, op, input, cancel).await,
        StateKind::Switch(switch) => switch::execute(runner.evaluator(), switch, input),
        StateKind::ForEach(each) => foreach::execute(runner, state, each, input, cancel).await,
        StateKind::Parallel(parallel) => {
            parallel::execute(runner, state, parallel, input, cancel).await
        }
        StateKind::Subflow(subflow) => subflow::execute(runner, subflow, input, cancel).await,
        StateKind::Event(event) => wait::event(runner, event, cancel).await,
        StateKind::Delay(delay) => wait::delay(delay, cancel).await,
        StateKind::Inject(inject) => Ok(StepOutcome::output(inject.data.clone())),
        StateKind::End(_) => Ok(StepOutcome::output(input)),
    }
}

/// Summarises failed branches into a join failure.
pub(crate) fn branch_failure<T>(join: String, results: &[BranchResult<T>]) -> StateError {
    let mut succeeded = 0;
    let mut failed = 0;
    let mut first_failure = None;

    for result in results {
        match &result.status {
            BranchStatus::Succeeded(_) => succeeded += 1,
            BranchStatus::Failed(e) => {
                failed += 1;
                first_failure.get_or_insert_with(|| Box::new(e.clone()));
            }
            BranchStatus::Cancelled => {}
        }
    }

    StateError::BranchFailure {
        join,
        total: results.len(),
        succeeded,
        failed,
        first_failure,
    }
}
