use futures::FutureExt;
use log::{debug, info};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{branch_failure, run_actions, StepOutcome};
use crate::error::{ExecutionError, StateError};
use crate::execution::context::overlay;
use crate::execution::engine::{Runner, StateGraph};
use crate::execution::scheduler::{BranchStatus, BranchTask, JoinCondition};
use crate::workflow::model::{
    ActionMode, BranchDefinition, JoinPolicy, ParallelState, StateDefinition,
};

/// Forks every branch on a copy of the input and joins them per the state's
/// join policy.
///
/// The output is the input with each successful, non-null branch result laid
/// over it under the branch's output key, in declared branch order.
pub(super) async fn execute(
    runner: &Runner,
    state: &StateDefinition,
    parallel: &ParallelState,
    input: Value,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StateError> {
    let (join, required) = match parallel.join {
        JoinPolicy::All => (JoinCondition::All, parallel.branches.len()),
        JoinPolicy::AtLeast(n) => (JoinCondition::AtLeast(n), n),
    };

    debug!(
        "Parallel '{}' forking {} branch(es), join {}",
        state.name,
        parallel.branches.len(),
        parallel.join
    );

    let tasks: Vec<BranchTask> = parallel
        .branches
        .iter()
        .map(|branch| {
            let runner = runner.clone();
            let branch = branch.clone();
            let input = input.clone();
            let label = format!("{}/{}", state.name, branch.name);

            BranchTask::new(branch.name.clone(), move |cancel| {
                async move { run_branch(runner, branch, label, input, cancel).await }.boxed()
            })
        })
        .collect();

    let results = runner
        .runtime
        .scheduler
        .run_concurrently(tasks, join, None, cancel)
        .await;

    let succeeded = results.iter().filter(|r| r.is_success()).count();
    if succeeded < required {
        if cancel.is_cancelled() {
            return Err(StateError::Cancelled);
        }
        return Err(branch_failure(parallel.join.to_string(), &results));
    }

    let mut outputs = Map::new();
    for result in results {
        let branch = &parallel.branches[result.index];
        match result.status {
            BranchStatus::Succeeded(Value::Null) => {
                debug!("Branch '{}' produced no output", branch.name);
            }
            BranchStatus::Succeeded(value) => {
                outputs.insert(branch.output_key(), value);
            }
            BranchStatus::Failed(e) => info!("Branch '{}' failed: {}", branch.name, e),
            BranchStatus::Cancelled => debug!("Branch '{}' was cancelled", branch.name),
        }
    }

    Ok(StepOutcome::output(overlay(&input, &outputs)))
}

/// Runs one branch: its states as a nested graph, or its actions in sequence.
async fn run_branch(
    runner: Runner,
    branch: BranchDefinition,
    label: String,
    input: Value,
    cancel: CancellationToken,
) -> Result<Value, ExecutionError> {
    let value = if branch.states.is_empty() {
        run_actions(&runner, &branch.actions, ActionMode::Sequential, &input, &cancel)
            .await
            .map(Value::Object)
            .map_err(|cause| ExecutionError::in_state(label.as_str(), cause))?
    } else {
        let graph = StateGraph::nested(&branch.states, label.clone())?;
        runner.clone().run_graph(graph, input, cancel).await?
    };

    match &branch.output_filter {
        Some(filter) => runner
            .evaluator()
            .evaluate(filter, &value)
            .map_err(|e| ExecutionError::in_state(label, e.into())),
        None => Ok(value),
    }
}
