use std::sync::Arc;

use futures::FutureExt;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::{run_actions, StepOutcome};
use crate::error::{ExecutionError, StateError};
use crate::execution::context::overlay;
use crate::execution::engine::{Runner, StateGraph};
use crate::execution::scheduler::{BranchStatus, BranchTask, JoinCondition};
use crate::expression::type_name;
use crate::workflow::model::{
    ActionDefinition, ActionMode, ForEachState, ItemFailurePolicy, IterationMode, StateDefinition,
};

/// What runs once per item.
#[derive(Clone)]
enum Body {
    Actions(Arc<Vec<ActionDefinition>>),
    Iterator(StateGraph),
}

impl Body {
    async fn run(
        &self,
        runner: Runner,
        label: String,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutionError> {
        match self {
            Self::Actions(actions) => {
                run_actions(&runner, actions, ActionMode::Sequential, &input, &cancel)
                    .await
                    .map(Value::Object)
                    .map_err(|cause| ExecutionError::in_state(label, cause))
            }
            Self::Iterator(graph) => runner.run_graph(graph.clone(), input, cancel).await,
        }
    }
}

/// Runs the body once per item of the input collection. Results keep the
/// collection's order in both modes.
pub(super) async fn execute(
    runner: &Runner,
    state: &StateDefinition,
    each: &ForEachState,
    input: Value,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StateError> {
    let items = match runner.evaluator().evaluate(&each.input_collection, &input)? {
        Value::Array(items) => items,
        other => {
            return Err(StateError::NotIterable {
                expression: each.input_collection.clone(),
                found: type_name(&other).to_string(),
            })
        }
    };

    let body = if each.iterator.is_empty() {
        Body::Actions(Arc::new(each.actions.clone()))
    } else {
        let graph = StateGraph::nested(&each.iterator, format!("{} iterator", state.name))
            .map_err(|e| StateError::Iteration {
                index: 0,
                source: Box::new(e),
            })?;
        Body::Iterator(graph)
    };

    let item_inputs: Vec<Value> = items
        .into_iter()
        .map(|item| {
            let mut binding = Map::new();
            binding.insert(each.iteration_param.clone(), item);
            overlay(&input, &binding)
        })
        .collect();

    debug!(
        "ForEach '{}' over {} item(s), {:?} mode",
        state.name,
        item_inputs.len(),
        each.mode
    );

    let outcomes = match each.mode {
        IterationMode::Sequential => {
            run_sequential(runner, &state.name, &body, item_inputs, each.on_item_failure, cancel).await
        }
        IterationMode::Parallel => {
            let limit = each
                .max_concurrency
                .unwrap_or(runner.runtime.config.max_concurrency);
            run_parallel(runner, &state.name, &body, item_inputs, each.on_item_failure, limit, cancel)
                .await
        }
    }?;

    let mut results = Vec::with_capacity(outcomes.len());
    let mut failed_items = Vec::new();
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(value) => results.push(value),
            Err(e) => {
                warn!("ForEach '{}' skipped item #{}: {}", state.name, index, e);
                failed_items.push(json!({"index": index, "error": e.to_string()}));
                results.push(Value::Null);
            }
        }
    }

    let mut output = Map::new();
    output.insert("results".to_string(), Value::Array(results));
    if !failed_items.is_empty() {
        output.insert("failedItems".to_string(), Value::Array(failed_items));
    }
    Ok(StepOutcome::output(Value::Object(output)))
}

/// Per-item outcomes; item failures are only returned under the skip policy.
type ItemOutcomes = Vec<Result<Value, ExecutionError>>;

fn abort(index: usize, error: ExecutionError) -> StateError {
    match error {
        ExecutionError::Cancelled => StateError::Cancelled,
        error => StateError::Iteration {
            index,
            source: Box::new(error),
        },
    }
}

async fn run_sequential(
    runner: &Runner,
    name: &str,
    body: &Body,
    inputs: Vec<Value>,
    policy: ItemFailurePolicy,
    cancel: &CancellationToken,
) -> Result<ItemOutcomes, StateError> {
    let mut outcomes = Vec::with_capacity(inputs.len());

    for (index, input) in inputs.into_iter().enumerate() {
        let label = format!("{}[{}]", name, index);
        match body.run(runner.clone(), label, input, cancel.clone()).await {
            Ok(value) => outcomes.push(Ok(value)),
            Err(ExecutionError::Cancelled) => return Err(StateError::Cancelled),
            Err(e) if policy == ItemFailurePolicy::Skip => outcomes.push(Err(e)),
            Err(e) => return Err(abort(index, e)),
        }
    }

    Ok(outcomes)
}

async fn run_parallel(
    runner: &Runner,
    name: &str,
    body: &Body,
    inputs: Vec<Value>,
    policy: ItemFailurePolicy,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<ItemOutcomes, StateError> {
    let tasks: Vec<BranchTask> = inputs
        .into_iter()
        .enumerate()
        .map(|(index, input)| {
            let runner = runner.clone();
            let body = body.clone();
            let label = format!("{}[{}]", name, index);

            BranchTask::new(label.clone(), move |cancel| {
                async move { body.run(runner, label, input, cancel).await }.boxed()
            })
        })
        .collect();

    let join = match policy {
        ItemFailurePolicy::Abort => JoinCondition::All,
        ItemFailurePolicy::Skip => JoinCondition::Settled,
    };

    let results = runner
        .runtime
        .scheduler
        .run_concurrently(tasks, join, Some(limit), cancel)
        .await;

    let mut outcomes = Vec::with_capacity(results.len());
    let mut cancelled = false;
    for result in results {
        match result.status {
            BranchStatus::Succeeded(value) => outcomes.push(Ok(value)),
            BranchStatus::Failed(e) if policy == ItemFailurePolicy::Skip => outcomes.push(Err(e)),
            BranchStatus::Failed(e) => return Err(abort(result.index, e)),
            BranchStatus::Cancelled => cancelled = true,
        }
    }

    if cancelled {
        return Err(StateError::Cancelled);
    }
    Ok(outcomes)
}
