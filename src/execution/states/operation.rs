use futures::FutureExt;
use log::debug;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{branch_failure, StepOutcome};
use crate::error::{ExecutionError, StateError};
use crate::execution::context::overlay;
use crate::execution::engine::Runner;
use crate::execution::invoker::ActionOutput;
use crate::execution::scheduler::{BranchStatus, BranchTask, JoinCondition};
use crate::workflow::model::{ActionDefinition, ActionMode, OperationState};

pub(super) async fn execute(
    runner: &Runner,
    operation: &OperationState,
    input: Value,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StateError> {
    let results = run_actions(runner, &operation.actions, operation.action_mode, &input, cancel).await?;
    Ok(StepOutcome::output(Value::Object(results)))
}

/// Runs a block of actions and returns their results keyed by action.
///
/// Sequential actions see the input with the results of earlier actions laid
/// over it. Parallel actions all see the plain input; their results are
/// folded in declared order.
pub(crate) async fn run_actions(
    runner: &Runner,
    actions: &[ActionDefinition],
    mode: ActionMode,
    input: &Value,
    cancel: &CancellationToken,
) -> Result<Map<String, Value>, StateError> {
    match mode {
        ActionMode::Sequential => {
            let mut results = Map::new();
            for action in actions {
                let scope = overlay(input, &results);
                let output = runner
                    .runtime
                    .invoker
                    .perform(&runner.workflow, action, &scope, cancel)
                    .await?;
                if let Some(ActionOutput { key, value }) = output {
                    results.insert(key, value);
                }
            }
            Ok(results)
        }
        ActionMode::Parallel => run_parallel(runner, actions, input, cancel).await,
    }
}

async fn run_parallel(
    runner: &Runner,
    actions: &[ActionDefinition],
    input: &Value,
    cancel: &CancellationToken,
) -> Result<Map<String, Value>, StateError> {
    debug!("Running {} action(s) in parallel", actions.len());

    let tasks: Vec<BranchTask<Option<ActionOutput>>> = actions
        .iter()
        .map(|action| {
            let runner = runner.clone();
            let action = action.clone();
            let input = input.clone();
            let key = action.result_key().to_string();

            BranchTask::new(key.clone(), move |cancel| {
                async move {
                    runner
                        .runtime
                        .invoker
                        .perform(&runner.workflow, &action, &input, &cancel)
                        .await
                        .map_err(|cause| ExecutionError::in_state(key, cause))
                }
                .boxed()
            })
        })
        .collect();

    let results = runner
        .runtime
        .scheduler
        .run_concurrently(tasks, JoinCondition::All, None, cancel)
        .await;

    if let Some(failure) = results.iter().find_map(|r| match &r.status {
        BranchStatus::Failed(e) => Some(e.clone()),
        _ => None,
    }) {
        return Err(match failure {
            ExecutionError::State { cause, .. } => cause,
            _ => branch_failure("all".to_string(), &results),
        });
    }

    let mut outputs = Map::new();
    for result in results {
        match result.status {
            BranchStatus::Succeeded(Some(ActionOutput { key, value })) => {
                outputs.insert(key, value);
            }
            BranchStatus::Succeeded(None) => {}
            _ => return Err(StateError::Cancelled),
        }
    }
    Ok(outputs)
}
