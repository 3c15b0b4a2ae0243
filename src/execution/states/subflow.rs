use std::sync::Arc;

use log::{debug, error, info};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::StepOutcome;
use crate::error::{ExecutionError, StateError};
use crate::execution::engine::{Runner, StateGraph};
use crate::workflow::model::{SubflowState, WorkflowDefinition};
use crate::workflow::validator::validate;

/// Runs another workflow on a fresh context seeded with this state's input.
///
/// Workflows embedded in the parent definition are looked up first, then the
/// engine's workflow registry. The sub-workflow's final result becomes the
/// state's output.
pub(super) async fn execute(
    runner: &Runner,
    subflow: &SubflowState,
    input: Value,
    cancel: &CancellationToken,
) -> Result<StepOutcome, StateError> {
    let id = &subflow.workflow_id;
    let workflow = resolve(runner, subflow).ok_or_else(|| StateError::SubflowNotFound(id.clone()))?;

    let limit = runner.runtime.config.max_subflow_depth;
    if runner.depth >= limit {
        return Err(StateError::SubflowDepthExceeded {
            workflow_id: id.clone(),
            limit,
        });
    }

    let failed = |source: ExecutionError| match source {
        ExecutionError::Cancelled => StateError::Cancelled,
        // Reported once, against the outermost calling state.
        ExecutionError::SubflowDepthExceeded {
            workflow_id, limit, ..
        } => StateError::SubflowDepthExceeded { workflow_id, limit },
        source => StateError::Subflow {
            workflow_id: id.clone(),
            source: Box::new(source),
        },
    };

    let report = validate(&workflow);
    if !report.is_valid() {
        return Err(failed(ExecutionError::Definition(report.errors)));
    }

    let graph = StateGraph::root(&workflow).map_err(failed)?;
    let child = runner.descend(workflow);

    if !subflow.wait_for_completion {
        info!("Starting sub-workflow '{}' without waiting", id);
        let detached = cancel.child_token();
        let label = id.clone();
        tokio::spawn(async move {
            match child.run_graph(graph, input, detached).await {
                Ok(_) => debug!("Detached sub-workflow '{}' completed", label),
                Err(e) => error!("Detached sub-workflow '{}' failed: {}", label, e),
            }
        });
        return Ok(StepOutcome::output(json!({})));
    }

    debug!("Running sub-workflow '{}'", id);
    let result = child
        .run_graph(graph, input, cancel.clone())
        .await
        .map_err(failed)?;
    Ok(StepOutcome::output(result))
}

fn resolve(runner: &Runner, subflow: &SubflowState) -> Option<Arc<WorkflowDefinition>> {
    let version = subflow.version.as_deref();
    match runner.workflow.sub_workflow(&subflow.workflow_id, version) {
        Some(embedded) => Some(Arc::new(embedded.clone())),
        None => runner.runtime.workflows.resolve(&subflow.workflow_id, version),
    }
}
