//! Workflow Execution Engine
//!
//! The engine walks a workflow's state graph:
//! - Looks up the current state and guards against endless cycles
//! - Applies the state's input filter to the context
//! - Dispatches to the executor for the state's type
//! - Applies the output filter and merges the output into the context
//! - Follows the transition, or stops at an end
//!
//! Nested graphs (ForEach iterators, Parallel branch states, sub-workflows)
//! run through the same loop on their own private context.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, log_enabled, Level};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::ContextStore;
use super::events::{ChannelEventSource, EventSource};
use super::invoker::{ActionInvoker, FunctionRegistry};
use super::record::ExecutionRecord;
use super::scheduler::BranchScheduler;
use super::states::{self, Route};
use crate::config::EngineConfig;
use crate::error::{ExecutionError, StateError};
use crate::expression::{ExpressionEvaluator, JqEvaluator};
use crate::monitoring::{ExecutionTimeline, TimelineEventKind};
use crate::workflow::model::{StateDefinition, WorkflowDefinition};
use crate::workflow::registry::{InMemoryWorkflowRegistry, WorkflowRegistry};
use crate::workflow::validator::validate;

/// Collaborators shared by every graph run of one `execute` call.
pub(crate) struct Runtime {
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub invoker: ActionInvoker,
    pub workflows: Arc<dyn WorkflowRegistry>,
    pub events: Arc<dyn EventSource>,
    pub scheduler: BranchScheduler,
    pub config: EngineConfig,
}

/// Executes graphs belonging to one workflow definition.
#[derive(Clone)]
pub(crate) struct Runner {
    pub runtime: Arc<Runtime>,
    pub workflow: Arc<WorkflowDefinition>,
    /// Sub-workflow levels between this runner and the top-level run
    pub depth: usize,
}

/// A sequence of states with a start, run on its own context.
#[derive(Debug, Clone)]
pub(crate) struct StateGraph {
    pub states: Arc<Vec<StateDefinition>>,
    pub start: String,
    /// Identifies the graph in logs and records
    pub label: String,
}

impl StateGraph {
    /// The top-level graph of a workflow.
    pub fn root(workflow: &WorkflowDefinition) -> Result<Self, ExecutionError> {
        let start = workflow
            .start_state()
            .ok_or_else(|| ExecutionError::Definition(vec!["Workflow has no states".to_string()]))?;

        Ok(Self {
            states: Arc::new(workflow.states.clone()),
            start: start.to_string(),
            label: workflow.id.clone(),
        })
    }

    /// A nested graph starting at its first state.
    pub fn nested(states: &[StateDefinition], label: String) -> Result<Self, ExecutionError> {
        let start = states
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| ExecutionError::Definition(vec![format!("{} has no states", label)]))?;

        Ok(Self {
            states: Arc::new(states.to_vec()),
            start,
            label,
        })
    }

    fn get(&self, name: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.name == name)
    }
}

enum Flow {
    Continue(String),
    Finish(Value),
}

impl Runner {
    pub fn new(runtime: Arc<Runtime>, workflow: Arc<WorkflowDefinition>) -> Self {
        Self {
            runtime,
            workflow,
            depth: 0,
        }
    }

    /// Runner for a sub-workflow started from this one, one level deeper.
    pub fn descend(&self, workflow: Arc<WorkflowDefinition>) -> Self {
        Self {
            runtime: self.runtime.clone(),
            workflow,
            depth: self.depth + 1,
        }
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.runtime.evaluator.as_ref()
    }

    /// Runs a graph to completion on a context seeded from `initial`.
    ///
    /// Boxed so executors can start nested runs.
    pub fn run_graph(
        self,
        graph: StateGraph,
        initial: Value,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Value, ExecutionError>> {
        async move { self.drive(&graph, initial, &cancel).await }.boxed()
    }

    async fn drive(
        &self,
        graph: &StateGraph,
        initial: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let mut context = ContextStore::seeded(initial);
        let mut record = ExecutionRecord::new(&graph.label);
        let mut timeline = ExecutionTimeline::new();
        let mut current = graph.start.clone();

        debug!("Running graph '{}' from state '{}'", graph.label, current);

        let result = loop {
            match self
                .step(graph, &mut context, &mut record, &mut timeline, &current, cancel)
                .await
            {
                Ok(Flow::Continue(next)) => current = next,
                Ok(Flow::Finish(value)) => break Ok(value),
                Err(e) => break Err(e),
            }
        };

        match &result {
            Ok(_) => debug!(
                "Graph '{}' finished after {} state(s) in {} ms",
                graph.label,
                record.trail.len(),
                timeline.elapsed().as_millis()
            ),
            Err(e) => debug!("Graph '{}' stopped: {}", graph.label, e),
        }
        if log_enabled!(Level::Debug) {
            debug!("{}", timeline.gantt_chart());
        }

        result
    }

    async fn step(
        &self,
        graph: &StateGraph,
        context: &mut ContextStore,
        record: &mut ExecutionRecord,
        timeline: &mut ExecutionTimeline,
        current: &str,
        cancel: &CancellationToken,
    ) -> Result<Flow, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let state = graph
            .get(current)
            .ok_or_else(|| ExecutionError::UnknownState(current.to_string()))?;

        let limit = self.runtime.config.max_state_visits;
        if record.enter(&state.name) > limit {
            record.mark_failed(&state.name, "cycle limit exceeded");
            return Err(ExecutionError::CycleLimitExceeded {
                state: state.name.clone(),
                limit,
            });
        }

        debug!("Entering {} state '{}'", state.type_name(), state.name);
        timeline.add_event(&state.name, TimelineEventKind::Started);

        let (output, route) = match self.run_state(state, context, cancel).await {
            Ok(done) => done,
            Err(cause) => {
                timeline.add_event(&state.name, TimelineEventKind::Failed);
                let err = ExecutionError::in_state(&state.name, cause);
                if !matches!(err, ExecutionError::Cancelled) {
                    error!("State '{}' failed: {}", state.name, err);
                }
                record.mark_failed(&state.name, &err.to_string());
                return Err(err);
            }
        };

        timeline.add_event(&state.name, TimelineEventKind::Completed);
        record.mark_completed(&state.name);

        if state.is_end_state() {
            return Ok(Flow::Finish(output.unwrap_or_else(|| context.snapshot())));
        }

        if let Some(value) = output {
            context.merge(&state.output_key(), value);
        }

        let next = match route {
            Route::To(next) => next,
            Route::End => return Ok(Flow::Finish(std::mem::take(context).into_value())),
            Route::Declared if state.end => {
                return Ok(Flow::Finish(std::mem::take(context).into_value()))
            }
            Route::Declared => state.transition.clone().ok_or_else(|| {
                ExecutionError::in_state(&state.name, StateError::MissingTransition)
            })?,
        };

        debug!("State '{}' transitions to '{}'", state.name, next);
        Ok(Flow::Continue(next))
    }

    /// Filters the input, executes the state and filters its output.
    async fn run_state(
        &self,
        state: &StateDefinition,
        context: &ContextStore,
        cancel: &CancellationToken,
    ) -> Result<(Option<Value>, Route), StateError> {
        let snapshot = context.snapshot();
        let input = match state.input_filter() {
            Some(filter) => self.evaluator().evaluate(filter, &snapshot)?,
            None => snapshot,
        };

        let outcome = states::execute(self, state, input, cancel).await?;

        let output = match (outcome.output, state.output_filter()) {
            (Some(value), Some(filter)) => Some(self.evaluator().evaluate(filter, &value)?),
            (output, _) => output,
        };

        Ok((output, outcome.route))
    }
}

/// Workflow execution engine.
///
/// Holds the collaborators a run needs: the function registry, the expression
/// evaluator, the sub-workflow registry and the event source. Each call to
/// [`execute`](Engine::execute) is an independent run with its own context.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowrunner::execution::{Engine, InMemoryFunctionRegistry};
/// use flowrunner::load_workflow;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let functions = InMemoryFunctionRegistry::new()
///         .with_function("greet", |args| Ok(json!(format!("hello {}", args["name"]))));
///
///     let workflow = load_workflow("greeting.yaml")?;
///     let mut engine = Engine::new(Arc::new(functions));
///     engine.set_max_state_visits(100);
///
///     let result = engine.execute(&workflow, Some(json!({"name": "world"}))).await?;
///     println!("{}", result);
///     Ok(())
/// }
/// ```
pub struct Engine {
    functions: Arc<dyn FunctionRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    workflows: Arc<dyn WorkflowRegistry>,
    events: Arc<dyn EventSource>,
    config: EngineConfig,
}

impl Engine {
    /// Creates an engine with the jq evaluator, no registered sub-workflows
    /// and an empty in-process event source.
    pub fn new(functions: Arc<dyn FunctionRegistry>) -> Self {
        Self {
            functions,
            evaluator: Arc::new(JqEvaluator),
            workflows: Arc::new(InMemoryWorkflowRegistry::new()),
            events: Arc::new(ChannelEventSource::new()),
            config: EngineConfig::default(),
        }
    }

    pub fn set_evaluator(&mut self, evaluator: Arc<dyn ExpressionEvaluator>) {
        self.evaluator = evaluator;
    }

    pub fn set_workflow_registry(&mut self, workflows: Arc<dyn WorkflowRegistry>) {
        self.workflows = workflows;
    }

    pub fn set_event_source(&mut self, events: Arc<dyn EventSource>) {
        self.events = events;
    }

    pub fn set_config(&mut self, config: EngineConfig) {
        self.config = config;
    }

    /// Sets how often a single state may be entered in one run.
    pub fn set_max_state_visits(&mut self, max: usize) {
        self.config.max_state_visits = max;
    }

    /// Sets how deeply sub-workflows may nest before a run fails.
    pub fn set_max_subflow_depth(&mut self, max: usize) {
        self.config.max_subflow_depth = max;
    }

    /// Sets the default bound for parallel ForEach iteration.
    pub fn set_max_concurrency(&mut self, max: usize) {
        self.config.max_concurrency = max.max(1);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates and executes a workflow, returning its final context.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        initial: Option<Value>,
    ) -> Result<Value, ExecutionError> {
        self.execute_with_cancellation(workflow, initial, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Engine::execute), stopping at the next safe point
    /// once `cancel` fires.
    pub async fn execute_with_cancellation(
        &self,
        workflow: &WorkflowDefinition,
        initial: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, ExecutionError> {
        let report = validate(workflow);
        if !report.is_valid() {
            error!(
                "Workflow '{}' is invalid ({} error(s)), not executing",
                workflow.id,
                report.errors.len()
            );
            return Err(ExecutionError::Definition(report.errors));
        }

        let graph = StateGraph::root(workflow)?;
        let runner = Runner::new(Arc::new(self.runtime()), Arc::new(workflow.clone()));

        info!("Starting workflow '{}' at state '{}'", workflow.id, graph.start);

        let result = runner
            .run_graph(graph, initial.unwrap_or(Value::Null), cancel)
            .await;

        match &result {
            Ok(_) => info!("Workflow '{}' completed", workflow.id),
            Err(e) => error!("Workflow '{}' failed: {}", workflow.id, e),
        }

        result
    }

    pub(crate) fn runtime(&self) -> Runtime {
        Runtime {
            evaluator: self.evaluator.clone(),
            invoker: ActionInvoker::new(self.functions.clone(), self.evaluator.clone()),
            workflows: self.workflows.clone(),
            events: self.events.clone(),
            scheduler: BranchScheduler::new(),
            config: self.config.clone(),
        }
    }
}
