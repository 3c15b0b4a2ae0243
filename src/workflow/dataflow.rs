//! Data-Flow Dry Run
//!
//! Walks a workflow once from its start state, calling its functions, to find
//! data that will be missing at run time: `inputCollection` selectors and
//! action arguments that resolve to `null` or to an empty collection. The
//! input view of every visited state and the context it leaves behind are
//! captured as [`StateSnapshot`]s.
//!
//! The walk follows declared transitions and evaluates switch conditions.
//! Each state of a graph is visited once; a transition back to a visited
//! state is reported as a cycle. ForEach iterators and Parallel branches are
//! walked in sequence on their own contexts. Sub-workflow, event and delay
//! states are stepped over without touching the context.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, info};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::model::{
    ActionDefinition, ActionMode, ForEachState, ParallelState, RetryPolicy, StateDefinition,
    StateKind, SwitchState, WorkflowDefinition,
};
use super::validator::{validate, ValidationStatus};
use crate::execution::context::{overlay, ContextStore};
use crate::execution::invoker::{ActionInvoker, ActionOutput, FunctionRegistry};
use crate::expression::{is_truthy, type_name, unwrap_expression, ExpressionEvaluator, JqEvaluator};

/// A data-flow problem found by the dry run.
#[derive(Debug, Clone, PartialEq)]
pub enum DataFlowIssue {
    Cycle(String),
    UnknownState(String),
    EmptyCollection {
        state: String,
        expression: String,
    },
    NotIterable {
        state: String,
        expression: String,
        found: String,
    },
    EmptyArgument {
        state: String,
        argument: String,
        expression: String,
    },
    ActionFailed {
        state: String,
        function: String,
        cause: String,
    },
    Expression {
        state: String,
        cause: String,
    },
    NoRoute(String),
}

impl std::fmt::Display for DataFlowIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cycle(state) => {
                write!(f, "Cycle detected in state transitions at state '{}'", state)
            }
            Self::UnknownState(state) => write!(f, "Transition to unknown state '{}'", state),
            Self::EmptyCollection { state, expression } => write!(
                f,
                "State '{}' inputCollection '{}' references undefined or empty data",
                state, expression
            ),
            Self::NotIterable {
                state,
                expression,
                found,
            } => write!(
                f,
                "State '{}' inputCollection '{}' produced {}, expected an array",
                state, expression, found
            ),
            Self::EmptyArgument {
                state,
                argument,
                expression,
            } => write!(
                f,
                "Action in state '{}' argument '{}: {}' references undefined or empty data",
                state, argument, expression
            ),
            Self::ActionFailed {
                state,
                function,
                cause,
            } => write!(f, "State '{}' action '{}' failed: {}", state, function, cause),
            Self::Expression { state, cause } => write!(f, "State '{}': {}", state, cause),
            Self::NoRoute(state) => write!(
                f,
                "Switch state '{}': no condition matched and no default condition is defined",
                state
            ),
        }
    }
}

/// Input view of a visited state and the data it produced.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: String,
    pub input: Value,
    /// The graph's context after the state's output was merged; the final
    /// result for `end` states
    pub output: Value,
}

/// Outcome of a dry run.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DataFlowReport {
    pub status: ValidationStatus,
    pub errors: Vec<String>,
    pub snapshots: Vec<StateSnapshot>,
}

impl DataFlowReport {
    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

/// Dry-runs `workflow` from its start state on a context seeded from `input`.
///
/// Structural validation runs first; a structurally invalid workflow is
/// reported with those errors and is not walked. Functions are called
/// through `functions` once each, without retries.
pub async fn validate_data_flow(
    workflow: &WorkflowDefinition,
    functions: Arc<dyn FunctionRegistry>,
    input: Option<Value>,
) -> DataFlowReport {
    let structural = validate(workflow);
    if !structural.is_valid() {
        return DataFlowReport {
            status: ValidationStatus::Invalid,
            errors: structural.errors,
            snapshots: Vec::new(),
        };
    }

    info!("Checking data flow of workflow '{}'", workflow.id);

    let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(JqEvaluator::new());
    let mut run = DryRun {
        workflow,
        invoker: ActionInvoker::new(functions, evaluator.clone()),
        evaluator,
        cancel: CancellationToken::new(),
        issues: Vec::new(),
        snapshots: Vec::new(),
    };

    if let Some(start) = workflow.start_state() {
        run.walk(&workflow.states, start.to_string(), input.unwrap_or(Value::Null))
            .await;
    }

    if run.issues.is_empty() {
        info!("Data flow of workflow '{}' is consistent", workflow.id);
    } else {
        debug!(
            "Workflow '{}' has {} data-flow issue(s)",
            workflow.id,
            run.issues.len()
        );
    }

    let status = if run.issues.is_empty() {
        ValidationStatus::Valid
    } else {
        ValidationStatus::Invalid
    };

    DataFlowReport {
        status,
        errors: run.issues.iter().map(|issue| issue.to_string()).collect(),
        snapshots: run.snapshots,
    }
}

enum Next {
    To(String),
    Stop,
}

struct DryRun<'w> {
    workflow: &'w WorkflowDefinition,
    invoker: ActionInvoker,
    evaluator: Arc<dyn ExpressionEvaluator>,
    cancel: CancellationToken,
    issues: Vec<DataFlowIssue>,
    snapshots: Vec<StateSnapshot>,
}

impl DryRun<'_> {
    /// Walks one graph on its own context and returns the value it ends with.
    fn walk<'a>(
        &'a mut self,
        states: &'a [StateDefinition],
        start: String,
        initial: Value,
    ) -> BoxFuture<'a, Value> {
        async move {
            let mut context = ContextStore::seeded(initial);
            let mut visited = HashSet::new();
            let mut current = start;

            loop {
                let Some(state) = states.iter().find(|s| s.name == current) else {
                    self.issues.push(DataFlowIssue::UnknownState(current));
                    break;
                };
                if !visited.insert(state.name.as_str()) {
                    self.issues.push(DataFlowIssue::Cycle(state.name.clone()));
                    break;
                }

                let snapshot = context.snapshot();
                let input = match state.input_filter() {
                    Some(filter) => match self.evaluate(&state.name, filter, &snapshot) {
                        Some(value) => value,
                        None => break,
                    },
                    None => snapshot,
                };

                debug!("Dry-running {} state '{}'", state.type_name(), state.name);
                let (output, next) = self.visit(state, input.clone()).await;

                let output = match (output, state.output_filter()) {
                    (Some(value), Some(filter)) => match self.evaluate(&state.name, filter, &value) {
                        Some(filtered) => Some(filtered),
                        None => break,
                    },
                    (output, _) => output,
                };

                if state.is_end_state() {
                    let result = output.unwrap_or_else(|| context.snapshot());
                    self.record(&state.name, input, result.clone());
                    return result;
                }

                if let Some(value) = output {
                    context.merge(&state.output_key(), value);
                }
                self.record(&state.name, input, context.snapshot());

                match next {
                    Next::To(target) => current = target,
                    Next::Stop => break,
                }
            }

            context.into_value()
        }
        .boxed()
    }

    async fn visit(&mut self, state: &StateDefinition, input: Value) -> (Option<Value>, Next) {
        let output = match &state.kind {
            StateKind::Operation(operation) => {
                let results = self
                    .run_actions(&state.name, &operation.actions, operation.action_mode, &input)
                    .await;
                Some(Value::Object(results))
            }
            StateKind::Switch(switch) => {
                let next = self.route(state, switch, &input);
                return (Some(input), next);
            }
            StateKind::ForEach(each) => Some(self.for_each(state, each, &input).await),
            StateKind::Parallel(parallel) => Some(self.parallel(state, parallel, &input).await),
            StateKind::Inject(inject) => Some(inject.data.clone()),
            StateKind::End(_) => Some(input),
            StateKind::Subflow(_) | StateKind::Event(_) | StateKind::Delay(_) => None,
        };

        (output, declared(state))
    }

    fn route(&mut self, state: &StateDefinition, switch: &SwitchState, input: &Value) -> Next {
        for condition in &switch.data_conditions {
            match self.evaluate(&state.name, &condition.condition, input) {
                Some(verdict) if is_truthy(&verdict) => {
                    return target(state, condition.transition.as_deref(), condition.end)
                }
                Some(_) => {}
                None => return Next::Stop,
            }
        }

        match &switch.default_condition {
            Some(default) => target(state, default.transition.as_deref(), default.end),
            None => {
                self.issues.push(DataFlowIssue::NoRoute(state.name.clone()));
                Next::Stop
            }
        }
    }

    async fn run_actions(
        &mut self,
        state: &str,
        actions: &[ActionDefinition],
        mode: ActionMode,
        input: &Value,
    ) -> Map<String, Value> {
        let mut results = Map::new();

        for action in actions {
            let scope = match mode {
                ActionMode::Sequential => overlay(input, &results),
                ActionMode::Parallel => input.clone(),
            };
            self.check_arguments(state, action, &scope);

            let once = single_attempt(action);
            let performed = self
                .invoker
                .perform(self.workflow, &once, &scope, &self.cancel)
                .await;

            match performed {
                Ok(Some(ActionOutput { key, value })) => {
                    results.insert(key, value);
                }
                Ok(None) => {}
                Err(e) => self.issues.push(DataFlowIssue::ActionFailed {
                    state: state.to_string(),
                    function: action.function_ref.ref_name.clone(),
                    cause: e.to_string(),
                }),
            }
        }

        results
    }

    /// Flags `${ }` arguments that resolve to nothing.
    fn check_arguments(&mut self, state: &str, action: &ActionDefinition, scope: &Value) {
        let from_state_data = action
            .action_data_filter
            .as_ref()
            .and_then(|f| f.from_state_data.as_deref());
        let scope = match from_state_data {
            Some(filter) => match self.evaluator.evaluate(filter, scope) {
                Ok(value) => value,
                // Reported when the action runs.
                Err(_) => return,
            },
            None => scope.clone(),
        };

        let expressions: Vec<(String, &str)> = match &action.function_ref.arguments {
            Some(Value::Object(fields)) => fields
                .iter()
                .filter_map(|(name, value)| {
                    let expression = value.as_str().and_then(unwrap_expression)?;
                    Some((name.clone(), expression))
                })
                .collect(),
            Some(Value::String(text)) => unwrap_expression(text)
                .map(|expression| vec![("arguments".to_string(), expression)])
                .unwrap_or_default(),
            _ => Vec::new(),
        };

        for (argument, expression) in expressions {
            if let Ok(value) = self.evaluator.evaluate(expression, &scope) {
                if is_missing(&value) {
                    self.issues.push(DataFlowIssue::EmptyArgument {
                        state: state.to_string(),
                        argument,
                        expression: expression.to_string(),
                    });
                }
            }
        }
    }

    async fn for_each(&mut self, state: &StateDefinition, each: &ForEachState, input: &Value) -> Value {
        let mut results = Vec::new();

        match self.evaluate(&state.name, &each.input_collection, input) {
            Some(Value::Array(items)) if !items.is_empty() => {
                for (index, item) in items.into_iter().enumerate() {
                    let mut binding = Map::new();
                    binding.insert(each.iteration_param.clone(), item);
                    let item_input = overlay(input, &binding);

                    let result = match each.iterator.first() {
                        Some(first) => {
                            let start = first.name.clone();
                            self.walk(&each.iterator, start, item_input).await
                        }
                        None => {
                            let output = self
                                .run_actions(&state.name, &each.actions, ActionMode::Sequential, &item_input)
                                .await;
                            let output = Value::Object(output);
                            self.record(&format!("{}[{}]", state.name, index), item_input, output.clone());
                            output
                        }
                    };
                    results.push(result);
                }
            }
            Some(value) if is_missing(&value) => self.issues.push(DataFlowIssue::EmptyCollection {
                state: state.name.clone(),
                expression: each.input_collection.clone(),
            }),
            Some(other) => self.issues.push(DataFlowIssue::NotIterable {
                state: state.name.clone(),
                expression: each.input_collection.clone(),
                found: type_name(&other).to_string(),
            }),
            None => {}
        }

        json!({ "results": results })
    }

    async fn parallel(&mut self, state: &StateDefinition, parallel: &ParallelState, input: &Value) -> Value {
        let mut outputs = Map::new();

        for branch in &parallel.branches {
            let label = format!("{}/{}", state.name, branch.name);
            let value = match branch.states.first() {
                Some(first) => {
                    let start = first.name.clone();
                    self.walk(&branch.states, start, input.clone()).await
                }
                None => Value::Object(
                    self.run_actions(&label, &branch.actions, ActionMode::Sequential, input)
                        .await,
                ),
            };

            let value = match &branch.output_filter {
                Some(filter) => match self.evaluate(&label, filter, &value) {
                    Some(filtered) => filtered,
                    None => continue,
                },
                None => value,
            };

            if !value.is_null() {
                outputs.insert(branch.output_key(), value);
            }
        }

        overlay(input, &outputs)
    }

    fn evaluate(&mut self, state: &str, expression: &str, input: &Value) -> Option<Value> {
        match self.evaluator.evaluate(expression, input) {
            Ok(value) => Some(value),
            Err(e) => {
                self.issues.push(DataFlowIssue::Expression {
                    state: state.to_string(),
                    cause: e.to_string(),
                });
                None
            }
        }
    }

    fn record(&mut self, state: &str, input: Value, output: Value) {
        self.snapshots.push(StateSnapshot {
            state: state.to_string(),
            input,
            output,
        });
    }
}

/// The state's own `transition`, unless it ends the graph.
fn declared(state: &StateDefinition) -> Next {
    match &state.transition {
        Some(next) if !state.end => Next::To(next.clone()),
        _ => Next::Stop,
    }
}

fn target(state: &StateDefinition, transition: Option<&str>, end: bool) -> Next {
    match transition {
        Some(next) => Next::To(next.to_string()),
        None if end => Next::Stop,
        None => declared(state),
    }
}

/// `null`, `[]` and `{}` count as missing data.
fn is_missing(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn single_attempt(action: &ActionDefinition) -> ActionDefinition {
    let mut action = action.clone();
    action.retry = Some(RetryPolicy::default());
    action.retry_ref = None;
    action
}
