//! Workflow Data Model
//!
//! Data structures for CNCF Serverless Workflow definitions: a graph of typed
//! states connected by transitions, plus the functions and retry policies the
//! states refer to by name.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: order-processing
//! start: Prepare
//! functions:
//!   - name: chargeCard
//!   - name: double
//!     type: expression
//!     operation: ". * 2"
//! states:
//!   - name: Prepare
//!     type: operation
//!     actions:
//!       - functionRef:
//!           refName: chargeCard
//!           arguments:
//!             amount: "${ .order.total }"
//!         retry:
//!           maxAttempts: 3
//!           backoff: { strategy: exponential, initialDelayMs: 100 }
//!     transition: Done
//!
//!   - name: Done
//!     type: end
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A complete workflow definition. Immutable once loaded.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Unique workflow identifier
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_version: Option<String>,

    /// Name of the first state; defaults to the first declared state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<FunctionDefinition>,

    /// Named retry policies referenced by actions through `retryRef`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retries: Vec<RetryDefinition>,

    pub states: Vec<StateDefinition>,

    /// Workflows embedded in this document, resolvable by subflow states
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_workflows: Vec<WorkflowDefinition>,
}

impl WorkflowDefinition {
    /// Creates an empty workflow with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            name: None,
            spec_version: None,
            start: None,
            functions: Vec::new(),
            retries: Vec::new(),
            states: Vec::new(),
            sub_workflows: Vec::new(),
        }
    }

    pub fn with_start(mut self, start: impl Into<String>) -> Self {
        self.start = Some(start.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_state(mut self, state: StateDefinition) -> Self {
        self.states.push(state);
        self
    }

    pub fn with_function(mut self, function: FunctionDefinition) -> Self {
        self.functions.push(function);
        self
    }

    pub fn with_retry(mut self, retry: RetryDefinition) -> Self {
        self.retries.push(retry);
        self
    }

    pub fn with_sub_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        self.sub_workflows.push(workflow);
        self
    }

    /// Name of the state execution begins at.
    pub fn start_state(&self) -> Option<&str> {
        self.start
            .as_deref()
            .or_else(|| self.states.first().map(|s| s.name.as_str()))
    }

    /// Gets a state by name.
    pub fn get_state(&self, name: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Gets a function definition by name.
    pub fn function(&self, name: &str) -> Option<&FunctionDefinition> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Gets a named retry policy.
    pub fn retry(&self, name: &str) -> Option<&RetryPolicy> {
        self.retries
            .iter()
            .find(|r| r.name == name)
            .map(|r| &r.policy)
    }

    /// Finds an embedded sub-workflow by id and optional version.
    pub fn sub_workflow(&self, id: &str, version: Option<&str>) -> Option<&WorkflowDefinition> {
        self.sub_workflows.iter().find(|w| {
            w.id == id && version.map_or(true, |v| w.version.as_deref() == Some(v))
        })
    }

    /// Returns the number of top-level states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if the workflow has no states.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// How a function is invoked.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    /// Resolved through the host's function registry
    #[default]
    Custom,
    Rest,
    Rpc,
    Graphql,
    /// Evaluates `operation` as an expression over the arguments
    Expression,
}

/// An invocation target referenced by actions.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,

    /// Operation descriptor (an expression for `type: expression`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: FunctionKind,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl FunctionDefinition {
    /// A function resolved through the function registry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: None,
            kind: FunctionKind::Custom,
            metadata: Map::new(),
        }
    }

    /// A function implemented by an expression over its arguments.
    pub fn expression(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: Some(operation.into()),
            kind: FunctionKind::Expression,
            metadata: Map::new(),
        }
    }
}

/// Delay schedule between retry attempts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Backoff {
    Fixed {
        #[serde(rename = "delayMs", default)]
        delay_ms: u64,
    },
    Exponential {
        #[serde(rename = "initialDelayMs")]
        initial_delay_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(rename = "maxDelayMs", default, skip_serializing_if = "Option::is_none")]
        max_delay_ms: Option<u64>,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed { delay_ms: 0 }
    }
}

impl Backoff {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let mut millis = *initial_delay_ms as f64 * multiplier.powi(exponent);
                if let Some(max) = max_delay_ms {
                    millis = millis.min(*max as f64);
                }
                Duration::from_millis(millis.clamp(0.0, u64::MAX as f64) as u64)
            }
        }
    }
}

/// How often, and how patiently, a failed action is retried.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }
}

/// A workflow-level retry policy addressable by name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RetryDefinition {
    pub name: String,

    #[serde(flatten)]
    pub policy: RetryPolicy,
}

/// Reference to a function plus its argument template.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRef {
    pub ref_name: String,

    /// Template evaluated against the action scope; `${ ... }` strings are
    /// expressions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Filters applied around a single action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionDataFilter {
    /// Narrows the scope the arguments are built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state_data: Option<String>,

    /// Filters the raw function result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,

    /// Key the result is stored under, instead of the action name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state_data: Option<String>,

    #[serde(default = "default_true")]
    pub use_results: bool,
}

fn default_true() -> bool {
    true
}

/// One function call inside an operation-like block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub function_ref: FunctionRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_data_filter: Option<ActionDataFilter>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_ref: Option<String>,
}

impl ActionDefinition {
    /// Creates an action calling the named function.
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            name: None,
            function_ref: FunctionRef {
                ref_name: function.into(),
                arguments: None,
            },
            action_data_filter: None,
            retry: None,
            retry_ref: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.function_ref.arguments = Some(arguments);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_retry_ref(mut self, name: impl Into<String>) -> Self {
        self.retry_ref = Some(name.into());
        self
    }

    pub fn with_data_filter(mut self, filter: ActionDataFilter) -> Self {
        self.action_data_filter = Some(filter);
        self
    }

    /// Key this action's result is stored under.
    pub fn result_key(&self) -> &str {
        self.action_data_filter
            .as_ref()
            .and_then(|f| f.to_state_data.as_deref())
            .or(self.name.as_deref())
            .unwrap_or(&self.function_ref.ref_name)
    }
}

/// Input/output filters of a state.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StateDataFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// A node of the workflow graph.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateDefinition {
    /// Unique name within its graph
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_data_filter: Option<StateDataFilter>,

    /// Name of the next state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,

    /// Ends the run after this state
    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,

    /// Context key the output is merged under; defaults to `<name>Output`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,

    #[serde(flatten)]
    pub kind: StateKind,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl StateDefinition {
    pub fn new(name: impl Into<String>, kind: StateKind) -> Self {
        Self {
            name: name.into(),
            state_data_filter: None,
            transition: None,
            end: false,
            output_key: None,
            kind,
        }
    }

    pub fn with_transition(mut self, next: impl Into<String>) -> Self {
        self.transition = Some(next.into());
        self
    }

    pub fn ending(mut self) -> Self {
        self.end = true;
        self
    }

    pub fn with_input_filter(mut self, expression: impl Into<String>) -> Self {
        self.state_data_filter
            .get_or_insert_with(StateDataFilter::default)
            .input = Some(expression.into());
        self
    }

    pub fn with_output_filter(mut self, expression: impl Into<String>) -> Self {
        self.state_data_filter
            .get_or_insert_with(StateDataFilter::default)
            .output = Some(expression.into());
        self
    }

    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Context key this state's output is merged under.
    pub fn output_key(&self) -> String {
        self.output_key
            .clone()
            .unwrap_or_else(|| format!("{}Output", self.name))
    }

    pub fn input_filter(&self) -> Option<&str> {
        self.state_data_filter.as_ref()?.input.as_deref()
    }

    pub fn output_filter(&self) -> Option<&str> {
        self.state_data_filter.as_ref()?.output.as_deref()
    }

    /// True for `type: end` states.
    pub fn is_end_state(&self) -> bool {
        matches!(self.kind, StateKind::End(_))
    }

    /// Short name of the state type, as written in documents.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }
}

/// Variant-specific part of a state, tagged by `type`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StateKind {
    Operation(OperationState),
    Switch(SwitchState),
    #[serde(rename = "foreach")]
    ForEach(ForEachState),
    Parallel(ParallelState),
    Subflow(SubflowState),
    Event(EventState),
    Delay(DelayState),
    Inject(InjectState),
    End(EndState),
}

impl StateKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Operation(_) => "operation",
            Self::Switch(_) => "switch",
            Self::ForEach(_) => "foreach",
            Self::Parallel(_) => "parallel",
            Self::Subflow(_) => "subflow",
            Self::Event(_) => "event",
            Self::Delay(_) => "delay",
            Self::Inject(_) => "inject",
            Self::End(_) => "end",
        }
    }
}

/// Whether an operation's actions run one after another or together.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    #[default]
    Sequential,
    Parallel,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    #[serde(default)]
    pub action_mode: ActionMode,

    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
}

impl OperationState {
    pub fn new(actions: Vec<ActionDefinition>) -> Self {
        Self {
            action_mode: ActionMode::Sequential,
            actions,
        }
    }
}

/// A switch target: either a transition or the end of the run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DefaultCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DataCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub condition: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub end: bool,
}

impl DataCondition {
    pub fn new(condition: impl Into<String>, transition: impl Into<String>) -> Self {
        Self {
            name: None,
            condition: condition.into(),
            transition: Some(transition.into()),
            end: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchState {
    #[serde(default)]
    pub data_conditions: Vec<DataCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_condition: Option<DefaultCondition>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IterationMode {
    #[default]
    Sequential,
    Parallel,
}

/// What a ForEach state does when one item fails.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemFailurePolicy {
    /// Fail the state on the first item failure
    #[default]
    Abort,
    /// Store `null` for the failed item and keep going
    Skip,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForEachState {
    /// Expression selecting the array to iterate
    pub input_collection: String,

    /// Key the current item is bound under in the per-item input
    #[serde(default = "default_iteration_param")]
    pub iteration_param: String,

    /// Operation-like body run per item
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDefinition>,

    /// Embedded state sequence run per item
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub iterator: Vec<StateDefinition>,

    #[serde(default)]
    pub mode: IterationMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub on_item_failure: ItemFailurePolicy,
}

fn default_iteration_param() -> String {
    "item".to_string()
}

impl ForEachState {
    pub fn new(input_collection: impl Into<String>) -> Self {
        Self {
            input_collection: input_collection.into(),
            iteration_param: default_iteration_param(),
            actions: Vec::new(),
            iterator: Vec::new(),
            mode: IterationMode::Sequential,
            max_concurrency: None,
            on_item_failure: ItemFailurePolicy::Abort,
        }
    }
}

/// How many branches must succeed for a parallel state to succeed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum JoinPolicy {
    #[default]
    All,
    AtLeast(usize),
}

impl std::str::FromStr for JoinPolicy {
    type Err = String;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text == "all" || text == "allOf" {
            return Ok(Self::All);
        }

        text.strip_prefix("atLeast(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|n| n.trim().parse().ok())
            .map(Self::AtLeast)
            .ok_or_else(|| format!("invalid join policy '{}': expected \"all\" or \"atLeast(N)\"", text))
    }
}

impl TryFrom<String> for JoinPolicy {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse()
    }
}

impl From<JoinPolicy> for String {
    fn from(policy: JoinPolicy) -> Self {
        policy.to_string()
    }
}

impl std::fmt::Display for JoinPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::AtLeast(n) => write!(f, "atLeast({})", n),
        }
    }
}

/// One independent path of a parallel state.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BranchDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDefinition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDefinition>,

    /// Applied to the branch result before it is joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filter: Option<String>,

    /// Key in the parallel output; defaults to `<name>Output`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

impl BranchDefinition {
    pub fn with_actions(name: impl Into<String>, actions: Vec<ActionDefinition>) -> Self {
        Self {
            name: name.into(),
            actions,
            states: Vec::new(),
            output_filter: None,
            output_key: None,
        }
    }

    pub fn with_states(name: impl Into<String>, states: Vec<StateDefinition>) -> Self {
        Self {
            name: name.into(),
            actions: Vec::new(),
            states,
            output_filter: None,
            output_key: None,
        }
    }

    pub fn with_output_filter(mut self, expression: impl Into<String>) -> Self {
        self.output_filter = Some(expression.into());
        self
    }

    pub fn output_key(&self) -> String {
        self.output_key
            .clone()
            .unwrap_or_else(|| format!("{}Output", self.name))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ParallelState {
    pub branches: Vec<BranchDefinition>,

    #[serde(default)]
    pub join: JoinPolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubflowState {
    pub workflow_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// When false the sub-workflow is started and the state completes at once
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
}

impl SubflowState {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version: None,
            wait_for_completion: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventState {
    /// Name of the awaited event
    pub event: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Followed when the timeout elapses; without it a timeout fails the state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_transition: Option<String>,

    /// Applied to the received event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data_filter: Option<String>,
}

impl EventState {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            timeout_ms: None,
            timeout_transition: None,
            event_data_filter: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelayState {
    pub delay_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct InjectState {
    #[serde(default)]
    pub data: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EndState {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_operation_state() {
        let yaml = r#"
name: Prepare
type: operation
transition: Done
stateDataFilter:
  input: "${ .order }"
actions:
  - functionRef:
      refName: charge
      arguments:
        amount: "${ .total }"
    retry:
      maxAttempts: 3
      backoff:
        strategy: exponential
        initialDelayMs: 10
"#;
        let state: StateDefinition = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(state.name, "Prepare");
        assert_eq!(state.transition.as_deref(), Some("Done"));
        assert_eq!(state.input_filter(), Some("${ .order }"));
        let StateKind::Operation(op) = &state.kind else {
            panic!("expected operation state");
        };
        assert_eq!(op.actions.len(), 1);
        assert_eq!(op.actions[0].function_ref.ref_name, "charge");
        let retry = op.actions[0].retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(
            retry.backoff,
            Backoff::Exponential {
                initial_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: None
            }
        );
    }

    #[test]
    fn test_deserialize_end_and_foreach_states() {
        let yaml = r#"
id: wf
states:
  - name: Loop
    type: foreach
    inputCollection: "${ .items }"
    mode: parallel
    maxConcurrency: 2
    actions:
      - functionRef: { refName: work }
    end: true
  - name: Finish
    type: end
"#;
        let workflow: WorkflowDefinition = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(workflow.start_state(), Some("Loop"));
        let StateKind::ForEach(each) = &workflow.states[0].kind else {
            panic!("expected foreach state");
        };
        assert_eq!(each.iteration_param, "item");
        assert_eq!(each.mode, IterationMode::Parallel);
        assert_eq!(each.max_concurrency, Some(2));
        assert!(workflow.states[0].end);
        assert!(workflow.states[1].is_end_state());
    }

    #[test]
    fn test_deserialize_parallel_join_policy() {
        let yaml = r#"
name: Fan
type: parallel
join: "atLeast(2)"
branches:
  - name: A
    actions: [{ functionRef: { refName: a } }]
  - name: B
    actions: [{ functionRef: { refName: b } }]
end: true
"#;
        let state: StateDefinition = serde_yaml::from_str(yaml).unwrap();
        let StateKind::Parallel(parallel) = &state.kind else {
            panic!("expected parallel state");
        };
        assert_eq!(parallel.join, JoinPolicy::AtLeast(2));
        assert_eq!(parallel.branches[0].output_key(), "AOutput");
    }

    #[test]
    fn test_join_policy_parsing() {
        assert_eq!("all".parse::<JoinPolicy>().unwrap(), JoinPolicy::All);
        assert_eq!("atLeast(3)".parse::<JoinPolicy>().unwrap(), JoinPolicy::AtLeast(3));
        assert!("most".parse::<JoinPolicy>().is_err());
        assert!("atLeast(x)".parse::<JoinPolicy>().is_err());
        assert_eq!(JoinPolicy::AtLeast(2).to_string(), "atLeast(2)");
    }

    #[test]
    fn test_state_serialization_keeps_type_tag() {
        let state = StateDefinition::new(
            "Seed",
            StateKind::Inject(InjectState {
                data: json!({"value": 1}),
            }),
        )
        .with_transition("Next");

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["type"], "inject");
        assert_eq!(value["transition"], "Next");
        assert_eq!(value["data"], json!({"value": 1}));
        assert!(value.get("end").is_none());
    }

    #[test]
    fn test_output_key_default_and_override() {
        let state = StateDefinition::new("ForEachState", StateKind::End(EndState {}));
        assert_eq!(state.output_key(), "ForEachStateOutput");

        let state = state.with_output_key("results");
        assert_eq!(state.output_key(), "results");
    }

    #[test]
    fn test_action_result_key_precedence() {
        let action = ActionDefinition::new("method1");
        assert_eq!(action.result_key(), "method1");

        let action = action.with_name("first");
        assert_eq!(action.result_key(), "first");

        let action = action.with_data_filter(ActionDataFilter {
            from_state_data: None,
            results: None,
            to_state_data: Some("stored".to_string()),
            use_results: true,
        });
        assert_eq!(action.result_key(), "stored");
    }

    #[test]
    fn test_backoff_delays() {
        let fixed = Backoff::Fixed { delay_ms: 25 };
        assert_eq!(fixed.delay_for(1), Duration::from_millis(25));
        assert_eq!(fixed.delay_for(5), Duration::from_millis(25));

        let exponential = Backoff::Exponential {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: Some(350),
        };
        assert_eq!(exponential.delay_for(1), Duration::from_millis(100));
        assert_eq!(exponential.delay_for(2), Duration::from_millis(200));
        assert_eq!(exponential.delay_for(3), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_definition_lookup() {
        let workflow = WorkflowDefinition::new("wf").with_retry(RetryDefinition {
            name: "patient".to_string(),
            policy: RetryPolicy::new(5, Backoff::Fixed { delay_ms: 1 }),
        });

        assert_eq!(workflow.retry("patient").unwrap().max_attempts, 5);
        assert!(workflow.retry("missing").is_none());
    }

    #[test]
    fn test_sub_workflow_lookup_by_version() {
        let workflow = WorkflowDefinition::new("parent")
            .with_sub_workflow(WorkflowDefinition::new("child").with_version("1.0"))
            .with_sub_workflow(WorkflowDefinition::new("child").with_version("2.0"));

        assert_eq!(
            workflow.sub_workflow("child", Some("2.0")).unwrap().version.as_deref(),
            Some("2.0")
        );
        assert!(workflow.sub_workflow("child", None).is_some());
        assert!(workflow.sub_workflow("child", Some("3.0")).is_none());
    }

    #[test]
    fn test_explicit_start_overrides_first_state() {
        let workflow = WorkflowDefinition::new("wf")
            .with_start("Second")
            .with_state(StateDefinition::new("First", StateKind::End(EndState {})))
            .with_state(StateDefinition::new("Second", StateKind::End(EndState {})));

        assert_eq!(workflow.start_state(), Some("Second"));
        assert!(workflow.get_state("First").is_some());
        assert_eq!(workflow.len(), 2);
    }
}
