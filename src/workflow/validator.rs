//! Workflow Validation
//!
//! Structural checks run before a workflow is executed:
//! - Every state has a unique, non-empty name
//! - Every non-terminal state has a `transition` or `end: true`
//! - Transition, function and retry references resolve
//! - Variant-specific rules (switch targets, foreach bodies, join bounds)
//! - Nested graphs (iterators, branch states, sub-workflows)
//!
//! Validation never stops at the first problem. All violations are collected
//! into a [`ValidationReport`].

use std::collections::HashSet;

use log::{debug, info};
use serde::Serialize;

use super::model::{
    ActionDefinition, FunctionKind, JoinPolicy, StateDefinition, StateKind, WorkflowDefinition,
};

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyWorkflowId,
    EmptyWorkflow,
    EmptyStateName,
    DuplicateStateName(String),
    DuplicateFunction(String),
    UnknownStart(String),
    MissingTransition(String),
    UnknownTransition { state: String, target: String },
    UnknownFunction { state: String, function: String },
    UnknownRetry { state: String, retry: String },
    ZeroAttempts { state: String, function: String },
    ExpressionWithoutOperation(String),
    EmptySwitch(String),
    ConditionWithoutTarget { state: String, index: usize },
    DefaultWithoutTarget(String),
    EmptyCollection(String),
    EmptyForEachBody(String),
    AmbiguousForEachBody(String),
    ZeroConcurrency(String),
    NoBranches(String),
    DuplicateBranch { state: String, branch: String },
    EmptyBranch { state: String, branch: String },
    UnsatisfiableJoin { state: String, required: usize, branches: usize },
    EmptyWorkflowRef(String),
    EmptyEventName(String),
    Nested { scope: String, error: Box<ValidationError> },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyWorkflowId => write!(f, "Workflow has an empty id"),
            Self::EmptyWorkflow => write!(f, "Workflow has no states"),
            Self::EmptyStateName => write!(f, "State has empty or whitespace-only name"),
            Self::DuplicateStateName(name) => write!(f, "Duplicate state name: '{}'", name),
            Self::DuplicateFunction(name) => write!(f, "Duplicate function name: '{}'", name),
            Self::UnknownStart(name) => write!(f, "Start state '{}' does not exist", name),
            Self::MissingTransition(state) => {
                write!(f, "State '{}' missing mandatory transition or end: true", state)
            }
            Self::UnknownTransition { state, target } => {
                write!(f, "State '{}' transitions to unknown state '{}'", state, target)
            }
            Self::UnknownFunction { state, function } => {
                write!(f, "State '{}' references unknown function '{}'", state, function)
            }
            Self::UnknownRetry { state, retry } => {
                write!(f, "State '{}' references unknown retry definition '{}'", state, retry)
            }
            Self::ZeroAttempts { state, function } => write!(
                f,
                "State '{}': retry policy for '{}' must allow at least one attempt",
                state, function
            ),
            Self::ExpressionWithoutOperation(function) => write!(
                f,
                "Function '{}' is of type expression but has no operation",
                function
            ),
            Self::EmptySwitch(state) => write!(
                f,
                "Switch state '{}' has no data conditions and no default condition",
                state
            ),
            Self::ConditionWithoutTarget { state, index } => write!(
                f,
                "Switch state '{}': condition #{} has neither a transition nor end: true",
                state,
                index + 1
            ),
            Self::DefaultWithoutTarget(state) => write!(
                f,
                "Switch state '{}': default condition has neither a transition nor end: true",
                state
            ),
            Self::EmptyCollection(state) => {
                write!(f, "ForEach state '{}' has an empty inputCollection", state)
            }
            Self::EmptyForEachBody(state) => {
                write!(f, "ForEach state '{}' has no actions and no iterator states", state)
            }
            Self::AmbiguousForEachBody(state) => write!(
                f,
                "ForEach state '{}' declares both actions and iterator states",
                state
            ),
            Self::ZeroConcurrency(state) => {
                write!(f, "ForEach state '{}' has maxConcurrency of 0", state)
            }
            Self::NoBranches(state) => write!(f, "Parallel state '{}' has no branches", state),
            Self::DuplicateBranch { state, branch } => write!(
                f,
                "Parallel state '{}' declares branch '{}' more than once",
                state, branch
            ),
            Self::EmptyBranch { state, branch } => write!(
                f,
                "Parallel state '{}': branch '{}' has no actions and no states",
                state, branch
            ),
            Self::UnsatisfiableJoin {
                state,
                required,
                branches,
            } => write!(
                f,
                "Parallel state '{}' requires atLeast({}) but declares {} branch(es)",
                state, required, branches
            ),
            Self::EmptyWorkflowRef(state) => {
                write!(f, "Subflow state '{}' has an empty workflowId", state)
            }
            Self::EmptyEventName(state) => {
                write!(f, "Event state '{}' has an empty event name", state)
            }
            Self::Nested { scope, error } => write!(f, "{}: {}", scope, error),
        }
    }
}

/// Overall outcome of a validation pass.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid,
}

/// Result of validating a workflow: a status plus every violation found.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub errors: Vec<String>,
}

impl ValidationReport {
    fn from_errors(errors: &[ValidationError]) -> Self {
        let status = if errors.is_empty() {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Invalid
        };

        Self {
            status,
            errors: errors.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == ValidationStatus::Valid
    }
}

/// Validates a workflow and all graphs nested in it.
pub fn validate(workflow: &WorkflowDefinition) -> ValidationReport {
    info!("Validating workflow '{}' with {} states", workflow.id, workflow.states.len());

    let errors = collect_errors(workflow);

    if errors.is_empty() {
        info!("Workflow '{}' is valid", workflow.id);
    } else {
        debug!("Workflow '{}' has {} validation error(s)", workflow.id, errors.len());
    }

    ValidationReport::from_errors(&errors)
}

fn collect_errors(workflow: &WorkflowDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if workflow.id.trim().is_empty() {
        errors.push(ValidationError::EmptyWorkflowId);
    }

    let mut seen_functions = HashSet::new();
    for function in &workflow.functions {
        if !seen_functions.insert(function.name.as_str()) {
            errors.push(ValidationError::DuplicateFunction(function.name.clone()));
        }
        if function.kind == FunctionKind::Expression && function.operation.is_none() {
            errors.push(ValidationError::ExpressionWithoutOperation(function.name.clone()));
        }
    }

    if workflow.states.is_empty() {
        errors.push(ValidationError::EmptyWorkflow);
    } else {
        errors.extend(validate_graph(workflow, &workflow.states, workflow.start.as_deref()));
    }

    for sub_workflow in &workflow.sub_workflows {
        let scope = format!("Sub-workflow '{}'", sub_workflow.id);
        errors.extend(nest(&scope, collect_errors(sub_workflow)));
    }

    errors
}

/// Validates one state graph. Functions and retries resolve against
/// `workflow`, transitions against `states`.
fn validate_graph(
    workflow: &WorkflowDefinition,
    states: &[StateDefinition],
    start: Option<&str>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let mut names = HashSet::new();
    for state in states {
        if state.name.trim().is_empty() {
            errors.push(ValidationError::EmptyStateName);
        } else if !names.insert(state.name.as_str()) {
            errors.push(ValidationError::DuplicateStateName(state.name.clone()));
        }
    }

    if let Some(start) = start {
        if !names.contains(start) {
            errors.push(ValidationError::UnknownStart(start.to_string()));
        }
    }

    for state in states {
        let mut check_target = |target: &str| {
            if !names.contains(target) {
                errors.push(ValidationError::UnknownTransition {
                    state: state.name.clone(),
                    target: target.to_string(),
                });
            }
        };

        if let Some(target) = &state.transition {
            check_target(target);
        }

        // Switch states route through their conditions; end states terminate.
        let routes_itself = matches!(state.kind, StateKind::Switch(_) | StateKind::End(_));
        if !routes_itself && state.transition.is_none() && !state.end {
            errors.push(ValidationError::MissingTransition(state.name.clone()));
        }

        errors.extend(validate_state(workflow, state, &names));
    }

    errors
}

fn validate_state(
    workflow: &WorkflowDefinition,
    state: &StateDefinition,
    names: &HashSet<&str>,
) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let name = &state.name;

    let unknown_target = |target: &str| ValidationError::UnknownTransition {
        state: name.clone(),
        target: target.to_string(),
    };

    match &state.kind {
        StateKind::Operation(operation) => {
            errors.extend(validate_actions(workflow, name, &operation.actions));
        }
        StateKind::Switch(switch) => {
            if switch.data_conditions.is_empty() && switch.default_condition.is_none() {
                errors.push(ValidationError::EmptySwitch(name.clone()));
            }

            for (index, condition) in switch.data_conditions.iter().enumerate() {
                match &condition.transition {
                    Some(target) if !names.contains(target.as_str()) => {
                        errors.push(unknown_target(target))
                    }
                    Some(_) => {}
                    None if !condition.end => errors.push(ValidationError::ConditionWithoutTarget {
                        state: name.clone(),
                        index,
                    }),
                    None => {}
                }
            }

            if let Some(default) = &switch.default_condition {
                match default.transition.as_deref() {
                    Some(target) if !names.contains(target) => errors.push(unknown_target(target)),
                    Some(_) => {}
                    None if !default.end => {
                        errors.push(ValidationError::DefaultWithoutTarget(name.clone()))
                    }
                    None => {}
                }
            }
        }
        StateKind::ForEach(each) => {
            if each.input_collection.trim().is_empty() {
                errors.push(ValidationError::EmptyCollection(name.clone()));
            }
            match (each.actions.is_empty(), each.iterator.is_empty()) {
                (true, true) => errors.push(ValidationError::EmptyForEachBody(name.clone())),
                (false, false) => errors.push(ValidationError::AmbiguousForEachBody(name.clone())),
                _ => {}
            }
            if each.max_concurrency == Some(0) {
                errors.push(ValidationError::ZeroConcurrency(name.clone()));
            }

            errors.extend(validate_actions(workflow, name, &each.actions));
            if !each.iterator.is_empty() {
                let scope = format!("Iterator of '{}'", name);
                errors.extend(nest(&scope, validate_graph(workflow, &each.iterator, None)));
            }
        }
        StateKind::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                errors.push(ValidationError::NoBranches(name.clone()));
            }

            let mut branch_names = HashSet::new();
            for branch in &parallel.branches {
                if !branch_names.insert(branch.name.as_str()) {
                    errors.push(ValidationError::DuplicateBranch {
                        state: name.clone(),
                        branch: branch.name.clone(),
                    });
                }
                if branch.actions.is_empty() && branch.states.is_empty() {
                    errors.push(ValidationError::EmptyBranch {
                        state: name.clone(),
                        branch: branch.name.clone(),
                    });
                }

                errors.extend(validate_actions(workflow, name, &branch.actions));
                if !branch.states.is_empty() {
                    let scope = format!("Branch '{}' of '{}'", branch.name, name);
                    errors.extend(nest(&scope, validate_graph(workflow, &branch.states, None)));
                }
            }

            if let JoinPolicy::AtLeast(required) = parallel.join {
                if required == 0 || required > parallel.branches.len() {
                    errors.push(ValidationError::UnsatisfiableJoin {
                        state: name.clone(),
                        required,
                        branches: parallel.branches.len(),
                    });
                }
            }
        }
        StateKind::Subflow(subflow) => {
            if subflow.workflow_id.trim().is_empty() {
                errors.push(ValidationError::EmptyWorkflowRef(name.clone()));
            }
        }
        StateKind::Event(event) => {
            if event.event.trim().is_empty() {
                errors.push(ValidationError::EmptyEventName(name.clone()));
            }
            if let Some(target) = &event.timeout_transition {
                if !names.contains(target.as_str()) {
                    errors.push(unknown_target(target));
                }
            }
        }
        StateKind::Delay(_) | StateKind::Inject(_) | StateKind::End(_) => {}
    }

    errors
}

fn validate_actions(
    workflow: &WorkflowDefinition,
    state: &str,
    actions: &[ActionDefinition],
) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for action in actions {
        let function = &action.function_ref.ref_name;
        if workflow.function(function).is_none() {
            errors.push(ValidationError::UnknownFunction {
                state: state.to_string(),
                function: function.clone(),
            });
        }

        if let Some(retry) = &action.retry_ref {
            if workflow.retry(retry).is_none() {
                errors.push(ValidationError::UnknownRetry {
                    state: state.to_string(),
                    retry: retry.clone(),
                });
            }
        }

        let policy = action
            .retry
            .as_ref()
            .or_else(|| action.retry_ref.as_deref().and_then(|r| workflow.retry(r)));
        if policy.map_or(false, |p| p.max_attempts == 0) {
            errors.push(ValidationError::ZeroAttempts {
                state: state.to_string(),
                function: function.clone(),
            });
        }
    }

    errors
}

fn nest(scope: &str, errors: Vec<ValidationError>) -> impl Iterator<Item = ValidationError> + '_ {
    errors.into_iter().map(move |error| ValidationError::Nested {
        scope: scope.to_string(),
        error: Box::new(error),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::*;
    use serde_json::json;

    fn inject(name: &str) -> StateDefinition {
        StateDefinition::new(name, StateKind::Inject(InjectState { data: json!({}) }))
    }

    fn operation(name: &str, function: &str) -> StateDefinition {
        StateDefinition::new(
            name,
            StateKind::Operation(OperationState::new(vec![ActionDefinition::new(function)])),
        )
    }

    fn has_error(report: &ValidationReport, needle: &str) -> bool {
        report.errors.iter().any(|e| e.contains(needle))
    }

    #[test]
    fn test_valid_workflow() {
        let workflow = WorkflowDefinition::new("wf")
            .with_function(FunctionDefinition::new("work"))
            .with_state(operation("Work", "work").with_transition("Done"))
            .with_state(StateDefinition::new("Done", StateKind::End(EndState {})));

        let report = validate(&workflow);
        assert!(report.is_valid(), "{:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_empty_workflow() {
        let report = validate(&WorkflowDefinition::new("wf"));
        assert_eq!(report.status, ValidationStatus::Invalid);
        assert!(has_error(&report, "no states"));
    }

    #[test]
    fn test_missing_transition_names_state() {
        let workflow = WorkflowDefinition::new("wf").with_state(inject("Dangling"));

        let report = validate(&workflow);
        assert!(!report.is_valid());
        assert_eq!(
            report.errors,
            vec!["State 'Dangling' missing mandatory transition or end: true".to_string()]
        );
    }

    #[test]
    fn test_collects_all_errors() {
        let workflow = WorkflowDefinition::new("wf")
            .with_start("Nowhere")
            .with_state(inject("A"))
            .with_state(inject("A").ending())
            .with_state(operation("B", "missing").with_transition("Ghost"));

        let report = validate(&workflow);
        assert!(has_error(&report, "Start state 'Nowhere'"));
        assert!(has_error(&report, "Duplicate state name: 'A'"));
        assert!(has_error(&report, "State 'A' missing mandatory transition"));
        assert!(has_error(&report, "unknown state 'Ghost'"));
        assert!(has_error(&report, "unknown function 'missing'"));
        assert_eq!(report.errors.len(), 5);
    }

    #[test]
    fn test_switch_rules() {
        let switch = SwitchState {
            data_conditions: vec![
                DataCondition::new(".a", "Missing"),
                DataCondition {
                    name: None,
                    condition: ".b".to_string(),
                    transition: None,
                    end: false,
                },
            ],
            default_condition: Some(DefaultCondition {
                transition: Some("Other".to_string()),
                end: false,
            }),
        };
        let workflow = WorkflowDefinition::new("wf")
            .with_state(StateDefinition::new("Route", StateKind::Switch(switch)));

        let report = validate(&workflow);
        assert!(has_error(&report, "unknown state 'Missing'"));
        assert!(has_error(&report, "condition #2"));
        assert!(has_error(&report, "unknown state 'Other'"));
        assert!(!has_error(&report, "missing mandatory transition"));
    }

    #[test]
    fn test_default_condition_needs_a_target() {
        let yaml = r#"
id: pick
states:
  - name: Pick
    type: switch
    dataConditions:
      - condition: ".go"
        end: true
    defaultCondition: {}
"#;
        let workflow = crate::workflow::parser::parse_workflow(yaml).unwrap();

        let report = validate(&workflow);
        assert_eq!(report.status, ValidationStatus::Invalid);
        assert_eq!(
            report.errors,
            vec!["Switch state 'Pick': default condition has neither a transition nor end: true"]
        );
    }

    #[test]
    fn test_default_condition_may_end() {
        let switch = SwitchState {
            data_conditions: vec![DataCondition::new(".a", "Done")],
            default_condition: Some(DefaultCondition {
                transition: None,
                end: true,
            }),
        };
        let workflow = WorkflowDefinition::new("wf")
            .with_state(StateDefinition::new("Route", StateKind::Switch(switch)))
            .with_state(inject("Done").ending());

        assert!(validate(&workflow).is_valid());
    }

    #[test]
    fn test_empty_switch() {
        let workflow = WorkflowDefinition::new("wf").with_state(StateDefinition::new(
            "Route",
            StateKind::Switch(SwitchState::default()),
        ));

        assert!(has_error(&validate(&workflow), "no data conditions"));
    }

    #[test]
    fn test_foreach_rules() {
        let mut each = ForEachState::new("");
        each.max_concurrency = Some(0);
        let workflow = WorkflowDefinition::new("wf")
            .with_state(StateDefinition::new("Loop", StateKind::ForEach(each)).ending());

        let report = validate(&workflow);
        assert!(has_error(&report, "empty inputCollection"));
        assert!(has_error(&report, "no actions and no iterator"));
        assert!(has_error(&report, "maxConcurrency of 0"));
    }

    #[test]
    fn test_iterator_errors_are_scoped() {
        let mut each = ForEachState::new(".items");
        each.iterator = vec![inject("Inner")];
        let workflow = WorkflowDefinition::new("wf")
            .with_state(StateDefinition::new("Loop", StateKind::ForEach(each)).ending());

        let report = validate(&workflow);
        assert_eq!(
            report.errors,
            vec!["Iterator of 'Loop': State 'Inner' missing mandatory transition or end: true"
                .to_string()]
        );
    }

    #[test]
    fn test_parallel_rules() {
        let parallel = ParallelState {
            branches: vec![
                BranchDefinition::with_actions("A", vec![ActionDefinition::new("work")]),
                BranchDefinition::with_actions("A", vec![]),
            ],
            join: JoinPolicy::AtLeast(3),
        };
        let workflow = WorkflowDefinition::new("wf")
            .with_function(FunctionDefinition::new("work"))
            .with_state(StateDefinition::new("Fan", StateKind::Parallel(parallel)).ending());

        let report = validate(&workflow);
        assert!(has_error(&report, "branch 'A' more than once"));
        assert!(has_error(&report, "branch 'A' has no actions"));
        assert!(has_error(&report, "atLeast(3)"));
    }

    #[test]
    fn test_parallel_without_branches() {
        let workflow = WorkflowDefinition::new("wf").with_state(
            StateDefinition::new("Fan", StateKind::Parallel(ParallelState::default())).ending(),
        );

        assert!(has_error(&validate(&workflow), "has no branches"));
    }

    #[test]
    fn test_retry_rules() {
        let workflow = WorkflowDefinition::new("wf")
            .with_function(FunctionDefinition::new("work"))
            .with_retry(RetryDefinition {
                name: "never".to_string(),
                policy: RetryPolicy::new(0, Backoff::default()),
            })
            .with_state(
                StateDefinition::new(
                    "Work",
                    StateKind::Operation(OperationState::new(vec![
                        ActionDefinition::new("work").with_retry_ref("never"),
                        ActionDefinition::new("work").with_retry_ref("unknown"),
                    ])),
                )
                .ending(),
            );

        let report = validate(&workflow);
        assert!(has_error(&report, "at least one attempt"));
        assert!(has_error(&report, "unknown retry definition 'unknown'"));
    }

    #[test]
    fn test_expression_function_needs_operation() {
        let mut function = FunctionDefinition::new("calc");
        function.kind = FunctionKind::Expression;
        let workflow = WorkflowDefinition::new("wf")
            .with_function(function)
            .with_state(inject("Seed").ending());

        assert!(has_error(&validate(&workflow), "Function 'calc' is of type expression"));
    }

    #[test]
    fn test_event_timeout_transition_must_exist() {
        let mut event = EventState::new("approved");
        event.timeout_transition = Some("Escalate".to_string());
        let workflow = WorkflowDefinition::new("wf")
            .with_state(StateDefinition::new("Wait", StateKind::Event(event)).ending());

        assert!(has_error(&validate(&workflow), "unknown state 'Escalate'"));
    }

    #[test]
    fn test_sub_workflow_errors_are_prefixed() {
        let child = WorkflowDefinition::new("child").with_state(inject("Loose"));
        let workflow = WorkflowDefinition::new("parent")
            .with_state(
                StateDefinition::new("Call", StateKind::Subflow(SubflowState::new("child")))
                    .ending(),
            )
            .with_sub_workflow(child);

        let report = validate(&workflow);
        assert_eq!(
            report.errors,
            vec!["Sub-workflow 'child': State 'Loose' missing mandatory transition or end: true"
                .to_string()]
        );
    }

    #[test]
    fn test_report_serialization() {
        let report = validate(&WorkflowDefinition::new("wf"));
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "invalid");
        assert!(value["errors"].is_array());
    }

    #[test]
    fn test_validation_error_display() {
        let error = ValidationError::Nested {
            scope: "Branch 'B' of 'Fan'".to_string(),
            error: Box::new(ValidationError::DuplicateStateName("X".to_string())),
        };
        assert_eq!(error.to_string(), "Branch 'B' of 'Fan': Duplicate state name: 'X'");
    }
}
