//! Error Types
//!
//! Every failure a run can end with is an [`ExecutionError`]. Failures raised
//! while a single state executes are [`StateError`]s, wrapped together with the
//! failing state's name before they leave the engine.

use thiserror::Error;

/// An expression could not be parsed or failed at runtime.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("expression '{expression}' failed: {cause}")]
pub struct ExpressionError {
    pub expression: String,
    pub cause: String,
}

impl ExpressionError {
    pub fn new(expression: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            cause: cause.into(),
        }
    }
}

/// A registered function returned an error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("function '{function}' failed: {message}")]
pub struct FunctionInvocationError {
    pub function: String,
    pub message: String,
}

impl FunctionInvocationError {
    pub fn new(function: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            message: message.into(),
        }
    }
}

/// The event source could not deliver events.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("event source error: {0}")]
pub struct EventSourceError(pub String);

/// Failure of a single state executor.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("{source} (gave up after {attempts} attempt(s))")]
    Invocation {
        #[source]
        source: FunctionInvocationError,
        attempts: u32,
    },

    #[error("function '{0}' is not defined in the workflow")]
    UnknownFunction(String),

    #[error("retry definition '{0}' is not defined in the workflow")]
    UnknownRetry(String),

    #[error("no condition matched and no default condition is defined")]
    NoMatchingCondition,

    #[error("expression '{expression}' produced {found}, expected an array")]
    NotIterable { expression: String, found: String },

    #[error("join '{join}' not satisfied: {succeeded} succeeded, {failed} failed of {total} branch(es)")]
    BranchFailure {
        join: String,
        total: usize,
        succeeded: usize,
        failed: usize,
        #[source]
        first_failure: Option<Box<ExecutionError>>,
    },

    #[error("item #{index} failed: {source}")]
    Iteration {
        index: usize,
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("sub-workflow '{0}' could not be resolved")]
    SubflowNotFound(String),

    #[error("sub-workflow '{workflow_id}' failed: {source}")]
    Subflow {
        workflow_id: String,
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("sub-workflow '{workflow_id}' would nest deeper than {limit} level(s)")]
    SubflowDepthExceeded { workflow_id: String, limit: usize },

    #[error("timed out after {timeout_ms} ms waiting for event '{event}'")]
    EventTimeout { event: String, timeout_ms: u64 },

    #[error(transparent)]
    EventSource(#[from] EventSourceError),

    #[error("state has neither a transition nor end: true")]
    MissingTransition,

    #[error("execution cancelled")]
    Cancelled,
}

/// Terminal failure of a workflow run.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("invalid workflow definition:\n{}", .0.join("\n"))]
    Definition(Vec<String>),

    #[error("unknown state '{0}'")]
    UnknownState(String),

    #[error("state '{state}' failed: {cause}")]
    State {
        state: String,
        #[source]
        cause: StateError,
    },

    #[error("state '{state}' visited more than {limit} times")]
    CycleLimitExceeded { state: String, limit: usize },

    #[error("state '{state}' nests sub-workflow '{workflow_id}' deeper than {limit} level(s)")]
    SubflowDepthExceeded {
        state: String,
        workflow_id: String,
        limit: usize,
    },

    #[error("branch '{0}' panicked")]
    BranchPanicked(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Attributes a state failure to the state it happened in.
    ///
    /// Cancellation is not a failure of the state, so it is passed through
    /// unwrapped. Sub-workflow nesting overruns become their own variant.
    pub fn in_state(state: impl Into<String>, cause: StateError) -> Self {
        match cause {
            StateError::Cancelled => Self::Cancelled,
            StateError::SubflowDepthExceeded { workflow_id, limit } => Self::SubflowDepthExceeded {
                state: state.into(),
                workflow_id,
                limit,
            },
            cause => Self::State {
                state: state.into(),
                cause,
            },
        }
    }

    /// Name of the state the run failed in, if the failure belongs to one.
    pub fn state_name(&self) -> Option<&str> {
        match self {
            Self::State { state, .. }
            | Self::CycleLimitExceeded { state, .. }
            | Self::SubflowDepthExceeded { state, .. } => Some(state),
            Self::UnknownState(state) => Some(state),
            _ => None,
        }
    }
}

/// A workflow document or configuration file could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse document: {0}")]
    Parse(#[from] serde_yaml::Error),
}
