//! Action Invoker
//!
//! Executes a single action: builds its arguments, calls the referenced
//! function and filters the result. Failed calls are retried according to
//! the action's retry policy before the failure is reported to the state.
//!
//! Functions of `type: expression` are evaluated in-process. Every other
//! function is resolved through a [`FunctionRegistry`] supplied by the host.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::scheduler::cancellable_sleep;
use crate::error::{FunctionInvocationError, StateError};
use crate::expression::{evaluate_template, ExpressionEvaluator};
use crate::workflow::model::{
    ActionDefinition, FunctionDefinition, FunctionKind, RetryPolicy, WorkflowDefinition,
};

/// Host-provided implementations of workflow functions.
#[async_trait]
pub trait FunctionRegistry: Send + Sync {
    async fn invoke(&self, function: &str, arguments: Value) -> Result<Value, FunctionInvocationError>;
}

/// Synchronous function implementation.
pub type FunctionHandler = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// Registry of plain closures, keyed by function name.
#[derive(Default, Clone)]
pub struct InMemoryFunctionRegistry {
    handlers: HashMap<String, FunctionHandler>,
}

impl InMemoryFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn with_function<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl std::fmt::Debug for InMemoryFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("InMemoryFunctionRegistry")
            .field("functions", &names)
            .finish()
    }
}

#[async_trait]
impl FunctionRegistry for InMemoryFunctionRegistry {
    async fn invoke(&self, function: &str, arguments: Value) -> Result<Value, FunctionInvocationError> {
        let handler = self.handlers.get(function).ok_or_else(|| {
            FunctionInvocationError::new(function, "no implementation is registered")
        })?;

        handler(arguments).map_err(|message| FunctionInvocationError::new(function, message))
    }
}

/// Result of one action, keyed the way it is folded into the state output.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutput {
    pub key: String,
    pub value: Value,
}

/// Runs actions against a function registry and an expression evaluator.
#[derive(Clone)]
pub struct ActionInvoker {
    functions: Arc<dyn FunctionRegistry>,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl ActionInvoker {
    pub fn new(functions: Arc<dyn FunctionRegistry>, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self {
            functions,
            evaluator,
        }
    }

    /// Performs an action against `scope`.
    ///
    /// Returns `None` when the action discards its result (`useResults: false`).
    pub async fn perform(
        &self,
        workflow: &WorkflowDefinition,
        action: &ActionDefinition,
        scope: &Value,
        cancel: &CancellationToken,
    ) -> Result<Option<ActionOutput>, StateError> {
        let name = &action.function_ref.ref_name;
        let filter = action.action_data_filter.as_ref();

        let scope = match filter.and_then(|f| f.from_state_data.as_deref()) {
            Some(expression) => self.evaluator.evaluate(expression, scope)?,
            None => scope.clone(),
        };

        let arguments = match &action.function_ref.arguments {
            Some(template) => evaluate_template(self.evaluator.as_ref(), template, &scope)?,
            None => json!({}),
        };

        let function = workflow
            .function(name)
            .ok_or_else(|| StateError::UnknownFunction(name.clone()))?;

        let policy = match (&action.retry, &action.retry_ref) {
            (Some(policy), _) => policy.clone(),
            (None, Some(retry)) => workflow
                .retry(retry)
                .cloned()
                .ok_or_else(|| StateError::UnknownRetry(retry.clone()))?,
            (None, None) => RetryPolicy::default(),
        };

        debug!("Invoking function '{}' with arguments {}", name, arguments);

        let result = with_retry(&policy, name, cancel, || self.call(function, arguments.clone())).await?;

        if !filter.map_or(true, |f| f.use_results) {
            return Ok(None);
        }

        let value = match filter.and_then(|f| f.results.as_deref()) {
            Some(expression) => self.evaluator.evaluate(expression, &result)?,
            None => result,
        };

        Ok(Some(ActionOutput {
            key: action.result_key().to_string(),
            value,
        }))
    }

    async fn call(
        &self,
        function: &FunctionDefinition,
        arguments: Value,
    ) -> Result<Value, FunctionInvocationError> {
        match function.kind {
            FunctionKind::Expression => {
                let operation = function.operation.as_deref().ok_or_else(|| {
                    FunctionInvocationError::new(&function.name, "expression function has no operation")
                })?;
                self.evaluator
                    .evaluate(operation, &arguments)
                    .map_err(|e| FunctionInvocationError::new(&function.name, e.to_string()))
            }
            _ => self.functions.invoke(&function.name, arguments).await,
        }
    }
}

/// Calls `call` until it succeeds or the policy's attempts are used up,
/// sleeping for the backoff delay between attempts.
pub async fn with_retry<F, Fut>(
    policy: &RetryPolicy,
    function: &str,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<Value, StateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Value, FunctionInvocationError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(StateError::Cancelled);
        }

        match call().await {
            Ok(value) => return Ok(value),
            Err(source) if attempt >= max_attempts => {
                return Err(StateError::Invocation {
                    source,
                    attempts: attempt,
                })
            }
            Err(e) => {
                let delay = policy.backoff.delay_for(attempt);
                warn!(
                    "Attempt {}/{} of '{}' failed: {} (retrying in {} ms)",
                    attempt,
                    max_attempts,
                    function,
                    e.message,
                    delay.as_millis()
                );
                cancellable_sleep(delay, cancel).await?;
                attempt += 1;
            }
        }
    }
}
