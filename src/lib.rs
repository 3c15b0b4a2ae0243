//! FlowRunner - Serverless Workflow Execution Engine
//!
//! Executes workflow definitions written in the CNCF Serverless Workflow
//! format: a graph of named states that pass a JSON context along, call
//! host-provided functions, branch on jq conditions, iterate, fork and join,
//! wait for events and call other workflows.
//!
//! # Architecture
//!
//! - [`workflow`]: Definition model, YAML/JSON parsing, validation and the
//!   sub-workflow registry
//! - [`execution`]: The engine and everything a run needs
//! - [`expression`]: jq evaluation of `${ ... }` expressions
//! - [`config`]: Engine limits and defaults
//! - [`monitoring`]: Per-run state timing
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowrunner::execution::InMemoryFunctionRegistry;
//! use flowrunner::{load_workflow, Engine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a workflow from YAML
//!     let workflow = load_workflow("order.yaml")?;
//!
//!     // Provide the functions it calls
//!     let functions = InMemoryFunctionRegistry::new()
//!         .with_function("reserve", |args| Ok(json!({"reserved": args["sku"]})));
//!
//!     // Execute the workflow
//!     let engine = Engine::new(Arc::new(functions));
//!     let result = engine.execute(&workflow, Some(json!({"sku": "A-1"}))).await?;
//!     println!("{}", result);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ExecutionError, LoadError, StateError};
pub use execution::engine::Engine;
pub use workflow::dataflow::{validate_data_flow, DataFlowReport};
pub use workflow::model::{StateDefinition, StateKind, WorkflowDefinition};
pub use workflow::parser::{load_workflow, parse_workflow};
pub use workflow::validator::{validate, ValidationReport, ValidationStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "FlowRunner");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowDefinition::new("empty");
        assert!(workflow.is_empty());
        assert_eq!(validate(&workflow).status, ValidationStatus::Invalid);
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
