//! Workflow Definition Module
//!
//! Data structures and utilities for defining, loading and validating
//! CNCF Serverless Workflow definitions.
//!
//! # Structure
//!
//! - [`model`]: Workflow, state, action and function definitions
//! - [`parser`]: YAML/JSON loading
//! - [`validator`]: Structural validation with collected errors
//! - [`dataflow`]: Dry run that checks data reaches the states reading it
//! - [`registry`]: Lookup of workflows invoked as sub-flows

pub mod dataflow;
pub mod model;
pub mod parser;
pub mod registry;
pub mod validator;

pub use dataflow::{validate_data_flow, DataFlowReport, StateSnapshot};
pub use model::{StateDefinition, StateKind, WorkflowDefinition};
pub use parser::{load_workflow, parse_workflow};
pub use registry::{InMemoryWorkflowRegistry, WorkflowRegistry};
pub use validator::{validate, ValidationReport, ValidationStatus};
