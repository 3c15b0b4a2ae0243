//! Workflow Parser
//!
//! Loads workflow definitions from YAML or JSON documents. JSON is a subset
//! of YAML, so one parser handles both.
//!
//! Parsing only checks the document's shape. Structural rules (transitions,
//! references, join bounds) are checked by [`validate`](super::validator::validate).

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowDefinition;
use crate::error::LoadError;

/// Loads a workflow from a file.
///
/// # Example
///
/// ```rust,no_run
/// use flowrunner::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("order.yaml")?;
///     println!("Loaded {} states", workflow.states.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition, LoadError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;

    debug!("Document loaded ({} bytes)", content.len());

    let workflow = parse_workflow(&content)?;

    info!(
        "Parsed workflow '{}': {} states, {} functions, {} sub-workflows",
        workflow.id,
        workflow.states.len(),
        workflow.functions.len(),
        workflow.sub_workflows.len()
    );

    Ok(workflow)
}

/// Parses a workflow from a YAML or JSON string.
pub fn parse_workflow(content: &str) -> Result<WorkflowDefinition, LoadError> {
    Ok(serde_yaml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{ActionMode, StateKind};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ORDER_WORKFLOW: &str = r#"
id: order
version: "1.0"
start: Check
functions:
  - name: ship
  - name: total
    type: expression
    operation: "[.items[].price] | add"
states:
  - name: Check
    type: switch
    dataConditions:
      - condition: "${ .items | length > 0 }"
        transition: Ship
    defaultCondition:
      end: true
  - name: Ship
    type: operation
    actionMode: parallel
    actions:
      - functionRef: { refName: ship }
      - functionRef:
          refName: total
          arguments: "${ . }"
    end: true
"#;

    #[test]
    fn test_parse_yaml() {
        let workflow = parse_workflow(ORDER_WORKFLOW).unwrap();

        assert_eq!(workflow.id, "order");
        assert_eq!(workflow.version.as_deref(), Some("1.0"));
        assert_eq!(workflow.functions.len(), 2);
        assert_eq!(workflow.states.len(), 2);

        let StateKind::Operation(op) = &workflow.states[1].kind else {
            panic!("expected operation state");
        };
        assert_eq!(op.action_mode, ActionMode::Parallel);
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "id": "inject",
            "states": [
                {"name": "Seed", "type": "inject", "data": {"value": 1}, "end": true}
            ]
        }"#;

        let workflow = parse_workflow(json).unwrap();
        assert_eq!(workflow.start_state(), Some("Seed"));
    }

    #[test]
    fn test_unknown_state_type_is_rejected() {
        let yaml = r#"
id: bad
states:
  - name: Nope
    type: teleport
    end: true
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }

    #[test]
    fn test_invalid_join_policy_is_rejected() {
        let yaml = r#"
id: bad
states:
  - name: Fan
    type: parallel
    join: "most"
    branches: []
    end: true
"#;
        assert!(parse_workflow(yaml).is_err());
    }

    #[test]
    fn test_load_workflow_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(ORDER_WORKFLOW.as_bytes()).unwrap();

        let workflow = load_workflow(file.path()).unwrap();
        assert_eq!(workflow.id, "order");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_workflow("/nonexistent/workflow.yaml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/workflow.yaml"));
    }
}
