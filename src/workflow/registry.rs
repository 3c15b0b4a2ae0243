//! Sub-workflow lookup for Subflow states.

use std::collections::HashMap;
use std::sync::Arc;

use super::model::WorkflowDefinition;

/// Resolves workflow definitions by id and optional version.
pub trait WorkflowRegistry: Send + Sync {
    fn resolve(&self, id: &str, version: Option<&str>) -> Option<Arc<WorkflowDefinition>>;
}

/// Registry holding definitions in memory, keyed by id.
///
/// Without a requested version the most recently registered definition of
/// an id wins.
#[derive(Debug, Default, Clone)]
pub struct InMemoryWorkflowRegistry {
    workflows: HashMap<String, Vec<Arc<WorkflowDefinition>>>,
}

impl InMemoryWorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, workflow: WorkflowDefinition) {
        self.workflows
            .entry(workflow.id.clone())
            .or_default()
            .push(Arc::new(workflow));
    }

    pub fn with_workflow(mut self, workflow: WorkflowDefinition) -> Self {
        self.register(workflow);
        self
    }

    pub fn len(&self) -> usize {
        self.workflows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl WorkflowRegistry for InMemoryWorkflowRegistry {
    fn resolve(&self, id: &str, version: Option<&str>) -> Option<Arc<WorkflowDefinition>> {
        let candidates = self.workflows.get(id)?;
        match version {
            Some(version) => candidates
                .iter()
                .rev()
                .find(|w| w.version.as_deref() == Some(version))
                .cloned(),
            None => candidates.last().cloned(),
        }
    }
}
