//! Engine Configuration
//!
//! Tunables for a run, loadable from a YAML file:
//!
//! ```yaml
//! maxStateVisits: 500
//! maxSubflowDepth: 16
//! maxConcurrency: 8
//! eventTimeoutMs: 30000
//! ```
//!
//! Every key is optional; missing keys keep their defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Default bound on how often a single state may be entered in one run.
pub const DEFAULT_MAX_STATE_VISITS: usize = 1000;

/// Default bound on how deeply sub-workflows may call sub-workflows.
pub const DEFAULT_MAX_SUBFLOW_DEPTH: usize = 32;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Visits per state before the run fails with a cycle error
    pub max_state_visits: usize,

    /// Nesting levels of waited or detached sub-workflow runs
    pub max_subflow_depth: usize,

    /// Upper bound for parallel ForEach iterations without their own bound
    pub max_concurrency: usize,

    /// Timeout for Event states that declare none; `None` waits forever
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_state_visits: DEFAULT_MAX_STATE_VISITS,
            max_subflow_depth: DEFAULT_MAX_SUBFLOW_DEPTH,
            max_concurrency: num_cpus::get(),
            event_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML (or JSON) file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, LoadError> {
        let mut config: EngineConfig = serde_yaml::from_str(content)?;

        // A zero bound would deadlock parallel iteration.
        config.max_concurrency = config.max_concurrency.max(1);
        Ok(config)
    }

    pub fn event_timeout(&self) -> Option<Duration> {
        self.event_timeout_ms.map(Duration::from_millis)
    }
}
