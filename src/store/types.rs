use serde::{Deserialize, Serialize};

use crate::model::{RepairTask, RepairTaskState};

/// Selects repair tasks by state and executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Empty means every state.
    #[serde(default)]
    pub states: Vec<RepairTaskState>,
    #[serde(default)]
    pub executor_prefix: Option<String>,
}

impl TaskFilter {
    pub fn executor(prefix: impl Into<String>) -> Self {
        Self {
            states: Vec::new(),
            executor_prefix: Some(prefix.into()),
        }
    }

    pub fn with_states(mut self, states: &[RepairTaskState]) -> Self {
        self.states = states.to_vec();
        self
    }

    pub fn matches(&self, task: &RepairTask) -> bool {
        let state_ok = self.states.is_empty() || self.states.contains(&task.state);
        let executor_ok = self
            .executor_prefix
            .as_deref()
            .is_none_or(|prefix| task.executor.starts_with(prefix));
        state_ok && executor_ok
    }
}

/// Body returned by the store after an accepted write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VersionReply {
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelRequest {
    pub version: u64,
}
