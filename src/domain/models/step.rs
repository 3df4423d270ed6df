//! Execution-step domain model.
//!
//! One step is a single thought-act-observe record inside a subtask's
//! exploration. Step sequence numbers are strictly increasing per session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of an execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Cooperatively cancelled by the halt latch
    Aborted,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            // LLMs frequently report "executed"; normalize it
            "completed" | "executed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// The tool invocation a step performs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepAction {
    pub tool: String,
    #[serde(default)]
    pub params: Value,
}

/// A single thought-act-observe record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Session-unique id, `<subtask_id>_<raw_id>`
    pub id: String,
    /// Owning subtask or prior step
    pub parent: String,
    pub thought: String,
    pub action: StepAction,
    pub observation: Option<String>,
    /// Set when the observation was cut at the output cap
    pub observation_truncated: bool,
    /// Length of the observation before truncation
    pub original_length: usize,
    pub status: StepStatus,
    /// Monotonic per-session counter assigned by the graph manager
    pub sequence: u64,
    /// The LLM's running hypothesis commentary for this turn
    pub hypothesis_update: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionStep {
    pub fn new(
        id: impl Into<String>,
        parent: impl Into<String>,
        thought: impl Into<String>,
        action: StepAction,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            parent: parent.into(),
            thought: thought.into(),
            action,
            observation: None,
            observation_truncated: false,
            original_length: 0,
            status: StepStatus::default(),
            sequence: 0,
            hypothesis_update: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executed_normalizes_to_completed() {
        assert_eq!(StepStatus::from_str("executed"), Some(StepStatus::Completed));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            StepStatus::Pending,
            StepStatus::InProgress,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Aborted,
        ] {
            assert_eq!(StepStatus::from_str(s.as_str()), Some(s));
        }
    }
}
