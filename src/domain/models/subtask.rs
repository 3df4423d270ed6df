//! Subtask domain model.
//!
//! Subtasks are the planner-visible units of work in the task graph.
//! They carry a status lifecycle with an irreversible terminal set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::ChatMessage;
use super::outcome::AuditStatus;

/// Status of a subtask in the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Defined but not yet picked up
    Pending,
    /// Currently being explored by an executor
    InProgress,
    /// Finished and audited as done
    Completed,
    /// Finished and audited as failed
    Failed,
    /// Waiting on something outside the graph
    Blocked,
    /// Retired by the planner; kept for lineage, never executed again
    Deprecated,
    /// Dependency was deprecated out from under it
    StalledOrphan,
    /// Finished but the run ended in an error
    CompletedError,
}

impl Default for SubtaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl SubtaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Deprecated => "deprecated",
            Self::StalledOrphan => "stalled_orphan",
            Self::CompletedError => "completed_error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" | "active" | "ready" => Some(Self::InProgress),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "deprecated" => Some(Self::Deprecated),
            "stalled_orphan" => Some(Self::StalledOrphan),
            "completed_error" => Some(Self::CompletedError),
            _ => None,
        }
    }

    /// Terminal statuses can never be left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Deprecated
                | Self::StalledOrphan
                | Self::CompletedError
        )
    }

    /// Whether a dependency in this status unblocks its dependents.
    ///
    /// The ready-batch rule treats anything whose name starts with
    /// `completed`, `deprecated` or `failed` as settled.
    pub fn settles_dependents(&self) -> bool {
        self.as_str().starts_with("completed")
            || self.as_str().starts_with("deprecated")
            || self.as_str().starts_with("failed")
    }
}

/// A planner-created unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Graph-unique identifier (e.g. "subtask_1")
    pub id: String,
    /// What this subtask should accomplish
    pub description: String,
    pub status: SubtaskStatus,
    /// Planner-assigned priority, lower runs earlier
    pub priority: i64,
    /// Planner's rationale for creating it
    pub reason: String,
    /// Natural-language done-criteria checked by the reflector
    pub completion_criteria: String,
    /// Opaque per-task briefing passed through to the executor prompt
    pub mission_briefing: Option<Value>,
    /// Reflector's one-paragraph outcome summary
    pub summary: Option<String>,
    /// Reflector verdict blob, if reflected
    pub reflection: Option<Value>,
    /// Validated artifacts attached by the reflector
    pub artifacts: Vec<Value>,
    /// Causal-node proposals not yet validated by the reflector
    pub staged_causal_nodes: Vec<Value>,
    /// Full executor conversation, persisted every turn
    pub conversation_history: Vec<ChatMessage>,
    /// Executor turns consumed so far
    pub turn_counter: u32,
    /// Step ids from the most recent executor turn, for resumption
    pub last_step_ids: Vec<String>,
    /// Why the executor stopped, when it stopped without completing
    pub termination_reason: Option<String>,
    /// Invariant-violation notes accumulated by the graph manager
    pub warnings: Vec<String>,
    /// Reason recorded when the subtask failed
    pub failure_reason: Option<String>,
    /// Authoritative reflector verdict, once reflected
    pub audit_status: Option<AuditStatus>,
    /// Skip the no-new-artifacts termination heuristic for this subtask
    pub disable_artifact_check: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Cached execution summary, invalidated on step mutation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_summary_cache: Option<ExecutionSummaryCache>,
}

/// Cache entry for the rendered execution log of a subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummaryCache {
    pub summary: String,
    /// Highest step sequence number the summary covers
    pub last_sequence: u64,
    pub updated_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            status: SubtaskStatus::default(),
            priority: 1,
            reason: String::new(),
            completion_criteria: String::new(),
            mission_briefing: None,
            summary: None,
            reflection: None,
            artifacts: Vec::new(),
            staged_causal_nodes: Vec::new(),
            conversation_history: Vec::new(),
            turn_counter: 0,
            last_step_ids: Vec::new(),
            termination_reason: None,
            warnings: Vec::new(),
            failure_reason: None,
            audit_status: None,
            disable_artifact_check: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            execution_summary_cache: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_completion_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.completion_criteria = criteria.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Append an invariant-violation warning with a timestamp.
    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings
            .push(format!("[{}] {}", Utc::now().to_rfc3339(), warning.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_set() {
        assert!(SubtaskStatus::Completed.is_terminal());
        assert!(SubtaskStatus::Failed.is_terminal());
        assert!(SubtaskStatus::Deprecated.is_terminal());
        assert!(SubtaskStatus::StalledOrphan.is_terminal());
        assert!(SubtaskStatus::CompletedError.is_terminal());
        assert!(!SubtaskStatus::Pending.is_terminal());
        assert!(!SubtaskStatus::InProgress.is_terminal());
        assert!(!SubtaskStatus::Blocked.is_terminal());
    }

    #[test]
    fn test_settles_dependents() {
        assert!(SubtaskStatus::Completed.settles_dependents());
        assert!(SubtaskStatus::CompletedError.settles_dependents());
        assert!(SubtaskStatus::Deprecated.settles_dependents());
        assert!(SubtaskStatus::Failed.settles_dependents());
        assert!(!SubtaskStatus::Pending.settles_dependents());
        assert!(!SubtaskStatus::Blocked.settles_dependents());
        assert!(!SubtaskStatus::StalledOrphan.settles_dependents());
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            SubtaskStatus::Pending,
            SubtaskStatus::InProgress,
            SubtaskStatus::Completed,
            SubtaskStatus::Failed,
            SubtaskStatus::Blocked,
            SubtaskStatus::Deprecated,
            SubtaskStatus::StalledOrphan,
            SubtaskStatus::CompletedError,
        ] {
            assert_eq!(SubtaskStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(SubtaskStatus::from_str("nonsense"), None);
    }

    #[test]
    fn test_push_warning_is_timestamped() {
        let mut subtask = Subtask::new("subtask_1", "probe the target");
        subtask.push_warning("illegal status rejected");
        assert_eq!(subtask.warnings.len(), 1);
        assert!(subtask.warnings[0].contains("illegal status rejected"));
        assert!(subtask.warnings[0].starts_with('['));
    }
}
