//! Domain models for the Stratagem engine.

pub mod causal;
pub mod config;
pub mod message;
pub mod operations;
pub mod outcome;
pub mod step;
pub mod subtask;

pub use causal::{CausalNode, CausalNodeType, CausalStatus, EdgeLabel, EvidenceStrength};
pub use config::{Config, ExecutorConfig, LlmConfig, OutputMode, ToolServerConfig};
pub use message::{estimate_tokens, ChatMessage, Role};
pub use operations::{AddNodeData, GraphOp, PlanData};
pub use outcome::{
    AuditResult, AuditStatus, CallMetrics, CausalUpdates, CycleMetrics, ExecOp, ExecutorOutcome,
    ExecutorReply, IntelligenceSummary, Reflection, TerminationReason,
};
pub use step::{ExecutionStep, StepAction, StepStatus};
pub use subtask::{Subtask, SubtaskStatus};
