//! Executor and reflector result types.
//!
//! Covers the executor's per-cycle return value, the tolerant parse of the
//! executor LLM reply, the reflector's audit shape, and the intelligence
//! aggregate handed to the planner for dynamic replanning.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::StepAction;

/// How an executor run over one subtask ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorOutcome {
    /// The LLM declared the subtask complete
    Completed,
    /// The LLM offered no executable action and did not declare completion
    StalledNoPlan,
    /// LLM transport gave up after retries
    Error,
    /// Halt latch observed at the top of a turn
    AbortedByHaltSignal,
    /// Halt latch observed mid-turn after tool dispatch
    AbortedByExternalHaltSignal,
    /// A termination heuristic (step cap or artifact patience) fired
    CompletedViaMaxSteps,
}

impl ExecutorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::StalledNoPlan => "stalled_no_plan",
            Self::Error => "error",
            Self::AbortedByHaltSignal => "aborted_by_halt_signal",
            Self::AbortedByExternalHaltSignal => "aborted_by_external_halt_signal",
            Self::CompletedViaMaxSteps => "completed_via_max_steps",
        }
    }
}

/// Why the executor stopped without the LLM declaring completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxStepsReached,
    NoNewArtifacts,
    AbortedByExternalHaltSignal,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxStepsReached => "max_steps_reached",
            Self::NoNewArtifacts => "no_new_artifacts",
            Self::AbortedByExternalHaltSignal => "aborted_by_external_halt_signal",
        }
    }
}

/// Per-call LLM usage metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

/// Metrics accumulated over one executor run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    /// Calls per tool name; accumulates across turns
    pub tool_calls: HashMap<String, u64>,
    /// Turns executed; set, not summed, when merged into session metrics
    pub execution_steps: u32,
}

impl CycleMetrics {
    pub fn absorb_call(&mut self, call: CallMetrics) {
        self.prompt_tokens += call.prompt_tokens;
        self.completion_tokens += call.completion_tokens;
        self.cost += call.cost;
    }

    pub fn count_tool_call(&mut self, tool: &str) {
        *self.tool_calls.entry(tool.to_string()).or_insert(0) += 1;
    }
}

/// One EXECUTE_NOW operation from the executor LLM.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecOp {
    /// Raw id from the LLM, rewritten to `<subtask_id>_<raw_id>` on dispatch
    pub node_id: String,
    pub parent_id: Option<String>,
    pub thought: String,
    pub action: StepAction,
}

/// Parsed executor LLM reply.
///
/// The raw reply is loose JSON; every field is coerced defensively because
/// models routinely return strings where objects are expected.
#[derive(Debug, Clone, Default)]
pub struct ExecutorReply {
    pub previous_steps_status: HashMap<String, String>,
    pub thought: String,
    pub execution_operations: Vec<ExecOp>,
    pub staged_causal_nodes: Vec<Value>,
    pub hypothesis_update: Option<Value>,
    pub is_subtask_complete: bool,
}

impl ExecutorReply {
    pub fn from_value(value: &Value) -> Self {
        Self {
            previous_steps_status: parse_status_map(value.get("previous_steps_status")),
            thought: value
                .get("thought")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            execution_operations: parse_exec_ops(value.get("execution_operations")),
            staged_causal_nodes: parse_object_list(value.get("staged_causal_nodes")),
            hypothesis_update: parse_object(value.get("hypothesis_update")),
            is_subtask_complete: parse_flag(value.get("is_subtask_complete")),
        }
    }

    /// The contradiction message, when the LLM flagged one.
    pub fn contradiction_detected(&self) -> Option<&str> {
        self.hypothesis_update
            .as_ref()?
            .get("contradiction_detected")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

fn parse_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn parse_object(value: Option<&Value>) -> Option<Value> {
    match value {
        Some(Value::Object(_)) => value.cloned(),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s).ok().filter(Value::is_object),
        _ => None,
    }
}

fn parse_status_map(value: Option<&Value>) -> HashMap<String, String> {
    let obj = match parse_object(value) {
        Some(Value::Object(map)) => map,
        _ => return HashMap::new(),
    };
    obj.into_iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
        .collect()
}

fn parse_object_list(value: Option<&Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.iter().filter(|v| v.is_object()).cloned().collect(),
        Some(Value::Object(_)) => vec![value.unwrap().clone()],
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => items.into_iter().filter(Value::is_object).collect(),
            Ok(obj @ Value::Object(_)) => vec![obj],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn parse_exec_ops(value: Option<&Value>) -> Vec<ExecOp> {
    parse_object_list(value)
        .into_iter()
        .filter_map(|op| {
            let command = op.get("command").and_then(Value::as_str).unwrap_or("");
            if !command.eq_ignore_ascii_case("EXECUTE_NOW") {
                return None;
            }
            let node_id = op.get("node_id").and_then(Value::as_str)?;
            if node_id.is_empty() || node_id == "None" {
                return None;
            }
            let action = match op.get("action") {
                Some(Value::Object(obj)) => StepAction {
                    tool: obj
                        .get("tool")
                        .or_else(|| obj.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("unknown_tool")
                        .to_string(),
                    params: obj
                        .get("params")
                        .or_else(|| obj.get("arguments"))
                        .cloned()
                        .unwrap_or(Value::Object(serde_json::Map::new())),
                },
                Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Object(obj)) => StepAction {
                        tool: obj
                            .get("tool")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_tool")
                            .to_string(),
                        params: obj.get("params").cloned().unwrap_or(Value::Object(serde_json::Map::new())),
                    },
                    _ => StepAction { tool: s.clone(), params: Value::Object(serde_json::Map::new()) },
                },
                _ => StepAction::default(),
            };
            Some(ExecOp {
                node_id: node_id.to_string(),
                parent_id: op
                    .get("parent_id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
                thought: op
                    .get("thought")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                action,
            })
        })
        .collect()
}

/// Reflector verdict on one subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    GoalAchieved,
    Completed,
    PartialSuccess,
    Failed,
    /// Aggregate of several reflections, none goal-achieving
    Aggregated,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoalAchieved => "GOAL_ACHIEVED",
            Self::Completed => "COMPLETED",
            Self::PartialSuccess => "PARTIAL_SUCCESS",
            Self::Failed => "FAILED",
            Self::Aggregated => "AGGREGATED",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GOAL_ACHIEVED" => Some(Self::GoalAchieved),
            "COMPLETED" | "SUCCESS" => Some(Self::Completed),
            "PARTIAL_SUCCESS" => Some(Self::PartialSuccess),
            "FAILED" => Some(Self::Failed),
            "AGGREGATED" => Some(Self::Aggregated),
            _ => None,
        }
    }
}

/// Audit block of a reflection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub status: AuditStatus,
    pub completion_check: String,
    #[serde(default)]
    pub methodology_issues: Vec<String>,
    #[serde(default)]
    pub logic_issues: Vec<String>,
    #[serde(default)]
    pub is_strategic_failure: bool,
}

/// Causal-graph updates proposed by the reflector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CausalUpdates {
    #[serde(default)]
    pub nodes: Vec<Value>,
    #[serde(default)]
    pub edges: Vec<Value>,
}

/// Full reflection over one finished subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub audit_result: AuditResult,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default)]
    pub validated_nodes: Vec<Value>,
    #[serde(default)]
    pub insight: Option<Value>,
    #[serde(default)]
    pub causal_graph_updates: CausalUpdates,
    #[serde(default)]
    pub metrics: Option<CallMetrics>,
}

impl Reflection {
    /// Safe fallback produced when the reflector reply cannot be parsed.
    pub fn parse_failure(error: impl Into<String>) -> Self {
        Self {
            audit_result: AuditResult {
                status: AuditStatus::Failed,
                completion_check: "reflection parse failure".to_string(),
                methodology_issues: Vec::new(),
                logic_issues: vec![error.into()],
                is_strategic_failure: false,
            },
            key_findings: Vec::new(),
            validated_nodes: Vec::new(),
            insight: None,
            causal_graph_updates: CausalUpdates::default(),
            metrics: None,
        }
    }
}

/// Merged summary of all reflections in one cycle, handed to the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelligenceSummary {
    pub findings: Vec<String>,
    pub audit_result: AuditResult,
    pub artifacts: Vec<Value>,
    pub insights: Vec<Value>,
}
