//! Session metrics and the run log.
//!
//! Aggregation quirks preserved from the component contracts: executor
//! `execution_steps` is an absolute value (set, not summed) and per-tool
//! call counts are merged by maximum, because the executor reports
//! accumulated totals.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::domain::models::{CallMetrics, CycleMetrics};

/// Terminal summary of whether the goal was achieved.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SuccessInfo {
    pub found: bool,
    pub reason: String,
}

/// Metrics accumulated over one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub goal: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub tool_calls: HashMap<String, u64>,
    pub execution_steps: u32,
    pub plan_steps: u32,
    pub reflect_steps: u32,
    pub artifacts_found: usize,
    pub success_info: SuccessInfo,
}

impl SessionMetrics {
    pub fn new(session_id: &str, goal: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            goal: goal.to_string(),
            start_time: Utc::now(),
            end_time: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            tool_calls: HashMap::new(),
            execution_steps: 0,
            plan_steps: 0,
            reflect_steps: 0,
            artifacts_found: 0,
            success_info: SuccessInfo::default(),
        }
    }

    pub fn absorb_call(&mut self, call: &CallMetrics) {
        self.prompt_tokens += call.prompt_tokens;
        self.completion_tokens += call.completion_tokens;
        self.total_tokens += call.prompt_tokens + call.completion_tokens;
        self.cost += call.cost;
    }

    /// Merge an executor cycle. Tool counts are already accumulated on the
    /// executor side, so take the maximum instead of summing; execution
    /// steps are an absolute value.
    pub fn absorb_cycle(&mut self, cycle: &CycleMetrics) {
        self.prompt_tokens += cycle.prompt_tokens;
        self.completion_tokens += cycle.completion_tokens;
        self.total_tokens += cycle.prompt_tokens + cycle.completion_tokens;
        self.cost += cycle.cost;
        self.execution_steps = self.execution_steps.max(cycle.execution_steps);
        for (tool, count) in &cycle.tool_calls {
            let entry = self.tool_calls.entry(tool.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
    }

    pub fn mark_finished(&mut self, found: bool, reason: &str) {
        self.end_time = Some(Utc::now());
        self.success_info = SuccessInfo { found, reason: reason.to_string() };
    }

    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Append-only run log of session milestones.
#[derive(Debug, Default)]
pub struct RunLog {
    entries: Vec<Value>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &str, data: Value) {
        self.entries.push(json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        }));
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn snapshot(&self) -> Value {
        Value::Array(self.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_merge_sets_not_sums_steps() {
        let mut metrics = SessionMetrics::new("s1", "goal");
        let mut cycle = CycleMetrics {
            execution_steps: 5,
            ..Default::default()
        };
        cycle.tool_calls.insert("nmap".into(), 3);
        metrics.absorb_cycle(&cycle);

        // The executor reports accumulated totals; a later snapshot with a
        // higher step count replaces rather than adds.
        cycle.execution_steps = 8;
        cycle.tool_calls.insert("nmap".into(), 4);
        metrics.absorb_cycle(&cycle);

        assert_eq!(metrics.execution_steps, 8);
        assert_eq!(metrics.tool_calls.get("nmap"), Some(&4));
    }

    #[test]
    fn test_call_absorption_sums_tokens() {
        let mut metrics = SessionMetrics::new("s1", "goal");
        metrics.absorb_call(&CallMetrics { prompt_tokens: 10, completion_tokens: 4, cost: 0.1 });
        metrics.absorb_call(&CallMetrics { prompt_tokens: 6, completion_tokens: 2, cost: 0.1 });
        assert_eq!(metrics.total_tokens, 22);
        assert!((metrics.cost - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_run_log_entries() {
        let mut log = RunLog::new();
        log.push("task_initialized", json!({"goal": "g"}));
        log.push("initial_plan", json!({"ops": 2}));
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.entries()[0]["event"], "task_initialized");
    }
}
