//! Planner adapter: turns LLM replies into validated graph-operation
//! batches.
//!
//! Three entry points: initial planning, dynamic replanning over the
//! aggregated intelligence, and regeneration of a failed branch. Every
//! batch passes through the same sanitation; a parse failure on the
//! initial plan degrades to a single reconnaissance subtask rather than
//! aborting the session.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::domain::models::{CallMetrics, ChatMessage, GraphOp, IntelligenceSummary, PlanData};
use crate::domain::ports::{LlmReply, LlmTransport};
use crate::services::broker::EventBroker;
use crate::services::graph::FailurePatterns;
use crate::services::prompts;

/// One remembered planning round, kept for the rolling context window.
#[derive(Debug, Clone)]
struct PlanningAttempt {
    at: DateTime<Utc>,
    operations: usize,
    briefing: Option<String>,
}

/// LLM-backed planner.
pub struct Planner {
    llm: Arc<dyn LlmTransport>,
    broker: Arc<EventBroker>,
    session_id: String,
    /// Attempts retained in the prompt context before older rounds fall off
    history_window: usize,
    planning_history: Mutex<Vec<PlanningAttempt>>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmTransport>, broker: Arc<EventBroker>, session_id: &str) -> Self {
        Self {
            llm,
            broker,
            session_id: session_id.to_string(),
            history_window: 5,
            planning_history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    fn record_attempt(&self, operations: usize, briefing: Option<&str>) {
        let mut history = self.planning_history.lock().unwrap();
        history.push(PlanningAttempt {
            at: Utc::now(),
            operations,
            briefing: briefing.map(str::to_string),
        });
        let window = self.history_window;
        if history.len() > window {
            let excess = history.len() - window;
            history.drain(..excess);
        }
    }

    fn history_section(&self) -> String {
        let history = self.planning_history.lock().unwrap();
        if history.is_empty() {
            return String::new();
        }
        let mut lines = vec!["\n## Recent planning attempts".to_string()];
        for attempt in history.iter() {
            lines.push(format!(
                "- {}: {} operation(s){}",
                attempt.at.format("%H:%M:%S"),
                attempt.operations,
                attempt
                    .briefing
                    .as_ref()
                    .map(|b| format!("; briefing: {b}"))
                    .unwrap_or_default()
            ));
        }
        lines.join("\n")
    }

    /// Dedupe ADD_NODE operations by id; everything else passes through.
    /// (Structurally unusable operations were already dropped at parse.)
    fn sanitize(ops: Vec<GraphOp>) -> Vec<GraphOp> {
        let mut seen_add_ids = HashSet::new();
        ops.into_iter()
            .filter(|op| match op {
                GraphOp::AddNode(data) => seen_add_ids.insert(data.id.clone()),
                _ => true,
            })
            .collect()
    }

    /// Produce the initial operation batch for a fresh goal.
    pub async fn plan(
        &self,
        goal: &str,
        causal_graph_summary: &str,
    ) -> (Vec<GraphOp>, Option<CallMetrics>) {
        let prompt = prompts::planner_prompt(goal, causal_graph_summary);
        let messages = vec![ChatMessage::user(prompt)];

        let parsed = match self.llm.send_message(&messages, "planner", true).await {
            Ok((LlmReply::Json(value), metrics)) => PlanData::from_value(&value).map(|p| (p, metrics)),
            Ok(_) => None,
            Err(e) => {
                tracing::error!(error = %e, "initial planning failed");
                None
            }
        };

        let (ops, metrics) = match parsed {
            Some((plan, metrics)) => (Self::sanitize(plan.graph_operations), Some(metrics)),
            None => {
                tracing::warn!("planner reply unusable, falling back to reconnaissance plan");
                let fallback = GraphOp::from_value(&json!({
                    "command": "ADD_NODE",
                    "node_data": {
                        "id": "subtask_1",
                        "description": format!("Perform initial reconnaissance to understand the target: {goal}"),
                        "dependencies": [],
                        "priority": 1,
                    }
                }))
                .expect("fallback op is well-formed");
                (vec![fallback], None)
            }
        };

        self.record_attempt(ops.len(), None);
        self.broker.emit(
            "planning.initial.completed",
            json!({"operations_count": ops.len()}),
            Some(&self.session_id),
        );
        (ops, metrics)
    }

    /// Replan after a batch of reflections. Returns None when the reply is
    /// unusable; the orchestrator then continues with the current graph.
    #[allow(clippy::too_many_arguments)]
    pub async fn dynamic_plan(
        &self,
        goal: &str,
        graph_summary: &str,
        intelligence: &IntelligenceSummary,
        causal_graph_summary: &str,
        attack_path_summary: &str,
        failure_patterns: &FailurePatterns,
        failed_tasks: &[(String, String, String)],
    ) -> (Option<PlanData>, Option<CallMetrics>) {
        let intelligence_json =
            serde_json::to_string_pretty(intelligence).unwrap_or_default();
        let failed_tasks_summary = failed_tasks
            .iter()
            .map(|(id, status, description)| {
                format!("- Task ID: {id}, Status: {status}, Description: {description}")
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut prompt = prompts::dynamic_planner_prompt(
            goal,
            graph_summary,
            &intelligence_json,
            causal_graph_summary,
            attack_path_summary,
            failure_patterns,
            &failed_tasks_summary,
        );
        prompt.push_str(&self.history_section());
        let messages = vec![ChatMessage::user(prompt)];

        match self.llm.send_message(&messages, "planner", true).await {
            Ok((LlmReply::Json(value), metrics)) => match PlanData::from_value(&value) {
                Some(mut plan) => {
                    plan.graph_operations = Self::sanitize(plan.graph_operations);
                    self.record_attempt(
                        plan.graph_operations.len(),
                        plan.global_mission_briefing.as_deref(),
                    );
                    self.broker.emit(
                        "planning.dynamic.completed",
                        json!({"operations_count": plan.graph_operations.len()}),
                        Some(&self.session_id),
                    );
                    (Some(plan), Some(metrics))
                }
                None => {
                    tracing::error!("dynamic plan reply missing graph_operations");
                    (None, Some(metrics))
                }
            },
            Ok(_) => (None, None),
            Err(e) => {
                tracing::error!(error = %e, "dynamic planning failed");
                (None, None)
            }
        }
    }

    /// Regenerate a failed branch. UPDATE_NODE operations touching the
    /// dead branch are rewritten into DEPRECATE_NODE carrying the failure
    /// reason, so the replacement plan cannot quietly revive it.
    pub async fn regenerate_branch_plan(
        &self,
        failed_branch_root_id: &str,
        original_branch_goal: &str,
        failure_reason: &str,
        dead_branch_ids: &HashSet<String>,
    ) -> (Vec<GraphOp>, Option<CallMetrics>) {
        let dead_list: Vec<String> = dead_branch_ids.iter().cloned().collect();
        let prompt =
            prompts::branch_replan_prompt(original_branch_goal, failure_reason, &dead_list);
        let messages = vec![ChatMessage::user(prompt)];

        let reply = self.llm.send_message(&messages, "planner", true).await;
        let (ops, metrics) = match reply {
            Ok((LlmReply::Json(value), metrics)) => match PlanData::from_value(&value) {
                Some(plan) => (plan.graph_operations, Some(metrics)),
                None => (Vec::new(), Some(metrics)),
            },
            _ => (Vec::new(), None),
        };

        let rewritten = Self::sanitize(ops)
            .into_iter()
            .map(|op| match op {
                GraphOp::UpdateNode { node_id, .. } if dead_branch_ids.contains(&node_id) => {
                    GraphOp::DeprecateNode {
                        node_id,
                        reason: format!(
                            "Branch '{failed_branch_root_id}' failed: {failure_reason}"
                        ),
                    }
                }
                other => other,
            })
            .collect();
        (rewritten, metrics)
    }
}
