//! Reflector adapter: audits finished subtasks and curates the causal
//! graph.
//!
//! The reflector's verdict is authoritative: the orchestrator copies its
//! audit status onto the subtask, and only validated causal updates reach
//! the graph. A reply that cannot be parsed degrades to a FAILED audit
//! carrying the parse error.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::domain::models::{
    AuditResult, AuditStatus, CallMetrics, CausalUpdates, ChatMessage, Reflection,
};
use crate::domain::ports::{LlmReply, LlmTransport};
use crate::services::broker::EventBroker;
use crate::services::graph::{DependencyContext, FailurePatterns};
use crate::services::prompts;

/// One remembered reflection, kept for the rolling context window.
#[derive(Debug, Clone)]
struct ReflectionNote {
    at: DateTime<Utc>,
    subtask_id: String,
    status: AuditStatus,
    first_finding: Option<String>,
}

/// LLM-backed reflector.
pub struct Reflector {
    llm: Arc<dyn LlmTransport>,
    broker: Arc<EventBroker>,
    session_id: String,
    /// Reflections retained in the prompt context before older ones fall off
    history_window: usize,
    reflection_log: Mutex<Vec<ReflectionNote>>,
}

impl Reflector {
    pub fn new(llm: Arc<dyn LlmTransport>, broker: Arc<EventBroker>, session_id: &str) -> Self {
        Self {
            llm,
            broker,
            session_id: session_id.to_string(),
            history_window: 5,
            reflection_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    fn record_note(&self, subtask_id: &str, reflection: &Reflection) {
        let mut log = self.reflection_log.lock().unwrap();
        log.push(ReflectionNote {
            at: Utc::now(),
            subtask_id: subtask_id.to_string(),
            status: reflection.audit_result.status,
            first_finding: reflection.key_findings.first().cloned(),
        });
        let window = self.history_window;
        if log.len() > window {
            let excess = log.len() - window;
            log.drain(..excess);
        }
    }

    fn history_section(&self) -> String {
        let log = self.reflection_log.lock().unwrap();
        if log.is_empty() {
            return String::new();
        }
        let mut lines = vec!["\n## Recent reflections".to_string()];
        for note in log.iter() {
            lines.push(format!(
                "- {}: {} -> {}{}",
                note.at.format("%H:%M:%S"),
                note.subtask_id,
                note.status.as_str(),
                note.first_finding
                    .as_ref()
                    .map(|f| format!("; {f}"))
                    .unwrap_or_default()
            ));
        }
        lines.join("\n")
    }

    fn parse_reflection(value: &Value) -> Option<Reflection> {
        let audit = value.get("audit_result")?;
        let status = AuditStatus::from_str(audit.get("status")?.as_str()?)?;
        let audit_result = AuditResult {
            status,
            completion_check: audit
                .get("completion_check")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
            methodology_issues: string_list(audit.get("methodology_issues")),
            logic_issues: string_list(audit.get("logic_issues")),
            is_strategic_failure: audit
                .get("is_strategic_failure")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };
        let updates = value.get("causal_graph_updates");
        Some(Reflection {
            audit_result,
            key_findings: string_list(value.get("key_findings")),
            validated_nodes: value
                .get("validated_nodes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            insight: value.get("insight").filter(|v| !v.is_null()).cloned(),
            causal_graph_updates: CausalUpdates {
                nodes: updates
                    .and_then(|u| u.get("nodes"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                edges: updates
                    .and_then(|u| u.get("edges"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            },
            metrics: None,
        })
    }

    /// Audit one finished subtask.
    #[allow(clippy::too_many_arguments)]
    pub async fn reflect(
        &self,
        subtask_id: &str,
        subtask_description: &str,
        completion_criteria: &str,
        outcome: &str,
        execution_log: &str,
        staged_causal_nodes: &[Value],
        full_graph_summary: &str,
        dependency_context: &[DependencyContext],
        failure_patterns: &FailurePatterns,
        termination_reason: Option<&str>,
    ) -> Reflection {
        let mut dependency_lines: Vec<String> = dependency_context
            .iter()
            .map(|dep| {
                format!(
                    "- {} [{}]: {}",
                    dep.id,
                    dep.status,
                    dep.summary.as_deref().unwrap_or("(no summary)")
                )
            })
            .collect();
        if let Some(reason) = termination_reason {
            dependency_lines.push(format!("- executor termination reason: {reason}"));
        }
        let dependency_text = if dependency_lines.is_empty() {
            "None.".to_string()
        } else {
            dependency_lines.join("\n")
        };

        let mut prompt = prompts::reflector_prompt(
            subtask_description,
            completion_criteria,
            outcome,
            execution_log,
            staged_causal_nodes,
            full_graph_summary,
            &dependency_text,
            failure_patterns,
        );
        prompt.push_str(&self.history_section());
        let messages = vec![ChatMessage::user(prompt)];

        let mut reflection = match self.llm.send_message(&messages, "reflector", true).await {
            Ok((LlmReply::Json(value), metrics)) => match Self::parse_reflection(&value) {
                Some(mut reflection) => {
                    reflection.metrics = Some(metrics);
                    reflection
                }
                None => {
                    tracing::error!(subtask_id, "reflector reply failed to parse");
                    Reflection::parse_failure("reflector reply missing audit_result")
                }
            },
            Ok(_) => Reflection::parse_failure("reflector returned non-JSON content"),
            Err(e) => {
                tracing::error!(subtask_id, error = %e, "reflection call failed");
                Reflection::parse_failure(e.to_string())
            }
        };

        self.record_note(subtask_id, &reflection);
        tracing::info!(
            subtask_id,
            status = reflection.audit_result.status.as_str(),
            findings = reflection.key_findings.len(),
            "reflection completed"
        );
        self.broker.emit(
            "reflection.completed",
            json!({
                "subtask_id": subtask_id,
                "status": reflection.audit_result.status.as_str(),
            }),
            Some(&self.session_id),
        );
        // The metrics slot is always present on success paths.
        if reflection.metrics.is_none() {
            reflection.metrics = Some(CallMetrics::default());
        }
        reflection
    }

    /// Secondary yes/no check of completion criteria against the log.
    pub async fn validate_completion(
        &self,
        completion_criteria: &str,
        execution_log: &str,
    ) -> bool {
        if completion_criteria.is_empty() || execution_log.is_empty() {
            return false;
        }
        let prompt = prompts::completion_validation_prompt(completion_criteria, execution_log);
        let messages = vec![ChatMessage::user(prompt)];
        match self
            .llm
            .send_message(&messages, "reflector_validator", false)
            .await
        {
            Ok((LlmReply::Text(text), _)) => text.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// Session-level reflection, run only when the goal was achieved.
    /// Condenses the simplified success subgraph into a
    /// strategy-tactic-applicability record.
    pub async fn reflect_global(
        &self,
        simplified_graph: &Value,
        goal_achieved: bool,
    ) -> Value {
        if !goal_achieved {
            return json!({
                "global_summary": "Mission not achieved; skipping global experience archive.",
                "strategic_analysis": "",
                "global_insight": null,
            });
        }
        let prompt = prompts::global_reflection_prompt(simplified_graph);
        let messages = vec![ChatMessage::user(prompt)];
        match self.llm.send_message(&messages, "reflector", true).await {
            Ok((LlmReply::Json(mut value), _)) => {
                if let Some(insight) = value
                    .get_mut("global_insight")
                    .filter(|v| v.is_object())
                    .and_then(Value::as_object_mut)
                {
                    insight.insert("example_trajectory".to_string(), simplified_graph.clone());
                }
                value
            }
            _ => json!({
                "global_summary": "Global reflection failed to parse.",
                "strategic_analysis": "",
                "global_insight": null,
            }),
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("description")
                        .or_else(|| other.get("text"))
                        .or_else(|| other.get("finding"))
                        .and_then(Value::as_str)
                        .map_or_else(|| other.to_string(), str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::LlmError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedLlm {
        replies: Mutex<Vec<Result<Value, ()>>>,
    }

    #[async_trait]
    impl LlmTransport for ScriptedLlm {
        async fn send_message(
            &self,
            _messages: &[ChatMessage],
            _role: &str,
            expect_json: bool,
        ) -> Result<(LlmReply, CallMetrics), LlmError> {
            match self.replies.lock().unwrap().remove(0) {
                Ok(value) if !expect_json => {
                    let text = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                    Ok((LlmReply::Text(text), CallMetrics::default()))
                }
                Ok(value) => Ok((LlmReply::Json(value), CallMetrics::default())),
                Err(()) => Err(LlmError::EmptyReply),
            }
        }

        async fn summarize_conversation(
            &self,
            _messages: &[ChatMessage],
        ) -> Result<(String, CallMetrics), LlmError> {
            Ok((String::new(), CallMetrics::default()))
        }
    }

    fn reflector(replies: Vec<Result<Value, ()>>) -> Reflector {
        Reflector::new(
            Arc::new(ScriptedLlm { replies: Mutex::new(replies) }),
            Arc::new(EventBroker::new()),
            "s1",
        )
    }

    #[tokio::test]
    async fn test_reflect_parses_full_reply() {
        let reply = json!({
            "audit_result": {
                "status": "GOAL_ACHIEVED",
                "completion_check": "flag captured",
                "methodology_issues": [],
                "logic_issues": []
            },
            "key_findings": ["admin creds in backup", {"description": "weak session ids"}],
            "validated_nodes": [{"id": "v1", "node_type": "ConfirmedVulnerability"}],
            "insight": {"note": "reuse"},
            "causal_graph_updates": {"nodes": [{"id": "n1"}], "edges": []}
        });
        let reflection = reflector(vec![Ok(reply)])
            .reflect(
                "subtask_1",
                "capture the flag",
                "flag printed",
                "completed",
                "log",
                &[],
                "graph",
                &[],
                &FailurePatterns::default(),
                None,
            )
            .await;
        assert_eq!(reflection.audit_result.status, AuditStatus::GoalAchieved);
        assert_eq!(reflection.key_findings.len(), 2);
        assert_eq!(reflection.key_findings[1], "weak session ids");
        assert_eq!(reflection.causal_graph_updates.nodes.len(), 1);
        assert!(reflection.insight.is_some());
    }

    #[tokio::test]
    async fn test_reflect_fallback_on_garbage() {
        let reflection = reflector(vec![Ok(json!({"no_audit": true}))])
            .reflect(
                "subtask_1",
                "d",
                "c",
                "completed",
                "log",
                &[],
                "graph",
                &[],
                &FailurePatterns::default(),
                None,
            )
            .await;
        assert_eq!(reflection.audit_result.status, AuditStatus::Failed);
        assert!(!reflection.audit_result.logic_issues.is_empty());
    }

    #[tokio::test]
    async fn test_reflect_fallback_on_llm_error() {
        let reflection = reflector(vec![Err(())])
            .reflect(
                "subtask_1",
                "d",
                "c",
                "error",
                "log",
                &[],
                "graph",
                &[],
                &FailurePatterns::default(),
                Some("max_steps_reached"),
            )
            .await;
        assert_eq!(reflection.audit_result.status, AuditStatus::Failed);
    }

    #[tokio::test]
    async fn test_validate_completion_parses_boolean_verdict() {
        let reflector = reflector(vec![Ok(json!("true"))]);
        assert!(reflector.validate_completion("flag printed", "step 1: flag printed").await);

        let reflector = self::reflector(vec![Ok(json!("false"))]);
        assert!(!reflector.validate_completion("flag printed", "nothing happened").await);

        // Empty inputs short-circuit without an LLM call.
        let reflector = self::reflector(vec![]);
        assert!(!reflector.validate_completion("", "log").await);
    }

    #[tokio::test]
    async fn test_global_reflection_skipped_without_goal() {
        let value = reflector(vec![])
            .reflect_global(&json!({"nodes": []}), false)
            .await;
        assert!(value["global_insight"].is_null());
    }

    #[tokio::test]
    async fn test_global_reflection_attaches_trajectory() {
        let reply = json!({
            "global_summary": "won",
            "strategic_analysis": "solid",
            "global_insight": {
                "strategic_principle": "p",
                "tactical_playbook": ["a"],
                "applicability": ["ctf"]
            }
        });
        let simplified = json!({"nodes": [{"id": "s"}], "edges": []});
        let value = reflector(vec![Ok(reply)])
            .reflect_global(&simplified, true)
            .await;
        assert_eq!(value["global_insight"]["example_trajectory"], simplified);
    }
}
