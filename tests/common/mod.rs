//! Shared fakes for integration tests: a scripted LLM transport and a
//! scripted tool dispatcher, plus wiring helpers.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use stratagem::domain::error::LlmError;
use stratagem::domain::models::{CallMetrics, ChatMessage};
use stratagem::domain::ports::{LlmReply, LlmTransport, ToolDispatch, ToolInfo};
use stratagem::infrastructure::persistence::PersistenceHandle;
use stratagem::services::{EventBroker, GraphManager};

/// Role-keyed queues of scripted JSON replies. When a role's queue runs
/// dry the transport returns an error, which the components under test
/// must absorb via their fallback paths.
#[derive(Default)]
pub struct ScriptedLlm {
    replies: Mutex<HashMap<String, VecDeque<Value>>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, role: &str, reply: Value) {
        self.replies
            .lock()
            .unwrap()
            .entry(role.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn call_count(&self, role: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_str() == role)
            .count()
    }
}

#[async_trait]
impl LlmTransport for ScriptedLlm {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        role: &str,
        _expect_json: bool,
    ) -> Result<(LlmReply, CallMetrics), LlmError> {
        self.calls.lock().unwrap().push(role.to_string());
        // Executor prompts name their subtask; a queue registered for
        // "executor:<subtask_id>" takes precedence over the shared queue,
        // which keeps concurrent-batch tests deterministic.
        let scoped_key = messages
            .first()
            .and_then(|m| {
                m.content
                    .split("Current subtask: ")
                    .nth(1)
                    .and_then(|rest| rest.lines().next())
            })
            .map(|subtask_id| format!("{role}:{}", subtask_id.trim()));
        let mut replies = self.replies.lock().unwrap();
        let next = scoped_key
            .filter(|key| replies.contains_key(key))
            .and_then(|key| replies.get_mut(&key).and_then(VecDeque::pop_front))
            .or_else(|| replies.get_mut(role).and_then(VecDeque::pop_front));
        drop(replies);
        match next {
            Some(value) => Ok((
                LlmReply::Json(value),
                CallMetrics { prompt_tokens: 10, completion_tokens: 5, cost: 0.001 },
            )),
            None => Err(LlmError::EmptyReply),
        }
    }

    async fn summarize_conversation(
        &self,
        _messages: &[ChatMessage],
    ) -> Result<(String, CallMetrics), LlmError> {
        Ok((
            "compressed summary of earlier exploration".to_string(),
            CallMetrics::default(),
        ))
    }
}

type CallHook = Box<dyn Fn(&str) + Send + Sync>;

/// Tool dispatcher with per-tool queues of canned results and an optional
/// hook fired on every call (used to flip the halt latch mid-run).
#[derive(Default)]
pub struct ScriptedTools {
    results: Mutex<HashMap<String, VecDeque<String>>>,
    pub invocations: Mutex<Vec<(String, Value)>>,
    hook: Mutex<Option<CallHook>>,
}

impl ScriptedTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_result(&self, tool: &str, result: Value) {
        self.results
            .lock()
            .unwrap()
            .entry(tool.to_string())
            .or_default()
            .push_back(result.to_string());
    }

    pub fn set_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn invocation_count(&self, tool: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == tool)
            .count()
    }
}

#[async_trait]
impl ToolDispatch for ScriptedTools {
    async fn call(&self, tool: &str, params: Value) -> String {
        self.invocations
            .lock()
            .unwrap()
            .push((tool.to_string(), params));
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(tool);
        }
        self.results
            .lock()
            .unwrap()
            .get_mut(tool)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| json!({"success": true}).to_string())
    }

    async fn catalog(&self) -> Vec<ToolInfo> {
        vec![ToolInfo {
            name: "probe".to_string(),
            description: "probe the target".to_string(),
            input_schema: json!({"type": "object"}),
            server: "scripted".to_string(),
        }]
    }

    async fn shutdown(&self) {}
}

/// A graph manager wired to a disconnected sink and a fresh broker.
pub fn test_graph(session_id: &str, goal: &str) -> Arc<AsyncMutex<GraphManager>> {
    Arc::new(AsyncMutex::new(GraphManager::new(
        session_id,
        format!("task_{session_id}"),
        goal,
        PersistenceHandle::disconnected(),
        Arc::new(EventBroker::new()),
    )))
}

/// A minimal executor reply that runs one tool.
pub fn exec_reply(raw_step_id: &str, tool: &str, complete: bool) -> Value {
    json!({
        "previous_steps_status": {},
        "thought": "next probe",
        "execution_operations": [{
            "command": "EXECUTE_NOW",
            "node_id": raw_step_id,
            "thought": "run the tool",
            "action": {"tool": tool, "params": {"target": "t"}}
        }],
        "staged_causal_nodes": [{
            "id": format!("staged_{raw_step_id}"),
            "node_type": "Evidence",
            "description": "observed output"
        }],
        "hypothesis_update": {"observation_summary": "saw something"},
        "is_subtask_complete": complete
    })
}

/// An executor reply with no operations that declares completion.
pub fn done_reply() -> Value {
    json!({
        "previous_steps_status": {},
        "thought": "criteria met",
        "execution_operations": [],
        "staged_causal_nodes": [],
        "hypothesis_update": {},
        "is_subtask_complete": true
    })
}

/// A reflector reply with the given audit status.
pub fn reflection_reply(status: &str) -> Value {
    json!({
        "audit_result": {
            "status": status,
            "completion_check": "audited",
            "methodology_issues": [],
            "logic_issues": []
        },
        "key_findings": ["a finding"],
        "validated_nodes": [],
        "insight": null,
        "causal_graph_updates": {"nodes": [], "edges": []}
    })
}
