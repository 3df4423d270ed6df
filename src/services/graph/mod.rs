//! Graph manager: the single owner of the dual task/causal graph.
//!
//! Every other component reads through queries and mutates through the
//! methods here. Each method completes atomically with respect to the
//! in-memory state; durable mirroring happens through the non-blocking
//! persistence handle, and observers are notified through the broker.

pub mod causal_graph;
pub mod task_graph;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::domain::error::GraphError;
use crate::domain::models::{
    AuditStatus, CausalUpdates, ChatMessage, ExecutionStep, StepStatus, Subtask, SubtaskStatus,
};
use crate::infrastructure::persistence::sink::PersistenceHandle;
use crate::infrastructure::persistence::store::{EdgeRow, NodeRow};
use crate::services::broker::EventBroker;

pub use causal_graph::{AttackPath, CausalContext, CausalGraph, FailurePatterns};
pub use task_graph::{StatusChange, TaskEdgeType, TaskGraph, TaskNode};

/// Default stall window for hypothesis analysis, in seconds.
pub const DEFAULT_STALL_WINDOW_SECS: i64 = 3600;

/// Dependency context handed to the executor prompt and the reflector.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DependencyContext {
    pub id: String,
    pub status: String,
    pub description: String,
    pub summary: Option<String>,
    pub key_findings: Vec<String>,
    pub failure_reason: Option<String>,
    pub artifacts: Vec<Value>,
    pub execution_summary: String,
}

/// Everything the executor prompt renderer needs for one subtask.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PromptContext {
    pub subtask_id: String,
    pub description: String,
    pub completion_criteria: String,
    pub key_facts: Vec<String>,
    pub causal_context: CausalContext,
    pub causal_graph_summary: String,
    pub dependencies: Vec<DependencyContext>,
    pub execution_summary: String,
}

/// Owner of both graphs for one session.
pub struct GraphManager {
    session_id: String,
    goal: String,
    tasks: TaskGraph,
    causal: CausalGraph,
    sink: PersistenceHandle,
    broker: Arc<EventBroker>,
}

impl GraphManager {
    pub fn new(
        session_id: impl Into<String>,
        root_task_id: impl Into<String>,
        goal: impl Into<String>,
        sink: PersistenceHandle,
        broker: Arc<EventBroker>,
    ) -> Self {
        let session_id = session_id.into();
        let root_task_id = root_task_id.into();
        let goal = goal.into();
        let manager = Self {
            session_id: session_id.clone(),
            goal: goal.clone(),
            tasks: TaskGraph::new(root_task_id.clone(), goal.clone()),
            causal: CausalGraph::new(),
            sink,
            broker,
        };
        manager.sink.upsert_node(
            &session_id,
            "task",
            NodeRow {
                node_id: root_task_id,
                node_type: "task".into(),
                status: Some("in_progress".into()),
                data: json!({"goal": goal}),
            },
        );
        manager
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn root_id(&self) -> &str {
        self.tasks.root_id()
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.tasks.has_node(id)
    }

    pub fn subtask(&self, id: &str) -> Option<Subtask> {
        self.tasks.subtask(id).cloned()
    }

    pub fn causal_node_count(&self) -> usize {
        self.causal.node_count()
    }

    /// Confidence of a causal node, if it carries one.
    pub fn causal_confidence(&self, id: &str) -> Option<f64> {
        self.causal.node(id).and_then(|n| n.confidence)
    }

    /// Lifecycle status of a causal node.
    pub fn causal_status(&self, id: &str) -> Option<crate::domain::models::CausalStatus> {
        self.causal.node(id).map(|n| n.status)
    }

    /// (parent id, failed?) view of a step, for failure-pattern tracking.
    pub fn step_view(&self, step_id: &str) -> Option<(String, bool)> {
        self.tasks
            .step(step_id)
            .map(|s| (s.parent.clone(), s.status == StepStatus::Failed))
    }

    fn emit_graph_changed(&self, reason: &str, extra: Value) {
        let mut payload = json!({"reason": reason});
        if let (Some(obj), Some(extra_obj)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        self.broker
            .emit("graph.changed", payload, Some(&self.session_id));
    }

    fn mirror_subtask(&self, id: &str) {
        if let Some(subtask) = self.tasks.subtask(id) {
            self.sink.upsert_node(
                &self.session_id,
                "task",
                NodeRow {
                    node_id: subtask.id.clone(),
                    node_type: "subtask".into(),
                    status: Some(subtask.status.as_str().to_string()),
                    data: serde_json::to_value(subtask).unwrap_or(Value::Null),
                },
            );
        }
    }

    fn mirror_step(&self, id: &str) {
        if let Some(step) = self.tasks.step(id) {
            self.sink.upsert_node(
                &self.session_id,
                "task",
                NodeRow {
                    node_id: step.id.clone(),
                    node_type: "execution_step".into(),
                    status: Some(step.status.as_str().to_string()),
                    data: serde_json::to_value(step).unwrap_or(Value::Null),
                },
            );
        }
    }

    fn mirror_causal_node(&self, id: &str) {
        if let Some(node) = self.causal.node(id) {
            self.sink.upsert_node(
                &self.session_id,
                "causal",
                NodeRow {
                    node_id: node.id.clone(),
                    node_type: node.node_type.as_str().to_string(),
                    status: Some(node.status.as_str().to_string()),
                    data: serde_json::to_value(node).unwrap_or(Value::Null),
                },
            );
        }
    }

    // ---- task graph mutations ------------------------------------------

    /// Add (or refresh) a subtask with its dependency edges.
    pub fn add_subtask(&mut self, subtask: Subtask, dependencies: &[String]) {
        let id = subtask.id.clone();
        self.tasks.add_subtask(subtask, dependencies);
        self.mirror_subtask(&id);
        for dep in dependencies {
            self.sink.add_edge(
                &self.session_id,
                "task",
                EdgeRow {
                    source: dep.clone(),
                    target: id.clone(),
                    relation_type: "dependency".into(),
                    data: Value::Object(Map::new()),
                },
            );
        }
        if dependencies.is_empty() {
            self.sink.add_edge(
                &self.session_id,
                "task",
                EdgeRow {
                    source: self.tasks.root_id().to_string(),
                    target: id.clone(),
                    relation_type: "decomposition".into(),
                    data: Value::Object(Map::new()),
                },
            );
        }
        self.emit_graph_changed("subtask_added", json!({"node_id": id}));
    }

    /// Add an execution step; assigns the session-wide sequence number.
    pub fn add_execution_step(&mut self, step: ExecutionStep) -> Result<u64, GraphError> {
        let id = step.id.clone();
        let parent = step.parent.clone();
        let sequence = self.tasks.add_execution_step(step)?;
        self.mirror_step(&id);
        self.sink.add_edge(
            &self.session_id,
            "task",
            EdgeRow {
                source: parent,
                target: id.clone(),
                relation_type: "execution".into(),
                data: Value::Object(Map::new()),
            },
        );
        self.emit_graph_changed("execution_step_added", json!({"step_id": id}));
        Ok(sequence)
    }

    /// Apply a loose update map to a node (subtask or step), enforcing the
    /// status invariants. Illegal transitions are corrected silently and
    /// recorded on the node.
    pub fn update_node(&mut self, id: &str, updates: &Map<String, Value>) {
        if self.tasks.subtask(id).is_some() {
            let change = self.tasks.update_subtask_fields(id, updates);
            match change {
                Some(StatusChange::RejectedCompletedToDeprecated)
                | Some(StatusChange::RejectedTerminalRevival) => {
                    self.emit_graph_changed("status_protected", json!({"node_id": id}));
                }
                Some(StatusChange::Applied(status)) => {
                    self.emit_graph_changed(
                        "status_changed",
                        json!({"node_id": id, "status": status.as_str()}),
                    );
                }
                _ => {}
            }
            self.mirror_subtask(id);
        } else if self.tasks.step(id).is_some() {
            if let Some(status) = updates
                .get("status")
                .and_then(Value::as_str)
                .and_then(StepStatus::from_str)
            {
                self.tasks.set_step_status(id, status);
            }
            self.mirror_step(id);
        } else {
            tracing::warn!(node_id = %id, "update_node: node not found");
        }
    }

    /// Record a step's observation with truncation metadata.
    pub fn record_observation(
        &mut self,
        step_id: &str,
        observation: String,
        truncated: bool,
        original_length: usize,
        status: StepStatus,
    ) {
        self.tasks
            .set_step_observation(step_id, observation, truncated, original_length, status);
        self.mirror_step(step_id);
    }

    pub fn set_step_status(&mut self, step_id: &str, status: StepStatus) {
        self.tasks.set_step_status(step_id, status);
        self.mirror_step(step_id);
    }

    /// Copy the reflector's authoritative verdict onto the subtask.
    pub fn set_audit_status(&mut self, subtask_id: &str, audit: AuditStatus) {
        let mapped = match audit {
            AuditStatus::GoalAchieved | AuditStatus::Completed => SubtaskStatus::Completed,
            AuditStatus::PartialSuccess => SubtaskStatus::CompletedError,
            AuditStatus::Failed => SubtaskStatus::Failed,
            AuditStatus::Aggregated => return,
        };
        let mut updates = Map::new();
        updates.insert("status".into(), Value::String(mapped.as_str().to_string()));
        self.tasks.update_subtask_fields(subtask_id, &updates);
        if let Some(subtask) = self.tasks.subtask_mut(subtask_id) {
            subtask.audit_status = Some(audit);
        }
        self.mirror_subtask(subtask_id);
        self.emit_graph_changed(
            "audit_applied",
            json!({"node_id": subtask_id, "audit_status": audit.as_str()}),
        );
    }

    /// Whether any reflection declared the session goal achieved.
    pub fn is_goal_achieved(&self) -> bool {
        self.tasks
            .subtasks()
            .any(|s| s.audit_status == Some(AuditStatus::GoalAchieved))
    }

    // ---- staged causal nodes -------------------------------------------

    /// Stage executor-proposed causal nodes on the subtask.
    pub fn stage_proposed_causal_nodes(
        &mut self,
        subtask_id: &str,
        proposals: Vec<Value>,
    ) -> Result<(), GraphError> {
        self.tasks.stage_causal_nodes(subtask_id, proposals)?;
        self.mirror_subtask(subtask_id);
        Ok(())
    }

    pub fn staged_causal_nodes(&self, subtask_id: &str) -> Vec<Value> {
        self.tasks
            .subtask(subtask_id)
            .map(|s| s.staged_causal_nodes.clone())
            .unwrap_or_default()
    }

    /// Drop the staged proposals once a subtask has been reflected.
    pub fn clear_staged_causal_nodes(&mut self, subtask_id: &str) {
        let removed = self.tasks.clear_staged_causal_nodes(subtask_id);
        for id in removed {
            self.sink.delete_node(&self.session_id, "task", &id);
        }
        self.mirror_subtask(subtask_id);
    }

    // ---- causal graph ---------------------------------------------------

    /// Register a deduplicated key fact.
    pub fn add_key_fact(&mut self, fact: &str) -> Option<String> {
        let id = self.causal.add_key_fact(fact)?;
        self.mirror_causal_node(&id);
        Some(id)
    }

    /// Pre-validate causal updates: every edge endpoint must exist in the
    /// causal graph or in the update's node list. Endpoints that match a
    /// staged node of `subtask_id` are auto-promoted into the node list;
    /// edges whose endpoints still cannot be resolved are dropped.
    pub fn validate_causal_graph_updates(
        &self,
        updates: &CausalUpdates,
        subtask_id: Option<&str>,
    ) -> CausalUpdates {
        let mut nodes = updates.nodes.clone();
        let mut node_ids: HashSet<String> = nodes
            .iter()
            .filter_map(|n| n.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();

        let staged: HashMap<String, Value> = subtask_id
            .and_then(|id| self.tasks.subtask(id))
            .map(|s| {
                s.staged_causal_nodes
                    .iter()
                    .filter_map(|n| {
                        n.get("id")
                            .and_then(Value::as_str)
                            .map(|id| (id.to_string(), n.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut promoted = 0usize;
        for edge in &updates.edges {
            for key in ["source_id", "target_id"] {
                let Some(endpoint) = edge.get(key).and_then(Value::as_str) else { continue };
                if self.causal.has_node(endpoint) || node_ids.contains(endpoint) {
                    continue;
                }
                if let Some(staged_node) = staged.get(endpoint) {
                    nodes.push(staged_node.clone());
                    node_ids.insert(endpoint.to_string());
                    promoted += 1;
                }
            }
        }
        if promoted > 0 {
            tracing::info!(count = promoted, "auto-promoted staged nodes to satisfy edges");
        }

        let edges = updates
            .edges
            .iter()
            .filter(|edge| {
                let source_ok = edge
                    .get("source_id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| self.causal.has_node(id) || node_ids.contains(id));
                let target_ok = edge
                    .get("target_id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| self.causal.has_node(id) || node_ids.contains(id));
                if !(source_ok && target_ok) {
                    tracing::warn!(edge = %serde_json::Value::Object(
                        edge.as_object().cloned().unwrap_or_default()
                    ), "causal edge dropped, endpoint unresolved");
                }
                source_ok && target_ok
            })
            .cloned()
            .collect();

        CausalUpdates { nodes, edges }
    }

    /// Two-phase application of validated causal updates: nodes first
    /// (recording the temp-id to permanent-id mapping), then edges with
    /// endpoints resolved through the mapping and hypothesis confidence
    /// propagated per edge. The whole batch is mirrored atomically.
    pub fn process_causal_graph_commands(
        &mut self,
        updates: &CausalUpdates,
    ) -> HashMap<String, String> {
        let mut id_map = HashMap::new();
        let mut touched_nodes = Vec::new();
        let mut stored_edges = Vec::new();

        for node in &updates.nodes {
            let temp_id = node.get("id").and_then(Value::as_str).map(str::to_string);
            let permanent = self.causal.add_node_from_value(node);
            if let Some(temp) = temp_id {
                id_map.insert(temp, permanent.clone());
            }
            touched_nodes.push(permanent);
        }

        for edge in &updates.edges {
            let source_temp = edge.get("source_id").and_then(Value::as_str).unwrap_or("");
            let target_temp = edge.get("target_id").and_then(Value::as_str).unwrap_or("");
            let source = id_map
                .get(source_temp)
                .cloned()
                .unwrap_or_else(|| source_temp.to_string());
            let target = id_map
                .get(target_temp)
                .cloned()
                .unwrap_or_else(|| target_temp.to_string());
            if source.is_empty() || target.is_empty() {
                continue;
            }
            let raw_label = edge.get("label").and_then(Value::as_str).unwrap_or("SUPPORTS");
            let strength = edge
                .get("evidence_strength")
                .and_then(Value::as_str)
                .map(str::to_string);
            let description = edge
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            match self
                .causal
                .add_edge(&source, &target, raw_label, strength.clone(), description)
            {
                Ok(Some(label)) => {
                    self.causal
                        .propagate_confidence(&target, label, strength.as_deref());
                    touched_nodes.push(target.clone());
                    stored_edges.push(EdgeRow {
                        source,
                        target,
                        relation_type: label.as_str().to_string(),
                        data: Value::Object(Map::new()),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "causal edge rejected");
                }
            }
        }

        let node_rows: Vec<NodeRow> = touched_nodes
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|id| self.causal.node(id))
            .map(|node| NodeRow {
                node_id: node.id.clone(),
                node_type: node.node_type.as_str().to_string(),
                status: Some(node.status.as_str().to_string()),
                data: serde_json::to_value(node).unwrap_or(Value::Null),
            })
            .collect();
        if !node_rows.is_empty() || !stored_edges.is_empty() {
            self.sink
                .atomic_upsert(&self.session_id, "causal", node_rows, stored_edges);
        }
        self.emit_graph_changed(
            "causal_updates_applied",
            json!({"nodes": updates.nodes.len(), "edges": updates.edges.len()}),
        );
        id_map
    }

    // ---- queries --------------------------------------------------------

    /// All ready subtasks: non-terminal, every dependency settled.
    pub fn next_executable_subtasks(&self) -> Vec<String> {
        let mut ready: Vec<&Subtask> = self
            .tasks
            .subtasks()
            .filter(|s| !s.status.is_terminal())
            .filter(|s| {
                matches!(s.status, SubtaskStatus::Pending | SubtaskStatus::InProgress)
            })
            .filter(|s| {
                self.tasks
                    .dependencies_of(&s.id)
                    .iter()
                    .all(|dep| {
                        self.tasks
                            .subtask(dep)
                            .is_some_and(|d| d.status.settles_dependents())
                    })
            })
            .collect();
        ready.sort_by_key(|s| (s.priority, s.id.clone()));
        ready.into_iter().map(|s| s.id.clone()).collect()
    }

    /// Subtasks in failure-flavored terminal states, for the planner's
    /// failed-tasks section.
    pub fn failed_nodes(&self) -> Vec<(String, String, String)> {
        self.tasks
            .subtasks()
            .filter(|s| {
                matches!(
                    s.status,
                    SubtaskStatus::Failed
                        | SubtaskStatus::StalledOrphan
                        | SubtaskStatus::CompletedError
                )
            })
            .map(|s| {
                (
                    s.id.clone(),
                    s.status.as_str().to_string(),
                    s.description.clone(),
                )
            })
            .collect()
    }

    /// Subtasks that depend on any of `deprecated` and are not themselves
    /// in the touched set; these become orphans unless handled.
    pub fn orphan_candidates(
        &self,
        deprecated: &HashSet<String>,
        touched: &HashSet<String>,
    ) -> Vec<(String, Vec<String>)> {
        self.tasks
            .subtasks()
            .filter(|s| !touched.contains(&s.id))
            .filter_map(|s| {
                let lost: Vec<String> = self
                    .tasks
                    .dependencies_of(&s.id)
                    .into_iter()
                    .filter(|dep| deprecated.contains(dep))
                    .collect();
                if lost.is_empty() {
                    None
                } else {
                    Some((s.id.clone(), lost))
                }
            })
            .collect()
    }

    pub fn descendants(&self, id: &str) -> HashSet<String> {
        self.tasks.descendants(id)
    }

    pub fn is_valid_step_parent(&self, parent_id: &str, subtask_id: &str) -> bool {
        self.tasks.is_valid_step_parent(parent_id, subtask_id)
    }

    /// Rendered execution log of a subtask.
    pub fn execution_log(&mut self, subtask_id: &str) -> String {
        let summary = self.tasks.execution_summary(subtask_id);
        if summary.is_empty() {
            "This subtask has no execution steps yet.".to_string()
        } else {
            summary
        }
    }

    pub fn full_graph_summary(&mut self, detail_level: u8) -> String {
        let goal = self.goal.clone();
        self.tasks.full_summary(&goal, detail_level)
    }

    pub fn causal_graph_summary(&self) -> String {
        self.causal.summary()
    }

    pub fn attack_path_summary(&self, top_n: usize) -> String {
        self.causal.attack_path_summary(top_n)
    }

    pub fn attack_paths(&self) -> Vec<AttackPath> {
        self.causal.attack_paths()
    }

    pub fn failure_patterns(&self) -> FailurePatterns {
        self.causal.failure_patterns(DEFAULT_STALL_WINDOW_SECS)
    }

    pub fn relevant_causal_context(&self) -> CausalContext {
        self.causal
            .relevant_context(5, 3, DEFAULT_STALL_WINDOW_SECS)
    }

    /// Full prompt context for one subtask: its own definition, dependency
    /// outcomes, the execution log and the causal picture.
    pub fn build_prompt_context(&mut self, subtask_id: &str) -> Result<PromptContext, GraphError> {
        let subtask = self
            .tasks
            .subtask(subtask_id)
            .cloned()
            .ok_or_else(|| GraphError::NodeNotFound(subtask_id.to_string()))?;

        // Transitive dependency ancestors, nearest first.
        let mut dependencies = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<String> = self.tasks.dependencies_of(subtask_id).into();
        while let Some(dep_id) = queue.pop_front() {
            if !visited.insert(dep_id.clone()) {
                continue;
            }
            for upstream in self.tasks.dependencies_of(&dep_id) {
                queue.push_back(upstream);
            }
            let execution_summary = self.tasks.execution_summary(&dep_id);
            let Some(dep) = self.tasks.subtask(&dep_id) else { continue };
            let key_findings = dep
                .summary
                .as_ref()
                .map(|s| vec![s.clone()])
                .unwrap_or_default();
            let failure_reason = dep.failure_reason.clone().or_else(|| {
                if dep.status == SubtaskStatus::Failed {
                    dep.summary.clone()
                } else {
                    None
                }
            });
            dependencies.push(DependencyContext {
                id: dep.id.clone(),
                status: dep.status.as_str().to_string(),
                description: dep.description.clone(),
                summary: dep.summary.clone(),
                key_findings,
                failure_reason,
                artifacts: dep.artifacts.clone(),
                execution_summary,
            });
        }

        let execution_summary = self.tasks.execution_summary(subtask_id);
        Ok(PromptContext {
            subtask_id: subtask.id,
            description: subtask.description,
            completion_criteria: subtask.completion_criteria,
            key_facts: self.causal.key_facts(),
            causal_context: self.relevant_causal_context(),
            causal_graph_summary: self.causal.summary(),
            dependencies,
            execution_summary,
        })
    }

    // ---- conversation / resumption state -------------------------------

    pub fn conversation_history(&self, subtask_id: &str) -> Result<Vec<ChatMessage>, GraphError> {
        self.tasks.conversation_history(subtask_id)
    }

    pub fn set_conversation_history(
        &mut self,
        subtask_id: &str,
        history: Vec<ChatMessage>,
    ) -> Result<(), GraphError> {
        self.tasks.set_conversation_history(subtask_id, history)?;
        self.mirror_subtask(subtask_id);
        Ok(())
    }

    pub fn last_step_ids(&self, subtask_id: &str) -> Vec<String> {
        self.tasks.last_step_ids(subtask_id)
    }

    pub fn set_last_step_ids(&mut self, subtask_id: &str, ids: Vec<String>) {
        self.tasks.set_last_step_ids(subtask_id, ids);
        self.mirror_subtask(subtask_id);
    }

    pub fn turn_counter(&self, subtask_id: &str) -> u32 {
        self.tasks.turn_counter(subtask_id)
    }

    pub fn set_turn_counter(&mut self, subtask_id: &str, counter: u32) {
        self.tasks.set_turn_counter(subtask_id, counter);
        self.mirror_subtask(subtask_id);
    }

    // ---- success condensation ------------------------------------------

    /// The simplified subgraph behind a confirmed success: the step that
    /// produced a ConfirmedVulnerability (or TargetArtifact) plus all of
    /// its ancestors, reduced to id/type/status/essentials.
    pub fn simplified_success_graph(&self) -> Value {
        let trigger = self.find_success_trigger();
        let Some(trigger) = trigger else {
            return json!({"nodes": [], "edges": []});
        };

        // Ancestors: nodes from which the trigger is reachable.
        let mut members = HashSet::from([trigger.clone()]);
        let mut changed = true;
        while changed {
            changed = false;
            for subtask in self.tasks.subtasks() {
                if !members.contains(&subtask.id)
                    && self
                        .tasks
                        .collect_execution_steps(&subtask.id)
                        .iter()
                        .any(|s| members.contains(s))
                {
                    members.insert(subtask.id.clone());
                    changed = true;
                }
            }
            // Walk step parents.
            let step_parents: Vec<String> = members
                .iter()
                .filter_map(|id| self.tasks.step(id).map(|s| s.parent.clone()))
                .collect();
            for parent in step_parents {
                if members.insert(parent) {
                    changed = true;
                }
            }
        }

        let nodes: Vec<Value> = members
            .iter()
            .filter_map(|id| {
                self.tasks.node(id).map(|node| match node {
                    TaskNode::Subtask(s) => json!({
                        "id": s.id, "type": "subtask",
                        "status": s.status.as_str(), "description": s.description,
                    }),
                    TaskNode::Step(s) => json!({
                        "id": s.id, "type": "execution_step",
                        "status": s.status.as_str(), "tool": s.action.tool,
                        "thought": s.thought,
                    }),
                    TaskNode::Root { goal, status } => json!({
                        "id": id, "type": "task", "status": status, "goal": goal,
                    }),
                    TaskNode::StagedCausal { id, .. } => json!({
                        "id": id, "type": "staged_causal",
                    }),
                })
            })
            .collect();
        json!({"nodes": nodes, "trigger": trigger, "edges": []})
    }

    fn find_success_trigger(&self) -> Option<String> {
        let confirmed = self
            .causal
            .nodes()
            .find(|n| n.node_type == crate::domain::models::CausalNodeType::ConfirmedVulnerability)
            .and_then(|n| n.source_step_id.clone())
            .filter(|id| self.tasks.has_node(id));
        if confirmed.is_some() {
            return confirmed;
        }
        self.causal
            .nodes()
            .find(|n| n.node_type == crate::domain::models::CausalNodeType::TargetArtifact)
            .and_then(|n| n.source_step_id.clone())
            .filter(|id| self.tasks.has_node(id))
    }
}
