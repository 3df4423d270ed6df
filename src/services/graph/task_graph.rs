//! Task decomposition graph.
//!
//! Nodes are the session root, planner-created subtasks, executor-created
//! execution steps, and shadow entries for staged causal nodes. Edges are
//! typed (decomposition, dependency, execution, produces) and the graph is
//! a DAG by construction: every insertion is checked for cycles.
//!
//! Status invariants enforced here:
//! - terminal subtask statuses are irreversible;
//! - completed subtasks can never become deprecated;
//! - illegal status strings are coerced to `pending` with a warning on the
//!   node.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{Map, Value};

use crate::domain::error::GraphError;
use crate::domain::models::{
    ChatMessage, ExecutionStep, StepAction, StepStatus, Subtask, SubtaskStatus,
};
use crate::domain::models::subtask::ExecutionSummaryCache;

/// Edge kinds in the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEdgeType {
    /// Root -> subtask
    Decomposition,
    /// Subtask -> dependent subtask
    Dependency,
    /// Subtask/step -> step
    Execution,
    /// Step -> staged causal shadow node
    Produces,
}

impl TaskEdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decomposition => "decomposition",
            Self::Dependency => "dependency",
            Self::Execution => "execution",
            Self::Produces => "produces",
        }
    }
}

/// A typed directed edge.
#[derive(Debug, Clone)]
pub struct TaskEdge {
    pub source: String,
    pub target: String,
    pub edge_type: TaskEdgeType,
}

/// A node in the task graph.
#[derive(Debug, Clone)]
pub enum TaskNode {
    Root { goal: String, status: String },
    Subtask(Subtask),
    Step(ExecutionStep),
    /// Shadow entry for a causal node an executor proposed but the
    /// reflector has not validated yet.
    StagedCausal { id: String, data: Value },
}

impl TaskNode {
    pub fn type_str(&self) -> &'static str {
        match self {
            Self::Root { .. } => "task",
            Self::Subtask(_) => "subtask",
            Self::Step(_) => "execution_step",
            Self::StagedCausal { .. } => "staged_causal",
        }
    }
}

/// Outcome of a status update attempt, reported for event emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    Applied(SubtaskStatus),
    /// completed -> deprecated rejected; node left completed
    RejectedCompletedToDeprecated,
    /// terminal -> non-terminal ignored
    RejectedTerminalRevival,
    /// unknown status string coerced to pending
    CoercedIllegal(String),
}

/// The task graph with typed edges and a per-session step sequence.
pub struct TaskGraph {
    root_id: String,
    nodes: HashMap<String, TaskNode>,
    edges: Vec<TaskEdge>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
    execution_counter: u64,
}

impl TaskGraph {
    pub fn new(root_id: impl Into<String>, goal: impl Into<String>) -> Self {
        let root_id = root_id.into();
        let mut nodes = HashMap::new();
        nodes.insert(
            root_id.clone(),
            TaskNode::Root { goal: goal.into(), status: "in_progress".to_string() },
        );
        Self {
            root_id,
            nodes,
            edges: Vec::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            execution_counter: 0,
        }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        match self.nodes.get(id) {
            Some(TaskNode::Subtask(s)) => Some(s),
            _ => None,
        }
    }

    pub fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        match self.nodes.get_mut(id) {
            Some(TaskNode::Subtask(s)) => Some(s),
            _ => None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        match self.nodes.get(id) {
            Some(TaskNode::Step(s)) => Some(s),
            _ => None,
        }
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut ExecutionStep> {
        match self.nodes.get_mut(id) {
            Some(TaskNode::Step(s)) => Some(s),
            _ => None,
        }
    }

    /// All subtasks, in insertion-independent order.
    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.nodes.values().filter_map(|node| match node {
            TaskNode::Subtask(s) => Some(s),
            _ => None,
        })
    }

    pub fn current_sequence(&self) -> u64 {
        self.execution_counter
    }

    fn add_edge_internal(
        &mut self,
        source: &str,
        target: &str,
        edge_type: TaskEdgeType,
    ) -> Result<(), GraphError> {
        if self.reaches(target, source) {
            return Err(GraphError::WouldCycle {
                edge_source: source.to_string(),
                target: target.to_string(),
            });
        }
        let index = self.edges.len();
        self.edges.push(TaskEdge {
            source: source.to_string(),
            target: target.to_string(),
            edge_type,
        });
        self.outgoing.entry(source.to_string()).or_default().push(index);
        self.incoming.entry(target.to_string()).or_default().push(index);
        Ok(())
    }

    /// Whether `to` is reachable from `from` along any edge type.
    fn reaches(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([from.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }
            for &index in self.outgoing.get(&current).into_iter().flatten() {
                let target = &self.edges[index].target;
                if target == to {
                    return true;
                }
                queue.push_back(target.clone());
            }
        }
        false
    }

    /// Add a subtask. Idempotent: an existing node has its mutable
    /// attributes refreshed instead. With no dependencies the node is
    /// parented to the root via a decomposition edge.
    pub fn add_subtask(&mut self, mut subtask: Subtask, dependencies: &[String]) {
        let id = subtask.id.clone();
        if let Some(existing) = self.subtask_mut(&id) {
            existing.description = std::mem::take(&mut subtask.description);
            existing.priority = subtask.priority;
            existing.reason = std::mem::take(&mut subtask.reason);
            existing.completion_criteria = std::mem::take(&mut subtask.completion_criteria);
            if subtask.mission_briefing.is_some() {
                existing.mission_briefing = subtask.mission_briefing.take();
            }
            existing.updated_at = chrono::Utc::now();
            tracing::debug!(subtask_id = %id, "add_subtask on existing node, attributes refreshed");
            return;
        }

        self.nodes.insert(id.clone(), TaskNode::Subtask(subtask));

        if dependencies.is_empty() {
            let root = self.root_id.clone();
            let _ = self.add_edge_internal(&root, &id, TaskEdgeType::Decomposition);
        }
        for dep in dependencies {
            if self.has_node(dep) {
                if let Err(e) = self.add_edge_internal(dep, &id, TaskEdgeType::Dependency) {
                    tracing::warn!(error = %e, "dependency edge skipped");
                }
            } else {
                tracing::warn!(subtask_id = %id, dependency = %dep, "dependency does not exist, edge skipped");
            }
        }
    }

    /// Add an execution step under `parent`, assigning the next sequence
    /// number. The parent must already exist.
    pub fn add_execution_step(
        &mut self,
        mut step: ExecutionStep,
    ) -> Result<u64, GraphError> {
        let parent = step.parent.clone();
        if !self.has_node(&parent) {
            return Err(GraphError::ParentNotFound(parent));
        }
        self.execution_counter += 1;
        step.sequence = self.execution_counter;
        let id = step.id.clone();
        let sequence = step.sequence;
        self.nodes.insert(id.clone(), TaskNode::Step(step));
        self.add_edge_internal(&parent, &id, TaskEdgeType::Execution)?;
        if let Some(owner) = self.owning_subtask(&id) {
            self.invalidate_execution_cache(&owner);
        }
        Ok(sequence)
    }

    /// Apply a loose update map to a subtask, enforcing status invariants.
    /// Returns the status change verdict when a status key was present.
    pub fn update_subtask_fields(
        &mut self,
        id: &str,
        updates: &Map<String, Value>,
    ) -> Option<StatusChange> {
        let mut change = None;
        if let Some(status_value) = updates.get("status").and_then(Value::as_str) {
            change = Some(self.apply_status(id, status_value));
        }

        let Some(subtask) = self.subtask_mut(id) else {
            tracing::warn!(node_id = %id, "update on missing subtask ignored");
            return change;
        };
        for (key, value) in updates {
            match key.as_str() {
                "status" => {}
                "description" => {
                    if let Some(s) = value.as_str() {
                        subtask.description = s.to_string();
                    }
                }
                "priority" => {
                    if let Some(p) = value.as_i64() {
                        subtask.priority = p;
                    }
                }
                "reason" => {
                    if let Some(s) = value.as_str() {
                        subtask.reason = s.to_string();
                    }
                }
                "completion_criteria" => {
                    if let Some(s) = value.as_str() {
                        subtask.completion_criteria = s.to_string();
                    }
                }
                "summary" => {
                    subtask.summary = value.as_str().map(str::to_string);
                }
                "failure_reason" => {
                    subtask.failure_reason = value.as_str().map(str::to_string);
                }
                "termination_reason" => {
                    subtask.termination_reason = value.as_str().map(str::to_string);
                }
                "mission_briefing" => {
                    subtask.mission_briefing = Some(value.clone());
                }
                "reflection" => {
                    subtask.reflection = Some(value.clone());
                }
                "artifacts" => {
                    if let Some(items) = value.as_array() {
                        subtask.artifacts = items.clone();
                    }
                }
                "disable_artifact_check" => {
                    if let Some(b) = value.as_bool() {
                        subtask.disable_artifact_check = b;
                    }
                }
                other => {
                    tracing::trace!(node_id = %id, key = other, "unknown subtask update key ignored");
                }
            }
        }
        subtask.updated_at = chrono::Utc::now();
        change
    }

    fn apply_status(&mut self, id: &str, requested: &str) -> StatusChange {
        let Some(subtask) = self.subtask_mut(id) else {
            return StatusChange::CoercedIllegal(requested.to_string());
        };
        let current = subtask.status;

        let Some(new_status) = SubtaskStatus::from_str(requested) else {
            subtask.push_warning(format!(
                "illegal status '{requested}' coerced to 'pending'"
            ));
            if !current.is_terminal() {
                subtask.status = SubtaskStatus::Pending;
            }
            return StatusChange::CoercedIllegal(requested.to_string());
        };

        if current == SubtaskStatus::Completed && new_status == SubtaskStatus::Deprecated {
            subtask.push_warning(
                "attempt to deprecate a completed subtask rejected; reflector verdicts are final",
            );
            return StatusChange::RejectedCompletedToDeprecated;
        }
        if current.is_terminal() && !new_status.is_terminal() {
            subtask.push_warning(format!(
                "attempt to revive terminal status '{}' as '{}' ignored",
                current.as_str(),
                new_status.as_str()
            ));
            return StatusChange::RejectedTerminalRevival;
        }

        subtask.status = new_status;
        if new_status.is_terminal() {
            subtask.completed_at = Some(chrono::Utc::now());
        }
        StatusChange::Applied(new_status)
    }

    /// Set a step's status directly (tool layer and halt handling).
    pub fn set_step_status(&mut self, id: &str, status: StepStatus) {
        let owner = self.owning_subtask(id);
        let mut updated = false;
        if let Some(step) = self.step_mut(id) {
            step.status = status;
            step.updated_at = chrono::Utc::now();
            updated = true;
        }
        if updated {
            if let Some(owner) = owner {
                self.invalidate_execution_cache(&owner);
            }
        }
    }

    /// Record a step observation with truncation metadata.
    pub fn set_step_observation(
        &mut self,
        id: &str,
        observation: String,
        truncated: bool,
        original_length: usize,
        status: StepStatus,
    ) {
        let owner = self.owning_subtask(id);
        if let Some(step) = self.step_mut(id) {
            step.observation = Some(observation);
            step.observation_truncated = truncated;
            step.original_length = original_length;
            step.status = status;
            step.updated_at = chrono::Utc::now();
        }
        if let Some(owner) = owner {
            self.invalidate_execution_cache(&owner);
        }
    }

    /// Dependencies (via dependency edges) of a subtask.
    pub fn dependencies_of(&self, id: &str) -> Vec<String> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .filter(|&&index| self.edges[index].edge_type == TaskEdgeType::Dependency)
            .map(|&index| self.edges[index].source.clone())
            .collect()
    }

    /// Subtasks that depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter(|&&index| self.edges[index].edge_type == TaskEdgeType::Dependency)
            .map(|&index| self.edges[index].target.clone())
            .collect()
    }

    /// All descendants of a node along any edge type.
    pub fn descendants(&self, id: &str) -> HashSet<String> {
        let mut result = HashSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for &index in self.outgoing.get(&current).into_iter().flatten() {
                let target = self.edges[index].target.clone();
                if result.insert(target.clone()) {
                    queue.push_back(target);
                }
            }
        }
        result
    }

    /// Execution steps under a subtask, ordered by sequence.
    pub fn collect_execution_steps(&self, subtask_id: &str) -> Vec<String> {
        let mut collected = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([subtask_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for &index in self.outgoing.get(&current).into_iter().flatten() {
                if self.edges[index].edge_type != TaskEdgeType::Execution {
                    continue;
                }
                let target = self.edges[index].target.clone();
                if visited.insert(target.clone()) {
                    collected.push(target.clone());
                    queue.push_back(target);
                }
            }
        }
        collected.sort_by_key(|id| self.step(id).map_or(0, |s| s.sequence));
        collected
    }

    /// Whether `parent_id` is a valid step parent inside `subtask_id`'s
    /// execution chain (the subtask itself or one of its steps).
    pub fn is_valid_step_parent(&self, parent_id: &str, subtask_id: &str) -> bool {
        if parent_id == subtask_id {
            return self.has_node(parent_id);
        }
        self.collect_execution_steps(subtask_id)
            .iter()
            .any(|id| id == parent_id)
    }

    /// The subtask a step (transitively) belongs to.
    pub fn owning_subtask(&self, step_id: &str) -> Option<String> {
        let mut current = step_id.to_string();
        loop {
            match self.nodes.get(&current) {
                Some(TaskNode::Step(step)) => current = step.parent.clone(),
                Some(TaskNode::Subtask(subtask)) => return Some(subtask.id.clone()),
                _ => return None,
            }
        }
    }

    fn invalidate_execution_cache(&mut self, subtask_id: &str) {
        if let Some(subtask) = self.subtask_mut(subtask_id) {
            subtask.execution_summary_cache = None;
        }
    }

    /// Rendered execution log of a subtask, cached until a newer step
    /// sequence appears.
    pub fn execution_summary(&mut self, subtask_id: &str) -> String {
        let step_ids = self.collect_execution_steps(subtask_id);
        if step_ids.is_empty() {
            self.invalidate_execution_cache(subtask_id);
            return String::new();
        }
        let latest_sequence = step_ids
            .iter()
            .filter_map(|id| self.step(id).map(|s| s.sequence))
            .max()
            .unwrap_or(0);

        if let Some(subtask) = self.subtask(subtask_id) {
            if let Some(cache) = &subtask.execution_summary_cache {
                if cache.last_sequence == latest_sequence {
                    return cache.summary.clone();
                }
            }
        }

        let mut sections = Vec::new();
        for (index, step_id) in step_ids.iter().enumerate() {
            let Some(step) = self.step(step_id) else { continue };
            let observation = step
                .observation
                .clone()
                .or_else(|| {
                    step.hypothesis_update
                        .as_ref()
                        .and_then(|h| h.get("observation_summary"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "(no observation)".to_string());
            sections.push(format!(
                "### Step {} (ID: {})\n- status: {}\n- thought: {}\n- action: {}\n- observation: {}",
                index + 1,
                step.id,
                step.status.as_str(),
                step.thought,
                serde_json::to_string(&step.action).unwrap_or_default(),
                observation,
            ));
        }
        let summary = sections.join("\n");
        if let Some(subtask) = self.subtask_mut(subtask_id) {
            subtask.execution_summary_cache = Some(ExecutionSummaryCache {
                summary: summary.clone(),
                last_sequence: latest_sequence,
                updated_at: chrono::Utc::now(),
            });
        }
        summary
    }

    // ---- conversation history / resumption state ----------------------

    pub fn conversation_history(&self, subtask_id: &str) -> Result<Vec<ChatMessage>, GraphError> {
        self.subtask(subtask_id)
            .map(|s| s.conversation_history.clone())
            .ok_or_else(|| GraphError::NodeNotFound(subtask_id.to_string()))
    }

    pub fn set_conversation_history(
        &mut self,
        subtask_id: &str,
        history: Vec<ChatMessage>,
    ) -> Result<(), GraphError> {
        let subtask = self
            .subtask_mut(subtask_id)
            .ok_or_else(|| GraphError::NodeNotFound(subtask_id.to_string()))?;
        subtask.conversation_history = history;
        Ok(())
    }

    pub fn last_step_ids(&self, subtask_id: &str) -> Vec<String> {
        self.subtask(subtask_id)
            .map(|s| s.last_step_ids.clone())
            .unwrap_or_default()
    }

    pub fn set_last_step_ids(&mut self, subtask_id: &str, step_ids: Vec<String>) {
        if let Some(subtask) = self.subtask_mut(subtask_id) {
            subtask.last_step_ids = step_ids;
        }
    }

    pub fn turn_counter(&self, subtask_id: &str) -> u32 {
        self.subtask(subtask_id).map_or(0, |s| s.turn_counter)
    }

    pub fn set_turn_counter(&mut self, subtask_id: &str, counter: u32) {
        if let Some(subtask) = self.subtask_mut(subtask_id) {
            subtask.turn_counter = counter;
        }
    }

    // ---- staged causal shadow nodes -----------------------------------

    /// Stage proposed causal nodes on a subtask and mirror them as shadow
    /// graph nodes with a `produces` edge from their source step.
    pub fn stage_causal_nodes(
        &mut self,
        subtask_id: &str,
        proposals: Vec<Value>,
    ) -> Result<(), GraphError> {
        if !self.has_node(subtask_id) {
            return Err(GraphError::NodeNotFound(subtask_id.to_string()));
        }
        for proposal in &proposals {
            let Some(node_id) = proposal.get("id").and_then(Value::as_str) else {
                continue;
            };
            if self.has_node(node_id) {
                continue;
            }
            self.nodes.insert(
                node_id.to_string(),
                TaskNode::StagedCausal { id: node_id.to_string(), data: proposal.clone() },
            );
            if let Some(source_step) = proposal.get("source_step_id").and_then(Value::as_str) {
                if self.has_node(source_step) {
                    if let Err(e) =
                        self.add_edge_internal(source_step, node_id, TaskEdgeType::Produces)
                    {
                        tracing::warn!(error = %e, "produces edge skipped");
                    }
                }
            }
        }
        if let Some(subtask) = self.subtask_mut(subtask_id) {
            subtask.staged_causal_nodes.extend(proposals);
        }
        Ok(())
    }

    /// Remove all staged shadow nodes and clear the subtask's side list.
    pub fn clear_staged_causal_nodes(&mut self, subtask_id: &str) -> Vec<String> {
        let staged: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|(id, node)| match node {
                TaskNode::StagedCausal { .. } => Some(id.clone()),
                _ => None,
            })
            .collect();
        for id in &staged {
            self.remove_node(id);
        }
        if let Some(subtask) = self.subtask_mut(subtask_id) {
            subtask.staged_causal_nodes.clear();
        }
        staged
    }

    fn remove_node(&mut self, id: &str) {
        self.nodes.remove(id);
        // Rebuild edge indexes without the removed node's edges.
        let edges = std::mem::take(&mut self.edges);
        self.outgoing.clear();
        self.incoming.clear();
        for edge in edges {
            if edge.source == id || edge.target == id {
                continue;
            }
            let index = self.edges.len();
            self.outgoing.entry(edge.source.clone()).or_default().push(index);
            self.incoming.entry(edge.target.clone()).or_default().push(index);
            self.edges.push(edge);
        }
    }

    // ---- rendering -----------------------------------------------------

    /// Human-readable summary of the task graph.
    pub fn full_summary(&mut self, root_goal: &str, detail_level: u8) -> String {
        let mut lines = vec![format!("## Task graph: {}", root_goal)];
        let mut subtask_ids: Vec<String> = self.subtasks().map(|s| s.id.clone()).collect();
        subtask_ids.sort();
        for id in subtask_ids {
            let Some(subtask) = self.subtask(&id) else { continue };
            lines.push(format!(
                "\n- [subtask] {}: {} (status: {}, priority: {})",
                subtask.id,
                subtask.description,
                subtask.status.as_str(),
                subtask.priority
            ));
            let deps = self.dependencies_of(&id);
            if !deps.is_empty() {
                lines.push(format!("  - depends on: {}", deps.join(", ")));
            }
            if let Some(summary) = self.subtask(&id).and_then(|s| s.summary.clone()) {
                lines.push(format!("  - reflection: {summary}"));
            }
            if detail_level >= 2 {
                for step_id in self.collect_execution_steps(&id) {
                    if let Some(step) = self.step(&step_id) {
                        lines.push(format!(
                            "    - [step] {} (status: {}) -> {}",
                            step.id,
                            step.status.as_str(),
                            step.action.tool
                        ));
                    }
                }
            }
        }
        lines.join("\n")
    }

    /// Make a dispatch-ready execution step.
    pub fn make_step(
        id: impl Into<String>,
        parent: impl Into<String>,
        thought: impl Into<String>,
        action: StepAction,
        hypothesis_update: Option<Value>,
    ) -> ExecutionStep {
        let mut step = ExecutionStep::new(id, parent, thought, action);
        step.status = StepStatus::InProgress;
        step.hypothesis_update = hypothesis_update;
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_subtask(id: &str) -> TaskGraph {
        let mut graph = TaskGraph::new("root", "test goal");
        graph.add_subtask(Subtask::new(id, "do something"), &[]);
        graph
    }

    #[test]
    fn test_root_decomposition_edge_when_no_dependencies() {
        let graph = graph_with_subtask("subtask_1");
        assert!(graph.has_node("subtask_1"));
        assert!(graph.dependencies_of("subtask_1").is_empty());
        // decomposition edge from root exists
        assert!(graph
            .edges
            .iter()
            .any(|e| e.source == "root"
                && e.target == "subtask_1"
                && e.edge_type == TaskEdgeType::Decomposition));
    }

    #[test]
    fn test_add_subtask_idempotent_refresh() {
        let mut graph = graph_with_subtask("subtask_1");
        graph.add_subtask(
            Subtask::new("subtask_1", "updated description").with_priority(7),
            &[],
        );
        let subtask = graph.subtask("subtask_1").unwrap();
        assert_eq!(subtask.description, "updated description");
        assert_eq!(subtask.priority, 7);
        // No duplicate decomposition edge
        let edge_count = graph
            .edges
            .iter()
            .filter(|e| e.target == "subtask_1")
            .count();
        assert_eq!(edge_count, 1);
    }

    #[test]
    fn test_sequence_monotonic() {
        let mut graph = graph_with_subtask("subtask_1");
        let s1 = graph
            .add_execution_step(ExecutionStep::new("s1", "subtask_1", "t", StepAction::default()))
            .unwrap();
        let s2 = graph
            .add_execution_step(ExecutionStep::new("s2", "s1", "t", StepAction::default()))
            .unwrap();
        let s3 = graph
            .add_execution_step(ExecutionStep::new("s3", "s2", "t", StepAction::default()))
            .unwrap();
        assert!(s1 < s2 && s2 < s3);
    }

    #[test]
    fn test_step_requires_parent() {
        let mut graph = TaskGraph::new("root", "g");
        let err = graph
            .add_execution_step(ExecutionStep::new("s1", "ghost", "t", StepAction::default()))
            .unwrap_err();
        assert_eq!(err, GraphError::ParentNotFound("ghost".to_string()));
    }

    #[test]
    fn test_terminal_revival_ignored() {
        let mut graph = graph_with_subtask("subtask_1");
        let mut updates = Map::new();
        updates.insert("status".into(), Value::String("failed".into()));
        graph.update_subtask_fields("subtask_1", &updates);

        let mut revive = Map::new();
        revive.insert("status".into(), Value::String("pending".into()));
        let change = graph.update_subtask_fields("subtask_1", &revive);
        assert_eq!(change, Some(StatusChange::RejectedTerminalRevival));
        let subtask = graph.subtask("subtask_1").unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Failed);
        assert!(!subtask.warnings.is_empty());
    }

    #[test]
    fn test_completed_to_deprecated_rejected() {
        let mut graph = graph_with_subtask("subtask_1");
        let mut updates = Map::new();
        updates.insert("status".into(), Value::String("completed".into()));
        graph.update_subtask_fields("subtask_1", &updates);

        let mut deprecate = Map::new();
        deprecate.insert("status".into(), Value::String("deprecated".into()));
        let change = graph.update_subtask_fields("subtask_1", &deprecate);
        assert_eq!(change, Some(StatusChange::RejectedCompletedToDeprecated));
        let subtask = graph.subtask("subtask_1").unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Completed);
        assert_eq!(subtask.warnings.len(), 1);
    }

    #[test]
    fn test_illegal_status_coerced_to_pending() {
        let mut graph = graph_with_subtask("subtask_1");
        let mut updates = Map::new();
        updates.insert("status".into(), Value::String("exploded".into()));
        let change = graph.update_subtask_fields("subtask_1", &updates);
        assert_eq!(change, Some(StatusChange::CoercedIllegal("exploded".into())));
        let subtask = graph.subtask("subtask_1").unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Pending);
        assert!(subtask.warnings[0].contains("exploded"));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = TaskGraph::new("root", "g");
        graph.add_subtask(Subtask::new("a", "a"), &[]);
        graph.add_subtask(Subtask::new("b", "b"), &["a".to_string()]);
        // b -> a would close a cycle
        let err = graph.add_edge_internal("b", "a", TaskEdgeType::Dependency);
        assert!(matches!(err, Err(GraphError::WouldCycle { .. })));
    }

    #[test]
    fn test_execution_summary_cache_invalidation() {
        let mut graph = graph_with_subtask("subtask_1");
        graph
            .add_execution_step(TaskGraph::make_step(
                "s1",
                "subtask_1",
                "first probe",
                StepAction { tool: "nmap".into(), params: Value::Null },
                None,
            ))
            .unwrap();
        let summary_1 = graph.execution_summary("subtask_1");
        assert!(summary_1.contains("first probe"));
        // Cached result is reused
        let summary_2 = graph.execution_summary("subtask_1");
        assert_eq!(summary_1, summary_2);

        graph
            .add_execution_step(TaskGraph::make_step(
                "s2",
                "s1",
                "second probe",
                StepAction { tool: "curl".into(), params: Value::Null },
                None,
            ))
            .unwrap();
        let summary_3 = graph.execution_summary("subtask_1");
        assert!(summary_3.contains("second probe"));
    }

    #[test]
    fn test_staged_nodes_and_clear() {
        let mut graph = graph_with_subtask("subtask_1");
        graph
            .add_execution_step(TaskGraph::make_step(
                "s1",
                "subtask_1",
                "t",
                StepAction::default(),
                None,
            ))
            .unwrap();
        graph
            .stage_causal_nodes(
                "subtask_1",
                vec![serde_json::json!({"id": "hypo_1", "node_type": "Hypothesis", "source_step_id": "s1"})],
            )
            .unwrap();
        assert!(graph.has_node("hypo_1"));
        assert_eq!(graph.subtask("subtask_1").unwrap().staged_causal_nodes.len(), 1);

        let removed = graph.clear_staged_causal_nodes("subtask_1");
        assert_eq!(removed, vec!["hypo_1".to_string()]);
        assert!(!graph.has_node("hypo_1"));
        assert!(graph.subtask("subtask_1").unwrap().staged_causal_nodes.is_empty());
    }

    #[test]
    fn test_full_summary_detail_levels() {
        let mut graph = graph_with_subtask("subtask_1");
        graph
            .add_execution_step(TaskGraph::make_step(
                "s1",
                "subtask_1",
                "probe",
                StepAction { tool: "nmap".into(), params: Value::Null },
                None,
            ))
            .unwrap();

        let shallow = graph.full_summary("the goal", 1);
        assert!(shallow.contains("subtask_1"));
        assert!(!shallow.contains("nmap"), "steps hidden at detail level 1");

        let deep = graph.full_summary("the goal", 2);
        assert!(deep.contains("nmap"), "steps shown at detail level 2");
    }

    #[test]
    fn test_owning_subtask_walks_chain() {
        let mut graph = graph_with_subtask("subtask_1");
        graph
            .add_execution_step(ExecutionStep::new("s1", "subtask_1", "t", StepAction::default()))
            .unwrap();
        graph
            .add_execution_step(ExecutionStep::new("s2", "s1", "t", StepAction::default()))
            .unwrap();
        assert_eq!(graph.owning_subtask("s2").as_deref(), Some("subtask_1"));
    }
}
