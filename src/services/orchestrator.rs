//! P-E-R orchestrator: the outer control loop.
//!
//! Drives initial planning, parallel executor batches, per-subtask
//! reflection, intelligence aggregation and dynamic replanning until a
//! completion signal is observed or the graph runs dry. Planner batches
//! pass through orphan verification before application; human approval
//! gates both the initial and every dynamic batch when enabled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::domain::models::{
    AuditResult, AuditStatus, Config, CycleMetrics, ExecutorOutcome, GraphOp,
    IntelligenceSummary, Reflection, Subtask,
};
use crate::domain::ports::{LlmTransport, ToolDispatch};
use crate::services::broker::EventBroker;
use crate::services::executor::Executor;
use crate::services::graph::GraphManager;
use crate::services::halt::HaltLatch;
use crate::services::intervention::{
    ApprovalAction, InterventionManager, DEFAULT_APPROVAL_TIMEOUT,
};
use crate::services::metrics::{RunLog, SessionMetrics};
use crate::services::planner::Planner;
use crate::services::reflector::Reflector;

/// Terminal account of one session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub success: bool,
    pub reason: String,
}

/// Merge all reflections of one cycle into the planner's intelligence
/// aggregate. A single GOAL_ACHIEVED reflection dominates the aggregate
/// status and contributes its completion check.
pub fn aggregate_intelligence(
    completed_reflections: &HashMap<String, Reflection>,
) -> IntelligenceSummary {
    let mut findings = Vec::new();
    let mut artifacts = Vec::new();
    let mut insights = Vec::new();
    let mut goal_achieved = false;
    let mut completion_check = format!(
        "Aggregated audit results of {} subtask(s)",
        completed_reflections.len()
    );

    for (subtask_id, reflection) in completed_reflections {
        if reflection.audit_result.status == AuditStatus::GoalAchieved {
            tracing::info!(subtask_id = %subtask_id, "reflection reported GOAL_ACHIEVED");
            goal_achieved = true;
            completion_check = reflection.audit_result.completion_check.clone();
        }
        findings.extend(reflection.key_findings.iter().cloned());
        artifacts.extend(reflection.validated_nodes.iter().cloned());
        if let Some(insight) = &reflection.insight {
            insights.push(insight.clone());
        }
    }

    IntelligenceSummary {
        findings,
        audit_result: AuditResult {
            status: if goal_achieved {
                AuditStatus::GoalAchieved
            } else {
                AuditStatus::Aggregated
            },
            completion_check,
            methodology_issues: Vec::new(),
            logic_issues: Vec::new(),
            is_strategic_failure: false,
        },
        artifacts,
        insights,
    }
}

/// Append repair operations for every subtask the batch would orphan:
/// a subtask whose dependency is being deprecated, and which the batch
/// does not itself touch, is transitioned to `stalled_orphan`.
pub fn verify_and_handle_orphans(
    graph: &GraphManager,
    operations: Vec<GraphOp>,
) -> Vec<GraphOp> {
    let deprecated: HashSet<String> = operations
        .iter()
        .filter(|op| op.deprecates())
        .filter_map(|op| op.node_id().map(str::to_string))
        .collect();
    if deprecated.is_empty() {
        return operations;
    }

    let touched: HashSet<String> = operations
        .iter()
        .filter(|op| {
            matches!(
                op,
                GraphOp::UpdateNode { .. } | GraphOp::DeleteNode { .. } | GraphOp::DeprecateNode { .. }
            )
        })
        .filter_map(|op| op.node_id().map(str::to_string))
        .collect();

    let mut repaired = operations;
    for (orphan_id, lost_dependencies) in graph.orphan_candidates(&deprecated, &touched) {
        tracing::warn!(
            orphan = %orphan_id,
            lost = ?lost_dependencies,
            "planner left an orphan, forcing stalled_orphan"
        );
        let mut updates = Map::new();
        updates.insert("status".into(), Value::String("stalled_orphan".into()));
        updates.insert(
            "summary".into(),
            Value::String(format!(
                "Dependency on {lost_dependencies:?} was removed by the planner without a \
                 replacement."
            )),
        );
        repaired.push(GraphOp::UpdateNode { node_id: orphan_id, updates });
    }
    repaired
}

/// Apply a sanitized operation batch in a stable order: adds first, then
/// deprecations/deletions, then updates (skipping nodes deprecated by the
/// same batch). Status invariants are enforced inside the graph manager.
pub fn process_graph_commands(graph: &mut GraphManager, operations: &[GraphOp]) {
    let mut seen_add_ids = HashSet::new();
    for op in operations {
        if let GraphOp::AddNode(data) = op {
            if !seen_add_ids.insert(data.id.clone()) {
                tracing::warn!(node_id = %data.id, "duplicate ADD_NODE dropped");
                continue;
            }
            let mut subtask = Subtask::new(&data.id, &data.description)
                .with_priority(data.priority)
                .with_reason(&data.reason)
                .with_completion_criteria(&data.completion_criteria);
            subtask.mission_briefing = data.mission_briefing.clone();
            graph.add_subtask(subtask, &data.dependencies);
            if let Some(status) = &data.status {
                let mut updates = Map::new();
                updates.insert("status".into(), Value::String(status.clone()));
                graph.update_node(&data.id, &updates);
            }
        }
    }

    let mut deprecated_ids = HashSet::new();
    for op in operations {
        match op {
            GraphOp::DeleteNode { node_id, reason }
            | GraphOp::DeprecateNode { node_id, reason } => {
                let mut updates = Map::new();
                updates.insert("status".into(), Value::String("deprecated".into()));
                updates.insert(
                    "summary".into(),
                    Value::String(format!("Retired by the planner. Reason: {reason}")),
                );
                graph.update_node(node_id, &updates);
                deprecated_ids.insert(node_id.clone());
            }
            _ => {}
        }
    }

    for op in operations {
        match op {
            GraphOp::UpdateNode { node_id, updates } => {
                if deprecated_ids.contains(node_id) {
                    tracing::warn!(node_id = %node_id, "update on freshly deprecated node skipped");
                    continue;
                }
                if !graph.has_node(node_id) {
                    tracing::warn!(node_id = %node_id, "update on unknown node skipped");
                    continue;
                }
                graph.update_node(node_id, updates);
            }
            GraphOp::Unknown(value) => {
                tracing::error!(op = %value, "unknown graph command ignored");
            }
            _ => {}
        }
    }
}

/// The outer-loop driver for one session.
pub struct Orchestrator {
    config: Config,
    session_id: String,
    goal: String,
    graph: Arc<Mutex<GraphManager>>,
    planner: Planner,
    reflector: Reflector,
    llm: Arc<dyn LlmTransport>,
    tools: Arc<dyn ToolDispatch>,
    intervention: Arc<InterventionManager>,
    broker: Arc<EventBroker>,
    halt: HaltLatch,
    pub metrics: SessionMetrics,
    pub run_log: RunLog,
    global_mission_briefing: String,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        session_id: &str,
        goal: &str,
        graph: Arc<Mutex<GraphManager>>,
        llm: Arc<dyn LlmTransport>,
        tools: Arc<dyn ToolDispatch>,
        intervention: Arc<InterventionManager>,
        broker: Arc<EventBroker>,
        halt: HaltLatch,
    ) -> Self {
        let planner = Planner::new(Arc::clone(&llm), Arc::clone(&broker), session_id)
            .with_history_window(config.planner.history_window);
        let reflector = Reflector::new(Arc::clone(&llm), Arc::clone(&broker), session_id)
            .with_history_window(config.reflector.history_window);
        Self {
            config,
            session_id: session_id.to_string(),
            goal: goal.to_string(),
            graph,
            planner,
            reflector,
            llm,
            tools,
            intervention,
            broker,
            halt,
            metrics: SessionMetrics::new(session_id, goal),
            run_log: RunLog::new(),
            global_mission_briefing: format!("The initial mission goal is: {goal}"),
        }
    }

    /// The briefing handed to executors; scenario mode, when configured,
    /// tunes the prompt variant.
    fn briefing_for_executors(&self) -> String {
        match &self.config.scenario_mode {
            Some(mode) => format!("{} (scenario mode: {mode})", self.global_mission_briefing),
            None => self.global_mission_briefing.clone(),
        }
    }

    fn ops_payload(ops: &[GraphOp]) -> Value {
        Value::Array(ops.iter().map(GraphOp::to_value).collect())
    }

    fn ops_from_payload(payload: &Value) -> Vec<GraphOp> {
        payload
            .as_array()
            .map(|items| items.iter().filter_map(GraphOp::from_value).collect())
            .unwrap_or_default()
    }

    /// Gate an operation batch behind human approval. Returns None on
    /// rejection; MODIFY replaces the batch with the approver's payload.
    /// A terminal approval arm races the web approver; the first decision
    /// wins and the losing arm is cancelled.
    async fn approve_ops(&self, ops: Vec<GraphOp>, kind: &str) -> Option<Vec<GraphOp>> {
        if !self.config.human_in_the_loop {
            return Some(ops);
        }
        let cli_arm = if console::user_attended() {
            Some(tokio::spawn(crate::services::approval_cli::cli_approval_arm(
                Arc::clone(&self.intervention),
                self.session_id.clone(),
            )))
        } else {
            None
        };
        let decision = self
            .intervention
            .request_approval(
                &self.session_id,
                Self::ops_payload(&ops),
                kind,
                DEFAULT_APPROVAL_TIMEOUT,
            )
            .await;
        if let Some(arm) = cli_arm {
            if !arm.is_finished() {
                arm.abort();
            }
        }
        match decision.action {
            ApprovalAction::Approve => Some(ops),
            ApprovalAction::Modify => {
                let replaced = decision
                    .data
                    .as_ref()
                    .map(Self::ops_from_payload)
                    .unwrap_or_default();
                tracing::info!(count = replaced.len(), "approver modified the plan");
                Some(replaced)
            }
            ApprovalAction::Reject => {
                tracing::warn!(kind, "plan rejected by approver");
                None
            }
        }
    }

    async fn apply_ops(&self, ops: Vec<GraphOp>) {
        let mut graph = self.graph.lock().await;
        let verified = verify_and_handle_orphans(&graph, ops);
        process_graph_commands(&mut graph, &verified);
        drop(graph);
        self.broker.emit(
            "graph.changed",
            json!({"reason": "plan_applied"}),
            Some(&self.session_id),
        );
    }

    /// Run the session to completion.
    pub async fn run(&mut self) -> SessionOutcome {
        self.broker
            .emit("session.started", json!({"goal": self.goal}), Some(&self.session_id));
        self.run_log
            .push("task_initialized", json!({"goal": self.goal}));

        // ---- initial plan ------------------------------------------------
        let causal_summary = self.graph.lock().await.causal_graph_summary();
        let (initial_ops, plan_metrics) = self.planner.plan(&self.goal, &causal_summary).await;
        if let Some(call) = plan_metrics {
            self.metrics.absorb_call(&call);
        }
        self.metrics.plan_steps += 1;
        self.run_log
            .push("initial_plan", Self::ops_payload(&initial_ops));

        let Some(approved) = self.approve_ops(initial_ops, "plan_approval").await else {
            self.metrics.mark_finished(false, "initial plan rejected");
            return SessionOutcome {
                success: false,
                reason: "initial plan rejected by approver".to_string(),
            };
        };
        self.apply_ops(approved).await;

        // ---- P-E-R loop --------------------------------------------------
        let mut completed_reflections: HashMap<String, Reflection> = HashMap::new();
        let outcome = loop {
            if self.halt.is_set() {
                break SessionOutcome {
                    success: true,
                    reason: "halt latch observed".to_string(),
                };
            }

            if !completed_reflections.is_empty() {
                let aggregated = aggregate_intelligence(&completed_reflections);
                let aggregated_goal_achieved =
                    aggregated.audit_result.status == AuditStatus::GoalAchieved;

                let (graph_summary, causal_summary, attack_paths, failure_patterns, failed) = {
                    let mut graph = self.graph.lock().await;
                    (
                        graph.full_graph_summary(1),
                        graph.causal_graph_summary(),
                        graph.attack_path_summary(3),
                        graph.failure_patterns(),
                        graph.failed_nodes(),
                    )
                };
                let (plan, call) = self
                    .planner
                    .dynamic_plan(
                        &self.goal,
                        &graph_summary,
                        &aggregated,
                        &causal_summary,
                        &attack_paths,
                        &failure_patterns,
                        &failed,
                    )
                    .await;
                if let Some(call) = call {
                    self.metrics.absorb_call(&call);
                }
                self.metrics.plan_steps += 1;

                if let Some(plan) = plan {
                    self.run_log
                        .push("dynamic_plan", Self::ops_payload(&plan.graph_operations));
                    if let Some(briefing) = &plan.global_mission_briefing {
                        self.global_mission_briefing = briefing.clone();
                    }

                    if plan.global_mission_accomplished {
                        // Planner-declared completion: apply any final
                        // operations, then stop.
                        if !plan.graph_operations.is_empty() {
                            self.apply_ops(plan.graph_operations).await;
                        }
                        break SessionOutcome {
                            success: true,
                            reason: "global mission accomplished signal received from planner"
                                .to_string(),
                        };
                    }

                    if !plan.graph_operations.is_empty() {
                        match self.approve_ops(plan.graph_operations, "plan_approval").await {
                            Some(ops) => self.apply_ops(ops).await,
                            None => {
                                tracing::warn!(
                                    "dynamic plan rejected; continuing without updates"
                                );
                            }
                        }
                    }
                }
                completed_reflections.clear();

                if aggregated_goal_achieved {
                    break SessionOutcome {
                        success: true,
                        reason: "aggregated reflection reported GOAL_ACHIEVED".to_string(),
                    };
                }

                self.metrics.artifacts_found = self.graph.lock().await.causal_node_count();
                self.run_log.push("cycle_snapshot", self.metrics.snapshot());
            }

            // ---- executor batch ---------------------------------------
            let batch = self.graph.lock().await.next_executable_subtasks();
            if batch.is_empty() {
                break SessionOutcome {
                    success: self.graph.lock().await.is_goal_achieved(),
                    reason: "no executable subtasks remain".to_string(),
                };
            }
            tracing::info!(batch = ?batch, "launching executor batch");

            let executor = Arc::new(Executor::new(
                Arc::clone(&self.llm),
                Arc::clone(&self.tools),
                Arc::clone(&self.graph),
                self.config.executor.clone(),
                self.goal.clone(),
                self.briefing_for_executors(),
            ));
            let mut handles = Vec::new();
            for subtask_id in batch {
                {
                    let mut graph = self.graph.lock().await;
                    let mut updates = Map::new();
                    updates.insert("status".into(), Value::String("in_progress".into()));
                    graph.update_node(&subtask_id, &updates);
                }
                let executor = Arc::clone(&executor);
                let halt = self.halt.clone();
                handles.push(tokio::spawn(async move {
                    executor.run_subtask(&subtask_id, &halt, None).await
                }));
            }

            let mut finished: Vec<(String, ExecutorOutcome, CycleMetrics)> = Vec::new();
            for handle in handles {
                match handle.await {
                    Ok(result) => finished.push(result),
                    Err(e) => {
                        // An executor panic never aborts the loop.
                        tracing::error!(error = %e, "executor task failed");
                    }
                }
            }

            // ---- reflection -------------------------------------------
            for (subtask_id, exec_outcome, cycle_metrics) in finished {
                self.metrics.absorb_cycle(&cycle_metrics);
                self.run_log.push(
                    "executor_finished",
                    json!({"subtask_id": subtask_id.as_str(), "outcome": exec_outcome.as_str()}),
                );
                if matches!(
                    exec_outcome,
                    ExecutorOutcome::AbortedByHaltSignal
                        | ExecutorOutcome::AbortedByExternalHaltSignal
                ) {
                    continue;
                }

                let reflection = self.reflect_subtask(&subtask_id, exec_outcome).await;
                self.metrics.reflect_steps += 1;

                // A strategic failure retires the whole branch: the planner
                // regenerates it, with in-branch updates rewritten into
                // deprecations.
                if reflection.audit_result.is_strategic_failure {
                    let (description, dead_branch) = {
                        let graph = self.graph.lock().await;
                        let description = graph
                            .subtask(&subtask_id)
                            .map(|s| s.description)
                            .unwrap_or_default();
                        let mut dead = graph.descendants(&subtask_id);
                        dead.insert(subtask_id.clone());
                        (description, dead)
                    };
                    let failure_reason = reflection.audit_result.completion_check.clone();
                    let (ops, call) = self
                        .planner
                        .regenerate_branch_plan(
                            &subtask_id,
                            &description,
                            &failure_reason,
                            &dead_branch,
                        )
                        .await;
                    if let Some(call) = call {
                        self.metrics.absorb_call(&call);
                    }
                    self.metrics.plan_steps += 1;
                    if !ops.is_empty() {
                        self.run_log
                            .push("branch_replan", Self::ops_payload(&ops));
                        self.apply_ops(ops).await;
                    }
                }

                completed_reflections.insert(subtask_id, reflection);
            }
        };

        // ---- wrap-up -----------------------------------------------------
        if outcome.success && self.graph.lock().await.is_goal_achieved() {
            let simplified = self.graph.lock().await.simplified_success_graph();
            let global = self.reflector.reflect_global(&simplified, true).await;
            self.run_log.push("global_reflection", global);
        }
        self.metrics.artifacts_found = self.graph.lock().await.causal_node_count();
        self.metrics.mark_finished(outcome.success, &outcome.reason);
        self.broker.emit(
            "session.finished",
            json!({"success": outcome.success, "reason": outcome.reason}),
            Some(&self.session_id),
        );
        outcome
    }

    async fn reflect_subtask(
        &mut self,
        subtask_id: &str,
        exec_outcome: ExecutorOutcome,
    ) -> Reflection {
        let (subtask, execution_log, staged, graph_summary, dependencies, failure_patterns) = {
            let mut graph = self.graph.lock().await;
            let subtask = graph.subtask(subtask_id);
            let log = graph.execution_log(subtask_id);
            let staged = graph.staged_causal_nodes(subtask_id);
            let summary = graph.full_graph_summary(1);
            let dependencies = graph
                .build_prompt_context(subtask_id)
                .map(|c| c.dependencies)
                .unwrap_or_default();
            let patterns = graph.failure_patterns();
            (subtask, log, staged, summary, dependencies, patterns)
        };
        let subtask = subtask.unwrap_or_else(|| Subtask::new(subtask_id, ""));

        let reflection = self
            .reflector
            .reflect(
                subtask_id,
                &subtask.description,
                &subtask.completion_criteria,
                exec_outcome.as_str(),
                &execution_log,
                &staged,
                &graph_summary,
                &dependencies,
                &failure_patterns,
                subtask.termination_reason.as_deref(),
            )
            .await;
        if let Some(call) = &reflection.metrics {
            self.metrics.absorb_call(call);
        }

        {
            let mut graph = self.graph.lock().await;
            // Within a reflection pass node inserts complete before edge
            // inserts (two-phase, inside process_causal_graph_commands).
            let validated = graph
                .validate_causal_graph_updates(&reflection.causal_graph_updates, Some(subtask_id));
            graph.process_causal_graph_commands(&validated);
            graph.set_audit_status(subtask_id, reflection.audit_result.status);
            let mut updates = Map::new();
            if !reflection.key_findings.is_empty() {
                updates.insert(
                    "summary".into(),
                    Value::String(reflection.key_findings.join("; ")),
                );
            }
            updates.insert(
                "reflection".into(),
                serde_json::to_value(&reflection.audit_result).unwrap_or(Value::Null),
            );
            graph.update_node(subtask_id, &updates);
            for finding in &reflection.key_findings {
                graph.add_key_fact(finding);
            }
            graph.clear_staged_causal_nodes(subtask_id);
        }
        reflection
    }
}
