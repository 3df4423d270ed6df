//! Executor: the per-subtask thought-act-observe loop.
//!
//! Each turn: probe the halt latch, compress the conversation if needed,
//! rebuild the system prompt from live graph state, call the LLM,
//! reconcile previous step statuses, enforce failure patterns, stage
//! proposed causal nodes, dispatch the turn's tool calls in parallel,
//! then either finish (LLM declared completion), loop for a correction,
//! or terminate on a heuristic. Conversation history is persisted before
//! the next turn starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::domain::models::{
    estimate_tokens, ChatMessage, CycleMetrics, ExecutorConfig, ExecutorOutcome, ExecutorReply,
    StepStatus, SubtaskStatus, TerminationReason,
};
use crate::domain::ports::{LlmReply, LlmTransport, ToolDispatch};
use crate::infrastructure::tools::{classify_tool_result, ToolResultKind};
use crate::services::graph::{GraphManager, TaskGraph};
use crate::services::halt::HaltLatch;
use crate::services::prompts;

/// Retries for transient LLM faults inside one turn.
const LLM_RETRIES: u32 = 3;
const LLM_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Everything one executor run needs.
pub struct Executor {
    llm: Arc<dyn LlmTransport>,
    tools: Arc<dyn ToolDispatch>,
    graph: Arc<Mutex<GraphManager>>,
    config: ExecutorConfig,
    main_goal: String,
    global_mission_briefing: String,
}

impl Executor {
    pub fn new(
        llm: Arc<dyn LlmTransport>,
        tools: Arc<dyn ToolDispatch>,
        graph: Arc<Mutex<GraphManager>>,
        config: ExecutorConfig,
        main_goal: impl Into<String>,
        global_mission_briefing: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            tools,
            graph,
            config,
            main_goal: main_goal.into(),
            global_mission_briefing: global_mission_briefing.into(),
        }
    }

    /// Run the exploration loop for one subtask until it terminates.
    pub async fn run_subtask(
        &self,
        subtask_id: &str,
        halt: &HaltLatch,
        max_steps_override: Option<u32>,
    ) -> (String, ExecutorOutcome, CycleMetrics) {
        let mut metrics = CycleMetrics::default();
        let max_steps = max_steps_override.unwrap_or(self.config.max_steps);

        let (mut messages, mut last_step_ids, disable_artifact_check) = {
            let graph = self.graph.lock().await;
            let messages = graph.conversation_history(subtask_id).unwrap_or_default();
            let last = graph.last_step_ids(subtask_id);
            let disable = graph
                .subtask(subtask_id)
                .is_some_and(|s| s.disable_artifact_check);
            (messages, last, disable)
        };

        let mut executed_turns: u32 = 0;
        let mut consecutive_no_new_artifacts: u32 = 0;
        let mut failure_counts_per_parent: HashMap<String, u32> = HashMap::new();

        loop {
            // 1. Halt probe at the turn boundary.
            if halt.is_set() {
                return self
                    .abort_on_halt(subtask_id, &last_step_ids, &messages, metrics, false)
                    .await;
            }

            // 2. Context compression.
            messages = self
                .compress_if_needed(subtask_id, messages, executed_turns, &mut metrics)
                .await;

            // 3. Rebuild the system prompt from live graph state.
            let tool_catalog = self.tools.catalog().await;
            let system_prompt = {
                let mut graph = self.graph.lock().await;
                match graph.build_prompt_context(subtask_id) {
                    Ok(context) => prompts::executor_system_prompt(
                        &self.main_goal,
                        &self.global_mission_briefing,
                        &context,
                        &tool_catalog,
                    ),
                    Err(e) => {
                        tracing::error!(subtask_id, error = %e, "prompt context unavailable");
                        return (subtask_id.to_string(), ExecutorOutcome::Error, metrics);
                    }
                }
            };
            match messages.first_mut() {
                Some(first) if first.role == crate::domain::models::Role::System => {
                    first.content = system_prompt;
                }
                _ => messages.insert(0, ChatMessage::system(system_prompt)),
            }

            // 4. LLM call with transient retry.
            let reply_value = match self.call_llm(&messages, &mut metrics).await {
                Ok(value) => value,
                Err(()) => {
                    let _ = {
                        let mut graph = self.graph.lock().await;
                        graph.set_conversation_history(subtask_id, messages.clone())
                    };
                    return (subtask_id.to_string(), ExecutorOutcome::Error, metrics);
                }
            };
            messages.push(ChatMessage::assistant(reply_value.to_string()));
            let reply = ExecutorReply::from_value(&reply_value);

            // 5. Reconcile previous-step statuses as judged by the LLM.
            {
                let mut graph = self.graph.lock().await;
                for step_id in &last_step_ids {
                    if let Some(reported) = reply
                        .previous_steps_status
                        .get(step_id)
                        .and_then(|s| StepStatus::from_str(s))
                    {
                        if matches!(reported, StepStatus::Completed | StepStatus::Failed) {
                            graph.set_step_status(step_id, reported);
                        }
                    }
                }
            }

            // 6. Failure-pattern enforcement.
            self.enforce_failure_patterns(
                &reply,
                &last_step_ids,
                &mut failure_counts_per_parent,
                &mut messages,
            )
            .await;

            // 7. Stage proposed causal nodes.
            if !reply.staged_causal_nodes.is_empty() {
                let mut graph = self.graph.lock().await;
                if let Err(e) = graph
                    .stage_proposed_causal_nodes(subtask_id, reply.staged_causal_nodes.clone())
                {
                    tracing::warn!(subtask_id, error = %e, "staging causal nodes failed");
                }
            }

            // Mid-turn halt check before spending tool budget.
            if halt.is_set() {
                let _ = {
                    let mut graph = self.graph.lock().await;
                    graph.set_conversation_history(subtask_id, messages.clone())
                };
                return (
                    subtask_id.to_string(),
                    ExecutorOutcome::AbortedByHaltSignal,
                    metrics,
                );
            }

            let is_final_step = reply.is_subtask_complete;
            if reply.execution_operations.is_empty() && !is_final_step {
                tracing::info!(subtask_id, "no executable operations proposed, subtask stalls");
                let _ = {
                    let mut graph = self.graph.lock().await;
                    graph.set_conversation_history(subtask_id, messages.clone())
                };
                return (
                    subtask_id.to_string(),
                    ExecutorOutcome::StalledNoPlan,
                    metrics,
                );
            }

            // 8. Parallel tool dispatch.
            if !reply.execution_operations.is_empty() {
                let dispatch = self
                    .dispatch_turn(subtask_id, &reply, &last_step_ids, &mut metrics)
                    .await;
                last_step_ids = dispatch.step_ids.clone();
                {
                    let mut graph = self.graph.lock().await;
                    graph.set_last_step_ids(subtask_id, dispatch.step_ids.clone());
                }

                if !dispatch.correction_feedback.is_empty() {
                    // Correctable faults: surface one correction turn and
                    // retry without advancing.
                    let correction = format!(
                        "Tool call errors detected, correct them now:\n{}",
                        dispatch.correction_feedback.join("\n")
                    );
                    messages.push(ChatMessage::user(correction));
                    let _ = {
                        let mut graph = self.graph.lock().await;
                        graph.set_conversation_history(subtask_id, messages.clone())
                    };
                    continue;
                }

                messages.push(ChatMessage::user(format!(
                    "You executed {} action(s) in parallel and observed:\n{}",
                    dispatch.step_ids.len(),
                    dispatch.observations.join("\n")
                )));
                if dispatch.truncated_count > 0 {
                    messages.push(ChatMessage::user(format!(
                        "Note: {} observation(s) were truncated.",
                        dispatch.truncated_count
                    )));
                }
            }

            // 9. Completion check.
            if is_final_step {
                let mut graph = self.graph.lock().await;
                let mut updates = serde_json::Map::new();
                updates.insert(
                    "status".into(),
                    Value::String(SubtaskStatus::Completed.as_str().to_string()),
                );
                graph.update_node(subtask_id, &updates);
                let _ = graph.set_conversation_history(subtask_id, messages.clone());
                tracing::info!(subtask_id, "subtask declared complete by the model");
                return (subtask_id.to_string(), ExecutorOutcome::Completed, metrics);
            }

            // 10. Close the turn, then apply the termination heuristics.
            executed_turns += 1;
            metrics.execution_steps = executed_turns;
            {
                let mut graph = self.graph.lock().await;
                let _ = graph.set_conversation_history(subtask_id, messages.clone());
                graph.set_turn_counter(subtask_id, executed_turns);
            }

            if executed_turns >= max_steps {
                self.terminate(
                    subtask_id,
                    TerminationReason::MaxStepsReached,
                    executed_turns,
                    &last_step_ids,
                    &messages,
                )
                .await;
                return (
                    subtask_id.to_string(),
                    ExecutorOutcome::CompletedViaMaxSteps,
                    metrics,
                );
            }

            if reply.staged_causal_nodes.is_empty() {
                consecutive_no_new_artifacts += 1;
            } else {
                consecutive_no_new_artifacts = 0;
            }
            if !disable_artifact_check
                && consecutive_no_new_artifacts >= self.config.no_artifacts_patience
            {
                self.terminate(
                    subtask_id,
                    TerminationReason::NoNewArtifacts,
                    executed_turns,
                    &last_step_ids,
                    &messages,
                )
                .await;
                return (
                    subtask_id.to_string(),
                    ExecutorOutcome::CompletedViaMaxSteps,
                    metrics,
                );
            }

            if halt.is_set() {
                return self
                    .abort_on_halt(subtask_id, &last_step_ids, &messages, metrics, true)
                    .await;
            }
        }
    }

    async fn abort_on_halt(
        &self,
        subtask_id: &str,
        last_step_ids: &[String],
        messages: &[ChatMessage],
        metrics: CycleMetrics,
        external: bool,
    ) -> (String, ExecutorOutcome, CycleMetrics) {
        tracing::info!(subtask_id, "halt latch observed, aborting cooperatively");
        let mut graph = self.graph.lock().await;
        for step_id in last_step_ids {
            graph.set_step_status(step_id, StepStatus::Aborted);
        }
        let _ = graph.set_conversation_history(subtask_id, messages.to_vec());
        let outcome = if external {
            ExecutorOutcome::AbortedByExternalHaltSignal
        } else {
            ExecutorOutcome::AbortedByHaltSignal
        };
        (subtask_id.to_string(), outcome, metrics)
    }

    async fn terminate(
        &self,
        subtask_id: &str,
        reason: TerminationReason,
        executed_turns: u32,
        last_step_ids: &[String],
        messages: &[ChatMessage],
    ) {
        tracing::info!(
            subtask_id,
            reason = reason.as_str(),
            executed_turns,
            "executor termination heuristic fired"
        );
        let mut graph = self.graph.lock().await;
        let mut updates = serde_json::Map::new();
        updates.insert(
            "termination_reason".into(),
            Value::String(reason.as_str().to_string()),
        );
        graph.update_node(subtask_id, &updates);
        for step_id in last_step_ids {
            graph.set_step_status(step_id, StepStatus::Completed);
        }
        let _ = graph.set_conversation_history(subtask_id, messages.to_vec());
    }

    async fn call_llm(
        &self,
        messages: &[ChatMessage],
        metrics: &mut CycleMetrics,
    ) -> Result<Value, ()> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.llm.send_message(messages, "executor", true).await {
                Ok((LlmReply::Json(value), call)) => {
                    metrics.absorb_call(call);
                    return Ok(value);
                }
                Ok((LlmReply::Text(_), call)) => {
                    metrics.absorb_call(call);
                    tracing::error!("executor LLM returned non-JSON content");
                    return Err(());
                }
                Err(e) if e.is_transient() && attempt < LLM_RETRIES => {
                    tracing::warn!(attempt, error = %e, "transient LLM fault, retrying");
                    tokio::time::sleep(LLM_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "executor LLM call failed");
                    return Err(());
                }
            }
        }
    }

    /// Context compression: triggered by message count, a periodic
    /// interval, or the estimated token load. Keeps the system prompt and
    /// the most recent tail, replaces the middle with an LLM summary.
    /// Compression failure logs and proceeds uncompressed.
    async fn compress_if_needed(
        &self,
        subtask_id: &str,
        messages: Vec<ChatMessage>,
        executed_turns: u32,
        metrics: &mut CycleMetrics,
    ) -> Vec<ChatMessage> {
        let count_trigger = messages.len() > self.config.message_compress_threshold;
        let interval_trigger = executed_turns > 0
            && self.config.compress_interval > 0
            && executed_turns % self.config.compress_interval == 0
            && messages.len() > self.config.compress_interval_msg_threshold;
        let token_trigger = estimate_tokens(&messages) > self.config.token_compress_threshold;
        if !(count_trigger || interval_trigger || token_trigger) {
            return messages;
        }

        let keep = self.config.recent_messages_keep;
        if messages.len() <= keep + 1 {
            return messages;
        }
        let system = match messages.first() {
            Some(first) if first.role == crate::domain::models::Role::System => first.clone(),
            _ => ChatMessage::system(String::new()),
        };
        let recent: Vec<ChatMessage> = messages[messages.len() - keep..].to_vec();
        let middle = &messages[1..messages.len() - keep];
        if middle.len() < self.config.min_compress_messages {
            return messages;
        }

        tracing::info!(
            subtask_id,
            compressed = middle.len(),
            kept = recent.len(),
            "compressing conversation context"
        );
        match self.llm.summarize_conversation(middle).await {
            Ok((summary, call)) if !summary.trim().is_empty() => {
                metrics.absorb_call(call);
                let mut compressed = vec![
                    system,
                    ChatMessage::system(format!(
                        "Context summary (compressed from {} earlier messages):\n\n{summary}",
                        middle.len()
                    )),
                ];
                compressed.extend(recent);
                {
                    let mut graph = self.graph.lock().await;
                    let _ = graph.set_conversation_history(subtask_id, compressed.clone());
                }
                compressed
            }
            Ok(_) => {
                tracing::warn!(subtask_id, "compression summary was empty, keeping history");
                messages
            }
            Err(e) => {
                tracing::error!(subtask_id, error = %e, "context compression failed");
                messages
            }
        }
    }

    async fn enforce_failure_patterns(
        &self,
        reply: &ExecutorReply,
        last_step_ids: &[String],
        failure_counts: &mut HashMap<String, u32>,
        messages: &mut Vec<ChatMessage>,
    ) {
        if !last_step_ids.is_empty() {
            let mut steps_per_parent: HashMap<String, Vec<bool>> = HashMap::new();
            {
                let graph = self.graph.lock().await;
                for step_id in last_step_ids {
                    if let Some((parent, failed)) = graph.step_view(step_id) {
                        steps_per_parent.entry(parent).or_default().push(failed);
                    }
                }
            }
            for (parent, failures) in steps_per_parent {
                if !failures.is_empty() && failures.iter().all(|failed| *failed) {
                    let count = failure_counts.entry(parent.clone()).or_insert(0);
                    *count += 1;
                    if *count >= self.config.failure_threshold {
                        messages.push(ChatMessage::user(format!(
                            "Warning: {count} consecutive actions under '{parent}' have all \
                             failed. You must call the hypothesis-formulation tool now to \
                             revisit your assumptions, or switch to a different direction. Do \
                             not repeat the current strategy."
                        )));
                        tracing::warn!(parent = %parent, "forced reflection injected after repeated failures");
                        failure_counts.insert(parent, 0);
                    }
                } else {
                    failure_counts.insert(parent, 0);
                }
            }
        }

        if let Some(contradiction) = reply.contradiction_detected() {
            messages.push(ChatMessage::user(format!(
                "Warning: a contradiction was detected: {contradiction}. You must call the \
                 hypothesis-formulation tool now to revisit your assumptions before \
                 continuing."
            )));
            tracing::warn!("forced reflection injected after contradiction");
        }
    }

    async fn dispatch_turn(
        &self,
        subtask_id: &str,
        reply: &ExecutorReply,
        last_step_ids: &[String],
        metrics: &mut CycleMetrics,
    ) -> DispatchResult {
        let potential_parent = last_step_ids
            .first()
            .cloned()
            .unwrap_or_else(|| subtask_id.to_string());

        // Register every step before launching the calls.
        let mut launched: Vec<(String, String, Value)> = Vec::new();
        {
            let mut graph = self.graph.lock().await;
            for op in &reply.execution_operations {
                // Session-wide uniqueness: prefix the raw id.
                let step_id = format!("{subtask_id}_{}", op.node_id);
                let parent = op
                    .parent_id
                    .as_ref()
                    .filter(|p| graph.is_valid_step_parent(p, subtask_id))
                    .cloned()
                    .unwrap_or_else(|| potential_parent.clone());
                let step = TaskGraph::make_step(
                    step_id.clone(),
                    parent,
                    op.thought.clone(),
                    op.action.clone(),
                    reply.hypothesis_update.clone(),
                );
                if let Err(e) = graph.add_execution_step(step) {
                    tracing::warn!(step_id = %step_id, error = %e, "step registration failed");
                    continue;
                }
                metrics.count_tool_call(&op.action.tool);
                launched.push((step_id, op.action.tool.clone(), op.action.params.clone()));
            }
        }

        // Fan-out / fan-in through the invoker (which owns timeout+retry).
        let calls = launched.iter().map(|(_, tool, params)| {
            let tools = Arc::clone(&self.tools);
            let tool = tool.clone();
            let params = params.clone();
            async move { tools.call(&tool, params).await }
        });
        let results: Vec<String> = join_all(calls).await;

        let mut dispatch = DispatchResult {
            step_ids: launched.iter().map(|(id, _, _)| id.clone()).collect(),
            observations: Vec::new(),
            correction_feedback: Vec::new(),
            truncated_count: 0,
        };

        let mut graph = self.graph.lock().await;
        for ((step_id, tool, _), raw_result) in launched.iter().zip(results) {
            let (kind, feedback) = classify_tool_result(&raw_result);
            let mut status = StepStatus::Completed;
            if kind == ToolResultKind::Correctable {
                status = StepStatus::Failed;
                dispatch.correction_feedback.push(format!(
                    "- Step {step_id} (tool: {tool}) failed: {}",
                    feedback.unwrap_or_default()
                ));
            } else if is_transport_failure(&raw_result) {
                status = StepStatus::Failed;
            }

            let original_length = raw_result.len();
            let mut shown = raw_result;
            let truncated = original_length > self.config.max_output_length;
            if truncated {
                // Cut on a char boundary at or below the cap.
                let mut cut = self.config.max_output_length;
                while cut > 0 && !shown.is_char_boundary(cut) {
                    cut -= 1;
                }
                shown.truncate(cut);
                shown.push_str(&format!("\n... (truncated from {original_length} chars)"));
                dispatch.truncated_count += 1;
            }
            let observation = format!("Result of step {step_id} (tool={tool}): {shown}");
            graph.record_observation(
                step_id,
                observation.clone(),
                truncated,
                original_length,
                status,
            );
            dispatch.observations.push(observation);
        }
        dispatch
    }
}

struct DispatchResult {
    step_ids: Vec<String>,
    observations: Vec<String>,
    correction_feedback: Vec<String>,
    truncated_count: usize,
}

/// Hard transport failures surface as this payload shape from the invoker.
fn is_transport_failure(raw: &str) -> bool {
    serde_json::from_str::<Value>(raw).is_ok_and(|v| {
        v.get("success").and_then(Value::as_bool) == Some(false)
            && v.get("error")
                .and_then(Value::as_str)
                .is_some_and(|e| e.starts_with("tool call failed"))
    })
}
