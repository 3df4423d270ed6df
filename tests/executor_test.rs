//! Executor integration tests: parallel dispatch, correctable errors,
//! halt handling, and the termination heuristics.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{exec_reply, done_reply, test_graph, ScriptedLlm, ScriptedTools};
use stratagem::domain::models::{
    ExecutorConfig, ExecutorOutcome, StepStatus, Subtask, SubtaskStatus,
};
use stratagem::services::halt::{HaltLatch, HaltPayload};
use stratagem::services::Executor;

fn executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_steps: 10,
        no_artifacts_patience: 5,
        failure_threshold: 3,
        ..Default::default()
    }
}

async fn seed_subtask(graph: &tokio::sync::Mutex<stratagem::services::GraphManager>, id: &str) {
    let mut guard = graph.lock().await;
    guard.add_subtask(
        Subtask::new(id, format!("explore {id}")).with_completion_criteria("criteria"),
        &[],
    );
}

#[tokio::test]
async fn test_subtask_completes_when_model_declares_done() {
    let llm = ScriptedLlm::new();
    llm.push("executor", done_reply());
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_done", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_done");
    halt.clear();
    let executor = Executor::new(
        llm.clone(),
        tools,
        Arc::clone(&graph),
        executor_config(),
        "goal",
        "briefing",
    );
    let (id, outcome, _metrics) = executor.run_subtask("subtask_1", &halt, None).await;
    assert_eq!(id, "subtask_1");
    assert_eq!(outcome, ExecutorOutcome::Completed);
    let guard = graph.lock().await;
    assert_eq!(
        guard.subtask("subtask_1").unwrap().status,
        SubtaskStatus::Completed
    );
    // Conversation history was persisted: system prompt + assistant reply
    let history = guard.conversation_history("subtask_1").unwrap();
    assert!(history.len() >= 2);
}

#[tokio::test]
async fn test_step_ids_are_rewritten_with_subtask_prefix() {
    let llm = ScriptedLlm::new();
    llm.push("executor", exec_reply("7", "probe", false));
    llm.push("executor", done_reply());
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_prefix", "goal");
    seed_subtask(&graph, "subtask_a").await;

    let halt = HaltLatch::new("exec_prefix");
    halt.clear();
    let executor = Executor::new(
        llm,
        tools,
        Arc::clone(&graph),
        executor_config(),
        "goal",
        "b",
    );
    let (_, outcome, metrics) = executor.run_subtask("subtask_a", &halt, None).await;
    assert_eq!(outcome, ExecutorOutcome::Completed);
    assert_eq!(metrics.tool_calls.get("probe"), Some(&1));

    let guard = graph.lock().await;
    assert!(guard.has_node("subtask_a_7"), "raw id must be prefixed");
    let (parent, _) = guard.step_view("subtask_a_7").unwrap();
    assert_eq!(parent, "subtask_a");
}

#[tokio::test]
async fn test_parallel_subtasks_get_disjoint_step_ids_and_metrics() {
    // Two executors over two subtasks, both using raw id "1".
    let llm = ScriptedLlm::new();
    llm.push("executor", exec_reply("1", "probe", false));
    llm.push("executor", exec_reply("1", "probe", false));
    llm.push("executor", done_reply());
    llm.push("executor", done_reply());
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_parallel", "goal");
    seed_subtask(&graph, "subtask_a").await;
    seed_subtask(&graph, "subtask_b").await;

    let halt = HaltLatch::new("exec_parallel");
    halt.clear();
    let executor = Arc::new(Executor::new(
        llm,
        tools,
        Arc::clone(&graph),
        executor_config(),
        "goal",
        "b",
    ));
    let task_a = {
        let executor = Arc::clone(&executor);
        let halt = halt.clone();
        tokio::spawn(async move { executor.run_subtask("subtask_a", &halt, None).await })
    };
    let task_b = {
        let executor = Arc::clone(&executor);
        let halt = halt.clone();
        tokio::spawn(async move { executor.run_subtask("subtask_b", &halt, None).await })
    };
    let (_, outcome_a, metrics_a) = task_a.await.unwrap();
    let (_, outcome_b, metrics_b) = task_b.await.unwrap();
    assert_eq!(outcome_a, ExecutorOutcome::Completed);
    assert_eq!(outcome_b, ExecutorOutcome::Completed);
    // Each run carries its own metrics
    assert_eq!(metrics_a.tool_calls.get("probe"), Some(&1));
    assert_eq!(metrics_b.tool_calls.get("probe"), Some(&1));

    let guard = graph.lock().await;
    assert!(guard.has_node("subtask_a_1"));
    assert!(guard.has_node("subtask_b_1"));
}

#[tokio::test]
async fn test_correctable_error_triggers_correction_turn() {
    let llm = ScriptedLlm::new();
    // Turn 1: a call that comes back with a SYNTAX error
    llm.push("executor", exec_reply("1", "probe", false));
    // Turn 2 (same logical turn, after correction): done
    llm.push("executor", done_reply());
    let tools = ScriptedTools::new();
    tools.push_result(
        "probe",
        json!({
            "success": false,
            "error_type": "SYNTAX",
            "message": "missing parameter",
            "fix_suggestion": "add target"
        }),
    );
    let graph = test_graph("exec_correct", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_correct");
    halt.clear();
    let executor = Executor::new(
        llm.clone(),
        tools,
        Arc::clone(&graph),
        executor_config(),
        "goal",
        "b",
    );
    let (_, outcome, _) = executor.run_subtask("subtask_1", &halt, None).await;
    assert_eq!(outcome, ExecutorOutcome::Completed);

    let guard = graph.lock().await;
    // The failed step is marked failed
    let (_, failed) = guard.step_view("subtask_1_1").unwrap();
    assert!(failed);
    // The correction user-turn is present in the history
    let history = guard.conversation_history("subtask_1").unwrap();
    let correction = history
        .iter()
        .find(|m| m.content.contains("correct them now"))
        .expect("correction turn present");
    assert!(correction.content.contains("missing parameter"));
    assert!(correction.content.contains("add target"));
}

#[tokio::test]
async fn test_max_steps_bounds_llm_turns() {
    let llm = ScriptedLlm::new();
    // More replies than the cap allows; none declare completion.
    for i in 0..10 {
        llm.push("executor", exec_reply(&format!("{i}"), "probe", false));
    }
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_cap", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_cap");
    halt.clear();
    let mut config = executor_config();
    config.max_steps = 3;
    let executor = Executor::new(llm.clone(), tools, Arc::clone(&graph), config, "goal", "b");
    let (_, outcome, metrics) = executor.run_subtask("subtask_1", &halt, None).await;

    assert_eq!(outcome, ExecutorOutcome::CompletedViaMaxSteps);
    assert_eq!(llm.call_count("executor"), 3, "at most k LLM turns");
    assert_eq!(metrics.execution_steps, 3);

    let guard = graph.lock().await;
    let subtask = guard.subtask("subtask_1").unwrap();
    // Not marked completed: the model never set is_subtask_complete
    assert_ne!(subtask.status, SubtaskStatus::Completed);
    assert_eq!(subtask.termination_reason.as_deref(), Some("max_steps_reached"));
}

#[tokio::test]
async fn test_no_new_artifacts_patience() {
    let barren = |id: &str| {
        json!({
            "previous_steps_status": {},
            "thought": "try again",
            "execution_operations": [{
                "command": "EXECUTE_NOW",
                "node_id": id,
                "thought": "t",
                "action": {"tool": "probe", "params": {}}
            }],
            "staged_causal_nodes": [],
            "hypothesis_update": {},
            "is_subtask_complete": false
        })
    };
    let llm = ScriptedLlm::new();
    for i in 0..6 {
        llm.push("executor", barren(&format!("{i}")));
    }
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_patience", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_patience");
    halt.clear();
    let mut config = executor_config();
    config.no_artifacts_patience = 2;
    let executor = Executor::new(llm.clone(), tools, Arc::clone(&graph), config, "goal", "b");
    let (_, outcome, _) = executor.run_subtask("subtask_1", &halt, None).await;

    assert_eq!(outcome, ExecutorOutcome::CompletedViaMaxSteps);
    assert_eq!(llm.call_count("executor"), 2, "terminates after p barren turns");
    let guard = graph.lock().await;
    assert_eq!(
        guard.subtask("subtask_1").unwrap().termination_reason.as_deref(),
        Some("no_new_artifacts")
    );
}

#[tokio::test]
async fn test_halt_before_first_turn_aborts() {
    let llm = ScriptedLlm::new();
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_halt_pre", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_halt_pre");
    halt.clear();
    halt.set(&HaltPayload { reason: "mission done".into(), evidence: String::new() });

    let executor = Executor::new(
        llm.clone(),
        tools,
        Arc::clone(&graph),
        executor_config(),
        "goal",
        "b",
    );
    let (_, outcome, _) = executor.run_subtask("subtask_1", &halt, None).await;
    assert_eq!(outcome, ExecutorOutcome::AbortedByHaltSignal);
    assert_eq!(llm.call_count("executor"), 0, "no LLM call after the latch");
    halt.clear();
}

#[tokio::test]
async fn test_halt_mid_subtask_marks_steps_aborted() {
    // The tool call itself sets the latch: turn 2's top-of-loop probe
    // observes it and aborts with the in-flight step ids marked aborted.
    let llm = ScriptedLlm::new();
    llm.push("executor", exec_reply("1", "probe", false));
    llm.push("executor", exec_reply("2", "probe", false));
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_halt_mid", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_halt_mid");
    halt.clear();
    {
        let latch = halt.clone();
        tools.set_hook(move |_| {
            latch.set(&HaltPayload { reason: "flag".into(), evidence: "F{}".into() });
        });
    }

    let executor = Executor::new(
        llm.clone(),
        tools,
        Arc::clone(&graph),
        executor_config(),
        "goal",
        "b",
    );
    let (_, outcome, _) = executor.run_subtask("subtask_1", &halt, None).await;
    assert_eq!(outcome, ExecutorOutcome::AbortedByExternalHaltSignal);
    assert_eq!(llm.call_count("executor"), 1, "second turn never starts");

    let guard = graph.lock().await;
    // History persisted up to the abort
    assert!(!guard.conversation_history("subtask_1").unwrap().is_empty());
    halt.clear();
}

#[tokio::test]
async fn test_stalled_when_no_operations_and_not_complete() {
    let llm = ScriptedLlm::new();
    llm.push(
        "executor",
        json!({
            "previous_steps_status": {},
            "thought": "unsure what to do",
            "execution_operations": [],
            "staged_causal_nodes": [],
            "hypothesis_update": {},
            "is_subtask_complete": false
        }),
    );
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_stall", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_stall");
    halt.clear();
    let executor = Executor::new(
        llm,
        tools,
        Arc::clone(&graph),
        executor_config(),
        "goal",
        "b",
    );
    let (_, outcome, _) = executor.run_subtask("subtask_1", &halt, None).await;
    assert_eq!(outcome, ExecutorOutcome::StalledNoPlan);
}

#[tokio::test]
async fn test_observation_truncation_records_original_length() {
    let llm = ScriptedLlm::new();
    llm.push("executor", exec_reply("1", "probe", false));
    llm.push("executor", done_reply());
    let tools = ScriptedTools::new();
    let long_output: String = "A".repeat(5000);
    tools.push_result("probe", json!({"success": true, "dump": long_output}));

    let graph = test_graph("exec_trunc", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_trunc");
    halt.clear();
    let mut config = executor_config();
    config.max_output_length = 200;
    let executor = Executor::new(llm, tools, Arc::clone(&graph), config, "goal", "b");
    let (_, outcome, _) = executor.run_subtask("subtask_1", &halt, None).await;
    assert_eq!(outcome, ExecutorOutcome::Completed);

    let guard = graph.lock().await;
    let history = guard.conversation_history("subtask_1").unwrap();
    assert!(history.iter().any(|m| m.content.contains("truncated")));
}

#[tokio::test]
async fn test_conversation_round_trip_preserves_resume_state() {
    // Serialize the persisted history, restore it into a fresh graph, and
    // check the executor resume state is intact.
    let llm = ScriptedLlm::new();
    llm.push("executor", exec_reply("1", "probe", false));
    llm.push("executor", exec_reply("2", "probe", false));
    // Stop via max steps after two turns.
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_resume", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_resume");
    halt.clear();
    let mut config = executor_config();
    config.max_steps = 2;
    let executor = Executor::new(llm, tools, Arc::clone(&graph), config, "goal", "b");
    let _ = executor.run_subtask("subtask_1", &halt, None).await;

    let (history, last_steps) = {
        let guard = graph.lock().await;
        (
            guard.conversation_history("subtask_1").unwrap(),
            guard.last_step_ids("subtask_1"),
        )
    };
    assert_eq!(last_steps, vec!["subtask_1_2".to_string()]);

    let serialized = serde_json::to_string(&history).unwrap();
    let restored: Vec<stratagem::domain::models::ChatMessage> =
        serde_json::from_str(&serialized).unwrap();
    assert_eq!(restored, history);

    let fresh = test_graph("exec_resume_2", "goal");
    {
        let mut guard = fresh.lock().await;
        guard.add_subtask(Subtask::new("subtask_1", "explore"), &[]);
        guard
            .set_conversation_history("subtask_1", restored.clone())
            .unwrap();
        guard.set_last_step_ids("subtask_1", last_steps.clone());
    }
    let guard = fresh.lock().await;
    assert_eq!(guard.conversation_history("subtask_1").unwrap(), restored);
    assert_eq!(guard.last_step_ids("subtask_1"), last_steps);
}

#[tokio::test]
async fn test_forced_reflection_after_consecutive_failures() {
    // Three turns whose steps all fail (transport failures), threshold 3:
    // the next turn must carry the forced-reflection user message.
    let llm = ScriptedLlm::new();
    for i in 0..4 {
        let mut reply = exec_reply(&format!("{i}"), "probe", false);
        // Pin every step to the same parent so the per-parent counter can
        // accumulate, and report the previous step as failed.
        reply["execution_operations"][0]["parent_id"] = json!("subtask_1");
        if i > 0 {
            reply["previous_steps_status"] =
                json!({format!("subtask_1_{}", i - 1): "failed"});
        }
        llm.push("executor", reply);
    }
    llm.push("executor", done_reply());
    let tools = ScriptedTools::new();
    for _ in 0..5 {
        tools.push_result("probe", json!({"success": false, "error": "tool call failed: x"}));
    }
    let graph = test_graph("exec_failures", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_failures");
    halt.clear();
    let mut config = executor_config();
    config.failure_threshold = 2;
    config.no_artifacts_patience = 50;
    let executor = Executor::new(llm, tools, Arc::clone(&graph), config, "goal", "b");
    let _ = executor.run_subtask("subtask_1", &halt, None).await;

    let guard = graph.lock().await;
    let history = guard.conversation_history("subtask_1").unwrap();
    assert!(
        history
            .iter()
            .any(|m| m.content.contains("hypothesis-formulation")),
        "forced reflection message injected"
    );
}

#[tokio::test]
async fn test_context_compression_replaces_middle_with_summary() {
    let llm = ScriptedLlm::new();
    for i in 0..4 {
        llm.push("executor", exec_reply(&format!("{i}"), "probe", false));
    }
    llm.push("executor", done_reply());
    let tools = ScriptedTools::new();
    let graph = test_graph("exec_compress", "goal");
    seed_subtask(&graph, "subtask_1").await;

    let halt = HaltLatch::new("exec_compress");
    halt.clear();
    let mut config = executor_config();
    // Tiny thresholds so the third turn triggers compression.
    config.message_compress_threshold = 2;
    config.recent_messages_keep = 2;
    config.min_compress_messages = 1;
    config.no_artifacts_patience = 50;
    let executor = Executor::new(llm, tools, Arc::clone(&graph), config, "goal", "b");
    let (_, outcome, _) = executor.run_subtask("subtask_1", &halt, None).await;
    assert_eq!(outcome, ExecutorOutcome::Completed);

    let guard = graph.lock().await;
    let history = guard.conversation_history("subtask_1").unwrap();
    assert!(
        history.iter().any(|m| m.content.contains("Context summary")),
        "middle of the conversation was replaced with a summary"
    );
}

#[test]
fn test_step_status_executed_maps_to_completed() {
    assert_eq!(StepStatus::from_str("executed"), Some(StepStatus::Completed));
}
