//! Outer-loop integration tests: the P-E-R cycle end to end with scripted
//! LLM and tool fakes, orphan safety, and batch idempotence.

mod common;

use std::sync::Arc;

use serde_json::{json, Map, Value};

use common::{done_reply, exec_reply, reflection_reply, test_graph, ScriptedLlm, ScriptedTools};
use stratagem::domain::models::{Config, GraphOp, Subtask, SubtaskStatus};
use stratagem::services::halt::HaltLatch;
use stratagem::services::intervention::InterventionManager;
use stratagem::services::{
    process_graph_commands, verify_and_handle_orphans, EventBroker, MemoryInterventionStore,
    Orchestrator,
};

fn initial_plan(ids: &[&str]) -> Value {
    let ops: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "command": "ADD_NODE",
                "node_data": {
                    "id": id,
                    "description": format!("work on {id}"),
                    "dependencies": [],
                    "priority": 1,
                    "completion_criteria": "done when done"
                }
            })
        })
        .collect();
    json!({"graph_operations": ops})
}

fn orchestrator_under_test(
    session: &str,
    goal: &str,
    llm: Arc<ScriptedLlm>,
    tools: Arc<ScriptedTools>,
) -> (Orchestrator, Arc<tokio::sync::Mutex<stratagem::services::GraphManager>>) {
    let graph = test_graph(session, goal);
    let broker = Arc::new(EventBroker::new());
    let intervention = Arc::new(InterventionManager::new(
        Arc::new(MemoryInterventionStore::new()),
        Arc::clone(&broker),
        false,
    ));
    let halt = HaltLatch::new(session);
    halt.clear();
    let config = Config::default();
    let orchestrator = Orchestrator::new(
        config,
        session,
        goal,
        Arc::clone(&graph),
        llm,
        tools,
        intervention,
        broker,
        halt,
    );
    (orchestrator, graph)
}

#[tokio::test]
async fn test_s1_linear_plan_single_subtask_done() {
    let llm = ScriptedLlm::new();
    // Initial plan: one subtask.
    llm.push("planner", initial_plan(&["subtask_1"]));
    // Executor declares completion on turn one.
    llm.push("executor", done_reply());
    // Reflection: completed, not goal-achieved.
    llm.push("reflector", reflection_reply("COMPLETED"));
    // Dynamic replan: empty operations, no accomplishment signal.
    llm.push("planner", json!({"graph_operations": []}));

    let tools = ScriptedTools::new();
    let (mut orchestrator, graph) =
        orchestrator_under_test("s1_linear", "G", llm.clone(), tools);
    let outcome = orchestrator.run().await;

    assert!(!outcome.success);
    assert_eq!(outcome.reason, "no executable subtasks remain");
    let guard = graph.lock().await;
    assert_eq!(
        guard.subtask("subtask_1").unwrap().status,
        SubtaskStatus::Completed
    );
    // One initial plan + one dynamic replan
    assert_eq!(llm.call_count("planner"), 2);
    assert_eq!(llm.call_count("reflector"), 1);
}

#[tokio::test]
async fn test_goal_achieved_reflection_short_circuits() {
    let llm = ScriptedLlm::new();
    llm.push("planner", initial_plan(&["subtask_1"]));
    llm.push("executor", done_reply());
    llm.push("reflector", reflection_reply("GOAL_ACHIEVED"));
    // Dynamic replan still happens once with the aggregate...
    llm.push("planner", json!({"graph_operations": []}));
    // ...and global reflection runs because the goal was achieved.
    llm.push(
        "reflector",
        json!({
            "global_summary": "won",
            "strategic_analysis": "a",
            "global_insight": {
                "strategic_principle": "p",
                "tactical_playbook": ["t"],
                "applicability": ["tag"]
            }
        }),
    );

    let tools = ScriptedTools::new();
    let (mut orchestrator, graph) =
        orchestrator_under_test("s1_goal", "G", llm.clone(), tools);
    let outcome = orchestrator.run().await;

    assert!(outcome.success);
    assert!(outcome.reason.contains("GOAL_ACHIEVED"));
    assert!(graph.lock().await.is_goal_achieved());
}

#[tokio::test]
async fn test_planner_accomplished_signal_applies_ops_then_breaks() {
    let llm = ScriptedLlm::new();
    llm.push("planner", initial_plan(&["subtask_1"]));
    llm.push("executor", done_reply());
    llm.push("reflector", reflection_reply("COMPLETED"));
    // Dynamic plan signals accomplishment AND carries one final op: the op
    // is applied before the loop breaks.
    llm.push(
        "planner",
        json!({
            "graph_operations": [{
                "command": "ADD_NODE",
                "node_data": {"id": "epilogue", "description": "write report"}
            }],
            "global_mission_accomplished": true
        }),
    );

    let tools = ScriptedTools::new();
    let (mut orchestrator, graph) =
        orchestrator_under_test("s1_accomplished", "G", llm.clone(), tools);
    let outcome = orchestrator.run().await;

    assert!(outcome.success);
    assert!(outcome.reason.contains("planner"));
    assert!(graph.lock().await.has_node("epilogue"), "final ops applied before break");
}

#[tokio::test]
async fn test_s2_mixed_batch_with_correctable_error() {
    let llm = ScriptedLlm::new();
    llm.push("planner", initial_plan(&["subtask_a", "subtask_b"]));
    // Per-subtask executor scripts keep the concurrent batch deterministic.
    llm.push("executor:subtask_a", exec_reply("1", "probe", false));
    llm.push("executor:subtask_a", done_reply());
    llm.push("executor:subtask_b", exec_reply("1", "scan", false));
    llm.push("executor:subtask_b", done_reply());
    llm.push("reflector", reflection_reply("COMPLETED"));
    llm.push("reflector", reflection_reply("COMPLETED"));
    llm.push("planner", json!({"graph_operations": []}));

    let tools = ScriptedTools::new();
    // subtask_a's probe succeeds; subtask_b's scan returns a correctable
    // SYNTAX fault, so that executor loops with a correction turn and then
    // finishes with its queued done reply.
    tools.push_result("probe", json!({"success": true}));
    tools.push_result(
        "scan",
        json!({"success": false, "error_type": "SYNTAX", "message": "bad params"}),
    );

    let (mut orchestrator, graph) =
        orchestrator_under_test("s2_mixed", "G", llm.clone(), tools.clone());
    let outcome = orchestrator.run().await;
    assert!(!outcome.success);

    let guard = graph.lock().await;
    // Step ids are disjoint because raw ids are prefixed per subtask.
    assert!(guard.has_node("subtask_a_1"));
    assert!(guard.has_node("subtask_b_1"));
    assert_eq!(tools.invocation_count("probe"), 1);
    assert_eq!(tools.invocation_count("scan"), 1);
    // subtask_b's failed step was marked failed before the correction turn.
    let (_, failed) = guard.step_view("subtask_b_1").unwrap();
    assert!(failed);
    // Both executors ultimately completed their subtasks.
    assert_eq!(guard.subtask("subtask_a").unwrap().status, SubtaskStatus::Completed);
    assert_eq!(guard.subtask("subtask_b").unwrap().status, SubtaskStatus::Completed);
}

#[tokio::test]
async fn test_s3_deprecation_creates_stalled_orphan() {
    let graph = test_graph("s3_orphan", "G");
    {
        let mut guard = graph.lock().await;
        guard.add_subtask(Subtask::new("x", "base"), &[]);
        guard.add_subtask(Subtask::new("y", "dependent"), &["x".to_string()]);
    }

    // Planner batch deprecates x without handling y.
    let ops = vec![GraphOp::from_value(&json!({
        "command": "UPDATE_NODE",
        "node_id": "x",
        "updates": {"status": "deprecated"}
    }))
    .unwrap()];

    let mut guard = graph.lock().await;
    let verified = verify_and_handle_orphans(&guard, ops);
    assert_eq!(verified.len(), 2, "repair op appended");
    process_graph_commands(&mut guard, &verified);

    assert_eq!(guard.subtask("x").unwrap().status, SubtaskStatus::Deprecated);
    assert_eq!(
        guard.subtask("y").unwrap().status,
        SubtaskStatus::StalledOrphan
    );
}

#[tokio::test]
async fn test_orphan_not_forced_when_batch_touches_it() {
    let graph = test_graph("s3_touched", "G");
    {
        let mut guard = graph.lock().await;
        guard.add_subtask(Subtask::new("x", "base"), &[]);
        guard.add_subtask(Subtask::new("y", "dependent"), &["x".to_string()]);
    }
    let ops = vec![
        GraphOp::from_value(&json!({
            "command": "DEPRECATE_NODE", "node_id": "x", "reason": "obsolete"
        }))
        .unwrap(),
        GraphOp::from_value(&json!({
            "command": "UPDATE_NODE", "node_id": "y",
            "updates": {"description": "rewired"}
        }))
        .unwrap(),
    ];
    let mut guard = graph.lock().await;
    let verified = verify_and_handle_orphans(&guard, ops);
    assert_eq!(verified.len(), 2, "no repair op needed");
    process_graph_commands(&mut guard, &verified);
    assert_ne!(
        guard.subtask("y").unwrap().status,
        SubtaskStatus::StalledOrphan
    );
}

#[tokio::test]
async fn test_batch_application_is_idempotent() {
    let graph = test_graph("idempotent", "G");
    let ops: Vec<GraphOp> = [
        json!({"command": "ADD_NODE", "node_data": {"id": "a", "description": "first", "priority": 2}}),
        json!({"command": "ADD_NODE", "node_data": {"id": "b", "description": "second", "dependencies": ["a"]}}),
        json!({"command": "UPDATE_NODE", "node_id": "a", "updates": {"priority": 5}}),
        json!({"command": "DEPRECATE_NODE", "node_id": "b", "reason": "r"}),
    ]
    .iter()
    .filter_map(GraphOp::from_value)
    .collect();

    let mut guard = graph.lock().await;
    process_graph_commands(&mut guard, &ops);
    let snapshot_1: Vec<(String, SubtaskStatus, i64)> = ["a", "b"]
        .iter()
        .map(|id| {
            let s = guard.subtask(id).unwrap();
            (s.id.clone(), s.status, s.priority)
        })
        .collect();

    process_graph_commands(&mut guard, &ops);
    let snapshot_2: Vec<(String, SubtaskStatus, i64)> = ["a", "b"]
        .iter()
        .map(|id| {
            let s = guard.subtask(id).unwrap();
            (s.id.clone(), s.status, s.priority)
        })
        .collect();

    assert_eq!(snapshot_1, snapshot_2);
    assert_eq!(guard.subtask("a").unwrap().priority, 5);
    assert_eq!(guard.subtask("b").unwrap().status, SubtaskStatus::Deprecated);
}

#[tokio::test]
async fn test_completed_to_deprecated_rejected_with_warning() {
    let graph = test_graph("protect", "G");
    let mut guard = graph.lock().await;
    guard.add_subtask(Subtask::new("done", "finished work"), &[]);
    let mut updates = Map::new();
    updates.insert("status".into(), Value::String("completed".into()));
    guard.update_node("done", &updates);

    let ops = vec![GraphOp::from_value(&json!({
        "command": "UPDATE_NODE", "node_id": "done",
        "updates": {"status": "deprecated"}
    }))
    .unwrap()];
    process_graph_commands(&mut guard, &ops);

    let subtask = guard.subtask("done").unwrap();
    assert_eq!(subtask.status, SubtaskStatus::Completed, "post-state still completed");
    assert!(
        subtask.warnings.iter().any(|w| w.contains("deprecate")),
        "warning entry present"
    );
}

#[tokio::test]
async fn test_planner_fallback_on_unusable_initial_reply() {
    let llm = ScriptedLlm::new();
    // No planner reply queued at all: the transport errors and the planner
    // falls back to a reconnaissance subtask, which then stalls (no
    // executor replies) and the session drains.
    llm.push("executor", done_reply());
    llm.push("reflector", reflection_reply("FAILED"));
    llm.push("planner", json!({"graph_operations": []}));

    let tools = ScriptedTools::new();
    let (mut orchestrator, graph) =
        orchestrator_under_test("fallback", "inspect the target", llm, tools);
    let outcome = orchestrator.run().await;
    assert!(!outcome.success);
    let guard = graph.lock().await;
    let subtask = guard.subtask("subtask_1").expect("fallback subtask exists");
    assert!(subtask.description.contains("reconnaissance"));
}

#[tokio::test]
async fn test_failed_reflection_marks_subtask_failed() {
    let llm = ScriptedLlm::new();
    llm.push("planner", initial_plan(&["subtask_1"]));
    llm.push("executor", done_reply());
    // Reflector reply is unusable: the fallback FAILED audit is authoritative.
    llm.push("reflector", json!({"nonsense": true}));
    llm.push("planner", json!({"graph_operations": []}));

    let tools = ScriptedTools::new();
    let (mut orchestrator, graph) =
        orchestrator_under_test("reflect_fail", "G", llm, tools);
    let _ = orchestrator.run().await;

    let guard = graph.lock().await;
    // The executor said completed, but the reflector's verdict wins.
    assert_eq!(guard.subtask("subtask_1").unwrap().status, SubtaskStatus::Failed);
}
