//! Prompt renderers.
//!
//! The engine fixes only the *shape* of what is exchanged with the LLM
//! (system-first, role-tagged, one reply per turn, JSON contracts); the
//! wording here is a default rendering. The executor system prompt is
//! rebuilt every turn from live graph state.

use serde_json::Value;

use crate::domain::ports::ToolInfo;
use crate::services::graph::{FailurePatterns, PromptContext};

/// Render the failure-pattern section shared by planner and executor.
pub fn render_failure_patterns(patterns: &FailurePatterns) -> String {
    if patterns.is_empty() {
        return "No failure patterns detected.".to_string();
    }
    let mut lines = Vec::new();
    if !patterns.contradiction_clusters.is_empty() {
        lines.push("Contradiction clusters:".to_string());
        for cluster in &patterns.contradiction_clusters {
            lines.push(format!(
                "- {} ({}) conflicts with: {}",
                cluster.node_id,
                cluster.description,
                cluster.related.join(", ")
            ));
        }
    }
    if !patterns.stalled_hypotheses.is_empty() {
        lines.push("Stalled hypotheses:".to_string());
        for stalled in &patterns.stalled_hypotheses {
            lines.push(format!(
                "- {} ({}): {} [age {}s]",
                stalled.id, stalled.description, stalled.reason, stalled.age_seconds
            ));
        }
    }
    if !patterns.competing_hypotheses.is_empty() {
        lines.push("Competing hypotheses needing disambiguation:".to_string());
        for competing in &patterns.competing_hypotheses {
            lines.push(format!(
                "- evidence {} supports {} hypotheses: {}",
                competing.evidence_id,
                competing.hypothesis_ids.len(),
                competing.hypothesis_ids.join(", ")
            ));
        }
    }
    lines.join("\n")
}

/// Render the tool catalog for the executor prompt.
pub fn render_tool_catalog(tools: &[ToolInfo]) -> String {
    if tools.is_empty() {
        return "No tools are currently available.".to_string();
    }
    let mut lines = vec!["## Available tools".to_string()];
    for tool in tools {
        lines.push(format!(
            "- {}: {}\n  arguments: {}",
            tool.name,
            if tool.description.is_empty() { "(no description)" } else { &tool.description },
            tool.input_schema
        ));
    }
    lines.push(
        "Call tools through execution_operations entries: \
         {\"command\": \"EXECUTE_NOW\", \"node_id\": \"<short id>\", \"thought\": \"...\", \
         \"action\": {\"tool\": \"<name>\", \"params\": {...}}}."
            .to_string(),
    );
    lines.join("\n")
}

/// Initial planning prompt.
pub fn planner_prompt(goal: &str, causal_graph_summary: &str) -> String {
    format!(
        "You are the strategic planner of an autonomous task-execution agent.\n\n\
         ## Goal\n{goal}\n\n\
         ## Current causal knowledge\n{causal_graph_summary}\n\n\
         Decompose the goal into an initial batch of subtasks as graph operations.\n\
         Reply with a single JSON object:\n\
         {{\"graph_operations\": [{{\"command\": \"ADD_NODE\", \"node_data\": {{\"id\": \"subtask_1\", \
         \"description\": \"...\", \"dependencies\": [], \"priority\": 1, \
         \"completion_criteria\": \"...\"}}}}]}}\n\
         Output ONLY the JSON object."
    )
}

/// Dynamic replanning prompt.
#[allow(clippy::too_many_arguments)]
pub fn dynamic_planner_prompt(
    goal: &str,
    graph_summary: &str,
    intelligence_summary: &str,
    causal_graph_summary: &str,
    attack_path_summary: &str,
    failure_patterns: &FailurePatterns,
    failed_tasks_summary: &str,
) -> String {
    let mut prompt = format!(
        "You are the strategic planner of an autonomous task-execution agent, \
         revising the plan after a batch of subtasks finished.\n\n\
         ## Goal\n{goal}\n\n\
         ## Task graph\n{graph_summary}\n\n\
         ## Intelligence from the reflector\n```json\n{intelligence_summary}\n```\n\n\
         ## Causal knowledge\n{causal_graph_summary}\n\n\
         ## Attack paths\n{attack_path_summary}\n\n\
         ## Failure patterns\n{}\n",
        render_failure_patterns(failure_patterns)
    );
    if !failed_tasks_summary.is_empty() {
        prompt.push_str(&format!(
            "\n## Priority: failed or blocked tasks\nAddress these first with diagnostic or \
             alternative subtasks.\n{failed_tasks_summary}\n"
        ));
    }
    prompt.push_str(
        "\nReply with a single JSON object containing `graph_operations` (ADD_NODE, \
         UPDATE_NODE, DEPRECATE_NODE, DELETE_NODE), a `global_mission_briefing` string, and \
         `global_mission_accomplished` (boolean, true only when the goal is demonstrably \
         achieved). Output ONLY the JSON object.",
    );
    prompt
}

/// Branch regeneration prompt.
pub fn branch_replan_prompt(
    original_branch_goal: &str,
    failure_reason: &str,
    dead_end_tasks: &[String],
) -> String {
    format!(
        "A branch of the plan has failed and must be replaced.\n\n\
         ## Failed branch objective\n{original_branch_goal}\n\n\
         ## Failure reason\n{failure_reason}\n\n\
         ## Dead-end tasks (do not revive these)\n{}\n\n\
         Produce a replacement sub-plan as a JSON object with `graph_operations`. Deprecate \
         the dead-end tasks and add alternative subtasks approaching the objective \
         differently. Output ONLY the JSON object.",
        dead_end_tasks.join(", ")
    )
}

/// Executor system prompt, rebuilt each turn from live graph context.
pub fn executor_system_prompt(
    main_goal: &str,
    global_mission_briefing: &str,
    context: &PromptContext,
    tools: &[ToolInfo],
) -> String {
    let causal_context =
        serde_json::to_string_pretty(&context.causal_context).unwrap_or_default();
    let dependencies = if context.dependencies.is_empty() {
        "No dependency context.".to_string()
    } else {
        context
            .dependencies
            .iter()
            .map(|dep| {
                format!(
                    "- {} [{}]: {}{}",
                    dep.id,
                    dep.status,
                    dep.summary.as_deref().unwrap_or("(no summary)"),
                    dep.failure_reason
                        .as_ref()
                        .map(|r| format!(" (failed: {r})"))
                        .unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let key_facts = if context.key_facts.is_empty() {
        "None recorded yet.".to_string()
    } else {
        context
            .key_facts
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are the executor of an autonomous task-execution agent. You explore one \
         subtask through thought-act-observe turns, calling tools in parallel when useful.\n\n\
         ## Mission\n{main_goal}\n\n\
         ## Mission briefing\n{global_mission_briefing}\n\n\
         ## Current subtask: {}\n{}\n\
         Completion criteria: {}\n\n\
         ## Key facts\n{key_facts}\n\n\
         ## Dependency outcomes\n{dependencies}\n\n\
         ## Causal context\n{causal_context}\n\n\
         ## Failure patterns\n{}\n\n\
         {}\n\n\
         Each turn, reply with a single JSON object shaped:\n\
         {{\"previous_steps_status\": {{\"<step_id>\": \"completed|failed\"}},\n\
          \"thought\": \"...\",\n\
          \"execution_operations\": [{{\"command\": \"EXECUTE_NOW\", \"node_id\": \"1\", \
          \"thought\": \"...\", \"action\": {{\"tool\": \"...\", \"params\": {{}}}}}}],\n\
          \"staged_causal_nodes\": [],\n\
          \"hypothesis_update\": {{\"observation_summary\": \"...\"}},\n\
          \"is_subtask_complete\": false}}\n\
         Set is_subtask_complete to true only when the completion criteria are met.",
        context.subtask_id,
        context.description,
        if context.completion_criteria.is_empty() {
            "N/A"
        } else {
            &context.completion_criteria
        },
        render_failure_patterns(&context.causal_context.failure_patterns),
        render_tool_catalog(tools),
    )
}

/// Reflector audit prompt for one finished subtask.
pub fn reflector_prompt(
    subtask_description: &str,
    completion_criteria: &str,
    outcome: &str,
    execution_log: &str,
    staged_causal_nodes: &[Value],
    full_graph_summary: &str,
    dependency_context: &str,
    failure_patterns: &FailurePatterns,
) -> String {
    let staged = serde_json::to_string_pretty(staged_causal_nodes).unwrap_or_default();
    format!(
        "You are the reflector of an autonomous task-execution agent. Audit the finished \
         subtask below and validate its proposed causal nodes.\n\n\
         ## Subtask\n{subtask_description}\n\
         Completion criteria: {completion_criteria}\n\
         Executor outcome: {outcome}\n\n\
         ## Execution log\n{execution_log}\n\n\
         ## Staged causal nodes (unvalidated)\n```json\n{staged}\n```\n\n\
         ## Task graph\n{full_graph_summary}\n\n\
         ## Dependency context\n{dependency_context}\n\n\
         ## Failure patterns\n{}\n\n\
         Reply with a single JSON object shaped:\n\
         {{\"audit_result\": {{\"status\": \"GOAL_ACHIEVED|COMPLETED|PARTIAL_SUCCESS|FAILED\", \
         \"completion_check\": \"...\", \"methodology_issues\": [], \"logic_issues\": []}},\n\
          \"key_findings\": [\"...\"],\n\
          \"validated_nodes\": [],\n\
          \"insight\": null,\n\
          \"causal_graph_updates\": {{\"nodes\": [], \"edges\": []}}}}\n\
         Only validate staged nodes genuinely supported by the log. Output ONLY the JSON \
         object.",
        render_failure_patterns(failure_patterns)
    )
}

/// Yes/no completion validation prompt.
pub fn completion_validation_prompt(completion_criteria: &str, execution_log: &str) -> String {
    format!(
        "You are a strict audit assistant.\n\
         - The completion criteria are: \"{completion_criteria}\"\n\
         - The execution log is: \"{execution_log}\"\n\n\
         Based on the log, have the criteria been met clearly and unambiguously?\n\
         Answer only \"true\" or \"false\"."
    )
}

/// Global reflection prompt over the simplified success subgraph.
pub fn global_reflection_prompt(simplified_graph: &Value) -> String {
    let graph = serde_json::to_string_pretty(simplified_graph).unwrap_or_default();
    format!(
        "You are the chief strategist of an autonomous task-execution agent. A mission \
         succeeded; distill a reusable strategy-tactic-applicability record from its \
         successful trajectory.\n\n\
         ## Simplified successful trajectory\n```json\n{graph}\n```\n\n\
         Reply with a single JSON object shaped:\n\
         {{\"global_summary\": \"one-sentence account of the winning path\",\n\
          \"strategic_analysis\": \"...\",\n\
          \"global_insight\": {{\"strategic_principle\": \"...\",\n\
          \"tactical_playbook\": [\"step\", \"step\"],\n\
          \"applicability\": [\"tag\"]}}}}\n\
         Output ONLY the JSON object."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::graph::FailurePatterns;

    #[test]
    fn test_empty_failure_patterns_render() {
        let rendered = render_failure_patterns(&FailurePatterns::default());
        assert_eq!(rendered, "No failure patterns detected.");
    }

    #[test]
    fn test_tool_catalog_render() {
        let tools = vec![ToolInfo {
            name: "http_probe".into(),
            description: "probe a URL".into(),
            input_schema: serde_json::json!({"type": "object"}),
            server: "recon".into(),
        }];
        let rendered = render_tool_catalog(&tools);
        assert!(rendered.contains("http_probe"));
        assert!(rendered.contains("EXECUTE_NOW"));
    }

    #[test]
    fn test_planner_prompt_mentions_goal() {
        let prompt = planner_prompt("capture the flag", "empty");
        assert!(prompt.contains("capture the flag"));
        assert!(prompt.contains("graph_operations"));
    }
}
