//! Planner graph operations.
//!
//! The planner replies with a batch of graph operations as loose JSON. This
//! module gives that batch a typed shape while tolerating the usual LLM
//! sloppiness: unknown commands are passed through untouched so downstream
//! code can decide what to do with them.

use serde_json::{Map, Value};

/// Payload of an ADD_NODE operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AddNodeData {
    pub id: String,
    pub description: String,
    pub dependencies: Vec<String>,
    pub priority: i64,
    pub reason: String,
    pub completion_criteria: String,
    pub mission_briefing: Option<Value>,
    /// Initial status requested by the planner, validated on application
    pub status: Option<String>,
}

/// One graph operation from a planner batch.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOp {
    AddNode(AddNodeData),
    UpdateNode {
        node_id: String,
        updates: Map<String, Value>,
    },
    DeleteNode {
        node_id: String,
        reason: String,
    },
    DeprecateNode {
        node_id: String,
        reason: String,
    },
    /// Anything we do not recognize; preserved verbatim
    Unknown(Value),
}

impl GraphOp {
    /// Parse a single operation object. Returns None for operations that
    /// are structurally unusable (ADD_NODE without an id, UPDATE/DELETE
    /// without a node_id, UPDATE with no updates).
    pub fn from_value(value: &Value) -> Option<Self> {
        let command = value.get("command").and_then(Value::as_str).unwrap_or("");
        match command {
            "ADD_NODE" => {
                let node_data = value.get("node_data")?;
                let id = node_data.get("id").and_then(Value::as_str)?;
                if id.is_empty() || id == "None" {
                    return None;
                }
                let dependencies = node_data
                    .get("dependencies")
                    .and_then(Value::as_array)
                    .map(|deps| {
                        deps.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Self::AddNode(AddNodeData {
                    id: id.to_string(),
                    description: node_data
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    dependencies,
                    priority: node_data.get("priority").and_then(Value::as_i64).unwrap_or(1),
                    reason: node_data
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    completion_criteria: node_data
                        .get("completion_criteria")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                    mission_briefing: node_data.get("mission_briefing").cloned(),
                    status: node_data
                        .get("status")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }))
            }
            "UPDATE_NODE" => {
                let node_id = value.get("node_id").and_then(Value::as_str)?;
                if node_id.is_empty() {
                    return None;
                }
                let updates = value.get("updates").and_then(Value::as_object)?;
                if updates.is_empty() {
                    return None;
                }
                Some(Self::UpdateNode {
                    node_id: node_id.to_string(),
                    updates: updates.clone(),
                })
            }
            "DELETE_NODE" | "DEPRECATE_NODE" => {
                let node_id = value.get("node_id").and_then(Value::as_str)?;
                if node_id.is_empty() {
                    return None;
                }
                let reason = value
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("no reason given")
                    .to_string();
                if command == "DELETE_NODE" {
                    Some(Self::DeleteNode { node_id: node_id.to_string(), reason })
                } else {
                    Some(Self::DeprecateNode { node_id: node_id.to_string(), reason })
                }
            }
            _ => Some(Self::Unknown(value.clone())),
        }
    }

    /// Render the operation back into its canonical JSON shape, e.g. for
    /// approval payloads shown to a human.
    pub fn to_value(&self) -> Value {
        match self {
            Self::AddNode(data) => {
                let mut node_data = serde_json::json!({
                    "id": data.id,
                    "description": data.description,
                    "dependencies": data.dependencies,
                    "priority": data.priority,
                });
                if !data.reason.is_empty() {
                    node_data["reason"] = Value::String(data.reason.clone());
                }
                if !data.completion_criteria.is_empty() {
                    node_data["completion_criteria"] =
                        Value::String(data.completion_criteria.clone());
                }
                if let Some(briefing) = &data.mission_briefing {
                    node_data["mission_briefing"] = briefing.clone();
                }
                if let Some(status) = &data.status {
                    node_data["status"] = Value::String(status.clone());
                }
                serde_json::json!({"command": "ADD_NODE", "node_data": node_data})
            }
            Self::UpdateNode { node_id, updates } => serde_json::json!({
                "command": "UPDATE_NODE",
                "node_id": node_id,
                "updates": Value::Object(updates.clone()),
            }),
            Self::DeleteNode { node_id, reason } => serde_json::json!({
                "command": "DELETE_NODE", "node_id": node_id, "reason": reason,
            }),
            Self::DeprecateNode { node_id, reason } => serde_json::json!({
                "command": "DEPRECATE_NODE", "node_id": node_id, "reason": reason,
            }),
            Self::Unknown(value) => value.clone(),
        }
    }

    /// Node id this operation targets, if it targets one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::AddNode(data) => Some(&data.id),
            Self::UpdateNode { node_id, .. }
            | Self::DeleteNode { node_id, .. }
            | Self::DeprecateNode { node_id, .. } => Some(node_id),
            Self::Unknown(_) => None,
        }
    }

    /// Whether this operation retires its target node.
    pub fn deprecates(&self) -> bool {
        match self {
            Self::DeleteNode { .. } | Self::DeprecateNode { .. } => true,
            Self::UpdateNode { updates, .. } => {
                updates.get("status").and_then(Value::as_str) == Some("deprecated")
            }
            _ => false,
        }
    }
}

/// A full planner reply.
#[derive(Debug, Clone, Default)]
pub struct PlanData {
    pub graph_operations: Vec<GraphOp>,
    pub global_mission_briefing: Option<String>,
    pub global_mission_accomplished: bool,
    /// Free-form reasoning blob, kept for the run log
    pub reasoning: Value,
}

impl PlanData {
    /// Parse a planner reply object. Fails when `graph_operations` is
    /// absent, which is the planner contract violation the fallback path
    /// handles.
    pub fn from_value(value: &Value) -> Option<Self> {
        let raw_ops = value.get("graph_operations")?.as_array()?;
        let graph_operations = raw_ops.iter().filter_map(GraphOp::from_value).collect();
        Some(Self {
            graph_operations,
            global_mission_briefing: value
                .get("global_mission_briefing")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            global_mission_accomplished: value
                .get("global_mission_accomplished")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            reasoning: value.get("reasoning").cloned().unwrap_or(Value::Null),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_add_node() {
        let op = GraphOp::from_value(&json!({
            "command": "ADD_NODE",
            "node_data": {
                "id": "subtask_1",
                "description": "enumerate services",
                "dependencies": [],
                "priority": 2
            }
        }))
        .unwrap();
        match op {
            GraphOp::AddNode(data) => {
                assert_eq!(data.id, "subtask_1");
                assert_eq!(data.priority, 2);
                assert!(data.dependencies.is_empty());
            }
            other => panic!("expected AddNode, got {other:?}"),
        }
    }

    #[test]
    fn test_add_node_without_id_is_dropped() {
        assert!(GraphOp::from_value(&json!({
            "command": "ADD_NODE",
            "node_data": {"description": "no id"}
        }))
        .is_none());
        assert!(GraphOp::from_value(&json!({
            "command": "ADD_NODE",
            "node_data": {"id": "None"}
        }))
        .is_none());
    }

    #[test]
    fn test_update_without_updates_is_dropped() {
        assert!(GraphOp::from_value(&json!({
            "command": "UPDATE_NODE",
            "node_id": "subtask_1",
            "updates": {}
        }))
        .is_none());
    }

    #[test]
    fn test_unknown_command_passes_through() {
        let raw = json!({"command": "REWIRE_EVERYTHING", "node_id": "x"});
        let op = GraphOp::from_value(&raw).unwrap();
        assert_eq!(op, GraphOp::Unknown(raw));
    }

    #[test]
    fn test_deprecates_detection() {
        let update = GraphOp::from_value(&json!({
            "command": "UPDATE_NODE",
            "node_id": "x",
            "updates": {"status": "deprecated"}
        }))
        .unwrap();
        assert!(update.deprecates());

        let delete = GraphOp::from_value(&json!({
            "command": "DELETE_NODE",
            "node_id": "x"
        }))
        .unwrap();
        assert!(delete.deprecates());

        let benign = GraphOp::from_value(&json!({
            "command": "UPDATE_NODE",
            "node_id": "x",
            "updates": {"priority": 3}
        }))
        .unwrap();
        assert!(!benign.deprecates());
    }

    #[test]
    fn test_plan_data_requires_operations_key() {
        assert!(PlanData::from_value(&json!({"thoughts": "hm"})).is_none());
        let plan = PlanData::from_value(&json!({
            "graph_operations": [],
            "global_mission_accomplished": true
        }))
        .unwrap();
        assert!(plan.global_mission_accomplished);
        assert!(plan.graph_operations.is_empty());
    }
}
