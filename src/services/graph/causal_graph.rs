//! Causal inference graph.
//!
//! Stores evidence, hypotheses and vulnerability knowledge with labelled
//! edges, and propagates hypothesis confidence non-monotonically:
//! NECESSARY evidence decides a hypothesis outright (and latches it);
//! CONTINGENT evidence accumulates through a logit update.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::error::GraphError;
use crate::domain::models::{
    CausalNode, CausalNodeType, CausalStatus, EdgeLabel, EvidenceStrength,
};

/// Contingent logit deltas.
const SUPPORTS_DELTA: f64 = 0.4;
const CONTRADICTS_DELTA: f64 = -0.5;

/// A stored causal edge.
#[derive(Debug, Clone)]
pub struct StoredCausalEdge {
    pub source: String,
    pub target: String,
    pub label: EdgeLabel,
    pub evidence_strength: Option<String>,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
}

/// One node on a scored attack path.
#[derive(Debug, Clone, Serialize)]
pub struct PathNode {
    pub id: String,
    pub node_type: String,
    pub description: String,
}

/// An Evidence → Vulnerability path with its score.
#[derive(Debug, Clone, Serialize)]
pub struct AttackPath {
    pub path: Vec<PathNode>,
    pub score: f64,
}

/// A hypothesis with multiple contradicting evidences, or an evidence
/// contradicting multiple hypotheses.
#[derive(Debug, Clone, Serialize)]
pub struct ContradictionCluster {
    pub node_id: String,
    pub description: String,
    pub related: Vec<String>,
}

/// A hypothesis nothing has moved for too long.
#[derive(Debug, Clone, Serialize)]
pub struct StalledHypothesis {
    pub id: String,
    pub description: String,
    pub confidence: Option<f64>,
    pub status: String,
    pub reason: String,
    pub age_seconds: i64,
}

/// Evidence that supports several hypotheses at once.
#[derive(Debug, Clone, Serialize)]
pub struct CompetingHypotheses {
    pub evidence_id: String,
    pub evidence_description: String,
    pub hypothesis_ids: Vec<String>,
}

/// The three failure-pattern families the planner reacts to.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailurePatterns {
    pub contradiction_clusters: Vec<ContradictionCluster>,
    pub stalled_hypotheses: Vec<StalledHypothesis>,
    pub competing_hypotheses: Vec<CompetingHypotheses>,
}

impl FailurePatterns {
    pub fn is_empty(&self) -> bool {
        self.contradiction_clusters.is_empty()
            && self.stalled_hypotheses.is_empty()
            && self.competing_hypotheses.is_empty()
    }
}

/// Condensed causal context for one subtask's prompt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CausalContext {
    pub related_hypotheses: Vec<Value>,
    pub key_facts: Vec<String>,
    pub confirmed_vulnerabilities: Vec<Value>,
    pub top_attack_paths: Vec<Value>,
    pub failure_patterns: FailurePatterns,
}

/// The causal inference graph.
#[derive(Default)]
pub struct CausalGraph {
    nodes: BTreeMap<String, CausalNode>,
    edges: Vec<StoredCausalEdge>,
}

impl CausalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_node(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node(&self, id: &str) -> Option<&CausalNode> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &CausalNode> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[StoredCausalEdge] {
        &self.edges
    }

    /// Deterministic permanent id: a digest of the producing step and the
    /// raw output, suffixed with the node type.
    pub fn deterministic_id(source_step_id: &str, raw_output: &str, node_type: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_step_id.as_bytes());
        hasher.update(b"-");
        hasher.update(raw_output.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        format!("art_{hex}__{node_type}")
    }

    /// Insert a node described by a loose JSON artifact. A supplied id
    /// wins; otherwise the deterministic id is derived. Existing nodes are
    /// not overwritten. Returns the permanent id.
    pub fn add_node_from_value(&mut self, artifact: &Value) -> String {
        let node_type = artifact
            .get("node_type")
            .or_else(|| artifact.get("type"))
            .and_then(Value::as_str)
            .map_or(CausalNodeType::Unknown, CausalNodeType::from_str);

        let source_step_id = artifact
            .get("source_step_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let raw_output = artifact
            .get("raw_output")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let id = artifact
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty() && *s != "None")
            .map_or_else(
                || {
                    Self::deterministic_id(
                        source_step_id.as_deref().unwrap_or(""),
                        &raw_output,
                        node_type.as_str(),
                    )
                },
                str::to_string,
            );

        if self.nodes.contains_key(&id) {
            return id;
        }

        let mut node = CausalNode::new(
            id.clone(),
            node_type,
            artifact
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        );
        node.source_step_id = source_step_id;
        node.confidence = artifact.get("confidence").and_then(Value::as_f64);
        node.cvss_score = artifact.get("cvss_score").and_then(Value::as_f64);
        node.raw_output = if raw_output.is_empty() { None } else { Some(raw_output) };
        node.data = artifact.get("data").cloned().unwrap_or(Value::Null);
        if let Some(status) = artifact
            .get("status")
            .and_then(Value::as_str)
            .and_then(CausalStatus::from_str)
        {
            node.status = status;
        }
        if node_type == CausalNodeType::ConfirmedVulnerability {
            node.confidence = Some(node.confidence.unwrap_or(0.99));
            if node.status == CausalStatus::Pending {
                node.status = CausalStatus::Confirmed;
            }
        }
        self.nodes.insert(id.clone(), node);
        id
    }

    /// Add a deduplicated key fact; the id is derived from the content.
    pub fn add_key_fact(&mut self, fact: &str) -> Option<String> {
        let content = fact.trim();
        if content.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        let id = format!("key_fact_{hex}");
        if !self.nodes.contains_key(&id) {
            self.nodes
                .insert(id.clone(), CausalNode::new(id.clone(), CausalNodeType::KeyFact, content));
        }
        Some(id)
    }

    /// Every key fact description currently known.
    pub fn key_facts(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.node_type == CausalNodeType::KeyFact)
            .map(|n| n.description.clone())
            .collect()
    }

    /// Insert an edge. Both endpoints must exist (invariant: no dangling
    /// causal edges); self-loops are dropped silently.
    pub fn add_edge(
        &mut self,
        source: &str,
        target: &str,
        raw_label: &str,
        evidence_strength: Option<String>,
        description: Option<String>,
    ) -> Result<Option<EdgeLabel>, GraphError> {
        if source == target {
            return Ok(None);
        }
        if !self.nodes.contains_key(source) {
            return Err(GraphError::CausalEndpointNotFound(source.to_string()));
        }
        if !self.nodes.contains_key(target) {
            return Err(GraphError::CausalEndpointNotFound(target.to_string()));
        }
        let label = EdgeLabel::normalize(raw_label);
        self.edges.push(StoredCausalEdge {
            source: source.to_string(),
            target: target.to_string(),
            label,
            evidence_strength,
            description,
            created_at: Utc::now(),
        });
        Ok(Some(label))
    }

    /// Non-monotonic confidence propagation for the edge that just landed
    /// on `target`.
    ///
    /// NECESSARY evidence decides: SUPPORTS pins confidence to 1.0 and
    /// CONFIRMED, CONTRADICTS pins to 0.0 and FALSIFIED, and either
    /// latches the node so later contingent edges cannot move it.
    /// CONTINGENT evidence shifts the logit by +0.4 / −0.5 with the result
    /// clamped to [0.05, 0.95].
    ///
    /// A ConfirmedVulnerability absorbs CONTRADICTS without losing
    /// confidence; it is flagged for re-evaluation instead.
    pub fn propagate_confidence(
        &mut self,
        target: &str,
        label: EdgeLabel,
        strength_annotation: Option<&str>,
    ) {
        let Some(node) = self.nodes.get_mut(target) else { return };

        if node.node_type == CausalNodeType::ConfirmedVulnerability {
            if label == EdgeLabel::Contradicts {
                node.re_evaluation_needed = true;
                node.status = CausalStatus::ReEvaluationPending;
                tracing::info!(node_id = %target, "confirmed vulnerability flagged for re-evaluation");
            }
            return;
        }
        if node.node_type != CausalNodeType::Hypothesis {
            return;
        }
        if !matches!(label, EdgeLabel::Supports | EdgeLabel::Contradicts) {
            return;
        }

        let current = node.confidence.unwrap_or(0.5);
        let strength = EvidenceStrength::classify(strength_annotation);

        match strength {
            EvidenceStrength::Necessary => {
                if label == EdgeLabel::Contradicts {
                    node.confidence = Some(0.0);
                    node.status = CausalStatus::Falsified;
                } else {
                    node.confidence = Some(1.0);
                    node.status = CausalStatus::Confirmed;
                }
                node.decisively_settled = true;
                tracing::info!(
                    node_id = %target,
                    label = label.as_str(),
                    confidence = node.confidence.unwrap_or_default(),
                    "hypothesis decided by necessary evidence"
                );
            }
            EvidenceStrength::Contingent => {
                if node.decisively_settled {
                    tracing::debug!(
                        node_id = %target,
                        "contingent update ignored, hypothesis decisively settled"
                    );
                    return;
                }
                let delta = if label == EdgeLabel::Supports {
                    SUPPORTS_DELTA
                } else {
                    CONTRADICTS_DELTA
                };
                let clamped = current.clamp(0.01, 0.99);
                let logit = (clamped / (1.0 - clamped)).ln();
                let updated = 1.0 / (1.0 + (-(logit + delta)).exp());
                node.confidence = Some(updated.clamp(0.05, 0.95));
                node.status = if label == EdgeLabel::Supports {
                    CausalStatus::Supported
                } else {
                    CausalStatus::Contradicted
                };
                tracing::debug!(
                    node_id = %target,
                    from = current,
                    to = node.confidence.unwrap_or_default(),
                    label = label.as_str(),
                    "contingent confidence update"
                );
            }
        }
    }

    fn successors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a StoredCausalEdge> {
        self.edges.iter().filter(move |e| e.source == id)
    }

    fn predecessors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a StoredCausalEdge> {
        self.edges.iter().filter(move |e| e.target == id)
    }

    // ---- attack paths ---------------------------------------------------

    /// All simple Evidence → Vulnerability paths, scored by the product of
    /// on-path hypothesis confidences times CVSS/10. Sorted by score
    /// descending, then fewer hops, then lexicographic path id.
    pub fn attack_paths(&self) -> Vec<AttackPath> {
        let evidence: Vec<&String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.node_type == CausalNodeType::Evidence)
            .map(|(id, _)| id)
            .collect();
        let vulnerabilities: Vec<&String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.node_type.is_vulnerability())
            .map(|(id, _)| id)
            .collect();
        if evidence.is_empty() || vulnerabilities.is_empty() {
            return Vec::new();
        }

        let mut paths = Vec::new();
        for source in &evidence {
            for target in &vulnerabilities {
                let mut stack = vec![(*source).clone()];
                let mut visited: HashSet<String> = HashSet::from([(*source).clone()]);
                self.collect_simple_paths(source, target, &mut stack, &mut visited, &mut paths);
            }
        }

        let mut scored: Vec<AttackPath> = paths
            .into_iter()
            .map(|path| {
                let mut score = 1.0;
                let mut nodes = Vec::new();
                for id in &path {
                    let node = &self.nodes[id];
                    if node.node_type == CausalNodeType::Hypothesis {
                        score *= node.confidence.unwrap_or(0.1);
                    }
                    nodes.push(PathNode {
                        id: id.clone(),
                        node_type: node.node_type.as_str().to_string(),
                        description: node.description.clone(),
                    });
                }
                let cvss = self.nodes[path.last().expect("non-empty path")]
                    .cvss_score
                    .unwrap_or(0.0);
                AttackPath { path: nodes, score: score * (cvss / 10.0) }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path.len().cmp(&b.path.len()))
                .then_with(|| {
                    let key_a: Vec<&str> = a.path.iter().map(|p| p.id.as_str()).collect();
                    let key_b: Vec<&str> = b.path.iter().map(|p| p.id.as_str()).collect();
                    key_a.cmp(&key_b)
                })
        });
        scored
    }

    fn collect_simple_paths(
        &self,
        current: &str,
        target: &str,
        stack: &mut Vec<String>,
        visited: &mut HashSet<String>,
        out: &mut Vec<Vec<String>>,
    ) {
        if current == target {
            out.push(stack.clone());
            return;
        }
        let next: Vec<String> = self.successors(current).map(|e| e.target.clone()).collect();
        for successor in next {
            if visited.insert(successor.clone()) {
                stack.push(successor.clone());
                self.collect_simple_paths(&successor, target, stack, visited, out);
                stack.pop();
                visited.remove(&successor);
            }
        }
    }

    // ---- failure patterns ----------------------------------------------

    /// Analyze the graph for contradiction clusters, stalled hypotheses
    /// and competing hypotheses.
    pub fn failure_patterns(&self, stall_window_secs: i64) -> FailurePatterns {
        FailurePatterns {
            contradiction_clusters: self.contradiction_clusters(),
            stalled_hypotheses: self.stalled_hypotheses(stall_window_secs),
            competing_hypotheses: self.competing_hypotheses(),
        }
    }

    fn contradiction_clusters(&self) -> Vec<ContradictionCluster> {
        let mut clusters = Vec::new();
        for (id, node) in &self.nodes {
            match node.node_type {
                CausalNodeType::Hypothesis => {
                    let contradicting: Vec<String> = self
                        .predecessors(id)
                        .filter(|e| e.label == EdgeLabel::Contradicts)
                        .filter(|e| {
                            self.nodes
                                .get(&e.source)
                                .is_some_and(|n| n.node_type == CausalNodeType::Evidence)
                        })
                        .map(|e| e.source.clone())
                        .collect();
                    if contradicting.len() > 1 {
                        clusters.push(ContradictionCluster {
                            node_id: id.clone(),
                            description: node.description.clone(),
                            related: contradicting,
                        });
                    }
                }
                CausalNodeType::Evidence => {
                    let contradicted: Vec<String> = self
                        .successors(id)
                        .filter(|e| e.label == EdgeLabel::Contradicts)
                        .filter(|e| {
                            self.nodes
                                .get(&e.target)
                                .is_some_and(|n| n.node_type == CausalNodeType::Hypothesis)
                        })
                        .map(|e| e.target.clone())
                        .collect();
                    if contradicted.len() > 1 {
                        clusters.push(ContradictionCluster {
                            node_id: id.clone(),
                            description: node.description.clone(),
                            related: contradicted,
                        });
                    }
                }
                _ => {}
            }
        }
        clusters
    }

    fn stalled_hypotheses(&self, window_secs: i64) -> Vec<StalledHypothesis> {
        let now = Utc::now();
        let mut stalled = Vec::new();
        for (id, node) in &self.nodes {
            if node.node_type != CausalNodeType::Hypothesis {
                continue;
            }
            let age = (now - node.created_at).num_seconds();
            if node.status == CausalStatus::Falsified && !self.has_supporting_successor(id) {
                stalled.push(StalledHypothesis {
                    id: id.clone(),
                    description: node.description.clone(),
                    confidence: node.confidence,
                    status: node.status.as_str().to_string(),
                    reason: "falsified with no new supporting evidence".to_string(),
                    age_seconds: age,
                });
                continue;
            }
            if age > window_secs
                && matches!(node.status, CausalStatus::Pending | CausalStatus::Supported)
                && !self.has_newer_neighbor(id, node.created_at)
            {
                stalled.push(StalledHypothesis {
                    id: id.clone(),
                    description: node.description.clone(),
                    confidence: node.confidence,
                    status: node.status.as_str().to_string(),
                    reason: "no recent activity inside the stall window".to_string(),
                    age_seconds: age,
                });
            }
        }
        stalled
    }

    fn has_supporting_successor(&self, id: &str) -> bool {
        self.successors(id).any(|e| e.label == EdgeLabel::Supports)
    }

    fn has_newer_neighbor(&self, id: &str, created_at: chrono::DateTime<Utc>) -> bool {
        self.edges
            .iter()
            .filter(|e| e.source == id || e.target == id)
            .filter_map(|e| {
                let other = if e.source == id { &e.target } else { &e.source };
                self.nodes.get(other)
            })
            .any(|n| n.created_at > created_at)
    }

    fn competing_hypotheses(&self) -> Vec<CompetingHypotheses> {
        let mut competing = Vec::new();
        for (id, node) in &self.nodes {
            if node.node_type != CausalNodeType::Evidence {
                continue;
            }
            let hypotheses: Vec<String> = self
                .successors(id)
                .filter(|e| {
                    self.nodes
                        .get(&e.target)
                        .is_some_and(|n| n.node_type == CausalNodeType::Hypothesis)
                })
                .map(|e| e.target.clone())
                .collect();
            if hypotheses.len() >= 2 {
                competing.push(CompetingHypotheses {
                    evidence_id: id.clone(),
                    evidence_description: node.description.clone(),
                    hypothesis_ids: hypotheses,
                });
            }
        }
        competing
    }

    // ---- context & summaries -------------------------------------------

    /// Condensed causal context for a subtask prompt.
    pub fn relevant_context(
        &self,
        top_n_hypotheses: usize,
        top_n_paths: usize,
        stall_window_secs: i64,
    ) -> CausalContext {
        let mut hypotheses: Vec<&CausalNode> = self
            .nodes
            .values()
            .filter(|n| n.node_type == CausalNodeType::Hypothesis)
            .filter(|n| n.confidence.unwrap_or(0.0) > 0.7)
            .collect();
        hypotheses.sort_by(|a, b| {
            b.confidence
                .unwrap_or(0.0)
                .partial_cmp(&a.confidence.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let related_hypotheses = hypotheses
            .into_iter()
            .take(top_n_hypotheses)
            .map(|n| {
                serde_json::json!({
                    "id": n.id,
                    "description": n.description,
                    "confidence": n.confidence,
                    "status": n.status.as_str(),
                })
            })
            .collect();

        let confirmed_vulnerabilities = self
            .nodes
            .values()
            .filter(|n| {
                matches!(
                    n.node_type,
                    CausalNodeType::ConfirmedVulnerability | CausalNodeType::Vulnerability
                )
            })
            .map(|n| {
                serde_json::json!({
                    "id": n.id,
                    "description": n.description,
                    "cvss_score": n.cvss_score,
                })
            })
            .collect();

        let top_attack_paths = self
            .attack_paths()
            .into_iter()
            .take(top_n_paths)
            .map(|p| {
                let rendered: Vec<String> = p
                    .path
                    .iter()
                    .map(|n| format!("{}({})", n.node_type, truncate(&n.description, 30)))
                    .collect();
                serde_json::json!({
                    "path_description": rendered.join(" -> "),
                    "score": p.score,
                })
            })
            .collect();

        CausalContext {
            related_hypotheses,
            key_facts: self.key_facts(),
            confirmed_vulnerabilities,
            top_attack_paths,
            failure_patterns: self.failure_patterns(stall_window_secs),
        }
    }

    /// Human-readable causal graph summary.
    pub fn summary(&self) -> String {
        if self.nodes.is_empty() {
            return "The causal graph is empty.".to_string();
        }
        let mut lines = vec!["## Causal graph".to_string(), "\n## Nodes".to_string()];
        for (id, node) in &self.nodes {
            let line = match node.node_type {
                CausalNodeType::Hypothesis => format!(
                    "- [Hypothesis] {id} - {} - conf={} - status={}",
                    truncate(&node.description, 80),
                    node.confidence.map_or("N/A".to_string(), |c| format!("{c:.2}")),
                    node.status.as_str()
                ),
                CausalNodeType::Evidence => format!(
                    "- [Evidence] {id} - step={} - {}",
                    node.source_step_id.as_deref().unwrap_or("N/A"),
                    truncate(&node.description, 80)
                ),
                t if t.is_vulnerability() => format!(
                    "- [Vuln:{}] {id} - {} - CVSS={}",
                    t.as_str(),
                    truncate(&node.description, 80),
                    node.cvss_score.map_or("N/A".to_string(), |c| format!("{c:.1}"))
                ),
                t => format!("- [{}] {id} - {}", t.as_str(), truncate(&node.description, 80)),
            };
            lines.push(line);
        }
        lines.push("\n## Relations".to_string());
        for edge in &self.edges {
            lines.push(format!(
                "- ({}) --[{}]--> ({})",
                edge.source,
                edge.label.as_str(),
                edge.target
            ));
        }
        lines.join("\n")
    }

    /// Summary of the best attack paths.
    pub fn attack_path_summary(&self, top_n: usize) -> String {
        let paths = self.attack_paths();
        if paths.is_empty() {
            return "No potential attack paths discovered.".to_string();
        }
        let mut lines = vec!["## Potential attack paths".to_string()];
        for (index, path) in paths.iter().take(top_n).enumerate() {
            let rendered: Vec<String> = path
                .path
                .iter()
                .map(|n| format!("{}({})", n.node_type, truncate(&n.description, 30)))
                .collect();
            lines.push(format!("### Path {} (score: {:.2})", index + 1, path.score));
            lines.push(rendered.join(" -> "));
        }
        lines.join("\n")
    }

    /// Backdate a hypothesis; test hook for the stall-window logic.
    #[cfg(test)]
    pub fn age_node(&mut self, id: &str, seconds: i64) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.created_at -= chrono::Duration::seconds(seconds);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
