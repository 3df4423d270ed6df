//! Causal-graph domain model.
//!
//! The causal graph records what the agent believes and why: evidence,
//! hypotheses with confidence, vulnerabilities, exploits and the edges
//! between them. Edge labels are normalized into a closed set and carry an
//! evidence-strength classification that drives non-monotonic confidence
//! propagation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node kinds in the causal graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CausalNodeType {
    Evidence,
    Hypothesis,
    Vulnerability,
    PossibleVulnerability,
    ConfirmedVulnerability,
    Exploit,
    Credential,
    SystemProperty,
    TargetArtifact,
    KeyFact,
    Unknown,
}

impl CausalNodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evidence => "Evidence",
            Self::Hypothesis => "Hypothesis",
            Self::Vulnerability => "Vulnerability",
            Self::PossibleVulnerability => "PossibleVulnerability",
            Self::ConfirmedVulnerability => "ConfirmedVulnerability",
            Self::Exploit => "Exploit",
            Self::Credential => "Credential",
            Self::SystemProperty => "SystemProperty",
            Self::TargetArtifact => "TargetArtifact",
            Self::KeyFact => "KeyFact",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a type name, mapping legacy spellings into the canonical set.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        match s {
            "Evidence" => Self::Evidence,
            "Hypothesis" => Self::Hypothesis,
            "Vulnerability" => Self::Vulnerability,
            "PossibleVulnerability" => Self::PossibleVulnerability,
            "ConfirmedVulnerability" => Self::ConfirmedVulnerability,
            "Exploit" => Self::Exploit,
            "Credential" => Self::Credential,
            "SystemProperty" => Self::SystemProperty,
            "TargetArtifact" | "target_artifact" => Self::TargetArtifact,
            "KeyFact" | "key_fact" => Self::KeyFact,
            _ => Self::Unknown,
        }
    }

    /// Whether this node kind counts as a vulnerability for path scoring.
    pub fn is_vulnerability(&self) -> bool {
        matches!(
            self,
            Self::Vulnerability | Self::PossibleVulnerability | Self::ConfirmedVulnerability
        )
    }
}

/// Lifecycle tag on a causal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CausalStatus {
    Pending,
    Supported,
    Contradicted,
    Falsified,
    Confirmed,
    ReEvaluationPending,
}

impl Default for CausalStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl CausalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Supported => "SUPPORTED",
            Self::Contradicted => "CONTRADICTED",
            Self::Falsified => "FALSIFIED",
            Self::Confirmed => "CONFIRMED",
            Self::ReEvaluationPending => "RE_EVALUATION_PENDING",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "SUPPORTED" => Some(Self::Supported),
            "CONTRADICTED" => Some(Self::Contradicted),
            "FALSIFIED" => Some(Self::Falsified),
            "CONFIRMED" => Some(Self::Confirmed),
            "RE_EVALUATION_PENDING" => Some(Self::ReEvaluationPending),
            _ => None,
        }
    }
}

/// Canonical edge labels. Input synonyms are folded in by
/// [`EdgeLabel::normalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeLabel {
    Supports,
    Contradicts,
    Reveals,
    Exploits,
    Mitigates,
}

impl EdgeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Supports => "SUPPORTS",
            Self::Contradicts => "CONTRADICTS",
            Self::Reveals => "REVEALS",
            Self::Exploits => "EXPLOITS",
            Self::Mitigates => "MITIGATES",
        }
    }

    /// Fold label synonyms into the canonical set. Unknown labels default
    /// to SUPPORTS, the conservative reading of an unlabelled relation.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "SUPPORT" | "SUPPORTS" | "CONFIRMS" | "DEFINITIVE_CONFIRMATION" | "WEAK_SUPPORT"
            | "" => Self::Supports,
            "CONTRADICT" | "CONTRADICTS" | "DISPROVES" | "FALSIFIES" | "MINOR_CONTRADICTION"
            | "FAILED_EXTRACTION_ATTEMPT" => Self::Contradicts,
            "REVEAL" | "REVEALS" => Self::Reveals,
            "EXPLOIT" | "EXPLOITS" => Self::Exploits,
            "MITIGATE" | "MITIGATES" => Self::Mitigates,
            _ => Self::Supports,
        }
    }
}

/// Logical strength of a piece of evidence.
///
/// NECESSARY evidence is decisive: it pins a hypothesis to 0.0 or 1.0.
/// CONTINGENT evidence accumulates through a logit update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceStrength {
    Necessary,
    Contingent,
}

impl EvidenceStrength {
    /// Classify an explicit strength annotation; anything unrecognized is
    /// treated as contingent, the conservative default.
    pub fn classify(annotation: Option<&str>) -> Self {
        match annotation.map(|s| s.trim().to_lowercase()) {
            Some(s) if matches!(s.as_str(), "necessary" | "decisive" | "conclusive" | "definitive") => {
                Self::Necessary
            }
            _ => Self::Contingent,
        }
    }
}

/// A node in the causal graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CausalNode {
    pub id: String,
    pub node_type: CausalNodeType,
    pub description: String,
    /// Execution step that produced this node, if known
    pub source_step_id: Option<String>,
    /// Belief in [0,1]; meaningful for Hypothesis nodes
    pub confidence: Option<f64>,
    pub status: CausalStatus,
    /// CVSS score for vulnerability nodes
    pub cvss_score: Option<f64>,
    /// Flag set when a ConfirmedVulnerability absorbs a CONTRADICTS edge
    pub re_evaluation_needed: bool,
    /// Latched when a NECESSARY edge decided this hypothesis; contingent
    /// updates no longer move the confidence afterwards
    pub decisively_settled: bool,
    /// Raw tool output the node was derived from
    pub raw_output: Option<String>,
    /// Type-specific extra fields (credentials, findings, payloads, ...)
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

impl CausalNode {
    pub fn new(
        id: impl Into<String>,
        node_type: CausalNodeType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            node_type,
            description: description.into(),
            source_step_id: None,
            confidence: None,
            status: CausalStatus::default(),
            cvss_score: None,
            re_evaluation_needed: false,
            decisively_settled: false,
            raw_output: None,
            data: Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_source_step(mut self, step_id: impl Into<String>) -> Self {
        self.source_step_id = Some(step_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_normalization() {
        assert_eq!(EdgeLabel::normalize("SUPPORT"), EdgeLabel::Supports);
        assert_eq!(EdgeLabel::normalize("confirms"), EdgeLabel::Supports);
        assert_eq!(EdgeLabel::normalize("DISPROVES"), EdgeLabel::Contradicts);
        assert_eq!(EdgeLabel::normalize("falsifies"), EdgeLabel::Contradicts);
        assert_eq!(EdgeLabel::normalize("REVEAL"), EdgeLabel::Reveals);
        assert_eq!(EdgeLabel::normalize("exploit"), EdgeLabel::Exploits);
        assert_eq!(EdgeLabel::normalize("MITIGATE"), EdgeLabel::Mitigates);
        // Unknown and empty labels are conservative SUPPORTS
        assert_eq!(EdgeLabel::normalize(""), EdgeLabel::Supports);
        assert_eq!(EdgeLabel::normalize("LEADS_TO"), EdgeLabel::Supports);
    }

    #[test]
    fn test_strength_classification() {
        assert_eq!(
            EvidenceStrength::classify(Some("necessary")),
            EvidenceStrength::Necessary
        );
        assert_eq!(
            EvidenceStrength::classify(Some("Decisive")),
            EvidenceStrength::Necessary
        );
        assert_eq!(
            EvidenceStrength::classify(Some("weak")),
            EvidenceStrength::Contingent
        );
        assert_eq!(EvidenceStrength::classify(None), EvidenceStrength::Contingent);
    }

    #[test]
    fn test_legacy_type_mapping() {
        assert_eq!(CausalNodeType::from_str("key_fact"), CausalNodeType::KeyFact);
        assert_eq!(
            CausalNodeType::from_str("target_artifact"),
            CausalNodeType::TargetArtifact
        );
        assert_eq!(CausalNodeType::from_str("whatever"), CausalNodeType::Unknown);
    }
}
