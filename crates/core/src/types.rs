//! Core entities shared across components
//!
//! Everything here is a plain serde-serializable value. Components exchange
//! ids over the bus rather than references; contexts, evaluations,
//! explanations and outcomes are immutable once created.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Autonomy level of a decision, ordered by rising required confidence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DecisionLevel {
    /// Recommendation only; a human or another system acts on it.
    Advisory,
    /// The core acts on its own, within limits.
    Autonomous,
    /// Reserved for protective actions under degraded conditions.
    Emergency,
}

impl DecisionLevel {
    pub const ALL: [DecisionLevel; 3] = [
        DecisionLevel::Advisory,
        DecisionLevel::Autonomous,
        DecisionLevel::Emergency,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DecisionLevel::Advisory => "advisory",
            DecisionLevel::Autonomous => "autonomous",
            DecisionLevel::Emergency => "emergency",
        }
    }
}

/// A single criterion input: numeric in [0,1] or a category resolved through
/// a per-criterion lookup table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CriterionValue {
    Numeric(f64),
    Categorical(String),
    /// Numeric value with a reported variance, for inputs supplied as a
    /// distribution rather than a point estimate.
    Distribution { mean: f64, variance: f64 },
}

/// Immutable input to an evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionContext {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub level: DecisionLevel,
    /// Named criteria. BTreeMap keeps iteration (and explanation output)
    /// deterministic.
    pub inputs: BTreeMap<String, CriterionValue>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub proposer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl DecisionContext {
    pub fn new(level: DecisionLevel, proposer: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            level,
            inputs: BTreeMap::new(),
            tags: BTreeSet::new(),
            proposer: proposer.into(),
            deadline: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, value: CriterionValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    pub fn with_numeric(self, name: impl Into<String>, value: f64) -> Self {
        self.with_input(name, CriterionValue::Numeric(value))
    }
}

/// Risk classification derived from (score, confidence).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    Medium,
    High,
    Critical,
}

impl Risk {
    pub fn as_str(self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
            Risk::Critical => "critical",
        }
    }
}

/// Per-criterion share of the weighted score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub criterion: String,
    pub weight: f64,
    pub normalized_value: f64,
    /// weight * normalized_value
    pub contribution: f64,
    /// Present when the criterion was required but absent from the context.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub missing: bool,
}

/// Derived result of scoring a context. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub context_id: Uuid,
    pub weighted_score: f64,
    pub confidence: f64,
    pub risk: Risk,
    /// Ordered by descending contribution magnitude.
    pub contributions: Vec<Contribution>,
}

/// Observed result of an executed decision. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub decision_id: Uuid,
    pub success: bool,
    pub observed_at: DateTime<Utc>,
    /// Signed reward in [-1, 1].
    pub magnitude: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Kinds of autonomous actions the executor admits.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Propose,
    Spend,
    Stake,
    Unstake,
    UpdateParameter,
    EmergencyStop,
    CodeChange,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Propose => "propose",
            ActionKind::Spend => "spend",
            ActionKind::Stake => "stake",
            ActionKind::Unstake => "unstake",
            ActionKind::UpdateParameter => "update_parameter",
            ActionKind::EmergencyStop => "emergency_stop",
            ActionKind::CodeChange => "code_change",
        }
    }

    /// Kinds that move funds and therefore hit the spending limits.
    pub fn is_spending(self) -> bool {
        matches!(self, ActionKind::Spend | ActionKind::Stake | ActionKind::Unstake)
    }
}

/// Cost attached to a spending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCost {
    pub asset: String,
    pub amount: f64,
}

/// Request handed to the Action Executor. Execution itself is delegated to
/// the external action sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: Uuid,
    pub actor: String,
    pub kind: ActionKind,
    /// Opaque payload forwarded to the sink.
    pub payload: serde_json::Value,
    pub not_before: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<ActionCost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_actor: Option<String>,
    /// Decision that produced this request, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<Uuid>,
    /// Level of that decision; lets the executor feed outcomes back into
    /// threshold adaptation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_level: Option<DecisionLevel>,
}

/// Result reported back from the action sink for an admitted request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observable_effect: Option<String>,
    /// Actual cost delta, which may differ from the requested cost.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_delta: Option<ActionCost>,
}

/// Structured rationale for a decision. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub decision_id: Uuid,
    pub summary: String,
    pub reasoning_steps: Vec<String>,
    /// Memory record ids backing each cited fact.
    pub evidence_refs: Vec<Uuid>,
    pub confidence_analysis: ConfidenceAnalysis,
    pub considered_alternatives: Vec<Alternative>,
}

/// Confidence block embedded in every explanation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceAnalysis {
    pub threshold: f64,
    pub observed_confidence: f64,
    pub margin: f64,
    /// Absent until enough outcomes exist for the level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_success_rate: Option<f64>,
}

/// An alternative that was considered and rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    pub description: String,
    pub rejection_reason: String,
}

/// Lifecycle of a decision context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionState {
    Created,
    Evaluated,
    Rejected,
    Approved,
    Executed,
    Recorded,
}

/// Process-wide operating mode, owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Normal,
    Degraded,
    Paused,
    Emergency,
}

impl OperatingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Normal => "normal",
            OperatingMode::Degraded => "degraded",
            OperatingMode::Paused => "paused",
            OperatingMode::Emergency => "emergency",
        }
    }

    /// Whether the executor may admit a request of `kind` in this mode.
    pub fn admits(self, kind: ActionKind) -> bool {
        match self {
            OperatingMode::Normal | OperatingMode::Degraded => true,
            OperatingMode::Paused => kind == ActionKind::EmergencyStop,
            OperatingMode::Emergency => false,
        }
    }
}

/// Kind tag for memory records.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Decision,
    Evaluation,
    Explanation,
    Outcome,
    Observation,
    HealthSnapshot,
    Improvement,
}

/// A single entry in the memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub kind: RecordKind,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryRecord {
    pub fn new(kind: RecordKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            ts: Utc::now(),
            payload,
            embedding: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}
