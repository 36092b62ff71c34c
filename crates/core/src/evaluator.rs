//! Multi-criteria decision scoring
//!
//! `evaluate` is pure: given a context, the per-level weight tables, and the
//! categorical lookup tables, it produces the same `Evaluation` every time.
//! Normalization rules: numerics clamp to [0,1]; categories resolve through
//! a per-criterion table; a missing criterion scores 0.0 and, when required
//! for the level, costs a confidence penalty. Anything else malformed — NaN,
//! unknown criteria, unknown categories, broken weight sums — is rejected,
//! never silently defaulted.

use crate::error::{CoreError, CoreResult};
use crate::types::{
    Contribution, CriterionValue, DecisionContext, DecisionLevel, Evaluation, Risk,
};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Tolerance on per-level weight sums.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;
/// Confidence penalty per missing required criterion.
pub const MISSING_PENALTY: f64 = 0.1;
/// Variance above this, when an input arrives as a distribution, is
/// considered uncertain.
pub const VARIANCE_THRESHOLD: f64 = 0.05;
/// Confidence penalty per high-variance input.
pub const VARIANCE_PENALTY: f64 = 0.05;

/// Weights and required criteria for one decision level.
#[derive(Debug, Clone)]
pub struct EvaluationPolicy {
    /// criterion name -> weight in [0,1]; weights sum to 1 ± tolerance.
    pub weights: BTreeMap<String, f64>,
    /// Criteria that must be present for full confidence at this level.
    pub required: BTreeSet<String>,
}

impl EvaluationPolicy {
    fn validate(&self, level: DecisionLevel) -> CoreResult<()> {
        let mut sum = 0.0;
        for (name, weight) in &self.weights {
            if !weight.is_finite() || !(0.0..=1.0).contains(weight) {
                return Err(CoreError::InvalidInput(format!(
                    "weight for {name} at level {} is {weight}",
                    level.as_str()
                )));
            }
            sum += weight;
        }
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(CoreError::InvalidInput(format!(
                "weights at level {} sum to {sum}, expected 1",
                level.as_str()
            )));
        }
        for name in &self.required {
            if !self.weights.contains_key(name) {
                return Err(CoreError::InvalidInput(format!(
                    "required criterion {name} has no weight at level {}",
                    level.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Standard DAO criteria and their weights.
static DEFAULT_WEIGHTS: Lazy<BTreeMap<String, f64>> = Lazy::new(|| {
    [
        ("financial".to_string(), 0.30),
        ("security".to_string(), 0.25),
        ("sentiment".to_string(), 0.25),
        ("compliance".to_string(), 0.20),
    ]
    .into_iter()
    .collect()
});

/// Default DAO criteria weights, shared by all levels. Advisory requires
/// nothing; Autonomous and Emergency require every criterion.
pub fn default_policies() -> HashMap<DecisionLevel, EvaluationPolicy> {
    let weights = DEFAULT_WEIGHTS.clone();
    let all: BTreeSet<String> = weights.keys().cloned().collect();

    let mut policies = HashMap::new();
    policies.insert(
        DecisionLevel::Advisory,
        EvaluationPolicy {
            weights: weights.clone(),
            required: BTreeSet::new(),
        },
    );
    policies.insert(
        DecisionLevel::Autonomous,
        EvaluationPolicy {
            weights: weights.clone(),
            required: all.clone(),
        },
    );
    policies.insert(
        DecisionLevel::Emergency,
        EvaluationPolicy {
            weights,
            required: all,
        },
    );
    policies
}

/// Pure scoring engine.
pub struct Evaluator {
    policies: HashMap<DecisionLevel, EvaluationPolicy>,
    /// criterion name -> category -> normalized value.
    categorical: BTreeMap<String, BTreeMap<String, f64>>,
}

impl Evaluator {
    pub fn new(policies: HashMap<DecisionLevel, EvaluationPolicy>) -> CoreResult<Self> {
        for level in DecisionLevel::ALL {
            let policy = policies.get(&level).ok_or_else(|| {
                CoreError::InvalidInput(format!("no policy for level {}", level.as_str()))
            })?;
            policy.validate(level)?;
        }
        Ok(Self {
            policies,
            categorical: BTreeMap::new(),
        })
    }

    pub fn with_categorical_table(
        mut self,
        criterion: impl Into<String>,
        table: BTreeMap<String, f64>,
    ) -> Self {
        self.categorical.insert(criterion.into(), table);
        self
    }

    /// Score a context. Pure in (context, weight tables, lookup tables).
    pub fn evaluate(&self, context: &DecisionContext) -> CoreResult<Evaluation> {
        let policy = self.policies.get(&context.level).ok_or_else(|| {
            CoreError::InvalidInput(format!("no policy for level {}", context.level.as_str()))
        })?;

        // Unknown criteria are a malformed context, not a defaultable one.
        for name in context.inputs.keys() {
            if !policy.weights.contains_key(name) {
                return Err(CoreError::InvalidInput(format!(
                    "unknown criterion {name} for level {}",
                    context.level.as_str()
                )));
            }
        }

        let mut contributions = Vec::with_capacity(policy.weights.len());
        let mut confidence_penalty = 0.0;

        for (name, weight) in &policy.weights {
            let (normalized, missing) = match context.inputs.get(name) {
                Some(value) => (
                    self.normalize(name, value, &mut confidence_penalty)?,
                    false,
                ),
                None => {
                    if policy.required.contains(name) {
                        confidence_penalty += MISSING_PENALTY;
                    }
                    (0.0, true)
                }
            };
            contributions.push(Contribution {
                criterion: name.clone(),
                weight: *weight,
                normalized_value: normalized,
                contribution: weight * normalized,
                missing,
            });
        }

        // Descending contribution; name as a deterministic tie-break.
        contributions.sort_by(|a, b| {
            b.contribution
                .partial_cmp(&a.contribution)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.criterion.cmp(&b.criterion))
        });

        let weighted_score: f64 = contributions.iter().map(|c| c.contribution).sum();
        let weighted_score = weighted_score.clamp(0.0, 1.0);
        let confidence = (1.0 - confidence_penalty).clamp(0.0, 1.0);
        let risk = derive_risk(context.level, weighted_score, confidence);

        Ok(Evaluation {
            context_id: context.id,
            weighted_score,
            confidence,
            risk,
            contributions,
        })
    }

    fn normalize(
        &self,
        name: &str,
        value: &CriterionValue,
        confidence_penalty: &mut f64,
    ) -> CoreResult<f64> {
        match value {
            CriterionValue::Numeric(v) => {
                if v.is_nan() {
                    return Err(CoreError::InvalidInput(format!(
                        "criterion {name} is NaN"
                    )));
                }
                Ok(v.clamp(0.0, 1.0))
            }
            CriterionValue::Distribution { mean, variance } => {
                if mean.is_nan() || variance.is_nan() {
                    return Err(CoreError::InvalidInput(format!(
                        "criterion {name} distribution is NaN"
                    )));
                }
                if *variance > VARIANCE_THRESHOLD {
                    *confidence_penalty += VARIANCE_PENALTY;
                }
                Ok(mean.clamp(0.0, 1.0))
            }
            CriterionValue::Categorical(category) => {
                let table = self.categorical.get(name).ok_or_else(|| {
                    CoreError::InvalidInput(format!(
                        "criterion {name} has no categorical table"
                    ))
                })?;
                table.get(category).copied().ok_or_else(|| {
                    CoreError::InvalidInput(format!(
                        "unknown category {category} for criterion {name}"
                    ))
                })
            }
        }
    }
}

/// Fixed (score, confidence) -> risk matrix. Score bands: high ≥ 0.7,
/// mid ≥ 0.4; confidence bands: high ≥ 0.8, mid ≥ 0.5. Emergency-level
/// decisions are shifted one class up, since they act under degraded
/// conditions.
fn derive_risk(level: DecisionLevel, score: f64, confidence: f64) -> Risk {
    let score_band = band(score, 0.7, 0.4);
    let conf_band = band(confidence, 0.8, 0.5);
    let base = match (score_band, conf_band) {
        (Band::High, Band::High) => Risk::Low,
        (Band::High, Band::Mid) | (Band::Mid, Band::High) => Risk::Medium,
        (Band::Mid, Band::Mid) | (Band::High, Band::Low) | (Band::Low, Band::High) => Risk::High,
        _ => Risk::Critical,
    };
    if level == DecisionLevel::Emergency {
        escalate(base)
    } else {
        base
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Band {
    High,
    Mid,
    Low,
}

fn band(v: f64, high: f64, mid: f64) -> Band {
    if v >= high {
        Band::High
    } else if v >= mid {
        Band::Mid
    } else {
        Band::Low
    }
}

fn escalate(risk: Risk) -> Risk {
    match risk {
        Risk::Low => Risk::Medium,
        Risk::Medium => Risk::High,
        Risk::High | Risk::Critical => Risk::Critical,
    }
}
