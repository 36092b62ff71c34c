//! Explanation artifacts for decisions
//!
//! Every executed decision carries a structured rationale: a one-line
//! summary, reasoning steps ordered by contribution magnitude, evidence
//! references into memory, a confidence analysis block, and at least one
//! rejected alternative. Output is deterministic: fixed templates, numbers
//! formatted to 6 significant digits, identical bytes for identical inputs
//! on every platform.

use crate::confidence::LevelStats;
use crate::types::{
    Alternative, ConfidenceAnalysis, DecisionContext, Evaluation, Explanation,
};
use uuid::Uuid;

/// Format a value to 6 significant digits, stable across platforms.
pub fn format_sig(v: f64) -> String {
    if v == 0.0 || !v.is_finite() {
        return format!("{v:.6}");
    }
    let magnitude = v.abs().log10().floor() as i32;
    let decimals = (5 - magnitude).max(0) as usize;
    format!("{v:.decimals$}")
}

/// Builds explanations from an evaluated context and its admission verdict.
pub struct ExplanationBuilder;

impl ExplanationBuilder {
    /// Assemble the rationale for one decision. `approved` is the verdict
    /// against the current threshold; `evidence_refs` are memory record ids
    /// backing the cited facts.
    pub fn build(
        context: &DecisionContext,
        evaluation: &Evaluation,
        approved: bool,
        stats: LevelStats,
        evidence_refs: Vec<Uuid>,
    ) -> Explanation {
        let verdict = if approved { "approved" } else { "rejected" };
        let summary = format!(
            "{} {} decision {}: score {} at confidence {} against threshold {}",
            verdict,
            context.level.as_str(),
            context.id,
            format_sig(evaluation.weighted_score),
            format_sig(evaluation.confidence),
            format_sig(stats.threshold),
        );

        let mut reasoning_steps = Vec::with_capacity(evaluation.contributions.len() + 2);
        for (rank, c) in evaluation.contributions.iter().enumerate() {
            if c.missing {
                reasoning_steps.push(format!(
                    "{}. criterion {} was missing: scored {} and reduced confidence",
                    rank + 1,
                    c.criterion,
                    format_sig(0.0),
                ));
            } else {
                reasoning_steps.push(format!(
                    "{}. criterion {} contributed {} (weight {} x value {})",
                    rank + 1,
                    c.criterion,
                    format_sig(c.contribution),
                    format_sig(c.weight),
                    format_sig(c.normalized_value),
                ));
            }
        }
        reasoning_steps.push(format!(
            "{}. risk assessed as {} from score {} and confidence {}",
            evaluation.contributions.len() + 1,
            evaluation.risk.as_str(),
            format_sig(evaluation.weighted_score),
            format_sig(evaluation.confidence),
        ));
        reasoning_steps.push(format!(
            "{}. confidence {} {} threshold {} for {} level",
            evaluation.contributions.len() + 2,
            format_sig(evaluation.confidence),
            if approved { "meets" } else { "falls below" },
            format_sig(stats.threshold),
            context.level.as_str(),
        ));

        let margin = evaluation.confidence - stats.threshold;
        let confidence_analysis = ConfidenceAnalysis {
            threshold: stats.threshold,
            observed_confidence: evaluation.confidence,
            margin,
            recent_success_rate: stats.success_rate,
        };

        let considered_alternatives = if approved {
            vec![Alternative {
                description: "defer the decision and gather more signal".to_string(),
                rejection_reason: format!(
                    "confidence margin {} is positive; deferral forfeits the scored benefit {}",
                    format_sig(margin),
                    format_sig(evaluation.weighted_score),
                ),
            }]
        } else {
            vec![Alternative {
                description: "proceed despite the confidence shortfall".to_string(),
                rejection_reason: format!(
                    "confidence margin {} is negative; acting would bypass the {} threshold",
                    format_sig(margin),
                    context.level.as_str(),
                ),
            }]
        };

        Explanation {
            decision_id: context.id,
            summary,
            reasoning_steps,
            evidence_refs,
            confidence_analysis,
            considered_alternatives,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{default_policies, Evaluator};
    use crate::types::{DecisionContext, DecisionLevel};

    fn fixture() -> (DecisionContext, Evaluation) {
        let context = DecisionContext::new(DecisionLevel::Advisory, "tester")
            .with_numeric("financial", 0.9)
            .with_numeric("security", 0.8)
            .with_numeric("sentiment", 0.7)
            .with_numeric("compliance", 0.9);
        let evaluation = Evaluator::new(default_policies())
            .unwrap()
            .evaluate(&context)
            .unwrap();
        (context, evaluation)
    }

    fn stats() -> LevelStats {
        LevelStats {
            threshold: 0.60,
            samples: 12,
            success_rate: Some(0.9166666),
        }
    }

    #[test]
    fn test_format_sig_six_significant_digits() {
        assert_eq!(format_sig(0.825), "0.825000");
        assert_eq!(format_sig(1.0), "1.00000");
        assert_eq!(format_sig(0.0), "0.000000");
        assert_eq!(format_sig(12.3456789), "12.3457");
        assert_eq!(format_sig(-0.05), "-0.0500000");
    }

    #[test]
    fn test_explanation_is_byte_identical() {
        let (context, evaluation) = fixture();
        let a = ExplanationBuilder::build(&context, &evaluation, true, stats(), vec![]);
        let b = ExplanationBuilder::build(&context, &evaluation, true, stats(), vec![]);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn test_steps_ordered_by_contribution() {
        let (context, evaluation) = fixture();
        let explanation =
            ExplanationBuilder::build(&context, &evaluation, true, stats(), vec![]);
        assert!(explanation.reasoning_steps[0].contains("financial"));
        assert!(explanation.reasoning_steps[1].contains("security"));
        assert!(explanation.reasoning_steps[2].contains("compliance"));
        assert!(explanation.reasoning_steps[3].contains("sentiment"));
    }

    #[test]
    fn test_confidence_block_and_margin() {
        let (context, evaluation) = fixture();
        let explanation =
            ExplanationBuilder::build(&context, &evaluation, true, stats(), vec![]);
        let block = &explanation.confidence_analysis;
        assert_eq!(block.threshold, 0.60);
        assert_eq!(block.observed_confidence, 1.0);
        assert!((block.margin - 0.4).abs() < 1e-9);
        assert!(block.recent_success_rate.is_some());
    }

    #[test]
    fn test_at_least_one_alternative_each_way() {
        let (context, evaluation) = fixture();
        let approved =
            ExplanationBuilder::build(&context, &evaluation, true, stats(), vec![]);
        assert!(!approved.considered_alternatives.is_empty());
        assert!(approved.summary.starts_with("approved"));

        let rejected =
            ExplanationBuilder::build(&context, &evaluation, false, stats(), vec![]);
        assert!(!rejected.considered_alternatives.is_empty());
        assert!(rejected.summary.starts_with("rejected"));
        assert!(rejected.reasoning_steps.last().unwrap().contains("falls below"));
    }

    #[test]
    fn test_evidence_refs_carried() {
        let (context, evaluation) = fixture();
        let refs = vec![Uuid::new_v4(), Uuid::new_v4()];
        let explanation =
            ExplanationBuilder::build(&context, &evaluation, true, stats(), refs.clone());
        assert_eq!(explanation.evidence_refs, refs);
    }
}
