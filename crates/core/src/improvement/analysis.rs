//! Static analysis of improvement candidates
//!
//! Deterministic heuristics over the diff text produce quality, security
//! and perf scores plus an overall confidence. The scores gate the pipeline:
//! a candidate below the minimums never reaches the sandbox.

use super::candidate::{AnalysisScores, ImprovementCandidate};

/// Added-line markers that cost security score.
const RISKY_MARKERS: [&str; 4] = ["unsafe ", ".unwrap()", "panic!(", "http://"];
const RISK_PENALTY: f64 = 0.15;

/// Diffs smaller than this are considered focused.
const FOCUSED_DIFF_LINES: usize = 50;

/// Score a candidate. Pure in the candidate's contents.
pub fn analyze(candidate: &ImprovementCandidate) -> AnalysisScores {
    let changed = candidate.changed_lines();

    let mut quality: f64 = 0.5;
    if candidate.tests_added {
        quality += 0.2;
    }
    if changed > 0 && changed <= FOCUSED_DIFF_LINES {
        quality += 0.2;
    }
    if !candidate.motivation.trim().is_empty() {
        quality += 0.1;
    }
    let quality = quality.min(1.0);

    let risky_hits = candidate
        .added_lines()
        .map(|line| {
            RISKY_MARKERS
                .iter()
                .filter(|marker| line.contains(*marker))
                .count()
        })
        .sum::<usize>();
    let security = (1.0 - risky_hits as f64 * RISK_PENALTY).max(0.0);

    let mut perf = 0.7;
    if candidate.removed_count() > candidate.added_count() {
        perf += 0.2;
    }
    let clone_hits = candidate
        .added_lines()
        .filter(|line| line.contains(".clone()"))
        .count();
    perf = (perf - clone_hits as f64 * 0.05).clamp(0.0, 1.0);

    let confidence = (0.4 * quality
        + 0.3 * security
        + 0.2 * perf
        + if candidate.tests_added { 0.1 } else { 0.0 })
    .clamp(0.0, 1.0);

    AnalysisScores {
        quality,
        security,
        perf,
        confidence,
    }
}
