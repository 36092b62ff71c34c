//! Improvement candidates and their lifecycle
//!
//! A candidate is a proposed change to the source-of-truth repository. It
//! moves Proposed -> Analyzed -> Tested -> (Auto-Merged | PR-Opened |
//! Rejected), and an Auto-Merged candidate may later be Rolled-Back.
//! Terminal states never regress.

use crate::ports::TestReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateState {
    Proposed,
    Analyzed,
    Tested,
    AutoMerged,
    PrOpened,
    Rejected,
    RolledBack,
}

impl CandidateState {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateState::Proposed => "proposed",
            CandidateState::Analyzed => "analyzed",
            CandidateState::Tested => "tested",
            CandidateState::AutoMerged => "auto_merged",
            CandidateState::PrOpened => "pr_opened",
            CandidateState::Rejected => "rejected",
            CandidateState::RolledBack => "rolled_back",
        }
    }
}

/// Static analysis verdict, all in [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisScores {
    pub quality: f64,
    pub security: f64,
    pub perf: f64,
    pub confidence: f64,
}

impl AnalysisScores {
    pub fn min_score(&self) -> f64 {
        self.quality.min(self.security).min(self.perf)
    }
}

/// A proposed change moving through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementCandidate {
    pub id: Uuid,
    pub target_path: String,
    /// Unified diff of the change.
    pub diff: String,
    pub motivation: String,
    pub tests_added: bool,
    pub state: CandidateState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisScores>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_report: Option<TestReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ImprovementCandidate {
    pub fn new(
        target_path: impl Into<String>,
        diff: impl Into<String>,
        motivation: impl Into<String>,
        tests_added: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_path: target_path.into(),
            diff: diff.into(),
            motivation: motivation.into(),
            tests_added,
            state: CandidateState::Proposed,
            created_at: now,
            analysis: None,
            test_report: None,
            pr_id: None,
            merge_commit: None,
            merged_at: None,
            note: None,
        }
    }

    /// Count of changed lines: additions plus removals, headers excluded.
    pub fn changed_lines(&self) -> usize {
        self.diff
            .lines()
            .filter(|line| {
                (line.starts_with('+') && !line.starts_with("+++"))
                    || (line.starts_with('-') && !line.starts_with("---"))
            })
            .count()
    }

    /// Paths touched by the diff, from the `+++ b/` and `--- a/` headers.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for line in self.diff.lines() {
            let path = line
                .strip_prefix("+++ b/")
                .or_else(|| line.strip_prefix("--- a/"));
            if let Some(path) = path {
                if path != "/dev/null" && !paths.iter().any(|p| p == path) {
                    paths.push(path.to_string());
                }
            }
        }
        if paths.is_empty() {
            paths.push(self.target_path.clone());
        }
        paths
    }

    /// Whether any touched path falls under a protected prefix.
    pub fn touches_protected(&self, protected: &[String]) -> bool {
        self.touched_paths()
            .iter()
            .any(|path| protected.iter().any(|prefix| path.starts_with(prefix.as_str())))
    }

    /// Lines added by the diff, for static inspection.
    pub fn added_lines(&self) -> impl Iterator<Item = &str> {
        self.diff
            .lines()
            .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
            .map(|line| &line[1..])
    }

    pub fn removed_count(&self) -> usize {
        self.diff
            .lines()
            .filter(|line| line.starts_with('-') && !line.starts_with("---"))
            .count()
    }

    pub fn added_count(&self) -> usize {
        self.diff
            .lines()
            .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
            .count()
    }
}
