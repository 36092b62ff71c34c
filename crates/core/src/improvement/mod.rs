//! Self-improvement pipeline
//!
//! Candidates are proposed changes against the source-of-truth repository.
//! The engine analyzes them, tests them in an isolated sandbox, and either
//! auto-merges (high confidence, small, tested, outside protected paths),
//! opens a PR, or rejects. A post-merge health degradation inside the
//! rollback window produces a compensating revert. Throughput is bounded:
//! a fixed number of candidates in testing and a daily auto-merge budget.

pub mod analysis;
pub mod candidate;

pub use candidate::{AnalysisScores, CandidateState, ImprovementCandidate};

use crate::bus::{Event, EventBus};
use crate::clock::Clock;
use crate::config::ImprovementConfig;
use crate::error::{CoreError, CoreResult};
use crate::explain::format_sig;
use crate::orchestrator::ModeHandle;
use crate::ports::{retry, with_deadline, CommitSpec, SandboxRunner, SourceRepository, CALL_DEADLINE};
use crate::types::OperatingMode;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Wall-clock budget for one sandboxed test run.
const TEST_TIMEOUT: Duration = Duration::from_secs(300);

type Analyzer = dyn Fn(&ImprovementCandidate) -> AnalysisScores + Send + Sync;

/// One appended line in `improvements/<id>.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Transition {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    ts: DateTime<Utc>,
    state: CandidateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

struct MergeLedger {
    day: NaiveDate,
    count: u32,
}

/// Drives candidates through the pipeline.
pub struct ImprovementEngine {
    clock: Arc<dyn Clock>,
    mode: ModeHandle,
    bus: Arc<EventBus>,
    repo: Arc<dyn SourceRepository>,
    sandbox: Arc<dyn SandboxRunner>,
    config: ImprovementConfig,
    interval: Duration,
    test_command: String,
    analyzer: Box<Analyzer>,
    candidates: Mutex<HashMap<Uuid, ImprovementCandidate>>,
    queue: Mutex<VecDeque<Uuid>>,
    testing_slots: Arc<tokio::sync::Semaphore>,
    merges: Mutex<MergeLedger>,
    improvements_dir: Option<PathBuf>,
}

impl ImprovementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        mode: ModeHandle,
        bus: Arc<EventBus>,
        repo: Arc<dyn SourceRepository>,
        sandbox: Arc<dyn SandboxRunner>,
        config: ImprovementConfig,
        interval: Duration,
        test_command: impl Into<String>,
        state_dir: Option<PathBuf>,
    ) -> CoreResult<Self> {
        let improvements_dir = match state_dir {
            Some(dir) => {
                let path = dir.join("improvements");
                std::fs::create_dir_all(&path).map_err(|e| {
                    CoreError::Transient(format!(
                        "create improvements dir {}: {e}",
                        path.display()
                    ))
                })?;
                Some(path)
            }
            None => None,
        };
        let today = clock.now_utc().date_naive();
        Ok(Self {
            clock,
            mode,
            bus,
            repo,
            sandbox,
            testing_slots: Arc::new(tokio::sync::Semaphore::new(config.max_concurrent)),
            config,
            interval,
            test_command: test_command.into(),
            analyzer: Box::new(analysis::analyze),
            candidates: Mutex::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            merges: Mutex::new(MergeLedger {
                day: today,
                count: 0,
            }),
            improvements_dir,
        })
    }

    /// Replace the analyzer (dependency injection for scoring).
    pub fn with_analyzer(
        mut self,
        analyzer: impl Fn(&ImprovementCandidate) -> AnalysisScores + Send + Sync + 'static,
    ) -> Self {
        self.analyzer = Box::new(analyzer);
        self
    }

    /// Register a new candidate and queue it for processing.
    pub async fn propose(
        &self,
        target_path: impl Into<String>,
        diff: impl Into<String>,
        motivation: impl Into<String>,
        tests_added: bool,
    ) -> CoreResult<Uuid> {
        let candidate = ImprovementCandidate::new(
            target_path,
            diff,
            motivation,
            tests_added,
            self.clock.now_utc(),
        );
        if candidate.diff.trim().is_empty() {
            return Err(CoreError::InvalidInput(
                "candidate diff is empty".to_string(),
            ));
        }
        let id = candidate.id;
        self.append_transition(&candidate, None)?;
        self.candidates.lock().unwrap().insert(id, candidate);
        self.queue.lock().unwrap().push_back(id);
        self.publish_transition(id, CandidateState::Proposed).await;
        Ok(id)
    }

    pub fn candidate(&self, id: &Uuid) -> Option<ImprovementCandidate> {
        self.candidates.lock().unwrap().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ImprovementCandidate> {
        let mut all: Vec<ImprovementCandidate> =
            self.candidates.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        all
    }

    /// Run until cancelled. The pipeline only advances in Normal mode; in
    /// Degraded mode improvement work is paused.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "improvement engine started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            if self.mode.current() != OperatingMode::Normal {
                continue;
            }
            self.drain_queue(&cancel).await;
        }
        info!("improvement engine stopped");
    }

    /// Process everything currently queued.
    pub async fn drain_queue(&self, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() || self.mode.current() != OperatingMode::Normal {
                return;
            }
            let Some(id) = self.queue.lock().unwrap().pop_front() else {
                return;
            };
            if let Err(e) = self.process(id).await {
                warn!(candidate_id = %id, error = %e, "candidate processing failed");
            }
        }
    }

    /// Drive one candidate from Proposed to a terminal state.
    #[instrument(skip(self), fields(candidate_id = %id))]
    pub async fn process(&self, id: Uuid) -> CoreResult<()> {
        let candidate = self
            .candidate(&id)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown candidate {id}")))?;
        if candidate.state != CandidateState::Proposed {
            return Ok(());
        }

        // Analysis gate.
        let scores = (self.analyzer)(&candidate);
        let mut candidate = candidate;
        candidate.analysis = Some(scores);
        self.set_state(
            &mut candidate,
            CandidateState::Analyzed,
            Some(format!(
                "quality {} security {} perf {} confidence {}",
                format_sig(scores.quality),
                format_sig(scores.security),
                format_sig(scores.perf),
                format_sig(scores.confidence),
            )),
        )
        .await?;

        if scores.min_score() < self.config.min_score
            || scores.confidence < self.config.min_confidence
        {
            self.set_state(
                &mut candidate,
                CandidateState::Rejected,
                Some("analysis scores below actionable minimums".to_string()),
            )
            .await?;
            return Ok(());
        }

        // Sandbox testing, bounded by the concurrency budget.
        let report = {
            let _slot = self
                .testing_slots
                .acquire()
                .await
                .map_err(|_| CoreError::Overloaded("testing slots closed".to_string()))?;
            self.test_in_sandbox(&candidate).await?
        };
        candidate.test_report = Some(report.clone());
        self.set_state(
            &mut candidate,
            CandidateState::Tested,
            Some(format!(
                "passed={} duration_ms={}",
                report.passed,
                report.duration.as_millis()
            )),
        )
        .await?;

        if !report.passed {
            self.set_state(
                &mut candidate,
                CandidateState::Rejected,
                Some(format!("sandbox tests failed: {}", report.failures.join("; "))),
            )
            .await?;
            return Ok(());
        }

        // Decision rule.
        let within_size = candidate.changed_lines() <= self.config.size_cap_lines;
        let protected = candidate.touches_protected(&self.config.protected_paths);
        let confident = scores.confidence >= self.config.auto_merge_threshold;
        let budget_left = self.merge_budget_available();

        if confident && within_size && !protected && candidate.tests_added && budget_left {
            self.auto_merge(&mut candidate, scores).await?;
        } else {
            self.open_pr(&mut candidate, scores, within_size, protected, confident, budget_left)
                .await?;
        }
        Ok(())
    }

    async fn test_in_sandbox(
        &self,
        candidate: &ImprovementCandidate,
    ) -> CoreResult<crate::ports::TestReport> {
        let head = retry("repo head", || {
            with_deadline(CALL_DEADLINE, "repo head", self.repo.head())
        })
        .await?;
        let workspace = retry("sandbox prepare", || {
            with_deadline(
                CALL_DEADLINE,
                "sandbox prepare",
                self.sandbox.prepare(&head, &candidate.diff),
            )
        })
        .await?;
        let result = with_deadline(
            TEST_TIMEOUT + CALL_DEADLINE,
            "sandbox tests",
            self.sandbox
                .run_tests(&workspace, &self.test_command, TEST_TIMEOUT),
        )
        .await;
        let _ = self.sandbox.dispose(&workspace).await;
        result
    }

    async fn auto_merge(
        &self,
        candidate: &mut ImprovementCandidate,
        scores: AnalysisScores,
    ) -> CoreResult<()> {
        let branch = format!("improve/{}", candidate.id.simple());
        let description = self.describe(candidate, scores, true);
        let commits = [CommitSpec {
            message: format!("improve {}: {}", candidate.target_path, candidate.motivation),
            diff: candidate.diff.clone(),
        }];
        let pr_id = retry("repo propose", || {
            with_deadline(
                CALL_DEADLINE,
                "repo propose",
                self.repo.propose_change(&branch, &commits, &description),
            )
        })
        .await?;
        let commit = retry("repo merge", || {
            with_deadline(CALL_DEADLINE, "repo merge", self.repo.merge(&pr_id, "squash"))
        })
        .await?;

        candidate.pr_id = Some(pr_id);
        candidate.merge_commit = Some(commit);
        candidate.merged_at = Some(self.clock.now_utc());
        self.count_merge();
        self.set_state(candidate, CandidateState::AutoMerged, None).await
    }

    async fn open_pr(
        &self,
        candidate: &mut ImprovementCandidate,
        scores: AnalysisScores,
        within_size: bool,
        protected: bool,
        confident: bool,
        budget_left: bool,
    ) -> CoreResult<()> {
        let mut reasons = Vec::new();
        if !confident {
            reasons.push(format!(
                "confidence {} is below the auto-merge threshold {}",
                format_sig(scores.confidence),
                format_sig(self.config.auto_merge_threshold),
            ));
        }
        if !within_size {
            reasons.push(format!(
                "change size {} exceeds the cap of {} lines",
                candidate.changed_lines(),
                self.config.size_cap_lines,
            ));
        }
        if protected {
            reasons.push("protected paths are touched".to_string());
        }
        if !candidate.tests_added {
            reasons.push("no tests were added".to_string());
        }
        if !budget_left {
            reasons.push("daily auto-merge budget exhausted".to_string());
        }

        let branch = format!("improve/{}", candidate.id.simple());
        let mut description = self.describe(candidate, scores, false);
        if !reasons.is_empty() {
            description.push_str("\n\nHeld for review: ");
            description.push_str(&reasons.join("; "));
        }
        let commits = [CommitSpec {
            message: format!("improve {}: {}", candidate.target_path, candidate.motivation),
            diff: candidate.diff.clone(),
        }];
        let pr_id = retry("repo propose", || {
            with_deadline(
                CALL_DEADLINE,
                "repo propose",
                self.repo.propose_change(&branch, &commits, &description),
            )
        })
        .await?;

        candidate.pr_id = Some(pr_id);
        candidate.note = reasons.first().cloned();
        self.set_state(candidate, CandidateState::PrOpened, None).await
    }

    fn describe(
        &self,
        candidate: &ImprovementCandidate,
        scores: AnalysisScores,
        auto: bool,
    ) -> String {
        format!(
            "{}\n\nanalysis: quality {} / security {} / perf {} / confidence {}\n\
             diff: {} changed lines across {}\nmerge mode: {}",
            candidate.motivation,
            format_sig(scores.quality),
            format_sig(scores.security),
            format_sig(scores.perf),
            format_sig(scores.confidence),
            candidate.changed_lines(),
            candidate.touched_paths().join(", "),
            if auto { "automatic" } else { "review required" },
        )
    }

    /// Revert an auto-merged candidate. Idempotent by candidate id: once
    /// Rolled-Back, further calls are no-ops.
    pub async fn rollback(&self, id: Uuid) -> CoreResult<()> {
        let Some(mut candidate) = self.candidate(&id) else {
            return Err(CoreError::InvalidInput(format!("unknown candidate {id}")));
        };
        if candidate.state == CandidateState::RolledBack {
            return Ok(());
        }
        if candidate.state != CandidateState::AutoMerged {
            return Err(CoreError::InvalidInput(format!(
                "candidate {id} is {}, only auto-merged candidates roll back",
                candidate.state.as_str()
            )));
        }
        let commit = candidate
            .merge_commit
            .clone()
            .ok_or_else(|| CoreError::Inconsistent(format!("merged candidate {id} has no commit")))?;
        let revert_commit = retry("repo revert", || {
            with_deadline(CALL_DEADLINE, "repo revert", self.repo.revert(&commit))
        })
        .await?;
        self.set_state(
            &mut candidate,
            CandidateState::RolledBack,
            Some(format!("reverted by {revert_commit}")),
        )
        .await
    }

    /// Health degradation hook: revert every auto-merge inside the rollback
    /// window.
    pub async fn on_health_degraded(&self) {
        let window = Duration::from_secs(self.config.rollback_window_sec);
        let now = self.clock.now_utc();
        let recent: Vec<Uuid> = {
            let candidates = self.candidates.lock().unwrap();
            candidates
                .values()
                .filter(|c| c.state == CandidateState::AutoMerged)
                .filter(|c| {
                    c.merged_at
                        .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO) <= window)
                        .unwrap_or(false)
                })
                .map(|c| c.id)
                .collect()
        };
        for id in recent {
            if let Err(e) = self.rollback(id).await {
                warn!(candidate_id = %id, error = %e, "post-degradation rollback failed");
            }
        }
    }

    fn merge_budget_available(&self) -> bool {
        let today = self.clock.now_utc().date_naive();
        let mut ledger = self.merges.lock().unwrap();
        if ledger.day != today {
            ledger.day = today;
            ledger.count = 0;
        }
        ledger.count < self.config.max_daily_merges
    }

    fn count_merge(&self) {
        let today = self.clock.now_utc().date_naive();
        let mut ledger = self.merges.lock().unwrap();
        if ledger.day != today {
            ledger.day = today;
            ledger.count = 0;
        }
        ledger.count += 1;
    }

    async fn set_state(
        &self,
        candidate: &mut ImprovementCandidate,
        state: CandidateState,
        note: Option<String>,
    ) -> CoreResult<()> {
        candidate.state = state;
        if note.is_some() {
            candidate.note = note.clone();
        }
        self.append_transition(candidate, note)?;
        self.candidates
            .lock()
            .unwrap()
            .insert(candidate.id, candidate.clone());
        self.publish_transition(candidate.id, state).await;
        Ok(())
    }

    fn append_transition(
        &self,
        candidate: &ImprovementCandidate,
        note: Option<String>,
    ) -> CoreResult<()> {
        let Some(dir) = &self.improvements_dir else {
            return Ok(());
        };
        let transition = Transition {
            ts: self.clock.now_utc(),
            state: candidate.state,
            note,
        };
        let line = serde_json::to_string(&transition)
            .map_err(|e| CoreError::Fatal(e.to_string()))?;
        let path = dir.join(format!("{}.jsonl", candidate.id));
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CoreError::Transient(format!("open {}: {e}", path.display())))?;
        writeln!(file, "{line}")
            .map_err(|e| CoreError::Transient(format!("append transition: {e}")))
    }

    async fn publish_transition(&self, id: Uuid, state: CandidateState) {
        let _ = self
            .bus
            .publish(Event::ImprovementTransition {
                event_id: Uuid::new_v4(),
                candidate_id: id,
                state: state.as_str().to_string(),
                timestamp: self.clock.now_utc(),
            })
            .await;
    }
}
