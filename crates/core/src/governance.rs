//! Governance decision loop
//!
//! Each tick: snapshot the external governance state, build a bounded batch
//! of decision contexts, evaluate them, submit the approved ones to the
//! executor, and leave a full trail (context, explanation, outcome,
//! completion event) behind. A tick that overruns its budget causes the
//! next tick to be skipped with an `Overloaded` event. The loop honors
//! cancellation within one tick and stops opening new work the moment the
//! operating mode forbids it.

use crate::bus::{Event, EventBus};
use crate::clock::Clock;
use crate::confidence::ConfidenceManager;
use crate::error::{CoreError, CoreResult};
use crate::evaluator::Evaluator;
use crate::executor::ActionExecutor;
use crate::explain::ExplanationBuilder;
use crate::memory::{DecisionRecord, MemoryStore};
use crate::orchestrator::ModeHandle;
use crate::ports::{retry, with_deadline, CandidateDecision, GovernanceSource, CALL_DEADLINE};
use crate::types::{
    ActionRequest, DecisionContext, DecisionState, MemoryRecord, OperatingMode, Outcome,
    RecordKind,
};
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Maximum decision contexts built per tick.
pub const BATCH_MAX: usize = 8;
/// A tick running longer than this causes the next tick to be skipped.
pub const TICK_BUDGET: Duration = Duration::from_secs(120);

/// Counters exposed for status reporting.
#[derive(Debug, Clone, Copy, Default)]
pub struct GovernanceStats {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub decisions_total: u64,
    pub decisions_approved: u64,
    pub decisions_rejected: u64,
}

/// The observe -> evaluate -> decide -> execute -> record cycle.
pub struct GovernanceLoop {
    clock: Arc<dyn Clock>,
    mode: ModeHandle,
    bus: Arc<EventBus>,
    memory: Arc<MemoryStore>,
    evaluator: Arc<Evaluator>,
    confidence: Arc<ConfidenceManager>,
    executor: Arc<ActionExecutor>,
    source: Arc<dyn GovernanceSource>,
    interval: Duration,
    ticks: AtomicU64,
    ticks_skipped: AtomicU64,
    decisions_total: AtomicU64,
    decisions_approved: AtomicU64,
    decisions_rejected: AtomicU64,
}

impl GovernanceLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        mode: ModeHandle,
        bus: Arc<EventBus>,
        memory: Arc<MemoryStore>,
        evaluator: Arc<Evaluator>,
        confidence: Arc<ConfidenceManager>,
        executor: Arc<ActionExecutor>,
        source: Arc<dyn GovernanceSource>,
        interval: Duration,
    ) -> Self {
        Self {
            clock,
            mode,
            bus,
            memory,
            evaluator,
            confidence,
            executor,
            source,
            interval,
            ticks: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            decisions_total: AtomicU64::new(0),
            decisions_approved: AtomicU64::new(0),
            decisions_rejected: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> GovernanceStats {
        GovernanceStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
            decisions_total: self.decisions_total.load(Ordering::Relaxed),
            decisions_approved: self.decisions_approved.load(Ordering::Relaxed),
            decisions_rejected: self.decisions_rejected.load(Ordering::Relaxed),
        }
    }

    /// Run until cancelled. Degraded mode doubles the cadence; Paused and
    /// Emergency modes skip ticks entirely.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "governance loop started");
        let mut last_tick_elapsed = Duration::ZERO;
        loop {
            let sleep_for = match self.mode.current() {
                OperatingMode::Degraded => self.interval * 2,
                _ => self.interval,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }

            match self.mode.current() {
                OperatingMode::Paused | OperatingMode::Emergency => {
                    debug!("tick skipped: mode forbids new work");
                    self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                _ => {}
            }

            if last_tick_elapsed > TICK_BUDGET {
                warn!(elapsed_secs = last_tick_elapsed.as_secs(), "tick budget overrun, skipping tick");
                self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
                let _ = self
                    .bus
                    .publish(Event::Overloaded {
                        event_id: Uuid::new_v4(),
                        component: "governance".to_string(),
                        detail: format!(
                            "previous tick took {:?}, budget {:?}",
                            last_tick_elapsed, TICK_BUDGET
                        ),
                        timestamp: self.clock.now_utc(),
                    })
                    .await;
                last_tick_elapsed = Duration::ZERO;
                continue;
            }

            let started = self.clock.now();
            self.tick(&cancel).await;
            last_tick_elapsed = self.clock.now().saturating_sub(started);
            self.ticks.fetch_add(1, Ordering::Relaxed);
        }
        info!("governance loop stopped");
    }

    /// One decision cycle over a bounded batch of candidates.
    #[instrument(skip_all)]
    pub async fn tick(&self, cancel: &CancellationToken) {
        let snapshot = match retry("governance snapshot", || {
            with_deadline(CALL_DEADLINE, "governance snapshot", self.source.snapshot())
        })
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.report_error("snapshot", &e).await;
                return;
            }
        };

        for candidate in snapshot.candidates.into_iter().take(BATCH_MAX) {
            if cancel.is_cancelled() {
                break;
            }
            // Emergency or pause mid-tick: drain what is in flight, start
            // nothing new.
            if !matches!(
                self.mode.current(),
                OperatingMode::Normal | OperatingMode::Degraded
            ) {
                debug!("mode change mid-tick, no further submissions");
                break;
            }
            if let Err(e) = self.process_candidate(candidate).await {
                self.report_error("decision", &e).await;
            }
        }
    }

    async fn process_candidate(&self, candidate: CandidateDecision) -> CoreResult<()> {
        let context = DecisionContext {
            id: Uuid::new_v4(),
            created_at: self.clock.now_utc(),
            level: candidate.level,
            inputs: candidate.inputs,
            tags: candidate.tags,
            proposer: candidate.proposer,
            deadline: candidate.deadline,
        };
        self.decisions_total.fetch_add(1, Ordering::Relaxed);

        // Evaluation precedes admission.
        let evaluation = self.evaluator.evaluate(&context)?;
        let stats = self.confidence.stats_for(context.level);
        let confident = evaluation.confidence >= stats.threshold;
        let mode_permits = self.mode.current().admits(candidate.action.kind);
        let approved = confident && mode_permits;

        // The context itself is the primary evidence record.
        let context_record = MemoryRecord::new(
            RecordKind::Decision,
            serde_json::to_value(&context).map_err(|e| CoreError::Fatal(e.to_string()))?,
        )
        .with_id(context.id);
        self.memory.put(context_record)?;

        let outcome = if approved {
            let request = ActionRequest {
                id: Uuid::new_v4(),
                actor: context.proposer.clone(),
                kind: candidate.action.kind,
                payload: candidate.action.payload,
                not_before: context.created_at,
                expires_at: context
                    .deadline
                    .unwrap_or(context.created_at + ChronoDuration::hours(1)),
                cost: candidate.action.cost,
                target_actor: candidate.action.target_actor,
                decision_id: Some(context.id),
                decision_level: Some(context.level),
            };
            match self.executor.submit(request).await {
                // Executor already recorded the outcome; mirror it here for
                // the archive.
                Ok(result) => Outcome {
                    decision_id: context.id,
                    success: result.success,
                    observed_at: self.clock.now_utc(),
                    magnitude: if result.success { 1.0 } else { -1.0 },
                    notes: result.observable_effect,
                },
                Err(e) => {
                    let outcome = Outcome {
                        decision_id: context.id,
                        success: false,
                        observed_at: self.clock.now_utc(),
                        magnitude: 0.0,
                        notes: Some(e.to_string()),
                    };
                    self.memory.record_outcome(Uuid::new_v4(), &outcome)?;
                    outcome
                }
            }
        } else {
            let reason = if confident {
                format!("mode {} forbids execution", self.mode.current().as_str())
            } else {
                "InsufficientConfidence".to_string()
            };
            let outcome = Outcome {
                decision_id: context.id,
                success: false,
                observed_at: self.clock.now_utc(),
                magnitude: 0.0,
                notes: Some(reason),
            };
            self.memory.record_outcome(Uuid::new_v4(), &outcome)?;
            outcome
        };

        if outcome.success {
            self.decisions_approved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.decisions_rejected.fetch_add(1, Ordering::Relaxed);
        }

        // Explanation persistence precedes the completion event.
        let explanation = ExplanationBuilder::build(
            &context,
            &evaluation,
            approved,
            stats,
            vec![context.id],
        );
        let explanation_record = MemoryRecord::new(
            RecordKind::Explanation,
            serde_json::to_value(&explanation).map_err(|e| CoreError::Fatal(e.to_string()))?,
        );
        self.memory.put(explanation_record)?;
        self.memory.persist_decision(&DecisionRecord {
            context: context.clone(),
            evaluation: evaluation.clone(),
            explanation,
            state: if approved {
                DecisionState::Recorded
            } else {
                DecisionState::Rejected
            },
            outcome: Some(outcome.clone()),
        })?;

        let completed_at = self.clock.now_utc();
        self.bus
            .publish(Event::DecisionCompleted {
                event_id: Uuid::new_v4(),
                decision_id: context.id,
                level: context.level,
                approved,
                weighted_score: evaluation.weighted_score,
                confidence: evaluation.confidence,
                risk: evaluation.risk,
                elapsed_ms: (completed_at - context.created_at)
                    .num_milliseconds()
                    .max(0) as u64,
                timestamp: completed_at,
            })
            .await?;
        Ok(())
    }

    async fn report_error(&self, stage: &str, error: &CoreError) {
        warn!(stage, error = %error, "governance cycle error");
        let _ = self
            .bus
            .publish(Event::ComponentError {
                event_id: Uuid::new_v4(),
                component: format!("governance:{stage}"),
                kind: error.kind().to_string(),
                detail: error.to_string(),
                timestamp: self.clock.now_utc(),
            })
            .await;
    }
}
