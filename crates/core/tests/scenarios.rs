//! End-to-end decision scenarios
//!
//! Each test drives the full stack (governance loop, evaluator, confidence
//! manager, executor, memory, bus) through one concrete situation and
//! checks the observable trail it leaves behind.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use steward_core::Clock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steward_core::bus::{Event, EventBus, Topic};
use steward_core::clock::ManualClock;
use steward_core::config::{ExecutorConfig, ThresholdConfig};
use steward_core::confidence::ConfidenceManager;
use steward_core::error::CoreResult;
use steward_core::evaluator::{default_policies, Evaluator};
use steward_core::executor::{ActionExecutor, SpendingLimits, SpendingPolicy};
use steward_core::governance::GovernanceLoop;
use steward_core::memory::{MemoryConfig, MemoryStore};
use steward_core::orchestrator::ModeHandle;
use steward_core::ports::{
    ActionSink, CandidateDecision, GovernanceEvent, GovernanceSnapshot, ProposedAction,
    SinkStatus, SubmitReceipt,
};
use steward_core::ratelimit::{RateLimiter, RatePolicy};
use steward_core::types::{
    ActionCost, ActionKind, ActionRequest, CriterionValue, DecisionLevel, OperatingMode,
    RecordKind,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sink that accepts everything and can flip the operating mode on its
/// first call, modeling an emergency arriving mid-tick.
struct ScriptedSink {
    submissions: AtomicU64,
    flip_to_emergency: Option<(ModeHandle, u64)>,
}

#[async_trait]
impl ActionSink for ScriptedSink {
    async fn submit(&self, request: &ActionRequest) -> CoreResult<SubmitReceipt> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((mode, at)) = &self.flip_to_emergency {
            if n == *at {
                mode.set(OperatingMode::Emergency);
            }
        }
        Ok(SubmitReceipt {
            accepted: true,
            id: request.id,
            reason: None,
        })
    }

    async fn status(&self, _id: Uuid) -> CoreResult<SinkStatus> {
        Ok(SinkStatus {
            state: "done".to_string(),
            result: None,
        })
    }
}

struct QueueSource {
    candidates: Mutex<Vec<CandidateDecision>>,
}

#[async_trait]
impl steward_core::ports::GovernanceSource for QueueSource {
    async fn snapshot(&self) -> CoreResult<GovernanceSnapshot> {
        Ok(GovernanceSnapshot {
            cursor: 0,
            candidates: self.candidates.lock().unwrap().clone(),
            parameters: serde_json::Value::Null,
        })
    }

    async fn events_since(&self, _cursor: u64) -> CoreResult<Vec<GovernanceEvent>> {
        Ok(vec![])
    }
}

struct Stack {
    clock: Arc<ManualClock>,
    mode: ModeHandle,
    bus: Arc<EventBus>,
    memory: Arc<MemoryStore>,
    confidence: Arc<ConfidenceManager>,
    spending: Arc<SpendingLimits>,
    executor: Arc<ActionExecutor>,
    governance: Arc<GovernanceLoop>,
    sink: Arc<ScriptedSink>,
}

fn stack(candidates: Vec<CandidateDecision>, emergency_after: Option<u64>) -> Stack {
    stack_with_thresholds(candidates, emergency_after, ThresholdConfig::default())
}

fn stack_with_thresholds(
    candidates: Vec<CandidateDecision>,
    emergency_after: Option<u64>,
    thresholds: ThresholdConfig,
) -> Stack {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
    ));
    let mode = ModeHandle::new(OperatingMode::Normal);
    let bus = Arc::new(EventBus::default());
    let memory = Arc::new(MemoryStore::new(clock.clone(), MemoryConfig::default()).unwrap());
    let confidence = Arc::new(ConfidenceManager::new(clock.clone(), thresholds));
    let evaluator = Arc::new(Evaluator::new(default_policies()).unwrap());
    let rate_limiter = Arc::new(RateLimiter::new(
        clock.clone(),
        RatePolicy::new(Duration::ZERO, 10_000),
    ));
    let spending = Arc::new(SpendingLimits::new(clock.clone()));
    spending
        .set_policy(
            "treasury",
            "usd",
            SpendingPolicy {
                daily_cap: 1000.0,
                total_cap: 10000.0,
            },
        )
        .unwrap();
    let sink = Arc::new(ScriptedSink {
        submissions: AtomicU64::new(0),
        flip_to_emergency: emergency_after.map(|n| (mode.clone(), n)),
    });
    let executor = Arc::new(ActionExecutor::new(
        clock.clone(),
        mode.clone(),
        rate_limiter,
        spending.clone(),
        memory.clone(),
        confidence.clone(),
        sink.clone(),
        ExecutorConfig::default(),
    ));
    let governance = Arc::new(GovernanceLoop::new(
        clock.clone(),
        mode.clone(),
        bus.clone(),
        memory.clone(),
        evaluator,
        confidence.clone(),
        executor.clone(),
        Arc::new(QueueSource {
            candidates: Mutex::new(candidates),
        }),
        Duration::from_secs(60),
    ));
    Stack {
        clock,
        mode,
        bus,
        memory,
        confidence,
        spending,
        executor,
        governance,
        sink,
    }
}

fn candidate(
    level: DecisionLevel,
    inputs: &[(&str, f64)],
    kind: ActionKind,
    amount: Option<f64>,
) -> CandidateDecision {
    let inputs: BTreeMap<String, CriterionValue> = inputs
        .iter()
        .map(|(k, v)| (k.to_string(), CriterionValue::Numeric(*v)))
        .collect();
    CandidateDecision {
        reference: "prop".to_string(),
        level,
        inputs,
        tags: Default::default(),
        proposer: "treasury".to_string(),
        deadline: None,
        action: ProposedAction {
            kind,
            payload: serde_json::json!({}),
            cost: amount.map(|amount| ActionCost {
                asset: "usd".to_string(),
                amount,
            }),
            target_actor: None,
        },
    }
}

const FULL_INPUTS: [(&str, f64); 4] = [
    ("financial", 0.9),
    ("security", 0.8),
    ("sentiment", 0.7),
    ("compliance", 0.9),
];

/// S1: advisory recommendation approved with score 0.825 at confidence 1.
#[tokio::test]
async fn s1_advisory_recommendation() {
    let s = stack(
        vec![candidate(
            DecisionLevel::Advisory,
            &FULL_INPUTS,
            ActionKind::Propose,
            None,
        )],
        None,
    );
    let mut events = s.bus.subscribe_telemetry(Topic::Decisions);
    s.governance.tick(&CancellationToken::new()).await;

    let decision_id = match events.try_recv().unwrap() {
        Event::DecisionCompleted {
            decision_id,
            approved,
            weighted_score,
            confidence,
            ..
        } => {
            assert!(approved);
            assert!((weighted_score - 0.825).abs() < 1e-9);
            assert_eq!(confidence, 1.0);
            decision_id
        }
        other => panic!("unexpected event {other:?}"),
    };

    // The explanation trail orders criteria by weighted contribution.
    let now = s.clock.now_utc();
    let explanations = s.memory.range(
        RecordKind::Explanation,
        now - chrono::Duration::minutes(1),
        now + chrono::Duration::minutes(1),
    );
    assert_eq!(explanations.len(), 1);
    let steps = explanations[0].payload["reasoning_steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap().to_string())
        .collect::<Vec<_>>();
    assert!(steps[0].contains("financial"));
    assert!(steps[1].contains("security"));
    assert!(steps[2].contains("compliance"));
    assert!(steps[3].contains("sentiment"));
    assert_eq!(
        explanations[0].payload["decision_id"].as_str().unwrap(),
        decision_id.to_string()
    );
}

/// S2: autonomous decisions gate on confidence; one missing required
/// criterion passes at 0.9, two fall to 0.8 and are rejected.
#[tokio::test]
async fn s2_autonomous_gated_by_confidence() {
    let one_missing: Vec<(&str, f64)> = FULL_INPUTS
        .iter()
        .filter(|(name, _)| *name != "sentiment")
        .copied()
        .collect();
    let s = stack(
        vec![candidate(
            DecisionLevel::Autonomous,
            &one_missing,
            ActionKind::Propose,
            None,
        )],
        None,
    );
    s.governance.tick(&CancellationToken::new()).await;
    assert_eq!(s.governance.stats().decisions_approved, 1);

    let two_missing: Vec<(&str, f64)> = FULL_INPUTS
        .iter()
        .filter(|(name, _)| *name != "sentiment" && *name != "compliance")
        .copied()
        .collect();
    let s = stack(
        vec![candidate(
            DecisionLevel::Autonomous,
            &two_missing,
            ActionKind::Propose,
            None,
        )],
        None,
    );
    s.governance.tick(&CancellationToken::new()).await;
    assert_eq!(s.governance.stats().decisions_rejected, 1);

    let now = s.clock.now_utc();
    let outcomes = s.memory.range(
        RecordKind::Outcome,
        now - chrono::Duration::minutes(1),
        now + chrono::Duration::minutes(1),
    );
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        outcomes[0].payload["notes"].as_str().unwrap(),
        "InsufficientConfidence"
    );
}

/// S3: sequential spends of 400, 400, 300 against a 1000 daily cap: third
/// fails, and a 300 spend is admitted after the day rolls over.
#[tokio::test]
async fn s3_spending_enforcement() {
    let spends = vec![
        candidate(DecisionLevel::Advisory, &FULL_INPUTS, ActionKind::Spend, Some(400.0)),
        candidate(DecisionLevel::Advisory, &FULL_INPUTS, ActionKind::Spend, Some(400.0)),
        candidate(DecisionLevel::Advisory, &FULL_INPUTS, ActionKind::Spend, Some(300.0)),
    ];
    let s = stack(spends, None);
    s.governance.tick(&CancellationToken::new()).await;

    assert_eq!(s.sink.submissions.load(Ordering::SeqCst), 2);
    let status = s.spending.status("treasury", "usd").unwrap();
    assert_eq!(status.daily_spent, 800.0);
    let stats = s.governance.stats();
    assert_eq!(stats.decisions_approved, 2);
    assert_eq!(stats.decisions_rejected, 1);

    // After rollover a 300 spend fits the fresh daily budget.
    s.clock.advance(Duration::from_secs(24 * 3600));
    let request = ActionRequest {
        id: Uuid::new_v4(),
        actor: "treasury".to_string(),
        kind: ActionKind::Spend,
        payload: serde_json::json!({}),
        not_before: s.clock.now_utc() - chrono::Duration::seconds(1),
        expires_at: s.clock.now_utc() + chrono::Duration::hours(1),
        cost: Some(ActionCost {
            asset: "usd".to_string(),
            amount: 300.0,
        }),
        target_actor: None,
        decision_id: None,
        decision_level: None,
    };
    let result = s.executor.submit(request).await.unwrap();
    assert!(result.success);
    assert_eq!(s.spending.status("treasury", "usd").unwrap().daily_spent, 300.0);
}

/// S5: an emergency arriving mid-tick stops further submissions; the
/// in-flight one completes, subsequent ticks are skipped, and recovery
/// re-enters Paused through the lifecycle.
#[tokio::test]
async fn s5_emergency_drain_mid_tick() {
    let spends = vec![
        candidate(DecisionLevel::Advisory, &FULL_INPUTS, ActionKind::Propose, None);
        3
    ];
    // The mode flips to Emergency during the first sink call.
    let s = stack(spends, Some(1));
    s.governance.tick(&CancellationToken::new()).await;

    // First submission completed; the remaining two never started.
    assert_eq!(s.sink.submissions.load(Ordering::SeqCst), 1);
    assert_eq!(s.mode.current(), OperatingMode::Emergency);
    assert!(s.executor.drain(Duration::from_secs(1)).await);

    // A subsequent tick opens no work in emergency mode.
    s.governance.tick(&CancellationToken::new()).await;
    assert_eq!(s.sink.submissions.load(Ordering::SeqCst), 1);
}

/// S6: fifty consecutive successes relax the autonomous threshold by at
/// most max_delta_per_window per hour, stepping down each window.
#[tokio::test]
async fn s6_threshold_adaptation_bounded_per_window() {
    let s = stack(vec![], None);
    for _ in 0..50 {
        s.confidence
            .record(DecisionLevel::Autonomous, Uuid::new_v4(), true, 1.0)
            .unwrap();
    }
    let after_first_window = s.confidence.threshold_for(DecisionLevel::Autonomous);
    assert!((after_first_window - 0.80).abs() < 1e-9);

    // Next hour: the window budget refreshes and adaptation continues.
    s.clock.advance(Duration::from_secs(3601));
    for _ in 0..10 {
        s.confidence
            .record(DecisionLevel::Autonomous, Uuid::new_v4(), true, 1.0)
            .unwrap();
    }
    let after_second_window = s.confidence.threshold_for(DecisionLevel::Autonomous);
    assert!(after_second_window < after_first_window);
    assert!(after_second_window >= 0.50);
}

/// Property 1 over the archive: every executed decision carried confidence
/// at or above its level threshold at execution time.
#[tokio::test]
async fn executed_decisions_meet_threshold() {
    let mixed = vec![
        candidate(DecisionLevel::Advisory, &FULL_INPUTS, ActionKind::Propose, None),
        candidate(
            DecisionLevel::Autonomous,
            &[("financial", 0.9), ("security", 0.8)],
            ActionKind::Propose,
            None,
        ),
        candidate(DecisionLevel::Autonomous, &FULL_INPUTS, ActionKind::Propose, None),
    ];
    let s = stack(mixed, None);
    let mut events = s.bus.subscribe_telemetry(Topic::Decisions);
    s.governance.tick(&CancellationToken::new()).await;

    let mut seen = 0;
    while let Ok(event) = events.try_recv() {
        if let Event::DecisionCompleted {
            approved,
            confidence,
            level,
            ..
        } = event
        {
            seen += 1;
            if approved {
                assert!(confidence >= s.confidence.threshold_for(level));
            }
        }
    }
    assert_eq!(seen, 3);
}

/// Confidence exactly at the threshold boundary is approved (>= gate).
#[tokio::test]
async fn confidence_exactly_at_threshold_approves() {
    // One missing required criterion puts confidence at exactly 0.9; the
    // autonomous threshold is configured to the same value.
    let one_missing: Vec<(&str, f64)> = FULL_INPUTS
        .iter()
        .filter(|(name, _)| *name != "sentiment")
        .copied()
        .collect();
    let s = stack_with_thresholds(
        vec![candidate(
            DecisionLevel::Autonomous,
            &one_missing,
            ActionKind::Propose,
            None,
        )],
        None,
        ThresholdConfig {
            autonomous: 0.9,
            ..ThresholdConfig::default()
        },
    );
    s.governance.tick(&CancellationToken::new()).await;
    assert_eq!(s.governance.stats().decisions_approved, 1);
}
