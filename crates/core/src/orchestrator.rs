//! Orchestrator: operating mode and component lifecycles
//!
//! The orchestrator owns the single process-wide `OperatingMode` behind an
//! atomic accessor and reacts to health signals: Degraded slows the
//! governance cadence and pauses improvement work, sustained degradation
//! pauses the system, an emergency stops new work, drains the executor,
//! persists a marker record and alerts. Emergency is only left through an
//! explicit `recover()` into Paused, and `resume()` re-enters Normal only
//! over a healthy snapshot.

use crate::bus::{Event, EventBus, Topic};
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::executor::ActionExecutor;
use crate::governance::GovernanceLoop;
use crate::health::HealthMonitor;
use crate::improvement::ImprovementEngine;
use crate::memory::MemoryStore;
use crate::ports::{AlertSeverity, Alerting};
use crate::types::{MemoryRecord, OperatingMode, RecordKind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Cloneable atomic accessor for the process-wide operating mode. Only the
/// orchestrator transitions it; everyone else reads.
#[derive(Clone)]
pub struct ModeHandle {
    inner: Arc<AtomicU8>,
}

impl ModeHandle {
    pub fn new(mode: OperatingMode) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(encode(mode))),
        }
    }

    pub fn current(&self) -> OperatingMode {
        decode(self.inner.load(Ordering::SeqCst))
    }

    /// Overwrite the mode. Transitions belong to the orchestrator; other
    /// callers read.
    pub fn set(&self, mode: OperatingMode) {
        self.inner.store(encode(mode), Ordering::SeqCst);
    }
}

fn encode(mode: OperatingMode) -> u8 {
    match mode {
        OperatingMode::Normal => 0,
        OperatingMode::Degraded => 1,
        OperatingMode::Paused => 2,
        OperatingMode::Emergency => 3,
    }
}

fn decode(raw: u8) -> OperatingMode {
    match raw {
        0 => OperatingMode::Normal,
        1 => OperatingMode::Degraded,
        2 => OperatingMode::Paused,
        _ => OperatingMode::Emergency,
    }
}

/// Coordinates loops and owns mode transitions.
pub struct Orchestrator {
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    mode: ModeHandle,
    bus: Arc<EventBus>,
    memory: Arc<MemoryStore>,
    executor: Arc<ActionExecutor>,
    governance: Arc<GovernanceLoop>,
    improvement: Arc<ImprovementEngine>,
    health: Arc<HealthMonitor>,
    alerting: Arc<dyn Alerting>,
    root_cancel: CancellationToken,
    loop_cancel: CancellationToken,
    health_cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    degraded_since: Mutex<Option<Duration>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        config: CoreConfig,
        mode: ModeHandle,
        bus: Arc<EventBus>,
        memory: Arc<MemoryStore>,
        executor: Arc<ActionExecutor>,
        governance: Arc<GovernanceLoop>,
        improvement: Arc<ImprovementEngine>,
        health: Arc<HealthMonitor>,
        alerting: Arc<dyn Alerting>,
    ) -> Self {
        let root_cancel = CancellationToken::new();
        let loop_cancel = root_cancel.child_token();
        let health_cancel = root_cancel.child_token();
        Self {
            clock,
            config,
            mode,
            bus,
            memory,
            executor,
            governance,
            improvement,
            health,
            alerting,
            root_cancel,
            loop_cancel,
            health_cancel,
            tasks: Mutex::new(Vec::new()),
            degraded_since: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> ModeHandle {
        self.mode.clone()
    }

    /// Spawn the monitoring loop, then the work loops, then the signal
    /// dispatcher. Passive components (memory, bus, evaluator, executor)
    /// were constructed before this point.
    pub fn start(self: Arc<Self>) {
        info!("orchestrator starting components");
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(
            self.health.clone().run(self.health_cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.governance.clone().run(self.loop_cancel.clone()),
        ));
        tasks.push(tokio::spawn(
            self.improvement.clone().run(self.loop_cancel.clone()),
        ));
        let this = Arc::clone(&self);
        tasks.push(tokio::spawn(async move {
            this.dispatch_signals().await;
        }));
    }

    /// React to health and error signals and watch the
    /// sustained-degradation timer.
    async fn dispatch_signals(self: Arc<Self>) {
        let mut health_rx = self.bus.subscribe_telemetry(Topic::Health);
        let mut errors_rx = self.bus.subscribe_telemetry(Topic::Errors);
        let grace_poll = Duration::from_secs(5);
        loop {
            tokio::select! {
                _ = self.root_cancel.cancelled() => break,
                _ = tokio::time::sleep(grace_poll) => {
                    self.check_paused_grace().await;
                }
                event = errors_rx.recv() => {
                    // Fatal conditions are never absorbed: they end in
                    // Emergency no matter which component raised them.
                    if let Ok(Event::ComponentError { component, kind, detail, .. }) = event {
                        if kind == "fatal" {
                            self.emergency(&format!("{component}: {detail}")).await;
                        }
                    }
                }
                event = health_rx.recv() => match event {
                    Ok(Event::Degraded { detail, .. }) => {
                        if let Err(e) = self.degrade(&detail).await {
                            warn!(error = %e, "degrade transition refused");
                        }
                    }
                    Ok(Event::EmergencySignal { reason, .. }) => {
                        self.emergency(&reason).await;
                    }
                    Ok(Event::HealthReport { score, .. }) => {
                        // Recovery path of the Normal <-> Degraded pair.
                        if self.mode.current() == OperatingMode::Degraded
                            && score >= self.config.health.warn_threshold
                        {
                            let _ = self.transition(
                                OperatingMode::Normal,
                                "health recovered above warn threshold",
                            )
                            .await;
                            *self.degraded_since.lock().unwrap() = None;
                        }
                    }
                    Ok(_) => {}
                    Err(_) => {} // lagged; signals are re-emitted every interval
                }
            }
        }
    }

    async fn check_paused_grace(&self) {
        let grace = Duration::from_secs(self.config.modes.paused_grace_sec);
        let since = *self.degraded_since.lock().unwrap();
        if self.mode.current() == OperatingMode::Degraded {
            if let Some(since) = since {
                if self.clock.now().saturating_sub(since) >= grace {
                    warn!("degraded beyond grace period, pausing");
                    let _ = self
                        .transition(OperatingMode::Paused, "sustained degradation")
                        .await;
                }
            }
        }
    }

    /// Normal -> Degraded. Recent auto-merges inside the rollback window are
    /// reverted as part of the transition.
    pub async fn degrade(&self, reason: &str) -> CoreResult<()> {
        match self.mode.current() {
            OperatingMode::Normal => {
                *self.degraded_since.lock().unwrap() = Some(self.clock.now());
                self.transition(OperatingMode::Degraded, reason).await?;
                self.improvement.on_health_degraded().await;
                Ok(())
            }
            OperatingMode::Degraded => Ok(()),
            other => Err(CoreError::InvalidInput(format!(
                "cannot degrade from {}",
                other.as_str()
            ))),
        }
    }

    /// Operator-requested pause from Normal or Degraded.
    pub async fn pause(&self, reason: &str) -> CoreResult<()> {
        match self.mode.current() {
            OperatingMode::Normal | OperatingMode::Degraded => {
                self.transition(OperatingMode::Paused, reason).await
            }
            OperatingMode::Paused => Ok(()),
            OperatingMode::Emergency => Err(CoreError::InvalidInput(
                "emergency is left via recover(), not pause()".to_string(),
            )),
        }
    }

    /// Any -> Emergency: stop opening work, drain the executor, persist a
    /// marker record, alert.
    pub async fn emergency(&self, reason: &str) {
        if self.mode.current() == OperatingMode::Emergency {
            return;
        }
        error!(reason, "entering emergency mode");
        let _ = self.transition(OperatingMode::Emergency, reason).await;

        let drained = self
            .executor
            .drain(Duration::from_secs(self.config.modes.drain_deadline_sec))
            .await;
        if !drained {
            error!("executor did not drain within the deadline");
        }

        let record = MemoryRecord::new(
            RecordKind::Observation,
            serde_json::json!({
                "event": "emergency",
                "reason": reason,
                "drained": drained,
            }),
        );
        if let Err(e) = self.memory.put(record) {
            error!(error = %e, "failed to persist emergency record");
        }
        self.alerting
            .alert(
                AlertSeverity::Critical,
                "steward entered emergency mode",
                serde_json::json!({ "reason": reason, "drained": drained }),
            )
            .await;
    }

    /// Emergency -> Paused, after manual acknowledgement.
    pub async fn recover(&self) -> CoreResult<()> {
        if self.mode.current() != OperatingMode::Emergency {
            return Err(CoreError::InvalidInput(format!(
                "recover() applies to emergency mode, current mode is {}",
                self.mode.current().as_str()
            )));
        }
        *self.degraded_since.lock().unwrap() = None;
        self.transition(OperatingMode::Paused, "manual recovery acknowledged")
            .await
    }

    /// Paused -> Normal, only over a healthy last snapshot.
    pub async fn resume(&self) -> CoreResult<()> {
        if self.mode.current() != OperatingMode::Paused {
            return Err(CoreError::InvalidInput(format!(
                "resume() applies to paused mode, current mode is {}",
                self.mode.current().as_str()
            )));
        }
        let healthy = self
            .health
            .last_snapshot()
            .map(|s| s.is_healthy(&self.config.health))
            .unwrap_or(false);
        if !healthy {
            return Err(CoreError::InvalidInput(
                "last health snapshot is not healthy, refusing to resume".to_string(),
            ));
        }
        *self.degraded_since.lock().unwrap() = None;
        self.transition(OperatingMode::Normal, "operator resume").await
    }

    async fn transition(&self, to: OperatingMode, reason: &str) -> CoreResult<()> {
        let from = self.mode.current();
        if from == to {
            return Ok(());
        }
        self.mode.set(to);
        info!(from = from.as_str(), to = to.as_str(), reason, "operating mode changed");
        self.bus
            .publish(Event::ModeChanged {
                event_id: Uuid::new_v4(),
                from,
                to,
                reason: reason.to_string(),
                timestamp: self.clock.now_utc(),
            })
            .await
    }

    /// Reverse-order shutdown: stop the work loops, drain the executor,
    /// then stop monitoring.
    pub async fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.loop_cancel.cancel();
        let drained = self
            .executor
            .drain(Duration::from_secs(self.config.modes.drain_deadline_sec))
            .await;
        if !drained {
            warn!("executor still had in-flight work at shutdown deadline");
        }
        self.health_cancel.cancel();
        self.root_cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ThresholdConfig;
    use crate::confidence::ConfidenceManager;
    use crate::error::CoreResult;
    use crate::evaluator::{default_policies, Evaluator};
    use crate::executor::SpendingLimits;
    use crate::memory::MemoryConfig;
    use crate::ports::{
        ActionSink, GovernanceEvent, GovernanceSnapshot, CommitSpec, ResourceProbe,
        ResourceSnapshot, SandboxRunner, SourceRepository, SubmitReceipt, TestReport,
        GovernanceSource,
    };
    use crate::ratelimit::{RateLimiter, RatePolicy};
    use crate::types::ActionRequest;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicBool;

    struct NullSink;

    #[async_trait]
    impl ActionSink for NullSink {
        async fn submit(&self, request: &ActionRequest) -> CoreResult<SubmitReceipt> {
            Ok(SubmitReceipt {
                accepted: true,
                id: request.id,
                reason: None,
            })
        }
        async fn status(&self, _id: Uuid) -> CoreResult<crate::ports::SinkStatus> {
            Ok(crate::ports::SinkStatus {
                state: "done".to_string(),
                result: None,
            })
        }
    }

    struct EmptySource;

    #[async_trait]
    impl GovernanceSource for EmptySource {
        async fn snapshot(&self) -> CoreResult<GovernanceSnapshot> {
            Ok(GovernanceSnapshot::default())
        }
        async fn events_since(&self, _cursor: u64) -> CoreResult<Vec<GovernanceEvent>> {
            Ok(vec![])
        }
    }

    struct NullRepo;

    #[async_trait]
    impl SourceRepository for NullRepo {
        async fn list_changed_paths(&self, _since: &str) -> CoreResult<Vec<String>> {
            Ok(vec![])
        }
        async fn read(&self, _path: &str, _rev: &str) -> CoreResult<Vec<u8>> {
            Ok(vec![])
        }
        async fn propose_change(
            &self,
            _branch: &str,
            _commits: &[CommitSpec],
            _description: &str,
        ) -> CoreResult<String> {
            Ok("pr-0".to_string())
        }
        async fn merge(&self, _pr_id: &str, _strategy: &str) -> CoreResult<String> {
            Ok("commit-0".to_string())
        }
        async fn revert(&self, _commit_id: &str) -> CoreResult<String> {
            Ok("revert-0".to_string())
        }
        async fn head(&self) -> CoreResult<String> {
            Ok("head".to_string())
        }
    }

    struct NullSandbox;

    #[async_trait]
    impl SandboxRunner for NullSandbox {
        async fn prepare(&self, _base_rev: &str, _diff: &str) -> CoreResult<String> {
            Ok("ws".to_string())
        }
        async fn run_tests(
            &self,
            _workspace_id: &str,
            _command: &str,
            _timeout: Duration,
        ) -> CoreResult<TestReport> {
            Ok(TestReport {
                passed: true,
                failures: vec![],
                duration: Duration::from_millis(1),
            })
        }
        async fn dispose(&self, _workspace_id: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    struct IdleProbe;

    #[async_trait]
    impl ResourceProbe for IdleProbe {
        async fn snapshot(&self) -> CoreResult<ResourceSnapshot> {
            Ok(ResourceSnapshot {
                cpu_pct: 5.0,
                mem_bytes: 0,
                disk_bytes: 0,
                loadavg: 0.2,
            })
        }
    }

    struct RecordingAlerter {
        fired: AtomicBool,
    }

    #[async_trait]
    impl crate::ports::Alerting for RecordingAlerter {
        async fn alert(
            &self,
            _severity: crate::ports::AlertSeverity,
            _summary: &str,
            _payload: serde_json::Value,
        ) {
            self.fired.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        orchestrator: Arc<Orchestrator>,
        alerter: Arc<RecordingAlerter>,
        health: Arc<HealthMonitor>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        ));
        let config = CoreConfig::default();
        let mode = ModeHandle::new(OperatingMode::Normal);
        let bus = Arc::new(EventBus::default());
        let memory =
            Arc::new(MemoryStore::new(clock.clone(), MemoryConfig::default()).unwrap());
        let confidence = Arc::new(ConfidenceManager::new(
            clock.clone(),
            ThresholdConfig::default(),
        ));
        let evaluator = Arc::new(Evaluator::new(default_policies()).unwrap());
        let rate_limiter = Arc::new(RateLimiter::new(
            clock.clone(),
            RatePolicy::new(Duration::ZERO, 1000),
        ));
        let spending = Arc::new(SpendingLimits::new(clock.clone()));
        let executor = Arc::new(ActionExecutor::new(
            clock.clone(),
            mode.clone(),
            rate_limiter,
            spending,
            memory.clone(),
            confidence.clone(),
            Arc::new(NullSink),
            config.executor.clone(),
        ));
        let governance = Arc::new(GovernanceLoop::new(
            clock.clone(),
            mode.clone(),
            bus.clone(),
            memory.clone(),
            evaluator,
            confidence,
            executor.clone(),
            Arc::new(EmptySource),
            Duration::from_secs(60),
        ));
        let improvement = Arc::new(
            ImprovementEngine::new(
                clock.clone(),
                mode.clone(),
                bus.clone(),
                Arc::new(NullRepo),
                Arc::new(NullSandbox),
                config.improvement.clone(),
                Duration::from_secs(300),
                "cargo test",
                None,
            )
            .unwrap(),
        );
        let health = Arc::new(HealthMonitor::new(
            clock.clone(),
            bus.clone(),
            Arc::new(IdleProbe),
            executor.clone(),
            config.health.clone(),
            Duration::from_secs(30),
        ));
        let alerter = Arc::new(RecordingAlerter {
            fired: AtomicBool::new(false),
        });
        let orchestrator = Arc::new(Orchestrator::new(
            clock.clone(),
            config,
            mode,
            bus,
            memory,
            executor,
            governance,
            improvement,
            health.clone(),
            alerter.clone(),
        ));
        Harness {
            clock,
            orchestrator,
            alerter,
            health,
        }
    }

    #[tokio::test]
    async fn test_degrade_then_recover_to_normal_is_refused_directly() {
        let h = harness();
        h.orchestrator.degrade("test signal").await.unwrap();
        assert_eq!(h.orchestrator.mode().current(), OperatingMode::Degraded);
        // recover() only applies to emergency.
        assert!(h.orchestrator.recover().await.is_err());
    }

    #[tokio::test]
    async fn test_emergency_from_any_mode_and_alerts() {
        let h = harness();
        h.orchestrator.degrade("first").await.unwrap();
        h.orchestrator.emergency("queue meltdown").await;
        assert_eq!(h.orchestrator.mode().current(), OperatingMode::Emergency);
        assert!(h.alerter.fired.load(Ordering::SeqCst));

        // Emergency exits only through recover() into Paused.
        assert!(h.orchestrator.pause("nope").await.is_err());
        h.orchestrator.recover().await.unwrap();
        assert_eq!(h.orchestrator.mode().current(), OperatingMode::Paused);
    }

    #[tokio::test]
    async fn test_resume_requires_healthy_snapshot() {
        let h = harness();
        h.orchestrator.pause("operator").await.unwrap();
        // No snapshot yet: refuse.
        assert!(h.orchestrator.resume().await.is_err());

        h.health.take_snapshot().await.unwrap();
        h.orchestrator.resume().await.unwrap();
        assert_eq!(h.orchestrator.mode().current(), OperatingMode::Normal);
    }

    #[tokio::test]
    async fn test_degrade_from_paused_refused() {
        let h = harness();
        h.orchestrator.pause("operator").await.unwrap();
        assert!(h.orchestrator.degrade("late signal").await.is_err());
        assert_eq!(h.orchestrator.mode().current(), OperatingMode::Paused);
    }

    #[tokio::test]
    async fn test_emergency_is_idempotent() {
        let h = harness();
        h.orchestrator.emergency("one").await;
        h.orchestrator.emergency("two").await;
        assert_eq!(h.orchestrator.mode().current(), OperatingMode::Emergency);
    }

    #[tokio::test]
    async fn test_sustained_degradation_pauses() {
        let h = harness();
        h.orchestrator.degrade("signal").await.unwrap();
        h.clock.advance(Duration::from_secs(601));
        h.orchestrator.check_paused_grace().await;
        assert_eq!(h.orchestrator.mode().current(), OperatingMode::Paused);
    }

    #[test]
    fn test_mode_handle_roundtrip() {
        for mode in [
            OperatingMode::Normal,
            OperatingMode::Degraded,
            OperatingMode::Paused,
            OperatingMode::Emergency,
        ] {
            let handle = ModeHandle::new(mode);
            assert_eq!(handle.current(), mode);
        }
    }
}
