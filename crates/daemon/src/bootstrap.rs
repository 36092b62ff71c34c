//! Component wiring
//!
//! Builds the full coordination stack in dependency order: memory store and
//! event bus first, then the passive engines (confidence, evaluator,
//! executor), then the monitors and loops, finally the orchestrator that
//! owns them. Loops are spawned by `Orchestrator::start`, monitoring
//! before governance and improvement.

use crate::adapters::{
    FileGovernanceSource, GitSourceRepository, LoggingActionSink, ProcResourceProbe,
    ProcessSandboxRunner, TracingAlerter,
};
use crate::api::AppState;
use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use steward_core::bus::{EventBus, EventJournal, DEFAULT_QUEUE_CAP, DEFAULT_SEND_TIMEOUT};
use steward_core::clock::SystemClock;
use steward_core::config::CoreConfig;
use steward_core::confidence::ConfidenceManager;
use steward_core::evaluator::{default_policies, Evaluator};
use steward_core::executor::{ActionExecutor, SpendingLimits};
use steward_core::governance::GovernanceLoop;
use steward_core::health::HealthMonitor;
use steward_core::improvement::ImprovementEngine;
use steward_core::memory::{MemoryConfig, MemoryStore};
use steward_core::orchestrator::{ModeHandle, Orchestrator};
use steward_core::ratelimit::{RateLimiter, RatePolicy};
use steward_core::types::OperatingMode;
use tracing::info;

/// Assemble every component and the orchestrator over them.
pub fn build(daemon_config: &DaemonConfig) -> Result<Arc<AppState>> {
    let core_config = match &daemon_config.core_config_path {
        Some(path) => {
            info!(path = %path.display(), "loading core config");
            CoreConfig::from_file(path).context("core config rejected")?
        }
        None => CoreConfig::default(),
    };
    core_config.validate().context("core config invalid")?;

    let clock = Arc::new(SystemClock::new());
    let mode = ModeHandle::new(OperatingMode::Normal);

    // Memory before the bus: the journal and decision archives live in the
    // same state directory.
    let memory = Arc::new(
        MemoryStore::new(
            clock.clone(),
            MemoryConfig {
                state_dir: Some(daemon_config.state_dir.clone()),
                ..MemoryConfig::default()
            },
        )
        .context("open memory store")?,
    );
    let journal = EventJournal::open(daemon_config.state_dir.join("events").join("log.jsonl"))
        .context("open event journal")?;
    let bus = Arc::new(EventBus::new(DEFAULT_QUEUE_CAP, DEFAULT_SEND_TIMEOUT).with_journal(journal));

    let confidence = Arc::new(ConfidenceManager::new(
        clock.clone(),
        core_config.thresholds.clone(),
    ));
    let evaluator = Arc::new(Evaluator::new(default_policies()).context("evaluator policies")?);

    let rate_limiter = Arc::new(RateLimiter::new(
        clock.clone(),
        RatePolicy::new(
            Duration::from_secs(core_config.executor.per_actor_min_interval_sec),
            core_config.executor.per_actor_daily_cap,
        ),
    ));
    let spending = Arc::new(
        SpendingLimits::open(clock.clone(), &daemon_config.state_dir)
            .context("open spending limits")?,
    );
    let executor = Arc::new(ActionExecutor::new(
        clock.clone(),
        mode.clone(),
        rate_limiter,
        spending,
        memory.clone(),
        confidence.clone(),
        Arc::new(LoggingActionSink::new()),
        core_config.executor.clone(),
    ));

    let health = Arc::new(HealthMonitor::new(
        clock.clone(),
        bus.clone(),
        Arc::new(ProcResourceProbe::new()),
        executor.clone(),
        core_config.health.clone(),
        Duration::from_secs(core_config.cadence.health_interval_sec),
    ));

    let governance = Arc::new(GovernanceLoop::new(
        clock.clone(),
        mode.clone(),
        bus.clone(),
        memory.clone(),
        evaluator.clone(),
        confidence.clone(),
        executor.clone(),
        Arc::new(FileGovernanceSource::new(daemon_config.governance_file.clone())),
        Duration::from_secs(core_config.cadence.governance_interval_sec),
    ));

    let improvement = Arc::new(
        ImprovementEngine::new(
            clock.clone(),
            mode.clone(),
            bus.clone(),
            Arc::new(GitSourceRepository::new(daemon_config.repo_dir.clone())),
            Arc::new(ProcessSandboxRunner::new(daemon_config.repo_dir.clone())),
            core_config.improvement.clone(),
            Duration::from_secs(core_config.cadence.improvement_interval_sec),
            daemon_config.test_command.clone(),
            Some(daemon_config.state_dir.clone()),
        )
        .context("improvement engine")?,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        clock,
        core_config,
        mode.clone(),
        bus,
        memory.clone(),
        executor.clone(),
        governance.clone(),
        improvement.clone(),
        health.clone(),
        Arc::new(TracingAlerter::new()),
    ));

    Ok(Arc::new(AppState {
        mode,
        orchestrator,
        governance,
        memory,
        confidence,
        evaluator,
        executor,
        health,
        improvement,
    }))
}
