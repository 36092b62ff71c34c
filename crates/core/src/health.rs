//! Health monitoring
//!
//! Every interval the monitor assembles a snapshot: resource usage from the
//! probe, queue depths from the bus and the executor, error counts gathered
//! off the errors topic since the last snapshot, and decision latency
//! percentiles over the last five minutes. The health score is the minimum
//! of the resource, error and latency sub-scores. Crossing the warn
//! threshold publishes a Degraded event; crossing the critical threshold or
//! accumulating consecutive probe failures publishes an Emergency signal.

use crate::bus::{Event, EventBus, Topic};
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::executor::ActionExecutor;
use crate::ports::{with_deadline, ResourceProbe, ResourceSnapshot, CALL_DEADLINE};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Window for latency percentiles.
const LATENCY_WINDOW: Duration = Duration::from_secs(300);
/// Errors per interval that zero out the error sub-score.
const ERROR_BUDGET: f64 = 10.0;
/// p95 decision latency that zeroes out the latency sub-score.
const LATENCY_BUDGET_MS: f64 = 30_000.0;
/// Load average treated as saturation.
const LOAD_SATURATION: f64 = 8.0;

/// Sub-scores feeding the overall health score.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SubScores {
    pub resources: f64,
    pub errors: f64,
    pub latency: f64,
}

/// Decision latency percentiles in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyPercentiles {
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub samples: usize,
}

/// One periodic health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: chrono::DateTime<chrono::Utc>,
    pub resources: ResourceSnapshot,
    pub bus_queue_depths: Vec<(String, usize)>,
    pub executor_queue_depth: usize,
    pub error_counts: HashMap<String, u64>,
    pub latency: LatencyPercentiles,
    pub sub_scores: SubScores,
    pub health_score: f64,
}

impl HealthSnapshot {
    pub fn is_healthy(&self, config: &HealthConfig) -> bool {
        self.health_score >= config.warn_threshold
    }
}

/// Periodic health snapshot producer.
pub struct HealthMonitor {
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    probe: Arc<dyn ResourceProbe>,
    executor: Arc<ActionExecutor>,
    config: HealthConfig,
    interval: Duration,
    latencies: Mutex<VecDeque<(Duration, u64)>>,
    error_counts: Mutex<HashMap<String, u64>>,
    consecutive_failures: AtomicU32,
    last: Mutex<Option<HealthSnapshot>>,
}

impl HealthMonitor {
    pub fn new(
        clock: Arc<dyn Clock>,
        bus: Arc<EventBus>,
        probe: Arc<dyn ResourceProbe>,
        executor: Arc<ActionExecutor>,
        config: HealthConfig,
        interval: Duration,
    ) -> Self {
        Self {
            clock,
            bus,
            probe,
            executor,
            config,
            interval,
            latencies: Mutex::new(VecDeque::new()),
            error_counts: Mutex::new(HashMap::new()),
            consecutive_failures: AtomicU32::new(0),
            last: Mutex::new(None),
        }
    }

    /// Most recent snapshot, if one was taken.
    pub fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.last.lock().unwrap().clone()
    }

    /// Record a decision latency sample. Also fed internally from the
    /// decisions topic while `run` is active.
    pub fn observe_latency(&self, elapsed_ms: u64) {
        let now = self.clock.now();
        let mut latencies = self.latencies.lock().unwrap();
        latencies.push_back((now, elapsed_ms));
        while let Some((at, _)) = latencies.front() {
            if now.saturating_sub(*at) > LATENCY_WINDOW {
                latencies.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count an error against a component for the current interval.
    pub fn observe_error(&self, component: &str) {
        *self
            .error_counts
            .lock()
            .unwrap()
            .entry(component.to_string())
            .or_insert(0) += 1;
    }

    /// Run until cancelled: listen to bus traffic and emit a snapshot every
    /// interval.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "health monitor started");
        let mut errors_rx = self.bus.subscribe_telemetry(Topic::Errors);
        let mut decisions_rx = self.bus.subscribe_decisions(Topic::Decisions, "health");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = errors_rx.recv() => {
                    if let Ok(Event::ComponentError { component, .. }
                        | Event::Overloaded { component, .. }) = event
                    {
                        self.observe_error(&component);
                    }
                }
                event = decisions_rx.recv() => {
                    if let Some(Event::DecisionCompleted { elapsed_ms, .. }) = event {
                        self.observe_latency(elapsed_ms);
                    }
                }
                _ = ticker.tick() => {
                    self.take_snapshot().await;
                }
            }
        }
        info!("health monitor stopped");
    }

    /// Assemble one snapshot and publish the resulting signals.
    pub async fn take_snapshot(&self) -> Option<HealthSnapshot> {
        let resources = match with_deadline(
            CALL_DEADLINE,
            "resource probe",
            self.probe.snapshot(),
        )
        .await
        {
            Ok(snapshot) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                snapshot
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, failures, "resource probe failed");
                if failures >= self.config.consecutive_failure_limit {
                    self.publish_emergency(format!(
                        "{failures} consecutive resource probe failures"
                    ))
                    .await;
                }
                return None;
            }
        };

        let error_counts: HashMap<String, u64> =
            std::mem::take(&mut *self.error_counts.lock().unwrap());
        let latency = self.latency_percentiles();
        let bus_queue_depths: Vec<(String, usize)> = self
            .bus
            .queue_depths()
            .into_iter()
            .map(|(topic, depth)| (topic.as_str().to_string(), depth))
            .collect();
        let executor_queue_depth = self.executor.queue_depth();

        let sub_scores = SubScores {
            resources: resource_score(&resources),
            errors: error_score(&error_counts),
            latency: latency_score(&latency),
        };
        let health_score = sub_scores
            .resources
            .min(sub_scores.errors)
            .min(sub_scores.latency);

        let snapshot = HealthSnapshot {
            ts: self.clock.now_utc(),
            resources,
            bus_queue_depths,
            executor_queue_depth,
            error_counts,
            latency,
            sub_scores,
            health_score,
        };
        *self.last.lock().unwrap() = Some(snapshot.clone());

        debug!(health_score, "health snapshot taken");
        let _ = self
            .bus
            .publish(Event::HealthReport {
                event_id: Uuid::new_v4(),
                score: health_score,
                timestamp: snapshot.ts,
            })
            .await;

        if health_score < self.config.crit_threshold {
            self.publish_emergency(format!(
                "health score {health_score:.3} below critical threshold {}",
                self.config.crit_threshold
            ))
            .await;
        } else if health_score < self.config.warn_threshold {
            let _ = self
                .bus
                .publish(Event::Degraded {
                    event_id: Uuid::new_v4(),
                    score: health_score,
                    detail: format!(
                        "health score below warn threshold {}",
                        self.config.warn_threshold
                    ),
                    timestamp: snapshot.ts,
                })
                .await;
        }
        Some(snapshot)
    }

    async fn publish_emergency(&self, reason: String) {
        let _ = self
            .bus
            .publish(Event::EmergencySignal {
                event_id: Uuid::new_v4(),
                reason,
                timestamp: self.clock.now_utc(),
            })
            .await;
    }

    fn latency_percentiles(&self) -> LatencyPercentiles {
        let now = self.clock.now();
        let latencies = self.latencies.lock().unwrap();
        let mut samples: Vec<u64> = latencies
            .iter()
            .filter(|(at, _)| now.saturating_sub(*at) <= LATENCY_WINDOW)
            .map(|(_, ms)| *ms)
            .collect();
        if samples.is_empty() {
            return LatencyPercentiles::default();
        }
        samples.sort_unstable();
        LatencyPercentiles {
            p50_ms: percentile(&samples, 0.50),
            p95_ms: percentile(&samples, 0.95),
            p99_ms: percentile(&samples, 0.99),
            samples: samples.len(),
        }
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    let idx = ((sorted.len() as f64 * q).ceil() as usize).saturating_sub(1);
    sorted[idx.min(sorted.len() - 1)]
}

fn resource_score(resources: &ResourceSnapshot) -> f64 {
    let cpu = (1.0 - resources.cpu_pct / 100.0).clamp(0.0, 1.0);
    let load = (1.0 - resources.loadavg / LOAD_SATURATION).clamp(0.0, 1.0);
    cpu.min(load)
}

fn error_score(errors: &HashMap<String, u64>) -> f64 {
    let total: u64 = errors.values().sum();
    (1.0 - total as f64 / ERROR_BUDGET).clamp(0.0, 1.0)
}

fn latency_score(latency: &LatencyPercentiles) -> f64 {
    if latency.samples == 0 {
        return 1.0;
    }
    (1.0 - latency.p95_ms as f64 / LATENCY_BUDGET_MS).clamp(0.0, 1.0)
}
