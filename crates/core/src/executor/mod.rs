//! Guarded execution of approved actions
//!
//! Admission order for every request: operating mode, time window, rate
//! limit, spending pre-deduction. Only an admitted request reaches the
//! external action sink; a downstream failure restores the spending
//! counters through an idempotent compensating credit. Per (actor, kind)
//! at most one request is in flight, later arrivals queue FIFO up to
//! `queue_max`, and anything beyond that fails `Overloaded`.

pub mod spending;

pub use spending::{SpendingLimits, SpendingPolicy, SpendingStatus};

use crate::clock::Clock;
use crate::config::ExecutorConfig;
use crate::confidence::ConfidenceManager;
use crate::error::{CoreError, CoreResult};
use crate::memory::MemoryStore;
use crate::orchestrator::ModeHandle;
use crate::ports::{retry, with_deadline, ActionSink};
use crate::ratelimit::RateLimiter;
use crate::types::{ActionKind, ActionRequest, ExecutionResult, Outcome};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument, warn};

struct Lane {
    /// Waiting + executing submissions on this (actor, kind) pair.
    outstanding: AtomicUsize,
    gate: tokio::sync::Mutex<()>,
}

/// Admission-gated bridge between approved decisions and the action sink.
pub struct ActionExecutor {
    clock: Arc<dyn Clock>,
    mode: ModeHandle,
    rate_limiter: Arc<RateLimiter>,
    spending: Arc<SpendingLimits>,
    memory: Arc<MemoryStore>,
    confidence: Arc<ConfidenceManager>,
    sink: Arc<dyn ActionSink>,
    config: ExecutorConfig,
    lanes: Mutex<HashMap<(String, ActionKind), Arc<Lane>>>,
    in_flight: AtomicUsize,
}

impl ActionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        mode: ModeHandle,
        rate_limiter: Arc<RateLimiter>,
        spending: Arc<SpendingLimits>,
        memory: Arc<MemoryStore>,
        confidence: Arc<ConfidenceManager>,
        sink: Arc<dyn ActionSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            clock,
            mode,
            rate_limiter,
            spending,
            memory,
            confidence,
            sink,
            config,
            lanes: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Submit a request for guarded execution. Admission failures return an
    /// error and leave no trace; post-admission failures return a
    /// non-success `ExecutionResult` with counters compensated and the
    /// outcome recorded.
    #[instrument(skip(self, request), fields(request_id = %request.id, actor = %request.actor, kind = request.kind.as_str()))]
    pub async fn submit(&self, request: ActionRequest) -> CoreResult<ExecutionResult> {
        let lane = self.lane(&request.actor, request.kind);

        // Reserve a queue slot: one in flight plus queue_max waiting.
        let mut outstanding = lane.outstanding.load(Ordering::SeqCst);
        loop {
            if outstanding > self.config.queue_max {
                return Err(CoreError::Overloaded(format!(
                    "queue for ({}, {}) is at capacity {}",
                    request.actor,
                    request.kind.as_str(),
                    self.config.queue_max
                )));
            }
            match lane.outstanding.compare_exchange(
                outstanding,
                outstanding + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => outstanding = current,
            }
        }

        // The tokio mutex queues waiters fairly, preserving per-actor FIFO.
        let result = {
            let _gate = lane.gate.lock().await;
            self.admit_and_execute(&request).await
        };
        lane.outstanding.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn admit_and_execute(&self, request: &ActionRequest) -> CoreResult<ExecutionResult> {
        let mode = self.mode.current();
        if !mode.admits(request.kind) {
            return Err(CoreError::InvalidInput(format!(
                "operating mode {} does not admit {}",
                mode.as_str(),
                request.kind.as_str()
            )));
        }

        let now = self.clock.now_utc();
        if now < request.not_before {
            return Err(CoreError::InvalidInput(format!(
                "request {} not valid before {}",
                request.id, request.not_before
            )));
        }
        if now >= request.expires_at {
            return Err(CoreError::InvalidInput(format!(
                "request {} expired at {}",
                request.id, request.expires_at
            )));
        }

        let admission = self.rate_limiter.may_act(&request.actor);
        if !admission.ok {
            return Err(CoreError::QuotaExceeded {
                actor: request.actor.clone(),
                detail: "action rate limit".to_string(),
                retry_after: admission.retry_after,
            });
        }

        let mut debited: Option<(&str, &str)> = None;
        if request.kind.is_spending() {
            let cost = request.cost.as_ref().ok_or_else(|| {
                CoreError::InvalidInput(format!(
                    "{} request {} carries no cost",
                    request.kind.as_str(),
                    request.id
                ))
            })?;
            self.spending
                .commit(request.id, &request.actor, &cost.asset, cost.amount)?;
            debited = Some((request.actor.as_str(), cost.asset.as_str()));
        }

        if let Err(e) = self.rate_limiter.register(&request.actor) {
            if let Some((actor, asset)) = debited {
                self.spending.credit(request.id, actor, asset)?;
            }
            return Err(e);
        }

        // Admitted. From here on failures are execution results, not
        // rejections.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let timeout = Duration::from_secs(self.config.timeout_sec);
        let submit_outcome = retry("sink submit", || {
            with_deadline(timeout, "sink submit", self.sink.submit(request))
        })
        .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let result = match submit_outcome {
            Ok(receipt) if receipt.accepted => {
                debug!(request_id = %request.id, "action accepted by sink");
                ExecutionResult {
                    request_id: request.id,
                    success: true,
                    observable_effect: receipt.reason,
                    cost_delta: request.cost.clone(),
                }
            }
            Ok(receipt) => {
                warn!(request_id = %request.id, reason = ?receipt.reason, "sink refused action");
                if let Some((actor, asset)) = debited {
                    self.spending.credit(request.id, actor, asset)?;
                }
                ExecutionResult {
                    request_id: request.id,
                    success: false,
                    observable_effect: receipt.reason,
                    cost_delta: None,
                }
            }
            Err(e) => {
                warn!(request_id = %request.id, error = %e, "sink submission failed");
                if let Some((actor, asset)) = debited {
                    self.spending.credit(request.id, actor, asset)?;
                }
                ExecutionResult {
                    request_id: request.id,
                    success: false,
                    observable_effect: Some(e.to_string()),
                    cost_delta: None,
                }
            }
        };

        self.record_result(request, &result)?;
        Ok(result)
    }

    /// Feed the result back into memory and threshold adaptation. A failed
    /// long-term write surfaces, so the decision is never acknowledged as
    /// executed over a lost record.
    fn record_result(&self, request: &ActionRequest, result: &ExecutionResult) -> CoreResult<()> {
        let outcome = Outcome {
            decision_id: request.decision_id.unwrap_or(request.id),
            success: result.success,
            observed_at: self.clock.now_utc(),
            magnitude: if result.success { 1.0 } else { -1.0 },
            notes: result.observable_effect.clone(),
        };
        self.memory.record_outcome(request.id, &outcome)?;
        if let Some(level) = request.decision_level {
            self.confidence
                .record(level, request.id, result.success, outcome.magnitude)?;
        }
        Ok(())
    }

    fn lane(&self, actor: &str, kind: ActionKind) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().unwrap();
        lanes
            .entry((actor.to_string(), kind))
            .or_insert_with(|| {
                Arc::new(Lane {
                    outstanding: AtomicUsize::new(0),
                    gate: tokio::sync::Mutex::new(()),
                })
            })
            .clone()
    }

    /// Total queued or executing submissions, for health reporting.
    pub fn queue_depth(&self) -> usize {
        let lanes = self.lanes.lock().unwrap();
        lanes
            .values()
            .map(|l| l.outstanding.load(Ordering::SeqCst))
            .sum()
    }

    /// Wait for in-flight sink calls to finish, up to `deadline`. Returns
    /// whether the executor fully drained.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let poll = Duration::from_millis(25);
        let started = self.clock.now();
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            if self.clock.now().saturating_sub(started) >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }
}
