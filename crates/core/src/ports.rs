//! External collaborator interfaces
//!
//! The core talks to the outside world only through these traits. Adapters
//! convert their transport failures into the core error kinds at this
//! boundary; business logic never sees a raw transport error. Every call
//! site wraps adapter futures in `with_deadline`, and retriable operations
//! go through `retry`.

use crate::error::{CoreError, CoreResult};
use crate::types::{
    ActionCost, ActionKind, ActionRequest, CriterionValue, DecisionLevel, ExecutionResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

/// Default per-call deadline for external calls.
pub const CALL_DEADLINE: Duration = Duration::from_secs(30);
/// Backoff for transient failures: base, cap, attempts.
pub const RETRY_BASE: Duration = Duration::from_secs(1);
pub const RETRY_CAP: Duration = Duration::from_secs(30);
pub const RETRY_ATTEMPTS: u32 = 3;

/// What to do when a candidate decision is approved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedAction {
    pub kind: ActionKind,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<ActionCost>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_actor: Option<String>,
}

/// A candidate decision surfaced by the governance source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDecision {
    /// External reference (proposal id or similar).
    pub reference: String,
    pub level: DecisionLevel,
    pub inputs: BTreeMap<String, CriterionValue>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub proposer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub action: ProposedAction,
}

/// Bounded snapshot of external governance state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceSnapshot {
    /// Monotonic cursor; events after it are retrievable via `events_since`.
    pub cursor: u64,
    pub candidates: Vec<CandidateDecision>,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A governance event with its monotonic cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceEvent {
    pub cursor: u64,
    pub payload: serde_json::Value,
}

/// Read side of the external governance system.
#[async_trait]
pub trait GovernanceSource: Send + Sync {
    async fn snapshot(&self) -> CoreResult<GovernanceSnapshot>;
    async fn events_since(&self, cursor: u64) -> CoreResult<Vec<GovernanceEvent>>;
}

/// Receipt for a submitted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub accepted: bool,
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// State of a previously submitted action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkStatus {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

/// Write side: where approved actions go. `submit` is idempotent by
/// `request.id`.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn submit(&self, request: &ActionRequest) -> CoreResult<SubmitReceipt>;
    async fn status(&self, id: Uuid) -> CoreResult<SinkStatus>;
}

/// A commit to propose against the source-of-truth repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitSpec {
    pub message: String,
    /// Unified diff applied by this commit.
    pub diff: String,
}

/// Source-of-truth repository operations. Authentication is the adapter's
/// concern, supplied by the host per call.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn list_changed_paths(&self, since: &str) -> CoreResult<Vec<String>>;
    async fn read(&self, path: &str, rev: &str) -> CoreResult<Vec<u8>>;
    async fn propose_change(
        &self,
        branch: &str,
        commits: &[CommitSpec],
        description: &str,
    ) -> CoreResult<String>;
    async fn merge(&self, pr_id: &str, strategy: &str) -> CoreResult<String>;
    async fn revert(&self, commit_id: &str) -> CoreResult<String>;
    /// Current head revision of the default branch.
    async fn head(&self) -> CoreResult<String>;
}

/// Result of a sandboxed test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub failures: Vec<String>,
    pub duration: Duration,
}

/// Isolated working copy for candidate testing.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    async fn prepare(&self, base_rev: &str, diff: &str) -> CoreResult<String>;
    async fn run_tests(
        &self,
        workspace_id: &str,
        command: &str,
        timeout: Duration,
    ) -> CoreResult<TestReport>;
    async fn dispose(&self, workspace_id: &str) -> CoreResult<()>;
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub disk_bytes: u64,
    pub loadavg: f64,
}

#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn snapshot(&self) -> CoreResult<ResourceSnapshot>;
}

/// Alert severity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Fire-and-forget alerting. Implementations must tolerate their backend
/// being unavailable; the core never checks a result.
#[async_trait]
pub trait Alerting: Send + Sync {
    async fn alert(&self, severity: AlertSeverity, summary: &str, payload: serde_json::Value);
}

/// Run a future under the per-call deadline. Timeouts become `Transient`.
pub async fn with_deadline<T, F>(deadline: Duration, label: &str, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Transient(format!(
            "{label} exceeded deadline {deadline:?}"
        ))),
    }
}

/// Retry a transient operation with capped exponential backoff. Only
/// `Transient` errors are retried; everything else surfaces immediately.
pub async fn retry<T, F, Fut>(label: &str, mut op: F) -> CoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CoreResult<T>>,
{
    let mut backoff = RETRY_BASE;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(CoreError::Transient(detail)) if attempt < RETRY_ATTEMPTS => {
                tracing::debug!(
                    label,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    detail,
                    "transient failure, backing off"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_CAP);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
