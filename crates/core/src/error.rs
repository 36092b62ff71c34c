//! Error kinds shared across the coordination core
//!
//! Components convert adapter failures at the boundary and never use errors
//! as control flow. `Fatal` is the only kind a component may not absorb: it
//! must propagate to the orchestrator, which enters Emergency.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the core.
pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds of the coordination core.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Malformed contexts, weight sums, config values. The decision is rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Rate or spending limit hit. Retriable after `retry_after`.
    #[error("quota exceeded for {actor}: {detail} (retry after {retry_after:?})")]
    QuotaExceeded {
        actor: String,
        detail: String,
        retry_after: Duration,
    },

    /// Queue-full or tick-budget overrun. The enclosing loop skips a tick.
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// External call timeout or unavailability. Retried with capped backoff
    /// before surfacing.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Write-ahead marker found without commit during recovery. Auto-resolved
    /// by forward-completion or discard.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    /// Violated invariant. Triggers Emergency; no new work is started.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether a caller may retry the operation after a delay.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoreError::QuotaExceeded { .. } | CoreError::Transient(_)
        )
    }

    /// Suggested delay before retrying, when one applies.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CoreError::QuotaExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short stable name for counters and bus events.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::QuotaExceeded { .. } => "quota_exceeded",
            CoreError::Overloaded(_) => "overloaded",
            CoreError::Transient(_) => "transient",
            CoreError::Inconsistent(_) => "inconsistent",
            CoreError::Fatal(_) => "fatal",
        }
    }
}
