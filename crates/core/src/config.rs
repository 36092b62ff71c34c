//! Configuration surface for the coordination core
//!
//! A single struct covers every tunable. Loading is strict: unknown keys
//! fail startup with a specific error, and `validate` rejects out-of-range
//! values before any component starts.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Loop cadences, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CadenceConfig {
    pub governance_interval_sec: u64,
    pub improvement_interval_sec: u64,
    pub health_interval_sec: u64,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            governance_interval_sec: 60,
            improvement_interval_sec: 300,
            health_interval_sec: 30,
        }
    }
}

/// Confidence thresholds and the adaptation rule bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ThresholdConfig {
    pub advisory: f64,
    pub autonomous: f64,
    pub emergency: f64,
    pub adjustment_step: f64,
    pub max_delta_per_window: f64,
    pub target_high: f64,
    pub target_low: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            advisory: 0.60,
            autonomous: 0.85,
            emergency: 0.95,
            adjustment_step: 0.01,
            max_delta_per_window: 0.05,
            target_high: 0.95,
            target_low: 0.80,
        }
    }
}

/// Action executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutorConfig {
    pub queue_max: usize,
    pub timeout_sec: u64,
    pub per_actor_min_interval_sec: u64,
    pub per_actor_daily_cap: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_max: 16,
            timeout_sec: 30,
            per_actor_min_interval_sec: 1,
            per_actor_daily_cap: 1000,
        }
    }
}

/// Improvement engine gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ImprovementConfig {
    pub auto_merge_threshold: f64,
    pub size_cap_lines: usize,
    pub max_concurrent: usize,
    pub max_daily_merges: u32,
    pub protected_paths: Vec<String>,
    /// Minimum of the three analysis scores for a candidate to be actionable.
    pub min_score: f64,
    /// Minimum analysis confidence for a candidate to be actionable.
    pub min_confidence: f64,
    /// Window after an auto-merge during which health degradation reverts it.
    pub rollback_window_sec: u64,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            auto_merge_threshold: 0.9,
            size_cap_lines: 200,
            max_concurrent: 2,
            max_daily_merges: 5,
            protected_paths: vec!["protected/".to_string()],
            min_score: 0.6,
            min_confidence: 0.7,
            rollback_window_sec: 900,
        }
    }
}

/// Health scoring thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HealthConfig {
    pub warn_threshold: f64,
    pub crit_threshold: f64,
    pub consecutive_failure_limit: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 0.6,
            crit_threshold: 0.3,
            consecutive_failure_limit: 3,
        }
    }
}

/// Operating mode timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ModeConfig {
    pub paused_grace_sec: u64,
    pub drain_deadline_sec: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            paused_grace_sec: 600,
            drain_deadline_sec: 60,
        }
    }
}

/// Complete core configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub cadence: CadenceConfig,
    pub thresholds: ThresholdConfig,
    pub executor: ExecutorConfig,
    pub improvement: ImprovementConfig,
    pub health: HealthConfig,
    pub modes: ModeConfig,
}

fn in_unit(name: &str, v: f64) -> CoreResult<()> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(CoreError::InvalidInput(format!(
            "config value {name}={v} must be in [0,1]"
        )));
    }
    Ok(())
}

impl CoreConfig {
    /// Load from a JSON file. Unknown keys are a startup failure.
    pub fn from_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::InvalidInput(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Parse from a JSON string. Unknown keys are a startup failure.
    pub fn from_json(raw: &str) -> CoreResult<Self> {
        let config: CoreConfig = serde_json::from_str(raw)
            .map_err(|e| CoreError::InvalidInput(format!("config rejected: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Range-check every tunable.
    pub fn validate(&self) -> CoreResult<()> {
        let t = &self.thresholds;
        for (name, v) in [
            ("thresholds.advisory", t.advisory),
            ("thresholds.autonomous", t.autonomous),
            ("thresholds.emergency", t.emergency),
            ("thresholds.target_high", t.target_high),
            ("thresholds.target_low", t.target_low),
        ] {
            in_unit(name, v)?;
        }
        for (name, v) in [
            ("thresholds.adjustment_step", t.adjustment_step),
            ("thresholds.max_delta_per_window", t.max_delta_per_window),
        ] {
            in_unit(name, v)?;
        }
        if t.target_low >= t.target_high {
            return Err(CoreError::InvalidInput(format!(
                "thresholds.target_low={} must be below target_high={}",
                t.target_low, t.target_high
            )));
        }

        let i = &self.improvement;
        in_unit("improvement.auto_merge_threshold", i.auto_merge_threshold)?;
        in_unit("improvement.min_score", i.min_score)?;
        in_unit("improvement.min_confidence", i.min_confidence)?;
        if i.max_concurrent == 0 {
            return Err(CoreError::InvalidInput(
                "improvement.max_concurrent must be at least 1".to_string(),
            ));
        }

        let h = &self.health;
        in_unit("health.warn_threshold", h.warn_threshold)?;
        in_unit("health.crit_threshold", h.crit_threshold)?;
        if h.crit_threshold >= h.warn_threshold {
            return Err(CoreError::InvalidInput(format!(
                "health.crit_threshold={} must be below warn_threshold={}",
                h.crit_threshold, h.warn_threshold
            )));
        }

        if self.executor.queue_max == 0 {
            return Err(CoreError::InvalidInput(
                "executor.queue_max must be at least 1".to_string(),
            ));
        }
        if self.cadence.governance_interval_sec == 0
            || self.cadence.health_interval_sec == 0
            || self.cadence.improvement_interval_sec == 0
        {
            return Err(CoreError::InvalidInput(
                "cadence intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
