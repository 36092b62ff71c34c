//! Adaptive per-level confidence thresholds
//!
//! Thresholds move only when outcomes are recorded: a high recent success
//! rate relaxes the threshold one step, a low one tightens it. Adjustments
//! are clamped to [0.50, 0.99] and rate-limited to `max_delta_per_window`
//! of absolute movement per rolling window. Recording is idempotent by
//! outcome id, so the threshold table is a materialized view recomputable
//! from the outcome log.

use crate::clock::Clock;
use crate::config::ThresholdConfig;
use crate::error::CoreResult;
use crate::types::DecisionLevel;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Outcomes considered for the recent success rate.
pub const HISTORY_WINDOW: usize = 50;
/// No adjustments until this many outcomes exist for the level.
pub const MIN_HISTORY: usize = 10;
/// Rolling window bounding total threshold movement.
pub const ADJUST_WINDOW: Duration = Duration::from_secs(3600);

/// Snapshot of one level's adaptation state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelStats {
    pub threshold: f64,
    pub samples: usize,
    pub success_rate: Option<f64>,
}

struct LevelState {
    threshold: f64,
    history: VecDeque<(bool, f64)>,
    seen: HashSet<Uuid>,
    /// (when, |delta|) of adjustments inside the rolling window.
    adjustments: Vec<(Duration, f64)>,
}

impl LevelState {
    fn new(threshold: f64) -> Self {
        Self {
            threshold,
            history: VecDeque::with_capacity(HISTORY_WINDOW),
            seen: HashSet::new(),
            adjustments: Vec::new(),
        }
    }

    fn success_rate(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        let successes = self.history.iter().filter(|(s, _)| *s).count();
        Some(successes as f64 / self.history.len() as f64)
    }

    fn window_budget(&mut self, now: Duration, max_delta: f64) -> f64 {
        self.adjustments
            .retain(|(at, _)| now.saturating_sub(*at) < ADJUST_WINDOW);
        let spent: f64 = self.adjustments.iter().map(|(_, d)| d).sum();
        (max_delta - spent).max(0.0)
    }
}

/// Maintains the threshold table for all decision levels.
pub struct ConfidenceManager {
    clock: Arc<dyn Clock>,
    config: ThresholdConfig,
    levels: Mutex<HashMap<DecisionLevel, LevelState>>,
}

impl ConfidenceManager {
    pub fn new(clock: Arc<dyn Clock>, config: ThresholdConfig) -> Self {
        let mut levels = HashMap::new();
        levels.insert(DecisionLevel::Advisory, LevelState::new(config.advisory));
        levels.insert(DecisionLevel::Autonomous, LevelState::new(config.autonomous));
        levels.insert(DecisionLevel::Emergency, LevelState::new(config.emergency));
        Self {
            clock,
            config,
            levels: Mutex::new(levels),
        }
    }

    /// Current required confidence for a level.
    pub fn threshold_for(&self, level: DecisionLevel) -> f64 {
        self.levels.lock().unwrap()[&level].threshold
    }

    /// Adaptation snapshot for a level.
    pub fn stats_for(&self, level: DecisionLevel) -> LevelStats {
        let levels = self.levels.lock().unwrap();
        let state = &levels[&level];
        LevelStats {
            threshold: state.threshold,
            samples: state.history.len(),
            success_rate: state.success_rate(),
        }
    }

    /// Record an outcome and maybe adjust the level's threshold. Idempotent
    /// for identical outcome ids.
    pub fn record(
        &self,
        level: DecisionLevel,
        outcome_id: Uuid,
        success: bool,
        magnitude: f64,
    ) -> CoreResult<()> {
        let now = self.clock.now();
        let mut levels = self.levels.lock().unwrap();
        let state = levels.get_mut(&level).expect("all levels initialized");

        if !state.seen.insert(outcome_id) {
            return Ok(());
        }

        if state.history.len() == HISTORY_WINDOW {
            state.history.pop_front();
        }
        state.history.push_back((success, magnitude.clamp(-1.0, 1.0)));

        if state.history.len() < MIN_HISTORY {
            return Ok(());
        }
        let rate = state.success_rate().expect("non-empty history");

        let direction = if rate > self.config.target_high {
            -1.0
        } else if rate < self.config.target_low {
            1.0
        } else {
            return Ok(());
        };

        let budget = state.window_budget(now, self.config.max_delta_per_window);
        let step = self.config.adjustment_step.min(budget);
        if step <= 0.0 {
            return Ok(());
        }

        let proposed = (state.threshold + direction * step).clamp(0.50, 0.99);
        let applied = (proposed - state.threshold).abs();
        if applied > 0.0 {
            state.threshold = proposed;
            state.adjustments.push((now, applied));
        }
        Ok(())
    }
}
