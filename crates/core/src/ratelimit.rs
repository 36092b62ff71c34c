//! Per-actor action rate limiting
//!
//! Each actor has a bucket with a minimum interval between actions and a
//! daily cap. The day rolls at 00:00 UTC and is reset lazily inside the same
//! lock that answers the query, so a rollover can never double-spend quota.

use crate::clock::{until_next_utc_midnight, Clock};
use crate::error::{CoreError, CoreResult};
use crate::types::OperatingMode;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Cadence policy for one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub min_interval: Duration,
    pub daily_cap: u32,
}

impl RatePolicy {
    pub fn new(min_interval: Duration, daily_cap: u32) -> Self {
        Self {
            min_interval,
            daily_cap,
        }
    }
}

#[derive(Debug)]
struct RateBucket {
    policy: RatePolicy,
    last_action_at: Option<Duration>,
    daily_count: u32,
    day: NaiveDate,
}

impl RateBucket {
    fn new(policy: RatePolicy, day: NaiveDate) -> Self {
        Self {
            policy,
            last_action_at: None,
            daily_count: 0,
            day,
        }
    }

    /// Lazy day rollover. Must be called with the bucket lock held.
    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.day {
            self.day = today;
            self.daily_count = 0;
        }
    }
}

/// Decision of a `may_act` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub ok: bool,
    /// How long to wait before retrying when `ok` is false. Zero when `ok`.
    pub retry_after: Duration,
}

/// Per-actor rate limiter shared by the executor and the loops.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    default_policy: RatePolicy,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, default_policy: RatePolicy) -> Self {
        Self {
            clock,
            default_policy,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `actor` may act now, and if not, when to retry.
    pub fn may_act(&self, actor: &str) -> Admission {
        let now = self.clock.now();
        let today = self.clock.now_utc().date_naive();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(actor.to_string())
            .or_insert_with(|| RateBucket::new(self.default_policy, today));
        bucket.roll_day(today);

        if let Some(last) = bucket.last_action_at {
            let elapsed = now.saturating_sub(last);
            if elapsed < bucket.policy.min_interval {
                return Admission {
                    ok: false,
                    retry_after: bucket.policy.min_interval - elapsed,
                };
            }
        }

        if bucket.daily_count >= bucket.policy.daily_cap {
            return Admission {
                ok: false,
                retry_after: until_next_utc_midnight(&*self.clock),
            };
        }

        Admission {
            ok: true,
            retry_after: Duration::ZERO,
        }
    }

    /// Record a successful act. Called only after downstream execution
    /// admitted the request; fails with `QuotaExceeded` rather than going
    /// over a cap.
    pub fn register(&self, actor: &str) -> CoreResult<()> {
        let now = self.clock.now();
        let today = self.clock.now_utc().date_naive();
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(actor.to_string())
            .or_insert_with(|| RateBucket::new(self.default_policy, today));
        bucket.roll_day(today);

        if let Some(last) = bucket.last_action_at {
            let elapsed = now.saturating_sub(last);
            if elapsed < bucket.policy.min_interval {
                return Err(CoreError::QuotaExceeded {
                    actor: actor.to_string(),
                    detail: "minimum interval not elapsed".to_string(),
                    retry_after: bucket.policy.min_interval - elapsed,
                });
            }
        }
        if bucket.daily_count >= bucket.policy.daily_cap {
            return Err(CoreError::QuotaExceeded {
                actor: actor.to_string(),
                detail: format!("daily cap {} reached", bucket.policy.daily_cap),
                retry_after: until_next_utc_midnight(&*self.clock),
            });
        }

        bucket.last_action_at = Some(now);
        bucket.daily_count += 1;
        Ok(())
    }

    /// Replace an actor's policy. Allowed only in Normal or Degraded mode;
    /// the swap is atomic under the bucket lock.
    pub fn set_policy(
        &self,
        actor: &str,
        policy: RatePolicy,
        mode: OperatingMode,
    ) -> CoreResult<()> {
        if !matches!(mode, OperatingMode::Normal | OperatingMode::Degraded) {
            return Err(CoreError::InvalidInput(format!(
                "rate policy changes are not allowed in {} mode",
                mode.as_str()
            )));
        }
        let today = self.clock.now_utc().date_naive();
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(actor.to_string())
            .and_modify(|b| b.policy = policy)
            .or_insert_with(|| RateBucket::new(policy, today));
        Ok(())
    }

    /// Remaining daily quota for an actor, for status reporting.
    pub fn remaining_today(&self, actor: &str) -> u32 {
        let today = self.clock.now_utc().date_naive();
        let mut buckets = self.buckets.lock().unwrap();
        match buckets.get_mut(actor) {
            Some(bucket) => {
                bucket.roll_day(today);
                bucket.policy.daily_cap.saturating_sub(bucket.daily_count)
            }
            None => self.default_policy.daily_cap,
        }
    }
}
