//! Per-(actor, asset) spending limits
//!
//! Counters move only inside a single critical section per account, guarded
//! by a write-ahead marker when a state directory is configured. A request
//! id can be debited at most once and credited at most once, so retries and
//! compensations are idempotent. Recovery either forward-completes a marked
//! write or discards it; it never leaves counters half-applied.

use crate::clock::{until_next_utc_midnight, Clock};
use crate::error::{CoreError, CoreResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

/// Caps for one (actor, asset) account.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpendingPolicy {
    pub daily_cap: f64,
    pub total_cap: f64,
}

/// Persisted account state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    policy: SpendingPolicy,
    day: NaiveDate,
    daily_spent: f64,
    total_spent: f64,
    /// request id -> debited amount, for idempotent credit.
    committed: HashMap<Uuid, f64>,
}

impl Account {
    fn new(policy: SpendingPolicy, day: NaiveDate) -> Self {
        Self {
            policy,
            day,
            daily_spent: 0.0,
            total_spent: 0.0,
            committed: HashMap::new(),
        }
    }

    fn roll_day(&mut self, today: NaiveDate) {
        if today != self.day {
            self.day = today;
            self.daily_spent = 0.0;
        }
    }
}

/// Write-ahead marker persisted before the account file is rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalMarker {
    request_id: Uuid,
    amount: f64,
}

/// Read-only view for status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendingStatus {
    pub daily_cap: f64,
    pub total_cap: f64,
    pub daily_spent: f64,
    pub total_spent: f64,
}

/// All spending accounts, optionally durable under `limits/`.
pub struct SpendingLimits {
    clock: Arc<dyn Clock>,
    accounts: Mutex<HashMap<(String, String), Account>>,
    limits_dir: Option<PathBuf>,
}

impl SpendingLimits {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            accounts: Mutex::new(HashMap::new()),
            limits_dir: None,
        }
    }

    /// Durable variant. Replays persisted accounts and resolves any
    /// write-ahead markers left by a crash.
    pub fn open(clock: Arc<dyn Clock>, state_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = state_dir.as_ref().join("limits");
        std::fs::create_dir_all(&dir).map_err(|e| {
            CoreError::Transient(format!("create limits dir {}: {e}", dir.display()))
        })?;

        let mut accounts = HashMap::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| CoreError::Transient(format!("read limits dir: {e}")))?;
        for entry in entries {
            let path = entry
                .map_err(|e| CoreError::Transient(format!("read limits dir: {e}")))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::Transient(format!("read {}: {e}", path.display())))?;
            let account: Account = serde_json::from_str(&raw).map_err(|e| {
                CoreError::Inconsistent(format!("corrupt limits file {}: {e}", path.display()))
            })?;
            let key = key_from_file(&path).ok_or_else(|| {
                CoreError::Inconsistent(format!("unparseable limits file name {}", path.display()))
            })?;
            accounts.insert(key, account);
        }

        let store = Self {
            clock,
            accounts: Mutex::new(accounts),
            limits_dir: Some(dir),
        };
        store.recover()?;
        Ok(store)
    }

    /// Resolve leftover write-ahead markers: a marker whose request id is
    /// present in the account file was committed (drop the marker); one that
    /// is absent never committed (discard). Both outcomes are logged.
    fn recover(&self) -> CoreResult<()> {
        let Some(dir) = &self.limits_dir else {
            return Ok(());
        };
        let accounts = self.accounts.lock().unwrap();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CoreError::Transient(format!("read limits dir: {e}")))?;
        for entry in entries {
            let path = entry
                .map_err(|e| CoreError::Transient(format!("read limits dir: {e}")))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::Transient(format!("read {}: {e}", path.display())))?;
            let marker: WalMarker = serde_json::from_str(&raw).map_err(|e| {
                CoreError::Inconsistent(format!("corrupt wal {}: {e}", path.display()))
            })?;
            let key = key_from_file(&path);
            let committed = key
                .as_ref()
                .and_then(|k| accounts.get(k))
                .map(|a| a.committed.contains_key(&marker.request_id))
                .unwrap_or(false);
            warn!(
                request_id = %marker.request_id,
                resolved = if committed { "forward-completed" } else { "discarded" },
                "write-ahead marker found during recovery"
            );
            std::fs::remove_file(&path)
                .map_err(|e| CoreError::Transient(format!("remove wal: {e}")))?;
        }
        Ok(())
    }

    pub fn set_policy(&self, actor: &str, asset: &str, policy: SpendingPolicy) -> CoreResult<()> {
        let today = self.clock.now_utc().date_naive();
        let mut accounts = self.accounts.lock().unwrap();
        let key = (actor.to_string(), asset.to_string());
        accounts
            .entry(key.clone())
            .and_modify(|a| a.policy = policy)
            .or_insert_with(|| Account::new(policy, today));
        self.persist(&key, &accounts)?;
        Ok(())
    }

    /// Pre-deduct `amount` for a request. Fails with `QuotaExceeded` when a
    /// cap would be breached; never lets counters exceed their caps.
    /// Idempotent by request id.
    pub fn commit(
        &self,
        request_id: Uuid,
        actor: &str,
        asset: &str,
        amount: f64,
    ) -> CoreResult<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "spend amount {amount} must be finite and non-negative"
            )));
        }
        let today = self.clock.now_utc().date_naive();
        let key = (actor.to_string(), asset.to_string());
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.get_mut(&key).ok_or_else(|| {
            CoreError::InvalidInput(format!("no spending policy for {actor}/{asset}"))
        })?;
        account.roll_day(today);

        if account.committed.contains_key(&request_id) {
            return Ok(());
        }
        if account.daily_spent + amount > account.policy.daily_cap {
            return Err(CoreError::QuotaExceeded {
                actor: actor.to_string(),
                detail: format!(
                    "daily spend {} + {amount} exceeds cap {}",
                    account.daily_spent, account.policy.daily_cap
                ),
                retry_after: until_next_utc_midnight(&*self.clock),
            });
        }
        if account.total_spent + amount > account.policy.total_cap {
            return Err(CoreError::QuotaExceeded {
                actor: actor.to_string(),
                detail: format!(
                    "total spend {} + {amount} exceeds cap {}",
                    account.total_spent, account.policy.total_cap
                ),
                retry_after: Duration::MAX,
            });
        }

        self.write_wal(&key, request_id, amount)?;
        account.daily_spent += amount;
        account.total_spent += amount;
        account.committed.insert(request_id, amount);
        self.persist(&key, &accounts)?;
        self.clear_wal(&key)?;
        Ok(())
    }

    /// Compensating credit after a downstream failure. Idempotent: a request
    /// id is credited at most once, and only if it was debited.
    pub fn credit(&self, request_id: Uuid, actor: &str, asset: &str) -> CoreResult<()> {
        let key = (actor.to_string(), asset.to_string());
        let mut accounts = self.accounts.lock().unwrap();
        let Some(account) = accounts.get_mut(&key) else {
            return Ok(());
        };
        let Some(amount) = account.committed.remove(&request_id) else {
            return Ok(());
        };
        self.write_wal(&key, request_id, -amount)?;
        account.daily_spent = (account.daily_spent - amount).max(0.0);
        account.total_spent = (account.total_spent - amount).max(0.0);
        self.persist(&key, &accounts)?;
        self.clear_wal(&key)?;
        Ok(())
    }

    pub fn status(&self, actor: &str, asset: &str) -> Option<SpendingStatus> {
        let today = self.clock.now_utc().date_naive();
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts.get_mut(&(actor.to_string(), asset.to_string()))?;
        account.roll_day(today);
        Some(SpendingStatus {
            daily_cap: account.policy.daily_cap,
            total_cap: account.policy.total_cap,
            daily_spent: account.daily_spent,
            total_spent: account.total_spent,
        })
    }

    fn account_path(&self, key: &(String, String)) -> Option<PathBuf> {
        self.limits_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}@{}.json", key.0, key.1)))
    }

    fn wal_path(&self, key: &(String, String)) -> Option<PathBuf> {
        self.limits_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}@{}.wal", key.0, key.1)))
    }

    fn write_wal(&self, key: &(String, String), request_id: Uuid, amount: f64) -> CoreResult<()> {
        let Some(path) = self.wal_path(key) else {
            return Ok(());
        };
        let marker = WalMarker { request_id, amount };
        let body = serde_json::to_vec(&marker).map_err(|e| CoreError::Fatal(e.to_string()))?;
        std::fs::write(&path, body)
            .map_err(|e| CoreError::Transient(format!("write wal {}: {e}", path.display())))
    }

    fn clear_wal(&self, key: &(String, String)) -> CoreResult<()> {
        let Some(path) = self.wal_path(key) else {
            return Ok(());
        };
        std::fs::remove_file(&path)
            .map_err(|e| CoreError::Transient(format!("remove wal {}: {e}", path.display())))
    }

    fn persist(
        &self,
        key: &(String, String),
        accounts: &HashMap<(String, String), Account>,
    ) -> CoreResult<()> {
        let Some(path) = self.account_path(key) else {
            return Ok(());
        };
        let account = accounts.get(key).expect("persist follows mutation");
        let body =
            serde_json::to_vec_pretty(account).map_err(|e| CoreError::Fatal(e.to_string()))?;
        std::fs::write(&path, body)
            .map_err(|e| CoreError::Transient(format!("persist limits {}: {e}", path.display())))
    }
}

fn key_from_file(path: &Path) -> Option<(String, String)> {
    let stem = path.file_stem()?.to_str()?;
    let (actor, asset) = stem.split_once('@')?;
    Some((actor.to_string(), asset.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn limits() -> (Arc<ManualClock>, SpendingLimits) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        ));
        let limits = SpendingLimits::new(clock.clone());
        limits
            .set_policy(
                "treasury",
                "usd",
                SpendingPolicy {
                    daily_cap: 1000.0,
                    total_cap: 10000.0,
                },
            )
            .unwrap();
        (clock, limits)
    }

    #[test]
    fn test_sequential_spends_hit_daily_cap() {
        let (clock, limits) = limits();
        limits.commit(Uuid::new_v4(), "treasury", "usd", 400.0).unwrap();
        limits.commit(Uuid::new_v4(), "treasury", "usd", 400.0).unwrap();
        let err = limits
            .commit(Uuid::new_v4(), "treasury", "usd", 300.0)
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { .. }));
        assert_eq!(limits.status("treasury", "usd").unwrap().daily_spent, 800.0);

        // Day rollover readmits within the fresh daily budget.
        clock.advance(Duration::from_secs(16 * 3600));
        limits.commit(Uuid::new_v4(), "treasury", "usd", 300.0).unwrap();
        let status = limits.status("treasury", "usd").unwrap();
        assert_eq!(status.daily_spent, 300.0);
        assert_eq!(status.total_spent, 1100.0);
    }

    #[test]
    fn test_total_cap_survives_rollover() {
        let (clock, limits) = limits();
        for _ in 0..10 {
            limits.commit(Uuid::new_v4(), "treasury", "usd", 1000.0).unwrap();
            clock.advance(Duration::from_secs(24 * 3600));
        }
        let err = limits
            .commit(Uuid::new_v4(), "treasury", "usd", 1.0)
            .unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { .. }));
    }

    #[test]
    fn test_commit_and_credit_idempotent_by_request_id() {
        let (_clock, limits) = limits();
        let id = Uuid::new_v4();
        limits.commit(id, "treasury", "usd", 250.0).unwrap();
        limits.commit(id, "treasury", "usd", 250.0).unwrap();
        assert_eq!(limits.status("treasury", "usd").unwrap().daily_spent, 250.0);

        limits.credit(id, "treasury", "usd").unwrap();
        limits.credit(id, "treasury", "usd").unwrap();
        let status = limits.status("treasury", "usd").unwrap();
        assert_eq!(status.daily_spent, 0.0);
        assert_eq!(status.total_spent, 0.0);
    }

    #[test]
    fn test_unknown_account_rejected() {
        let (_clock, limits) = limits();
        let err = limits
            .commit(Uuid::new_v4(), "nobody", "usd", 1.0)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn test_negative_amount_rejected() {
        let (_clock, limits) = limits();
        assert!(limits
            .commit(Uuid::new_v4(), "treasury", "usd", -5.0)
            .is_err());
    }

    #[test]
    fn test_durable_reopen_keeps_counters() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        ));
        let id = Uuid::new_v4();
        {
            let limits = SpendingLimits::open(clock.clone(), dir.path()).unwrap();
            limits
                .set_policy(
                    "ops",
                    "usd",
                    SpendingPolicy {
                        daily_cap: 100.0,
                        total_cap: 1000.0,
                    },
                )
                .unwrap();
            limits.commit(id, "ops", "usd", 60.0).unwrap();
        }
        let limits = SpendingLimits::open(clock, dir.path()).unwrap();
        let status = limits.status("ops", "usd").unwrap();
        assert_eq!(status.daily_spent, 60.0);
        // The same request id is still deduplicated after restart.
        limits.commit(id, "ops", "usd", 60.0).unwrap();
        assert_eq!(limits.status("ops", "usd").unwrap().daily_spent, 60.0);
    }

    #[test]
    fn test_recovery_discards_uncommitted_marker() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        ));
        {
            let limits = SpendingLimits::open(clock.clone(), dir.path()).unwrap();
            limits
                .set_policy(
                    "ops",
                    "usd",
                    SpendingPolicy {
                        daily_cap: 100.0,
                        total_cap: 1000.0,
                    },
                )
                .unwrap();
        }
        // Simulated crash: marker written, account never updated.
        let wal = dir.path().join("limits").join("ops@usd.wal");
        let marker = WalMarker {
            request_id: Uuid::new_v4(),
            amount: 40.0,
        };
        std::fs::write(&wal, serde_json::to_vec(&marker).unwrap()).unwrap();

        let limits = SpendingLimits::open(clock, dir.path()).unwrap();
        assert!(!wal.exists());
        assert_eq!(limits.status("ops", "usd").unwrap().daily_spent, 0.0);
    }
}
