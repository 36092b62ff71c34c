//! Memory store: short-term cache, long-term log, semantic index
//!
//! The long-term log is the source of truth; the cache and the index are
//! derived layers. Long-term write failures surface to the caller so the
//! enclosing decision is never acknowledged as Executed over a lost record.
//! Short-term failures degrade to memoization misses.

pub mod cache;
pub mod index;
pub mod log;

pub use cache::ShortTermCache;
pub use index::SemanticIndex;
pub use log::LongTermLog;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::types::{
    DecisionContext, DecisionState, Evaluation, Explanation, MemoryRecord, Outcome, RecordKind,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Tunables for the store.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub short_ttl: Duration,
    pub short_capacity: usize,
    /// When set, the log and decision records persist under this directory.
    pub state_dir: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_ttl: Duration::from_secs(3600),
            short_capacity: 4096,
            state_dir: None,
        }
    }
}

/// The immutable per-decision archive persisted under `decisions/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub context: DecisionContext,
    pub evaluation: Evaluation,
    pub explanation: Explanation,
    /// Terminal lifecycle state: Rejected, or Recorded once the outcome of
    /// an approved decision is in.
    pub state: DecisionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

/// Keyed short-term cache + append-only long-term log + vector index.
pub struct MemoryStore {
    cache: Mutex<ShortTermCache>,
    log: RwLock<LongTermLog>,
    index: RwLock<SemanticIndex>,
    decisions_dir: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>, config: MemoryConfig) -> CoreResult<Self> {
        let (log, decisions_dir) = match &config.state_dir {
            Some(dir) => {
                let decisions = dir.join("decisions");
                std::fs::create_dir_all(&decisions).map_err(|e| {
                    CoreError::Transient(format!(
                        "create decisions dir {}: {e}",
                        decisions.display()
                    ))
                })?;
                (LongTermLog::open(dir)?, Some(decisions))
            }
            None => (LongTermLog::ephemeral(), None),
        };

        let mut index = SemanticIndex::new();
        index.rebuild(log.iter());

        Ok(Self {
            cache: Mutex::new(ShortTermCache::new(
                clock,
                config.short_ttl,
                config.short_capacity,
            )),
            log: RwLock::new(log),
            index: RwLock::new(index),
            decisions_dir,
        })
    }

    /// Store a record. Idempotent by record id. The long-term append must
    /// succeed before the record is acknowledged; cache and index updates
    /// follow and cannot fail the put.
    pub fn put(&self, record: MemoryRecord) -> CoreResult<Uuid> {
        let id = self.log.write().unwrap().append(record.clone())?;
        if let Some(embedding) = &record.embedding {
            self.index.write().unwrap().insert(id, embedding.clone());
        }
        self.cache.lock().unwrap().insert(record);
        Ok(id)
    }

    /// Read a record, preferring the short-term cache.
    pub fn get(&self, id: &Uuid) -> Option<MemoryRecord> {
        if let Some(hit) = self.cache.lock().unwrap().get(id) {
            return Some(hit);
        }
        let record = self.log.read().unwrap().get(id).cloned()?;
        self.cache.lock().unwrap().insert(record.clone());
        Some(record)
    }

    /// Records of `kind` in `[from, to)`, append order.
    pub fn range(
        &self,
        kind: RecordKind,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> Vec<MemoryRecord> {
        self.log.read().unwrap().range(kind, from, to)
    }

    /// k-NN over the semantic index by cosine similarity.
    pub fn search(&self, embedding: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        self.index.read().unwrap().search(embedding, k)
    }

    /// Append an outcome for a decision. Idempotent by `outcome_id`.
    pub fn record_outcome(&self, outcome_id: Uuid, outcome: &Outcome) -> CoreResult<Uuid> {
        let payload = serde_json::to_value(outcome)
            .map_err(|e| CoreError::Fatal(format!("unserializable outcome: {e}")))?;
        let record = MemoryRecord::new(RecordKind::Outcome, payload).with_id(outcome_id);
        self.put(record)
    }

    /// Persist the immutable per-decision archive. Idempotent: an existing
    /// archive for the id is left untouched.
    pub fn persist_decision(&self, record: &DecisionRecord) -> CoreResult<()> {
        let Some(dir) = &self.decisions_dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", record.context.id));
        if path.exists() {
            return Ok(());
        }
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| CoreError::Fatal(format!("unserializable decision: {e}")))?;
        std::fs::write(&path, body).map_err(|e| {
            CoreError::Transient(format!("persist decision {}: {e}", path.display()))
        })?;
        Ok(())
    }

    /// Load a persisted decision archive, if present.
    pub fn load_decision(&self, id: &Uuid) -> Option<DecisionRecord> {
        let dir = self.decisions_dir.as_ref()?;
        let raw = std::fs::read_to_string(dir.join(format!("{id}.json"))).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Rebuild the semantic index from the long-term log.
    pub fn rebuild_index(&self) {
        let log = self.log.read().unwrap();
        self.index.write().unwrap().rebuild(log.iter());
    }

    pub fn long_term_len(&self) -> usize {
        self.log.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn store() -> MemoryStore {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        ));
        MemoryStore::new(clock, MemoryConfig::default()).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip_and_idempotence() {
        let store = store();
        let record = MemoryRecord::new(RecordKind::Observation, serde_json::json!({"k": "v"}));
        let id = store.put(record.clone()).unwrap();
        assert_eq!(store.put(record).unwrap(), id);
        assert_eq!(store.long_term_len(), 1);

        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded.payload["k"], "v");
    }

    #[test]
    fn test_read_your_writes_through_cache_miss() {
        let store = store();
        let record = MemoryRecord::new(RecordKind::Decision, serde_json::json!({"d": 1}))
            .with_embedding(vec![0.1, 0.9]);
        let id = store.put(record).unwrap();

        // Search sees the write immediately.
        let hits = store.search(&[0.1, 0.9], 1);
        assert_eq!(hits[0].0, id);
    }

    #[test]
    fn test_record_outcome_idempotent() {
        let store = store();
        let outcome = Outcome {
            decision_id: Uuid::new_v4(),
            success: true,
            observed_at: Utc::now(),
            magnitude: 0.4,
            notes: None,
        };
        let outcome_id = Uuid::new_v4();
        store.record_outcome(outcome_id, &outcome).unwrap();
        store.record_outcome(outcome_id, &outcome).unwrap();
        assert_eq!(store.long_term_len(), 1);
    }

    #[test]
    fn test_index_rebuild_preserves_search() {
        let store = store();
        let record = MemoryRecord::new(RecordKind::Observation, serde_json::json!({}))
            .with_embedding(vec![1.0, 0.0]);
        let id = store.put(record).unwrap();
        store.rebuild_index();
        assert_eq!(store.search(&[1.0, 0.0], 1)[0].0, id);
    }
}
