//! Append-only long-term log
//!
//! Entries are immutable once acknowledged. The in-memory view is the
//! working set; when a state directory is configured every append also lands
//! in `long_term.jsonl`, and the log is rebuilt from that file on startup.

use crate::error::{CoreError, CoreResult};
use crate::types::{MemoryRecord, RecordKind};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug)]
pub struct LongTermLog {
    records: Vec<MemoryRecord>,
    by_id: HashMap<Uuid, usize>,
    writer: Option<BufWriter<File>>,
}

impl LongTermLog {
    /// Purely in-memory log (tests, ephemeral runs).
    pub fn ephemeral() -> Self {
        Self {
            records: Vec::new(),
            by_id: HashMap::new(),
            writer: None,
        }
    }

    /// File-backed log. Replays any existing `long_term.jsonl` before
    /// accepting new appends.
    pub fn open(state_dir: impl AsRef<Path>) -> CoreResult<Self> {
        let path = Self::file_path(state_dir.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Transient(format!("create log dir {}: {e}", parent.display()))
            })?;
        }

        let mut log = Self::ephemeral();
        if path.exists() {
            let file = File::open(&path)
                .map_err(|e| CoreError::Transient(format!("open log {}: {e}", path.display())))?;
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line
                    .map_err(|e| CoreError::Transient(format!("read log line {lineno}: {e}")))?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: MemoryRecord = serde_json::from_str(&line).map_err(|e| {
                    CoreError::Inconsistent(format!("corrupt log entry at line {lineno}: {e}"))
                })?;
                log.insert_in_memory(record);
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CoreError::Transient(format!("open log {}: {e}", path.display())))?;
        log.writer = Some(BufWriter::new(file));
        Ok(log)
    }

    fn file_path(state_dir: &Path) -> PathBuf {
        state_dir.join("long_term.jsonl")
    }

    fn insert_in_memory(&mut self, record: MemoryRecord) {
        if self.by_id.contains_key(&record.id) {
            return;
        }
        self.by_id.insert(record.id, self.records.len());
        self.records.push(record);
    }

    /// Append a record. Idempotent by id: re-appending an acknowledged id is
    /// a no-op. A write failure surfaces so the enclosing decision is never
    /// acknowledged over a lost record.
    pub fn append(&mut self, record: MemoryRecord) -> CoreResult<Uuid> {
        if self.by_id.contains_key(&record.id) {
            return Ok(record.id);
        }
        if let Some(writer) = &mut self.writer {
            let line = serde_json::to_string(&record)
                .map_err(|e| CoreError::Fatal(format!("unserializable record: {e}")))?;
            writeln!(writer, "{line}")
                .and_then(|_| writer.flush())
                .map_err(|e| CoreError::Transient(format!("long-term append: {e}")))?;
        }
        let id = record.id;
        self.insert_in_memory(record);
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&MemoryRecord> {
        self.by_id.get(id).map(|&i| &self.records[i])
    }

    /// Records of `kind` with `from <= ts < to`, in append order.
    pub fn range(
        &self,
        kind: RecordKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<MemoryRecord> {
        self.records
            .iter()
            .filter(|r| r.kind == kind && r.ts >= from && r.ts < to)
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: RecordKind) -> MemoryRecord {
        MemoryRecord::new(kind, serde_json::json!({"n": 1}))
    }

    #[test]
    fn test_append_is_idempotent_by_id() {
        let mut log = LongTermLog::ephemeral();
        let r = record(RecordKind::Outcome);
        let id = log.append(r.clone()).unwrap();
        let again = log.append(r).unwrap();
        assert_eq!(id, again);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_range_filters_kind_and_time() {
        let mut log = LongTermLog::ephemeral();
        let a = record(RecordKind::Outcome);
        let b = record(RecordKind::Decision);
        let from = a.ts - chrono::Duration::seconds(1);
        let to = a.ts + chrono::Duration::seconds(1);
        log.append(a).unwrap();
        log.append(b).unwrap();

        let outcomes = log.range(RecordKind::Outcome, from, to);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].kind, RecordKind::Outcome);
    }

    #[test]
    fn test_reopen_replays_file() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut log = LongTermLog::open(dir.path()).unwrap();
            log.append(record(RecordKind::Decision)).unwrap()
        };
        let log = LongTermLog::open(dir.path()).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.get(&id).is_some());
    }

    #[test]
    fn test_corrupt_line_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("long_term.jsonl"), "not-json\n").unwrap();
        match LongTermLog::open(dir.path()) {
            Err(CoreError::Inconsistent(_)) => {}
            other => panic!("expected Inconsistent, got {other:?}"),
        }
    }
}
