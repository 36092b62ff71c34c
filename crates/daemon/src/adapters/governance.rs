//! File-backed governance source
//!
//! Reads the governance snapshot from a JSON file maintained by the host
//! (or another process), and tails an adjacent `.events.jsonl` file for
//! cursor-ordered events. A missing snapshot file is an empty snapshot,
//! not an error.

use async_trait::async_trait;
use std::path::PathBuf;
use steward_core::error::{CoreError, CoreResult};
use steward_core::ports::{GovernanceEvent, GovernanceSnapshot, GovernanceSource};
use tracing::debug;

pub struct FileGovernanceSource {
    snapshot_path: PathBuf,
    events_path: PathBuf,
}

impl FileGovernanceSource {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let events_path = snapshot_path.with_extension("events.jsonl");
        Self {
            snapshot_path,
            events_path,
        }
    }
}

#[async_trait]
impl GovernanceSource for FileGovernanceSource {
    async fn snapshot(&self) -> CoreResult<GovernanceSnapshot> {
        let raw = match tokio::fs::read_to_string(&self.snapshot_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.snapshot_path.display(), "no governance snapshot file");
                return Ok(GovernanceSnapshot::default());
            }
            Err(e) => {
                return Err(CoreError::Transient(format!(
                    "read governance snapshot {}: {e}",
                    self.snapshot_path.display()
                )))
            }
        };
        serde_json::from_str(&raw).map_err(|e| {
            CoreError::InvalidInput(format!(
                "malformed governance snapshot {}: {e}",
                self.snapshot_path.display()
            ))
        })
    }

    async fn events_since(&self, cursor: u64) -> CoreResult<Vec<GovernanceEvent>> {
        let raw = match tokio::fs::read_to_string(&self.events_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(CoreError::Transient(format!(
                    "read governance events {}: {e}",
                    self.events_path.display()
                )))
            }
        };
        let mut events = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let event: GovernanceEvent = serde_json::from_str(line).map_err(|e| {
                CoreError::InvalidInput(format!("malformed governance event: {e}"))
            })?;
            if event.cursor > cursor {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.cursor);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileGovernanceSource::new(dir.path().join("governance.json"));
        let snapshot = source.snapshot().await.unwrap();
        assert!(snapshot.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_parses_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governance.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "cursor": 7,
                "candidates": [{
                    "reference": "prop-42",
                    "level": "advisory",
                    "inputs": {"financial": 0.9},
                    "proposer": "treasury",
                    "action": {"kind": "propose", "payload": {}}
                }],
                "parameters": {}
            })
            .to_string(),
        )
        .unwrap();

        let source = FileGovernanceSource::new(&path);
        let snapshot = source.snapshot().await.unwrap();
        assert_eq!(snapshot.cursor, 7);
        assert_eq!(snapshot.candidates.len(), 1);
        assert_eq!(snapshot.candidates[0].reference, "prop-42");
    }

    #[tokio::test]
    async fn test_malformed_snapshot_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governance.json");
        std::fs::write(&path, "{not json").unwrap();
        let source = FileGovernanceSource::new(&path);
        assert!(matches!(
            source.snapshot().await,
            Err(CoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_events_filtered_by_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("governance.json");
        let events = path.with_extension("events.jsonl");
        std::fs::write(
            &events,
            "{\"cursor\":1,\"payload\":{}}\n{\"cursor\":2,\"payload\":{}}\n{\"cursor\":3,\"payload\":{}}\n",
        )
        .unwrap();
        let source = FileGovernanceSource::new(&path);
        let after = source.events_since(1).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].cursor, 2);
    }
}
