//! Daemon environment configuration
//!
//! Host-level settings come from the environment; everything tunable about
//! the core itself lives in the `CoreConfig` JSON file.

use std::path::PathBuf;

/// Environment-derived daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// HTTP bind address.
    pub bind: String,
    /// Optional core config JSON path. Defaults apply when unset.
    pub core_config_path: Option<PathBuf>,
    /// Durable state directory (events, decisions, limits, improvements).
    pub state_dir: PathBuf,
    /// Governance snapshot JSON consumed by the file source.
    pub governance_file: PathBuf,
    /// Source-of-truth repository worked by the improvement engine.
    pub repo_dir: PathBuf,
    /// Test command run inside sandbox working copies.
    pub test_command: String,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("STEWARD_BIND").unwrap_or_else(|_| "127.0.0.1:8861".to_string()),
            core_config_path: std::env::var("STEWARD_CONFIG").ok().map(PathBuf::from),
            state_dir: std::env::var("STEWARD_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            governance_file: std::env::var("STEWARD_GOVERNANCE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./governance.json")),
            repo_dir: std::env::var("STEWARD_REPO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            test_command: std::env::var("STEWARD_TEST_COMMAND")
                .unwrap_or_else(|_| "cargo test --quiet".to_string()),
        }
    }
}
