//! Process sandbox runner
//!
//! Prepares an isolated working copy per candidate: a local clone of the
//! source repository at the requested base revision with the diff applied,
//! then runs the project test command in it under a timeout. Workspaces
//! live in temporary directories and are dropped on dispose.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use steward_core::error::{CoreError, CoreResult};
use steward_core::ports::{SandboxRunner, TestReport};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

pub struct ProcessSandboxRunner {
    repo_dir: PathBuf,
    workspaces: Mutex<HashMap<String, TempDir>>,
}

impl ProcessSandboxRunner {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    async fn run(
        &self,
        dir: &std::path::Path,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> CoreResult<std::process::Output> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(dir).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::Transient(format!("spawn {program}: {e}")))?;
        if let Some(input) = stdin {
            child
                .stdin
                .take()
                .ok_or_else(|| CoreError::Transient(format!("{program} stdin unavailable")))?
                .write_all(input.as_bytes())
                .await
                .map_err(|e| CoreError::Transient(format!("write {program} stdin: {e}")))?;
        }
        child
            .wait_with_output()
            .await
            .map_err(|e| CoreError::Transient(format!("wait {program}: {e}")))
    }

    fn workspace_path(&self, workspace_id: &str) -> CoreResult<PathBuf> {
        self.workspaces
            .lock()
            .unwrap()
            .get(workspace_id)
            .map(|d| d.path().to_path_buf())
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown workspace {workspace_id}")))
    }
}

#[async_trait]
impl SandboxRunner for ProcessSandboxRunner {
    async fn prepare(&self, base_rev: &str, diff: &str) -> CoreResult<String> {
        let workspace = tempfile::tempdir()
            .map_err(|e| CoreError::Transient(format!("create sandbox dir: {e}")))?;
        let path = workspace.path().to_path_buf();

        let clone = self
            .run(
                &path,
                "git",
                &[
                    "clone",
                    "--local",
                    "--no-hardlinks",
                    self.repo_dir.to_str().ok_or_else(|| {
                        CoreError::InvalidInput("non-utf8 repository path".to_string())
                    })?,
                    "work",
                ],
                None,
            )
            .await?;
        if !clone.status.success() {
            return Err(CoreError::Transient(format!(
                "sandbox clone failed: {}",
                String::from_utf8_lossy(&clone.stderr).trim()
            )));
        }
        let work = path.join("work");

        let checkout = self.run(&work, "git", &["checkout", base_rev], None).await?;
        if !checkout.status.success() {
            return Err(CoreError::Transient(format!(
                "sandbox checkout {base_rev} failed: {}",
                String::from_utf8_lossy(&checkout.stderr).trim()
            )));
        }

        if !diff.trim().is_empty() {
            let apply = self
                .run(&work, "git", &["apply", "--whitespace=nowarn", "-"], Some(diff))
                .await?;
            if !apply.status.success() {
                return Err(CoreError::InvalidInput(format!(
                    "candidate diff does not apply: {}",
                    String::from_utf8_lossy(&apply.stderr).trim()
                )));
            }
        }

        let workspace_id = Uuid::new_v4().simple().to_string();
        debug!(%workspace_id, base_rev, "sandbox prepared");
        self.workspaces
            .lock()
            .unwrap()
            .insert(workspace_id.clone(), workspace);
        Ok(workspace_id)
    }

    async fn run_tests(
        &self,
        workspace_id: &str,
        command: &str,
        timeout: Duration,
    ) -> CoreResult<TestReport> {
        let work = self.workspace_path(workspace_id)?.join("work");
        let started = Instant::now();

        let run = tokio::time::timeout(
            timeout,
            self.run(&work, "sh", &["-c", command], None),
        )
        .await;
        let duration = started.elapsed();

        match run {
            Err(_) => Ok(TestReport {
                passed: false,
                failures: vec![format!("test run exceeded timeout {timeout:?}")],
                duration,
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok(output)) => {
                let passed = output.status.success();
                let failures = if passed {
                    vec![]
                } else {
                    String::from_utf8_lossy(&output.stderr)
                        .lines()
                        .rev()
                        .take(10)
                        .map(|l| l.to_string())
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect()
                };
                info!(workspace_id, passed, duration_ms = duration.as_millis() as u64, "sandbox tests finished");
                Ok(TestReport {
                    passed,
                    failures,
                    duration,
                })
            }
        }
    }

    async fn dispose(&self, workspace_id: &str) -> CoreResult<()> {
        // Dropping the TempDir removes the tree.
        self.workspaces.lock().unwrap().remove(workspace_id);
        Ok(())
    }
}
