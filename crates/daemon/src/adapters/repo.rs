//! Source-of-truth repository via the git CLI
//!
//! Change proposals become branches; merging a proposal merges its branch
//! back into the default branch. All operations shell out to `git` in the
//! configured repository directory; failures carry the stderr tail and map
//! to `Transient` (the repository may be locked or remote-backed).

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use steward_core::error::{CoreError, CoreResult};
use steward_core::ports::{CommitSpec, SourceRepository};
use tokio::process::Command;
use tracing::{debug, info};

pub struct GitSourceRepository {
    repo_dir: PathBuf,
    /// proposal id -> branch name.
    proposals: Mutex<HashMap<String, String>>,
    next_proposal: Mutex<u64>,
}

impl GitSourceRepository {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            proposals: Mutex::new(HashMap::new()),
            next_proposal: Mutex::new(0),
        }
    }

    pub fn repo_dir(&self) -> &PathBuf {
        &self.repo_dir
    }

    async fn git(&self, args: &[&str]) -> CoreResult<String> {
        debug!(?args, "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .output()
            .await
            .map_err(|e| CoreError::Transient(format!("spawn git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Transient(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn git_with_stdin(&self, args: &[&str], stdin: &str) -> CoreResult<String> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("git")
            .args(args)
            .current_dir(&self.repo_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CoreError::Transient(format!("spawn git: {e}")))?;
        child
            .stdin
            .take()
            .ok_or_else(|| CoreError::Transient("git stdin unavailable".to_string()))?
            .write_all(stdin.as_bytes())
            .await
            .map_err(|e| CoreError::Transient(format!("write git stdin: {e}")))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CoreError::Transient(format!("wait git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CoreError::Transient(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn default_branch(&self) -> CoreResult<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }
}

#[async_trait]
impl SourceRepository for GitSourceRepository {
    async fn list_changed_paths(&self, since: &str) -> CoreResult<Vec<String>> {
        let range = format!("{since}..HEAD");
        let out = self.git(&["diff", "--name-only", &range]).await?;
        Ok(out
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    async fn read(&self, path: &str, rev: &str) -> CoreResult<Vec<u8>> {
        let spec = format!("{rev}:{path}");
        let out = self.git(&["show", &spec]).await?;
        Ok(out.into_bytes())
    }

    async fn propose_change(
        &self,
        branch: &str,
        commits: &[CommitSpec],
        description: &str,
    ) -> CoreResult<String> {
        let base = self.default_branch().await?;
        self.git(&["checkout", "-b", branch]).await?;

        let result: CoreResult<()> = async {
            for commit in commits {
                self.git_with_stdin(&["apply", "--whitespace=nowarn", "-"], &commit.diff)
                    .await?;
                self.git(&["add", "-A"]).await?;
                self.git(&["commit", "-m", &commit.message]).await?;
            }
            Ok(())
        }
        .await;

        // Always return to the base branch; a half-applied proposal branch
        // is abandoned.
        let restore = self.git(&["checkout", &base]).await;
        result?;
        restore?;

        let pr_id = {
            let mut next = self.next_proposal.lock().unwrap();
            *next += 1;
            format!("proposal-{}", *next)
        };
        self.proposals
            .lock()
            .unwrap()
            .insert(pr_id.clone(), branch.to_string());
        info!(%pr_id, branch, "change proposed: {}", description.lines().next().unwrap_or(""));
        Ok(pr_id)
    }

    async fn merge(&self, pr_id: &str, strategy: &str) -> CoreResult<String> {
        let branch = self
            .proposals
            .lock()
            .unwrap()
            .get(pr_id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown proposal {pr_id}")))?;
        match strategy {
            "squash" => {
                self.git(&["merge", "--squash", &branch]).await?;
                self.git(&["commit", "-m", &format!("merge {pr_id}")]).await?;
            }
            _ => {
                self.git(&["merge", "--no-ff", "-m", &format!("merge {pr_id}"), &branch])
                    .await?;
            }
        }
        let commit = self.git(&["rev-parse", "HEAD"]).await?;
        info!(pr_id, %commit, "proposal merged");
        Ok(commit)
    }

    async fn revert(&self, commit_id: &str) -> CoreResult<String> {
        self.git(&["revert", "--no-edit", commit_id]).await?;
        let commit = self.git(&["rev-parse", "HEAD"]).await?;
        info!(reverted = commit_id, %commit, "compensating revert committed");
        Ok(commit)
    }

    async fn head(&self) -> CoreResult<String> {
        self.git(&["rev-parse", "HEAD"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo() -> (tempfile::TempDir, GitSourceRepository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GitSourceRepository::new(dir.path());
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "steward@test"],
            vec!["config", "user.name", "steward"],
        ] {
            repo.git(&args).await.unwrap();
        }
        std::fs::write(dir.path().join("README.md"), "steward test repo\n").unwrap();
        repo.git(&["add", "-A"]).await.unwrap();
        repo.git(&["commit", "-m", "init"]).await.unwrap();
        (dir, repo)
    }

    const DIFF: &str = "\
--- a/README.md
+++ b/README.md
@@ -1 +1,2 @@
 steward test repo
+improved
";

    #[tokio::test]
    async fn test_propose_merge_and_revert_roundtrip() {
        let (_dir, repo) = init_repo().await;
        let head_before = repo.head().await.unwrap();

        let pr = repo
            .propose_change(
                "improve/test",
                &[CommitSpec {
                    message: "add line".to_string(),
                    diff: DIFF.to_string(),
                }],
                "test proposal",
            )
            .await
            .unwrap();
        // Proposal lives on its branch; the default branch is untouched.
        assert_eq!(repo.head().await.unwrap(), head_before);

        let commit = repo.merge(&pr, "squash").await.unwrap();
        assert_ne!(commit, head_before);
        let changed = repo.list_changed_paths(&head_before).await.unwrap();
        assert_eq!(changed, vec!["README.md".to_string()]);

        let reverted = repo.revert(&commit).await.unwrap();
        assert_ne!(reverted, commit);
        let content = repo.read("README.md", "HEAD").await.unwrap();
        assert_eq!(String::from_utf8(content).unwrap().trim(), "steward test repo");
    }

    #[tokio::test]
    async fn test_merge_unknown_proposal_rejected() {
        let (_dir, repo) = init_repo().await;
        assert!(matches!(
            repo.merge("proposal-999", "squash").await,
            Err(CoreError::InvalidInput(_))
        ));
    }
}
