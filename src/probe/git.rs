//! Environment probe backed by the local `git` CLI and the GitHub API.
//!
//! Branch and commit questions are answered by shelling out to `git` in
//! the working directory; PR questions go through octocrab. Both halves
//! are read-only.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use octocrab::params::State;
use octocrab::Octocrab;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::probe::{ChecksStatus, EnvironmentProbe};

/// Check-run conclusions that fail a PR.
const FAILING_CONCLUSIONS: &[&str] = &["failure", "timed_out", "cancelled", "action_required"];

/// Probe over a local clone plus its GitHub remote.
pub struct GitHubProbe {
    octocrab: Octocrab,
    owner: String,
    repo: String,
    working_dir: PathBuf,
}

impl GitHubProbe {
    /// Create a probe for `owner/repo` with a local clone at `working_dir`.
    ///
    /// Uses the ambient octocrab instance, which picks up `GITHUB_TOKEN`
    /// when configured by the caller.
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            octocrab: octocrab::instance().as_ref().clone(),
            owner: owner.into(),
            repo: repo.into(),
            working_dir: working_dir.into(),
        }
    }

    /// Create a probe with an explicit octocrab client (e.g. with auth).
    pub fn with_client(
        octocrab: Octocrab,
        owner: impl Into<String>,
        repo: impl Into<String>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            octocrab,
            owner: owner.into(),
            repo: repo.into(),
            working_dir: working_dir.into(),
        }
    }

    /// Run a git query and capture stdout. A non-zero exit is returned
    /// as `Ok(None)`; failure to launch git at all is an environment
    /// query error.
    async fn git_query(&self, args: &[&str]) -> OrchestratorResult<Option<String>> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::EnvironmentQuery(format!("failed to run git: {}", e))
            })?;

        if output.status.success() {
            Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
        } else {
            debug!(?args, code = ?output.status.code(), "git query returned non-zero");
            Ok(None)
        }
    }
}

#[async_trait]
impl EnvironmentProbe for GitHubProbe {
    async fn branch_exists(&self, name: &str) -> OrchestratorResult<bool> {
        let local = self
            .git_query(&["rev-parse", "--verify", "--quiet", name])
            .await?;
        if local.is_some() {
            return Ok(true);
        }
        // Fall back to the remote-tracking ref; an interrupted run may
        // have pushed the branch without keeping a local copy.
        let remote = self
            .git_query(&[
                "rev-parse",
                "--verify",
                "--quiet",
                &format!("origin/{}", name),
            ])
            .await?;
        Ok(remote.is_some())
    }

    async fn commit_count(&self, branch: &str, base_branch: &str) -> OrchestratorResult<u64> {
        let range = format!("{}..{}", base_branch, branch);
        let stdout = self
            .git_query(&["rev-list", "--count", &range])
            .await?
            .ok_or_else(|| {
                OrchestratorError::EnvironmentQuery(format!(
                    "git rev-list failed for range {}",
                    range
                ))
            })?;
        stdout.trim().parse::<u64>().map_err(|e| {
            OrchestratorError::EnvironmentQuery(format!(
                "unparseable rev-list output {:?}: {}",
                stdout.trim(),
                e
            ))
        })
    }

    async fn find_open_pr(&self, branch: &str) -> OrchestratorResult<Option<u64>> {
        let head = format!("{}:{}", self.owner, branch);
        let page = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .list()
            .state(State::Open)
            .head(head)
            .per_page(1)
            .send()
            .await
            .map_err(|e| {
                OrchestratorError::EnvironmentQuery(format!("PR lookup failed: {}", e))
            })?;

        Ok(page.items.first().map(|pr| pr.number))
    }

    async fn pr_checks_status(&self, pr_id: u64) -> OrchestratorResult<ChecksStatus> {
        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .get(pr_id)
            .await
            .map_err(|e| {
                OrchestratorError::EnvironmentQuery(format!("PR {} fetch failed: {}", pr_id, e))
            })?;

        let check_runs = self
            .octocrab
            .checks(&self.owner, &self.repo)
            .list_check_runs_for_git_ref(pr.head.sha.clone().into())
            .send()
            .await
            .map_err(|e| {
                OrchestratorError::EnvironmentQuery(format!(
                    "check runs for PR {} failed: {}",
                    pr_id, e
                ))
            })?;

        // No checks reported yet counts as pending: the review phase
        // polls again rather than declaring the PR green.
        if check_runs.check_runs.is_empty() {
            return Ok(ChecksStatus::Pending);
        }

        let mut any_pending = false;
        for run in &check_runs.check_runs {
            match run.conclusion.as_deref() {
                None => any_pending = true,
                Some(conclusion) if FAILING_CONCLUSIONS.contains(&conclusion) => {
                    return Ok(ChecksStatus::Failing);
                }
                Some(_) => {}
            }
        }

        if any_pending {
            Ok(ChecksStatus::Pending)
        } else {
            Ok(ChecksStatus::Passing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Network-facing methods are exercised against the real API only in
    // deployment; these tests cover the local git half.

    async fn init_repo(dir: &TempDir) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "root"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .status()
                .await
                .expect("git");
            assert!(status.success(), "git {:?} failed", args);
        }
    }

    #[tokio::test]
    async fn test_branch_exists_for_local_branch() {
        let dir = TempDir::new().expect("temp dir");
        init_repo(&dir).await;
        let probe = GitHubProbe::new("owner", "repo", dir.path());

        assert!(probe.branch_exists("main").await.expect("query"));
        assert!(!probe.branch_exists("unit/missing").await.expect("query"));
    }

    #[tokio::test]
    async fn test_commit_count_between_refs() {
        let dir = TempDir::new().expect("temp dir");
        init_repo(&dir).await;
        for args in [
            vec!["checkout", "-b", "unit/U-1"],
            vec!["commit", "--allow-empty", "-m", "one"],
            vec!["commit", "--allow-empty", "-m", "two"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir.path())
                .status()
                .await
                .expect("git");
            assert!(status.success());
        }

        let probe = GitHubProbe::new("owner", "repo", dir.path());
        let count = probe.commit_count("unit/U-1", "main").await.expect("count");
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_git_failure_outside_repo_is_environment_error() {
        let dir = TempDir::new().expect("temp dir");
        let probe = GitHubProbe::new("owner", "repo", dir.path());
        let err = probe
            .commit_count("unit/U-1", "main")
            .await
            .expect_err("not a repo");
        assert!(matches!(err, OrchestratorError::EnvironmentQuery(_)));
    }
}
