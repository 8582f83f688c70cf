//! Read-only adapter over version control and the issue tracker.
//!
//! The probe answers four questions: does a branch exist, how many
//! commits is it ahead of base, is there an open PR for it, and what is
//! that PR's check status. All queries are side-effect free, so any
//! number of workers may share one probe without coordination. A query
//! failure is surfaced as [`OrchestratorError::EnvironmentQuery`] and is
//! never treated as "not found".

pub mod git;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorResult;

pub use git::GitHubProbe;

/// Aggregate CI status for a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksStatus {
    Pending,
    Passing,
    Failing,
}

/// Read-only queries against the external VCS and tracker.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Whether the named branch exists.
    async fn branch_exists(&self, name: &str) -> OrchestratorResult<bool>;

    /// Number of commits on `branch` that are not on `base_branch`.
    async fn commit_count(&self, branch: &str, base_branch: &str) -> OrchestratorResult<u64>;

    /// The open PR for `branch`, if one exists.
    async fn find_open_pr(&self, branch: &str) -> OrchestratorResult<Option<u64>>;

    /// Aggregate check status for an open PR.
    async fn pr_checks_status(&self, pr_id: u64) -> OrchestratorResult<ChecksStatus>;
}

/// A point-in-time observation of one unit's external environment.
///
/// The resumption analyzer consumes snapshots rather than the probe
/// directly, which keeps its decision a pure function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    /// The branch that was probed.
    pub branch: String,
    pub branch_exists: bool,
    /// Commits ahead of base; zero when the branch does not exist.
    pub commits_ahead: u64,
    pub open_pr: Option<u64>,
    /// Check status of the open PR; `None` when there is no PR.
    pub checks: Option<ChecksStatus>,
}

impl EnvironmentSnapshot {
    /// Capture a snapshot for one branch. Later queries are skipped as
    /// soon as an earlier one rules them out (no branch means no
    /// commits and no PR). Any probe failure propagates; callers must
    /// fail closed rather than assume a fresh environment.
    pub async fn capture(
        probe: &dyn EnvironmentProbe,
        branch: &str,
        base_branch: &str,
    ) -> OrchestratorResult<Self> {
        let branch_exists = probe.branch_exists(branch).await?;
        if !branch_exists {
            return Ok(Self {
                branch: branch.to_string(),
                branch_exists: false,
                commits_ahead: 0,
                open_pr: None,
                checks: None,
            });
        }

        let commits_ahead = probe.commit_count(branch, base_branch).await?;
        let open_pr = probe.find_open_pr(branch).await?;
        let checks = match open_pr {
            Some(pr_id) => Some(probe.pr_checks_status(pr_id).await?),
            None => None,
        };

        Ok(Self {
            branch: branch.to_string(),
            branch_exists,
            commits_ahead,
            open_pr,
            checks,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticProbe;
    use super::*;

    #[tokio::test]
    async fn test_snapshot_for_missing_branch_short_circuits() {
        let probe = StaticProbe::default();
        let snap = EnvironmentSnapshot::capture(&probe, "unit/U-1", "main")
            .await
            .expect("capture");
        assert!(!snap.branch_exists);
        assert_eq!(snap.commits_ahead, 0);
        assert_eq!(snap.open_pr, None);
        assert_eq!(snap.checks, None);
    }

    #[tokio::test]
    async fn test_snapshot_with_branch_and_pr() {
        let probe = StaticProbe::default()
            .with_branch("feature/issue-42", 3)
            .with_open_pr("feature/issue-42", 7, ChecksStatus::Passing);
        let snap = EnvironmentSnapshot::capture(&probe, "feature/issue-42", "main")
            .await
            .expect("capture");
        assert!(snap.branch_exists);
        assert_eq!(snap.commits_ahead, 3);
        assert_eq!(snap.open_pr, Some(7));
        assert_eq!(snap.checks, Some(ChecksStatus::Passing));
    }

    #[tokio::test]
    async fn test_probe_failure_propagates() {
        let probe = StaticProbe::failing();
        let err = EnvironmentSnapshot::capture(&probe, "unit/U-1", "main")
            .await
            .expect_err("failure");
        assert!(matches!(
            err,
            crate::error::OrchestratorError::EnvironmentQuery(_)
        ));
    }
}
