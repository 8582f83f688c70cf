//! Resume-point analysis for interrupted runs.
//!
//! Given a unit's saved record (advisory) and a live environment
//! snapshot (authoritative), the analyzer computes the phase an
//! interrupted run should continue from. The decision table is evaluated
//! top-down, first match wins, and is total: a snapshot matching no row
//! is an [`OrchestratorError::AmbiguousResumption`] that must reach an
//! operator, never a silent fresh start.

use tracing::{info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::probe::{ChecksStatus, EnvironmentProbe, EnvironmentSnapshot};
use crate::state::{Phase, UnitRecord};

/// The computed resume point for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeDecision {
    /// Phase to continue from.
    pub phase: Phase,
    /// Which decision-table row fired, for logs and operator output.
    pub rule: &'static str,
    /// True when live environment state contradicted the saved record
    /// and won.
    pub overrode_saved: bool,
}

/// Computes resume points from environment ground truth.
pub struct ResumptionAnalyzer<'a> {
    probe: &'a dyn EnvironmentProbe,
    base_branch: &'a str,
}

impl<'a> ResumptionAnalyzer<'a> {
    pub fn new(probe: &'a dyn EnvironmentProbe, base_branch: &'a str) -> Self {
        Self { probe, base_branch }
    }

    /// Probe the unit's expected branch and decide its resume point.
    ///
    /// Probe failures propagate unchanged: the caller cannot determine
    /// external state and must not assume a fresh start.
    pub async fn analyze_unit(
        &self,
        saved: Option<&UnitRecord>,
        unit_id: &str,
        branch: &str,
    ) -> OrchestratorResult<ResumeDecision> {
        let snapshot = EnvironmentSnapshot::capture(self.probe, branch, self.base_branch).await?;
        let decision = Self::decide(saved, unit_id, &snapshot)?;
        info!(
            unit_id,
            branch,
            phase = %decision.phase,
            rule = decision.rule,
            "resume point computed"
        );
        Ok(decision)
    }

    /// The decision table as a pure function over a snapshot.
    ///
    /// Calling this twice with the same inputs always yields the same
    /// phase; there is no hidden state.
    pub fn decide(
        saved: Option<&UnitRecord>,
        unit_id: &str,
        snapshot: &EnvironmentSnapshot,
    ) -> OrchestratorResult<ResumeDecision> {
        // An internally inconsistent snapshot (work attributed to a
        // branch that does not exist) has no table row.
        if !snapshot.branch_exists && (snapshot.commits_ahead > 0 || snapshot.open_pr.is_some()) {
            return Err(OrchestratorError::AmbiguousResumption {
                unit_id: unit_id.to_string(),
                detail: format!(
                    "branch {} does not exist but snapshot reports {} commits and PR {:?}",
                    snapshot.branch, snapshot.commits_ahead, snapshot.open_pr
                ),
            });
        }

        if !snapshot.branch_exists {
            // Environment says no work happened. If the saved record
            // claims progress, the environment wins; the saved state is
            // an advisory cache only.
            let overrode = saved.is_some_and(|u| u.current_phase != Phase::Planning);
            if overrode {
                warn!(
                    unit_id,
                    branch = %snapshot.branch,
                    "saved state claims progress but branch is missing; environment wins"
                );
            }
            return Ok(ResumeDecision {
                phase: Phase::Planning,
                rule: "no-branch",
                overrode_saved: overrode,
            });
        }

        if snapshot.commits_ahead == 0 {
            return Ok(ResumeDecision {
                phase: Phase::Implementation,
                rule: "branch-no-commits",
                overrode_saved: false,
            });
        }

        let Some(_pr_id) = snapshot.open_pr else {
            return Ok(ResumeDecision {
                phase: Phase::QualityAssurance,
                rule: "commits-no-pr",
                overrode_saved: false,
            });
        };

        match snapshot.checks {
            Some(ChecksStatus::Pending) | Some(ChecksStatus::Failing) => Ok(ResumeDecision {
                phase: Phase::Review,
                rule: "pr-checks-unresolved",
                overrode_saved: false,
            }),
            Some(ChecksStatus::Passing) => Ok(ResumeDecision {
                phase: Phase::FinalReport,
                rule: "pr-checks-passing",
                overrode_saved: false,
            }),
            // A PR with no observable check status matches no row.
            None => Err(OrchestratorError::AmbiguousResumption {
                unit_id: unit_id.to_string(),
                detail: format!(
                    "open PR {:?} on {} has no check status",
                    snapshot.open_pr, snapshot.branch
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::StaticProbe;
    use crate::state::UnitStatus;

    fn snapshot(
        branch_exists: bool,
        commits_ahead: u64,
        open_pr: Option<u64>,
        checks: Option<ChecksStatus>,
    ) -> EnvironmentSnapshot {
        EnvironmentSnapshot {
            branch: "unit/U-1".to_string(),
            branch_exists,
            commits_ahead,
            open_pr,
            checks,
        }
    }

    #[test]
    fn test_fresh_start_without_state_or_branch() {
        let decision =
            ResumptionAnalyzer::decide(None, "U-1", &snapshot(false, 0, None, None)).expect("row");
        assert_eq!(decision.phase, Phase::Planning);
        assert!(!decision.overrode_saved);
    }

    #[test]
    fn test_branch_without_commits_resumes_implementation() {
        let decision =
            ResumptionAnalyzer::decide(None, "U-1", &snapshot(true, 0, None, None)).expect("row");
        assert_eq!(decision.phase, Phase::Implementation);
    }

    #[test]
    fn test_commits_without_pr_resumes_quality_assurance() {
        // Scenario from the design notes: unit #42 saved at
        // Implementation, branch has 3 commits and no PR.
        let saved = UnitRecord::new("42", Phase::Implementation);
        let decision =
            ResumptionAnalyzer::decide(Some(&saved), "42", &snapshot(true, 3, None, None))
                .expect("row");
        assert_eq!(decision.phase, Phase::QualityAssurance);
    }

    #[test]
    fn test_pr_with_pending_checks_resumes_review() {
        let decision = ResumptionAnalyzer::decide(
            None,
            "U-1",
            &snapshot(true, 2, Some(9), Some(ChecksStatus::Pending)),
        )
        .expect("row");
        assert_eq!(decision.phase, Phase::Review);
    }

    #[test]
    fn test_pr_with_failing_checks_resumes_review() {
        let decision = ResumptionAnalyzer::decide(
            None,
            "U-1",
            &snapshot(true, 2, Some(9), Some(ChecksStatus::Failing)),
        )
        .expect("row");
        assert_eq!(decision.phase, Phase::Review);
    }

    #[test]
    fn test_pr_with_passing_checks_resumes_final_report() {
        let decision = ResumptionAnalyzer::decide(
            None,
            "U-1",
            &snapshot(true, 2, Some(9), Some(ChecksStatus::Passing)),
        )
        .expect("row");
        assert_eq!(decision.phase, Phase::FinalReport);
    }

    #[test]
    fn test_environment_wins_over_saved_progress() {
        let mut saved = UnitRecord::new("U-1", Phase::QualityAssurance);
        saved.status = UnitStatus::InProgress;
        let decision =
            ResumptionAnalyzer::decide(Some(&saved), "U-1", &snapshot(false, 0, None, None))
                .expect("row");
        assert_eq!(decision.phase, Phase::Planning);
        assert!(decision.overrode_saved);
    }

    #[test]
    fn test_pr_without_checks_is_ambiguous() {
        let err = ResumptionAnalyzer::decide(None, "U-1", &snapshot(true, 2, Some(9), None))
            .expect_err("ambiguous");
        assert!(matches!(
            err,
            OrchestratorError::AmbiguousResumption { .. }
        ));
    }

    #[test]
    fn test_inconsistent_snapshot_is_ambiguous() {
        let err = ResumptionAnalyzer::decide(None, "U-1", &snapshot(false, 3, None, None))
            .expect_err("ambiguous");
        assert!(matches!(
            err,
            OrchestratorError::AmbiguousResumption { .. }
        ));
    }

    #[test]
    fn test_decision_is_idempotent() {
        let snap = snapshot(true, 3, None, None);
        let first = ResumptionAnalyzer::decide(None, "U-1", &snap).expect("row");
        let second = ResumptionAnalyzer::decide(None, "U-1", &snap).expect("row");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_analyze_unit_fails_closed_on_probe_error() {
        let probe = StaticProbe::failing();
        let analyzer = ResumptionAnalyzer::new(&probe, "main");
        let err = analyzer
            .analyze_unit(None, "U-1", "unit/U-1")
            .await
            .expect_err("probe down");
        assert!(matches!(err, OrchestratorError::EnvironmentQuery(_)));
    }

    #[tokio::test]
    async fn test_analyze_unit_end_to_end() {
        let probe = StaticProbe::default()
            .with_branch("feature/issue-42", 3)
            .with_open_pr("feature/issue-42", 7, ChecksStatus::Passing);
        let analyzer = ResumptionAnalyzer::new(&probe, "main");
        let decision = analyzer
            .analyze_unit(None, "42", "feature/issue-42")
            .await
            .expect("decision");
        assert_eq!(decision.phase, Phase::FinalReport);
    }
}
