//! Final run report.
//!
//! Aggregates the terminal state of a run into a single document: one
//! line per unit with its outcome and retry count, failures broken out
//! by kind so a permanently failed unit is never lumped in with one
//! that merely timed out or was cancelled.

use serde::{Deserialize, Serialize};

use crate::state::{FailureKind, UnitStatus, WorkflowState};

/// Terminal outcome of one unit as reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded,
    FailedPermanent,
    TimedOut,
    Cancelled,
    /// The run ended before the unit reached a terminal status.
    Unresolved,
}

/// One unit's line in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub unit_id: String,
    pub title: String,
    pub outcome: UnitOutcome,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_ref: Option<String>,
    #[serde(default)]
    pub artifact_refs: Vec<String>,
}

/// Aggregate counts across the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub total: usize,
    pub succeeded: usize,
    pub failed_permanent: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub unresolved: usize,
}

/// The full report for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub totals: RunTotals,
    /// One entry per unit, in stable unit-id order.
    pub units: Vec<UnitReport>,
}

impl RunReport {
    /// Whether every unit succeeded.
    pub fn is_clean(&self) -> bool {
        self.totals.succeeded == self.totals.total
    }

    /// Render a human-readable summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("run {}\n", self.run_id));
        out.push_str(&format!(
            "{} units: {} succeeded, {} failed, {} timed out, {} cancelled",
            self.totals.total,
            self.totals.succeeded,
            self.totals.failed_permanent,
            self.totals.timed_out,
            self.totals.cancelled,
        ));
        if self.totals.unresolved > 0 {
            out.push_str(&format!(", {} unresolved", self.totals.unresolved));
        }
        out.push('\n');
        for unit in &self.units {
            let outcome = match unit.outcome {
                UnitOutcome::Succeeded => "ok",
                UnitOutcome::FailedPermanent => "FAILED",
                UnitOutcome::TimedOut => "TIMEOUT",
                UnitOutcome::Cancelled => "cancelled",
                UnitOutcome::Unresolved => "unresolved",
            };
            out.push_str(&format!(
                "  [{}] {} {}",
                outcome,
                unit.unit_id,
                unit.title
            ));
            if unit.retry_count > 0 {
                out.push_str(&format!(" (retries: {})", unit.retry_count));
            }
            if let Some(reason) = &unit.failure_reason {
                out.push_str(&format!(": {}", reason));
            }
            out.push('\n');
        }
        out
    }
}

/// Builds the final report from a run's state document.
#[derive(Debug, Default, Clone)]
pub struct ReportAggregator;

impl ReportAggregator {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate the state into a report. Accepts non-terminal states
    /// too (an interrupted run reports its unfinished units as
    /// `Unresolved` rather than erroring).
    pub fn aggregate(&self, state: &WorkflowState) -> RunReport {
        let mut totals = RunTotals::default();
        let mut units = Vec::with_capacity(state.units.len());

        for unit in state.units.values() {
            let outcome = match (unit.status, unit.failure_kind) {
                (UnitStatus::Succeeded, _) => UnitOutcome::Succeeded,
                (UnitStatus::Failed, Some(FailureKind::Timeout)) => UnitOutcome::TimedOut,
                (UnitStatus::Failed, Some(FailureKind::Cancelled)) => UnitOutcome::Cancelled,
                (UnitStatus::Failed, _) => UnitOutcome::FailedPermanent,
                _ => UnitOutcome::Unresolved,
            };
            totals.total += 1;
            match outcome {
                UnitOutcome::Succeeded => totals.succeeded += 1,
                UnitOutcome::FailedPermanent => totals.failed_permanent += 1,
                UnitOutcome::TimedOut => totals.timed_out += 1,
                UnitOutcome::Cancelled => totals.cancelled += 1,
                UnitOutcome::Unresolved => totals.unresolved += 1,
            }
            units.push(UnitReport {
                unit_id: unit.unit_id.clone(),
                title: unit.title.clone(),
                outcome,
                retry_count: unit.retry_count,
                failure_reason: unit.failure_reason.clone(),
                branch_ref: unit.branch_ref.clone(),
                artifact_refs: unit.artifact_refs.clone(),
            });
        }

        RunReport {
            run_id: state.run_id.clone(),
            totals,
            units,
        }
    }
}
