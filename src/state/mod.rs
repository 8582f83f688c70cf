//! Persisted workflow state: the root document for one orchestration run.
//!
//! `WorkflowState` is an explicit value passed through every operation and
//! persisted via [`store::StateStore`]; there is no ambient session state.
//! Workers only ever receive cloned snapshots of a [`UnitRecord`] and hand
//! results back by return value.

pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use store::StateStore;

/// One ordered stage in a unit's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Planning,
    Implementation,
    QualityAssurance,
    Delivery,
    Review,
    FinalReport,
}

impl Phase {
    /// The full pipeline in execution order.
    pub fn default_pipeline() -> Vec<Phase> {
        vec![
            Phase::Planning,
            Phase::Implementation,
            Phase::QualityAssurance,
            Phase::Delivery,
            Phase::Review,
            Phase::FinalReport,
        ]
    }

    /// Stable name used in logs, worker dispatch, and reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Implementation => "implementation",
            Phase::QualityAssurance => "quality_assurance",
            Phase::Delivery => "delivery",
            Phase::Review => "review",
            Phase::FinalReport => "final_report",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestration mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// One unit driven through the phase pipeline by the conductor flow.
    SingleTask,
    /// A planned backlog executed as ordered parallel batches.
    MultiBatch,
}

/// Why a unit ended up in the `Failed` terminal state.
///
/// Kept distinct so the final report can call out permanently failed
/// units separately from timed-out or cancelled ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Permanent,
    Timeout,
    Cancelled,
}

/// Lifecycle status of a unit. Forms a total order: `NotStarted` →
/// `InProgress` → `Succeeded` | `Failed`, with no transition skipping a
/// state and no transition out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
}

impl UnitStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Succeeded | UnitStatus::Failed)
    }

    /// Whether moving to `next` is a legal single step in the lifecycle.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        matches!(
            (self, next),
            (UnitStatus::NotStarted, UnitStatus::InProgress)
                | (UnitStatus::InProgress, UnitStatus::Succeeded)
                | (UnitStatus::InProgress, UnitStatus::Failed)
        )
    }
}

/// One task unit being processed (e.g. one backlog item).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRecord {
    /// Stable identifier from the backlog source.
    pub unit_id: String,
    /// Human-readable title, carried for reports.
    #[serde(default)]
    pub title: String,
    /// Free-text scope labels (e.g. "backend", "frontend") used by the
    /// conflict detector.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Unit ids this unit depends on; dependents are scheduled in a
    /// strictly later batch.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Computed priority score, higher runs earlier.
    pub priority_score: f64,
    /// Current phase within the run's pipeline.
    pub current_phase: Phase,
    /// Lifecycle status.
    pub status: UnitStatus,
    /// VCS branch created for this unit, once one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_ref: Option<String>,
    /// External artifact references (e.g. a PR number).
    #[serde(default)]
    pub artifact_refs: Vec<String>,
    /// Transient retries consumed so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Failure reason, set when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Failure kind, set when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl UnitRecord {
    /// Create a fresh record at the start of the pipeline.
    pub fn new(unit_id: impl Into<String>, first_phase: Phase) -> Self {
        Self {
            unit_id: unit_id.into(),
            title: String::new(),
            labels: Vec::new(),
            depends_on: Vec::new(),
            priority_score: 0.0,
            current_phase: first_phase,
            status: UnitStatus::NotStarted,
            branch_ref: None,
            artifact_refs: Vec::new(),
            retry_count: 0,
            failure_reason: None,
            failure_kind: None,
        }
    }

    /// Sets the title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Sets the scope labels.
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    /// Sets the dependency list.
    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Sets the priority score.
    pub fn with_priority_score(mut self, score: f64) -> Self {
        self.priority_score = score;
        self
    }

    /// The branch name this unit is expected to use, derived from its id.
    pub fn expected_branch(&self) -> String {
        self.branch_ref
            .clone()
            .unwrap_or_else(|| format!("unit/{}", self.unit_id))
    }

    /// Apply a status transition, rejecting any skip or terminal exit.
    pub fn transition(&mut self, next: UnitStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "illegal status transition {:?} -> {:?} for unit {}",
                self.status, next, self.unit_id
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Mark the unit failed with a reason and kind. Moves through
    /// `InProgress` if the unit never started, so no state is skipped.
    /// A unit already in a terminal state is left untouched.
    pub fn mark_failed(&mut self, kind: FailureKind, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        if self.status == UnitStatus::NotStarted {
            self.status = UnitStatus::InProgress;
        }
        self.status = UnitStatus::Failed;
        self.failure_kind = Some(kind);
        self.failure_reason = Some(reason.into());
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A recorded conflict warning: the pair was scheduled together despite a
/// detected scope overlap (degenerate batch acceptance).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictWarning {
    pub unit_a: String,
    pub unit_b: String,
    pub scope: String,
}

/// A group of units intended to run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_number: usize,
    pub unit_ids: Vec<String>,
    #[serde(default)]
    pub conflict_warnings: Vec<ConflictWarning>,
    pub status: BatchStatus,
}

impl Batch {
    pub fn new(batch_number: usize, unit_ids: Vec<String>) -> Self {
        Self {
            batch_number,
            unit_ids,
            conflict_warnings: Vec::new(),
            status: BatchStatus::Pending,
        }
    }
}

/// The persisted root document for one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub run_id: String,
    pub mode: RunMode,
    /// Ordered phase pipeline, immutable for the run.
    pub phase_definition: Vec<Phase>,
    /// Cursor into `phase_definition`; monotonically non-decreasing
    /// across saves.
    pub current_phase_index: usize,
    /// Cursor into `batches` (MultiBatch mode).
    pub current_batch_index: usize,
    /// All units in the run, keyed by unit id. A BTreeMap keeps
    /// serialization and iteration order stable.
    pub units: BTreeMap<String, UnitRecord>,
    /// Planned batches, in execution order (MultiBatch mode only).
    #[serde(default)]
    pub batches: Vec<Batch>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create a fresh run document.
    pub fn new(run_id: impl Into<String>, mode: RunMode, phase_definition: Vec<Phase>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            mode,
            phase_definition,
            current_phase_index: 0,
            current_batch_index: 0,
            units: BTreeMap::new(),
            batches: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Insert a unit record, replacing any previous record with the same id.
    pub fn upsert_unit(&mut self, unit: UnitRecord) {
        self.units.insert(unit.unit_id.clone(), unit);
    }

    /// Advance the phase cursor. The cursor never moves backwards; a
    /// smaller index is ignored rather than applied.
    pub fn advance_phase_cursor(&mut self, index: usize) {
        if index > self.current_phase_index {
            self.current_phase_index = index.min(self.phase_definition.len());
        }
    }

    /// Whether every unit has reached a terminal status.
    pub fn all_units_terminal(&self) -> bool {
        self.units.values().all(|u| u.status.is_terminal())
    }

    /// Whether the run succeeded: all units terminal and none failed.
    pub fn is_terminal_success(&self) -> bool {
        self.all_units_terminal()
            && self
                .units
                .values()
                .all(|u| u.status == UnitStatus::Succeeded)
    }

    /// Structural validation applied after deserialization. A failure
    /// here is a `StateCorruption` at the store boundary.
    pub fn validate(&self) -> Result<(), String> {
        if self.run_id.trim().is_empty() {
            return Err("runId is empty".to_string());
        }
        if self.phase_definition.is_empty() {
            return Err("phaseDefinition is empty".to_string());
        }
        if self.current_phase_index > self.phase_definition.len() {
            return Err(format!(
                "currentPhaseIndex {} out of range for {} phases",
                self.current_phase_index,
                self.phase_definition.len()
            ));
        }
        if self.current_batch_index > self.batches.len() {
            return Err(format!(
                "currentBatchIndex {} out of range for {} batches",
                self.current_batch_index,
                self.batches.len()
            ));
        }
        // Batch membership must partition: no unit appears twice, and
        // every referenced unit must exist.
        let mut seen = std::collections::HashSet::new();
        for batch in &self.batches {
            for unit_id in &batch.unit_ids {
                if !self.units.contains_key(unit_id) {
                    return Err(format!(
                        "batch {} references unknown unit {}",
                        batch.batch_number, unit_id
                    ));
                }
                if !seen.insert(unit_id.clone()) {
                    return Err(format!(
                        "unit {} appears in more than one batch",
                        unit_id
                    ));
                }
            }
        }
        for unit in self.units.values() {
            if unit.status == UnitStatus::Failed && unit.failure_reason.is_none() {
                return Err(format!("failed unit {} has no failure reason", unit.unit_id));
            }
            if !self.phase_definition.contains(&unit.current_phase) {
                return Err(format!(
                    "unit {} is at phase {} outside the run's pipeline",
                    unit.unit_id, unit.current_phase
                ));
            }
        }
        Ok(())
    }

    /// Touch the update timestamp. Called by the store on save.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
