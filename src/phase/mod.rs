//! The per-unit phase state machine.
//!
//! Drives one unit through the run's ordered phase pipeline. Leaving
//! quality assurance is gated on the blocking checks passing; a gate
//! failure or a reviewer requesting changes re-enters implementation on
//! the same unit rather than spawning a new one. A worker-reported
//! failure moves the unit to `Failed` and never aborts sibling units.

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::quality::QualityGateValidator;
use crate::state::{FailureKind, Phase, UnitRecord, UnitStatus};
use crate::worker::{execute_with_retry, WorkerRegistry, WorkerStatus};

/// Artifact marker a review worker returns when the external reviewer
/// asked for changes; maps to a transition back to implementation.
pub const CHANGES_REQUESTED_ARTIFACT: &str = "changes_requested";

/// Artifact prefix recording the branch a worker created.
const BRANCH_ARTIFACT_PREFIX: &str = "branch:";

/// State machine over an immutable phase pipeline.
pub struct PhaseStateMachine {
    pipeline: Vec<Phase>,
    /// How many times a unit may bounce back from the quality gate
    /// before it is failed outright.
    gate_reentry_limit: u32,
}

impl PhaseStateMachine {
    /// Create a machine for the given pipeline (must be non-empty).
    pub fn new(pipeline: Vec<Phase>) -> Self {
        Self {
            pipeline,
            gate_reentry_limit: 2,
        }
    }

    /// Sets the quality-gate re-entry bound.
    pub fn with_gate_reentry_limit(mut self, limit: u32) -> Self {
        self.gate_reentry_limit = limit;
        self
    }

    /// The pipeline this machine drives.
    pub fn pipeline(&self) -> &[Phase] {
        &self.pipeline
    }

    /// First phase of the pipeline.
    pub fn first_phase(&self) -> Phase {
        self.pipeline[0]
    }

    /// Index of a phase within the pipeline.
    pub fn index_of(&self, phase: Phase) -> Option<usize> {
        self.pipeline.iter().position(|p| *p == phase)
    }

    /// The phase after `current`, or `None` at the end of the pipeline.
    pub fn next_phase(&self, current: Phase) -> Option<Phase> {
        let idx = self.index_of(current)?;
        self.pipeline.get(idx + 1).copied()
    }

    /// Drive a unit from its current phase to a terminal status.
    ///
    /// The unit starts at `unit.current_phase`, which supports resuming
    /// mid-pipeline. `checkpoint` is invoked after every phase
    /// transition so the caller can persist progress; save errors
    /// propagate and halt the unit. Returns the terminal record.
    pub async fn run_unit<F>(
        &self,
        mut unit: UnitRecord,
        registry: &WorkerRegistry,
        gate: &QualityGateValidator,
        retry_limit: u32,
        cancel: watch::Receiver<bool>,
        mut checkpoint: F,
    ) -> OrchestratorResult<UnitRecord>
    where
        F: FnMut(&UnitRecord) -> OrchestratorResult<()> + Send,
    {
        if self.index_of(unit.current_phase).is_none() {
            return Err(OrchestratorError::Planning(format!(
                "unit {} is at phase {} which is not in the pipeline",
                unit.unit_id, unit.current_phase
            )));
        }
        if unit.status.is_terminal() {
            return Ok(unit);
        }
        if unit.status == UnitStatus::NotStarted {
            unit.transition(UnitStatus::InProgress)
                .map_err(OrchestratorError::Planning)?;
        }

        let mut gate_reentries = 0u32;

        loop {
            if *cancel.borrow() {
                unit.mark_failed(
                    FailureKind::Cancelled,
                    format!("cancelled before phase {}", unit.current_phase),
                );
                checkpoint(&unit)?;
                return Ok(unit);
            }

            let phase = unit.current_phase;
            let worker = registry.for_phase(phase)?;
            info!(unit_id = %unit.unit_id, %phase, "executing phase");

            let outcome = match execute_with_retry(worker.as_ref(), &unit, phase, retry_limit).await
            {
                Ok((outcome, retries)) => {
                    unit.retry_count += retries;
                    outcome
                }
                Err(err @ OrchestratorError::PermanentWorker { .. }) => {
                    unit.mark_failed(FailureKind::Permanent, err.to_string());
                    checkpoint(&unit)?;
                    return Ok(unit);
                }
                Err(err) => return Err(err),
            };

            if outcome.status == WorkerStatus::Failed {
                let reason = outcome
                    .failure_reason
                    .unwrap_or_else(|| "worker reported failure".to_string());
                unit.mark_failed(FailureKind::Permanent, reason);
                checkpoint(&unit)?;
                return Ok(unit);
            }

            self.record_artifacts(&mut unit, outcome.artifacts.clone());

            if phase == Phase::QualityAssurance {
                let report = gate.validate(&unit).await;
                if !report.passed {
                    gate_reentries += 1;
                    if gate_reentries > self.gate_reentry_limit {
                        unit.mark_failed(
                            FailureKind::Permanent,
                            format!(
                                "quality gate still failing after {} re-entries: {}",
                                self.gate_reentry_limit,
                                report.blocking_failures().join(", ")
                            ),
                        );
                        checkpoint(&unit)?;
                        return Ok(unit);
                    }
                    warn!(
                        unit_id = %unit.unit_id,
                        failing = ?report.blocking_failures(),
                        gate_reentries,
                        "quality gate failed; re-entering implementation"
                    );
                    unit.current_phase = Phase::Implementation;
                    checkpoint(&unit)?;
                    continue;
                }
            }

            if phase == Phase::Review
                && outcome
                    .artifacts
                    .iter()
                    .any(|a| a == CHANGES_REQUESTED_ARTIFACT)
            {
                info!(unit_id = %unit.unit_id, "reviewer requested changes; re-entering implementation");
                unit.current_phase = Phase::Implementation;
                checkpoint(&unit)?;
                continue;
            }

            match self.next_phase(phase) {
                Some(next) => {
                    unit.current_phase = next;
                    checkpoint(&unit)?;
                }
                None => {
                    unit.transition(UnitStatus::Succeeded)
                        .map_err(OrchestratorError::Planning)?;
                    checkpoint(&unit)?;
                    return Ok(unit);
                }
            }
        }
    }

    /// Fold worker artifacts into the unit record. A `branch:` artifact
    /// pins the unit's branch ref; everything is kept in
    /// `artifact_refs` verbatim.
    fn record_artifacts(&self, unit: &mut UnitRecord, artifacts: Vec<String>) {
        for artifact in artifacts {
            if let Some(branch) = artifact.strip_prefix(BRANCH_ARTIFACT_PREFIX) {
                unit.branch_ref = Some(branch.to_string());
            }
            if artifact != CHANGES_REQUESTED_ARTIFACT && !unit.artifact_refs.contains(&artifact) {
                unit.artifact_refs.push(artifact);
            }
        }
    }
}
