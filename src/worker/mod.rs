//! The worker seam.
//!
//! Workers perform the actual content of a phase (code generation, test
//! execution, review monitoring); the orchestrator never inspects how.
//! Each worker receives an immutable snapshot of the unit and the phase
//! name and communicates back only through its return value. Concrete
//! workers are selected by a registry keyed on phase, not by matching on
//! free text.

pub mod command;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::state::{Phase, UnitRecord};

pub use command::CommandWorker;

/// Terminal status a worker reports for one phase execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Succeeded,
    Failed,
}

/// What a worker hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub status: WorkerStatus,
    /// External artifact references produced by the phase (branch names,
    /// PR numbers, report paths).
    pub artifacts: Vec<String>,
    /// Populated when `status` is `Failed`.
    pub failure_reason: Option<String>,
}

impl WorkerOutcome {
    pub fn succeeded(artifacts: Vec<String>) -> Self {
        Self {
            status: WorkerStatus::Succeeded,
            artifacts,
            failure_reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: WorkerStatus::Failed,
            artifacts: Vec::new(),
            failure_reason: Some(reason.into()),
        }
    }
}

/// A phase executor.
///
/// A returned `Ok(WorkerOutcome)` is a definitive verdict and is never
/// retried; transient infrastructure trouble is reported as
/// `Err(OrchestratorError::TransientWorker { .. })` and retried up to
/// the configured bound.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, unit: UnitRecord, phase: Phase) -> OrchestratorResult<WorkerOutcome>;
}

impl std::fmt::Debug for dyn Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Worker")
    }
}

/// Phase-keyed worker lookup.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<Phase, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register the worker for a phase, replacing any previous one.
    pub fn register(mut self, phase: Phase, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(phase, worker);
        self
    }

    /// Register one worker for every phase in the pipeline.
    pub fn register_all(mut self, phases: &[Phase], worker: Arc<dyn Worker>) -> Self {
        for phase in phases {
            self.workers.insert(*phase, worker.clone());
        }
        self
    }

    /// Look up the worker for a phase.
    pub fn for_phase(&self, phase: Phase) -> OrchestratorResult<Arc<dyn Worker>> {
        self.workers
            .get(&phase)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoWorkerForPhase {
                phase: phase.to_string(),
            })
    }
}

/// Run a worker with the transient-retry policy.
///
/// Transient failures are retried up to `retry_limit` times; once the
/// bound is exhausted the error escalates to a permanent worker failure.
/// Returns the outcome together with the number of retries consumed.
pub async fn execute_with_retry(
    worker: &dyn Worker,
    unit: &UnitRecord,
    phase: Phase,
    retry_limit: u32,
) -> OrchestratorResult<(WorkerOutcome, u32)> {
    let mut retries = 0;
    loop {
        match worker.execute(unit.clone(), phase).await {
            Ok(outcome) => return Ok((outcome, retries)),
            Err(err) if err.is_retryable() && retries < retry_limit => {
                retries += 1;
                debug!(
                    unit_id = %unit.unit_id,
                    %phase,
                    retries,
                    retry_limit,
                    "retrying transient worker failure"
                );
            }
            Err(err) => return Err(err.escalate(retries)),
        }
    }
}
