//! Parallel batch execution.
//!
//! Runs the units of one batch concurrently under a semaphore bound,
//! draining completions in whatever order they finish. Units are
//! isolated: a failure or timeout of one never aborts its siblings.
//! Batches are strictly ordered; batch N+1 is not started until every
//! unit of batch N is terminal, and state is persisted once per
//! completed batch.
//!
//! Cancellation is cooperative. Once the cancel signal fires, no new
//! unit is launched and no in-flight unit starts another phase; the
//! currently running worker invocation is allowed to complete, after
//! which the unit is marked `Cancelled`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::{OrchestratorConfig, CONCURRENCY_HARD_CAP};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::phase::PhaseStateMachine;
use crate::quality::QualityGateValidator;
use crate::state::{
    BatchStatus, FailureKind, StateStore, UnitRecord, UnitStatus, WorkflowState,
};
use crate::worker::WorkerRegistry;

/// Outcome summary for one executed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub batch_number: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives planned batches to completion with bounded concurrency.
pub struct ParallelExecutionCoordinator {
    machine: Arc<PhaseStateMachine>,
    registry: WorkerRegistry,
    gate: Arc<QualityGateValidator>,
    retry_limit: u32,
    unit_timeout: Duration,
    batch_timeout: Duration,
    max_concurrency: usize,
}

impl ParallelExecutionCoordinator {
    pub fn new(
        machine: Arc<PhaseStateMachine>,
        registry: WorkerRegistry,
        gate: Arc<QualityGateValidator>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            machine,
            registry,
            gate,
            retry_limit: config.retry_limit,
            unit_timeout: config.timeouts.unit_timeout(),
            batch_timeout: config.timeouts.batch_timeout(),
            max_concurrency: config.max_concurrency,
        }
    }

    /// Concurrency bound for a batch of the given size.
    fn effective_concurrency(&self, batch_len: usize) -> usize {
        self.max_concurrency
            .min(batch_len.max(1))
            .min(CONCURRENCY_HARD_CAP)
    }

    /// Execute every remaining batch in order, starting at the state's
    /// batch cursor. Stops launching batches once cancellation fires
    /// and marks all never-launched units `Cancelled`.
    pub async fn run_from(
        &self,
        state: &mut WorkflowState,
        store: &StateStore,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<Vec<BatchResult>> {
        let mut results = Vec::new();
        for index in state.current_batch_index..state.batches.len() {
            if *cancel.borrow() {
                warn!(batch_index = index, "cancelled; skipping remaining batches");
                self.cancel_remaining(state, index);
                store.save(state)?;
                break;
            }
            results.push(self.run_batch(state, store, index, cancel.clone()).await?);
        }
        Ok(results)
    }

    /// Execute one batch to completion and persist the updated state.
    ///
    /// Every member unit reaches a terminal status before this returns;
    /// state is saved exactly once, after the whole batch has drained.
    pub async fn run_batch(
        &self,
        state: &mut WorkflowState,
        store: &StateStore,
        batch_index: usize,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<BatchResult> {
        let batch = state
            .batches
            .get(batch_index)
            .ok_or_else(|| {
                OrchestratorError::Planning(format!(
                    "batch index {} out of range for {} planned batches",
                    batch_index,
                    state.batches.len()
                ))
            })?
            .clone();
        state.batches[batch_index].status = BatchStatus::Running;

        let limit = self.effective_concurrency(batch.unit_ids.len());
        info!(
            batch_number = batch.batch_number,
            units = batch.unit_ids.len(),
            concurrency = limit,
            "starting batch"
        );

        // Snapshot the member records up front so a panicked task can
        // still be resolved to a Failed record.
        let mut originals: HashMap<String, UnitRecord> = HashMap::new();
        for unit_id in &batch.unit_ids {
            let record = state.units.get(unit_id).cloned().ok_or_else(|| {
                OrchestratorError::StateCorruption {
                    run_id: state.run_id.clone(),
                    reason: format!(
                        "batch {} references unit {} missing from the state document",
                        batch.batch_number, unit_id
                    ),
                }
            })?;
            originals.insert(unit_id.clone(), record);
        }

        let permits = Arc::new(Semaphore::new(limit));
        let mut tasks = FuturesUnordered::new();
        let mut aborts: Vec<(String, tokio::task::AbortHandle)> = Vec::new();

        for unit_id in &batch.unit_ids {
            let unit = originals[unit_id].clone();
            if unit.status.is_terminal() {
                // Already resolved in an earlier, interrupted run.
                continue;
            }

            let machine = self.machine.clone();
            let registry = self.registry.clone();
            let gate = self.gate.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            let retry_limit = self.retry_limit;
            let unit_timeout = self.unit_timeout;
            let unit_id = unit_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .expect("batch semaphore closed");

                let mut fallback = unit.clone();
                if *cancel.borrow() {
                    fallback.mark_failed(FailureKind::Cancelled, "cancelled before launch");
                    return Ok(fallback);
                }

                let run = machine.run_unit(unit, &registry, &gate, retry_limit, cancel, |_| Ok(()));
                match timeout(unit_timeout, run).await {
                    Ok(Ok(done)) => Ok(done),
                    Ok(Err(err)) => Err(err),
                    Err(_) => {
                        fallback.mark_failed(
                            FailureKind::Timeout,
                            format!("timed out after {}s", unit_timeout.as_secs()),
                        );
                        Ok(fallback)
                    }
                }
            });
            aborts.push((unit_id.clone(), handle.abort_handle()));
            tasks.push(async move { (unit_id, handle.await) });
        }

        let drain = async {
            while let Some((unit_id, joined)) = tasks.next().await {
                match joined {
                    Ok(Ok(record)) => {
                        info!(
                            unit_id = %unit_id,
                            status = ?record.status,
                            "unit finished"
                        );
                        state.upsert_unit(record);
                    }
                    Ok(Err(err)) => {
                        // Infrastructure errors fail the unit, not the batch.
                        error!(unit_id = %unit_id, error = %err, "unit errored");
                        let mut record = originals[&unit_id].clone();
                        record.mark_failed(FailureKind::Permanent, err.to_string());
                        state.upsert_unit(record);
                    }
                    Err(join_err) => {
                        // A panicked worker task must not take the batch down.
                        error!(unit_id = %unit_id, error = %join_err, "worker task panicked");
                        let mut record = originals[&unit_id].clone();
                        record.mark_failed(
                            FailureKind::Permanent,
                            format!("worker task panicked: {}", join_err),
                        );
                        state.upsert_unit(record);
                    }
                }
            }
        };
        let drained = timeout(self.batch_timeout, drain).await;
        if drained.is_err() {
            warn!(
                batch_number = batch.batch_number,
                timeout_secs = self.batch_timeout.as_secs(),
                "batch timed out; aborting units still running"
            );
            for (unit_id, abort) in &aborts {
                if !state.units[unit_id].status.is_terminal() {
                    abort.abort();
                    let mut record = originals[unit_id].clone();
                    record.mark_failed(
                        FailureKind::Timeout,
                        format!("batch timed out after {}s", self.batch_timeout.as_secs()),
                    );
                    state.upsert_unit(record);
                }
            }
        }

        let result = self.summarize(state, batch_index);
        state.batches[batch_index].status = if result.all_succeeded() {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };
        if batch_index + 1 > state.current_batch_index {
            state.current_batch_index = batch_index + 1;
        }
        store.save(state)?;

        info!(
            batch_number = result.batch_number,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "batch finished"
        );
        Ok(result)
    }

    fn summarize(&self, state: &WorkflowState, batch_index: usize) -> BatchResult {
        let batch = &state.batches[batch_index];
        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for unit_id in &batch.unit_ids {
            match state.units[unit_id].status {
                UnitStatus::Succeeded => succeeded.push(unit_id.clone()),
                _ => failed.push(unit_id.clone()),
            }
        }
        BatchResult {
            batch_number: batch.batch_number,
            succeeded,
            failed,
        }
    }

    /// Mark every non-terminal unit of the remaining batches `Cancelled`.
    fn cancel_remaining(&self, state: &mut WorkflowState, from_index: usize) {
        for index in from_index..state.batches.len() {
            let unit_ids = state.batches[index].unit_ids.clone();
            let mut any_cancelled = false;
            for unit_id in unit_ids {
                if let Some(unit) = state.units.get_mut(&unit_id) {
                    if !unit.status.is_terminal() {
                        unit.mark_failed(FailureKind::Cancelled, "run cancelled before launch");
                        any_cancelled = true;
                    }
                }
            }
            if any_cancelled {
                state.batches[index].status = BatchStatus::Failed;
            }
        }
    }
}
