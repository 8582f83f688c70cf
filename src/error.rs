//! Error taxonomy for the orchestrator.
//!
//! Every failure path in the engine maps onto one of the variants here so
//! that the retry policy, the resumption analyzer, and the CLI exit-code
//! mapping can dispatch on error kind rather than on message text.

use thiserror::Error;

/// Errors produced by orchestration operations.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// A worker failed in a way that is worth retrying (flaky test,
    /// transient network failure). Escalated to `PermanentWorker` once
    /// the retry bound is exhausted.
    #[error("transient worker failure for unit {unit_id}: {reason}")]
    TransientWorker { unit_id: String, reason: String },

    /// A worker failed in a way retries cannot fix (invalid unit
    /// definition, unrecoverable build breakage).
    #[error("permanent worker failure for unit {unit_id}: {reason}")]
    PermanentWorker { unit_id: String, reason: String },

    /// The environment probe could not reach the external VCS or
    /// tracker. Callers must fail closed: this never means "not found".
    #[error("environment query failed: {0}")]
    EnvironmentQuery(String),

    /// A loaded state document failed schema validation. Halts the run;
    /// discarding it would duplicate work that already exists externally.
    #[error("state document for run {run_id} is corrupt: {reason}")]
    StateCorruption { run_id: String, reason: String },

    /// The resumption decision table had no matching row for the
    /// observed environment. Requires operator attention (exit code 2).
    #[error("ambiguous resumption for unit {unit_id}: {detail}")]
    AmbiguousResumption { unit_id: String, detail: String },

    /// The planner rejected the backlog (e.g. a dependency cycle).
    #[error("planning failed: {0}")]
    Planning(String),

    /// No worker is registered for a phase the state machine reached.
    #[error("no worker registered for phase {phase}")]
    NoWorkerForPhase { phase: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse category used by the retry policy and batch accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retryable up to the configured bound.
    Transient,
    /// Not retryable; counts against the run.
    Permanent,
    /// Probe failure; the caller cannot determine external state.
    Environment,
    /// Corrupt or ambiguous persisted state; halts or escalates.
    Fatal,
}

impl OrchestratorError {
    /// Classify this error for retry and accounting decisions.
    pub fn classify(&self) -> ErrorCategory {
        match self {
            OrchestratorError::TransientWorker { .. } => ErrorCategory::Transient,
            OrchestratorError::PermanentWorker { .. }
            | OrchestratorError::NoWorkerForPhase { .. } => ErrorCategory::Permanent,
            OrchestratorError::EnvironmentQuery(_) => ErrorCategory::Environment,
            OrchestratorError::StateCorruption { .. }
            | OrchestratorError::AmbiguousResumption { .. }
            | OrchestratorError::Planning(_)
            | OrchestratorError::Io(_)
            | OrchestratorError::Json(_)
            | OrchestratorError::Config(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether the retry wrapper may re-attempt the failed operation.
    pub fn is_retryable(&self) -> bool {
        self.classify() == ErrorCategory::Transient
    }

    /// Escalate a transient worker failure to a permanent one, retaining
    /// the original reason. Non-transient errors pass through unchanged.
    pub fn escalate(self, attempts: u32) -> Self {
        match self {
            OrchestratorError::TransientWorker { unit_id, reason } => {
                OrchestratorError::PermanentWorker {
                    unit_id,
                    reason: format!("still failing after {} retries: {}", attempts, reason),
                }
            }
            other => other,
        }
    }
}

/// Result type for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> OrchestratorError {
        OrchestratorError::TransientWorker {
            unit_id: "U-1".to_string(),
            reason: "flaky test".to_string(),
        }
    }

    #[test]
    fn test_transient_is_retryable() {
        assert!(transient().is_retryable());
        assert_eq!(transient().classify(), ErrorCategory::Transient);
    }

    #[test]
    fn test_permanent_is_not_retryable() {
        let err = OrchestratorError::PermanentWorker {
            unit_id: "U-1".to_string(),
            reason: "bad definition".to_string(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_escalate_converts_transient_to_permanent() {
        let escalated = transient().escalate(2);
        match escalated {
            OrchestratorError::PermanentWorker { unit_id, reason } => {
                assert_eq!(unit_id, "U-1");
                assert!(reason.contains("flaky test"));
                assert!(reason.contains('2'));
            }
            other => panic!("expected PermanentWorker, got {:?}", other),
        }
    }

    #[test]
    fn test_escalate_passes_through_non_transient() {
        let err = OrchestratorError::EnvironmentQuery("offline".to_string());
        assert_eq!(err.escalate(2).classify(), ErrorCategory::Environment);
    }

}
