//! Worker that delegates phase execution to an external command.
//!
//! The command is invoked once per phase as `<program> [args..] <phase>
//! <unit-id>`, with `CONDUCTOR_UNIT_ID` and `CONDUCTOR_PHASE` in the
//! environment. Exit code zero is success; stdout lines of the form
//! `artifact:<value>` are collected as artifact references (so a script
//! can report `artifact:branch:feature/x` to pin the unit's branch).
//! A non-zero exit is a definitive worker failure, while failing to
//! launch the command at all is transient and retried.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::state::{Phase, UnitRecord};
use crate::worker::{Worker, WorkerOutcome};

const ARTIFACT_PREFIX: &str = "artifact:";

/// Shells out to a configured command for every phase.
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Sets fixed arguments passed before the phase and unit id.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn execute(&self, unit: UnitRecord, phase: Phase) -> OrchestratorResult<WorkerOutcome> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(phase.as_str())
            .arg(&unit.unit_id)
            .env("CONDUCTOR_UNIT_ID", &unit.unit_id)
            .env("CONDUCTOR_PHASE", phase.as_str())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| OrchestratorError::TransientWorker {
                unit_id: unit.unit_id.clone(),
                reason: format!("failed to launch {}: {}", self.program, e),
            })?;

        debug!(
            unit_id = %unit.unit_id,
            %phase,
            code = ?output.status.code(),
            "worker command finished"
        );

        if output.status.success() {
            let artifacts = String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| line.trim().strip_prefix(ARTIFACT_PREFIX))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .collect();
            Ok(WorkerOutcome::succeeded(artifacts))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = if stderr.trim().is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr.trim().to_string()
            };
            Ok(WorkerOutcome::failed(reason))
        }
    }
}
