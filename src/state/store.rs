//! Durable persistence for [`WorkflowState`] documents.
//!
//! One JSON document per run, written atomically: the document is first
//! written to a temp file, fsynced, then renamed over the canonical path.
//! After a crash a reader sees either the previous or the new document,
//! never a partially written one. Concurrent runs use distinct run ids
//! and therefore distinct files; no locking beyond the single-writer
//! assumption is needed.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::state::WorkflowState;

const ARCHIVE_DIR_NAME: &str = "archive";

/// Filesystem-backed store for run state documents.
#[derive(Debug, Clone)]
pub struct StateStore {
    root_dir: PathBuf,
}

impl StateStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(root_dir: impl Into<PathBuf>) -> OrchestratorResult<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    /// Atomically persist a state document, refreshing its timestamp.
    pub fn save(&self, state: &mut WorkflowState) -> OrchestratorResult<()> {
        if state.run_id.trim().is_empty() {
            return Err(OrchestratorError::StateCorruption {
                run_id: state.run_id.clone(),
                reason: "runId is empty".to_string(),
            });
        }
        state.touch();

        let json = serde_json::to_string_pretty(state)?;
        let canonical = self.state_path(&state.run_id);
        let temp = self.root_dir.join(format!("{}.json.tmp", state.run_id));

        let mut file = fs::File::create(&temp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp, &canonical)?;

        debug!(run_id = %state.run_id, path = %canonical.display(), "state saved");
        Ok(())
    }

    /// Load a state document. Returns `Ok(None)` when no document exists
    /// for the run id; a document that fails schema validation is a
    /// [`OrchestratorError::StateCorruption`], never silently discarded.
    pub fn load(&self, run_id: &str) -> OrchestratorResult<Option<WorkflowState>> {
        self.load_at(&self.state_path(run_id), run_id)
    }

    /// Load the archived document of a completed run.
    pub fn load_archived(&self, run_id: &str) -> OrchestratorResult<Option<WorkflowState>> {
        let path = self
            .root_dir
            .join(ARCHIVE_DIR_NAME)
            .join(format!("{}.json", run_id));
        self.load_at(&path, run_id)
    }

    fn load_at(&self, path: &Path, run_id: &str) -> OrchestratorResult<Option<WorkflowState>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(OrchestratorError::Io(err)),
        };

        let state: WorkflowState =
            serde_json::from_str(&content).map_err(|e| OrchestratorError::StateCorruption {
                run_id: run_id.to_string(),
                reason: format!("unparseable document: {}", e),
            })?;

        if state.run_id != run_id {
            return Err(OrchestratorError::StateCorruption {
                run_id: run_id.to_string(),
                reason: format!("document claims runId {}", state.run_id),
            });
        }
        state
            .validate()
            .map_err(|reason| OrchestratorError::StateCorruption {
                run_id: run_id.to_string(),
                reason,
            })?;

        Ok(Some(state))
    }

    /// Move a run's document into the archive directory. Used on terminal
    /// success; failed runs stay in place for forensic resume.
    pub fn archive(&self, run_id: &str) -> OrchestratorResult<()> {
        let source = self.state_path(run_id);
        if !source.exists() {
            warn!(run_id, "archive requested for a run with no state document");
            return Ok(());
        }
        let archive_dir = self.root_dir.join(ARCHIVE_DIR_NAME);
        fs::create_dir_all(&archive_dir)?;
        let dest = archive_dir.join(format!("{}.json", run_id));
        fs::rename(&source, &dest)?;
        debug!(run_id, path = %dest.display(), "state archived");
        Ok(())
    }

    /// The store's root directory.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn state_path(&self, run_id: &str) -> PathBuf {
        self.root_dir.join(format!("{}.json", run_id))
    }
}
