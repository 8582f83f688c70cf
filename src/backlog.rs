//! Backlog input for batch runs.
//!
//! A backlog is a JSON array of scored work items. Items carry the raw
//! scoring inputs; the weighted priority score is computed here so the
//! planner only ever sees final scores.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::OrchestratorResult;
use crate::planner::UnitScore;
use crate::state::{Phase, UnitRecord};

/// One scored backlog item as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacklogItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub score: UnitScore,
}

impl BacklogItem {
    /// Whether the item matches a label filter. An empty filter matches
    /// everything; otherwise any shared label (case-insensitive) matches.
    pub fn matches_filter(&self, filter: &[String]) -> bool {
        if filter.is_empty() {
            return true;
        }
        self.labels.iter().any(|label| {
            filter
                .iter()
                .any(|wanted| label.trim().eq_ignore_ascii_case(wanted.trim()))
        })
    }

    /// Convert the item into a unit record at the start of the pipeline.
    pub fn into_unit(self, first_phase: Phase) -> UnitRecord {
        let score = self.score.weighted();
        UnitRecord::new(self.id, first_phase)
            .with_title(self.title)
            .with_labels(self.labels)
            .with_depends_on(self.depends_on)
            .with_priority_score(score)
    }
}

/// Load a backlog file (JSON array of items).
pub fn load_backlog(path: &Path) -> OrchestratorResult<Vec<BacklogItem>> {
    let raw = std::fs::read_to_string(path)?;
    let items: Vec<BacklogItem> = serde_json::from_str(&raw)?;
    Ok(items)
}
