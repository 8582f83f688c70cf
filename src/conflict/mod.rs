//! Heuristic conflict detection between candidate units.
//!
//! Two units conflict when their scope labels overlap: both touching
//! "backend" probably means both mutating the backend tree. This is an
//! estimate derived from free-text labels, not proof of overlap; the
//! planner uses it to defer, never to reject, and each edge carries a
//! confidence level to make the heuristic nature explicit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::UnitRecord;

/// How confident the detector is that the pair really overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// A single shared scope label.
    Medium,
    /// Multiple shared scope labels.
    High,
}

/// A pair of units flagged as likely to mutate overlapping resources.
///
/// `unit_a` is always lexically smaller than `unit_b`, and edges are
/// reported in ascending `(unit_a, unit_b)` order, so output is
/// reproducible for a given input set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEdge {
    pub unit_a: String,
    pub unit_b: String,
    /// Shared scope labels, sorted.
    pub scopes: Vec<String>,
    pub confidence: Confidence,
}

impl ConflictEdge {
    /// Whether this edge touches the given unit.
    pub fn involves(&self, unit_id: &str) -> bool {
        self.unit_a == unit_id || self.unit_b == unit_id
    }
}

/// Scope-label based conflict detector.
#[derive(Debug, Default, Clone)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Detect conflicts among the candidate units.
    ///
    /// Labels are normalized (trimmed, lowercased) before grouping; any
    /// label shared by two or more units produces pairwise edges for
    /// every unit under it.
    pub fn detect(&self, units: &[&UnitRecord]) -> Vec<ConflictEdge> {
        // tag -> sorted unit ids carrying it
        let mut by_tag: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for unit in units {
            for label in &unit.labels {
                let tag = normalize_label(label);
                if tag.is_empty() {
                    continue;
                }
                let members = by_tag.entry(tag).or_default();
                if !members.contains(&unit.unit_id.as_str()) {
                    members.push(unit.unit_id.as_str());
                }
            }
        }

        // (a, b) -> shared scopes; BTreeMap gives ascending pair order.
        let mut pairs: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for (tag, mut members) in by_tag {
            if members.len() < 2 {
                continue;
            }
            members.sort_unstable();
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    pairs
                        .entry((members[i].to_string(), members[j].to_string()))
                        .or_default()
                        .push(tag.clone());
                }
            }
        }

        pairs
            .into_iter()
            .map(|((unit_a, unit_b), mut scopes)| {
                scopes.sort_unstable();
                scopes.dedup();
                let confidence = if scopes.len() > 1 {
                    Confidence::High
                } else {
                    Confidence::Medium
                };
                ConflictEdge {
                    unit_a,
                    unit_b,
                    scopes,
                    confidence,
                }
            })
            .collect()
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;

    fn unit(id: &str, labels: &[&str]) -> UnitRecord {
        UnitRecord::new(id, Phase::Planning)
            .with_labels(labels.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_disjoint_labels_produce_no_edges() {
        let a = unit("U-1", &["backend"]);
        let b = unit("U-2", &["frontend"]);
        let edges = ConflictDetector::new().detect(&[&a, &b]);
        assert!(edges.is_empty());
    }

    #[test]
    fn test_shared_label_produces_pairwise_edges() {
        let a = unit("U-1", &["backend"]);
        let b = unit("U-2", &["backend"]);
        let c = unit("U-3", &["backend"]);
        let edges = ConflictDetector::new().detect(&[&a, &b, &c]);

        let pairs: Vec<(&str, &str)> = edges
            .iter()
            .map(|e| (e.unit_a.as_str(), e.unit_b.as_str()))
            .collect();
        assert_eq!(pairs, vec![("U-1", "U-2"), ("U-1", "U-3"), ("U-2", "U-3")]);
    }

    #[test]
    fn test_edges_are_reported_in_ascending_order() {
        // Input order must not affect output order.
        let a = unit("U-9", &["database"]);
        let b = unit("U-2", &["database"]);
        let c = unit("U-5", &["database"]);
        let edges = ConflictDetector::new().detect(&[&a, &b, &c]);

        let pairs: Vec<(&str, &str)> = edges
            .iter()
            .map(|e| (e.unit_a.as_str(), e.unit_b.as_str()))
            .collect();
        assert_eq!(pairs, vec![("U-2", "U-5"), ("U-2", "U-9"), ("U-5", "U-9")]);
    }

    #[test]
    fn test_labels_are_normalized_before_grouping() {
        let a = unit("U-1", &["Backend "]);
        let b = unit("U-2", &["backend"]);
        let edges = ConflictDetector::new().detect(&[&a, &b]);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].scopes, vec!["backend"]);
    }

    #[test]
    fn test_multiple_shared_scopes_raise_confidence() {
        let a = unit("U-1", &["backend", "database"]);
        let b = unit("U-2", &["backend", "database"]);
        let edges = ConflictDetector::new().detect(&[&a, &b]);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].confidence, Confidence::High);
        assert_eq!(edges[0].scopes, vec!["backend", "database"]);
    }

    #[test]
    fn test_single_shared_scope_is_medium_confidence() {
        let a = unit("U-1", &["backend", "auth"]);
        let b = unit("U-2", &["backend", "billing"]);
        let edges = ConflictDetector::new().detect(&[&a, &b]);
        assert_eq!(edges[0].confidence, Confidence::Medium);
    }

    #[test]
    fn test_duplicate_labels_on_one_unit_do_not_self_conflict() {
        let a = unit("U-1", &["backend", "backend"]);
        let edges = ConflictDetector::new().detect(&[&a]);
        assert!(edges.is_empty());
    }

    #[test]
    fn test_empty_input() {
        let edges = ConflictDetector::new().detect(&[]);
        assert!(edges.is_empty());
    }
}
