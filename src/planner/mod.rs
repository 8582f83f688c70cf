//! Conflict-aware batch planning over a prioritized backlog.
//!
//! The planner orders units by priority score, validates their
//! dependency graph, and greedily fills size-bounded batches. When a
//! unit conflicts with a batch member, the lower-priority member of the
//! first such pair per scope is deferred to the next batch, at most once
//! per unit; every later overlap on that scope, and any overlap with a
//! previously deferred unit, is accepted with a recorded conflict
//! warning so that conflicts delay scheduling but never block it. The
//! output batches partition the input exactly.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conflict::ConflictDetector;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::state::{Batch, ConflictWarning, UnitRecord};

/// Raw scoring inputs for one unit, each in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitScore {
    /// Expected impact of completing the unit.
    pub impact: f64,
    /// Estimated effort; weighted inversely (cheap work scores higher).
    pub effort: f64,
    /// How many other units depend on this one.
    pub dependency_fanout: f64,
    /// How well-specified the unit is.
    pub clarity: f64,
}

impl UnitScore {
    /// Weighted priority score: impact 40%, inverse effort 25%,
    /// dependency fan-out 20%, clarity 15%. Inputs are clamped to
    /// [0, 100] first, so the result is also in [0, 100].
    pub fn weighted(&self) -> f64 {
        let clamp = |v: f64| v.clamp(0.0, 100.0);
        0.40 * clamp(self.impact)
            + 0.25 * (100.0 - clamp(self.effort))
            + 0.20 * clamp(self.dependency_fanout)
            + 0.15 * clamp(self.clarity)
    }
}

/// Groups a backlog into ordered, bounded, conflict-aware batches.
pub struct BatchPlanner {
    batch_size: usize,
    detector: ConflictDetector,
}

impl BatchPlanner {
    /// Create a planner with the given batch size bound (≥ 1).
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            detector: ConflictDetector::new(),
        }
    }

    /// Plan batches covering every input unit exactly once.
    ///
    /// Fails when a unit references an unknown dependency or the
    /// dependency graph has a cycle.
    pub fn plan(&self, units: &[UnitRecord]) -> OrchestratorResult<Vec<Batch>> {
        if units.is_empty() {
            return Ok(Vec::new());
        }
        self.validate_dependencies(units)?;

        let by_id: BTreeMap<&str, &UnitRecord> =
            units.iter().map(|u| (u.unit_id.as_str(), u)).collect();

        // Priority order: score descending, unit id ascending on ties.
        let mut pending: Vec<&UnitRecord> = units.iter().collect();
        pending.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.unit_id.cmp(&b.unit_id))
        });

        let mut deferred_ever: HashSet<&str> = HashSet::new();
        let mut scheduled: HashSet<&str> = HashSet::new();
        let mut batches: Vec<Batch> = Vec::new();

        while !pending.is_empty() {
            let mut members: Vec<&UnitRecord> = Vec::new();
            let mut warnings: Vec<ConflictWarning> = Vec::new();
            let mut leftover: Vec<&UnitRecord> = Vec::new();
            // Scopes that already cost a deferral within this batch.
            let mut deferred_scopes: HashSet<String> = HashSet::new();

            for unit in pending.drain(..) {
                if members.len() >= self.batch_size
                    || !unit
                        .depends_on
                        .iter()
                        .all(|dep| scheduled.contains(dep.as_str()))
                {
                    leftover.push(unit);
                    continue;
                }

                let edges = self.conflicts_with(unit, &members);
                if edges.is_empty() {
                    members.push(unit);
                    continue;
                }

                let scope_already_deferred =
                    edges.iter().any(|w| deferred_scopes.contains(&w.scope));
                let partner_deferred_before = edges.iter().any(|w| {
                    let partner = if w.unit_a == unit.unit_id {
                        &w.unit_b
                    } else {
                        &w.unit_a
                    };
                    deferred_ever.contains(partner.as_str())
                });

                if !deferred_ever.contains(unit.unit_id.as_str())
                    && !scope_already_deferred
                    && !partner_deferred_before
                {
                    // Move the lower-priority member of the pair (this
                    // unit; members outrank it by construction) to the
                    // next batch.
                    deferred_ever.insert(unit.unit_id.as_str());
                    for edge in &edges {
                        deferred_scopes.insert(edge.scope.clone());
                    }
                    debug!(
                        unit_id = %unit.unit_id,
                        batch = batches.len(),
                        "deferring unit to the next batch due to scope conflict"
                    );
                    leftover.push(unit);
                } else {
                    // Deferring again would only carve out singleton
                    // batches; accept the overlap and record it.
                    warnings.extend(edges);
                    members.push(unit);
                }
            }

            if members.is_empty() {
                // Unreachable with a validated dependency graph; guard
                // against looping forever on a malformed backlog.
                return Err(OrchestratorError::Planning(format!(
                    "no schedulable unit among {} remaining",
                    leftover.len()
                )));
            }
            if members.len() == 1 && !leftover.is_empty() {
                warn!(
                    batch = batches.len(),
                    unit_id = %members[0].unit_id,
                    "conflicts forced a degenerate batch of one"
                );
            }

            for member in &members {
                scheduled.insert(member.unit_id.as_str());
            }
            let mut batch = Batch::new(
                batches.len(),
                members.iter().map(|u| u.unit_id.clone()).collect(),
            );
            batch.conflict_warnings = warnings;
            batches.push(batch);
            pending = leftover;
        }

        debug_assert_eq!(scheduled.len(), by_id.len());
        Ok(batches)
    }

    /// Conflict edges between `unit` and the current batch members,
    /// expressed as warnings.
    fn conflicts_with(&self, unit: &UnitRecord, members: &[&UnitRecord]) -> Vec<ConflictWarning> {
        let mut candidates: Vec<&UnitRecord> = members.to_vec();
        candidates.push(unit);
        self.detector
            .detect(&candidates)
            .into_iter()
            .filter(|edge| edge.involves(&unit.unit_id))
            .map(|edge| ConflictWarning {
                unit_a: edge.unit_a,
                unit_b: edge.unit_b,
                scope: edge.scopes.join(","),
            })
            .collect()
    }

    /// Reject unknown dependency references and dependency cycles.
    fn validate_dependencies(&self, units: &[UnitRecord]) -> OrchestratorResult<()> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for unit in units {
            let idx = graph.add_node(unit.unit_id.as_str());
            nodes.insert(unit.unit_id.as_str(), idx);
        }
        for unit in units {
            for dep in &unit.depends_on {
                let Some(&dep_idx) = nodes.get(dep.as_str()) else {
                    return Err(OrchestratorError::Planning(format!(
                        "unit {} depends on unknown unit {}",
                        unit.unit_id, dep
                    )));
                };
                graph.add_edge(dep_idx, nodes[unit.unit_id.as_str()], ());
            }
        }
        if is_cyclic_directed(&graph) {
            return Err(OrchestratorError::Planning(
                "dependency graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Phase;

    fn unit(id: &str, score: f64, labels: &[&str]) -> UnitRecord {
        UnitRecord::new(id, Phase::Planning)
            .with_priority_score(score)
            .with_labels(labels.iter().map(|s| s.to_string()).collect())
    }

    fn all_unit_ids(batches: &[Batch]) -> Vec<String> {
        let mut ids: Vec<String> = batches
            .iter()
            .flat_map(|b| b.unit_ids.iter().cloned())
            .collect();
        ids.sort();
        ids
    }

    #[test]
    fn test_weighted_score() {
        let score = UnitScore {
            impact: 100.0,
            effort: 0.0,
            dependency_fanout: 100.0,
            clarity: 100.0,
        };
        assert!((score.weighted() - 100.0).abs() < f64::EPSILON);

        let score = UnitScore {
            impact: 50.0,
            effort: 50.0,
            dependency_fanout: 50.0,
            clarity: 50.0,
        };
        assert!((score.weighted() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_score_clamps_inputs() {
        let score = UnitScore {
            impact: 250.0,
            effort: -10.0,
            dependency_fanout: 100.0,
            clarity: 100.0,
        };
        assert!((score.weighted() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_backlog_plans_no_batches() {
        let batches = BatchPlanner::new(4).plan(&[]).expect("plan");
        assert!(batches.is_empty());
    }

    #[test]
    fn test_plan_partitions_exactly() {
        let units: Vec<UnitRecord> = (0..9)
            .map(|i| unit(&format!("U-{}", i), 50.0, &[]))
            .collect();
        let batches = BatchPlanner::new(4).plan(&units).expect("plan");

        let mut expected: Vec<String> = units.iter().map(|u| u.unit_id.clone()).collect();
        expected.sort();
        assert_eq!(all_unit_ids(&batches), expected);
        assert!(batches.iter().all(|b| b.unit_ids.len() <= 4));
        assert_eq!(batches.len(), 3);
    }

    #[test]
    fn test_priority_order_determines_batch_order() {
        let units = vec![
            unit("U-low", 10.0, &[]),
            unit("U-high", 90.0, &[]),
            unit("U-mid", 50.0, &[]),
        ];
        let batches = BatchPlanner::new(2).plan(&units).expect("plan");
        assert_eq!(batches[0].unit_ids, vec!["U-high", "U-mid"]);
        assert_eq!(batches[1].unit_ids, vec!["U-low"]);
    }

    #[test]
    fn test_conflicting_pair_is_split_across_batches() {
        let units = vec![
            unit("U-1", 90.0, &["backend"]),
            unit("U-2", 80.0, &["backend"]),
            unit("U-3", 70.0, &["frontend"]),
        ];
        let batches = BatchPlanner::new(2).plan(&units).expect("plan");
        // U-2 conflicts with U-1 and is deferred; U-3 fills the slot.
        assert_eq!(batches[0].unit_ids, vec!["U-1", "U-3"]);
        assert_eq!(batches[1].unit_ids, vec!["U-2"]);
        assert!(batches[0].conflict_warnings.is_empty());
        assert!(batches[1].conflict_warnings.is_empty());
    }

    #[test]
    fn test_conflict_free_partition_is_found_when_one_exists() {
        let units = vec![
            unit("U-1", 90.0, &["backend"]),
            unit("U-2", 80.0, &["backend"]),
            unit("U-3", 70.0, &["frontend"]),
            unit("U-4", 60.0, &["frontend"]),
        ];
        let batches = BatchPlanner::new(2).plan(&units).expect("plan");
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert!(batch.conflict_warnings.is_empty());
        }
        assert_eq!(batches[0].unit_ids, vec!["U-1", "U-3"]);
        assert_eq!(batches[1].unit_ids, vec!["U-2", "U-4"]);
    }

    #[test]
    fn test_uniform_scope_backlog_splits_by_size_with_warnings() {
        // 7 units all tagged "backend" at batch size 5: neither a single
        // batch of 7 nor singleton batches around one full batch. The
        // backlog fills two batches and accepted overlaps are recorded.
        let units: Vec<UnitRecord> = (0..7)
            .map(|i| unit(&format!("U-{}", i), 90.0 - i as f64, &["backend"]))
            .collect();
        let batches = BatchPlanner::new(5).plan(&units).expect("plan");

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].unit_ids.len(), 5);
        assert_eq!(batches[1].unit_ids.len(), 2);
        let mut expected: Vec<String> = units.iter().map(|u| u.unit_id.clone()).collect();
        expected.sort();
        assert_eq!(all_unit_ids(&batches), expected);
        // Accepted overlaps carry warnings in both batches.
        assert!(batches.iter().all(|b| !b.conflict_warnings.is_empty()));
    }

    #[test]
    fn test_degenerate_batch_of_one_is_valid() {
        let units = vec![
            unit("U-1", 90.0, &["backend"]),
            unit("U-2", 80.0, &["backend"]),
        ];
        let batches = BatchPlanner::new(5).plan(&units).expect("plan");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].unit_ids, vec!["U-1"]);
        assert_eq!(batches[1].unit_ids, vec!["U-2"]);
    }

    #[test]
    fn test_dependent_unit_lands_in_later_batch() {
        let units = vec![
            unit("U-1", 50.0, &[]),
            unit("U-2", 90.0, &[]).with_depends_on(vec!["U-1".to_string()]),
        ];
        let batches = BatchPlanner::new(4).plan(&units).expect("plan");
        assert_eq!(batches[0].unit_ids, vec!["U-1"]);
        assert_eq!(batches[1].unit_ids, vec!["U-2"]);
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let units = vec![unit("U-1", 50.0, &[]).with_depends_on(vec!["U-404".to_string()])];
        let err = BatchPlanner::new(4).plan(&units).expect_err("unknown dep");
        assert!(matches!(err, OrchestratorError::Planning(_)));
    }

    #[test]
    fn test_dependency_cycle_is_rejected() {
        let units = vec![
            unit("U-1", 50.0, &[]).with_depends_on(vec!["U-2".to_string()]),
            unit("U-2", 50.0, &[]).with_depends_on(vec!["U-1".to_string()]),
        ];
        let err = BatchPlanner::new(4).plan(&units).expect_err("cycle");
        assert!(matches!(err, OrchestratorError::Planning(_)));
    }

    #[test]
    fn test_batch_numbers_are_sequential() {
        let units: Vec<UnitRecord> = (0..6)
            .map(|i| unit(&format!("U-{}", i), 50.0, &[]))
            .collect();
        let batches = BatchPlanner::new(2).plan(&units).expect("plan");
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.batch_number, i);
        }
    }
}
