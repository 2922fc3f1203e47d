use bcdi_registry::{RunRecord, RunStatus};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;
use tracing::debug;

use crate::criterion::SortingCriterion;

/// Errors raised while ranking runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    /// Criterion name outside the recognized vocabulary.
    #[error("unknown sorting criterion '{0}'")]
    UnknownCriterion(String),

    /// No completed run carries the requested metric.
    #[error("no completed run carries the '{criterion}' metric")]
    NoEligibleRuns {
        /// Criterion that found nothing to rank.
        criterion: SortingCriterion,
    },

    /// Isosurface fraction outside (0, 1).
    #[error("isosurface must be within (0, 1), got {0}")]
    InvalidIsosurface(f64),

    /// The isosurface threshold left no voxel in the support.
    #[error("support is empty at the requested isosurface")]
    EmptySupport,
}

/// One ranked run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    /// Run index.
    pub run_index: u32,
    /// Metric value under the ranking criterion.
    pub value: f64,
}

/// Runs ordered best-first under a criterion. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedList {
    /// Criterion the entries are ordered by.
    pub criterion: SortingCriterion,
    /// Entries, best (lowest value) first.
    pub entries: Vec<RankedEntry>,
}

impl RankedList {
    /// Number of ranked runs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was ranked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run indices in rank order.
    pub fn run_indices(&self) -> Vec<u32> {
        self.entries.iter().map(|entry| entry.run_index).collect()
    }
}

/// Rank completed runs by a criterion, ascending value, best first.
///
/// Only completed runs carrying the criterion's metric participate; a
/// completed run missing it is skipped, not an error. Ties break toward the
/// lower run index so the ranking is deterministic. Non-finite metric values
/// are treated as missing.
pub fn rank(
    records: &[RunRecord],
    criterion: SortingCriterion,
) -> Result<RankedList, ScoringError> {
    let key = criterion.as_str();
    let mut entries: Vec<RankedEntry> = records
        .iter()
        .filter(|record| record.status == RunStatus::Completed)
        .filter_map(|record| {
            record
                .metrics
                .get(key)
                .copied()
                .filter(|value| value.is_finite())
                .map(|value| RankedEntry {
                    run_index: record.index,
                    value,
                })
        })
        .collect();

    if entries.is_empty() {
        return Err(ScoringError::NoEligibleRuns { criterion });
    }

    entries.sort_by(|a, b| {
        a.value
            .partial_cmp(&b.value)
            .unwrap_or(Ordering::Equal)
            .then(a.run_index.cmp(&b.run_index))
    });
    debug!(
        %criterion,
        ranked = entries.len(),
        best = entries[0].run_index,
        "ranked completed runs"
    );

    Ok(RankedList { criterion, entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn completed(index: u32, metrics: &[(&str, f64)]) -> RunRecord {
        RunRecord {
            index,
            status: RunStatus::Completed,
            artifact: Some(format!("run_{index:04}.cxi").into()),
            metrics: metrics
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn failed(index: u32) -> RunRecord {
        RunRecord {
            index,
            status: RunStatus::Failed,
            artifact: None,
            metrics: BTreeMap::new(),
            error: Some("diverged".to_string()),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn ranks_ascending_and_skips_runs_without_the_metric() {
        // Five runs, llk present on 0, 2 and 4 only; 1 failed, 3 has no llk.
        let records = vec![
            completed(0, &[("llk", -120.0)]),
            failed(1),
            completed(2, &[("llk", -95.0)]),
            completed(3, &[("sharpness", 4.0)]),
            completed(4, &[("llk", -140.0)]),
        ];

        let ranked = rank(&records, SortingCriterion::Llk).expect("rank");
        assert_eq!(ranked.run_indices(), vec![4, 0, 2]);
    }

    #[test]
    fn ties_break_toward_the_lower_run_index() {
        let records = vec![
            completed(3, &[("std", 0.5)]),
            completed(1, &[("std", 0.5)]),
            completed(2, &[("std", 0.2)]),
        ];

        let ranked = rank(&records, SortingCriterion::Std).expect("rank");
        assert_eq!(ranked.run_indices(), vec![2, 1, 3]);
    }

    #[test]
    fn empty_participation_set_is_an_error() {
        let records = vec![failed(0), completed(1, &[("llk", -10.0)])];
        let err = rank(&records, SortingCriterion::Sharpness).unwrap_err();
        assert_eq!(
            err,
            ScoringError::NoEligibleRuns {
                criterion: SortingCriterion::Sharpness
            }
        );
    }

    #[test]
    fn non_finite_values_are_treated_as_missing() {
        let records = vec![
            completed(0, &[("llk", f64::NAN)]),
            completed(1, &[("llk", -5.0)]),
        ];
        let ranked = rank(&records, SortingCriterion::Llk).expect("rank");
        assert_eq!(ranked.run_indices(), vec![1]);
    }
}
