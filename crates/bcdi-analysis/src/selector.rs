use bcdi_registry::{RunRecord, RunStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::scorer::RankedList;

/// Errors raised by explicit candidate selection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SelectionError {
    /// A requested run index was never registered.
    #[error("run {0} does not exist")]
    UnknownRun(u32),

    /// A requested run exists but did not complete.
    #[error("run {index} is {status}, only completed runs can be selected")]
    NotCompleted {
        /// Offending run index.
        index: u32,
        /// Its actual status.
        status: RunStatus,
    },
}

/// Ordered run indices chosen for mode decomposition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    /// Run indices; top-N selection preserves rank order, explicit selection
    /// preserves the caller's order.
    pub indices: Vec<u32>,
}

impl CandidateSet {
    /// Number of candidates.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// True when no candidate was chosen.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Keep the `n` best-ranked runs.
///
/// Clamps to what the ranking holds; asking for more than exists is not an
/// error, you just get everything.
pub fn select_top_n(ranked: &RankedList, n: usize) -> CandidateSet {
    let kept = n.min(ranked.len());
    let indices: Vec<u32> = ranked.entries[..kept]
        .iter()
        .map(|entry| entry.run_index)
        .collect();
    info!(
        criterion = %ranked.criterion,
        requested = n,
        kept,
        "selected top candidates"
    );
    CandidateSet { indices }
}

/// Select exact run indices, bypassing scoring entirely.
///
/// Every index must name a completed run; the first offender fails the whole
/// selection so a typo never silently shrinks the candidate set.
pub fn select_explicit(
    records: &[RunRecord],
    indices: &[u32],
) -> Result<CandidateSet, SelectionError> {
    for &index in indices {
        let record = records
            .iter()
            .find(|record| record.index == index)
            .ok_or(SelectionError::UnknownRun(index))?;
        if record.status != RunStatus::Completed {
            return Err(SelectionError::NotCompleted {
                index,
                status: record.status,
            });
        }
    }
    info!(count = indices.len(), "explicit candidate selection");
    Ok(CandidateSet {
        indices: indices.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::SortingCriterion;
    use crate::scorer::RankedEntry;
    use std::collections::BTreeMap;

    fn ranked(pairs: &[(u32, f64)]) -> RankedList {
        RankedList {
            criterion: SortingCriterion::Llk,
            entries: pairs
                .iter()
                .map(|&(run_index, value)| RankedEntry { run_index, value })
                .collect(),
        }
    }

    fn record(index: u32, status: RunStatus) -> RunRecord {
        RunRecord {
            index,
            status,
            artifact: None,
            metrics: BTreeMap::new(),
            error: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn top_n_follows_rank_order_and_clamps() {
        let list = ranked(&[(4, -140.0), (0, -120.0), (2, -95.0)]);
        assert_eq!(select_top_n(&list, 2).indices, vec![4, 0]);
        assert_eq!(select_top_n(&list, 10).indices, vec![4, 0, 2]);
        assert!(select_top_n(&list, 0).is_empty());
    }

    #[test]
    fn explicit_selection_names_the_incomplete_run() {
        let records = vec![
            record(0, RunStatus::Completed),
            record(1, RunStatus::Failed),
            record(3, RunStatus::Completed),
        ];

        let err = select_explicit(&records, &[0, 1, 3]).unwrap_err();
        assert_eq!(
            err,
            SelectionError::NotCompleted {
                index: 1,
                status: RunStatus::Failed
            }
        );

        let err = select_explicit(&records, &[0, 7]).unwrap_err();
        assert_eq!(err, SelectionError::UnknownRun(7));

        let chosen = select_explicit(&records, &[3, 0]).expect("select");
        assert_eq!(chosen.indices, vec![3, 0]);
    }
}
