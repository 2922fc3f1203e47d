#![warn(missing_docs)]

//! bcdi-analysis - ranks reconstructions and distills candidates into one.
//!
//! A phase-retrieval stage leaves behind `nb_run` reconstructions of varying
//! quality. This crate ranks them under a sorting criterion (lower is always
//! better), picks a candidate subset, and collapses the candidates into a
//! single consensus volume by dominant-mode decomposition.

/// Sorting criteria for reconstruction quality.
pub mod criterion;
/// Dominant-mode decomposition of a candidate stack.
pub mod decompose;
/// Amplitude-derived quality metrics.
pub mod metrics;
/// Deterministic ranking of completed runs.
pub mod scorer;
/// Candidate subset selection.
pub mod selector;

pub use criterion::SortingCriterion;
pub use decompose::{
    ArtifactLoader, ConsensusArtifact, DecompositionError, ModeDecomposer,
};
pub use metrics::{compute_amplitude_metrics, AmplitudeMetrics};
pub use scorer::{rank, RankedEntry, RankedList, ScoringError};
pub use selector::{select_explicit, select_top_n, CandidateSet, SelectionError};
