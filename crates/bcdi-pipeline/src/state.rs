use bcdi_analysis::CandidateSet;
use bcdi_params::ParameterSnapshot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::stage::{Stage, StateError};

/// What went wrong, where, and how far the pipeline got before it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Stage whose execution failed.
    pub attempted: Stage,
    /// Failure text, preserved verbatim for reports.
    pub error: String,
    /// Last stage that completed successfully.
    pub last_completed: Stage,
}

/// Serializable record of a finished mode decomposition.
///
/// The consensus volume itself is handed to the caller; the state only keeps
/// the diagnostics needed for inspection and resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusSummary {
    /// Fraction of stack power captured by the dominant mode.
    pub mode_weight: f64,
    /// Run indices that entered the decomposition.
    pub candidates: Vec<u32>,
    /// Where the summary document was written.
    pub summary_file: PathBuf,
}

/// Everything one pipeline instance knows about its own progress.
///
/// Dumped to JSON after every stage so an interrupted pipeline can be
/// inspected, and so operators can see why a failed one stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Last completed stage.
    pub stage: Stage,
    /// Snapshot the most recent stage executed under.
    pub snapshot: Option<ParameterSnapshot>,
    /// Artifact references produced by preprocessing (data, mask).
    pub preprocessed: Vec<PathBuf>,
    /// Candidate set chosen by the selection stage.
    pub candidates: Option<CandidateSet>,
    /// Consensus diagnostics from the decomposition stage.
    pub consensus: Option<ConsensusSummary>,
    /// Set once, on the first stage failure.
    pub failure: Option<FailureRecord>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineState {
    /// Fresh state at `Created`.
    pub fn new() -> Self {
        Self {
            stage: Stage::Created,
            snapshot: None,
            preprocessed: Vec::new(),
            candidates: None,
            consensus: None,
            failure: None,
        }
    }

    /// Check that stage `to` may run now.
    ///
    /// A failed pipeline rejects everything; otherwise the current stage
    /// must be one of `allowed` (usually just the predecessor of `to`).
    pub fn ensure(&self, allowed: &[Stage], to: Stage) -> Result<(), StateError> {
        if let Some(failure) = &self.failure {
            return Err(StateError::Failed {
                attempted: failure.attempted,
                error: failure.error.clone(),
            });
        }
        if !allowed.contains(&self.stage) {
            return Err(StateError::InvalidTransition {
                from: self.stage,
                to,
            });
        }
        Ok(())
    }

    /// Record a stage failure. The stage marker stays at the last completed
    /// stage; only the failure record blocks further progress.
    pub fn record_failure(&mut self, attempted: Stage, error: &str) {
        self.failure = Some(FailureRecord {
            attempted,
            error: error.to_string(),
            last_completed: self.stage,
        });
    }

    /// Persist as a JSON document.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        debug!(stage = %self.stage, path = %path.display(), "pipeline state saved");
        Ok(())
    }

    /// Load a previously saved state document.
    pub fn load(path: &Path) -> Result<Self, StateError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_rejects_out_of_order_stages() {
        let state = PipelineState::new();
        assert!(state.ensure(&[Stage::Created], Stage::Preprocessed).is_ok());

        let err = state
            .ensure(&[Stage::Preprocessed], Stage::Phased)
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: Stage::Created,
                to: Stage::Phased
            }
        ));
    }

    #[test]
    fn a_failed_pipeline_rejects_every_stage() {
        let mut state = PipelineState::new();
        state.stage = Stage::Preprocessed;
        state.record_failure(Stage::Phased, "no run completed");

        // Even the transition that would otherwise be legal.
        let err = state
            .ensure(&[Stage::Preprocessed], Stage::Phased)
            .unwrap_err();
        assert!(matches!(err, StateError::Failed { attempted: Stage::Phased, .. }));
        assert_eq!(
            state.failure.as_ref().map(|f| f.last_completed),
            Some(Stage::Preprocessed)
        );
    }

    #[test]
    fn state_roundtrips_through_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pipeline_state.json");

        let mut state = PipelineState::new();
        state.stage = Stage::Selected;
        state.candidates = Some(CandidateSet {
            indices: vec![4, 0],
        });
        state.save(&path).expect("save");

        let loaded = PipelineState::load(&path).expect("load");
        assert_eq!(loaded, state);
    }
}
