use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Pipeline stages in execution order.
///
/// Every value names the stage that has been *completed*; a fresh pipeline
/// sits at `Created`. Transitions are single-step forward, with one
/// exception: explicit candidate selection may jump from `Phased` straight
/// to `Selected`, bypassing the scoring stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Pipeline instantiated, nothing executed.
    Created,
    /// Raw detector data turned into engine inputs.
    Preprocessed,
    /// Stochastic phase-retrieval runs finished, at least one completed.
    Phased,
    /// Completed reconstructions scored.
    Analyzed,
    /// Candidate subset chosen.
    Selected,
    /// Candidates collapsed into a consensus reconstruction.
    ModeDecomposed,
    /// Consensus handed to postprocessing.
    Postprocessed,
}

impl Stage {
    /// Name used in state files and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Preprocessed => "preprocessed",
            Self::Phased => "phased",
            Self::Analyzed => "analyzed",
            Self::Selected => "selected",
            Self::ModeDecomposed => "mode_decomposed",
            Self::Postprocessed => "postprocessed",
        }
    }

    /// The stage that normally follows this one.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Preprocessed),
            Self::Preprocessed => Some(Self::Phased),
            Self::Phased => Some(Self::Analyzed),
            Self::Analyzed => Some(Self::Selected),
            Self::Selected => Some(Self::ModeDecomposed),
            Self::ModeDecomposed => Some(Self::Postprocessed),
            Self::Postprocessed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the stage machine itself.
#[derive(Debug, Error)]
pub enum StateError {
    /// The requested stage cannot follow the current one.
    #[error("cannot run stage '{to}' from stage '{from}'")]
    InvalidTransition {
        /// Stage the pipeline currently sits at.
        from: Stage,
        /// Stage that was requested.
        to: Stage,
    },

    /// The pipeline already failed; only `reset()` is accepted.
    #[error("pipeline failed during stage '{attempted}' ({error}), reset before retrying")]
    Failed {
        /// Stage whose execution failed.
        attempted: Stage,
        /// Recorded failure text.
        error: String,
    },

    /// State file could not be read or written.
    #[error("pipeline state i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// State file holds something that is not a pipeline state document.
    #[error("pipeline state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_chain_forward_and_end() {
        let mut stage = Stage::Created;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            stage = next;
            seen.push(stage);
        }
        assert_eq!(seen.len(), 7);
        assert_eq!(stage, Stage::Postprocessed);
    }

    #[test]
    fn names_are_stable_snake_case() {
        assert_eq!(Stage::ModeDecomposed.as_str(), "mode_decomposed");
        let json = serde_json::to_string(&Stage::ModeDecomposed).expect("serialize");
        assert_eq!(json, "\"mode_decomposed\"");
    }
}
