use bcdi_analysis::ConsensusArtifact;
use bcdi_params::{ParameterSnapshot, ScanLayout};
use std::path::PathBuf;

/// Artifact references produced by a preprocessing implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessedData {
    /// Cropped, centered intensity data the engine will phase.
    pub data_file: PathBuf,
    /// Optional detector mask alongside it.
    pub mask_file: Option<PathBuf>,
}

impl PreprocessedData {
    /// Artifact references in a flat list, data first.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut files = vec![self.data_file.clone()];
        files.extend(self.mask_file.clone());
        files
    }
}

/// Turns raw experiment data into engine-ready inputs.
///
/// Implemented by external collaborators; the orchestrator only enforces
/// sequencing and records the artifact references it gets back. Errors
/// cross this seam as `anyhow` since implementations bring their own error
/// types.
pub trait Preprocessor: Send + Sync {
    /// Run preprocessing for the scan described by `snapshot`, writing
    /// outputs under the scan's layout.
    fn preprocess(
        &self,
        snapshot: &ParameterSnapshot,
        layout: &ScanLayout,
    ) -> anyhow::Result<PreprocessedData>;
}

/// Consumes the consensus reconstruction.
pub trait Postprocessor: Send + Sync {
    /// Postprocess the consensus volume (orthogonalization, export, ...).
    fn postprocess(
        &self,
        consensus: &ConsensusArtifact,
        snapshot: &ParameterSnapshot,
        layout: &ScanLayout,
    ) -> anyhow::Result<()>;
}
