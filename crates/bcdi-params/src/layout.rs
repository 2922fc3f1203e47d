use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::snapshot::{ConfigError, ParameterSnapshot};

/// Output tree for one scan: `{dump_dir}/{sample_name}/S{scan}/`.
///
/// Per-run artifacts live in the `phasing/` subdirectory; the consensus
/// artifact and the saved parameter snapshot live alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanLayout {
    sample_name: String,
    scan: u64,
    scan_dir: PathBuf,
    phasing_dir: PathBuf,
}

impl ScanLayout {
    /// Derive the layout from a resolved snapshot.
    pub fn from_snapshot(snapshot: &ParameterSnapshot) -> Result<Self, ConfigError> {
        let dump_dir = snapshot.str("dump_dir")?;
        let sample_name = snapshot.str("sample_name")?.to_string();
        let scan = snapshot.u64("scan")?;

        let scan_dir = Path::new(dump_dir)
            .join(&sample_name)
            .join(format!("S{scan}"));
        let phasing_dir = scan_dir.join("phasing");

        Ok(Self {
            sample_name,
            scan,
            scan_dir,
            phasing_dir,
        })
    }

    /// Sample this layout belongs to.
    pub fn sample_name(&self) -> &str {
        &self.sample_name
    }

    /// Scan number this layout belongs to.
    pub fn scan(&self) -> u64 {
        self.scan
    }

    /// Root directory for this scan's results.
    pub fn scan_dir(&self) -> &Path {
        &self.scan_dir
    }

    /// Directory holding per-run phase-retrieval artifacts.
    pub fn phasing_dir(&self) -> &Path {
        &self.phasing_dir
    }

    /// Create the scan and phasing directories if needed.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.phasing_dir)
    }

    /// Expected artifact path for one stochastic run.
    pub fn run_artifact(&self, run_index: u32) -> PathBuf {
        self.phasing_dir.join(format!("run_{run_index:04}.cxi"))
    }

    /// Path a selected candidate artifact is copied to.
    pub fn candidate_artifact(&self, run_index: u32) -> PathBuf {
        self.phasing_dir
            .join(format!("candidate_run_{run_index:04}.cxi"))
    }

    /// Input-parameter file consumed by the external engine.
    pub fn engine_input_file(&self) -> PathBuf {
        self.phasing_dir.join("engine_inputs.txt")
    }

    /// Rendered scheduler submission script for one phase-retrieval run.
    pub fn job_script(&self, run_index: u32) -> PathBuf {
        self.phasing_dir
            .join(format!("phase_retrieval_{run_index:04}.slurm"))
    }

    /// Saved parameter snapshot for this scan.
    pub fn parameter_file(&self) -> PathBuf {
        self.scan_dir.join(format!("S{}_parameters.yml", self.scan))
    }

    /// Consensus (mode decomposition) summary location.
    pub fn consensus_summary(&self) -> PathBuf {
        self.scan_dir.join(format!("S{}_consensus.json", self.scan))
    }

    /// Persisted pipeline state location.
    pub fn state_file(&self) -> PathBuf {
        self.scan_dir.join("pipeline_state.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ParameterStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn layout() -> ScanLayout {
        let mut base = BTreeMap::new();
        base.insert("experiment_file_path".to_string(), json!("/data/exp.h5"));
        base.insert("sample_name".to_string(), json!("Pt_np"));
        base.insert("scan".to_string(), json!(182));
        base.insert("dump_dir".to_string(), json!("/tmp/bcdi"));
        let snap = ParameterStore::new()
            .resolve(&base, &BTreeMap::new())
            .expect("resolve");
        ScanLayout::from_snapshot(&snap).expect("layout")
    }

    #[test]
    fn paths_are_keyed_by_sample_and_scan() {
        let layout = layout();
        assert_eq!(layout.scan_dir(), Path::new("/tmp/bcdi/Pt_np/S182"));
        assert_eq!(
            layout.phasing_dir(),
            Path::new("/tmp/bcdi/Pt_np/S182/phasing")
        );
        assert_eq!(
            layout.run_artifact(3),
            Path::new("/tmp/bcdi/Pt_np/S182/phasing/run_0003.cxi")
        );
        assert_eq!(
            layout.candidate_artifact(3),
            Path::new("/tmp/bcdi/Pt_np/S182/phasing/candidate_run_0003.cxi")
        );
        assert_eq!(
            layout.job_script(3),
            Path::new("/tmp/bcdi/Pt_np/S182/phasing/phase_retrieval_0003.slurm")
        );
        assert_eq!(
            layout.parameter_file(),
            Path::new("/tmp/bcdi/Pt_np/S182/S182_parameters.yml")
        );
    }

    #[test]
    fn ensure_dirs_creates_the_phasing_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut base = BTreeMap::new();
        base.insert("experiment_file_path".to_string(), json!("/data/exp.h5"));
        base.insert("sample_name".to_string(), json!("Pt_np"));
        base.insert("scan".to_string(), json!(7));
        base.insert(
            "dump_dir".to_string(),
            json!(dir.path().to_string_lossy().to_string()),
        );

        let snap = ParameterStore::new()
            .resolve(&base, &BTreeMap::new())
            .expect("resolve");
        let layout = ScanLayout::from_snapshot(&snap).expect("layout");
        layout.ensure_dirs().expect("mkdir");
        assert!(layout.phasing_dir().is_dir());
    }
}
