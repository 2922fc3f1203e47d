use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use bcdi_analysis::{
    compute_amplitude_metrics, rank, selector, ArtifactLoader, CandidateSet, ConsensusArtifact,
    DecompositionError, ModeDecomposer, ScoringError, SelectionError, SortingCriterion,
};
use bcdi_dispatch::{ComputeBackend, DispatchError, JobSpec, JobState, write_engine_input_file};
use bcdi_params::{ConfigError, ParameterStore, ScanLayout};
use bcdi_registry::{RegistryError, RunRegistry, RunStatus};

use crate::hooks::{Postprocessor, Preprocessor};
use crate::stage::{Stage, StateError};
use crate::state::{ConsensusSummary, PipelineState};

/// Errors surfaced by pipeline stage execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Stage machine violation.
    #[error(transparent)]
    State(#[from] StateError),

    /// Parameter resolution or access failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Run bookkeeping failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Job dispatch failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Ranking failed.
    #[error(transparent)]
    Scoring(#[from] ScoringError),

    /// Explicit selection failed.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// Mode decomposition failed.
    #[error(transparent)]
    Decomposition(#[from] DecompositionError),

    /// A preprocess or postprocess hook failed.
    #[error("hook failed: {0}")]
    Hook(#[source] anyhow::Error),

    /// Every stochastic run failed; there is nothing to analyze.
    #[error("phase retrieval finished with zero completed runs")]
    NoCompletedRuns,

    /// No completed artifact could be loaded for analysis.
    #[error("no completed artifact could be analyzed")]
    NothingAnalyzed,

    /// Decomposition requested without a recorded candidate set.
    #[error("no candidate set recorded, selection must run first")]
    MissingCandidates,

    /// Filesystem error in stage plumbing.
    #[error("pipeline i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Summary document could not be serialized.
    #[error("failed to serialize summary document: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Cooperative cancellation handle for a running pipeline.
///
/// Cloned out of the orchestrator and flipped from anywhere (signal
/// handler, UI). The phase-retrieval poll loop checks it between sweeps,
/// cancels outstanding jobs, and keeps every completed registry row, unlike
/// [`StageOrchestrator::reset`] which wipes them.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Irrevocable for the current stage.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runtime knobs of the phase-retrieval fan-out loop.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Delay between polling sweeps over outstanding jobs.
    pub poll_interval: Duration,
    /// Stop waiting once this many runs completed; outstanding jobs are
    /// cancelled. `None` waits for every run to reach a terminal state.
    pub completion_threshold: Option<u32>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            completion_threshold: None,
        }
    }
}

/// Drives one scan through the reconstruction workflow.
///
/// Owns the stage machine, the run registry, and the compute backend. Every
/// stage method checks the transition first, then resolves a fresh snapshot
/// from the base configuration plus the caller's overrides, executes, and
/// persists the pipeline state. The first stage failure is recorded and
/// blocks all further stage calls until [`Self::reset`].
pub struct StageOrchestrator<B: ComputeBackend> {
    store: ParameterStore,
    base: BTreeMap<String, Value>,
    backend: B,
    registry: RunRegistry,
    layout: ScanLayout,
    state: PipelineState,
    decomposer: ModeDecomposer,
    options: OrchestratorOptions,
    cancel: CancelToken,
}

impl<B: ComputeBackend> StageOrchestrator<B> {
    /// Build an orchestrator for the scan described by `base`.
    ///
    /// The scan layout (sample, scan number, dump directory) is fixed here
    /// from the base configuration; per-stage overrides cannot relocate a
    /// running pipeline. An existing state file and registry under the scan
    /// directory are picked up, which is what resume means.
    pub fn new(
        store: ParameterStore,
        base: BTreeMap<String, Value>,
        backend: B,
        options: OrchestratorOptions,
    ) -> Result<Self, PipelineError> {
        let snapshot = store.resolve(&base, &BTreeMap::new())?;
        let layout = ScanLayout::from_snapshot(&snapshot)?;
        layout.ensure_dirs()?;

        let registry = RunRegistry::open(layout.scan_dir().join("runs.sqlite3"))?;
        let state_file = layout.state_file();
        let state = if state_file.exists() {
            info!(path = %state_file.display(), "resuming from saved pipeline state");
            PipelineState::load(&state_file)?
        } else {
            PipelineState::new()
        };

        Ok(Self {
            store,
            base,
            backend,
            registry,
            layout,
            state,
            decomposer: ModeDecomposer::new(),
            options,
            cancel: CancelToken::new(),
        })
    }

    /// Handle for cancelling the pipeline from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current pipeline state.
    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Output layout of the scan this pipeline owns.
    pub fn layout(&self) -> &ScanLayout {
        &self.layout
    }

    /// Run bookkeeping, read access.
    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Run the preprocessing hook. `Created` to `Preprocessed`.
    pub fn preprocess(
        &mut self,
        hook: &dyn Preprocessor,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        self.state.ensure(&[Stage::Created], Stage::Preprocessed)?;
        let result = self.run_preprocess(hook, overrides);
        self.complete_or_fail(Stage::Preprocessed, result)
    }

    fn run_preprocess(
        &mut self,
        hook: &dyn Preprocessor,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.store.resolve(&self.base, overrides)?;
        self.layout.ensure_dirs()?;

        let data = hook
            .preprocess(&snapshot, &self.layout)
            .map_err(PipelineError::Hook)?;
        snapshot.save(&self.layout.parameter_file())?;
        info!(data = %data.data_file.display(), "preprocessing finished");

        self.state.preprocessed = data.artifacts();
        self.state.snapshot = Some(snapshot);
        Ok(())
    }

    /// Fan out `nb_run` engine jobs and wait for them. `Preprocessed` to
    /// `Phased`.
    ///
    /// Individual run failures are absorbed into the registry; the stage
    /// itself fails only when not a single run completes. Runs already
    /// terminal in the registry (an interrupted previous attempt) are not
    /// dispatched again, and prior completions count toward the completion
    /// threshold. A flipped [`CancelToken`] stops the poll loop after the
    /// current sweep, cancelling outstanding jobs but keeping every
    /// completed row.
    pub async fn phase_retrieval(
        &mut self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        self.state.ensure(&[Stage::Preprocessed], Stage::Phased)?;
        let result = self.run_phase_retrieval(overrides).await;
        self.complete_or_fail(Stage::Phased, result)
    }

    async fn run_phase_retrieval(
        &mut self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.store.resolve(&self.base, overrides)?;
        let nb_run = snapshot.u64("nb_run")? as u32;

        let input_file = self.layout.engine_input_file();
        write_engine_input_file(&input_file, snapshot.engine_parameters())?;

        let mut handles = Vec::new();
        let mut completed = 0u32;
        for index in 0..nb_run {
            self.registry.register(index)?;
            // A resumed pipeline finds terminal rows from the previous
            // attempt; those runs are never dispatched again.
            let record = self.registry.get(index)?;
            match record.status {
                RunStatus::Completed => {
                    info!(run = index, "reusing completed run from previous attempt");
                    completed += 1;
                    continue;
                }
                RunStatus::Failed => continue,
                RunStatus::Pending | RunStatus::Running => {}
            }
            let spec = JobSpec {
                run_index: index,
                working_dir: self.layout.phasing_dir().to_path_buf(),
                input_file: input_file.clone(),
                artifact: self.layout.run_artifact(index),
            };
            match self.backend.submit(&spec).await {
                Ok(handle) => {
                    self.registry.mark_running(index)?;
                    handles.push(handle);
                }
                Err(error) => {
                    warn!(run = index, %error, "submission rejected");
                    self.registry
                        .fail(index, &format!("submission rejected: {error}"))?;
                }
            }
        }
        info!(
            submitted = handles.len(),
            reused = completed,
            nb_run,
            "phase retrieval fan-out"
        );

        let threshold = self
            .options
            .completion_threshold
            .unwrap_or(nb_run)
            .min(nb_run);
        let mut cancelled = false;
        while !handles.is_empty() && completed < threshold {
            let mut outstanding = Vec::new();
            for handle in handles.drain(..) {
                match self.backend.poll(&handle).await? {
                    JobState::Pending | JobState::Running => outstanding.push(handle),
                    JobState::Completed { artifact } => {
                        let metrics = read_sidecar_metrics(&artifact);
                        self.registry.complete(handle.run_index, &artifact, metrics)?;
                        completed += 1;
                    }
                    JobState::Failed { reason } => {
                        self.registry.fail(handle.run_index, &reason)?;
                    }
                    JobState::Cancelled => {
                        self.registry.fail(handle.run_index, "cancelled")?;
                    }
                }
            }
            handles = outstanding;
            if self.cancel.is_cancelled() {
                info!("pipeline cancellation requested, stopping poll loop");
                cancelled = true;
                break;
            }
            if !handles.is_empty() && completed < threshold {
                tokio::time::sleep(self.options.poll_interval).await;
            }
        }

        // Outstanding jobs are stopped once enough runs are in or the
        // pipeline was cancelled; completed registry rows always stay.
        let reason = if cancelled {
            "cancelled"
        } else {
            "cancelled, completion threshold reached"
        };
        for handle in &handles {
            self.backend.cancel(handle).await?;
            self.registry.fail(handle.run_index, reason)?;
        }

        if completed == 0 {
            return Err(PipelineError::NoCompletedRuns);
        }
        info!(completed, "phase retrieval finished");
        self.state.snapshot = Some(snapshot);
        Ok(())
    }

    /// Score completed reconstructions. `Phased` to `Analyzed`.
    ///
    /// Amplitude metrics are attached to each run whose artifact loads; an
    /// unreadable artifact is skipped with a warning, not a stage failure.
    pub fn analyze(
        &mut self,
        loader: &dyn ArtifactLoader,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        self.state.ensure(&[Stage::Phased], Stage::Analyzed)?;
        let result = self.run_analyze(loader, overrides);
        self.complete_or_fail(Stage::Analyzed, result)
    }

    fn run_analyze(
        &mut self,
        loader: &dyn ArtifactLoader,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.store.resolve(&self.base, overrides)?;
        let isosurface = snapshot.f64("isosurface")?;

        let mut analyzed = 0usize;
        for record in self.registry.completed()? {
            let Some(artifact) = record.artifact.as_deref() else {
                continue;
            };
            match loader.load(artifact) {
                Ok(volume) => {
                    let metrics = compute_amplitude_metrics(&volume, isosurface)?;
                    self.registry.attach_metrics(record.index, &metrics.to_map())?;
                    analyzed += 1;
                }
                Err(error) => {
                    warn!(run = record.index, %error, "skipping unreadable artifact");
                }
            }
        }
        if analyzed == 0 {
            return Err(PipelineError::NothingAnalyzed);
        }
        info!(analyzed, "reconstructions scored");
        self.state.snapshot = Some(snapshot);
        Ok(())
    }

    /// Keep the best `nb_run_keep` runs under the configured criterion.
    /// `Analyzed` to `Selected`.
    pub fn select_top_n(
        &mut self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        self.state.ensure(&[Stage::Analyzed], Stage::Selected)?;
        let result = self.run_select_top_n(overrides);
        self.complete_or_fail(Stage::Selected, result)
    }

    fn run_select_top_n(
        &mut self,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.store.resolve(&self.base, overrides)?;
        let criterion: SortingCriterion = snapshot.str("sorting_criterion")?.parse()?;
        let keep = snapshot.u64("nb_run_keep")? as usize;

        let ranked = rank(&self.registry.all()?, criterion)?;
        let candidates = selector::select_top_n(&ranked, keep);
        self.stage_candidates(candidates)?;
        self.state.snapshot = Some(snapshot);
        Ok(())
    }

    /// Select exact run indices, bypassing scoring. `Phased` or `Analyzed`
    /// to `Selected`.
    ///
    /// Resolves a fresh snapshot like every other stage, even though the
    /// indices themselves come from the caller.
    pub fn select_explicit(
        &mut self,
        indices: &[u32],
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        self.state
            .ensure(&[Stage::Phased, Stage::Analyzed], Stage::Selected)?;
        let result = self.run_select_explicit(indices, overrides);
        self.complete_or_fail(Stage::Selected, result)
    }

    fn run_select_explicit(
        &mut self,
        indices: &[u32],
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.store.resolve(&self.base, overrides)?;
        let candidates = selector::select_explicit(&self.registry.all()?, indices)?;
        self.stage_candidates(candidates)?;
        self.state.snapshot = Some(snapshot);
        Ok(())
    }

    /// Copy candidate artifacts under their candidate names and record the
    /// set in the pipeline state.
    fn stage_candidates(&mut self, candidates: CandidateSet) -> Result<(), PipelineError> {
        for &index in &candidates.indices {
            let source = self.layout.run_artifact(index);
            let target = self.layout.candidate_artifact(index);
            std::fs::copy(&source, &target)?;
        }
        info!(candidates = ?candidates.indices, "candidate set staged");
        self.state.candidates = Some(candidates);
        Ok(())
    }

    /// Collapse the candidate set into a consensus volume. `Selected` to
    /// `ModeDecomposed`.
    pub fn decompose(
        &mut self,
        loader: &dyn ArtifactLoader,
    ) -> Result<ConsensusArtifact, PipelineError> {
        self.state.ensure(&[Stage::Selected], Stage::ModeDecomposed)?;
        let result = self.run_decompose(loader);
        self.complete_or_fail(Stage::ModeDecomposed, result)
    }

    fn run_decompose(
        &mut self,
        loader: &dyn ArtifactLoader,
    ) -> Result<ConsensusArtifact, PipelineError> {
        let candidates = self
            .state
            .candidates
            .clone()
            .ok_or(PipelineError::MissingCandidates)?;
        let paths: Vec<PathBuf> = candidates
            .indices
            .iter()
            .map(|&index| self.layout.candidate_artifact(index))
            .collect();

        let consensus = self.decomposer.decompose_artifacts(loader, &paths)?;

        let summary = ConsensusSummary {
            mode_weight: consensus.mode_weight,
            candidates: candidates.indices.clone(),
            summary_file: self.layout.consensus_summary(),
        };
        std::fs::write(
            &summary.summary_file,
            serde_json::to_string_pretty(&summary)?,
        )?;
        info!(
            mode_weight = consensus.mode_weight,
            candidates = candidates.indices.len(),
            "consensus reconstruction built"
        );

        self.state.consensus = Some(summary);
        Ok(consensus)
    }

    /// Run the postprocessing hook on the consensus. `ModeDecomposed` to
    /// `Postprocessed`.
    pub fn postprocess(
        &mut self,
        hook: &dyn Postprocessor,
        consensus: &ConsensusArtifact,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        self.state
            .ensure(&[Stage::ModeDecomposed], Stage::Postprocessed)?;
        let result = self.run_postprocess(hook, consensus, overrides);
        self.complete_or_fail(Stage::Postprocessed, result)
    }

    fn run_postprocess(
        &mut self,
        hook: &dyn Postprocessor,
        consensus: &ConsensusArtifact,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<(), PipelineError> {
        let snapshot = self.store.resolve(&self.base, overrides)?;
        hook.postprocess(consensus, &snapshot, &self.layout)
            .map_err(PipelineError::Hook)?;
        self.state.snapshot = Some(snapshot);
        Ok(())
    }

    /// Wipe the registry and return to `Created`.
    ///
    /// The only way past a recorded failure, and the only destructive
    /// registry operation the orchestrator performs.
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        self.registry.clear()?;
        self.state = PipelineState::new();
        self.persist_state();
        info!("pipeline reset");
        Ok(())
    }

    fn complete_or_fail<T>(
        &mut self,
        stage: Stage,
        result: Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        match result {
            Ok(value) => {
                self.state.stage = stage;
                self.persist_state();
                Ok(value)
            }
            Err(error) => {
                warn!(stage = %stage, %error, "stage failed");
                self.state.record_failure(stage, &error.to_string());
                self.persist_state();
                Err(error)
            }
        }
    }

    fn persist_state(&self) {
        if let Err(error) = self.state.save(&self.layout.state_file()) {
            warn!(%error, "could not persist pipeline state");
        }
    }
}

/// Engine-reported metrics dropped next to the artifact as
/// `<artifact>.metrics.json`. Missing or malformed sidecars yield an empty
/// map; amplitude metrics computed later cover for them.
fn read_sidecar_metrics(artifact: &Path) -> BTreeMap<String, f64> {
    let mut sidecar = artifact.as_os_str().to_os_string();
    sidecar.push(".metrics.json");
    let sidecar = PathBuf::from(sidecar);

    let Ok(text) = std::fs::read_to_string(&sidecar) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(key, value)| value.as_f64().map(|number| (key, number)))
            .collect(),
        Ok(_) | Err(_) => {
            warn!(path = %sidecar.display(), "ignoring malformed metrics sidecar");
            BTreeMap::new()
        }
    }
}
