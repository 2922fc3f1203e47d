#![warn(missing_docs)]

//! bcdi-pipeline - the stage machine driving a BCDI reconstruction workflow.
//!
//! A pipeline instance owns one scan and walks it through preprocess, phase
//! retrieval, analysis, selection, mode decomposition, and postprocess. Each
//! stage resolves a fresh parameter snapshot, so per-stage overrides never
//! leak into later stages. Phase retrieval fans out `nb_run` stochastic
//! attempts over a [`bcdi_dispatch::ComputeBackend`] and tolerates individual
//! run failures; everything else is strictly sequential.

/// Preprocess and postprocess trait hooks.
pub mod hooks;
/// The stage orchestrator.
pub mod orchestrator;
/// Stage enumeration and transition errors.
pub mod stage;
/// Persistent pipeline state.
pub mod state;

pub use hooks::{Postprocessor, PreprocessedData, Preprocessor};
pub use orchestrator::{CancelToken, OrchestratorOptions, PipelineError, StageOrchestrator};
pub use stage::{Stage, StateError};
pub use state::{ConsensusSummary, FailureRecord, PipelineState};
