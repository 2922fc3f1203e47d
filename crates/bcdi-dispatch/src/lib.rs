#![warn(missing_docs)]

//! bcdi-dispatch - hands phase-retrieval computation to an external engine.
//!
//! One stochastic run is one job. Submission is the suspension point: a
//! backend returns a [`JobHandle`] immediately and the caller polls it until
//! a terminal [`JobState`] appears. A run that fails during execution is
//! reported as `Failed` state, never as an error; only a rejected submission
//! raises [`DispatchError`].

/// Compute backend trait.
pub mod backend;
/// Job specs, handles, and lifecycle states.
pub mod job;
/// Local synchronous-machine backend.
pub mod local;
/// Job script templating and engine input files.
pub mod script;
/// SLURM-style cluster scheduler backend.
pub mod slurm;

pub use backend::ComputeBackend;
pub use job::{DispatchError, JobHandle, JobSpec, JobState};
pub use local::LocalBackend;
pub use script::{render_template, write_engine_input_file};
pub use slurm::{SlurmBackend, SlurmResources, DEFAULT_SLURM_TEMPLATE};
