use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by job dispatch.
///
/// These cover the submission path only: a job that starts and then fails
/// is reported through [`JobState::Failed`], which is data, not a crash.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The backend command could not be spawned at all.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The scheduler refused the submission.
    #[error("backend rejected submission: {0}")]
    Rejected(String),

    /// The scheduler state query itself failed.
    #[error("scheduler query failed: {0}")]
    QueryFailed(String),

    /// The scheduler replied with something unparseable.
    #[error("could not parse scheduler reply: {0:?}")]
    MalformedReply(String),

    /// A job template referenced a placeholder with no binding.
    #[error("job template references undefined placeholder '{0}'")]
    UnresolvedPlaceholder(String),

    /// A handle that this backend never issued.
    #[error("unknown job handle '{0}'")]
    UnknownHandle(String),

    /// Filesystem error while preparing the submission.
    #[error("dispatch i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a backend needs to run one stochastic attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Run index this job computes.
    pub run_index: u32,
    /// Directory the engine executes in.
    pub working_dir: PathBuf,
    /// Input-parameter file consumed by the engine.
    pub input_file: PathBuf,
    /// Artifact path the engine is expected to produce.
    pub artifact: PathBuf,
}

/// Opaque reference to a submitted job, used for polling and cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Run index the job belongs to.
    pub run_index: u32,
    /// Backend-assigned identifier (process slot, scheduler job id).
    pub backend_id: String,
    /// Artifact path expected on completion.
    pub artifact: PathBuf,
}

/// Scheduler-reported lifecycle state of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Queued, not yet started.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully; the artifact exists.
    Completed {
        /// Produced reconstruction artifact.
        artifact: PathBuf,
    },
    /// Finished without a usable result.
    Failed {
        /// Backend-reported reason.
        reason: String,
    },
    /// Cancelled before completion.
    Cancelled,
}

impl JobState {
    /// True once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}
