use async_trait::async_trait;

use crate::job::{DispatchError, JobHandle, JobSpec, JobState};

/// Abstraction over where phase-retrieval jobs actually execute.
///
/// Implementations cover a local machine with the engine installed and a
/// cluster scheduler; test doubles implement this to exercise the
/// orchestrator without any external engine.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Submit one job and return immediately with a pollable handle.
    ///
    /// Only a rejected submission is an error. A job that starts and later
    /// fails surfaces as [`JobState::Failed`] through [`Self::poll`].
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, DispatchError>;

    /// Non-blocking state query for a previously submitted job.
    async fn poll(&self, handle: &JobHandle) -> Result<JobState, DispatchError>;

    /// Best-effort cancellation; cancelling a finished job is a no-op.
    async fn cancel(&self, handle: &JobHandle) -> Result<(), DispatchError>;
}
