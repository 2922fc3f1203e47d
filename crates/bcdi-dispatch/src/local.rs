use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::ComputeBackend;
use crate::job::{DispatchError, JobHandle, JobSpec, JobState};

enum ChildSlot {
    Active(Child),
    Finished(JobState),
}

/// Backend running the engine directly on the current machine.
///
/// One OS process per run. Polling performs a non-blocking wait; completion
/// requires both a zero exit code and the expected artifact on disk, since
/// some engines exit cleanly after an unconverged run.
pub struct LocalBackend {
    program: PathBuf,
    args: Vec<String>,
    jobs: Mutex<HashMap<u64, ChildSlot>>,
    next_id: AtomicU64,
}

impl LocalBackend {
    /// Backend invoking the given engine executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Extra arguments placed before the input file.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn parse_id(handle: &JobHandle) -> Result<u64, DispatchError> {
        handle
            .backend_id
            .parse()
            .map_err(|_| DispatchError::UnknownHandle(handle.backend_id.clone()))
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, DispatchError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(&spec.input_file)
            .current_dir(&spec.working_dir)
            .env("BCDI_RUN_INDEX", spec.run_index.to_string())
            .env("BCDI_ARTIFACT", &spec.artifact)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| DispatchError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.jobs.lock().await.insert(id, ChildSlot::Active(child));
        info!(run = spec.run_index, job = id, "spawned local engine process");

        Ok(JobHandle {
            run_index: spec.run_index,
            backend_id: id.to_string(),
            artifact: spec.artifact.clone(),
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobState, DispatchError> {
        let id = Self::parse_id(handle)?;
        let mut jobs = self.jobs.lock().await;
        let slot = jobs
            .get_mut(&id)
            .ok_or_else(|| DispatchError::UnknownHandle(handle.backend_id.clone()))?;

        match slot {
            ChildSlot::Finished(state) => Ok(state.clone()),
            ChildSlot::Active(child) => match child.try_wait() {
                Ok(None) => Ok(JobState::Running),
                Ok(Some(status)) => {
                    let state = if status.success() && handle.artifact.exists() {
                        JobState::Completed {
                            artifact: handle.artifact.clone(),
                        }
                    } else if status.success() {
                        JobState::Failed {
                            reason: format!(
                                "engine exited cleanly but produced no artifact at {}",
                                handle.artifact.display()
                            ),
                        }
                    } else {
                        JobState::Failed {
                            reason: format!("engine exited with {status}"),
                        }
                    };
                    debug!(run = handle.run_index, ?state, "local job reached terminal state");
                    *slot = ChildSlot::Finished(state.clone());
                    Ok(state)
                }
                Err(source) => Err(DispatchError::Io(source)),
            },
        }
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), DispatchError> {
        let id = Self::parse_id(handle)?;
        let mut jobs = self.jobs.lock().await;
        if let Some(slot) = jobs.get_mut(&id) {
            if let ChildSlot::Active(child) = slot {
                let _ = child.start_kill();
                *slot = ChildSlot::Finished(JobState::Cancelled);
                info!(run = handle.run_index, "cancelled local job");
            }
        }
        Ok(())
    }
}
