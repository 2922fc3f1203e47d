use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{info, warn};

use crate::backend::ComputeBackend;
use crate::job::{DispatchError, JobHandle, JobSpec, JobState};
use crate::script::render_template;

/// Job script used when the caller does not supply one.
///
/// Placeholders are filled from [`SlurmResources`] and the per-job spec.
pub const DEFAULT_SLURM_TEMPLATE: &str = "\
#!/bin/bash
#SBATCH --partition=${partition}
#SBATCH --nodes=${nodes}
#SBATCH --gres=gpu:${gpus_per_node}
#SBATCH --time=${walltime}
#SBATCH --output=${working_dir}/slurm-%j.out

export BCDI_RUN_INDEX=${run_index}
export BCDI_ARTIFACT=${artifact}

cd ${working_dir}
${engine} ${input_file}
";

/// Cluster resources requested for each phase-retrieval job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmResources {
    /// Partition name.
    pub partition: String,
    /// Node count.
    pub nodes: u32,
    /// GPUs requested per node.
    pub gpus_per_node: u32,
    /// Walltime limit in scheduler format.
    pub walltime: String,
}

impl Default for SlurmResources {
    fn default() -> Self {
        Self {
            partition: "gpu".to_string(),
            nodes: 1,
            gpus_per_node: 1,
            walltime: "01:00:00".to_string(),
        }
    }
}

/// Backend submitting phase-retrieval jobs to a SLURM-style scheduler.
///
/// The scheduler commands are configurable so tests (and unusual sites) can
/// point them at stand-ins; by default they are `sbatch`, `sacct`, `scancel`.
pub struct SlurmBackend {
    submit_command: PathBuf,
    query_command: PathBuf,
    cancel_command: PathBuf,
    engine: String,
    template: String,
    resources: SlurmResources,
}

impl SlurmBackend {
    /// Backend invoking the given engine command inside each job script.
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            submit_command: PathBuf::from("sbatch"),
            query_command: PathBuf::from("sacct"),
            cancel_command: PathBuf::from("scancel"),
            engine: engine.into(),
            template: DEFAULT_SLURM_TEMPLATE.to_string(),
            resources: SlurmResources::default(),
        }
    }

    /// Override the requested cluster resources.
    pub fn with_resources(mut self, resources: SlurmResources) -> Self {
        self.resources = resources;
        self
    }

    /// Replace the job script template.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    /// Point the scheduler commands somewhere else.
    pub fn with_commands(
        mut self,
        submit: impl Into<PathBuf>,
        query: impl Into<PathBuf>,
        cancel: impl Into<PathBuf>,
    ) -> Self {
        self.submit_command = submit.into();
        self.query_command = query.into();
        self.cancel_command = cancel.into();
        self
    }

    fn template_vars(&self, spec: &JobSpec) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("partition".to_string(), self.resources.partition.clone());
        vars.insert("nodes".to_string(), self.resources.nodes.to_string());
        vars.insert(
            "gpus_per_node".to_string(),
            self.resources.gpus_per_node.to_string(),
        );
        vars.insert("walltime".to_string(), self.resources.walltime.clone());
        vars.insert("engine".to_string(), self.engine.clone());
        vars.insert(
            "working_dir".to_string(),
            spec.working_dir.display().to_string(),
        );
        vars.insert(
            "input_file".to_string(),
            spec.input_file.display().to_string(),
        );
        vars.insert("run_index".to_string(), spec.run_index.to_string());
        vars.insert("artifact".to_string(), spec.artifact.display().to_string());
        vars
    }
}

/// Extract the job id from an `sbatch` acknowledgement.
///
/// The stock reply is `Submitted batch job 4242`; the id is the last
/// all-digit token so decorated site wrappers still parse.
fn parse_job_id(stdout: &str) -> Result<String, DispatchError> {
    stdout
        .split_whitespace()
        .rev()
        .find(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .ok_or_else(|| DispatchError::MalformedReply(stdout.trim().to_string()))
}

fn map_scheduler_state(raw: &str, handle: &JobHandle) -> Result<JobState, DispatchError> {
    let state = raw
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match state.as_str() {
        "PENDING" | "REQUEUED" => Ok(JobState::Pending),
        "RUNNING" | "COMPLETING" => Ok(JobState::Running),
        "COMPLETED" => {
            if handle.artifact.exists() {
                Ok(JobState::Completed {
                    artifact: handle.artifact.clone(),
                })
            } else {
                Ok(JobState::Failed {
                    reason: format!(
                        "scheduler reported COMPLETED but no artifact at {}",
                        handle.artifact.display()
                    ),
                })
            }
        }
        "FAILED" | "TIMEOUT" | "OUT_OF_MEMORY" | "NODE_FAIL" => Ok(JobState::Failed {
            reason: format!("scheduler reported {state}"),
        }),
        _ if state.starts_with("CANCELLED") => Ok(JobState::Cancelled),
        _ => Err(DispatchError::MalformedReply(raw.trim().to_string())),
    }
}

#[async_trait]
impl ComputeBackend for SlurmBackend {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, DispatchError> {
        let script = render_template(&self.template, &self.template_vars(spec))?;
        // One script per run; each carries its own artifact path.
        let script_path = spec
            .working_dir
            .join(format!("phase_retrieval_{:04}.slurm", spec.run_index));
        std::fs::write(&script_path, script)?;

        let output = Command::new(&self.submit_command)
            .arg(&script_path)
            .current_dir(&spec.working_dir)
            .output()
            .await
            .map_err(|source| DispatchError::Spawn {
                program: self.submit_command.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DispatchError::Rejected(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let job_id = parse_job_id(&stdout)?;
        info!(run = spec.run_index, %job_id, "submitted batch job");

        Ok(JobHandle {
            run_index: spec.run_index,
            backend_id: job_id,
            artifact: spec.artifact.clone(),
        })
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobState, DispatchError> {
        let output = Command::new(&self.query_command)
            .arg("-j")
            .arg(&handle.backend_id)
            .arg("-o")
            .arg("state")
            .arg("--noheader")
            .output()
            .await
            .map_err(|source| DispatchError::Spawn {
                program: self.query_command.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DispatchError::QueryFailed(stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if stdout.trim().is_empty() {
            // Accounting lag right after submission.
            return Ok(JobState::Pending);
        }
        map_scheduler_state(&stdout, handle)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), DispatchError> {
        let result = Command::new(&self.cancel_command)
            .arg(&handle.backend_id)
            .output()
            .await;
        match result {
            Ok(output) if output.status.success() => {
                info!(run = handle.run_index, job_id = %handle.backend_id, "cancelled batch job");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(job_id = %handle.backend_id, %stderr, "scancel returned an error");
            }
            Err(error) => {
                warn!(job_id = %handle.backend_id, %error, "could not run scancel");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_stub(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
        let mut perms = std::fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn spec(dir: &Path) -> JobSpec {
        JobSpec {
            run_index: 7,
            working_dir: dir.to_path_buf(),
            input_file: dir.join("engine_inputs.txt"),
            artifact: dir.join("run_0007.cxi"),
        }
    }

    #[test]
    fn job_id_is_last_numeric_token() {
        assert_eq!(parse_job_id("Submitted batch job 4242\n").expect("id"), "4242");
        assert_eq!(
            parse_job_id("sbatch: cluster note\nSubmitted batch job 17").expect("id"),
            "17"
        );
        assert!(matches!(
            parse_job_id("error: no free nodes"),
            Err(DispatchError::MalformedReply(_))
        ));
    }

    #[test]
    fn default_template_renders_without_unresolved_placeholders() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = SlurmBackend::new("pynx-cdi-id01");
        let script = render_template(
            DEFAULT_SLURM_TEMPLATE,
            &backend.template_vars(&spec(dir.path())),
        )
        .expect("render");
        assert!(script.contains("--partition=gpu"));
        assert!(script.contains("pynx-cdi-id01"));
        assert!(script.contains("BCDI_RUN_INDEX=7"));
        assert!(script.contains("run_0007.cxi"));
        assert!(!script.contains("${"));
    }

    #[tokio::test]
    async fn submission_writes_script_and_parses_job_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sbatch = write_stub(dir.path(), "sbatch", "echo 'Submitted batch job 4242'");

        let backend = SlurmBackend::new("pynx-cdi-id01").with_commands(
            &sbatch,
            "/bin/true",
            "/bin/true",
        );

        let handle = backend.submit(&spec(dir.path())).await.expect("submit");
        assert_eq!(handle.backend_id, "4242");

        let script = std::fs::read_to_string(dir.path().join("phase_retrieval_0007.slurm"))
            .expect("script on disk");
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("engine_inputs.txt"));
        assert!(script.contains("BCDI_ARTIFACT="));
        assert!(script.contains("run_0007.cxi"));
    }

    #[tokio::test]
    async fn each_run_gets_its_own_script_and_artifact() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sbatch = write_stub(dir.path(), "sbatch", "echo 'Submitted batch job 1'");

        let backend =
            SlurmBackend::new("pynx-cdi-id01").with_commands(&sbatch, "/bin/true", "/bin/true");

        for index in [0u32, 3] {
            let spec = JobSpec {
                run_index: index,
                working_dir: dir.path().to_path_buf(),
                input_file: dir.path().join("engine_inputs.txt"),
                artifact: dir.path().join(format!("run_{index:04}.cxi")),
            };
            backend.submit(&spec).await.expect("submit");
        }

        let first = std::fs::read_to_string(dir.path().join("phase_retrieval_0000.slurm"))
            .expect("script on disk");
        let second = std::fs::read_to_string(dir.path().join("phase_retrieval_0003.slurm"))
            .expect("script on disk");
        assert!(first.contains("run_0000.cxi"));
        assert!(second.contains("run_0003.cxi"));
        assert!(first.contains("BCDI_RUN_INDEX=0"));
        assert!(second.contains("BCDI_RUN_INDEX=3"));
    }

    #[tokio::test]
    async fn rejected_submission_surfaces_scheduler_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sbatch = write_stub(
            dir.path(),
            "sbatch",
            "echo 'sbatch: error: invalid partition' >&2; exit 1",
        );

        let backend =
            SlurmBackend::new("pynx-cdi-id01").with_commands(&sbatch, "/bin/true", "/bin/true");

        let err = backend
            .submit(&spec(dir.path()))
            .await
            .err()
            .expect("must fail");
        assert!(matches!(
            err,
            DispatchError::Rejected(stderr) if stderr.contains("invalid partition")
        ));
    }

    #[tokio::test]
    async fn poll_maps_scheduler_states() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_file = dir.path().join("state.txt");
        let sacct = write_stub(
            dir.path(),
            "sacct",
            &format!("cat {}", state_file.display()),
        );

        let backend =
            SlurmBackend::new("pynx-cdi-id01").with_commands("/bin/true", &sacct, "/bin/true");
        let handle = JobHandle {
            run_index: 7,
            backend_id: "4242".to_string(),
            artifact: dir.path().join("run_0007.cxi"),
        };

        std::fs::write(&state_file, "PENDING\n").expect("state");
        assert_eq!(backend.poll(&handle).await.expect("poll"), JobState::Pending);

        std::fs::write(&state_file, "RUNNING\n").expect("state");
        assert_eq!(backend.poll(&handle).await.expect("poll"), JobState::Running);

        std::fs::write(&state_file, "CANCELLED by 1000\n").expect("state");
        assert_eq!(
            backend.poll(&handle).await.expect("poll"),
            JobState::Cancelled
        );

        std::fs::write(&state_file, "TIMEOUT\n").expect("state");
        assert!(matches!(
            backend.poll(&handle).await.expect("poll"),
            JobState::Failed { .. }
        ));

        // COMPLETED without the artifact present is a failure, with it a success.
        std::fs::write(&state_file, "COMPLETED\n").expect("state");
        assert!(matches!(
            backend.poll(&handle).await.expect("poll"),
            JobState::Failed { .. }
        ));
        std::fs::write(&handle.artifact, b"").expect("artifact");
        assert_eq!(
            backend.poll(&handle).await.expect("poll"),
            JobState::Completed {
                artifact: handle.artifact.clone()
            }
        );
    }

    #[tokio::test]
    async fn empty_accounting_reply_reads_as_pending() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sacct = write_stub(dir.path(), "sacct", "exit 0");

        let backend =
            SlurmBackend::new("pynx-cdi-id01").with_commands("/bin/true", &sacct, "/bin/true");
        let handle = JobHandle {
            run_index: 1,
            backend_id: "9".to_string(),
            artifact: dir.path().join("run_0001.cxi"),
        };
        assert_eq!(backend.poll(&handle).await.expect("poll"), JobState::Pending);
    }
}
