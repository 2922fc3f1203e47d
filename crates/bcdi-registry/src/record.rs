use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Lifecycle status of one stochastic phase-retrieval run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Registered but not yet started by the backend.
    Pending,
    /// Submitted and executing.
    Running,
    /// Finished with an artifact on disk. Terminal.
    Completed,
    /// Finished without a usable result. Terminal.
    Failed,
}

impl RunStatus {
    /// Terminal statuses are set exactly once.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stochastic phase-retrieval attempt.
///
/// The run index is unique within a pipeline instance and doubles as the
/// dispatch order; re-runs get a new index, never a recycled one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run index, unique within the pipeline instance.
    pub index: u32,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Opaque reference to the produced reconstruction, set on completion.
    pub artifact: Option<PathBuf>,
    /// Named quality metrics, populated only for completed runs.
    pub metrics: BTreeMap<String, f64>,
    /// Failure reason, set only for failed runs.
    pub error: Option<String>,
    /// Unix timestamp of registration.
    pub created_at: i64,
    /// Unix timestamp of the last update.
    pub updated_at: i64,
}

/// One status transition applied through [`crate::RunRegistry::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    /// Status to transition to.
    pub status: RunStatus,
    /// Artifact reference, usually set together with `Completed`.
    pub artifact: Option<PathBuf>,
    /// Metrics to store; ignored when the status is `Failed`.
    pub metrics: BTreeMap<String, f64>,
    /// Failure reason, usually set together with `Failed`.
    pub error: Option<String>,
}

impl RunUpdate {
    /// Transition to `Running`.
    pub fn running() -> Self {
        Self {
            status: RunStatus::Running,
            artifact: None,
            metrics: BTreeMap::new(),
            error: None,
        }
    }

    /// Transition to `Completed` with the produced artifact.
    pub fn completed(artifact: &Path) -> Self {
        Self {
            status: RunStatus::Completed,
            artifact: Some(artifact.to_path_buf()),
            metrics: BTreeMap::new(),
            error: None,
        }
    }

    /// Transition to `Failed` with a reason. Failed runs carry no metrics.
    pub fn failed(reason: &str) -> Self {
        Self {
            status: RunStatus::Failed,
            artifact: None,
            metrics: BTreeMap::new(),
            error: Some(reason.to_string()),
        }
    }

    /// Attach metrics to this update (engine-reported scores at completion).
    pub fn with_metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics = metrics;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_storage_form() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("exploded"), None);
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
