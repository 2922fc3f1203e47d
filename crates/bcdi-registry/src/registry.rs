use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{RunRecord, RunStatus, RunUpdate};

/// Errors raised by run bookkeeping.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Database error.
    #[error("registry database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error while preparing the registry location.
    #[error("registry i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The run index was never registered.
    #[error("unknown run index: {0}")]
    UnknownRun(u32),

    /// A second terminal transition was attempted.
    #[error("run {index} already reached terminal status '{status}'")]
    AlreadyTerminal {
        /// Offending run index.
        index: u32,
        /// Terminal status already recorded.
        status: RunStatus,
    },

    /// Metrics can only be attached to completed runs.
    #[error("cannot attach metrics to run {index} with status '{status}'")]
    NotCompleted {
        /// Offending run index.
        index: u32,
        /// Status the run is actually in.
        status: RunStatus,
    },

    /// A stored status string was not recognized.
    #[error("corrupt status value '{0}' in registry")]
    CorruptStatus(String),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    run_index INTEGER PRIMARY KEY,
    status TEXT NOT NULL,
    artifact TEXT,
    metrics TEXT NOT NULL DEFAULT '{}',
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#;

/// SQLite-backed registry of every run attempted by one pipeline instance.
///
/// Mutation is append/update-only per run index; the terminal-once invariant
/// serializes conflicting updates to the same run, and different runs never
/// interact.
pub struct RunRegistry {
    conn: Connection,
}

impl RunRegistry {
    /// Open (or create) a registry at the given path.
    ///
    /// Existing rows are kept as-is, which is what allows an interrupted
    /// pipeline to resume: previously completed runs stay visible to
    /// scoring and selection.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let registry = Self { conn };
        registry.initialize_schema()?;
        Ok(registry)
    }

    /// Open an ephemeral in-memory registry (tests, throwaway pipelines).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let registry = Self { conn };
        registry.initialize_schema()?;
        Ok(registry)
    }

    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute(SCHEMA, [])?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status)",
            [],
        )?;
        Ok(())
    }

    /// Register a run as `pending`.
    ///
    /// Re-registering a known index is a no-op (returns `false`) so a
    /// resumed pipeline can blindly re-announce its planned runs.
    pub fn register(&mut self, index: u32) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO runs (run_index, status, metrics, created_at, updated_at)
             VALUES (?1, 'pending', '{}', ?2, ?2)",
            params![index, now],
        )?;
        if inserted > 0 {
            debug!(run = index, "registered run");
        }
        Ok(inserted > 0)
    }

    /// Apply one status transition.
    ///
    /// Fails with [`RegistryError::AlreadyTerminal`] if the run already
    /// reached `completed` or `failed`, and with
    /// [`RegistryError::UnknownRun`] for unregistered indices. Metrics in a
    /// `Failed` update are discarded: failed runs carry no metrics.
    pub fn update(&mut self, index: u32, update: RunUpdate) -> Result<()> {
        let current = self.get(index)?;
        if current.status.is_terminal() {
            return Err(RegistryError::AlreadyTerminal {
                index,
                status: current.status,
            });
        }

        let metrics_json = if update.status == RunStatus::Failed || update.metrics.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&update.metrics).unwrap_or_else(|_| "{}".to_string()))
        };
        let artifact = update.artifact.as_ref().map(|p| p.display().to_string());
        let now = chrono::Utc::now().timestamp();

        self.conn.execute(
            "UPDATE runs SET
                 status = ?2,
                 artifact = COALESCE(?3, artifact),
                 metrics = COALESCE(?4, metrics),
                 error = COALESCE(?5, error),
                 updated_at = ?6
             WHERE run_index = ?1",
            params![
                index,
                update.status.as_str(),
                artifact,
                metrics_json,
                update.error,
                now
            ],
        )?;

        match update.status {
            RunStatus::Completed => info!(run = index, "run completed"),
            RunStatus::Failed => {
                warn!(run = index, reason = update.error.as_deref(), "run failed");
            }
            _ => debug!(run = index, status = %update.status, "run status updated"),
        }
        Ok(())
    }

    /// Mark a run as running.
    pub fn mark_running(&mut self, index: u32) -> Result<()> {
        self.update(index, RunUpdate::running())
    }

    /// Mark a run as completed with its artifact and any engine metrics.
    pub fn complete(
        &mut self,
        index: u32,
        artifact: &Path,
        metrics: BTreeMap<String, f64>,
    ) -> Result<()> {
        self.update(index, RunUpdate::completed(artifact).with_metrics(metrics))
    }

    /// Mark a run as failed. Failure is data, not an error: the pipeline
    /// keeps going as long as some runs complete.
    pub fn fail(&mut self, index: u32, reason: &str) -> Result<()> {
        self.update(index, RunUpdate::failed(reason))
    }

    /// Merge additional metrics into a completed run.
    ///
    /// Metric attachment does not touch the status, so the terminal-once
    /// invariant is preserved while analysis stages enrich completed runs
    /// with computed scores.
    pub fn attach_metrics(&mut self, index: u32, metrics: &BTreeMap<String, f64>) -> Result<()> {
        let record = self.get(index)?;
        if record.status != RunStatus::Completed {
            return Err(RegistryError::NotCompleted {
                index,
                status: record.status,
            });
        }

        let mut merged = record.metrics;
        for (name, value) in metrics {
            merged.insert(name.clone(), *value);
        }
        let metrics_json =
            serde_json::to_string(&merged).unwrap_or_else(|_| "{}".to_string());
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "UPDATE runs SET metrics = ?2, updated_at = ?3 WHERE run_index = ?1",
            params![index, metrics_json, now],
        )?;
        Ok(())
    }

    /// Fetch one record.
    pub fn get(&self, index: u32) -> Result<RunRecord> {
        let row = self
            .conn
            .query_row(
                "SELECT run_index, status, artifact, metrics, error, created_at, updated_at
                 FROM runs WHERE run_index = ?1",
                params![index],
                row_tuple,
            )
            .optional()?;
        match row {
            Some(raw) => to_record(raw),
            None => Err(RegistryError::UnknownRun(index)),
        }
    }

    /// All records in dispatch order.
    pub fn all(&self) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_index, status, artifact, metrics, error, created_at, updated_at
             FROM runs ORDER BY run_index ASC",
        )?;
        let rows = stmt.query_map([], row_tuple)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(to_record(raw?)?);
        }
        Ok(records)
    }

    /// Completed records only, in dispatch order.
    pub fn completed(&self) -> Result<Vec<RunRecord>> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|record| record.status == RunStatus::Completed)
            .collect())
    }

    /// Number of registered runs.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// True when no run has been registered.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop every record. The only destructive operation; mirrors a user's
    /// explicit request to clear former results before re-phasing.
    pub fn clear(&mut self) -> Result<()> {
        let removed = self.conn.execute("DELETE FROM runs", [])?;
        warn!(removed, "cleared run registry");
        Ok(())
    }
}

type RawRow = (
    u32,
    String,
    Option<String>,
    String,
    Option<String>,
    i64,
    i64,
);

fn row_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn to_record(raw: RawRow) -> Result<RunRecord> {
    let (index, status, artifact, metrics, error, created_at, updated_at) = raw;
    let status =
        RunStatus::parse(&status).ok_or_else(|| RegistryError::CorruptStatus(status.clone()))?;
    let metrics: BTreeMap<String, f64> = serde_json::from_str(&metrics).unwrap_or_default();
    Ok(RunRecord {
        index,
        status,
        artifact: artifact.map(Into::into),
        metrics,
        error,
        created_at,
        updated_at,
    })
}
