#![warn(missing_docs)]

//! bcdi-registry - single source of truth for phase-retrieval run bookkeeping.
//!
//! Every stochastic run attempted by the pipeline gets exactly one record
//! here. Records move through `pending -> running -> completed | failed` and
//! a terminal status is set exactly once; history is never rewritten. The
//! registry is SQLite-backed so an interrupted pipeline can be rebuilt from
//! disk and resume where it left off.

/// Run record and status types.
pub mod record;
/// SQLite-backed registry operations.
pub mod registry;

pub use record::{RunRecord, RunStatus, RunUpdate};
pub use registry::{RegistryError, Result, RunRegistry};
