#![warn(missing_docs)]

//! bcdi-params - layered parameter resolution for the BCDI pipeline.
//!
//! Parameters come from three layers (built-in defaults, the user's base
//! configuration document, per-call overrides) and are merged into an
//! immutable [`ParameterSnapshot`]. Keys the orchestrator does not recognize
//! pass through untouched so the external phase-retrieval engine keeps its
//! own vocabulary.

/// Scan output directory layout.
pub mod layout;
/// Immutable parameter snapshots and typed accessors.
pub mod snapshot;
/// Parameter layering, defaults, and validation.
pub mod store;

pub use layout::ScanLayout;
pub use snapshot::{ConfigError, ParameterSnapshot};
pub use store::{
    ParameterStore, ENGINE_KEYS, RECOGNIZED_KEYS, REQUIRED_KEYS, SORTING_CRITERIA,
};
