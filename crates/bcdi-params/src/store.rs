use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::snapshot::{ConfigError, ParameterSnapshot};

/// Keys the orchestrator interprets itself (everything else passes through).
pub const RECOGNIZED_KEYS: &[&str] = &[
    "beamline_setup",
    "experiment_file_path",
    "sample_name",
    "scan",
    "dump_dir",
    "preprocess_shape",
    "voxel_reference_methods",
    "rocking_angle_binning",
    "light_loading",
    "hot_pixel_filter",
    "background_level",
    "hkl",
    "nb_run",
    "nb_run_keep",
    "support",
    "support_threshold",
    "support_update_period",
    "beta",
    "detwin",
    "rebin",
    "isosurface",
    "voxel_size",
    "flip",
    "sorting_criterion",
];

/// Recognized keys that are also consumed by the external engine and must be
/// written into its input file.
pub const ENGINE_KEYS: &[&str] = &[
    "nb_run",
    "nb_run_keep",
    "support",
    "support_threshold",
    "support_update_period",
    "beta",
    "detwin",
    "rebin",
];

/// Keys that must be present (in some layer) for any resolution to succeed.
pub const REQUIRED_KEYS: &[&str] = &["experiment_file_path", "sample_name", "scan"];

/// Accepted values for the `sorting_criterion` parameter.
pub const SORTING_CRITERIA: &[&str] = &["mean_to_max", "sharpness", "std", "llk", "llkf"];

/// Resolves layered configuration into immutable snapshots.
///
/// Layering order is defaults, then the user base configuration, then
/// per-call overrides; later layers win. Nested mappings merge key-wise
/// instead of being replaced wholesale.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    defaults: BTreeMap<String, Value>,
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self {
            defaults: builtin_defaults(),
        }
    }
}

impl ParameterStore {
    /// Store with the built-in defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with caller-provided defaults (tests, exotic beamlines).
    pub fn with_defaults(defaults: BTreeMap<String, Value>) -> Self {
        Self { defaults }
    }

    /// Merge all layers and validate the result.
    ///
    /// Pure over its inputs: neither the store nor the given layers are
    /// modified, and the returned snapshot is never retroactively edited.
    pub fn resolve(
        &self,
        base: &BTreeMap<String, Value>,
        overrides: &BTreeMap<String, Value>,
    ) -> Result<ParameterSnapshot, ConfigError> {
        let mut merged = self.defaults.clone();
        merge_layer(&mut merged, base);
        merge_layer(&mut merged, overrides);
        validate(&merged)?;
        debug!(parameters = merged.len(), "resolved parameter snapshot");
        Ok(ParameterSnapshot::new(merged))
    }

    /// Load a base configuration layer from a YAML parameter file.
    pub fn load_file(path: &Path) -> Result<BTreeMap<String, Value>, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        match value {
            Value::Object(map) => Ok(map.into_iter().collect()),
            _ => Err(ConfigError::InvalidType {
                key: "<document root>".to_string(),
                expected: "mapping",
            }),
        }
    }
}

fn builtin_defaults() -> BTreeMap<String, Value> {
    let mut defaults = BTreeMap::new();
    defaults.insert("beamline_setup".to_string(), json!("ID01"));
    defaults.insert("dump_dir".to_string(), json!("results"));
    defaults.insert("light_loading".to_string(), json!(false));
    defaults.insert("hot_pixel_filter".to_string(), json!(false));
    defaults.insert("background_level".to_string(), json!(0));
    defaults.insert("hkl".to_string(), json!([1, 1, 1]));
    defaults.insert(
        "voxel_reference_methods".to_string(),
        json!(["max", "com", "com"]),
    );
    defaults.insert("nb_run".to_string(), json!(20));
    defaults.insert("nb_run_keep".to_string(), json!(10));
    defaults.insert("support".to_string(), json!("auto"));
    defaults.insert("support_threshold".to_string(), json!(0.3));
    defaults.insert("support_update_period".to_string(), json!(20));
    defaults.insert("beta".to_string(), json!(0.9));
    defaults.insert("detwin".to_string(), json!(false));
    defaults.insert("rebin".to_string(), json!([1, 1, 1]));
    defaults.insert("isosurface".to_string(), json!(0.3));
    defaults.insert("flip".to_string(), json!(false));
    defaults.insert("sorting_criterion".to_string(), json!("mean_to_max"));
    defaults
}

fn merge_layer(target: &mut BTreeMap<String, Value>, layer: &BTreeMap<String, Value>) {
    for (key, incoming) in layer {
        let slot = target.entry(key.clone()).or_insert(Value::Null);
        merge_value(slot, incoming);
    }
}

fn merge_value(slot: &mut Value, incoming: &Value) {
    match (slot, incoming) {
        (Value::Object(existing), Value::Object(update)) => {
            for (key, value) in update {
                let nested = existing.entry(key.clone()).or_insert(Value::Null);
                merge_value(nested, value);
            }
        }
        (slot, value) => *slot = value.clone(),
    }
}

fn validate(merged: &BTreeMap<String, Value>) -> Result<(), ConfigError> {
    for key in REQUIRED_KEYS {
        if !merged.contains_key(*key) {
            return Err(ConfigError::MissingKey((*key).to_string()));
        }
    }

    expect_string(merged, "experiment_file_path")?;
    expect_string(merged, "sample_name")?;
    expect_string(merged, "dump_dir")?;
    if merged["scan"].as_u64().is_none() {
        return Err(ConfigError::InvalidType {
            key: "scan".to_string(),
            expected: "unsigned integer",
        });
    }

    if let Some(shape) = merged.get("preprocess_shape") {
        let items = shape.as_array().ok_or_else(|| ConfigError::InvalidType {
            key: "preprocess_shape".to_string(),
            expected: "array of unsigned integers",
        })?;
        if !(2..=3).contains(&items.len()) {
            return Err(ConfigError::InvalidShape {
                key: "preprocess_shape".to_string(),
                rank: items.len(),
            });
        }
        if items.iter().any(|item| item.as_u64().is_none()) {
            return Err(ConfigError::InvalidType {
                key: "preprocess_shape".to_string(),
                expected: "array of unsigned integers",
            });
        }
    }

    if let Some(criterion) = merged.get("sorting_criterion") {
        let name = criterion.as_str().ok_or_else(|| ConfigError::InvalidType {
            key: "sorting_criterion".to_string(),
            expected: "string",
        })?;
        if !SORTING_CRITERIA.contains(&name) {
            return Err(ConfigError::UnknownCriterion(name.to_string()));
        }
    }

    let nb_run = expect_opt_u64(merged, "nb_run")?;
    if nb_run == Some(0) {
        return Err(ConfigError::InvalidValue {
            key: "nb_run".to_string(),
            reason: "at least one stochastic run is required".to_string(),
        });
    }
    let nb_run_keep = expect_opt_u64(merged, "nb_run_keep")?;
    if let (Some(run), Some(keep)) = (nb_run, nb_run_keep) {
        if keep > run {
            return Err(ConfigError::InvalidValue {
                key: "nb_run_keep".to_string(),
                reason: format!("cannot keep {keep} results out of {run} runs"),
            });
        }
    }

    Ok(())
}

fn expect_string(merged: &BTreeMap<String, Value>, key: &str) -> Result<(), ConfigError> {
    match merged.get(key) {
        None | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ConfigError::InvalidType {
            key: key.to_string(),
            expected: "string",
        }),
    }
}

fn expect_opt_u64(merged: &BTreeMap<String, Value>, key: &str) -> Result<Option<u64>, ConfigError> {
    match merged.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidType {
                key: key.to_string(),
                expected: "unsigned integer",
            }),
    }
}
