use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::{ENGINE_KEYS, RECOGNIZED_KEYS};

/// Configuration errors raised during parameter resolution or access.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required parameter is absent from every layer.
    #[error("missing required parameter: {0}")]
    MissingKey(String),

    /// A parameter is present but carries the wrong type.
    #[error("parameter '{key}' has invalid type, expected {expected}")]
    InvalidType {
        /// Offending parameter name.
        key: String,
        /// Expected type description.
        expected: &'static str,
    },

    /// A shape tuple is outside the allowed rank range.
    #[error("parameter '{key}' must have rank 2 or 3, got {rank}")]
    InvalidShape {
        /// Offending parameter name.
        key: String,
        /// Rank found in the document.
        rank: usize,
    },

    /// A parameter value is out of its allowed domain.
    #[error("parameter '{key}' is invalid: {reason}")]
    InvalidValue {
        /// Offending parameter name.
        key: String,
        /// Human-readable constraint description.
        reason: String,
    },

    /// Unknown scoring criterion name.
    #[error(
        "unknown sorting criterion '{0}', expected one of \
         mean_to_max, sharpness, std, llk, llkf"
    )]
    UnknownCriterion(String),

    /// Parameter file could not be read or written.
    #[error("parameter file i/o failed for {path}")]
    Io {
        /// File path involved.
        path: PathBuf,
        /// Underlying i/o error.
        #[source]
        source: std::io::Error,
    },

    /// Parameter file is not a valid YAML mapping.
    #[error("failed to parse parameter file {path}")]
    Parse {
        /// File path involved.
        path: PathBuf,
        /// Underlying parser error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Immutable, fully resolved parameter set handed to one stage invocation.
///
/// A snapshot is produced only by [`crate::ParameterStore::resolve`] and is
/// never mutated afterwards; a stage that needs different values must
/// request a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    values: BTreeMap<String, Value>,
}

impl ParameterSnapshot {
    pub(crate) fn new(values: BTreeMap<String, Value>) -> Self {
        Self { values }
    }

    /// Raw value lookup.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// True if the key is present in any layer.
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of resolved parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the snapshot carries no parameters.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all resolved key/value pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Required string parameter.
    pub fn str(&self, key: &str) -> Result<&str, ConfigError> {
        match self.get(key) {
            None => Err(ConfigError::MissingKey(key.to_string())),
            Some(Value::String(s)) => Ok(s),
            Some(_) => Err(ConfigError::InvalidType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    /// Required unsigned integer parameter.
    pub fn u64(&self, key: &str) -> Result<u64, ConfigError> {
        match self.get(key) {
            None => Err(ConfigError::MissingKey(key.to_string())),
            Some(value) => value.as_u64().ok_or_else(|| ConfigError::InvalidType {
                key: key.to_string(),
                expected: "unsigned integer",
            }),
        }
    }

    /// Required floating-point parameter (integers widen).
    pub fn f64(&self, key: &str) -> Result<f64, ConfigError> {
        match self.get(key) {
            None => Err(ConfigError::MissingKey(key.to_string())),
            Some(value) => value.as_f64().ok_or_else(|| ConfigError::InvalidType {
                key: key.to_string(),
                expected: "number",
            }),
        }
    }

    /// Required boolean parameter.
    pub fn bool(&self, key: &str) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Err(ConfigError::MissingKey(key.to_string())),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(ConfigError::InvalidType {
                key: key.to_string(),
                expected: "boolean",
            }),
        }
    }

    /// Optional string parameter.
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Optional unsigned integer parameter.
    pub fn opt_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// Optional floating-point parameter.
    pub fn opt_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    /// Optional boolean parameter.
    pub fn opt_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Shape tuple parameter: an array of unsigned integers.
    pub fn shape(&self, key: &str) -> Result<Vec<u64>, ConfigError> {
        let value = self
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;
        let items = value.as_array().ok_or_else(|| ConfigError::InvalidType {
            key: key.to_string(),
            expected: "array of unsigned integers",
        })?;
        items
            .iter()
            .map(|item| {
                item.as_u64().ok_or_else(|| ConfigError::InvalidType {
                    key: key.to_string(),
                    expected: "array of unsigned integers",
                })
            })
            .collect()
    }

    /// Parameters forwarded verbatim to the external phase-retrieval engine.
    ///
    /// This is the passthrough channel: every key the orchestrator does not
    /// recognize, plus the recognized phase-retrieval keys the engine itself
    /// consumes.
    pub fn engine_parameters(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter().filter(|(key, _)| {
            ENGINE_KEYS.contains(&key.as_str()) || !RECOGNIZED_KEYS.contains(&key.as_str())
        })
    }

    /// Persist the snapshot as a YAML document (one file per scan).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let text = serde_yaml::to_string(&self.values).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
