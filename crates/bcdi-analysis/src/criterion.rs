use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::scorer::ScoringError;

/// Criterion used to rank reconstructions. Lower is better for every one.
///
/// `llk` and `llkf` come from the engine itself (Poisson log-likelihood,
/// regular and free); the other three are derived from the reconstruction
/// amplitude after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortingCriterion {
    /// Distance between the max amplitude and the fitted mean of the
    /// in-support amplitude distribution. Small means homogeneous.
    MeanToMax,
    /// Sum of fourth powers of the in-support amplitude.
    Sharpness,
    /// Standard deviation of the in-support amplitude.
    Std,
    /// Engine-reported Poisson log-likelihood.
    Llk,
    /// Engine-reported free log-likelihood.
    Llkf,
}

impl SortingCriterion {
    /// All criteria, in the order user documentation lists them.
    pub const ALL: [Self; 5] = [
        Self::MeanToMax,
        Self::Sharpness,
        Self::Std,
        Self::Llk,
        Self::Llkf,
    ];

    /// Name used in parameter files and as the metric key in run records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MeanToMax => "mean_to_max",
            Self::Sharpness => "sharpness",
            Self::Std => "std",
            Self::Llk => "llk",
            Self::Llkf => "llkf",
        }
    }
}

impl FromStr for SortingCriterion {
    type Err = ScoringError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "mean_to_max" => Ok(Self::MeanToMax),
            "sharpness" => Ok(Self::Sharpness),
            "std" => Ok(Self::Std),
            "llk" => Ok(Self::Llk),
            "llkf" => Ok(Self::Llkf),
            other => Err(ScoringError::UnknownCriterion(other.to_string())),
        }
    }
}

impl fmt::Display for SortingCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
