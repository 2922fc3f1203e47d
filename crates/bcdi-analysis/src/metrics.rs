use ndarray::Array3;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::criterion::SortingCriterion;
use crate::scorer::ScoringError;

const HISTOGRAM_BINS: usize = 100;

/// Amplitude-derived quality metrics for one reconstruction.
///
/// All three follow lower-is-better, matching the engine-reported
/// log-likelihoods, so any criterion ranks the same direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AmplitudeMetrics {
    /// Max amplitude minus the fitted mean of the in-support amplitude
    /// histogram. Small when the object density is homogeneous.
    pub mean_to_max: f64,
    /// Sum of fourth powers of the in-support amplitude.
    pub sharpness: f64,
    /// Standard deviation of the in-support amplitude.
    pub std: f64,
}

impl AmplitudeMetrics {
    /// Metric map keyed the way [`SortingCriterion`] expects, ready to be
    /// attached to a run record.
    pub fn to_map(self) -> BTreeMap<String, f64> {
        let mut map = BTreeMap::new();
        map.insert(
            SortingCriterion::MeanToMax.as_str().to_string(),
            self.mean_to_max,
        );
        map.insert(
            SortingCriterion::Sharpness.as_str().to_string(),
            self.sharpness,
        );
        map.insert(SortingCriterion::Std.as_str().to_string(), self.std);
        map
    }
}

/// Compute amplitude metrics for a reconstruction volume.
///
/// The support is every voxel whose amplitude reaches `isosurface` times the
/// maximum amplitude. The mean entering `mean_to_max` is the centroid of a
/// histogram of the in-support amplitudes, which tracks a Gaussian fit of
/// the amplitude distribution without needing a solver.
pub fn compute_amplitude_metrics(
    volume: &Array3<Complex64>,
    isosurface: f64,
) -> Result<AmplitudeMetrics, ScoringError> {
    if !(0.0..1.0).contains(&isosurface) || isosurface == 0.0 {
        return Err(ScoringError::InvalidIsosurface(isosurface));
    }

    let max_amp = volume
        .iter()
        .map(|voxel| voxel.norm())
        .fold(0.0_f64, f64::max);
    if max_amp == 0.0 {
        return Err(ScoringError::EmptySupport);
    }

    let threshold = isosurface * max_amp;
    let support: Vec<f64> = volume
        .iter()
        .map(|voxel| voxel.norm())
        .filter(|&amp| amp >= threshold)
        .collect();
    if support.is_empty() {
        return Err(ScoringError::EmptySupport);
    }

    let count = support.len() as f64;
    let mean = support.iter().sum::<f64>() / count;
    let variance = support
        .iter()
        .map(|amp| (amp - mean).powi(2))
        .sum::<f64>()
        / count;
    let sharpness = support.iter().map(|amp| amp.powi(4)).sum::<f64>();
    let fitted_mean = histogram_centroid(&support, threshold, max_amp);

    Ok(AmplitudeMetrics {
        mean_to_max: max_amp - fitted_mean,
        sharpness,
        std: variance.sqrt(),
    })
}

/// Centroid of the in-support amplitude histogram.
///
/// For a Gaussian-shaped amplitude distribution this coincides with the
/// fitted peak position.
fn histogram_centroid(support: &[f64], low: f64, high: f64) -> f64 {
    let span = high - low;
    if span <= 0.0 {
        return high;
    }
    let width = span / HISTOGRAM_BINS as f64;
    let mut counts = [0u64; HISTOGRAM_BINS];
    for &amp in support {
        let bin = (((amp - low) / width) as usize).min(HISTOGRAM_BINS - 1);
        counts[bin] += 1;
    }
    let total: u64 = counts.iter().sum();
    let weighted: f64 = counts
        .iter()
        .enumerate()
        .map(|(bin, &count)| (low + (bin as f64 + 0.5) * width) * count as f64)
        .sum();
    weighted / total as f64
}
