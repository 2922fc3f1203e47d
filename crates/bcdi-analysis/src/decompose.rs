use ndarray::Array3;
use num_complex::Complex64;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised by mode decomposition.
#[derive(Debug, Error)]
pub enum DecompositionError {
    /// Decomposition needs at least two candidates to compare.
    #[error("mode decomposition needs at least 2 volumes, got {0}")]
    TooFewVolumes(usize),

    /// A candidate volume has a different shape than the first one.
    #[error("volume {index} has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Position of the offending volume in the stack.
        index: usize,
        /// Shape of the first volume.
        expected: (usize, usize, usize),
        /// Shape actually found.
        found: (usize, usize, usize),
    },

    /// The stack carries no signal at all.
    #[error("candidate stack has zero total power")]
    DegenerateStack,

    /// A candidate artifact could not be loaded.
    #[error("failed to load candidate artifact: {0}")]
    Artifact(#[from] anyhow::Error),
}

/// Reads a reconstruction volume from an artifact on disk.
///
/// File format handling lives behind this seam; the decomposer itself never
/// opens files.
pub trait ArtifactLoader: Send + Sync {
    /// Load the complex reconstruction volume stored at `path`.
    fn load(&self, path: &Path) -> anyhow::Result<Array3<Complex64>>;
}

/// Consensus reconstruction distilled from a candidate stack.
#[derive(Debug, Clone)]
pub struct ConsensusArtifact {
    /// Dominant-mode volume, scaled like one input reconstruction.
    pub volume: Array3<Complex64>,
    /// Fraction of total stack power captured by the dominant mode, in
    /// `[0, 1]`. Near 1 means the candidates agree.
    pub mode_weight: f64,
}

/// Collapses shape-compatible candidate volumes into a single consensus.
///
/// Each reconstruction carries an arbitrary global phase and may sit at a
/// translated position, so the stack is aligned first: every volume is
/// rotated by the conjugate phase of its strongest voxel and shifted to the
/// center of mass of the first candidate. The dominant mode then falls out
/// of a power iteration on the Hermitian cross-correlation matrix.
#[derive(Debug, Clone)]
pub struct ModeDecomposer {
    max_iterations: usize,
    tolerance: f64,
}

impl Default for ModeDecomposer {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-12,
        }
    }
}

impl ModeDecomposer {
    /// Decomposer with default iteration limits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the candidate artifacts and decompose them.
    pub fn decompose_artifacts(
        &self,
        loader: &dyn ArtifactLoader,
        paths: &[impl AsRef<Path>],
    ) -> Result<ConsensusArtifact, DecompositionError> {
        let mut stack = Vec::with_capacity(paths.len());
        for path in paths {
            stack.push(loader.load(path.as_ref())?);
        }
        self.decompose(&stack)
    }

    /// Extract the dominant mode of a candidate stack.
    pub fn decompose(
        &self,
        stack: &[Array3<Complex64>],
    ) -> Result<ConsensusArtifact, DecompositionError> {
        if stack.len() < 2 {
            return Err(DecompositionError::TooFewVolumes(stack.len()));
        }
        let expected = stack[0].dim();
        for (index, volume) in stack.iter().enumerate().skip(1) {
            if volume.dim() != expected {
                return Err(DecompositionError::ShapeMismatch {
                    index,
                    expected,
                    found: volume.dim(),
                });
            }
        }

        let aligned = self.align(stack)?;
        let matrix = cross_matrix(&aligned);
        let trace: f64 = (0..aligned.len()).map(|i| matrix[i][i].re).sum();
        if trace <= 0.0 {
            return Err(DecompositionError::DegenerateStack);
        }

        let (eigenvector, eigenvalue) = self.power_iteration(&matrix);
        let mode_weight = (eigenvalue / trace).clamp(0.0, 1.0);
        debug!(
            candidates = aligned.len(),
            eigenvalue, trace, "dominant mode extracted"
        );

        // Weighted sum of the aligned volumes; the scale factor makes an
        // all-identical stack return one of its inputs unchanged.
        let scale: f64 = eigenvector.iter().map(|w| w.norm()).sum();
        let mut volume: Array3<Complex64> = Array3::zeros(expected);
        for (weight, candidate) in eigenvector.iter().zip(&aligned) {
            let coefficient = weight.conj() / scale;
            volume.zip_mut_with(candidate, |out, &voxel| *out += coefficient * voxel);
        }

        info!(candidates = aligned.len(), mode_weight, "mode decomposition done");
        Ok(ConsensusArtifact {
            volume,
            mode_weight,
        })
    }

    /// Remove global phases and integer translations from the stack.
    fn align(
        &self,
        stack: &[Array3<Complex64>],
    ) -> Result<Vec<Array3<Complex64>>, DecompositionError> {
        let reference_com = center_of_mass(&stack[0])
            .ok_or(DecompositionError::DegenerateStack)?;

        let mut aligned = Vec::with_capacity(stack.len());
        for volume in stack {
            let phase = strongest_voxel_phase(volume)
                .ok_or(DecompositionError::DegenerateStack)?;
            let rotated = volume.mapv(|voxel| voxel * phase.conj());

            let com = center_of_mass(&rotated)
                .ok_or(DecompositionError::DegenerateStack)?;
            let shift = [
                (reference_com[0] - com[0]).round() as i64,
                (reference_com[1] - com[1]).round() as i64,
                (reference_com[2] - com[2]).round() as i64,
            ];
            aligned.push(roll(&rotated, shift));
        }
        Ok(aligned)
    }

    /// Principal eigenpair of a small Hermitian positive semi-definite
    /// matrix. The matrix side is the candidate count, so a plain power
    /// iteration converges in a handful of steps.
    fn power_iteration(&self, matrix: &[Vec<Complex64>]) -> (Vec<Complex64>, f64) {
        let n = matrix.len();
        let mut vector = vec![Complex64::new(1.0 / (n as f64).sqrt(), 0.0); n];

        for _ in 0..self.max_iterations {
            let next = multiply(matrix, &vector);
            let norm = norm(&next);
            if norm <= self.tolerance {
                break;
            }
            let next: Vec<Complex64> = next.iter().map(|value| *value / norm).collect();
            let delta: f64 = next
                .iter()
                .zip(&vector)
                .map(|(a, b)| (a - b).norm_sqr())
                .sum();
            vector = next;
            if delta < self.tolerance {
                break;
            }
        }

        // Rayleigh quotient; real for Hermitian matrices.
        let product = multiply(matrix, &vector);
        let eigenvalue: f64 = vector
            .iter()
            .zip(&product)
            .map(|(a, b)| (a.conj() * *b).re)
            .sum();
        (vector, eigenvalue)
    }
}

fn multiply(matrix: &[Vec<Complex64>], vector: &[Complex64]) -> Vec<Complex64> {
    matrix
        .iter()
        .map(|row| {
            row.iter()
                .zip(vector)
                .map(|(entry, value)| entry * value)
                .sum()
        })
        .collect()
}

fn norm(vector: &[Complex64]) -> f64 {
    vector.iter().map(|value| value.norm_sqr()).sum::<f64>().sqrt()
}

/// Hermitian matrix of pairwise inner products.
fn cross_matrix(stack: &[Array3<Complex64>]) -> Vec<Vec<Complex64>> {
    let n = stack.len();
    let mut matrix = vec![vec![Complex64::new(0.0, 0.0); n]; n];
    for i in 0..n {
        for j in i..n {
            let product: Complex64 = stack[i]
                .iter()
                .zip(stack[j].iter())
                .map(|(a, b)| a.conj() * *b)
                .sum();
            matrix[i][j] = product;
            if i != j {
                matrix[j][i] = product.conj();
            }
        }
    }
    matrix
}

/// Unit-magnitude phase of the highest-amplitude voxel, `None` for an
/// all-zero volume.
fn strongest_voxel_phase(volume: &Array3<Complex64>) -> Option<Complex64> {
    let mut best: Option<Complex64> = None;
    let mut best_amp = 0.0_f64;
    for &voxel in volume {
        let amp = voxel.norm();
        if amp > best_amp {
            best_amp = amp;
            best = Some(voxel / amp);
        }
    }
    best
}

/// Amplitude-weighted center of mass, `None` for an all-zero volume.
fn center_of_mass(volume: &Array3<Complex64>) -> Option<[f64; 3]> {
    let mut total = 0.0_f64;
    let mut moments = [0.0_f64; 3];
    for ((i, j, k), voxel) in volume.indexed_iter() {
        let amp = voxel.norm();
        total += amp;
        moments[0] += i as f64 * amp;
        moments[1] += j as f64 * amp;
        moments[2] += k as f64 * amp;
    }
    if total == 0.0 {
        return None;
    }
    Some([moments[0] / total, moments[1] / total, moments[2] / total])
}

/// Circularly shift a volume by whole voxels along each axis.
fn roll(volume: &Array3<Complex64>, shift: [i64; 3]) -> Array3<Complex64> {
    if shift == [0, 0, 0] {
        return volume.clone();
    }
    let (nx, ny, nz) = volume.dim();
    let dims = [nx as i64, ny as i64, nz as i64];
    let mut rolled = Array3::zeros(volume.dim());
    for ((i, j, k), &voxel) in volume.indexed_iter() {
        let di = (i as i64 + shift[0]).rem_euclid(dims[0]) as usize;
        let dj = (j as i64 + shift[1]).rem_euclid(dims[1]) as usize;
        let dk = (k as i64 + shift[2]).rem_euclid(dims[2]) as usize;
        rolled[[di, dj, dk]] = voxel;
    }
    rolled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume_from(values: &[Complex64]) -> Array3<Complex64> {
        let mut volume = Array3::zeros((1, 1, values.len()));
        for (i, &value) in values.iter().enumerate() {
            volume[[0, 0, i]] = value;
        }
        volume
    }

    fn real(values: &[f64]) -> Array3<Complex64> {
        volume_from(
            &values
                .iter()
                .map(|&v| Complex64::new(v, 0.0))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn fewer_than_two_volumes_is_an_error() {
        let decomposer = ModeDecomposer::new();
        assert!(matches!(
            decomposer.decompose(&[real(&[1.0, 2.0])]),
            Err(DecompositionError::TooFewVolumes(1))
        ));
        assert!(matches!(
            decomposer.decompose(&[]),
            Err(DecompositionError::TooFewVolumes(0))
        ));
    }

    #[test]
    fn shape_mismatch_names_the_offender() {
        let decomposer = ModeDecomposer::new();
        let err = decomposer
            .decompose(&[real(&[1.0, 2.0]), real(&[1.0, 2.0, 3.0])])
            .unwrap_err();
        assert!(matches!(
            err,
            DecompositionError::ShapeMismatch { index: 1, .. }
        ));
    }

    #[test]
    fn identical_stack_has_unit_weight_and_returns_the_input() {
        let decomposer = ModeDecomposer::new();
        let v = real(&[0.0, 2.0, 1.0, 0.0]);
        let consensus = decomposer
            .decompose(&[v.clone(), v.clone(), v.clone()])
            .expect("decompose");

        assert!((consensus.mode_weight - 1.0).abs() < 1e-9);
        for (a, b) in consensus.volume.iter().zip(v.iter()) {
            assert!((a - b).norm() < 1e-9);
        }
    }

    #[test]
    fn global_phase_differences_do_not_reduce_the_weight() {
        let decomposer = ModeDecomposer::new();
        let v = real(&[0.0, 2.0, 1.0, 0.0]);
        let rotated = v.mapv(|voxel| voxel * Complex64::from_polar(1.0, 1.1));

        let consensus = decomposer.decompose(&[v, rotated]).expect("decompose");
        assert!((consensus.mode_weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn integer_translations_are_registered_out() {
        let decomposer = ModeDecomposer::new();
        let v = real(&[0.0, 2.0, 1.0, 0.0]);
        let shifted = roll(&v, [0, 0, 1]);

        let consensus = decomposer.decompose(&[v, shifted]).expect("decompose");
        assert!((consensus.mode_weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disagreeing_candidates_split_the_weight() {
        let decomposer = ModeDecomposer::new();
        // Same amplitude pattern, orthogonal structure, so no alignment step
        // can reconcile them.
        let a = real(&[1.0, 1.0]);
        let b = real(&[1.0, -1.0]);

        let consensus = decomposer.decompose(&[a, b]).expect("decompose");
        assert!((consensus.mode_weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn all_zero_stack_is_degenerate() {
        let decomposer = ModeDecomposer::new();
        let zero: Array3<Complex64> = Array3::zeros((1, 1, 4));
        assert!(matches!(
            decomposer.decompose(&[zero.clone(), zero]),
            Err(DecompositionError::DegenerateStack)
        ));
    }

    #[test]
    fn artifacts_route_through_the_loader_seam() {
        struct StaticLoader(Array3<Complex64>);
        impl ArtifactLoader for StaticLoader {
            fn load(&self, _path: &Path) -> anyhow::Result<Array3<Complex64>> {
                Ok(self.0.clone())
            }
        }

        let decomposer = ModeDecomposer::new();
        let loader = StaticLoader(real(&[0.0, 2.0, 1.0, 0.0]));
        let consensus = decomposer
            .decompose_artifacts(&loader, &["run_0000.cxi", "run_0001.cxi"])
            .expect("decompose");
        assert!((consensus.mode_weight - 1.0).abs() < 1e-9);
    }
}
