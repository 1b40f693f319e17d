//! FastICA-based artifact removal.
//!
//! Decomposes a trial into independent components, flags eye/muscle
//! components with a kurtosis + frontal-dominance heuristic, zeroes them,
//! and back-projects. The decomposition whitens with a Jacobi
//! eigendecomposition of the channel covariance and runs symmetric FastICA
//! with a tanh contrast function.

use ndarray::{Array1, Array2, Axis};
use tracing::debug;

use neuroauth_core::error::{CoreResult, SignalError};
use neuroauth_core::utils::Xorshift64;

/// Configuration for ICA artifact removal.
#[derive(Debug, Clone)]
pub struct IcaConfig {
    /// Number of components; clamped to `min(max_components, C - 1)`.
    pub max_components: usize,
    /// FastICA iteration cap.
    pub max_iterations: usize,
    /// Convergence tolerance on the direction change per component.
    pub tolerance: f64,
    /// Components with excess kurtosis above this are artifact candidates.
    pub kurtosis_threshold: f64,
    /// Fraction of scalp-projection energy on frontal channels above which
    /// a component is an artifact candidate.
    pub frontal_dominance_threshold: f64,
    /// At most this many components are excluded per trial.
    pub max_excluded: usize,
    /// Seed for the unmixing-matrix initialisation.
    pub seed: u64,
}

impl Default for IcaConfig {
    fn default() -> Self {
        Self {
            max_components: 15,
            max_iterations: 200,
            tolerance: 1e-4,
            kurtosis_threshold: 5.0,
            frontal_dominance_threshold: 0.6,
            max_excluded: 2,
            seed: 42,
        }
    }
}

/// Summary of one artifact-removal pass.
#[derive(Debug, Clone)]
pub struct IcaReport {
    /// Components extracted.
    pub n_components: usize,
    /// Indices of components that were zeroed.
    pub excluded: Vec<usize>,
}

/// Remove artifact components from a `(C, T)` signal.
///
/// `frontal_indices` are the rows corresponding to frontal electrodes
/// (`Fp*`/`AF*`), used by the eye-blink heuristic. Returns the cleaned
/// signal and a report of what was removed.
///
/// # Errors
///
/// [`SignalError::Filter`] when the decomposition degenerates (rank-deficient
/// covariance, non-finite values).
pub fn remove_artifacts(
    signal: &Array2<f32>,
    frontal_indices: &[usize],
    config: &IcaConfig,
) -> CoreResult<(Array2<f32>, IcaReport)> {
    let n_channels = signal.nrows();
    let n_samples = signal.ncols();
    if n_channels < 2 || n_samples < n_channels * 4 {
        // Not enough data to estimate a decomposition; pass through.
        return Ok((
            signal.clone(),
            IcaReport {
                n_components: 0,
                excluded: Vec::new(),
            },
        ));
    }
    let n_components = config.max_components.min(n_channels - 1).max(1);

    // Center per channel.
    let mut centered = signal.mapv(f64::from);
    let means: Array1<f64> = centered
        .axis_iter(Axis(0))
        .map(|row| row.sum() / n_samples as f64)
        .collect();
    for (mut row, &mean) in centered.axis_iter_mut(Axis(0)).zip(means.iter()) {
        row.mapv_inplace(|v| v - mean);
    }

    // Whiten: covariance eigendecomposition, keep the top components.
    let covariance = centered.dot(&centered.t()) / n_samples as f64;
    let (eigenvalues, eigenvectors) = jacobi_eigen(&covariance, 100, 1e-12);
    let mut order: Vec<usize> = (0..n_channels).collect();
    order.sort_by(|&a, &b| {
        eigenvalues[b]
            .partial_cmp(&eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let kept = &order[..n_components];
    if eigenvalues[kept[n_components - 1]] <= 1e-12 {
        return Err(SignalError::filter("rank-deficient covariance in ICA whitening").into());
    }

    // Whitening matrix K (m, C) and dewhitening D (C, m).
    let mut whitening = Array2::<f64>::zeros((n_components, n_channels));
    let mut dewhitening = Array2::<f64>::zeros((n_channels, n_components));
    for (row, &index) in kept.iter().enumerate() {
        let scale = eigenvalues[index].sqrt();
        for channel in 0..n_channels {
            whitening[[row, channel]] = eigenvectors[[channel, index]] / scale;
            dewhitening[[channel, row]] = eigenvectors[[channel, index]] * scale;
        }
    }
    let whitened = whitening.dot(&centered); // (m, T)

    // Symmetric FastICA with tanh contrast.
    let unmixing = fast_ica(&whitened, config)?;
    let sources = unmixing.dot(&whitened); // (m, T)

    // Scalp projections of each component: columns of D * Wᵀ.
    let mixing = dewhitening.dot(&unmixing.t()); // (C, m)

    // Artifact heuristic: high kurtosis or frontal-dominated projection.
    let mut candidates: Vec<(usize, f64)> = Vec::new();
    for component in 0..n_components {
        let source = sources.row(component).to_vec();
        let kurt = excess_kurtosis(&source);
        let column = mixing.column(component);
        let total_energy: f64 = column.iter().map(|v| v * v).sum();
        let frontal_energy: f64 = frontal_indices
            .iter()
            .filter(|&&i| i < n_channels)
            .map(|&i| column[i] * column[i])
            .sum();
        let frontal_fraction = if total_energy > 1e-12 {
            frontal_energy / total_energy
        } else {
            0.0
        };
        if kurt > config.kurtosis_threshold
            || frontal_fraction > config.frontal_dominance_threshold
        {
            candidates.push((component, kurt));
        }
    }
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let excluded: Vec<usize> = candidates
        .into_iter()
        .take(config.max_excluded)
        .map(|(index, _)| index)
        .collect();

    debug!(
        n_components,
        excluded = excluded.len(),
        "ICA artifact removal"
    );

    // Back-project with excluded sources zeroed.
    let mut clean_sources = sources;
    for &component in &excluded {
        clean_sources.row_mut(component).fill(0.0);
    }
    let mut reconstructed = mixing.dot(&clean_sources); // (C, T)
    for (mut row, &mean) in reconstructed.axis_iter_mut(Axis(0)).zip(means.iter()) {
        row.mapv_inplace(|v| v + mean);
    }

    if !reconstructed.iter().all(|v| v.is_finite()) {
        return Err(SignalError::NonFinite { stage: "ica" }.into());
    }

    Ok((
        reconstructed.mapv(|v| v as f32),
        IcaReport {
            n_components,
            excluded,
        },
    ))
}

/// Symmetric FastICA on whitened data `(m, T)`; returns the orthogonal
/// unmixing matrix `(m, m)`.
fn fast_ica(whitened: &Array2<f64>, config: &IcaConfig) -> CoreResult<Array2<f64>> {
    let m = whitened.nrows();
    let t = whitened.ncols() as f64;
    let mut rng = Xorshift64::new(config.seed);

    let mut unmixing = Array2::<f64>::zeros((m, m));
    for value in unmixing.iter_mut() {
        *value = f64::from(rng.next_gaussian());
    }
    symmetric_decorrelate(&mut unmixing)?;

    for _ in 0..config.max_iterations {
        let projected = unmixing.dot(whitened); // (m, T)
        let g = projected.mapv(f64::tanh);
        let g_prime_mean: Array1<f64> = g
            .axis_iter(Axis(0))
            .map(|row| row.iter().map(|v| 1.0 - v * v).sum::<f64>() / t)
            .collect();

        // W+ = E[g(WZ) Zᵀ] - diag(E[g'(WZ)]) W
        let mut updated = g.dot(&whitened.t()) / t;
        for (row, &gp) in g_prime_mean.iter().enumerate() {
            for column in 0..m {
                updated[[row, column]] -= gp * unmixing[[row, column]];
            }
        }
        symmetric_decorrelate(&mut updated)?;

        // Convergence: directions stop rotating.
        let mut max_change = 0.0f64;
        for row in 0..m {
            let dot: f64 = (0..m)
                .map(|column| updated[[row, column]] * unmixing[[row, column]])
                .sum();
            max_change = max_change.max((1.0 - dot.abs()).abs());
        }
        unmixing = updated;
        if max_change < config.tolerance {
            break;
        }
    }
    Ok(unmixing)
}

/// W ← (W Wᵀ)^(-1/2) W, making the rows orthonormal.
fn symmetric_decorrelate(w: &mut Array2<f64>) -> CoreResult<()> {
    let gram = w.dot(&w.t());
    let m = gram.nrows();
    let (eigenvalues, eigenvectors) = jacobi_eigen(&gram, 100, 1e-12);
    if eigenvalues.iter().any(|&v| v <= 1e-12) {
        return Err(SignalError::filter("degenerate unmixing matrix in ICA").into());
    }
    let mut inv_sqrt = Array2::<f64>::zeros((m, m));
    for i in 0..m {
        for j in 0..m {
            let mut sum = 0.0;
            for k in 0..m {
                sum += eigenvectors[[i, k]] * eigenvectors[[j, k]] / eigenvalues[k].sqrt();
            }
            inv_sqrt[[i, j]] = sum;
        }
    }
    *w = inv_sqrt.dot(w);
    Ok(())
}

/// Cyclic Jacobi eigendecomposition of a symmetric matrix.
///
/// Returns `(eigenvalues, eigenvectors)` with eigenvectors in columns,
/// unordered.
fn jacobi_eigen(matrix: &Array2<f64>, max_sweeps: usize, tolerance: f64) -> (Array1<f64>, Array2<f64>) {
    let n = matrix.nrows();
    let mut a = matrix.clone();
    let mut v = Array2::<f64>::eye(n);

    for _ in 0..max_sweeps {
        let mut off_diagonal = 0.0f64;
        for p in 0..n {
            for q in (p + 1)..n {
                off_diagonal += a[[p, q]] * a[[p, q]];
            }
        }
        if off_diagonal.sqrt() < tolerance {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                if a[[p, q]].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[[q, q]] - a[[p, p]]) / (2.0 * a[[p, q]]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[[k, p]];
                    let akq = a[[k, q]];
                    a[[k, p]] = c * akp - s * akq;
                    a[[k, q]] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[[p, k]];
                    let aqk = a[[q, k]];
                    a[[p, k]] = c * apk - s * aqk;
                    a[[q, k]] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[[k, p]];
                    let vkq = v[[k, q]];
                    v[[k, p]] = c * vkp - s * vkq;
                    v[[k, q]] = s * vkp + c * vkq;
                }
            }
        }
    }

    let eigenvalues: Array1<f64> = (0..n).map(|i| a[[i, i]]).collect();
    (eigenvalues, v)
}

/// Excess kurtosis (0 for a Gaussian).
fn excess_kurtosis(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    if n < 4.0 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n;
    let m2 = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let m4 = values.iter().map(|v| (v - mean).powi(4)).sum::<f64>() / n;
    if m2 < 1e-12 {
        return 0.0;
    }
    m4 / (m2 * m2) - 3.0
}
