//! Training objectives.
//!
//! Phase 1 uses plain cross-entropy on the warmup classification head.
//! Phase 2 uses a proxy-anchor metric loss over unit-norm embeddings: each
//! user owns a learned proxy vector; embeddings are pulled toward their own
//! proxy and pushed from the others with a margin and temperature.

use ndarray::{Array1, Array2, Axis};

use neuroauth_core::error::{CoreError, CoreResult};
use neuroauth_core::utils::Xorshift64;

/// Cross-entropy over raw logits for one sample.
///
/// Returns `(loss, grad_logits)` with the usual `softmax − one_hot`
/// gradient.
#[must_use]
pub fn cross_entropy(logits: &Array1<f32>, label: usize) -> (f32, Array1<f32>) {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.mapv(|l| (l - max_logit).exp());
    let sum: f32 = exp.sum();
    let log_sum = sum.ln() + max_logit;
    let loss = log_sum - logits[label];
    let mut grad = exp.mapv(|e| e / sum);
    grad[label] -= 1.0;
    (loss, grad)
}

/// Argmax of a logit vector.
#[must_use]
pub fn argmax(logits: &Array1<f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (index, &value) in logits.iter().enumerate() {
        if value > best_value {
            best_value = value;
            best = index;
        }
    }
    best
}

/// Proxy-anchor loss with one learned proxy per user.
#[derive(Debug, Clone)]
pub struct ProxyAnchorLoss {
    proxies: Array2<f32>,
    grad_proxies: Array2<f32>,
    margin: f32,
    alpha: f32,
}

impl ProxyAnchorLoss {
    /// Creates proxies for `n_classes` users in `dim`-dimensional space.
    pub fn new(n_classes: usize, dim: usize, margin: f32, alpha: f32, seed: u64) -> CoreResult<Self> {
        if n_classes == 0 || dim == 0 {
            return Err(CoreError::configuration("proxy loss needs classes and dims"));
        }
        if alpha <= 0.0 {
            return Err(CoreError::configuration("proxy alpha must be positive"));
        }
        let mut rng = Xorshift64::new(seed);
        let proxies = Array2::from_shape_fn((n_classes, dim), |_| rng.next_gaussian() * 0.05);
        Ok(Self {
            grad_proxies: Array2::zeros(proxies.dim()),
            proxies,
            margin,
            alpha,
        })
    }

    /// Number of classes.
    #[must_use]
    pub fn n_classes(&self) -> usize {
        self.proxies.nrows()
    }

    /// Loss and gradients for a batch of unit-norm embeddings.
    ///
    /// Accumulates proxy gradients internally and returns
    /// `(loss, grad_embeddings)` with `grad_embeddings` shaped like the
    /// `(B, d)` input.
    pub fn forward_backward(
        &mut self,
        embeddings: &Array2<f32>,
        labels: &[usize],
    ) -> CoreResult<(f32, Array2<f32>)> {
        let batch = embeddings.nrows();
        if batch == 0 || labels.len() != batch {
            return Err(CoreError::configuration("batch and labels disagree"));
        }
        let n_classes = self.proxies.nrows();
        let dim = self.proxies.ncols();
        let alpha = self.alpha;
        let delta = self.margin;

        // Normalize proxies for cosine similarities, keeping norms for the
        // chain rule back to the raw proxies.
        let mut unit_proxies = self.proxies.clone();
        let mut proxy_norms = Array1::<f32>::zeros(n_classes);
        for (mut row, norm_slot) in unit_proxies
            .axis_iter_mut(Axis(0))
            .zip(proxy_norms.iter_mut())
        {
            let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
            row.mapv_inplace(|v| v / norm);
            *norm_slot = norm;
        }

        // Similarity matrix s[i][c] = e_i · p̂_c.
        let similarity = embeddings.dot(&unit_proxies.t());

        // Positive proxies present in the batch.
        let mut has_positive = vec![false; n_classes];
        for &label in labels {
            has_positive[label] = true;
        }
        let n_positive_proxies = has_positive.iter().filter(|&&p| p).count().max(1);

        // Per-proxy soft-plus terms.
        let mut loss = 0.0f32;
        let mut grad_similarity = Array2::<f32>::zeros((batch, n_classes));
        for class in 0..n_classes {
            // Positive term: pull same-class embeddings above margin.
            if has_positive[class] {
                let mut sum_exp = 0.0f32;
                for (i, &label) in labels.iter().enumerate() {
                    if label == class {
                        sum_exp += (-alpha * (similarity[[i, class]] - delta)).exp();
                    }
                }
                loss += (1.0 + sum_exp).ln() / n_positive_proxies as f32;
                let outer = 1.0 / (1.0 + sum_exp) / n_positive_proxies as f32;
                for (i, &label) in labels.iter().enumerate() {
                    if label == class {
                        let e = (-alpha * (similarity[[i, class]] - delta)).exp();
                        grad_similarity[[i, class]] += outer * (-alpha) * e;
                    }
                }
            }

            // Negative term: push other-class embeddings below −margin.
            let mut sum_exp = 0.0f32;
            for (i, &label) in labels.iter().enumerate() {
                if label != class {
                    sum_exp += (alpha * (similarity[[i, class]] + delta)).exp();
                }
            }
            if sum_exp > 0.0 {
                loss += (1.0 + sum_exp).ln() / n_classes as f32;
                let outer = 1.0 / (1.0 + sum_exp) / n_classes as f32;
                for (i, &label) in labels.iter().enumerate() {
                    if label != class {
                        let e = (alpha * (similarity[[i, class]] + delta)).exp();
                        grad_similarity[[i, class]] += outer * alpha * e;
                    }
                }
            }
        }

        // grad wrt embeddings: Σ_c ds[i][c] · p̂_c.
        let grad_embeddings = grad_similarity.dot(&unit_proxies);

        // grad wrt unit proxies: Σ_i ds[i][c] · e_i, then through the
        // normalization p̂ = p / ‖p‖.
        let grad_unit = grad_similarity.t().dot(embeddings); // (n_classes, d)
        for class in 0..n_classes {
            let unit = unit_proxies.row(class);
            let grad_row = grad_unit.row(class);
            let dot: f32 = unit
                .iter()
                .zip(grad_row.iter())
                .map(|(u, g)| u * g)
                .sum();
            let norm = proxy_norms[class];
            let mut target = self.grad_proxies.row_mut(class);
            for j in 0..dim {
                target[j] += (grad_row[j] - unit[j] * dot) / norm;
            }
        }

        Ok((loss, grad_embeddings))
    }

    /// Zero the proxy gradient buffer.
    pub fn zero_grad(&mut self) {
        self.grad_proxies.fill(0.0);
    }

    /// Number of proxy parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.proxies.len()
    }

    /// Flat copy of the proxies.
    #[must_use]
    pub fn flatten_params(&self) -> Vec<f32> {
        self.proxies.iter().copied().collect()
    }

    /// Flat copy of the proxy gradients.
    #[must_use]
    pub fn flatten_grads(&self) -> Vec<f32> {
        self.grad_proxies.iter().copied().collect()
    }

    /// Restore proxies from a flat slice.
    pub fn unflatten_params(&mut self, data: &[f32]) -> CoreResult<()> {
        if data.len() != self.proxies.len() {
            return Err(CoreError::configuration("proxy parameter length mismatch"));
        }
        for (target, &value) in self.proxies.iter_mut().zip(data) {
            *target = value;
        }
        Ok(())
    }
}
