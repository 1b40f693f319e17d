//! Temporal attention pooling.
//!
//! Scores each time step with `v · tanh(W a_t)`, softmaxes over time, and
//! returns the weighted sum of step features. The attention weights are
//! exposed for inspection.

use ndarray::{Array1, Array2, Axis};

use crate::nn::Linear;

/// Additive temporal attention over a `(T, d)` sequence.
#[derive(Debug, Clone)]
pub struct TemporalAttention {
    score_fc: Linear,
    context: Linear,
    dim: usize,
}

/// Forward cache for [`TemporalAttention::backward`].
#[derive(Debug, Clone)]
pub struct AttentionCache {
    sequence: Array2<f32>,
    tanh_hidden: Array2<f32>,
    weights: Array1<f32>,
}

impl AttentionCache {
    /// Softmax weights over time.
    #[must_use]
    pub fn weights(&self) -> &Array1<f32> {
        &self.weights
    }
}

impl TemporalAttention {
    /// Creates an attention module over `dim`-wide step features.
    #[must_use]
    pub fn with_seed(dim: usize, seed: u64) -> Self {
        Self {
            score_fc: Linear::with_seed(dim, dim, seed),
            context: Linear::with_seed_no_bias(dim, 1, seed.wrapping_add(1)),
            dim,
        }
    }

    /// Feature width.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Pool a `(T, d)` sequence into a `(d,)` vector.
    #[must_use]
    pub fn forward(&self, sequence: &Array2<f32>) -> (Array1<f32>, AttentionCache) {
        let steps = sequence.nrows();
        let mut tanh_hidden = Array2::<f32>::zeros((steps, self.dim));
        let mut scores = Array1::<f32>::zeros(steps);
        for t in 0..steps {
            let hidden = self.score_fc.forward(sequence.row(t)).mapv(f32::tanh);
            scores[t] = self.context.forward(hidden.view())[0];
            tanh_hidden.row_mut(t).assign(&hidden);
        }

        // Softmax over time.
        let max_score = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp = scores.mapv(|s| (s - max_score).exp());
        let sum: f32 = exp.sum();
        let weights = exp.mapv(|e| e / sum);

        let mut pooled = Array1::<f32>::zeros(self.dim);
        for t in 0..steps {
            pooled.scaled_add(weights[t], &sequence.row(t));
        }

        (
            pooled,
            AttentionCache {
                sequence: sequence.clone(),
                tanh_hidden,
                weights,
            },
        )
    }

    /// Backward pass: accumulates parameter gradients, returns `(T, d)`
    /// sequence gradients.
    #[must_use]
    pub fn backward(&mut self, cache: &AttentionCache, grad_pooled: &Array1<f32>) -> Array2<f32> {
        let steps = cache.sequence.nrows();
        let weights = &cache.weights;

        // pooled = Σ_t w_t a_t
        let mut grad_sequence = Array2::<f32>::zeros(cache.sequence.dim());
        let mut grad_weights = Array1::<f32>::zeros(steps);
        for t in 0..steps {
            grad_weights[t] = grad_pooled.dot(&cache.sequence.row(t));
            grad_sequence.row_mut(t).scaled_add(weights[t], grad_pooled);
        }

        // Softmax backward: ds_t = w_t (dw_t − Σ_j w_j dw_j).
        let weighted_sum: f32 = weights
            .iter()
            .zip(grad_weights.iter())
            .map(|(w, g)| w * g)
            .sum();
        let grad_scores =
            Array1::from_shape_fn(steps, |t| weights[t] * (grad_weights[t] - weighted_sum));

        // Score path: s_t = v · tanh(W a_t).
        for t in 0..steps {
            if grad_scores[t] == 0.0 {
                continue;
            }
            let grad_score = Array1::from_vec(vec![grad_scores[t]]);
            let grad_tanh = self
                .context
                .backward(cache.tanh_hidden.row(t), grad_score.view());
            let grad_pre = Array1::from_shape_fn(self.dim, |i| {
                let tanh_value = cache.tanh_hidden[[t, i]];
                grad_tanh[i] * (1.0 - tanh_value * tanh_value)
            });
            let grad_step = self.score_fc.backward(cache.sequence.row(t), grad_pre.view());
            let mut row = grad_sequence.row_mut(t);
            row += &grad_step;
        }

        grad_sequence
    }

    /// Zero the gradient buffers.
    pub fn zero_grad(&mut self) {
        self.score_fc.zero_grad();
        self.context.zero_grad();
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.score_fc.param_count() + self.context.param_count()
    }

    /// Push parameters into a flat vec.
    pub fn flatten_into(&self, out: &mut Vec<f32>) {
        self.score_fc.flatten_into(out);
        self.context.flatten_into(out);
    }

    /// Push gradients in the same layout.
    pub fn flatten_grads_into(&self, out: &mut Vec<f32>) {
        self.score_fc.flatten_grads_into(out);
        self.context.flatten_grads_into(out);
    }

    /// Restore parameters; returns floats consumed.
    pub fn unflatten_from(&mut self, data: &[f32]) -> usize {
        let mut offset = self.score_fc.unflatten_from(data);
        offset += self.context.unflatten_from(&data[offset..]);
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use neuroauth_core::utils::Xorshift64;

    fn sequence(steps: usize, dim: usize, seed: u64) -> Array2<f32> {
        let mut rng = Xorshift64::new(seed);
        Array2::from_shape_fn((steps, dim), |_| rng.next_gaussian() * 0.5)
    }

    #[test]
    fn weights_sum_to_one() {
        let attention = TemporalAttention::with_seed(4, 1);
        let (_, cache) = attention.forward(&sequence(12, 4, 2));
        let sum: f32 = cache.weights().sum();
        assert!((sum - 1.0).abs() < 1e-5, "weights sum {sum}");
        assert!(cache.weights().iter().all(|&w| w >= 0.0));
    }

    #[test]
    fn pooled_is_convex_combination() {
        let attention = TemporalAttention::with_seed(3, 7);
        let seq = sequence(8, 3, 3);
        let (pooled, _) = attention.forward(&seq);
        for i in 0..3 {
            let column = seq.column(i);
            let min = column.iter().copied().fold(f32::INFINITY, f32::min);
            let max = column.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            assert!(
                pooled[i] >= min - 1e-5 && pooled[i] <= max + 1e-5,
                "pooled[{i}] = {} outside [{min}, {max}]",
                pooled[i]
            );
        }
    }

    #[test]
    fn sequence_gradient_matches_central_difference() {
        let mut attention = TemporalAttention::with_seed(3, 17);
        let seq = sequence(5, 3, 4);

        let (pooled, cache) = attention.forward(&seq);
        attention.zero_grad();
        let grad_pooled = Array1::ones(pooled.len());
        let grad_seq = attention.backward(&cache, &grad_pooled);

        let loss = |attention: &TemporalAttention, seq: &Array2<f32>| attention.forward(seq).0.sum();
        let eps = 1e-3;
        for &(t, i) in &[(0usize, 0usize), (2, 1), (4, 2)] {
            let mut plus = seq.clone();
            plus[[t, i]] += eps;
            let mut minus = seq.clone();
            minus[[t, i]] -= eps;
            let numeric = (loss(&attention, &plus) - loss(&attention, &minus)) / (2.0 * eps);
            assert!(
                (grad_seq[[t, i]] - numeric).abs() < 1e-3,
                "dseq[{t},{i}]: {} vs {numeric}",
                grad_seq[[t, i]]
            );
        }
    }

    #[test]
    fn parameter_gradients_match_central_difference() {
        let mut attention = TemporalAttention::with_seed(2, 23);
        let seq = sequence(4, 2, 5);
        let (pooled, cache) = attention.forward(&seq);
        attention.zero_grad();
        let _ = attention.backward(&cache, &Array1::ones(pooled.len()));

        let mut flat = Vec::new();
        attention.flatten_into(&mut flat);
        let mut grads = Vec::new();
        attention.flatten_grads_into(&mut grads);

        let loss = |attention: &TemporalAttention, seq: &Array2<f32>| attention.forward(seq).0.sum();
        let eps = 1e-3;
        let mut probe = attention.clone();
        for index in 0..flat.len() {
            let mut plus = flat.clone();
            plus[index] += eps;
            probe.unflatten_from(&plus);
            let loss_plus = loss(&probe, &seq);
            let mut minus = flat.clone();
            minus[index] -= eps;
            probe.unflatten_from(&minus);
            let loss_minus = loss(&probe, &seq);
            let numeric = (loss_plus - loss_minus) / (2.0 * eps);
            assert!(
                (grads[index] - numeric).abs() < 1e-3,
                "param {index}: {} vs {numeric}",
                grads[index]
            );
        }
    }

    #[test]
    fn flatten_round_trip() {
        let attention = TemporalAttention::with_seed(4, 3);
        let mut flat = Vec::new();
        attention.flatten_into(&mut flat);
        assert_eq!(flat.len(), attention.param_count());

        let mut restored = TemporalAttention::with_seed(4, 777);
        assert_eq!(restored.unflatten_from(&flat), flat.len());

        let seq = sequence(6, 4, 9);
        assert_eq!(attention.forward(&seq).0, restored.forward(&seq).0);
    }
}
