//! Layer primitives.
//!
//! Layers own both their parameters and the matching gradient buffers.
//! Checkpointing and optimization work on the flat `Vec<f32>` layout
//! produced by `flatten_into` / consumed by `unflatten_from`; the layout is
//! row-major weights followed by bias, in declaration order.

use ndarray::{Array1, Array2, ArrayView1};

use neuroauth_core::utils::Xorshift64;

/// A fully connected layer `y = Wx + b` with gradient accumulation.
#[derive(Debug, Clone)]
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: Array2<f32>,
    bias: Array1<f32>,
    grad_weight: Array2<f32>,
    grad_bias: Array1<f32>,
    has_bias: bool,
}

impl Linear {
    /// Xavier/Glorot uniform initialisation with an explicit seed.
    #[must_use]
    pub fn with_seed(in_features: usize, out_features: usize, seed: u64) -> Self {
        let mut rng = Xorshift64::new(seed);
        let limit = (6.0 / (in_features + out_features) as f32).sqrt();
        let weight = Array2::from_shape_fn((out_features, in_features), |_| {
            rng.next_range(-limit, limit)
        });
        Self {
            in_features,
            out_features,
            weight,
            bias: Array1::zeros(out_features),
            grad_weight: Array2::zeros((out_features, in_features)),
            grad_bias: Array1::zeros(out_features),
            has_bias: true,
        }
    }

    /// Xavier initialisation without a bias term.
    #[must_use]
    pub fn with_seed_no_bias(in_features: usize, out_features: usize, seed: u64) -> Self {
        let mut layer = Self::with_seed(in_features, out_features, seed);
        layer.has_bias = false;
        layer
    }

    /// All-zero parameters (for tests and gradient checks).
    #[must_use]
    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            weight: Array2::zeros((out_features, in_features)),
            bias: Array1::zeros(out_features),
            grad_weight: Array2::zeros((out_features, in_features)),
            grad_bias: Array1::zeros(out_features),
            has_bias: true,
        }
    }

    /// Input width.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Forward pass for one vector.
    #[must_use]
    pub fn forward(&self, input: ArrayView1<'_, f32>) -> Array1<f32> {
        debug_assert_eq!(input.len(), self.in_features);
        let mut out = self.weight.dot(&input);
        if self.has_bias {
            out += &self.bias;
        }
        out
    }

    /// Backward pass for one vector: accumulates parameter gradients and
    /// returns the input gradient.
    #[must_use]
    pub fn backward(
        &mut self,
        input: ArrayView1<'_, f32>,
        grad_output: ArrayView1<'_, f32>,
    ) -> Array1<f32> {
        debug_assert_eq!(grad_output.len(), self.out_features);
        for (row, &g) in grad_output.iter().enumerate() {
            if g == 0.0 {
                continue;
            }
            let mut weight_row = self.grad_weight.row_mut(row);
            for (column, &x) in input.iter().enumerate() {
                weight_row[column] += g * x;
            }
        }
        if self.has_bias {
            self.grad_bias += &grad_output;
        }
        self.weight.t().dot(&grad_output)
    }

    /// Zero the gradient buffers.
    pub fn zero_grad(&mut self) {
        self.grad_weight.fill(0.0);
        self.grad_bias.fill(0.0);
    }

    /// Number of trainable parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.in_features * self.out_features + if self.has_bias { self.out_features } else { 0 }
    }

    /// Push parameters (row-major weights, then bias) into a flat vec.
    pub fn flatten_into(&self, out: &mut Vec<f32>) {
        out.extend(self.weight.iter());
        if self.has_bias {
            out.extend(self.bias.iter());
        }
    }

    /// Push gradients in the same layout as [`Linear::flatten_into`].
    pub fn flatten_grads_into(&self, out: &mut Vec<f32>) {
        out.extend(self.grad_weight.iter());
        if self.has_bias {
            out.extend(self.grad_bias.iter());
        }
    }

    /// Restore parameters from a flat slice; returns floats consumed.
    pub fn unflatten_from(&mut self, data: &[f32]) -> usize {
        let weight_len = self.in_features * self.out_features;
        for (target, &value) in self.weight.iter_mut().zip(&data[..weight_len]) {
            *target = value;
        }
        let mut consumed = weight_len;
        if self.has_bias {
            for (target, &value) in self
                .bias
                .iter_mut()
                .zip(&data[weight_len..weight_len + self.out_features])
            {
                *target = value;
            }
            consumed += self.out_features;
        }
        consumed
    }
}

/// ReLU forward, recording the mask needed for backward.
#[must_use]
pub fn relu(input: &Array1<f32>) -> Array1<f32> {
    input.mapv(|v| if v > 0.0 { v } else { 0.0 })
}

/// ReLU backward from the forward *input*.
#[must_use]
pub fn relu_backward(input: &Array1<f32>, grad_output: &Array1<f32>) -> Array1<f32> {
    Array1::from_iter(
        input
            .iter()
            .zip(grad_output.iter())
            .map(|(&x, &g)| if x > 0.0 { g } else { 0.0 }),
    )
}

/// Inverted dropout: scales kept activations by `1 / (1 - p)` and returns
/// the mask applied. Training-time only.
pub fn dropout(input: &mut Array1<f32>, p: f32, rng: &mut Xorshift64) -> Array1<f32> {
    if p <= 0.0 {
        return Array1::ones(input.len());
    }
    let scale = 1.0 / (1.0 - p);
    let mask = Array1::from_shape_fn(input.len(), |_| {
        if rng.next_f32() < p {
            0.0
        } else {
            scale
        }
    });
    *input *= &mask;
    mask
}

/// L2 normalization with cached norm, and its backward.
///
/// For `y = x / ‖x‖`: `dx = (dy − y (y · dy)) / ‖x‖`.
#[must_use]
pub fn l2_normalize_forward(input: &Array1<f32>) -> (Array1<f32>, f32) {
    let norm = input.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
    (input.mapv(|v| v / norm), norm)
}

/// Backward of [`l2_normalize_forward`].
#[must_use]
pub fn l2_normalize_backward(
    output: &Array1<f32>,
    norm: f32,
    grad_output: &Array1<f32>,
) -> Array1<f32> {
    let dot: f32 = output
        .iter()
        .zip(grad_output.iter())
        .map(|(y, g)| y * g)
        .sum();
    Array1::from_iter(
        output
            .iter()
            .zip(grad_output.iter())
            .map(|(&y, &g)| (g - y * dot) / norm),
    )
}
