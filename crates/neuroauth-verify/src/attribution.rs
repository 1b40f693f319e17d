//! Gradient attribution over the input window.
//!
//! The objective attributed is `cos(encode(x), p*)` where `p*` is the
//! winning prototype of the verification. Three strategies share that
//! objective:
//!
//! - **Integrated gradients** (default): interpolate from a zero baseline
//!   to the input over N steps, average the input gradients, multiply by
//!   `(input − baseline)`.
//! - **Saliency**: absolute input gradient at the input itself.
//! - **Gradient × input**: signed input gradient times the input.
//!
//! The encoder backward pass is reused as-is: with a unit-norm embedding
//! `e`, `∂cos(e, p)/∂e = p` fed into the encoder's normalization backward
//! gives the exact input gradient.

use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use neuroauth_core::error::CoreResult;
use neuroauth_core::Window;
use neuroauth_model::encoder::EegEncoder;

/// Which attribution procedure produced a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionStrategy {
    /// Integrated gradients from a zero baseline.
    #[default]
    IntegratedGradients,
    /// |∂ cos / ∂ x| at the input.
    Saliency,
    /// ∂ cos / ∂ x ⊙ x.
    GradientInput,
}

impl std::fmt::Display for AttributionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::IntegratedGradients => "integrated_gradients",
            Self::Saliency => "saliency",
            Self::GradientInput => "gradient_input",
        };
        f.write_str(label)
    }
}

/// Input gradient of `cos(encode(window), prototype)`.
fn cosine_input_gradient(
    encoder: &mut EegEncoder,
    window: &Window,
    prototype: ArrayView1<'_, f32>,
) -> CoreResult<Array2<f32>> {
    let cache = encoder.forward(window, None)?;
    encoder.zero_grad();
    let grad_embedding = prototype.to_owned();
    Ok(encoder.backward(&cache, &grad_embedding))
}

/// Compute a `(C, W)` importance map for one window against the winning
/// prototype.
///
/// `encoder` is a scratch copy: its gradient buffers are clobbered, its
/// parameters are not.
pub fn attribute_window(
    encoder: &mut EegEncoder,
    window: &Window,
    prototype: ArrayView1<'_, f32>,
    strategy: AttributionStrategy,
    steps: usize,
) -> CoreResult<Array2<f32>> {
    match strategy {
        AttributionStrategy::IntegratedGradients => {
            let steps = steps.max(1);
            let mut accumulated = Array2::<f32>::zeros(window.data().dim());
            for step in 1..=steps {
                let alpha = step as f32 / steps as f32;
                let interpolated = Window::new(window.data().mapv(|v| v * alpha));
                let grad = cosine_input_gradient(encoder, &interpolated, prototype)?;
                accumulated += &grad;
            }
            accumulated.mapv_inplace(|v| v / steps as f32);
            // Multiply by (input − baseline); the baseline is zero.
            Ok(&accumulated * window.data())
        }
        AttributionStrategy::Saliency => {
            let grad = cosine_input_gradient(encoder, window, prototype)?;
            Ok(grad.mapv(f32::abs))
        }
        AttributionStrategy::GradientInput => {
            let grad = cosine_input_gradient(encoder, window, prototype)?;
            Ok(&grad * window.data())
        }
    }
}

/// Top-`n` channels by absolute attribution mass.
#[must_use]
pub fn top_channels(map: &Array2<f32>, n: usize) -> Vec<(usize, f32)> {
    let mut importance: Vec<(usize, f32)> = map
        .rows()
        .into_iter()
        .enumerate()
        .map(|(channel, row)| (channel, row.iter().map(|v| v.abs()).sum()))
        .collect();
    importance.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    importance.truncate(n);
    importance
}

/// Absolute attribution mass in `bins` coarse time bins.
#[must_use]
pub fn time_bin_importance(map: &Array2<f32>, bins: usize) -> Vec<f32> {
    let bins = bins.max(1);
    let samples = map.ncols();
    let bin_width = (samples / bins).max(1);
    (0..bins)
        .map(|bin| {
            let start = bin * bin_width;
            let end = if bin + 1 == bins {
                samples
            } else {
                ((bin + 1) * bin_width).min(samples)
            };
            if start >= samples {
                return 0.0;
            }
            map.slice(ndarray::s![.., start..end])
                .iter()
                .map(|v| v.abs())
                .sum()
        })
        .collect()
}

/// Average several per-window maps into one aggregate map.
#[must_use]
pub fn aggregate_maps(maps: &[Array2<f32>]) -> Option<Array2<f32>> {
    let first = maps.first()?;
    let mut sum = Array2::<f32>::zeros(first.dim());
    for map in maps {
        sum += map;
    }
    sum.mapv_inplace(|v| v / maps.len() as f32);
    Some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use neuroauth_core::utils::Xorshift64;
    use neuroauth_core::WindowEncoder;
    use neuroauth_model::encoder::EncoderConfig;

    fn tiny_encoder() -> EegEncoder {
        EegEncoder::new(EncoderConfig {
            n_channels: 3,
            window_samples: 10,
            hidden_size: 4,
            num_layers: 1,
            embedding_dim: 6,
            dropout: 0.1,
            seed: 42,
        })
        .unwrap()
    }

    fn tiny_window(seed: u64) -> Window {
        let mut rng = Xorshift64::new(seed);
        Window::new(Array2::from_shape_fn((3, 10), |_| rng.next_gaussian()))
    }

    #[test]
    fn integrated_gradients_map_has_input_shape_and_mass() {
        let mut encoder = tiny_encoder();
        let window = tiny_window(1);
        let embedding = encoder.encode(&window).unwrap();
        let map = attribute_window(
            &mut encoder,
            &window,
            embedding.values(),
            AttributionStrategy::IntegratedGradients,
            16,
        )
        .unwrap();
        assert_eq!(map.dim(), (3, 10));
        let l1: f32 = map.iter().map(|v| v.abs()).sum();
        assert!(l1 > 0.0, "attribution map is all zero");
    }

    #[test]
    fn saliency_is_non_negative() {
        let mut encoder = tiny_encoder();
        let window = tiny_window(2);
        let embedding = encoder.encode(&window).unwrap();
        let map = attribute_window(
            &mut encoder,
            &window,
            embedding.values(),
            AttributionStrategy::Saliency,
            1,
        )
        .unwrap();
        assert!(map.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn attribution_does_not_change_parameters() {
        let mut encoder = tiny_encoder();
        let before = encoder.flatten_params();
        let window = tiny_window(3);
        let embedding = encoder.encode(&window).unwrap();
        let _ = attribute_window(
            &mut encoder,
            &window,
            embedding.values(),
            AttributionStrategy::IntegratedGradients,
            8,
        )
        .unwrap();
        assert_eq!(encoder.flatten_params(), before);
    }

    #[test]
    fn zero_window_has_zero_integrated_attribution() {
        // With a zero input, input == baseline, so IG must vanish.
        let mut encoder = tiny_encoder();
        let window = Window::new(Array2::zeros((3, 10)));
        let embedding = encoder.encode(&window).unwrap();
        let map = attribute_window(
            &mut encoder,
            &window,
            embedding.values(),
            AttributionStrategy::IntegratedGradients,
            8,
        )
        .unwrap();
        assert!(map.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn top_channels_orders_by_mass() {
        let map = arr2(&[[0.1f32, 0.1], [5.0, 5.0], [1.0, -1.0]]);
        let top = top_channels(&map, 2);
        assert_eq!(top[0].0, 1);
        assert_eq!(top[1].0, 2);
    }

    #[test]
    fn time_bins_cover_all_samples() {
        let map = Array2::<f32>::ones((2, 10));
        let bins = time_bin_importance(&map, 3);
        assert_eq!(bins.len(), 3);
        let total: f32 = bins.iter().sum();
        assert!((total - 20.0).abs() < 1e-5, "mass lost: {total}");
    }

    #[test]
    fn aggregate_is_mean() {
        let a = arr2(&[[1.0f32, 1.0]]);
        let b = arr2(&[[3.0f32, 3.0]]);
        let mean = aggregate_maps(&[a, b]).unwrap();
        assert_eq!(mean, arr2(&[[2.0f32, 2.0]]));
    }
}
