//! Training-time window augmentation.
//!
//! Four perturbations applied in a fixed order, each independent per
//! window: channel dropout, SNR-targeted Gaussian noise, time shift with
//! reflection padding, and mixup between two same-user windows. None run at
//! enrollment or verification time.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use neuroauth_core::utils::Xorshift64;
use neuroauth_core::Window;

/// Augmentation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugmentConfig {
    /// Per-channel dropout probability.
    pub channel_dropout_p: f32,
    /// Target SNR range in dB for additive noise.
    pub snr_db_range: (f32, f32),
    /// Maximum time shift in seconds.
    pub max_shift_seconds: f32,
    /// Probability of applying a time shift.
    pub shift_p: f32,
    /// Probability of mixup when a partner window is available.
    pub mixup_p: f32,
    /// Symmetric Beta parameter for the mixup weight.
    pub mixup_alpha: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            channel_dropout_p: 0.15,
            snr_db_range: (12.0, 28.0),
            max_shift_seconds: 0.5,
            shift_p: 0.5,
            mixup_p: 0.5,
            mixup_alpha: 0.2,
        }
    }
}

/// Applies the augmentation pipeline to training windows.
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentConfig,
    sample_rate_hz: f32,
}

impl Augmenter {
    /// Creates an augmenter for windows sampled at `sample_rate_hz`.
    #[must_use]
    pub fn new(config: AugmentConfig, sample_rate_hz: f32) -> Self {
        Self {
            config,
            sample_rate_hz,
        }
    }

    /// Augments `window` in place. `partner` is another window of the same
    /// user for mixup; pass `None` to skip mixup.
    pub fn apply(&self, window: &mut Window, partner: Option<&Window>, rng: &mut Xorshift64) {
        self.channel_dropout(window.data_mut(), rng);
        self.additive_noise(window.data_mut(), rng);
        if rng.next_f32() < self.config.shift_p {
            self.time_shift(window.data_mut(), rng);
        }
        if let Some(partner) = partner {
            if rng.next_f32() < self.config.mixup_p {
                self.mixup(window.data_mut(), partner.data(), rng);
            }
        }
    }

    /// Zero a random subset of channels.
    fn channel_dropout(&self, data: &mut Array2<f32>, rng: &mut Xorshift64) {
        for mut row in data.rows_mut() {
            if rng.next_f32() < self.config.channel_dropout_p {
                row.fill(0.0);
            }
        }
    }

    /// Add Gaussian noise at a uniformly drawn target SNR.
    fn additive_noise(&self, data: &mut Array2<f32>, rng: &mut Xorshift64) {
        let (lo, hi) = self.config.snr_db_range;
        let snr_db = rng.next_range(lo, hi);
        let signal_power = data.iter().map(|v| v * v).sum::<f32>() / data.len() as f32;
        if signal_power < 1e-12 {
            return;
        }
        let noise_power = signal_power / 10f32.powf(snr_db / 10.0);
        let noise_std = noise_power.sqrt();
        for value in data.iter_mut() {
            *value += rng.next_gaussian() * noise_std;
        }
    }

    /// Shift every channel by one random offset, filling the vacated edge
    /// with a mirror of the signal.
    fn time_shift(&self, data: &mut Array2<f32>, rng: &mut Xorshift64) {
        let max_shift = (self.config.max_shift_seconds * self.sample_rate_hz) as i64;
        if max_shift == 0 {
            return;
        }
        let shift =
            (rng.next_u64() % (2 * max_shift as u64 + 1)) as i64 - max_shift;
        if shift == 0 {
            return;
        }
        let n = data.ncols();
        let magnitude = shift.unsigned_abs() as usize;
        if magnitude >= n {
            return;
        }
        for mut row in data.rows_mut() {
            let original = row.to_vec();
            if shift > 0 {
                // Shift right; mirror the leading edge.
                for i in 0..magnitude {
                    row[i] = original[magnitude - i];
                }
                for i in magnitude..n {
                    row[i] = original[i - magnitude];
                }
            } else {
                // Shift left; mirror the trailing edge.
                for i in 0..n - magnitude {
                    row[i] = original[i + magnitude];
                }
                for i in 0..magnitude {
                    row[n - magnitude + i] = original[n - 2 - i];
                }
            }
        }
    }

    /// Blend with a same-user partner using a symmetric Beta weight.
    fn mixup(&self, data: &mut Array2<f32>, partner: &Array2<f32>, rng: &mut Xorshift64) {
        if data.dim() != partner.dim() {
            return;
        }
        let lambda = sample_beta(self.config.mixup_alpha, rng);
        for (value, &other) in data.iter_mut().zip(partner.iter()) {
            *value = lambda * *value + (1.0 - lambda) * other;
        }
    }
}

/// Sample Beta(alpha, alpha) via Johnk's algorithm (valid for alpha ≤ 1,
/// which covers the mixup range).
fn sample_beta(alpha: f32, rng: &mut Xorshift64) -> f32 {
    let exponent = 1.0 / alpha.max(1e-3);
    for _ in 0..64 {
        let u = rng.next_f32().max(1e-12).powf(exponent);
        let v = rng.next_f32().max(1e-12).powf(exponent);
        if u + v <= 1.0 && u + v > 0.0 {
            return u / (u + v);
        }
    }
    // Extremely unlikely fallback: an unweighted blend.
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn window_of_ones() -> Window {
        Window::new(Array2::ones((48, 256)))
    }

    #[test]
    fn shape_is_preserved() {
        let augmenter = Augmenter::new(AugmentConfig::default(), 128.0);
        let mut rng = Xorshift64::new(42);
        let mut window = window_of_ones();
        let partner = window_of_ones();
        augmenter.apply(&mut window, Some(&partner), &mut rng);
        assert_eq!(window.n_channels(), 48);
        assert_eq!(window.n_samples(), 256);
    }

    #[test]
    fn dropout_zeroes_whole_channels() {
        let config = AugmentConfig {
            channel_dropout_p: 1.0,
            ..AugmentConfig::default()
        };
        let augmenter = Augmenter::new(config, 128.0);
        let mut rng = Xorshift64::new(1);
        let mut data = Array2::<f32>::ones((8, 32));
        augmenter.channel_dropout(&mut data, &mut rng);
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn noise_matches_target_snr_roughly() {
        let config = AugmentConfig {
            snr_db_range: (20.0, 20.0),
            ..AugmentConfig::default()
        };
        let augmenter = Augmenter::new(config, 128.0);
        let mut rng = Xorshift64::new(5);
        let clean = Array2::<f32>::ones((48, 256));
        let mut noisy = clean.clone();
        augmenter.additive_noise(&mut noisy, &mut rng);
        let noise_power = (&noisy - &clean).mapv(|v| v * v).mean().unwrap();
        let measured_snr_db = 10.0 * (1.0 / noise_power).log10();
        assert!(
            (measured_snr_db - 20.0).abs() < 1.5,
            "SNR off target: {measured_snr_db} dB"
        );
    }

    #[test]
    fn time_shift_moves_a_ramp() {
        let config = AugmentConfig {
            shift_p: 1.0,
            channel_dropout_p: 0.0,
            snr_db_range: (100.0, 100.0),
            ..AugmentConfig::default()
        };
        let augmenter = Augmenter::new(config, 128.0);
        let mut data = Array2::from_shape_fn((1, 256), |(_, s)| s as f32);
        let original = data.clone();
        let mut rng = Xorshift64::new(2);
        augmenter.time_shift(&mut data, &mut rng);
        assert_ne!(data, original, "shift should change the ramp");
        assert!(data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn mixup_is_convex_combination() {
        let config = AugmentConfig::default();
        let augmenter = Augmenter::new(config, 128.0);
        let mut rng = Xorshift64::new(3);
        let mut a = Array2::<f32>::zeros((4, 16));
        let b = Array2::<f32>::ones((4, 16));
        augmenter.mixup(&mut a, &b, &mut rng);
        for &v in a.iter() {
            assert!((0.0..=1.0).contains(&v), "mixup left convex hull: {v}");
        }
        // All entries share one lambda.
        let first = a[[0, 0]];
        assert!(a.iter().all(|&v| (v - first).abs() < 1e-6));
    }

    #[test]
    fn beta_sample_is_in_unit_interval() {
        let mut rng = Xorshift64::new(8);
        for _ in 0..1000 {
            let lambda = sample_beta(0.2, &mut rng);
            assert!((0.0..=1.0).contains(&lambda));
        }
    }

    #[test]
    fn same_seed_gives_identical_augmentation() {
        let augmenter = Augmenter::new(AugmentConfig::default(), 128.0);
        let mut a = window_of_ones();
        let mut b = window_of_ones();
        let mut rng_a = Xorshift64::new(77);
        let mut rng_b = Xorshift64::new(77);
        augmenter.apply(&mut a, None, &mut rng_a);
        augmenter.apply(&mut b, None, &mut rng_b);
        assert_eq!(a.data(), b.data());
    }
}
