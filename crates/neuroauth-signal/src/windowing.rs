//! Deterministic sliding-window segmentation.

use serde::{Deserialize, Serialize};

use neuroauth_core::error::{CoreError, CoreResult, SignalError};
use neuroauth_core::{ProcessedTrial, Window};

/// Sliding-window parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window length in seconds.
    pub window_seconds: f32,
    /// Stride in seconds.
    pub step_seconds: f32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_seconds: 2.0,
            step_seconds: 1.0,
        }
    }
}

impl WindowConfig {
    /// Window length in samples at `fs`.
    #[must_use]
    pub fn window_samples(&self, fs: f32) -> usize {
        (self.window_seconds * fs) as usize
    }

    /// Stride in samples at `fs`.
    #[must_use]
    pub fn step_samples(&self, fs: f32) -> usize {
        (self.step_seconds * fs) as usize
    }

    /// Validates parameter ranges.
    pub fn validate(&self) -> CoreResult<()> {
        if self.window_seconds <= 0.0 || self.step_seconds <= 0.0 {
            return Err(CoreError::configuration(
                "window and step durations must be positive",
            ));
        }
        Ok(())
    }

    /// Cuts a processed trial into `⌊(T − W)/S⌋ + 1` windows, in time order.
    ///
    /// The sequence is finite and consumed into a dense batch here; there is
    /// no restartable iterator.
    ///
    /// # Errors
    ///
    /// [`SignalError::ProbeTooShort`] when the trial holds fewer than `W`
    /// samples.
    pub fn slide(&self, trial: &ProcessedTrial) -> CoreResult<Vec<Window>> {
        self.validate()?;
        let fs = trial.sample_rate_hz();
        let window = self.window_samples(fs);
        let step = self.step_samples(fs).max(1);
        let total = trial.n_samples();
        if total < window {
            return Err(SignalError::ProbeTooShort {
                required: window,
                available: total,
            }
            .into());
        }
        let count = (total - window) / step + 1;
        let mut windows = Vec::with_capacity(count);
        for index in 0..count {
            let start = index * step;
            let slice = trial
                .data()
                .slice(ndarray::s![.., start..start + window])
                .to_owned();
            windows.push(Window::new(slice));
        }
        Ok(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn trial_of(n_samples: usize) -> ProcessedTrial {
        let data = Array2::from_shape_fn((4, n_samples), |(c, s)| (c * 1000 + s) as f32);
        ProcessedTrial::new(data, 128.0).unwrap()
    }

    #[test]
    fn count_formula_holds() {
        let config = WindowConfig::default(); // W = 256, S = 128 at 128 Hz
        let trial = trial_of(1280); // 10 s
        let windows = config.slide(&trial).unwrap();
        assert_eq!(windows.len(), (1280 - 256) / 128 + 1);
    }

    #[test]
    fn exactly_one_window_at_w_samples() {
        let config = WindowConfig::default();
        let trial = trial_of(256);
        let windows = config.slide(&trial).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].n_samples(), 256);
    }

    #[test]
    fn w_minus_one_samples_is_too_short() {
        let config = WindowConfig::default();
        let trial = trial_of(255);
        let err = config.slide(&trial).unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn windows_follow_time_order() {
        let config = WindowConfig::default();
        let trial = trial_of(512);
        let windows = config.slide(&trial).unwrap();
        assert_eq!(windows.len(), 3);
        // Stride 128: window i starts at sample 128*i on every channel.
        assert_eq!(windows[0].data()[[0, 0]], 0.0);
        assert_eq!(windows[1].data()[[0, 0]], 128.0);
        assert_eq!(windows[2].data()[[0, 0]], 256.0);
    }

    #[test]
    fn invalid_config_rejected() {
        let config = WindowConfig {
            window_seconds: 0.0,
            step_seconds: 1.0,
        };
        assert!(config.slide(&trial_of(512)).is_err());
    }
}
