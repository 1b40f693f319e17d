//! Trial preprocessing pipeline.
//!
//! Stages run in a fixed order: band-pass, notch, optional ICA artifact
//! removal, decimating resample, per-channel standardization. The output is
//! a [`ProcessedTrial`] at the system rate with zero-mean unit-variance
//! channels.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use neuroauth_core::error::{CoreError, CoreResult, SignalError};
use neuroauth_core::{ChannelManifest, ProcessedTrial, Trial};

use crate::filters::{butter_bandpass, decimate, filtfilt, Biquad};
use crate::ica::{remove_artifacts, IcaConfig};

/// Standard deviations below this are clamped before division.
const STD_CLAMP: f32 = 1e-8;

/// Configuration for the preprocessing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Band-pass low cutoff in Hz.
    pub bandpass_low_hz: f64,
    /// Band-pass high cutoff in Hz.
    pub bandpass_high_hz: f64,
    /// Filter order per band edge.
    pub filter_order: usize,
    /// Mains notch frequency in Hz; `None` disables the notch.
    pub notch_hz: Option<f64>,
    /// Notch quality factor.
    pub notch_q: f64,
    /// Output sample rate in Hz.
    pub sample_rate_out_hz: f32,
    /// Whether to run ICA artifact removal (skipped in fast mode).
    pub artifact_removal: bool,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            bandpass_low_hz: 1.0,
            bandpass_high_hz: 50.0,
            filter_order: 4,
            notch_hz: Some(50.0),
            notch_q: 30.0,
            sample_rate_out_hz: neuroauth_core::SAMPLE_RATE_OUT,
            artifact_removal: true,
        }
    }
}

impl PreprocessConfig {
    /// A configuration with ICA disabled for smoke runs.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            artifact_removal: false,
            ..Self::default()
        }
    }

    /// Validates parameter ranges.
    pub fn validate(&self) -> CoreResult<()> {
        if self.bandpass_low_hz <= 0.0 || self.bandpass_high_hz <= self.bandpass_low_hz {
            return Err(CoreError::configuration(
                "band-pass cutoffs must satisfy 0 < low < high",
            ));
        }
        if self.filter_order == 0 || self.filter_order % 2 != 0 {
            return Err(CoreError::configuration("filter order must be even"));
        }
        if self.sample_rate_out_hz <= 0.0 {
            return Err(CoreError::configuration("output sample rate must be positive"));
        }
        Ok(())
    }
}

/// The preprocessing pipeline (spec stages band-pass through standardize).
#[derive(Debug)]
pub struct Preprocessor {
    config: PreprocessConfig,
    ica_config: IcaConfig,
    frontal_indices: Vec<usize>,
}

impl Preprocessor {
    /// Creates a preprocessor, validating the configuration.
    pub fn new(config: PreprocessConfig) -> CoreResult<Self> {
        Self::with_manifest(config, &ChannelManifest::builtin())
    }

    /// Creates a preprocessor using `manifest` to locate frontal channels
    /// for the ICA eye-artifact heuristic.
    pub fn with_manifest(
        config: PreprocessConfig,
        manifest: &ChannelManifest,
    ) -> CoreResult<Self> {
        config.validate()?;
        let frontal_indices = manifest
            .names()
            .iter()
            .enumerate()
            .filter(|(_, name)| name.starts_with("Fp") || name.starts_with("AF"))
            .map(|(index, _)| index)
            .collect();
        Ok(Self {
            config,
            ica_config: IcaConfig::default(),
            frontal_indices,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Runs the full pipeline on one trial.
    pub fn run(&self, trial: &Trial) -> CoreResult<ProcessedTrial> {
        let fs_in = f64::from(trial.sample_rate_hz());
        if trial.n_samples() == 0 {
            return Err(SignalError::EmptyTrial.into());
        }

        // Band-pass (zero phase).
        let bandpass = butter_bandpass(
            self.config.filter_order,
            self.config.bandpass_low_hz,
            self.config.bandpass_high_hz.min(0.95 * fs_in / 2.0),
            fs_in,
        );
        let mut data = self.filter_rows(trial.data(), &bandpass)?;

        // Notch, skipped when outside the pass-band.
        if let Some(notch_hz) = self.config.notch_hz {
            if notch_hz > self.config.bandpass_low_hz
                && notch_hz < self.config.bandpass_high_hz
                && notch_hz < fs_in / 2.0
            {
                let notch = [Biquad::notch(notch_hz, fs_in, self.config.notch_q)];
                data = self.filter_rows(&data, &notch)?;
            } else {
                debug!(notch_hz, "notch outside pass-band, skipped");
            }
        }

        // Optional artifact removal.
        if self.config.artifact_removal {
            match remove_artifacts(&data, &self.frontal_indices, &self.ica_config) {
                Ok((clean, report)) => {
                    debug!(excluded = ?report.excluded, "artifact components removed");
                    data = clean;
                }
                Err(error) => {
                    // A failed decomposition degrades to the filtered signal.
                    warn!(%error, "ICA failed, continuing without artifact removal");
                }
            }
        }

        // Resample to the system rate.
        let fs_out = f64::from(self.config.sample_rate_out_hz);
        let ratio = fs_in / fs_out;
        if (ratio - ratio.round()).abs() > 1e-9 || ratio < 1.0 {
            return Err(SignalError::input_format(format!(
                "sample rate {fs_in} Hz is not an integer multiple of {fs_out} Hz"
            ))
            .into());
        }
        let factor = ratio.round() as usize;
        if factor > 1 {
            let n_out = data.ncols().div_ceil(factor);
            let mut resampled = Array2::<f32>::zeros((data.nrows(), n_out));
            for (channel, row) in data.axis_iter(Axis(0)).enumerate() {
                let samples = row.to_vec();
                let out = decimate(&samples, factor, fs_in)?;
                for (column, &value) in out.iter().enumerate() {
                    resampled[[channel, column]] = value;
                }
            }
            data = resampled;
        }

        // Per-channel standardization.
        for mut row in data.axis_iter_mut(Axis(0)) {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let variance = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let std = variance.sqrt().max(STD_CLAMP);
            row.mapv_inplace(|v| (v - mean) / std);
        }

        if !data.iter().all(|v| v.is_finite()) {
            return Err(SignalError::NonFinite {
                stage: "standardize",
            }
            .into());
        }

        ProcessedTrial::new(data, self.config.sample_rate_out_hz)
    }

    fn filter_rows(&self, data: &Array2<f32>, sections: &[Biquad]) -> CoreResult<Array2<f32>> {
        let mut filtered = Array2::<f32>::zeros(data.dim());
        for (channel, row) in data.axis_iter(Axis(0)).enumerate() {
            let samples = row.to_vec();
            let out = filtfilt(sections, &samples)?;
            for (column, &value) in out.iter().enumerate() {
                filtered[[channel, column]] = value;
            }
        }
        Ok(filtered)
    }
}
