//! Training configuration.
//!
//! [`TrainingConfig`] is the single source of truth for dataset shapes,
//! optimization hyperparameters, and artifact-fitting settings. All fields
//! have documented defaults; the struct round-trips through JSON so a run
//! is reproducible from the file plus its seed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use neuroauth_core::error::{CoreError, CoreResult};
use neuroauth_model::DecisionCriterion;

/// Complete configuration for one training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    // -----------------------------------------------------------------------
    // Data / signal
    // -----------------------------------------------------------------------
    /// Number of canonical channels. Default: **48**.
    pub n_channels: usize,

    /// Sample rate after preprocessing, in Hz. Default: **128**.
    pub sample_rate_out: f32,

    /// Window length in seconds. Default: **2.0**.
    pub window_seconds: f32,

    /// Window stride in seconds. Default: **1.0**.
    pub step_seconds: f32,

    // -----------------------------------------------------------------------
    // Model
    // -----------------------------------------------------------------------
    /// Embedding dimensionality. Default: **128**.
    pub embedding_dim: usize,

    /// Recurrent hidden width per direction. Default: **128**.
    pub hidden_size: usize,

    /// Stacked bidirectional layers. Default: **2**.
    pub num_layers: usize,

    /// Dropout probability during training. Default: **0.3**.
    pub dropout: f32,

    // -----------------------------------------------------------------------
    // Optimization
    // -----------------------------------------------------------------------
    /// Mini-batch size. Default: **64**.
    pub batch_size: usize,

    /// Initial AdamW learning rate. Default: **1e-3**.
    pub learning_rate: f32,

    /// Decoupled weight decay. Default: **1e-4**.
    pub weight_decay: f32,

    /// Classification warmup epochs (phase 1). Default: **3**.
    pub warmup_epochs: usize,

    /// Metric-learning epochs (phase 2). Default: **30**.
    pub metric_epochs: usize,

    /// Early-stopping patience on validation metric loss. Default: **7**.
    pub early_stopping_patience: usize,

    /// Plateau scheduler shrink factor. Default: **0.5**.
    pub plateau_factor: f32,

    /// Plateau scheduler patience in epochs. Default: **5**.
    pub plateau_patience: usize,

    /// Gradient clipping threshold (global L2 norm). Default: **1.0**.
    pub grad_clip_norm: f32,

    /// Proxy-anchor margin δ. Default: **0.1**.
    pub proxy_margin: f32,

    /// Proxy-anchor scaling α. Default: **32**.
    pub proxy_alpha: f32,

    // -----------------------------------------------------------------------
    // Derived artifacts
    // -----------------------------------------------------------------------
    /// Prototypes per user (K). Default: **2**.
    pub prototypes_per_user: usize,

    /// Percentile of genuine validation reconstruction errors at which
    /// `τ_spoof` is set. Default: **99**.
    pub spoof_threshold_percentile: f32,

    /// Impostor users sampled per validation embedding when building
    /// calibration pairs. Default: **3**.
    pub calibration_impostors: usize,

    /// Criterion for the operating threshold. Default: equal-error rate.
    pub decision_criterion: DecisionCriterion,

    // -----------------------------------------------------------------------
    // Infrastructure
    // -----------------------------------------------------------------------
    /// Directory for training checkpoints.
    pub checkpoint_dir: PathBuf,

    /// Global seed for shuffling, augmentation, and initialisation.
    pub seed: u64,

    /// Fast mode: shrink both phases to one epoch for smoke runs.
    pub fast: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            n_channels: neuroauth_core::N_CHANNELS,
            sample_rate_out: neuroauth_core::SAMPLE_RATE_OUT,
            window_seconds: 2.0,
            step_seconds: 1.0,
            embedding_dim: neuroauth_core::EMBEDDING_DIM,
            hidden_size: 128,
            num_layers: 2,
            dropout: 0.3,
            batch_size: 64,
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            warmup_epochs: 3,
            metric_epochs: 30,
            early_stopping_patience: 7,
            plateau_factor: 0.5,
            plateau_patience: 5,
            grad_clip_norm: 1.0,
            proxy_margin: 0.1,
            proxy_alpha: 32.0,
            prototypes_per_user: 2,
            spoof_threshold_percentile: 99.0,
            calibration_impostors: 3,
            decision_criterion: DecisionCriterion::EqualErrorRate,
            checkpoint_dir: PathBuf::from("checkpoints"),
            seed: 42,
            fast: false,
        }
    }
}

impl TrainingConfig {
    /// Validates parameter ranges.
    pub fn validate(&self) -> CoreResult<()> {
        if self.n_channels == 0 || self.embedding_dim == 0 || self.hidden_size == 0 {
            return Err(CoreError::configuration("model dimensions must be non-zero"));
        }
        if self.window_seconds <= 0.0 || self.step_seconds <= 0.0 {
            return Err(CoreError::configuration("window geometry must be positive"));
        }
        if self.batch_size == 0 {
            return Err(CoreError::configuration("batch size must be non-zero"));
        }
        if self.learning_rate <= 0.0 {
            return Err(CoreError::configuration("learning rate must be positive"));
        }
        if self.prototypes_per_user == 0 {
            return Err(CoreError::configuration("prototypes_per_user must be ≥ 1"));
        }
        if !(0.0..=100.0).contains(&self.spoof_threshold_percentile) {
            return Err(CoreError::configuration(
                "spoof threshold percentile must be in [0, 100]",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(CoreError::configuration("dropout must be in [0, 1)"));
        }
        Ok(())
    }

    /// Epoch counts after applying fast mode.
    #[must_use]
    pub fn effective_epochs(&self) -> (usize, usize) {
        if self.fast {
            (1, 1)
        } else {
            (self.warmup_epochs, self.metric_epochs)
        }
    }

    /// Window length in samples.
    #[must_use]
    pub fn window_samples(&self) -> usize {
        (self.window_seconds * self.sample_rate_out) as usize
    }

    /// The encoder architecture this config describes.
    #[must_use]
    pub fn encoder_config(&self) -> neuroauth_model::EncoderConfig {
        neuroauth_model::EncoderConfig {
            n_channels: self.n_channels,
            window_samples: self.window_samples(),
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            embedding_dim: self.embedding_dim,
            dropout: self.dropout,
            seed: self.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = TrainingConfig::default();
        config.validate().expect("default config must validate");
        assert_eq!(config.n_channels, 48);
        assert_eq!(config.embedding_dim, 128);
        assert_eq!(config.prototypes_per_user, 2);
        assert_eq!(config.window_samples(), 256);
    }

    #[test]
    fn fast_mode_shrinks_epochs() {
        let config = TrainingConfig {
            fast: true,
            ..TrainingConfig::default()
        };
        assert_eq!(config.effective_epochs(), (1, 1));
    }

    #[test]
    fn invalid_configs_rejected() {
        let config = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TrainingConfig {
            dropout: 1.0,
            ..TrainingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let config = TrainingConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.batch_size, config.batch_size);
        assert_eq!(restored.seed, config.seed);
        assert_eq!(restored.decision_criterion, config.decision_criterion);
    }
}
