//! The serving model bundle and its hot swap.
//!
//! A bundle is the immutable value the engine serves from: encoder
//! weights, the per-user prototype table, calibrator parameters, the
//! anomaly model, and the operating threshold. On disk it is a directory
//! of versioned JSON artifacts. Replacement is an atomic `Arc` swap behind
//! a `parking_lot` lock; nothing is mutated in place while serving.

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use neuroauth_core::error::{CoreResult, ModelError};
use neuroauth_model::autoencoder::AnomalyModel;
use neuroauth_model::calibration::{LogisticCalibrator, OperatingThreshold};
use neuroauth_model::encoder::EegEncoder;
use neuroauth_model::prototypes::PrototypeTable;

/// File names inside a bundle directory.
const ENCODER_FILE: &str = "encoder.json";
const PROTOTYPES_FILE: &str = "prototypes.json";
const CALIBRATOR_FILE: &str = "calibrator.json";
const ANOMALY_FILE: &str = "anomaly.json";
const THRESHOLD_FILE: &str = "threshold.json";

/// Everything the engine needs to decide, loaded once and shared
/// read-only.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    /// The trained sequence encoder.
    pub encoder: EegEncoder,
    /// Per-user prototype sets.
    pub prototypes: PrototypeTable,
    /// Raw-score calibrator.
    pub calibrator: LogisticCalibrator,
    /// Spoof autoencoder with `τ_spoof`.
    pub anomaly: AnomalyModel,
    /// Decision threshold `τ_decision`.
    pub threshold: OperatingThreshold,
}

impl ModelBundle {
    /// Load a bundle from its directory, validating every artifact.
    pub fn load(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(ModelError::load_failed(
                dir.display().to_string(),
                "bundle directory does not exist",
            )
            .into());
        }
        let encoder = EegEncoder::load(dir.join(ENCODER_FILE))?;
        let prototypes = PrototypeTable::load(dir.join(PROTOTYPES_FILE))?;
        let calibrator = LogisticCalibrator::load(dir.join(CALIBRATOR_FILE))?;
        let anomaly = AnomalyModel::load(dir.join(ANOMALY_FILE))?;
        let threshold = OperatingThreshold::load(dir.join(THRESHOLD_FILE))?;

        // Cross-artifact consistency: prototype dimensionality must match
        // the encoder's embedding space.
        let dim = encoder.config().embedding_dim;
        for (_, set) in prototypes.iter() {
            if set.dim() != dim {
                return Err(ModelError::ShapeMismatch {
                    expected: vec![dim],
                    actual: vec![set.dim()],
                }
                .into());
            }
        }

        info!(
            dir = %dir.display(),
            users = prototypes.len(),
            tau_decision = threshold.tau_decision,
            "loaded model bundle"
        );
        Ok(Self {
            encoder,
            prototypes,
            calibrator,
            anomaly,
            threshold,
        })
    }

    /// Persist every artifact into `dir` (created if missing).
    pub fn save(&self, dir: impl AsRef<Path>) -> CoreResult<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            neuroauth_core::error::StorageError::io(dir.display().to_string(), e)
        })?;
        self.encoder.save(dir.join(ENCODER_FILE))?;
        self.prototypes.save(dir.join(PROTOTYPES_FILE))?;
        self.calibrator.save(dir.join(CALIBRATOR_FILE))?;
        self.anomaly.save(dir.join(ANOMALY_FILE))?;
        self.threshold.save(dir.join(THRESHOLD_FILE))?;
        Ok(())
    }

    /// Path of the prototype table inside a bundle directory.
    #[must_use]
    pub fn prototypes_path(dir: &Path) -> PathBuf {
        dir.join(PROTOTYPES_FILE)
    }
}

/// Shared handle to the current bundle.
///
/// Readers clone the `Arc` and keep serving from their snapshot; a reload
/// swaps the pointer atomically, so in-flight verifications finish on the
/// bundle they started with.
#[derive(Debug, Clone)]
pub struct SharedBundle {
    inner: Arc<RwLock<Arc<ModelBundle>>>,
}

impl SharedBundle {
    /// Wrap a freshly loaded bundle.
    #[must_use]
    pub fn new(bundle: ModelBundle) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(bundle))),
        }
    }

    /// Snapshot the current bundle.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ModelBundle> {
        self.inner.read().clone()
    }

    /// Atomically replace the served bundle.
    pub fn swap(&self, bundle: ModelBundle) {
        *self.inner.write() = Arc::new(bundle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};
    use neuroauth_core::utils::Xorshift64;
    use neuroauth_core::{Embedding, UserId};
    use neuroauth_model::autoencoder::AutoencoderConfig;
    use neuroauth_model::calibration::DecisionCriterion;
    use neuroauth_model::encoder::EncoderConfig;
    use neuroauth_model::prototypes::build_prototypes;
    use tempfile::tempdir;

    fn tiny_encoder_config() -> EncoderConfig {
        EncoderConfig {
            n_channels: 4,
            window_samples: 12,
            hidden_size: 5,
            num_layers: 1,
            embedding_dim: 8,
            dropout: 0.1,
            seed: 42,
        }
    }

    fn embeddings(seed: u64) -> Vec<Embedding> {
        let mut rng = Xorshift64::new(seed);
        (0..40)
            .map(|i| {
                let mut values = Array1::<f32>::zeros(8);
                values[i % 2] = 1.0;
                for value in values.iter_mut() {
                    *value += rng.next_gaussian() * 0.05;
                }
                Embedding::new(values).unwrap()
            })
            .collect()
    }

    fn tiny_bundle() -> ModelBundle {
        let encoder = EegEncoder::new(tiny_encoder_config()).unwrap();
        let mut prototypes = PrototypeTable::new();
        prototypes.insert(
            UserId::new("alice"),
            build_prototypes(&embeddings(1), 2, 7).unwrap(),
        );
        let (anomaly, _) = AnomalyModel::fit(
            &embeddings(2),
            AutoencoderConfig {
                embedding_dim: 8,
                hidden_dim: 6,
                latent_dim: 3,
                epochs: 10,
                ..AutoencoderConfig::default()
            },
        )
        .unwrap();
        ModelBundle {
            encoder,
            prototypes,
            calibrator: LogisticCalibrator {
                scale: 10.0,
                bias: -5.0,
            },
            anomaly,
            threshold: OperatingThreshold {
                tau_decision: 0.5,
                criterion: DecisionCriterion::EqualErrorRate,
            },
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let bundle = tiny_bundle();
        bundle.save(dir.path()).unwrap();
        let restored = ModelBundle::load(dir.path()).unwrap();
        assert_eq!(restored.prototypes.len(), 1);
        assert_eq!(restored.calibrator, bundle.calibrator);
        assert_eq!(
            restored.threshold.tau_decision,
            bundle.threshold.tau_decision
        );

        // Identical verification-relevant outputs after reload.
        let mut rng = Xorshift64::new(3);
        let window =
            neuroauth_core::Window::new(Array2::from_shape_fn((4, 12), |_| rng.next_gaussian()));
        use neuroauth_core::WindowEncoder;
        let a = bundle.encoder.encode(&window).unwrap();
        let b = restored.encoder.encode(&window).unwrap();
        for (x, y) in a.values().iter().zip(b.values().iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn missing_directory_is_load_error() {
        let err = ModelBundle::load("/nonexistent/bundle").unwrap_err();
        assert!(err.to_string().contains("bundle directory"));
    }

    #[test]
    fn shared_bundle_swap_is_visible() {
        let shared = SharedBundle::new(tiny_bundle());
        assert_eq!(shared.snapshot().prototypes.len(), 1);

        let mut replacement = tiny_bundle();
        replacement.prototypes.insert(
            UserId::new("bob"),
            build_prototypes(&embeddings(9), 2, 8).unwrap(),
        );
        shared.swap(replacement);
        assert_eq!(shared.snapshot().prototypes.len(), 2);
    }

    #[test]
    fn snapshot_outlives_swap() {
        let shared = SharedBundle::new(tiny_bundle());
        let snapshot = shared.snapshot();
        shared.swap(tiny_bundle());
        // The old snapshot still works.
        assert_eq!(snapshot.prototypes.len(), 1);
    }
}
