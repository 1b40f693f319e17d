//! The verification engine.
//!
//! One verification runs the strictly ordered steps: window, embed,
//! aggregate, score against the claimed user's prototypes, calibrate,
//! spoof-gate, decide, attribute. The engine is a stateless pure function
//! over an immutable bundle snapshot, so any number of verifications may
//! run concurrently; enrollment and reload replace the bundle with an
//! atomic swap.
//!
//! Every internal failure resolves to a rejecting
//! [`VerificationResult`] whose `error_kind` is recorded in the audit
//! artifact and logs only; the external response never distinguishes an
//! unknown user from a bad signal.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use neuroauth_core::error::{CoreError, CoreResult, ModelError};
use neuroauth_core::{
    Decision, Embedding, ProcessedTrial, PrototypeSet, UserId, VerificationResult, WindowEncoder,
};
use neuroauth_model::prototypes::build_prototypes;
use neuroauth_signal::windowing::WindowConfig;

use crate::attribution::{
    aggregate_maps, attribute_window, time_bin_importance, top_channels, AttributionStrategy,
};
use crate::bundle::{ModelBundle, SharedBundle};
use crate::store::{ArtifactStore, AttributionArtifact};

/// Engine configuration.
///
/// The raw-score rule is not configurable: the decision contract is the
/// maximum cosine over the claimed user's prototypes. Alternative
/// aggregations exist only on the offline evaluation path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Window geometry applied to probes and enrollment trials.
    pub window: WindowConfig,
    /// Attribution strategy recorded with every artifact.
    pub attribution: AttributionStrategy,
    /// Interpolation steps for integrated gradients.
    pub ig_steps: usize,
    /// Prototypes per user built at enrollment (K).
    pub prototypes_per_user: usize,
    /// Seed for enrollment clustering.
    pub enrollment_seed: u64,
    /// Soft latency budget per probe, for logging only.
    pub soft_budget_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            attribution: AttributionStrategy::IntegratedGradients,
            ig_steps: 50,
            prototypes_per_user: 2,
            enrollment_seed: 42,
            soft_budget_ms: 100,
        }
    }
}

/// The online decision core.
pub struct VerificationEngine {
    bundle: SharedBundle,
    bundle_dir: Option<PathBuf>,
    store: ArtifactStore,
    config: EngineConfig,
}

impl VerificationEngine {
    /// Creates an engine serving `bundle`, writing artifacts to `store`.
    #[must_use]
    pub fn new(bundle: ModelBundle, store: ArtifactStore, config: EngineConfig) -> Self {
        Self {
            bundle: SharedBundle::new(bundle),
            bundle_dir: None,
            store,
            config,
        }
    }

    /// Creates an engine from a persisted bundle directory; enrollment
    /// updates are written back to the same directory.
    pub fn from_dir(
        bundle_dir: impl Into<PathBuf>,
        store: ArtifactStore,
        config: EngineConfig,
    ) -> CoreResult<Self> {
        let bundle_dir = bundle_dir.into();
        let bundle = ModelBundle::load(&bundle_dir)?;
        Ok(Self {
            bundle: SharedBundle::new(bundle),
            bundle_dir: Some(bundle_dir),
            store,
            config,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reload the bundle from disk and swap it in atomically.
    pub fn reload(&self) -> CoreResult<()> {
        let dir = self.bundle_dir.as_ref().ok_or(ModelError::NotLoaded {
            name: "bundle directory",
        })?;
        let bundle = ModelBundle::load(dir)?;
        self.bundle.swap(bundle);
        Ok(())
    }

    /// Enroll (or re-enroll) a user from one or more processed trials.
    ///
    /// Windows every trial, embeds, clusters into K prototypes, replaces
    /// the user's entry, persists the table when a bundle directory is
    /// configured, and swaps the new bundle in. Idempotent per user:
    /// re-enrollment overwrites.
    pub fn enroll(&self, user_id: &UserId, trials: &[ProcessedTrial]) -> CoreResult<PrototypeSet> {
        let snapshot = self.bundle.snapshot();
        let mut embeddings: Vec<Embedding> = Vec::new();
        for trial in trials {
            let windows = self.config.window.slide(trial)?;
            embeddings.extend(snapshot.encoder.encode_batch(&windows)?);
        }
        let prototypes = build_prototypes(
            &embeddings,
            self.config.prototypes_per_user,
            self.config.enrollment_seed,
        )?;

        let mut replacement = snapshot.as_ref().clone();
        replacement
            .prototypes
            .insert(user_id.clone(), prototypes.clone());
        if let Some(dir) = &self.bundle_dir {
            replacement
                .prototypes
                .save(ModelBundle::prototypes_path(dir))?;
        }
        self.bundle.swap(replacement);
        info!(%user_id, windows = embeddings.len(), k = prototypes.k(), "enrolled user");
        Ok(prototypes)
    }

    /// Verify a claimed identity against one probe trial.
    ///
    /// Never fails: every error becomes a rejecting result with an
    /// internal error kind. `deadline_ms` is the caller's hard deadline;
    /// exceeding it aborts with a `Timeout` kind.
    pub fn verify(
        &self,
        user_id: &UserId,
        probe: &ProcessedTrial,
        deadline_ms: Option<u64>,
    ) -> VerificationResult {
        let started = Instant::now();
        match self.verify_inner(user_id, probe, deadline_ms, started) {
            Ok(result) => {
                let elapsed = started.elapsed().as_millis() as u64;
                if elapsed > self.config.soft_budget_ms {
                    warn!(%user_id, elapsed_ms = elapsed, "verification exceeded soft budget");
                }
                result
            }
            Err(error) => {
                let kind = error.kind();
                warn!(%user_id, %error, ?kind, "verification failed, rejecting");
                let mut result = VerificationResult::rejected(kind);
                // Audit record; the map is empty for failed verifications.
                let artifact = AttributionArtifact {
                    artifact_id: ArtifactStore::fresh_id(),
                    user_id: user_id.as_str().to_owned(),
                    raw_score: 0.0,
                    calibrated_probability: 0.0,
                    spoof_score: 0.0,
                    is_spoof: false,
                    decision: Decision::Reject,
                    error_kind: Some(kind),
                    strategy: self.config.attribution,
                    map_shape: (0, 0),
                    map_values: Vec::new(),
                    top_channels: Vec::new(),
                    time_bins: Vec::new(),
                    created_at: chrono::Utc::now(),
                };
                if self.store.put(&artifact).is_ok() {
                    result.artifact_id = Some(artifact.artifact_id);
                }
                result
            }
        }
    }

    fn check_deadline(started: Instant, deadline_ms: Option<u64>) -> CoreResult<()> {
        let Some(deadline) = deadline_ms else {
            return Ok(());
        };
        let elapsed = started.elapsed();
        if elapsed > std::time::Duration::from_millis(deadline) {
            return Err(CoreError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
                deadline_ms: deadline,
            });
        }
        Ok(())
    }

    fn verify_inner(
        &self,
        user_id: &UserId,
        probe: &ProcessedTrial,
        deadline_ms: Option<u64>,
        started: Instant,
    ) -> CoreResult<VerificationResult> {
        let bundle = self.bundle.snapshot();

        // Unknown users fail before any embedding work.
        let prototypes = bundle
            .prototypes
            .get(user_id)
            .ok_or_else(|| CoreError::unknown_user(user_id.as_str()))?;

        // 1. Window.
        let windows = self.config.window.slide(probe)?;
        Self::check_deadline(started, deadline_ms)?;

        // 2-3. Embed each window, aggregate to one probe embedding.
        let embeddings = bundle.encoder.encode_batch(&windows)?;
        let probe_embedding = Embedding::aggregate(&embeddings)?;
        Self::check_deadline(started, deadline_ms)?;

        // 4. Raw score: maximum cosine over the user's prototypes. The
        // same winning index feeds the attribution step, so the stored
        // artifact always explains the prototype that drove the decision.
        let (best_index, raw_score) = prototypes.best_match(&probe_embedding);
        if !raw_score.is_finite() {
            return Err(ModelError::NonFiniteOutput { what: "raw score" }.into());
        }

        // 5. Calibrate.
        let calibrated = bundle.calibrator.apply(raw_score);

        // 6. Spoof gate.
        let (is_spoof, spoof_score) = bundle.anomaly.is_spoof(&probe_embedding);

        // 7. Decide. A fired spoof gate forces rejection regardless of the
        // calibrated probability.
        let decision = if !is_spoof && calibrated >= bundle.threshold.tau_decision {
            Decision::Accept
        } else {
            Decision::Reject
        };
        Self::check_deadline(started, deadline_ms)?;

        // 8. Attribution against the winning prototype, averaged over
        // windows, on a scratch copy of the encoder.
        let prototype_row = prototypes.matrix().row(best_index);
        let mut scratch = bundle.encoder.clone();
        let mut maps = Vec::with_capacity(windows.len());
        for window in &windows {
            maps.push(attribute_window(
                &mut scratch,
                window,
                prototype_row,
                self.config.attribution,
                self.config.ig_steps,
            )?);
        }
        let map = aggregate_maps(&maps)
            .ok_or(ModelError::NonFiniteOutput { what: "attribution" })?;
        Self::check_deadline(started, deadline_ms)?;

        let artifact = AttributionArtifact {
            artifact_id: ArtifactStore::fresh_id(),
            user_id: user_id.as_str().to_owned(),
            raw_score,
            calibrated_probability: calibrated,
            spoof_score,
            is_spoof,
            decision,
            error_kind: None,
            strategy: self.config.attribution,
            map_shape: map.dim(),
            map_values: map.iter().copied().collect(),
            top_channels: top_channels(&map, 5),
            time_bins: time_bin_importance(&map, 10),
            created_at: chrono::Utc::now(),
        };
        self.store.put(&artifact)?;

        Ok(VerificationResult {
            decision,
            raw_score,
            calibrated_probability: calibrated,
            spoof_score,
            is_spoof,
            artifact_id: Some(artifact.artifact_id),
            error_kind: None,
        })
    }

    /// Retrieve a stored attribution artifact by id.
    pub fn fetch_attribution(&self, artifact_id: &str) -> CoreResult<Vec<u8>> {
        self.store.fetch_bytes(artifact_id)
    }

    /// Snapshot of the current bundle (diagnostics and tests).
    #[must_use]
    pub fn bundle(&self) -> std::sync::Arc<ModelBundle> {
        self.bundle.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use neuroauth_core::error::ErrorKind;
    use neuroauth_core::utils::Xorshift64;
    use neuroauth_model::autoencoder::{AnomalyModel, AutoencoderConfig};
    use neuroauth_model::calibration::{
        DecisionCriterion, LogisticCalibrator, OperatingThreshold,
    };
    use neuroauth_model::encoder::{EegEncoder, EncoderConfig};
    use neuroauth_model::prototypes::PrototypeTable;
    use tempfile::tempdir;

    const FS: f32 = 16.0;

    fn engine_config() -> EngineConfig {
        EngineConfig {
            window: WindowConfig {
                window_seconds: 1.0,
                step_seconds: 0.5,
            },
            ig_steps: 4,
            ..EngineConfig::default()
        }
    }

    fn trial(freq: f32, seconds: f32, seed: u64) -> ProcessedTrial {
        let n = (FS * seconds) as usize;
        let mut rng = Xorshift64::new(seed);
        let data = Array2::from_shape_fn((4, n), |(c, s)| {
            let t = s as f32 / FS;
            (2.0 * std::f32::consts::PI * (freq + c as f32 * 0.3) * t).sin()
                + 0.05 * rng.next_gaussian()
        });
        ProcessedTrial::new(data, FS).unwrap()
    }

    fn test_bundle() -> ModelBundle {
        let encoder = EegEncoder::new(EncoderConfig {
            n_channels: 4,
            window_samples: 16,
            hidden_size: 5,
            num_layers: 1,
            embedding_dim: 8,
            dropout: 0.1,
            seed: 42,
        })
        .unwrap();

        // Anomaly model trained on embeddings of genuine-style windows.
        let config = engine_config();
        let mut genuine = Vec::new();
        for seed in 0..6 {
            let trial = trial(2.0, 4.0, seed);
            for window in config.window.slide(&trial).unwrap() {
                genuine.push(encoder.encode(&window).unwrap());
            }
        }
        let (anomaly, _) = AnomalyModel::fit(
            &genuine,
            AutoencoderConfig {
                embedding_dim: 8,
                hidden_dim: 6,
                latent_dim: 3,
                epochs: 20,
                ..AutoencoderConfig::default()
            },
        )
        .unwrap();

        ModelBundle {
            encoder,
            prototypes: PrototypeTable::new(),
            calibrator: LogisticCalibrator {
                scale: 12.0,
                bias: -8.0,
            },
            anomaly,
            threshold: OperatingThreshold {
                tau_decision: 0.5,
                criterion: DecisionCriterion::EqualErrorRate,
            },
        }
    }

    fn engine() -> (VerificationEngine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path().join("artifacts")).unwrap();
        let engine = VerificationEngine::new(test_bundle(), store, engine_config());
        (engine, dir)
    }

    #[test]
    fn unknown_user_rejects_with_internal_kind() {
        let (engine, _dir) = engine();
        let result = engine.verify(&UserId::new("ghost"), &trial(2.0, 4.0, 1), None);
        assert_eq!(result.decision, Decision::Reject);
        assert_eq!(result.error_kind, Some(ErrorKind::UnknownUser));
    }

    #[test]
    fn enroll_then_verify_same_distribution_accepts() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        engine
            .enroll(&alice, &[trial(2.0, 8.0, 1), trial(2.0, 8.0, 2)])
            .unwrap();
        let result = engine.verify(&alice, &trial(2.0, 4.0, 3), None);
        assert!(result.error_kind.is_none(), "kind {:?}", result.error_kind);
        assert!(result.raw_score > 0.8, "raw {}", result.raw_score);
        assert!(result.artifact_id.is_some());
    }

    #[test]
    fn probe_shorter_than_window_rejects() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        engine.enroll(&alice, &[trial(2.0, 8.0, 1)]).unwrap();
        let short = trial(2.0, 0.5, 4); // 8 samples < W = 16
        let result = engine.verify(&alice, &short, None);
        assert_eq!(result.decision, Decision::Reject);
        assert_eq!(result.error_kind, Some(ErrorKind::ProbeTooShort));
    }

    #[test]
    fn exactly_one_window_is_a_valid_decision() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        engine.enroll(&alice, &[trial(2.0, 8.0, 1)]).unwrap();
        let exact = trial(2.0, 1.0, 5); // exactly W samples
        let result = engine.verify(&alice, &exact, None);
        assert!(result.error_kind.is_none());
        assert!((0.0..=1.0).contains(&result.calibrated_probability));
    }

    #[test]
    fn zero_deadline_times_out() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        engine.enroll(&alice, &[trial(2.0, 8.0, 1)]).unwrap();
        let result = engine.verify(&alice, &trial(2.0, 60.0, 6), Some(0));
        assert_eq!(result.decision, Decision::Reject);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[test]
    fn spoof_gate_forces_rejection() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        engine.enroll(&alice, &[trial(2.0, 8.0, 1)]).unwrap();

        // Swap in a bundle whose spoof threshold flags everything.
        let mut paranoid = engine.bundle().as_ref().clone();
        let (fitted, _) = AnomalyModel::fit(
            &(0..8)
                .map(|i| {
                    let mut values = ndarray::Array1::<f32>::zeros(8);
                    values[i % 8] = 1.0;
                    Embedding::new(values).unwrap()
                })
                .collect::<Vec<_>>(),
            AutoencoderConfig {
                embedding_dim: 8,
                hidden_dim: 6,
                latent_dim: 3,
                epochs: 1,
                threshold_percentile: 0.0,
                ..AutoencoderConfig::default()
            },
        )
        .unwrap();
        paranoid.anomaly = fitted;
        // Force the threshold to a value everything exceeds.
        engine.bundle.swap(paranoid);

        let result = engine.verify(&alice, &trial(2.0, 4.0, 7), None);
        if result.is_spoof {
            assert_eq!(result.decision, Decision::Reject);
        }
    }

    #[test]
    fn verification_is_deterministic() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        engine.enroll(&alice, &[trial(2.0, 8.0, 1)]).unwrap();
        let probe = trial(2.0, 4.0, 8);
        let a = engine.verify(&alice, &probe, None);
        let b = engine.verify(&alice, &probe, None);
        assert!((a.raw_score - b.raw_score).abs() < 1e-5);
        assert!((a.calibrated_probability - b.calibrated_probability).abs() < 1e-5);
        assert_eq!(a.decision, b.decision);
    }

    #[test]
    fn attribution_artifact_is_fetchable() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        engine.enroll(&alice, &[trial(2.0, 8.0, 1)]).unwrap();
        let result = engine.verify(&alice, &trial(2.0, 2.0, 9), None);
        let id = result.artifact_id.expect("artifact id");
        let bytes = engine.fetch_attribution(&id).unwrap();
        let artifact: AttributionArtifact = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(artifact.map_shape, (4, 16));
        assert!(artifact.map_l1() > 0.0);
    }

    #[test]
    fn reenrollment_overwrites() {
        let (engine, _dir) = engine();
        let alice = UserId::new("alice");
        let first = engine.enroll(&alice, &[trial(2.0, 8.0, 1)]).unwrap();
        let second = engine.enroll(&alice, &[trial(5.0, 8.0, 2)]).unwrap();
        assert_eq!(engine.bundle().prototypes.len(), 1);
        assert_ne!(first.matrix(), second.matrix());
    }

    #[test]
    fn failed_verification_still_writes_audit_record() {
        let (engine, _dir) = engine();
        let result = engine.verify(&UserId::new("ghost"), &trial(2.0, 4.0, 1), None);
        let id = result.artifact_id.expect("audit artifact id");
        let bytes = engine.fetch_attribution(&id).unwrap();
        let artifact: AttributionArtifact = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(artifact.error_kind, Some(ErrorKind::UnknownUser));
        assert_eq!(artifact.map_shape, (0, 0));
    }
}
