//! Two-phase training orchestrator.
//!
//! Phase 1 (warmup) minimises cross-entropy on the user-classification
//! head over augmented windows to break symmetry. Phase 2 discards the
//! head and minimises the proxy-anchor metric loss directly on unit-norm
//! embeddings, with early stopping on validation metric loss.
//!
//! Training is a batch job: non-finite losses or gradients abort the run.
//! Checkpoints are written on validation improvement and can be resumed.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

use neuroauth_core::error::{CoreResult, ModelError, StorageError};
use neuroauth_core::utils::Xorshift64;
use neuroauth_core::Window;
use neuroauth_model::encoder::EegEncoder;
use neuroauth_model::loss::{argmax, cross_entropy, ProxyAnchorLoss};
use neuroauth_model::optim::{clip_grad_norm, AdamW, PlateauScheduler};
use neuroauth_signal::augment::{AugmentConfig, Augmenter};

use crate::config::TrainingConfig;
use crate::dataset::{DatasetSplits, WindowSet};

/// Training phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Classification warmup.
    Warmup,
    /// Proxy-anchor metric learning.
    Metric,
}

/// Statistics for one completed epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochStats {
    /// Which phase the epoch belonged to.
    pub phase: Phase,
    /// Epoch index within the phase.
    pub epoch: usize,
    /// Mean training loss.
    pub train_loss: f32,
    /// Validation loss (same objective as training).
    pub val_loss: f32,
    /// Classification accuracy (warmup only).
    pub accuracy: Option<f32>,
    /// Learning rate used this epoch.
    pub lr: f32,
    /// Pre-clip global gradient norm of the last batch.
    pub grad_norm: f32,
}

/// Result of a completed training run.
#[derive(Debug)]
pub struct TrainingOutcome {
    /// Per-epoch statistics, both phases.
    pub history: Vec<EpochStats>,
    /// Best validation metric loss reached in phase 2.
    pub best_val_loss: f32,
}

/// Serializable training checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Artifact format version.
    pub format_version: u32,
    /// Completed warmup epochs.
    pub warmup_done: usize,
    /// Completed metric epochs.
    pub metric_done: usize,
    /// Encoder parameters.
    pub encoder_params: Vec<f32>,
    /// Warmup head parameters (empty once the head is discarded).
    pub head_params: Vec<f32>,
    /// Proxy parameters (empty during warmup).
    pub proxy_params: Vec<f32>,
    /// Adam first moment.
    pub optimizer_m: Vec<f32>,
    /// Adam second moment.
    pub optimizer_v: Vec<f32>,
    /// Adam step count.
    pub optimizer_t: u64,
    /// Best validation loss so far.
    pub best_val_loss: f32,
    /// Epoch history.
    pub history: Vec<EpochStats>,
    /// When the checkpoint was written (UTC).
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Checkpoint {
    /// Write the checkpoint as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(self)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        Ok(())
    }

    /// Read a checkpoint from JSON.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        serde_json::from_str(&json)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()).into())
    }
}

/// The training orchestrator.
pub struct Trainer {
    config: TrainingConfig,
    encoder: EegEncoder,
    proxy_loss: Option<ProxyAnchorLoss>,
    augmenter: Augmenter,
    rng: Xorshift64,
    history: Vec<EpochStats>,
    best_val_loss: f32,
    best_encoder_params: Option<Vec<f32>>,
    warmup_done: usize,
    metric_done: usize,
    optimizer_state: Option<(Vec<f32>, Vec<f32>, u64)>,
}

impl Trainer {
    /// Creates a trainer with a freshly initialised encoder.
    pub fn new(config: TrainingConfig) -> CoreResult<Self> {
        config.validate()?;
        let encoder = EegEncoder::new(config.encoder_config())?;
        let augmenter = Augmenter::new(AugmentConfig::default(), config.sample_rate_out);
        Ok(Self {
            rng: Xorshift64::new(config.seed),
            encoder,
            proxy_loss: None,
            augmenter,
            history: Vec::new(),
            best_val_loss: f32::INFINITY,
            best_encoder_params: None,
            warmup_done: 0,
            metric_done: 0,
            optimizer_state: None,
            config,
        })
    }

    /// Restores a trainer from a checkpoint (restart-and-resume).
    pub fn from_checkpoint(
        config: TrainingConfig,
        n_users: usize,
        checkpoint: &Checkpoint,
    ) -> CoreResult<Self> {
        let mut trainer = Self::new(config)?;
        trainer.encoder.unflatten_params(&checkpoint.encoder_params)?;
        if !checkpoint.head_params.is_empty() {
            trainer.encoder.attach_classifier(n_users);
            trainer
                .encoder
                .unflatten_head_params(&checkpoint.head_params)?;
        }
        if !checkpoint.proxy_params.is_empty() {
            let mut proxy_loss = trainer.make_proxy_loss(n_users)?;
            proxy_loss.unflatten_params(&checkpoint.proxy_params)?;
            trainer.proxy_loss = Some(proxy_loss);
        }
        trainer.warmup_done = checkpoint.warmup_done;
        trainer.metric_done = checkpoint.metric_done;
        trainer.best_val_loss = checkpoint.best_val_loss;
        trainer.history = checkpoint.history.clone();
        trainer.optimizer_state = Some((
            checkpoint.optimizer_m.clone(),
            checkpoint.optimizer_v.clone(),
            checkpoint.optimizer_t,
        ));
        info!(
            warmup_done = trainer.warmup_done,
            metric_done = trainer.metric_done,
            "resumed trainer from checkpoint"
        );
        Ok(trainer)
    }

    fn make_proxy_loss(&self, n_users: usize) -> CoreResult<ProxyAnchorLoss> {
        ProxyAnchorLoss::new(
            n_users,
            self.config.embedding_dim,
            self.config.proxy_margin,
            self.config.proxy_alpha,
            self.config.seed.wrapping_add(400),
        )
    }

    /// The trained encoder (head detached after phase 2).
    #[must_use]
    pub fn encoder(&self) -> &EegEncoder {
        &self.encoder
    }

    /// Epoch history so far.
    #[must_use]
    pub fn history(&self) -> &[EpochStats] {
        &self.history
    }

    /// Runs both phases to completion.
    pub fn train(&mut self, splits: &DatasetSplits) -> CoreResult<TrainingOutcome> {
        let n_users = splits.n_users();
        let (warmup_epochs, metric_epochs) = self.config.effective_epochs();

        // Phase 1: warmup with the classification head.
        if self.warmup_done < warmup_epochs {
            if !self.encoder.has_classifier() {
                self.encoder.attach_classifier(n_users);
            }
            let mut optimizer = AdamW::new(self.config.learning_rate, self.config.weight_decay);
            if let Some((m, v, t)) = self.optimizer_state.take() {
                optimizer.load_state(m, v, t);
            }
            let mut scheduler = PlateauScheduler::new(
                self.config.plateau_factor,
                self.config.plateau_patience,
                1e-6,
            );
            for epoch in self.warmup_done..warmup_epochs {
                let stats = self.warmup_epoch(splits, &mut optimizer, epoch)?;
                let lr = scheduler.step(stats.val_loss, optimizer.lr());
                optimizer.set_lr(lr);
                info!(
                    epoch,
                    train_loss = stats.train_loss,
                    val_loss = stats.val_loss,
                    accuracy = stats.accuracy.unwrap_or(0.0),
                    "warmup epoch complete"
                );
                self.history.push(stats);
                self.warmup_done = epoch + 1;
                self.write_checkpoint(&optimizer)?;
            }
        }

        // Phase 2: discard the head, learn the metric space.
        self.encoder.detach_classifier();
        if self.proxy_loss.is_none() {
            self.proxy_loss = Some(self.make_proxy_loss(n_users)?);
        }
        let mut optimizer = AdamW::new(self.config.learning_rate, self.config.weight_decay);
        if let Some((m, v, t)) = self.optimizer_state.take() {
            optimizer.load_state(m, v, t);
        }
        let mut scheduler = PlateauScheduler::new(
            self.config.plateau_factor,
            self.config.plateau_patience,
            1e-6,
        );
        let mut epochs_without_improvement = 0usize;
        for epoch in self.metric_done..metric_epochs {
            let stats = self.metric_epoch(splits, &mut optimizer, epoch)?;
            let lr = scheduler.step(stats.val_loss, optimizer.lr());
            optimizer.set_lr(lr);
            info!(
                epoch,
                train_loss = stats.train_loss,
                val_loss = stats.val_loss,
                "metric epoch complete"
            );

            let improved = stats.val_loss < self.best_val_loss;
            let stats_val_loss = stats.val_loss;
            self.history.push(stats);
            self.metric_done = epoch + 1;
            if improved {
                self.best_val_loss = stats_val_loss;
                self.best_encoder_params = Some(self.encoder.flatten_params());
                epochs_without_improvement = 0;
                self.write_checkpoint(&optimizer)?;
            } else {
                epochs_without_improvement += 1;
                if epochs_without_improvement >= self.config.early_stopping_patience {
                    info!(epoch, "early stopping");
                    break;
                }
            }
        }

        // Serve the best validation epoch, not the last one.
        if let Some(best) = self.best_encoder_params.clone() {
            self.encoder.unflatten_params(&best)?;
        }

        Ok(TrainingOutcome {
            history: self.history.clone(),
            best_val_loss: self.best_val_loss,
        })
    }

    fn warmup_epoch(
        &mut self,
        splits: &DatasetSplits,
        optimizer: &mut AdamW,
        epoch: usize,
    ) -> CoreResult<EpochStats> {
        let train = &splits.train;
        let mut order: Vec<usize> = (0..train.len()).collect();
        self.rng.shuffle(&mut order);

        let mut total_loss = 0.0f32;
        let mut last_grad_norm = 0.0f32;
        let batch_size = self.config.batch_size.max(1);

        for batch in order.chunks(batch_size) {
            self.encoder.zero_grad();
            let scale = 1.0 / batch.len() as f32;
            for &index in batch {
                let window = self.augmented(train, index);
                let cache = self.encoder.forward(&window, Some(&mut self.rng))?;
                let logits = self.encoder.class_logits(cache.embedding())?;
                let label = train.labels[index];
                let (loss, mut grad_logits) = cross_entropy(&logits, label);
                if !loss.is_finite() {
                    return Err(ModelError::fit_failed("non-finite warmup loss").into());
                }
                total_loss += loss;
                grad_logits.mapv_inplace(|g| g * scale);
                let grad_embedding = self
                    .encoder
                    .class_logits_backward(cache.embedding(), &grad_logits)?;
                let _ = self.encoder.backward(&cache, &grad_embedding);
            }

            let mut params = self.encoder.flatten_params();
            params.extend(self.encoder.flatten_head_params());
            let mut grads = self.encoder.flatten_grads();
            grads.extend(self.encoder.flatten_head_grads());
            last_grad_norm = clip_grad_norm(&mut grads, self.config.grad_clip_norm);
            if !last_grad_norm.is_finite() {
                return Err(ModelError::fit_failed("non-finite warmup gradients").into());
            }
            optimizer.step(&mut params, &grads);
            let encoder_count = self.encoder.param_count();
            self.encoder.unflatten_params(&params[..encoder_count])?;
            self.encoder.unflatten_head_params(&params[encoder_count..])?;
        }

        let (val_loss, val_accuracy) = self.warmup_validation(&splits.val)?;
        Ok(EpochStats {
            phase: Phase::Warmup,
            epoch,
            train_loss: total_loss / train.len().max(1) as f32,
            val_loss,
            accuracy: Some(val_accuracy),
            lr: optimizer.lr(),
            grad_norm: last_grad_norm,
        })
    }

    fn warmup_validation(&self, val: &WindowSet) -> CoreResult<(f32, f32)> {
        if val.is_empty() {
            return Ok((f32::INFINITY, 0.0));
        }
        let mut total = 0.0f32;
        let mut correct = 0usize;
        for (window, &label) in val.windows.iter().zip(val.labels.iter()) {
            let cache = self.encoder.forward(window, None)?;
            let logits = self.encoder.class_logits(cache.embedding())?;
            let (loss, _) = cross_entropy(&logits, label);
            total += loss;
            if argmax(&logits) == label {
                correct += 1;
            }
        }
        Ok((
            total / val.len() as f32,
            correct as f32 / val.len() as f32,
        ))
    }

    fn metric_epoch(
        &mut self,
        splits: &DatasetSplits,
        optimizer: &mut AdamW,
        epoch: usize,
    ) -> CoreResult<EpochStats> {
        let train = &splits.train;
        let mut order: Vec<usize> = (0..train.len()).collect();
        self.rng.shuffle(&mut order);

        let mut total_loss = 0.0f32;
        let mut batches = 0usize;
        let mut last_grad_norm = 0.0f32;
        let batch_size = self.config.batch_size.max(1);
        let dim = self.config.embedding_dim;

        for batch in order.chunks(batch_size) {
            if batch.len() < 2 {
                continue;
            }
            self.encoder.zero_grad();
            let proxy_loss = self
                .proxy_loss
                .as_mut()
                .ok_or(ModelError::NotLoaded { name: "proxies" })?;
            proxy_loss.zero_grad();

            // Forward every window in the batch, keeping caches.
            let mut caches = Vec::with_capacity(batch.len());
            let mut embeddings = Array2::<f32>::zeros((batch.len(), dim));
            let mut labels = Vec::with_capacity(batch.len());
            for (row, &index) in batch.iter().enumerate() {
                let window = self.augmented(train, index);
                let cache = self.encoder.forward(&window, Some(&mut self.rng))?;
                embeddings.row_mut(row).assign(cache.embedding());
                labels.push(train.labels[index]);
                caches.push(cache);
            }

            let proxy_loss = self
                .proxy_loss
                .as_mut()
                .ok_or(ModelError::NotLoaded { name: "proxies" })?;
            let (loss, grad_embeddings) = proxy_loss.forward_backward(&embeddings, &labels)?;
            if !loss.is_finite() {
                return Err(ModelError::fit_failed("non-finite metric loss").into());
            }
            total_loss += loss;
            batches += 1;

            for (row, cache) in caches.iter().enumerate() {
                let grad = grad_embeddings.row(row).to_owned();
                let _ = self.encoder.backward(cache, &grad);
            }

            let proxy_loss = self
                .proxy_loss
                .as_ref()
                .ok_or(ModelError::NotLoaded { name: "proxies" })?;
            let mut params = self.encoder.flatten_params();
            params.extend(proxy_loss.flatten_params());
            let mut grads = self.encoder.flatten_grads();
            grads.extend(proxy_loss.flatten_grads());
            last_grad_norm = clip_grad_norm(&mut grads, self.config.grad_clip_norm);
            if !last_grad_norm.is_finite() {
                return Err(ModelError::fit_failed("non-finite metric gradients").into());
            }
            optimizer.step(&mut params, &grads);
            let encoder_count = self.encoder.param_count();
            self.encoder.unflatten_params(&params[..encoder_count])?;
            let proxy_loss = self
                .proxy_loss
                .as_mut()
                .ok_or(ModelError::NotLoaded { name: "proxies" })?;
            proxy_loss.unflatten_params(&params[encoder_count..])?;
        }

        let val_loss = self.metric_validation(&splits.val)?;
        Ok(EpochStats {
            phase: Phase::Metric,
            epoch,
            train_loss: total_loss / batches.max(1) as f32,
            val_loss,
            accuracy: None,
            lr: optimizer.lr(),
            grad_norm: last_grad_norm,
        })
    }

    fn metric_validation(&mut self, val: &WindowSet) -> CoreResult<f32> {
        if val.is_empty() {
            return Ok(f32::INFINITY);
        }
        let dim = self.config.embedding_dim;
        let mut embeddings = Array2::<f32>::zeros((val.len(), dim));
        for (row, window) in val.windows.iter().enumerate() {
            let cache = self.encoder.forward(window, None)?;
            embeddings.row_mut(row).assign(cache.embedding());
        }
        let proxy_loss = self
            .proxy_loss
            .as_mut()
            .ok_or(ModelError::NotLoaded { name: "proxies" })?;
        let (loss, _) = proxy_loss.forward_backward(&embeddings, &val.labels)?;
        proxy_loss.zero_grad();
        Ok(loss)
    }

    /// Augmented copy of a training window, mixing with a random same-user
    /// partner when one exists.
    fn augmented(&mut self, train: &WindowSet, index: usize) -> Window {
        let label = train.labels[index];
        let partners = train.indices_of(label);
        let partner_index = if partners.len() > 1 {
            loop {
                let candidate = partners[self.rng.next_index(partners.len())];
                if candidate != index {
                    break Some(candidate);
                }
            }
        } else {
            None
        };
        let mut window = train.windows[index].clone();
        let partner = partner_index.map(|p| &train.windows[p]);
        self.augmenter.apply(&mut window, partner, &mut self.rng);
        window
    }

    fn write_checkpoint(&self, optimizer: &AdamW) -> CoreResult<()> {
        if self.config.checkpoint_dir.as_os_str().is_empty() {
            return Ok(());
        }
        if let Err(error) = std::fs::create_dir_all(&self.config.checkpoint_dir) {
            warn!(%error, "cannot create checkpoint directory, skipping checkpoint");
            return Ok(());
        }
        let (m, v, t) = optimizer.state();
        let checkpoint = Checkpoint {
            format_version: neuroauth_model::ARTIFACT_FORMAT_VERSION,
            warmup_done: self.warmup_done,
            metric_done: self.metric_done,
            encoder_params: self.encoder.flatten_params(),
            head_params: self.encoder.flatten_head_params(),
            proxy_params: self
                .proxy_loss
                .as_ref()
                .map(ProxyAnchorLoss::flatten_params)
                .unwrap_or_default(),
            optimizer_m: m,
            optimizer_v: v,
            optimizer_t: t,
            best_val_loss: self.best_val_loss,
            history: self.history.clone(),
            created_at: chrono::Utc::now(),
        };
        let path = self.config.checkpoint_dir.join("latest.json");
        checkpoint.save(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2 as NdArray2;
    use neuroauth_core::{ProcessedTrial, UserId};
    use neuroauth_signal::windowing::WindowConfig;
    use tempfile::tempdir;

    /// Tiny config so the two-phase loop runs in test time.
    fn tiny_config(checkpoint_dir: std::path::PathBuf) -> TrainingConfig {
        TrainingConfig {
            n_channels: 4,
            sample_rate_out: 16.0,
            window_seconds: 1.0,
            step_seconds: 0.5,
            embedding_dim: 8,
            hidden_size: 6,
            num_layers: 2,
            dropout: 0.1,
            batch_size: 8,
            learning_rate: 5e-3,
            warmup_epochs: 2,
            metric_epochs: 3,
            early_stopping_patience: 7,
            checkpoint_dir,
            seed: 42,
            ..TrainingConfig::default()
        }
    }

    /// Two users with distinct oscillation patterns.
    fn tiny_splits() -> DatasetSplits {
        let make_trials = |base_freq: f32, seed: u64| -> Vec<ProcessedTrial> {
            let mut rng = Xorshift64::new(seed);
            (0..6)
                .map(|_| {
                    let data = NdArray2::from_shape_fn((4, 64), |(c, s)| {
                        let t = s as f32 / 16.0;
                        (2.0 * std::f32::consts::PI * (base_freq + c as f32 * 0.3) * t).sin()
                            + 0.1 * rng.next_gaussian()
                    });
                    ProcessedTrial::new(data, 16.0).unwrap()
                })
                .collect()
        };
        let data = vec![
            (UserId::new("alice"), make_trials(2.0, 1)),
            (UserId::new("bob"), make_trials(5.0, 2)),
        ];
        let window_config = WindowConfig {
            window_seconds: 1.0,
            step_seconds: 0.5,
        };
        DatasetSplits::build(&data, &window_config).unwrap()
    }

    #[test]
    fn two_phase_training_completes() {
        let dir = tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_config(dir.path().to_path_buf())).unwrap();
        let splits = tiny_splits();
        let outcome = trainer.train(&splits).unwrap();

        let warmup_epochs: Vec<_> = outcome
            .history
            .iter()
            .filter(|s| s.phase == Phase::Warmup)
            .collect();
        let metric_epochs: Vec<_> = outcome
            .history
            .iter()
            .filter(|s| s.phase == Phase::Metric)
            .collect();
        assert_eq!(warmup_epochs.len(), 2);
        assert!(!metric_epochs.is_empty());
        assert!(outcome.history.iter().all(|s| s.train_loss.is_finite()));
        // The head must be gone after phase 2.
        assert!(!trainer.encoder().has_classifier());
    }

    #[test]
    fn metric_loss_decreases_over_training() {
        let dir = tempdir().unwrap();
        let mut config = tiny_config(dir.path().to_path_buf());
        config.metric_epochs = 6;
        let mut trainer = Trainer::new(config).unwrap();
        let splits = tiny_splits();
        let outcome = trainer.train(&splits).unwrap();
        let metric: Vec<f32> = outcome
            .history
            .iter()
            .filter(|s| s.phase == Phase::Metric)
            .map(|s| s.train_loss)
            .collect();
        assert!(
            metric.last().unwrap() <= metric.first().unwrap(),
            "metric loss did not improve: {metric:?}"
        );
    }

    #[test]
    fn checkpoint_resume_round_trip() {
        let dir = tempdir().unwrap();
        let config = tiny_config(dir.path().to_path_buf());
        let splits = tiny_splits();

        let mut trainer = Trainer::new(config.clone()).unwrap();
        let _ = trainer.train(&splits).unwrap();

        let path = dir.path().join("latest.json");
        let checkpoint = Checkpoint::load(&path).unwrap();
        assert!(checkpoint.warmup_done > 0);

        let resumed =
            Trainer::from_checkpoint(config, splits.n_users(), &checkpoint).unwrap();
        assert_eq!(resumed.warmup_done, checkpoint.warmup_done);
        assert_eq!(resumed.metric_done, checkpoint.metric_done);
        // Restored encoder produces identical embeddings.
        let window = &splits.val.windows[0];
        let a = resumed.encoder().forward(window, None).unwrap();
        let mut reference = EegEncoder::new(resumed.config.encoder_config()).unwrap();
        reference.unflatten_params(&checkpoint.encoder_params).unwrap();
        let b = reference.forward(window, None).unwrap();
        assert_eq!(a.embedding(), b.embedding());
    }

    #[test]
    fn training_is_deterministic_under_fixed_seed() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let splits = tiny_splits();

        let mut trainer_a = Trainer::new(tiny_config(dir_a.path().to_path_buf())).unwrap();
        let mut trainer_b = Trainer::new(tiny_config(dir_b.path().to_path_buf())).unwrap();
        let _ = trainer_a.train(&splits).unwrap();
        let _ = trainer_b.train(&splits).unwrap();

        assert_eq!(
            trainer_a.encoder().flatten_params(),
            trainer_b.encoder().flatten_params()
        );
    }
}
