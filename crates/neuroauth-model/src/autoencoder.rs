//! Embedding autoencoder for presentation-attack detection.
//!
//! A small MLP (`d_emb → hidden → latent → hidden → d_emb`) trained with an
//! MSE objective on genuine enrollment embeddings only. A probe embedding
//! whose reconstruction error exceeds the stored threshold is flagged as a
//! spoof: genuine embeddings lie near the manifold the autoencoder has
//! seen, synthesized or replayed signals usually do not.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use neuroauth_core::error::{CoreResult, ModelError, StorageError};
use neuroauth_core::utils::{percentile, Xorshift64};
use neuroauth_core::Embedding;

use crate::nn::{relu, relu_backward, Linear};
use crate::optim::AdamW;
use crate::ARTIFACT_FORMAT_VERSION;

/// Autoencoder hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoencoderConfig {
    /// Embedding dimensionality.
    pub embedding_dim: usize,
    /// Hidden layer width.
    pub hidden_dim: usize,
    /// Bottleneck width.
    pub latent_dim: usize,
    /// Training epochs.
    pub epochs: usize,
    /// Mini-batch size.
    pub batch_size: usize,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Fraction of embeddings held out for threshold estimation.
    pub validation_split: f32,
    /// Percentile of genuine validation errors used as the spoof threshold.
    pub threshold_percentile: f32,
    /// Seed for init, shuffling, and the split.
    pub seed: u64,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        Self {
            embedding_dim: neuroauth_core::EMBEDDING_DIM,
            hidden_dim: 64,
            latent_dim: 32,
            epochs: 50,
            batch_size: 64,
            learning_rate: 1e-3,
            validation_split: 0.2,
            threshold_percentile: 99.0,
            seed: 42,
        }
    }
}

/// The fitted anomaly detector: autoencoder weights plus `τ_spoof`.
#[derive(Debug, Clone)]
pub struct AnomalyModel {
    config: AutoencoderConfig,
    encoder_fc1: Linear,
    encoder_fc2: Linear,
    decoder_fc1: Linear,
    decoder_fc2: Linear,
    threshold: f32,
}

impl AnomalyModel {
    fn with_fresh_weights(config: AutoencoderConfig) -> Self {
        let seed = config.seed;
        Self {
            encoder_fc1: Linear::with_seed(config.embedding_dim, config.hidden_dim, seed),
            encoder_fc2: Linear::with_seed(config.hidden_dim, config.latent_dim, seed + 1),
            decoder_fc1: Linear::with_seed(config.latent_dim, config.hidden_dim, seed + 2),
            decoder_fc2: Linear::with_seed(config.hidden_dim, config.embedding_dim, seed + 3),
            threshold: f32::INFINITY,
            config,
        }
    }

    /// Train on genuine embeddings and set the threshold from held-out
    /// reconstruction errors.
    ///
    /// Returns the fitted model and the validation errors the threshold was
    /// derived from.
    pub fn fit(
        embeddings: &[Embedding],
        config: AutoencoderConfig,
    ) -> CoreResult<(Self, Vec<f32>)> {
        if embeddings.len() < 4 {
            return Err(ModelError::fit_failed(format!(
                "need at least 4 genuine embeddings, got {}",
                embeddings.len()
            ))
            .into());
        }
        let mut model = Self::with_fresh_weights(config);
        let config = model.config.clone();

        // Split train/validation.
        let mut rng = Xorshift64::new(config.seed);
        let mut indices: Vec<usize> = (0..embeddings.len()).collect();
        rng.shuffle(&mut indices);
        let n_validation = ((embeddings.len() as f32 * config.validation_split) as usize).max(1);
        let (validation_indices, train_indices) = indices.split_at(n_validation);

        let mut optimizer = AdamW::new(config.learning_rate, 0.0);
        let mut order: Vec<usize> = train_indices.to_vec();
        for epoch in 0..config.epochs {
            rng.shuffle(&mut order);
            let mut epoch_loss = 0.0f32;
            let mut batches = 0usize;
            for batch in order.chunks(config.batch_size.max(1)) {
                model.zero_grad();
                let mut batch_loss = 0.0f32;
                for &index in batch {
                    let input = embeddings[index].values().to_owned();
                    batch_loss += model.backward_mse(&input);
                }
                let scale = 1.0 / batch.len() as f32;
                let mut params = model.flatten_params();
                let grads: Vec<f32> = model.flatten_grads().iter().map(|g| g * scale).collect();
                optimizer.step(&mut params, &grads);
                model.unflatten_params(&params)?;
                epoch_loss += batch_loss * scale;
                batches += 1;
            }
            if (epoch + 1) % 10 == 0 {
                debug!(
                    epoch = epoch + 1,
                    loss = epoch_loss / batches.max(1) as f32,
                    "autoencoder epoch"
                );
            }
        }

        let validation_errors: Vec<f32> = validation_indices
            .iter()
            .map(|&index| model.reconstruction_error(&embeddings[index]))
            .collect();
        model.threshold = percentile(&validation_errors, config.threshold_percentile);
        info!(
            threshold = model.threshold,
            validation = validation_errors.len(),
            "fitted anomaly detector"
        );
        Ok((model, validation_errors))
    }

    /// Forward reconstruction of a raw embedding vector.
    #[must_use]
    pub fn reconstruct(&self, input: &Array1<f32>) -> Array1<f32> {
        let h1 = relu(&self.encoder_fc1.forward(input.view()));
        let latent = relu(&self.encoder_fc2.forward(h1.view()));
        let h2 = relu(&self.decoder_fc1.forward(latent.view()));
        self.decoder_fc2.forward(h2.view())
    }

    /// Mean squared reconstruction error of a probe embedding.
    #[must_use]
    pub fn reconstruction_error(&self, embedding: &Embedding) -> f32 {
        let input = embedding.values().to_owned();
        let output = self.reconstruct(&input);
        input
            .iter()
            .zip(output.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            / input.len() as f32
    }

    /// The spoof gate: `true` when the error exceeds `τ_spoof`.
    #[must_use]
    pub fn is_spoof(&self, embedding: &Embedding) -> (bool, f32) {
        let error = self.reconstruction_error(embedding);
        (error > self.threshold, error)
    }

    /// The stored threshold `τ_spoof`.
    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// MSE forward + backward for one sample; accumulates gradients and
    /// returns the sample loss.
    fn backward_mse(&mut self, input: &Array1<f32>) -> f32 {
        let h1_pre = self.encoder_fc1.forward(input.view());
        let h1 = relu(&h1_pre);
        let latent_pre = self.encoder_fc2.forward(h1.view());
        let latent = relu(&latent_pre);
        let h2_pre = self.decoder_fc1.forward(latent.view());
        let h2 = relu(&h2_pre);
        let output = self.decoder_fc2.forward(h2.view());

        let n = input.len() as f32;
        let loss = input
            .iter()
            .zip(output.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            / n;
        let grad_output = Array1::from_iter(
            output
                .iter()
                .zip(input.iter())
                .map(|(o, i)| 2.0 * (o - i) / n),
        );

        let grad_h2 = self.decoder_fc2.backward(h2.view(), grad_output.view());
        let grad_h2_pre = relu_backward(&h2_pre, &grad_h2);
        let grad_latent = self.decoder_fc1.backward(latent.view(), grad_h2_pre.view());
        let grad_latent_pre = relu_backward(&latent_pre, &grad_latent);
        let grad_h1 = self.encoder_fc2.backward(h1.view(), grad_latent_pre.view());
        let grad_h1_pre = relu_backward(&h1_pre, &grad_h1);
        let _ = self.encoder_fc1.backward(input.view(), grad_h1_pre.view());

        loss
    }

    fn zero_grad(&mut self) {
        self.encoder_fc1.zero_grad();
        self.encoder_fc2.zero_grad();
        self.decoder_fc1.zero_grad();
        self.decoder_fc2.zero_grad();
    }

    fn flatten_params(&self) -> Vec<f32> {
        let mut out = Vec::new();
        self.encoder_fc1.flatten_into(&mut out);
        self.encoder_fc2.flatten_into(&mut out);
        self.decoder_fc1.flatten_into(&mut out);
        self.decoder_fc2.flatten_into(&mut out);
        out
    }

    fn flatten_grads(&self) -> Vec<f32> {
        let mut out = Vec::new();
        self.encoder_fc1.flatten_grads_into(&mut out);
        self.encoder_fc2.flatten_grads_into(&mut out);
        self.decoder_fc1.flatten_grads_into(&mut out);
        self.decoder_fc2.flatten_grads_into(&mut out);
        out
    }

    fn unflatten_params(&mut self, data: &[f32]) -> CoreResult<()> {
        let expected = self.flatten_params().len();
        if data.len() != expected {
            return Err(ModelError::ShapeMismatch {
                expected: vec![expected],
                actual: vec![data.len()],
            }
            .into());
        }
        let mut offset = self.encoder_fc1.unflatten_from(data);
        offset += self.encoder_fc2.unflatten_from(&data[offset..]);
        offset += self.decoder_fc1.unflatten_from(&data[offset..]);
        let _ = self.decoder_fc2.unflatten_from(&data[offset..]);
        Ok(())
    }

    /// Save weights + threshold as a versioned artifact.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let file = AnomalyModelFile {
            format_version: ARTIFACT_FORMAT_VERSION,
            config: self.config.clone(),
            params: self.flatten_params(),
            threshold: self.threshold,
        };
        let json = serde_json::to_string(&file)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        Ok(())
    }

    /// Load a persisted anomaly model.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        let file: AnomalyModelFile = serde_json::from_str(&json)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        if file.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: ARTIFACT_FORMAT_VERSION,
                found: file.format_version,
            }
            .into());
        }
        let mut model = Self::with_fresh_weights(file.config);
        model.unflatten_params(&file.params)?;
        model.threshold = file.threshold;
        Ok(model)
    }
}

#[derive(Serialize, Deserialize)]
struct AnomalyModelFile {
    format_version: u32,
    config: AutoencoderConfig,
    params: Vec<f32>,
    threshold: f32,
}
