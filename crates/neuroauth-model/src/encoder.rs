//! The sequence encoder.
//!
//! Maps one `(C, W)` window to a unit-norm embedding:
//!
//! ```text
//! window (C, W)
//!   │  transpose to (W, C)
//!   ▼
//! input projection  C → h            per time step
//!   ▼
//! bidirectional GRU × L layers       (W, 2h) per layer
//!   ▼
//! temporal attention                 softmax over W steps → (2h,)
//!   ▼
//! projection head    2h → h → d_emb  ReLU between, dropout at train time
//!   ▼
//! L2 normalization                   ‖e‖₂ = 1
//! ```
//!
//! A parallel classification head (`d_emb → n_users`) exists only for the
//! warmup phase and is not persisted with the encoder weights.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use neuroauth_core::error::{CoreError, CoreResult, ModelError, StorageError};
use neuroauth_core::utils::Xorshift64;
use neuroauth_core::{Embedding, Window, WindowEncoder};

use crate::attention::{AttentionCache, TemporalAttention};
use crate::gru::{BiGruCache, BiGruLayer};
use crate::nn::{
    dropout, l2_normalize_backward, l2_normalize_forward, relu, relu_backward, Linear,
};
use crate::ARTIFACT_FORMAT_VERSION;

/// Architecture hyperparameters; persisted with the weights and validated
/// on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Input channels (C).
    pub n_channels: usize,
    /// Window length in samples (W).
    pub window_samples: usize,
    /// Hidden width per direction (h).
    pub hidden_size: usize,
    /// Stacked bidirectional layers (L).
    pub num_layers: usize,
    /// Embedding dimensionality (d_emb).
    pub embedding_dim: usize,
    /// Dropout probability between layers and in the head (training only).
    pub dropout: f32,
    /// Parameter initialisation seed.
    pub seed: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            n_channels: neuroauth_core::N_CHANNELS,
            window_samples: 256,
            hidden_size: 128,
            num_layers: 2,
            embedding_dim: neuroauth_core::EMBEDDING_DIM,
            dropout: 0.3,
            seed: 42,
        }
    }
}

impl EncoderConfig {
    /// Validates parameter ranges.
    pub fn validate(&self) -> CoreResult<()> {
        if self.n_channels == 0
            || self.window_samples == 0
            || self.hidden_size == 0
            || self.num_layers == 0
            || self.embedding_dim == 0
        {
            return Err(CoreError::configuration(
                "encoder dimensions must be non-zero",
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(CoreError::configuration("dropout must be in [0, 1)"));
        }
        Ok(())
    }
}

/// Forward cache produced by [`EegEncoder::forward`].
#[derive(Debug, Clone)]
pub struct ForwardCache {
    sequence: Array2<f32>,
    layer_caches: Vec<BiGruCache>,
    inter_layer_masks: Vec<Option<Array2<f32>>>,
    attention: AttentionCache,
    pooled: Array1<f32>,
    head_hidden_pre: Array1<f32>,
    head_hidden: Array1<f32>,
    head_mask: Option<Array1<f32>>,
    embedding: Array1<f32>,
    norm: f32,
}

impl ForwardCache {
    /// The unit-norm embedding this cache belongs to.
    #[must_use]
    pub fn embedding(&self) -> &Array1<f32> {
        &self.embedding
    }

    /// Attention weights over time steps.
    #[must_use]
    pub fn attention_weights(&self) -> &Array1<f32> {
        self.attention.weights()
    }
}

/// The trainable sequence encoder.
#[derive(Debug, Clone)]
pub struct EegEncoder {
    config: EncoderConfig,
    input_proj: Linear,
    layers: Vec<BiGruLayer>,
    attention: TemporalAttention,
    head_fc1: Linear,
    head_fc2: Linear,
    classifier: Option<Linear>,
}

impl EegEncoder {
    /// Creates an encoder with fresh Xavier-initialised parameters.
    pub fn new(config: EncoderConfig) -> CoreResult<Self> {
        config.validate()?;
        let seed = config.seed;
        let h = config.hidden_size;
        let mut layers = Vec::with_capacity(config.num_layers);
        for layer in 0..config.num_layers {
            let input_size = if layer == 0 { h } else { 2 * h };
            layers.push(BiGruLayer::with_seed(
                input_size,
                h,
                seed.wrapping_add(10 + 2 * layer as u64),
            ));
        }
        Ok(Self {
            input_proj: Linear::with_seed(config.n_channels, h, seed),
            layers,
            attention: TemporalAttention::with_seed(2 * h, seed.wrapping_add(100)),
            head_fc1: Linear::with_seed(2 * h, h, seed.wrapping_add(200)),
            head_fc2: Linear::with_seed(h, config.embedding_dim, seed.wrapping_add(201)),
            classifier: None,
            config,
        })
    }

    /// The architecture hyperparameters.
    #[must_use]
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Attach the warmup classification head for `n_users` classes.
    pub fn attach_classifier(&mut self, n_users: usize) {
        self.classifier = Some(Linear::with_seed(
            self.config.embedding_dim,
            n_users,
            self.config.seed.wrapping_add(300),
        ));
    }

    /// Drop the warmup head (done before metric learning and deployment).
    pub fn detach_classifier(&mut self) {
        self.classifier = None;
    }

    /// Whether the warmup head is attached.
    #[must_use]
    pub fn has_classifier(&self) -> bool {
        self.classifier.is_some()
    }

    /// Classifier logits for a (unit-norm) embedding.
    ///
    /// # Errors
    ///
    /// [`ModelError::NotLoaded`] when no head is attached.
    pub fn class_logits(&self, embedding: &Array1<f32>) -> CoreResult<Array1<f32>> {
        let classifier = self
            .classifier
            .as_ref()
            .ok_or(ModelError::NotLoaded { name: "classifier" })?;
        Ok(classifier.forward(embedding.view()))
    }

    /// Backward through the classifier; accumulates head gradients and
    /// returns the embedding gradient.
    pub fn class_logits_backward(
        &mut self,
        embedding: &Array1<f32>,
        grad_logits: &Array1<f32>,
    ) -> CoreResult<Array1<f32>> {
        let classifier = self
            .classifier
            .as_mut()
            .ok_or(ModelError::NotLoaded { name: "classifier" })?;
        Ok(classifier.backward(embedding.view(), grad_logits.view()))
    }

    fn validate_window(&self, window: &Window) -> CoreResult<()> {
        if window.n_channels() != self.config.n_channels
            || window.n_samples() != self.config.window_samples
        {
            return Err(ModelError::ShapeMismatch {
                expected: vec![self.config.n_channels, self.config.window_samples],
                actual: vec![window.n_channels(), window.n_samples()],
            }
            .into());
        }
        Ok(())
    }

    /// Full forward pass. `rng` enables dropout (training); pass `None` for
    /// the deterministic inference path.
    pub fn forward(
        &self,
        window: &Window,
        mut rng: Option<&mut Xorshift64>,
    ) -> CoreResult<ForwardCache> {
        self.validate_window(window)?;
        let steps = self.config.window_samples;
        let h = self.config.hidden_size;

        // (C, W) → (W, C)
        let sequence = window.data().t().to_owned();

        // Per-step input projection.
        let mut projected = Array2::<f32>::zeros((steps, h));
        for t in 0..steps {
            projected
                .row_mut(t)
                .assign(&self.input_proj.forward(sequence.row(t)));
        }

        // Stacked bidirectional recurrence.
        let mut layer_caches = Vec::with_capacity(self.layers.len());
        let mut inter_layer_masks = Vec::with_capacity(self.layers.len());
        let mut current = projected;
        for (index, layer) in self.layers.iter().enumerate() {
            let (mut output, cache) = layer.forward(&current);
            layer_caches.push(cache);
            // Dropout between layers, not after the last.
            let mask = if index + 1 < self.layers.len() {
                rng.as_deref_mut().map(|rng| {
                    let mut mask = Array2::<f32>::zeros(output.dim());
                    let p = self.config.dropout;
                    let scale = 1.0 / (1.0 - p);
                    for value in mask.iter_mut() {
                        *value = if rng.next_f32() < p { 0.0 } else { scale };
                    }
                    output *= &mask;
                    mask
                })
            } else {
                None
            };
            inter_layer_masks.push(mask);
            current = output;
        }

        // Attention pooling.
        let (pooled, attention_cache) = self.attention.forward(&current);

        // Projection head.
        let head_hidden_pre = self.head_fc1.forward(pooled.view());
        let mut head_hidden = relu(&head_hidden_pre);
        let head_mask = rng
            .as_deref_mut()
            .map(|rng| dropout(&mut head_hidden, self.config.dropout, rng));
        let pre_norm = self.head_fc2.forward(head_hidden.view());
        let (embedding, norm) = l2_normalize_forward(&pre_norm);

        if !embedding.iter().all(|v| v.is_finite()) {
            return Err(ModelError::NonFiniteOutput { what: "embedding" }.into());
        }

        Ok(ForwardCache {
            sequence,
            layer_caches,
            inter_layer_masks,
            attention: attention_cache,
            pooled,
            head_hidden_pre,
            head_hidden,
            head_mask,
            embedding,
            norm,
        })
    }

    /// Backward pass from an embedding gradient down to the input window.
    ///
    /// Accumulates parameter gradients and returns the `(C, W)` input
    /// gradient (used both by training and by gradient attribution).
    pub fn backward(&mut self, cache: &ForwardCache, grad_embedding: &Array1<f32>) -> Array2<f32> {
        // L2 norm.
        let grad_pre_norm = l2_normalize_backward(&cache.embedding, cache.norm, grad_embedding);

        // Projection head.
        let mut grad_hidden = self
            .head_fc2
            .backward(cache.head_hidden.view(), grad_pre_norm.view());
        if let Some(mask) = &cache.head_mask {
            grad_hidden *= mask;
        }
        let grad_hidden_pre = relu_backward(&cache.head_hidden_pre, &grad_hidden);
        let grad_pooled = self
            .head_fc1
            .backward(cache.pooled.view(), grad_hidden_pre.view());

        // Attention.
        let mut grad_sequence = self.attention.backward(&cache.attention, &grad_pooled);

        // Recurrent stack, last layer first. masks[i] was applied to the
        // output of layer i, so it is consumed before that layer's backward.
        for index in (0..self.layers.len()).rev() {
            if let Some(mask) = &cache.inter_layer_masks[index] {
                grad_sequence *= mask;
            }
            grad_sequence = self.layers[index].backward(&cache.layer_caches[index], &grad_sequence);
        }

        // Input projection.
        let mut grad_window = Array2::<f32>::zeros((self.config.n_channels, self.config.window_samples));
        for t in 0..self.config.window_samples {
            let grad_step = self
                .input_proj
                .backward(cache.sequence.row(t), grad_sequence.row(t));
            grad_window.column_mut(t).assign(&grad_step);
        }
        grad_window
    }

    /// Zero every gradient buffer (encoder and attached head).
    pub fn zero_grad(&mut self) {
        self.input_proj.zero_grad();
        for layer in &mut self.layers {
            layer.zero_grad();
        }
        self.attention.zero_grad();
        self.head_fc1.zero_grad();
        self.head_fc2.zero_grad();
        if let Some(classifier) = &mut self.classifier {
            classifier.zero_grad();
        }
    }

    /// Number of persisted (non-head) parameters.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.input_proj.param_count()
            + self.layers.iter().map(BiGruLayer::param_count).sum::<usize>()
            + self.attention.param_count()
            + self.head_fc1.param_count()
            + self.head_fc2.param_count()
    }

    /// Number of warmup-head parameters (0 when detached).
    #[must_use]
    pub fn head_param_count(&self) -> usize {
        self.classifier.as_ref().map_or(0, Linear::param_count)
    }

    /// Flatten persisted parameters (head excluded).
    #[must_use]
    pub fn flatten_params(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.param_count());
        self.input_proj.flatten_into(&mut out);
        for layer in &self.layers {
            layer.flatten_into(&mut out);
        }
        self.attention.flatten_into(&mut out);
        self.head_fc1.flatten_into(&mut out);
        self.head_fc2.flatten_into(&mut out);
        out
    }

    /// Flatten gradients in the same layout as [`EegEncoder::flatten_params`].
    #[must_use]
    pub fn flatten_grads(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.param_count());
        self.input_proj.flatten_grads_into(&mut out);
        for layer in &self.layers {
            layer.flatten_grads_into(&mut out);
        }
        self.attention.flatten_grads_into(&mut out);
        self.head_fc1.flatten_grads_into(&mut out);
        self.head_fc2.flatten_grads_into(&mut out);
        out
    }

    /// Restore persisted parameters from a flat slice.
    ///
    /// # Errors
    ///
    /// [`ModelError::ShapeMismatch`] when the length differs from
    /// [`EegEncoder::param_count`].
    pub fn unflatten_params(&mut self, data: &[f32]) -> CoreResult<()> {
        if data.len() != self.param_count() {
            return Err(ModelError::ShapeMismatch {
                expected: vec![self.param_count()],
                actual: vec![data.len()],
            }
            .into());
        }
        let mut offset = self.input_proj.unflatten_from(data);
        for layer in &mut self.layers {
            offset += layer.unflatten_from(&data[offset..]);
        }
        offset += self.attention.unflatten_from(&data[offset..]);
        offset += self.head_fc1.unflatten_from(&data[offset..]);
        let _ = self.head_fc2.unflatten_from(&data[offset..]);
        Ok(())
    }

    /// Flatten the warmup head parameters.
    #[must_use]
    pub fn flatten_head_params(&self) -> Vec<f32> {
        let mut out = Vec::new();
        if let Some(classifier) = &self.classifier {
            classifier.flatten_into(&mut out);
        }
        out
    }

    /// Flatten the warmup head gradients.
    #[must_use]
    pub fn flatten_head_grads(&self) -> Vec<f32> {
        let mut out = Vec::new();
        if let Some(classifier) = &self.classifier {
            classifier.flatten_grads_into(&mut out);
        }
        out
    }

    /// Restore warmup head parameters.
    pub fn unflatten_head_params(&mut self, data: &[f32]) -> CoreResult<()> {
        if let Some(classifier) = &mut self.classifier {
            if data.len() != classifier.param_count() {
                return Err(ModelError::ShapeMismatch {
                    expected: vec![classifier.param_count()],
                    actual: vec![data.len()],
                }
                .into());
            }
            classifier.unflatten_from(data);
        }
        Ok(())
    }

    /// Save the encoder (config + flat weights) as a versioned artifact.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let file = EncoderFile {
            format_version: ARTIFACT_FORMAT_VERSION,
            config: self.config.clone(),
            params: self.flatten_params(),
        };
        let json = serde_json::to_string(&file)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        info!(path = %path.display(), params = file.params.len(), "saved encoder");
        Ok(())
    }

    /// Load an encoder artifact, validating version and shape.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        let file: EncoderFile = serde_json::from_str(&json)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        if file.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: ARTIFACT_FORMAT_VERSION,
                found: file.format_version,
            }
            .into());
        }
        let mut encoder = Self::new(file.config)?;
        encoder.unflatten_params(&file.params)?;
        Ok(encoder)
    }
}

impl WindowEncoder for EegEncoder {
    fn embedding_dim(&self) -> usize {
        self.config.embedding_dim
    }

    fn encode(&self, window: &Window) -> CoreResult<Embedding> {
        let cache = self.forward(window, None)?;
        Embedding::new(cache.embedding.clone())
    }
}

#[derive(Serialize, Deserialize)]
struct EncoderFile {
    format_version: u32,
    config: EncoderConfig,
    params: Vec<f32>,
}
