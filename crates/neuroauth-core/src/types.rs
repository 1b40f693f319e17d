//! Core data types for the neuroauth pipeline.
//!
//! The types follow the signal path: a [`Trial`] comes off the acquisition
//! format, becomes a [`ProcessedTrial`] after filtering and resampling, is
//! cut into [`Window`]s, each of which the encoder maps to a unit-norm
//! [`Embedding`]. Enrollment condenses a user's embeddings into a
//! [`PrototypeSet`]; verification produces a [`VerificationResult`].

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, ModelError, SignalError};
use crate::utils::{cosine_similarity, l2_norm};
use crate::UNIT_NORM_TOLERANCE;

/// A user identity label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a new user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The underlying label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One contiguous multi-channel recording segment at acquisition rate.
///
/// Shape is `(n_channels, n_samples)`. Every admitted trial has finite
/// values; [`Trial::new`] enforces this.
#[derive(Debug, Clone)]
pub struct Trial {
    data: Array2<f32>,
    sample_rate_hz: f32,
}

impl Trial {
    /// Creates a trial, rejecting empty or non-finite data.
    pub fn new(data: Array2<f32>, sample_rate_hz: f32) -> CoreResult<Self> {
        if data.ncols() == 0 {
            return Err(SignalError::EmptyTrial.into());
        }
        if !data.iter().all(|v| v.is_finite()) {
            return Err(SignalError::NonFinite { stage: "trial" }.into());
        }
        Ok(Self {
            data,
            sample_rate_hz,
        })
    }

    /// Channel-major sample data.
    #[must_use]
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Acquisition sample rate in Hz.
    #[must_use]
    pub fn sample_rate_hz(&self) -> f32 {
        self.sample_rate_hz
    }

    /// Number of channels.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples per channel.
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    /// Duration in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        self.data.ncols() as f32 / self.sample_rate_hz
    }

    /// Consumes the trial, returning the sample data.
    #[must_use]
    pub fn into_data(self) -> Array2<f32> {
        self.data
    }
}

/// A trial after filtering, resampling, and per-channel standardization.
///
/// Same channel ordering as [`Trial`], resampled to the system output rate.
/// Each channel is zero-mean, unit-variance within numerical tolerance.
#[derive(Debug, Clone)]
pub struct ProcessedTrial {
    data: Array2<f32>,
    sample_rate_hz: f32,
}

impl ProcessedTrial {
    /// Wraps already-standardized data. Rejects empty or non-finite input.
    pub fn new(data: Array2<f32>, sample_rate_hz: f32) -> CoreResult<Self> {
        if data.ncols() == 0 {
            return Err(SignalError::EmptyTrial.into());
        }
        if !data.iter().all(|v| v.is_finite()) {
            return Err(SignalError::NonFinite {
                stage: "processed_trial",
            }
            .into());
        }
        Ok(Self {
            data,
            sample_rate_hz,
        })
    }

    /// Channel-major sample data.
    #[must_use]
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Output sample rate in Hz.
    #[must_use]
    pub fn sample_rate_hz(&self) -> f32 {
        self.sample_rate_hz
    }

    /// Number of channels.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples per channel.
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }
}

/// A fixed-shape `(C, W)` slice of a processed trial.
#[derive(Debug, Clone)]
pub struct Window {
    data: Array2<f32>,
}

impl Window {
    /// Wraps window data.
    #[must_use]
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    /// Channel-major sample data.
    #[must_use]
    pub fn data(&self) -> &Array2<f32> {
        &self.data
    }

    /// Mutable access for training-time augmentation.
    pub fn data_mut(&mut self) -> &mut Array2<f32> {
        &mut self.data
    }

    /// Number of channels.
    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    /// Number of samples.
    #[must_use]
    pub fn n_samples(&self) -> usize {
        self.data.ncols()
    }
}

/// A unit-norm vector representing one window in embedding space.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    values: Array1<f32>,
}

impl Embedding {
    /// Creates an embedding from raw values, normalizing to unit L2 norm.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NonFiniteOutput`] if any value is non-finite or
    /// the vector has (near-)zero norm.
    pub fn new(mut values: Array1<f32>) -> CoreResult<Self> {
        if !values.iter().all(|v| v.is_finite()) {
            return Err(ModelError::NonFiniteOutput { what: "embedding" }.into());
        }
        let norm = l2_norm(values.view());
        if norm < 1e-10 {
            return Err(ModelError::NonFiniteOutput { what: "embedding" }.into());
        }
        values.mapv_inplace(|v| v / norm);
        Ok(Self { values })
    }

    /// Mean of `embeddings`, renormalized to unit norm.
    ///
    /// This is the §4.I step-3 aggregation: embedding-level mean then L2
    /// renormalize.
    pub fn aggregate(embeddings: &[Embedding]) -> CoreResult<Self> {
        if embeddings.is_empty() {
            return Err(ModelError::NonFiniteOutput { what: "aggregate" }.into());
        }
        let dim = embeddings[0].dim();
        let mut sum = Array1::<f32>::zeros(dim);
        for e in embeddings {
            sum += &e.values;
        }
        sum.mapv_inplace(|v| v / embeddings.len() as f32);
        Self::new(sum)
    }

    /// The embedding values (unit norm).
    #[must_use]
    pub fn values(&self) -> ArrayView1<'_, f32> {
        self.values.view()
    }

    /// Embedding dimensionality.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// L2 norm (≈ 1 by construction).
    #[must_use]
    pub fn norm(&self) -> f32 {
        l2_norm(self.values.view())
    }

    /// Cosine similarity with another embedding.
    #[must_use]
    pub fn cosine(&self, other: &Embedding) -> f32 {
        cosine_similarity(self.values.view(), other.values.view())
    }
}

/// How per-prototype similarities collapse into one raw score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAggregation {
    /// Maximum cosine over prototypes (the decision contract).
    #[default]
    Max,
    /// Mean cosine over prototypes.
    Mean,
    /// Minimum cosine over prototypes.
    Min,
}

/// K unit-norm reference vectors for one user.
///
/// Created at enrollment, replaced only by re-enrollment, never mutated
/// online.
#[derive(Debug, Clone)]
pub struct PrototypeSet {
    prototypes: Array2<f32>,
}

impl PrototypeSet {
    /// Wraps a `(K, d)` prototype matrix, renormalizing each row.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::NonFiniteOutput`] on non-finite or zero rows,
    /// [`ModelError::ShapeMismatch`] on an empty matrix.
    pub fn new(mut prototypes: Array2<f32>) -> CoreResult<Self> {
        if prototypes.nrows() == 0 || prototypes.ncols() == 0 {
            return Err(ModelError::ShapeMismatch {
                expected: vec![1, 1],
                actual: vec![prototypes.nrows(), prototypes.ncols()],
            }
            .into());
        }
        for mut row in prototypes.axis_iter_mut(Axis(0)) {
            if !row.iter().all(|v| v.is_finite()) {
                return Err(ModelError::NonFiniteOutput { what: "prototype" }.into());
            }
            let norm = l2_norm(row.view());
            if norm < 1e-10 {
                return Err(ModelError::NonFiniteOutput { what: "prototype" }.into());
            }
            row.mapv_inplace(|v| v / norm);
        }
        Ok(Self { prototypes })
    }

    /// Number of prototypes (K).
    #[must_use]
    pub fn k(&self) -> usize {
        self.prototypes.nrows()
    }

    /// Embedding dimensionality.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.prototypes.ncols()
    }

    /// The `(K, d)` prototype matrix.
    #[must_use]
    pub fn matrix(&self) -> &Array2<f32> {
        &self.prototypes
    }

    /// Index and similarity of the best-matching prototype.
    ///
    /// On exact floating-point ties the smallest index wins (rows are
    /// scanned in order with a strict `>` comparison).
    #[must_use]
    pub fn best_match(&self, probe: &Embedding) -> (usize, f32) {
        let mut best_index = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (index, row) in self.prototypes.axis_iter(Axis(0)).enumerate() {
            let score = cosine_similarity(probe.values(), row);
            if score > best_score {
                best_score = score;
                best_index = index;
            }
        }
        (best_index, best_score)
    }

    /// Raw score of `probe` against this set under `aggregation`.
    #[must_use]
    pub fn score(&self, probe: &Embedding, aggregation: ScoreAggregation) -> f32 {
        let scores: Vec<f32> = self
            .prototypes
            .axis_iter(Axis(0))
            .map(|row| cosine_similarity(probe.values(), row))
            .collect();
        match aggregation {
            ScoreAggregation::Max => scores.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            ScoreAggregation::Min => scores.iter().copied().fold(f32::INFINITY, f32::min),
            ScoreAggregation::Mean => scores.iter().sum::<f32>() / scores.len() as f32,
        }
    }

    /// `true` when every stored prototype has unit norm within tolerance.
    #[must_use]
    pub fn is_normalized(&self) -> bool {
        self.prototypes
            .axis_iter(Axis(0))
            .all(|row| (l2_norm(row) - 1.0).abs() < UNIT_NORM_TOLERANCE)
    }
}

/// Accept/reject outcome of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Claimed identity verified
    Accept,
    /// Claimed identity rejected
    Reject,
}

impl Decision {
    /// `true` for [`Decision::Accept`].
    #[must_use]
    pub fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// The outcome of one verification, as returned to the service boundary.
///
/// All failures resolve to `decision = Reject` with the internal
/// [`ErrorKind`](crate::error::ErrorKind) recorded here and in the audit
/// artifact; the external message never distinguishes failure causes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    /// Accept or reject
    pub decision: Decision,
    /// Raw similarity score in [-1, 1]
    pub raw_score: f32,
    /// Calibrated same-user probability in [0, 1]
    pub calibrated_probability: f32,
    /// Autoencoder reconstruction error of the probe embedding
    pub spoof_score: f32,
    /// Whether the spoof gate fired
    pub is_spoof: bool,
    /// Identifier of the stored attribution artifact, when one was written
    pub artifact_id: Option<String>,
    /// Internal failure label; `None` on a clean decision
    pub error_kind: Option<crate::error::ErrorKind>,
}

impl VerificationResult {
    /// A rejecting result for a failed verification.
    #[must_use]
    pub fn rejected(kind: crate::error::ErrorKind) -> Self {
        Self {
            decision: Decision::Reject,
            raw_score: 0.0,
            calibrated_probability: 0.0,
            spoof_score: 0.0,
            is_spoof: false,
            artifact_id: None,
            error_kind: Some(kind),
        }
    }
}
