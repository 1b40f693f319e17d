//! Fitting of the derived serving artifacts.
//!
//! After the encoder is trained, four artifacts are derived from the
//! dataset: per-user prototype sets (from training embeddings), the score
//! calibrator (from held-out genuine/impostor pairs), the spoof
//! autoencoder with its threshold (from genuine embeddings), and the
//! operating threshold under the configured criterion.

use ndarray::Array2;
use tracing::{info, warn};

use neuroauth_core::error::{CoreResult, ModelError};
use neuroauth_core::utils::Xorshift64;
use neuroauth_core::{Embedding, ScoreAggregation, WindowEncoder};
use neuroauth_model::autoencoder::{AnomalyModel, AutoencoderConfig};
use neuroauth_model::calibration::{DecisionCriterion, LogisticCalibrator, OperatingThreshold};
use neuroauth_model::encoder::EegEncoder;
use neuroauth_model::prototypes::{build_prototypes, PrototypeTable};

use crate::config::TrainingConfig;
use crate::dataset::{DatasetSplits, WindowSet};
use crate::eval::{self, EvalReport};

/// Everything the verification engine needs besides the encoder.
#[derive(Debug)]
pub struct ServingArtifacts {
    /// Per-user prototype table.
    pub prototypes: PrototypeTable,
    /// Score-to-probability calibrator.
    pub calibrator: LogisticCalibrator,
    /// Spoof autoencoder with `τ_spoof`.
    pub anomaly: AnomalyModel,
    /// Operating threshold `τ_decision`.
    pub threshold: OperatingThreshold,
    /// Evaluation over raw held-out scores.
    pub report: EvalReport,
}

/// Embeds every window of a set in order.
pub fn embed_set(encoder: &EegEncoder, set: &WindowSet) -> CoreResult<Vec<Embedding>> {
    set.windows.iter().map(|w| encoder.encode(w)).collect()
}

/// Fit prototypes, calibrator, anomaly model, and threshold from a trained
/// encoder and the dataset splits.
pub fn fit_serving_artifacts(
    encoder: &EegEncoder,
    splits: &DatasetSplits,
    config: &TrainingConfig,
) -> CoreResult<ServingArtifacts> {
    // Per-user training embeddings drive both prototypes and the spoof
    // autoencoder.
    let train_embeddings = embed_set(encoder, &splits.train)?;
    let mut prototypes = PrototypeTable::new();
    for (label, user) in splits.users.iter().enumerate() {
        let user_embeddings: Vec<Embedding> = splits
            .train
            .indices_of(label)
            .into_iter()
            .map(|i| train_embeddings[i].clone())
            .collect();
        if user_embeddings.is_empty() {
            return Err(ModelError::fit_failed(format!(
                "user '{user}' has no training embeddings"
            ))
            .into());
        }
        let set = build_prototypes(
            &user_embeddings,
            config.prototypes_per_user,
            config.seed.wrapping_add(label as u64),
        )?;
        prototypes.insert(user.clone(), set);
    }
    info!(users = prototypes.len(), "built prototype table");

    // Held-out genuine/impostor score pairs. Scored with the maximum
    // cosine, matching the serving decision contract.
    let holdout = if splits.val.is_empty() {
        warn!("validation split empty, calibrating on training windows");
        &splits.train
    } else {
        &splits.val
    };
    let holdout_embeddings = embed_set(encoder, holdout)?;
    let mut rng = Xorshift64::new(config.seed.wrapping_add(900));
    let mut scores = Vec::new();
    let mut labels = Vec::new();
    let mut genuine_scores = Vec::new();
    let mut impostor_scores = Vec::new();
    let n_users = splits.users.len();
    for (embedding, &label) in holdout_embeddings.iter().zip(holdout.labels.iter()) {
        let own = prototypes
            .get(&splits.users[label])
            .ok_or_else(|| ModelError::fit_failed("missing prototypes for enrolled user"))?;
        let genuine = own.score(embedding, ScoreAggregation::Max);
        scores.push(genuine);
        labels.push(true);
        genuine_scores.push(genuine);

        let mut sampled = 0usize;
        let mut guard = 0usize;
        while sampled < config.calibration_impostors.min(n_users.saturating_sub(1)) {
            let other = rng.next_index(n_users);
            guard += 1;
            if other == label && guard < 100 {
                continue;
            }
            if other == label {
                break;
            }
            let impostor = prototypes
                .get(&splits.users[other])
                .ok_or_else(|| ModelError::fit_failed("missing prototypes for enrolled user"))?
                .score(embedding, ScoreAggregation::Max);
            scores.push(impostor);
            labels.push(false);
            impostor_scores.push(impostor);
            sampled += 1;
        }
    }
    let calibrator = LogisticCalibrator::fit(&scores, &labels)?;

    // Spoof gate: autoencoder over all genuine embeddings.
    let autoencoder_config = AutoencoderConfig {
        embedding_dim: config.embedding_dim,
        threshold_percentile: config.spoof_threshold_percentile,
        seed: config.seed.wrapping_add(901),
        ..AutoencoderConfig::default()
    };
    let (anomaly, _) = AnomalyModel::fit(&train_embeddings, autoencoder_config)?;

    // Operating threshold on calibrated probabilities.
    let calibrated_genuine: Vec<f32> = genuine_scores.iter().map(|&s| calibrator.apply(s)).collect();
    let calibrated_impostor: Vec<f32> =
        impostor_scores.iter().map(|&s| calibrator.apply(s)).collect();
    let threshold = match config.decision_criterion {
        DecisionCriterion::EqualErrorRate => {
            let (eer, tau) = eval::equal_error_rate(&calibrated_genuine, &calibrated_impostor)?;
            info!(eer, tau, "operating threshold at equal-error point");
            OperatingThreshold {
                tau_decision: tau,
                criterion: DecisionCriterion::EqualErrorRate,
            }
        }
        DecisionCriterion::Fixed => OperatingThreshold {
            tau_decision: 0.5,
            criterion: DecisionCriterion::Fixed,
        },
    };

    let report = eval::evaluate(&genuine_scores, &impostor_scores)?;
    info!(
        eer = report.eer,
        genuine_mean = report.genuine_mean,
        impostor_mean = report.impostor_mean,
        "held-out evaluation"
    );

    Ok(ServingArtifacts {
        prototypes,
        calibrator,
        anomaly,
        threshold,
        report,
    })
}

/// Collect genuine and impostor raw scores of a window set against the
/// prototype table (used for test-set evaluation).
///
/// `aggregation` selects how per-prototype similarities collapse. This is
/// an analysis knob only: the serving decision contract is always the
/// maximum cosine, so pass [`ScoreAggregation::Max`] when the numbers must
/// match what the engine would decide on.
pub fn score_against_prototypes(
    encoder: &EegEncoder,
    set: &WindowSet,
    users: &[neuroauth_core::UserId],
    prototypes: &PrototypeTable,
    aggregation: ScoreAggregation,
) -> CoreResult<(Vec<f32>, Vec<f32>)> {
    let embeddings = embed_set(encoder, set)?;
    let mut genuine = Vec::new();
    let mut impostor = Vec::new();
    for (embedding, &label) in embeddings.iter().zip(set.labels.iter()) {
        for (other_label, user) in users.iter().enumerate() {
            let Some(set) = prototypes.get(user) else {
                continue;
            };
            let score = set.score(embedding, aggregation);
            if other_label == label {
                genuine.push(score);
            } else {
                impostor.push(score);
            }
        }
    }
    Ok((genuine, impostor))
}

/// Embeddings grouped as a matrix (diagnostics and tests).
pub fn embedding_matrix(encoder: &EegEncoder, set: &WindowSet) -> CoreResult<Array2<f32>> {
    let embeddings = embed_set(encoder, set)?;
    let dim = encoder.embedding_dim();
    let mut matrix = Array2::<f32>::zeros((embeddings.len(), dim));
    for (row, embedding) in embeddings.iter().enumerate() {
        matrix.row_mut(row).assign(&embedding.values());
    }
    Ok(matrix)
}
