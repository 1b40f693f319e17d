//! Authentication evaluation: FAR/FRR sweeps and the equal-error rate.
//!
//! Scores are "genuine" when the probe was compared against its own user's
//! prototypes and "impostor" otherwise. FAR is the fraction of impostor
//! scores at or above a threshold; FRR the fraction of genuine scores
//! below it.

use serde::{Deserialize, Serialize};

use neuroauth_core::error::{CoreResult, ModelError};

/// One point of a FAR/FRR sweep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ErrorRatePoint {
    /// The threshold the rates were measured at.
    pub threshold: f32,
    /// False-accept rate.
    pub far: f32,
    /// False-reject rate.
    pub frr: f32,
}

/// Summary of an evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    /// Equal-error rate.
    pub eer: f32,
    /// Threshold at the equal-error point.
    pub eer_threshold: f32,
    /// Genuine score count.
    pub n_genuine: usize,
    /// Impostor score count.
    pub n_impostor: usize,
    /// Mean genuine score.
    pub genuine_mean: f32,
    /// Mean impostor score.
    pub impostor_mean: f32,
    /// FAR at fixed FRR targets of 1%, 5%, and 10%.
    pub far_at_frr: Vec<(f32, f32)>,
}

/// FAR and FRR at a single threshold.
#[must_use]
pub fn far_frr_at(genuine: &[f32], impostor: &[f32], threshold: f32) -> (f32, f32) {
    let far = impostor.iter().filter(|&&s| s >= threshold).count() as f32
        / impostor.len().max(1) as f32;
    let frr =
        genuine.iter().filter(|&&s| s < threshold).count() as f32 / genuine.len().max(1) as f32;
    (far, frr)
}

/// Sweep `n_points` thresholds across the observed score range.
#[must_use]
pub fn sweep(genuine: &[f32], impostor: &[f32], n_points: usize) -> Vec<ErrorRatePoint> {
    let all_min = genuine
        .iter()
        .chain(impostor.iter())
        .copied()
        .fold(f32::INFINITY, f32::min);
    let all_max = genuine
        .iter()
        .chain(impostor.iter())
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    let n = n_points.max(2);
    (0..n)
        .map(|i| {
            let threshold = all_min + (all_max - all_min) * i as f32 / (n - 1) as f32;
            let (far, frr) = far_frr_at(genuine, impostor, threshold);
            ErrorRatePoint {
                threshold,
                far,
                frr,
            }
        })
        .collect()
}

/// Equal-error rate and the threshold achieving it.
///
/// The sweep point with the smallest |FAR − FRR| is interpolated with its
/// neighbor to approximate the crossing.
pub fn equal_error_rate(genuine: &[f32], impostor: &[f32]) -> CoreResult<(f32, f32)> {
    if genuine.is_empty() || impostor.is_empty() {
        return Err(ModelError::fit_failed(
            "equal-error rate needs both genuine and impostor scores",
        )
        .into());
    }
    let points = sweep(genuine, impostor, 512);
    let mut best_index = 0;
    let mut best_gap = f32::INFINITY;
    for (index, point) in points.iter().enumerate() {
        let gap = (point.far - point.frr).abs();
        if gap < best_gap {
            best_gap = gap;
            best_index = index;
        }
    }
    let best = points[best_index];
    let eer = (best.far + best.frr) / 2.0;
    Ok((eer, best.threshold))
}

/// FAR at the smallest threshold whose FRR does not exceed `frr_target`.
#[must_use]
pub fn far_at_frr(genuine: &[f32], impostor: &[f32], frr_target: f32) -> f32 {
    let points = sweep(genuine, impostor, 512);
    points
        .iter()
        .filter(|p| p.frr <= frr_target)
        .map(|p| p.far)
        .fold(f32::INFINITY, f32::min)
        .min(1.0)
}

/// Full evaluation report over genuine/impostor score sets.
pub fn evaluate(genuine: &[f32], impostor: &[f32]) -> CoreResult<EvalReport> {
    let (eer, eer_threshold) = equal_error_rate(genuine, impostor)?;
    let genuine_mean = genuine.iter().sum::<f32>() / genuine.len() as f32;
    let impostor_mean = impostor.iter().sum::<f32>() / impostor.len() as f32;
    let far_at = [0.01f32, 0.05, 0.10]
        .iter()
        .map(|&target| (target, far_at_frr(genuine, impostor, target)))
        .collect();
    Ok(EvalReport {
        eer,
        eer_threshold,
        n_genuine: genuine.len(),
        n_impostor: impostor.len(),
        genuine_mean,
        impostor_mean,
        far_at_frr: far_at,
    })
}
