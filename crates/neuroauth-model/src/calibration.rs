//! Score calibration.
//!
//! A two-parameter logistic map `p = σ(scale · s + bias)` fitted by
//! Newton-Raphson maximum likelihood on labeled (raw score, same-user?)
//! pairs. Applied as a pure function; monotone non-decreasing in the raw
//! score whenever the genuine population scores above the impostors
//! (positive fitted scale).

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use neuroauth_core::error::{CoreResult, ModelError, StorageError};
use neuroauth_core::utils::sigmoid;

use crate::ARTIFACT_FORMAT_VERSION;

/// Ridge term keeping the Newton system well conditioned on separable data.
const RIDGE: f32 = 1e-4;

/// The fitted logistic calibrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticCalibrator {
    /// Multiplier on the raw score.
    pub scale: f32,
    /// Additive bias.
    pub bias: f32,
}

impl LogisticCalibrator {
    /// Fit by maximum likelihood.
    ///
    /// `scores` are raw similarities in `[-1, 1]`; `genuine[i]` marks
    /// same-user pairs.
    ///
    /// # Errors
    ///
    /// [`ModelError::FitFailed`] when the data is empty, single-class, or
    /// the solve diverges.
    pub fn fit(scores: &[f32], genuine: &[bool]) -> CoreResult<Self> {
        if scores.is_empty() || scores.len() != genuine.len() {
            return Err(ModelError::fit_failed("empty or mismatched calibration data").into());
        }
        let positives = genuine.iter().filter(|&&g| g).count();
        if positives == 0 || positives == genuine.len() {
            return Err(ModelError::fit_failed(
                "calibration needs both genuine and impostor samples",
            )
            .into());
        }

        let mut scale = 1.0f32;
        let mut bias = 0.0f32;
        for _ in 0..100 {
            // Gradient and Hessian of the negative log-likelihood.
            let mut g_scale = RIDGE * scale;
            let mut g_bias = RIDGE * bias;
            let mut h_ss = RIDGE;
            let mut h_sb = 0.0f32;
            let mut h_bb = RIDGE;
            for (&score, &is_genuine) in scores.iter().zip(genuine.iter()) {
                let p = sigmoid(scale * score + bias);
                let y = if is_genuine { 1.0 } else { 0.0 };
                let residual = p - y;
                g_scale += residual * score;
                g_bias += residual;
                let w = (p * (1.0 - p)).max(1e-8);
                h_ss += w * score * score;
                h_sb += w * score;
                h_bb += w;
            }

            // Solve the 2×2 Newton system.
            let det = h_ss * h_bb - h_sb * h_sb;
            if det.abs() < 1e-12 {
                return Err(ModelError::fit_failed("singular Hessian in calibration fit").into());
            }
            let step_scale = (g_scale * h_bb - g_bias * h_sb) / det;
            let step_bias = (g_bias * h_ss - g_scale * h_sb) / det;
            scale -= step_scale;
            bias -= step_bias;

            if !scale.is_finite() || !bias.is_finite() {
                return Err(ModelError::fit_failed("calibration fit diverged").into());
            }
            if step_scale.abs() < 1e-7 && step_bias.abs() < 1e-7 {
                break;
            }
        }

        info!(scale, bias, samples = scores.len(), "fitted calibrator");
        Ok(Self { scale, bias })
    }

    /// Map a raw score to a probability.
    #[must_use]
    pub fn apply(&self, score: f32) -> f32 {
        sigmoid(self.scale * score + self.bias)
    }

    /// Save as a versioned artifact.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let file = CalibratorFile {
            format_version: ARTIFACT_FORMAT_VERSION,
            scale: self.scale,
            bias: self.bias,
        };
        let json = serde_json::to_string(&file)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        Ok(())
    }

    /// Load a persisted calibrator.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        let file: CalibratorFile = serde_json::from_str(&json)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        if file.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: ARTIFACT_FORMAT_VERSION,
                found: file.format_version,
            }
            .into());
        }
        Ok(Self {
            scale: file.scale,
            bias: file.bias,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct CalibratorFile {
    format_version: u32,
    scale: f32,
    bias: f32,
}

/// Criterion under which the operating threshold was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCriterion {
    /// Threshold at the equal-error operating point.
    #[default]
    EqualErrorRate,
    /// Threshold fixed by the operator.
    Fixed,
}

/// The decision threshold `τ_decision` on calibrated probability, together
/// with the criterion that selected it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingThreshold {
    /// Accept when `calibrated_probability ≥ tau_decision`.
    pub tau_decision: f32,
    /// How the threshold was chosen.
    pub criterion: DecisionCriterion,
}

impl OperatingThreshold {
    /// Save as a versioned artifact.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let file = ThresholdFile {
            format_version: ARTIFACT_FORMAT_VERSION,
            tau_decision: self.tau_decision,
            criterion: self.criterion,
        };
        let json = serde_json::to_string(&file)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        Ok(())
    }

    /// Load a persisted threshold.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        let file: ThresholdFile = serde_json::from_str(&json)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        if file.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: ARTIFACT_FORMAT_VERSION,
                found: file.format_version,
            }
            .into());
        }
        Ok(Self {
            tau_decision: file.tau_decision,
            criterion: file.criterion,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct ThresholdFile {
    format_version: u32,
    tau_decision: f32,
    criterion: DecisionCriterion,
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuroauth_core::utils::Xorshift64;
    use tempfile::tempdir;

    /// Genuine scores high, impostor scores low.
    fn separable_data(n: usize, seed: u64) -> (Vec<f32>, Vec<bool>) {
        let mut rng = Xorshift64::new(seed);
        let mut scores = Vec::with_capacity(2 * n);
        let mut labels = Vec::with_capacity(2 * n);
        for _ in 0..n {
            scores.push(0.8 + rng.next_gaussian() * 0.08);
            labels.push(true);
            scores.push(0.2 + rng.next_gaussian() * 0.08);
            labels.push(false);
        }
        (scores, labels)
    }

    #[test]
    fn fit_separates_populations() {
        let (scores, labels) = separable_data(200, 1);
        let calibrator = LogisticCalibrator::fit(&scores, &labels).unwrap();
        assert!(calibrator.scale > 0.0, "scale {}", calibrator.scale);
        assert!(calibrator.apply(0.85) > 0.9);
        assert!(calibrator.apply(0.15) < 0.1);
    }

    #[test]
    fn output_is_probability_and_monotone() {
        let (scores, labels) = separable_data(100, 2);
        let calibrator = LogisticCalibrator::fit(&scores, &labels).unwrap();
        let mut previous = calibrator.apply(-1.0);
        assert!((0.0..=1.0).contains(&previous));
        for step in 1..=200 {
            let score = -1.0 + step as f32 / 100.0;
            let p = calibrator.apply(score);
            assert!((0.0..=1.0).contains(&p));
            assert!(p >= previous, "not monotone at {score}: {p} < {previous}");
            previous = p;
        }
    }

    #[test]
    fn overlapping_data_gives_midpoint_near_half() {
        // Symmetric overlapping populations around 0.5.
        let mut rng = Xorshift64::new(3);
        let mut scores = Vec::new();
        let mut labels = Vec::new();
        for _ in 0..500 {
            scores.push(0.6 + rng.next_gaussian() * 0.15);
            labels.push(true);
            scores.push(0.4 + rng.next_gaussian() * 0.15);
            labels.push(false);
        }
        let calibrator = LogisticCalibrator::fit(&scores, &labels).unwrap();
        let midpoint = calibrator.apply(0.5);
        assert!(
            (midpoint - 0.5).abs() < 0.1,
            "midpoint probability {midpoint}"
        );
    }

    #[test]
    fn single_class_data_rejected() {
        let scores = vec![0.9, 0.8, 0.7];
        let labels = vec![true, true, true];
        assert!(LogisticCalibrator::fit(&scores, &labels).is_err());
    }

    #[test]
    fn empty_data_rejected() {
        assert!(LogisticCalibrator::fit(&[], &[]).is_err());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calibrator.json");
        let (scores, labels) = separable_data(50, 4);
        let calibrator = LogisticCalibrator::fit(&scores, &labels).unwrap();
        calibrator.save(&path).unwrap();
        let restored = LogisticCalibrator::load(&path).unwrap();
        assert_eq!(calibrator, restored);
    }
}
