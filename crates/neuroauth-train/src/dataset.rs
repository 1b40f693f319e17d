//! Windowed dataset assembly and the trial split.
//!
//! The split policy is preserved from the reference system: each user's
//! trial list is ordered, the last quarter of trials is held out for test,
//! and the remainder is divided 80/20 into train and validation. Windows
//! of the same subject therefore appear in all three partitions; this
//! measures within-subject generalization, not between-session
//! performance.

use tracing::info;

use neuroauth_core::error::{CoreError, CoreResult};
use neuroauth_core::{ProcessedTrial, UserId, Window};
use neuroauth_signal::windowing::WindowConfig;

/// A set of windows with their user labels (`0..n_users`).
#[derive(Debug, Clone, Default)]
pub struct WindowSet {
    /// The windows, in deterministic order.
    pub windows: Vec<Window>,
    /// Label index of each window, parallel to `windows`.
    pub labels: Vec<usize>,
}

impl WindowSet {
    /// Number of windows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Indices of windows carrying `label`.
    #[must_use]
    pub fn indices_of(&self, label: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == label)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Train/validation/test windows plus the label → user mapping.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    /// Training windows (augmentation applies here only).
    pub train: WindowSet,
    /// Validation windows.
    pub val: WindowSet,
    /// Held-out test windows.
    pub test: WindowSet,
    /// User behind each label index.
    pub users: Vec<UserId>,
}

impl DatasetSplits {
    /// Builds the three partitions from per-user processed trials.
    ///
    /// `trials_by_user` pairs each user with their ordered trial list.
    /// Trials shorter than one window are skipped.
    pub fn build(
        trials_by_user: &[(UserId, Vec<ProcessedTrial>)],
        window_config: &WindowConfig,
    ) -> CoreResult<Self> {
        if trials_by_user.is_empty() {
            return Err(CoreError::configuration("dataset has no users"));
        }

        let mut splits = Self {
            train: WindowSet::default(),
            val: WindowSet::default(),
            test: WindowSet::default(),
            users: Vec::with_capacity(trials_by_user.len()),
        };

        for (label, (user, trials)) in trials_by_user.iter().enumerate() {
            if trials.is_empty() {
                return Err(CoreError::configuration(format!(
                    "user '{user}' has no trials"
                )));
            }
            splits.users.push(user.clone());

            // Last quarter of trials → test; remainder 80/20 train/val.
            let n = trials.len();
            let n_test = if n >= 3 { (n / 4).max(1) } else { 0 };
            let n_fit = n - n_test;
            let n_train = if n_fit >= 2 {
                ((n_fit as f32 * 0.8) as usize).clamp(1, n_fit - 1)
            } else {
                n_fit
            };

            for (index, trial) in trials.iter().enumerate() {
                let target = if index < n_train {
                    &mut splits.train
                } else if index < n_fit {
                    &mut splits.val
                } else {
                    &mut splits.test
                };
                match window_config.slide(trial) {
                    Ok(windows) => {
                        for window in windows {
                            target.windows.push(window);
                            target.labels.push(label);
                        }
                    }
                    Err(error) => {
                        // A too-short trial is dropped, not fatal.
                        tracing::warn!(%user, index, %error, "skipping trial");
                    }
                }
            }
        }

        if splits.train.is_empty() {
            return Err(CoreError::configuration("no training windows produced"));
        }
        info!(
            users = splits.users.len(),
            train = splits.train.len(),
            val = splits.val.len(),
            test = splits.test.len(),
            "built dataset splits"
        );
        Ok(splits)
    }

    /// Number of users.
    #[must_use]
    pub fn n_users(&self) -> usize {
        self.users.len()
    }
}
