//! # Neuroauth Training
//!
//! The offline pipeline that produces the serving model bundle:
//!
//! 1. [`dataset`]: windowed training data with the per-user trial split.
//! 2. [`trainer`]: two-phase optimization (classification warmup, then
//!    proxy-anchor metric learning) with checkpoints, early stopping, and
//!    finite-loss/gradient sanity gates.
//! 3. [`artifacts`]: fitting of the derived serving artifacts (per-user
//!    prototypes, score calibrator, spoof autoencoder, operating
//!    threshold).
//! 4. [`eval`]: FAR/FRR sweeps, equal-error rate, and the threshold
//!    selection they drive.
//!
//! [`config::TrainingConfig`] is the single source of truth for every
//! hyperparameter; it is serde-serializable so runs are reproducible from
//! a config file and a seed.

#![deny(unsafe_code)]

pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod eval;
pub mod trainer;

pub use artifacts::{fit_serving_artifacts, ServingArtifacts};
pub use config::TrainingConfig;
pub use dataset::{DatasetSplits, WindowSet};
pub use trainer::{Checkpoint, EpochStats, Trainer, TrainingOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
