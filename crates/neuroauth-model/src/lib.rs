//! # Neuroauth Model
//!
//! The learnable and fittable models of the neuroauth system, implemented
//! in plain Rust on `ndarray`. All arithmetic uses `f32`; no external ML
//! framework dependencies.
//!
//! - [`encoder`]: the sequence encoder (input projection, two-layer
//!   bidirectional GRU, temporal attention, projection head, L2
//!   normalization) with full analytic forward/backward, including input
//!   gradients for attribution.
//! - [`nn`]: layer primitives ([`nn::Linear`]) with the flat
//!   parameter/gradient layout the optimizer and checkpoints operate on.
//! - [`gru`] and [`attention`]: the recurrent and pooling pieces of the
//!   encoder.
//! - [`loss`]: warmup cross-entropy and the proxy-anchor metric loss.
//! - [`optim`]: decoupled-weight-decay Adam, plateau scheduler, gradient
//!   clipping.
//! - [`autoencoder`]: the embedding autoencoder behind the spoof gate.
//! - [`calibration`]: the two-parameter logistic score calibrator.
//! - [`prototypes`]: spherical k-means prototype construction and the
//!   per-user prototype table.

#![deny(unsafe_code)]

pub mod attention;
pub mod autoencoder;
pub mod calibration;
pub mod encoder;
pub mod gru;
pub mod loss;
pub mod nn;
pub mod optim;
pub mod prototypes;

pub use autoencoder::{AnomalyModel, AutoencoderConfig};
pub use calibration::{DecisionCriterion, LogisticCalibrator, OperatingThreshold};
pub use encoder::{EegEncoder, EncoderConfig};
pub use prototypes::{build_prototypes, PrototypeTable};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Format version written into every persisted model artifact.
pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
