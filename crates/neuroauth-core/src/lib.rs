//! # Neuroauth Core
//!
//! Core types, errors, and utilities shared across the neuroauth EEG
//! verification system.
//!
//! This crate provides the foundational building blocks used throughout the
//! workspace:
//!
//! - **Core Data Types**: [`Trial`], [`ProcessedTrial`], [`Window`],
//!   [`Embedding`], and [`PrototypeSet`] for representing EEG recordings and
//!   the embedding space they are verified in.
//!
//! - **Error Types**: the [`error`] module defines the system-wide error
//!   taxonomy ([`CoreError`] plus per-subsystem enums) and the
//!   [`ErrorKind`](error::ErrorKind) labels recorded in audit artifacts.
//!
//! - **Channel Manifest**: [`ChannelManifest`] is the single source of truth
//!   for the canonical acquisition channel names and their ordering.
//!
//! - **Utilities**: cosine similarity, L2 normalization, running statistics,
//!   and the deterministic [`Xorshift64`](utils::Xorshift64) generator used
//!   everywhere randomness is needed.
//!
//! ## Example
//!
//! ```rust
//! use neuroauth_core::{Embedding, PrototypeSet};
//! use ndarray::{arr1, arr2};
//!
//! let probe = Embedding::new(arr1(&[1.0, 0.0, 0.0, 0.0])).unwrap();
//! let set = PrototypeSet::new(arr2(&[
//!     [1.0, 0.0, 0.0, 0.0],
//!     [0.0, 1.0, 0.0, 0.0],
//! ])).unwrap();
//!
//! let (index, score) = set.best_match(&probe);
//! assert_eq!(index, 0);
//! assert!((score - 1.0).abs() < 1e-6);
//! ```

#![deny(unsafe_code)]

pub mod error;
pub mod manifest;
pub mod traits;
pub mod types;
pub mod utils;

pub use error::{CoreError, CoreResult, ErrorKind, ModelError, SignalError, StorageError};
pub use manifest::ChannelManifest;
pub use traits::WindowEncoder;
pub use types::{
    Decision, Embedding, ProcessedTrial, PrototypeSet, ScoreAggregation, Trial, UserId,
    VerificationResult, Window,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of canonical EEG channels the system operates on.
pub const N_CHANNELS: usize = 48;

/// Sample rate every trial is resampled to before windowing (Hz).
pub const SAMPLE_RATE_OUT: f32 = 128.0;

/// Dimension of the embedding space.
pub const EMBEDDING_DIM: usize = 128;

/// Tolerance on the unit norm of embeddings and prototypes.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-4;

/// Prelude module for convenient imports.
///
/// ```rust
/// use neuroauth_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{CoreError, CoreResult, ErrorKind};
    pub use crate::manifest::ChannelManifest;
    pub use crate::traits::WindowEncoder;
    pub use crate::types::{
        Decision, Embedding, ProcessedTrial, PrototypeSet, ScoreAggregation, Trial, UserId,
        VerificationResult, Window,
    };
}
