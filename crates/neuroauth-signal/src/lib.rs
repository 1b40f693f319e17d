//! # Neuroauth Signal Processing
//!
//! Signal-side components of the neuroauth pipeline:
//!
//! - **Loading**: read multi-trial recordings, select the canonical channel
//!   subset in manifest order ([`loader`]).
//! - **Preprocessing**: zero-phase band-pass and notch filtering, optional
//!   ICA artifact removal, decimating resample, and per-channel
//!   standardization ([`preprocess`]).
//! - **Windowing**: deterministic strided slicing of processed trials
//!   ([`windowing`]).
//! - **Augmentation**: training-time perturbations: channel dropout,
//!   SNR-targeted noise, time shift, same-user mixup ([`augment`]).
//!
//! # Example
//!
//! ```rust,no_run
//! use neuroauth_core::ChannelManifest;
//! use neuroauth_signal::{
//!     loader::Recording,
//!     preprocess::{Preprocessor, PreprocessConfig},
//!     windowing::WindowConfig,
//! };
//!
//! let manifest = ChannelManifest::builtin();
//! let recording = Recording::read_file("session01.eegr").unwrap();
//! let preprocessor = Preprocessor::new(PreprocessConfig::default()).unwrap();
//!
//! for trial in recording.select_trials(&manifest).unwrap() {
//!     let processed = preprocessor.run(&trial).unwrap();
//!     let windows = WindowConfig::default().slide(&processed).unwrap();
//!     println!("{} windows", windows.len());
//! }
//! ```

#![deny(unsafe_code)]

pub mod augment;
pub mod filters;
pub mod ica;
pub mod loader;
pub mod preprocess;
pub mod windowing;

pub use augment::{AugmentConfig, Augmenter};
pub use loader::Recording;
pub use preprocess::{PreprocessConfig, Preprocessor};
pub use windowing::WindowConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
