//! # Neuroauth Verify
//!
//! The online decision core: model bundle management, enrollment, and the
//! verification engine.
//!
//! - [`bundle`]: the immutable serving bundle (encoder, prototype table,
//!   calibrator, anomaly model, operating threshold), its persistence
//!   layout, and the atomic hot swap used for reloads.
//! - [`engine`]: [`engine::VerificationEngine`] windows a probe, embeds,
//!   aggregates, scores, calibrates, applies the spoof gate, decides, and
//!   writes an attribution artifact. Every failure resolves to a rejecting
//!   [`neuroauth_core::VerificationResult`] carrying an internal error
//!   kind; nothing about the failure cause is distinguishable externally.
//! - [`attribution`]: gradient attribution strategies (integrated
//!   gradients by default) producing per-channel-per-sample importance
//!   maps.
//! - [`store`]: the append-only, TTL-pruned attribution artifact store,
//!   which doubles as the verification audit record.

#![deny(unsafe_code)]

pub mod attribution;
pub mod bundle;
pub mod engine;
pub mod store;

pub use attribution::AttributionStrategy;
pub use bundle::{ModelBundle, SharedBundle};
pub use engine::{EngineConfig, VerificationEngine};
pub use store::{ArtifactStore, AttributionArtifact};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
