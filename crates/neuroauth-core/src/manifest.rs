//! Canonical channel manifest.
//!
//! The 48 EEG channel names used at acquisition, in the order every
//! downstream component assumes. The built-in manifest is the first 48
//! electrodes of the BioSemi 64-channel layout (A1-A32 followed by B1-B16),
//! which is what the acquisition format records.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, SignalError};
use crate::N_CHANNELS;

/// BioSemi 64-layout electrode names, banks A1-A32 then B1-B16.
const CANONICAL_CHANNELS: [&str; N_CHANNELS] = [
    "Fp1", "AF7", "AF3", "F1", "F3", "F5", "F7", "FT7", "FC5", "FC3", "FC1", "C1", "C3", "C5",
    "T7", "TP7", "CP5", "CP3", "CP1", "P1", "P3", "P5", "P7", "PO7", "PO3", "O1", "Iz", "Oz",
    "POz", "Pz", "CPz", "Fpz", "Fp2", "AF8", "AF4", "AFz", "Fz", "F2", "F4", "F6", "F8", "FT8",
    "FC6", "FC4", "FC2", "FCz", "Cz", "C2",
];

/// Source-of-truth list of canonical channel names and their ordering.
///
/// Loaded once at startup; recordings are validated against it and channels
/// are selected in manifest order regardless of their order on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelManifest {
    names: Vec<String>,
}

impl ChannelManifest {
    /// The built-in 48-channel manifest.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            names: CANONICAL_CHANNELS.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    /// Builds a manifest from an explicit name list.
    ///
    /// # Errors
    ///
    /// Rejects empty lists and duplicate names.
    pub fn from_names(names: Vec<String>) -> CoreResult<Self> {
        if names.is_empty() {
            return Err(CoreError::configuration("channel manifest is empty"));
        }
        for (i, name) in names.iter().enumerate() {
            if names[..i].contains(name) {
                return Err(CoreError::configuration(format!(
                    "duplicate channel name '{name}' in manifest"
                )));
            }
        }
        Ok(Self { names })
    }

    /// Channel names in canonical order.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of canonical channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the manifest is empty (never true for a validated manifest).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of a channel name in the canonical ordering.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// For each canonical channel, its row index within `available`.
    ///
    /// This is the selection step of the signal loader: given the channel
    /// names present in a recording, produce the source indices that
    /// assemble the canonical 48-channel trial in manifest order.
    ///
    /// # Errors
    ///
    /// [`SignalError::MissingChannel`] if any canonical channel is absent.
    pub fn select_indices(&self, available: &[String]) -> CoreResult<Vec<usize>> {
        self.names
            .iter()
            .map(|name| {
                available
                    .iter()
                    .position(|a| a == name)
                    .ok_or_else(|| {
                        SignalError::MissingChannel {
                            name: name.clone(),
                        }
                        .into()
                    })
            })
            .collect()
    }
}

impl Default for ChannelManifest {
    fn default() -> Self {
        Self::builtin()
    }
}
