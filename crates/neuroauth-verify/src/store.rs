//! Attribution artifact store.
//!
//! Append-only, keyed by freshly generated UUIDs, pruned by TTL on write
//! and fetch. Each artifact doubles as the audit record of its
//! verification: scores, decision, internal error kind, strategy, and the
//! `(C, W)` importance map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use neuroauth_core::error::{CoreResult, ErrorKind, StorageError};
use neuroauth_core::Decision;

use crate::attribution::AttributionStrategy;

/// A stored per-verification record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionArtifact {
    /// Fresh identifier returned to the caller.
    pub artifact_id: String,
    /// Claimed identity of the verification.
    pub user_id: String,
    /// Raw similarity score.
    pub raw_score: f32,
    /// Calibrated probability.
    pub calibrated_probability: f32,
    /// Autoencoder reconstruction error.
    pub spoof_score: f32,
    /// Whether the spoof gate fired.
    pub is_spoof: bool,
    /// The decision returned.
    pub decision: Decision,
    /// Internal error kind, when the verification failed.
    pub error_kind: Option<ErrorKind>,
    /// Strategy that produced the map.
    pub strategy: AttributionStrategy,
    /// Map shape `(channels, samples)`; `(0, 0)` when no map was computed.
    pub map_shape: (usize, usize),
    /// Row-major importance values.
    pub map_values: Vec<f32>,
    /// Top channels by absolute attribution, `(channel, mass)`.
    pub top_channels: Vec<(usize, f32)>,
    /// Coarse time-bin importances.
    pub time_bins: Vec<f32>,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
}

impl AttributionArtifact {
    /// L1 mass of the stored map.
    #[must_use]
    pub fn map_l1(&self) -> f32 {
        self.map_values.iter().map(|v| v.abs()).sum()
    }
}

/// Filesystem-backed artifact store with TTL retention.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
    ttl: Duration,
}

impl ArtifactStore {
    /// Default artifact retention.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Open (and create) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> CoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io(dir.display().to_string(), e))?;
        Ok(Self { dir, ttl })
    }

    /// Open with the default 24-hour TTL.
    pub fn open_default(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        Self::open(dir, Self::DEFAULT_TTL)
    }

    /// Generate a fresh artifact identifier.
    #[must_use]
    pub fn fresh_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Persist an artifact under its id. Prunes expired artifacts first.
    pub fn put(&self, artifact: &AttributionArtifact) -> CoreResult<()> {
        self.prune();
        let path = self.path_of(&artifact.artifact_id);
        let json = serde_json::to_vec(artifact)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(&path, json)
            .map_err(|e| StorageError::io(path.display().to_string(), e))?;
        debug!(id = %artifact.artifact_id, "stored attribution artifact");
        Ok(())
    }

    /// Fetch the raw serialized artifact bytes.
    pub fn fetch_bytes(&self, id: &str) -> CoreResult<Vec<u8>> {
        self.prune();
        let path = self.path_of(id);
        std::fs::read(&path).map_err(|_| {
            StorageError::ArtifactNotFound { id: id.to_owned() }.into()
        })
    }

    /// Fetch and deserialize an artifact.
    pub fn fetch(&self, id: &str) -> CoreResult<AttributionArtifact> {
        let bytes = self.fetch_bytes(id)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::serialization(e.to_string()).into())
    }

    /// Number of artifacts currently retained.
    #[must_use]
    pub fn len(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }

    /// Whether the store holds no artifacts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove artifacts older than the TTL.
    pub fn prune(&self) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let expired = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > self.ttl);
            if expired {
                if let Err(error) = std::fs::remove_file(entry.path()) {
                    warn!(%error, "failed to prune expired artifact");
                }
            }
        }
    }

    fn path_of(&self, id: &str) -> PathBuf {
        // Ids are UUIDs we generated; strip anything path-like defensively.
        let safe: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn artifact(id: &str) -> AttributionArtifact {
        AttributionArtifact {
            artifact_id: id.to_owned(),
            user_id: "alice".to_owned(),
            raw_score: 0.91,
            calibrated_probability: 0.97,
            spoof_score: 0.002,
            is_spoof: false,
            decision: Decision::Accept,
            error_kind: None,
            strategy: AttributionStrategy::IntegratedGradients,
            map_shape: (2, 3),
            map_values: vec![0.1, -0.2, 0.3, 0.0, 0.5, -0.1],
            top_channels: vec![(1, 0.6), (0, 0.6)],
            time_bins: vec![0.4, 0.8],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn put_fetch_round_trip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();
        let id = ArtifactStore::fresh_id();
        store.put(&artifact(&id)).unwrap();

        let fetched = store.fetch(&id).unwrap();
        assert_eq!(fetched.artifact_id, id);
        assert_eq!(fetched.map_shape, (2, 3));
        assert!(fetched.map_l1() > 0.0);

        let bytes = store.fetch_bytes(&id).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn unknown_id_is_not_found() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();
        let err = store.fetch("no-such-artifact").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn fresh_ids_are_unique() {
        let a = ArtifactStore::fresh_id();
        let b = ArtifactStore::fresh_id();
        assert_ne!(a, b);
    }

    #[test]
    fn expired_artifacts_are_pruned() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open(dir.path(), Duration::from_secs(0)).unwrap();
        let id = ArtifactStore::fresh_id();
        store.put(&artifact(&id)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        store.prune();
        assert!(store.fetch(&id).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn path_traversal_is_neutralised() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::open_default(dir.path()).unwrap();
        // A hostile id cannot escape the store directory.
        assert!(store.fetch("../../etc/passwd").is_err());
    }
}
