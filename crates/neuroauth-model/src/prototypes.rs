//! Per-user prototype construction and the prototype table.
//!
//! Enrollment embeddings are clustered into K prototypes with spherical
//! k-means: k-means++ seeding, cosine assignment, mean-and-renormalize
//! centroid updates. A user with fewer embeddings than K has the deficit
//! filled with the mean embedding. K > 1 exists because one user produces
//! several distinct embedding modes across trials; a single mean averages
//! them away.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use neuroauth_core::error::{CoreResult, ModelError, StorageError};
use neuroauth_core::utils::{cosine_similarity, l2_norm, Xorshift64};
use neuroauth_core::{Embedding, PrototypeSet, UserId};

use crate::ARTIFACT_FORMAT_VERSION;

/// Convergence tolerance on centroid movement (cosine distance).
const KMEANS_TOLERANCE: f32 = 1e-4;
/// Iteration cap for the k-means loop.
const KMEANS_MAX_ITERATIONS: usize = 100;

/// Cluster a user's enrollment embeddings into `k ≥ 1` unit-norm
/// prototypes.
pub fn build_prototypes(embeddings: &[Embedding], k: usize, seed: u64) -> CoreResult<PrototypeSet> {
    if k == 0 {
        return Err(ModelError::fit_failed("prototype count must be at least 1").into());
    }
    if embeddings.is_empty() {
        return Err(ModelError::fit_failed("no enrollment embeddings").into());
    }
    let dim = embeddings[0].dim();

    // Mean embedding, used both for k = 1 and for deficit padding.
    let mut mean = Array1::<f32>::zeros(dim);
    for embedding in embeddings {
        mean += &embedding.values();
    }
    mean.mapv_inplace(|v| v / embeddings.len() as f32);
    if l2_norm(mean.view()) < 1e-10 {
        // Degenerate cancellation; fall back to the first embedding.
        mean = embeddings[0].values().to_owned();
    }

    if embeddings.len() < k {
        debug!(
            available = embeddings.len(),
            k, "fewer embeddings than prototypes, padding with the mean"
        );
        let mut matrix = Array2::<f32>::zeros((k, dim));
        for (row, embedding) in embeddings.iter().enumerate() {
            matrix.row_mut(row).assign(&embedding.values());
        }
        for row in embeddings.len()..k {
            matrix.row_mut(row).assign(&mean);
        }
        return PrototypeSet::new(matrix);
    }

    if k == 1 {
        let mut matrix = Array2::<f32>::zeros((1, dim));
        matrix.row_mut(0).assign(&mean);
        return PrototypeSet::new(matrix);
    }

    // k-means++ seeding on cosine distance.
    let mut rng = Xorshift64::new(seed);
    let mut centroids = Array2::<f32>::zeros((k, dim));
    let first = rng.next_index(embeddings.len());
    centroids.row_mut(0).assign(&embeddings[first].values());
    for centroid in 1..k {
        let distances: Vec<f32> = embeddings
            .iter()
            .map(|e| {
                (0..centroid)
                    .map(|c| 1.0 - cosine_similarity(e.values(), centroids.row(c)))
                    .fold(f32::INFINITY, f32::min)
                    .max(0.0)
            })
            .collect();
        let total: f32 = distances.iter().sum();
        let index = if total <= 1e-12 {
            rng.next_index(embeddings.len())
        } else {
            let mut target = rng.next_f32() * total;
            let mut chosen = distances.len() - 1;
            for (i, &d) in distances.iter().enumerate() {
                if target < d {
                    chosen = i;
                    break;
                }
                target -= d;
            }
            chosen
        };
        centroids.row_mut(centroid).assign(&embeddings[index].values());
    }

    // Lloyd iterations in the cosine sense.
    let mut assignments = vec![0usize; embeddings.len()];
    for _ in 0..KMEANS_MAX_ITERATIONS {
        // Assign to the most similar centroid.
        for (index, embedding) in embeddings.iter().enumerate() {
            let mut best = 0;
            let mut best_similarity = f32::NEG_INFINITY;
            for c in 0..k {
                let similarity = cosine_similarity(embedding.values(), centroids.row(c));
                if similarity > best_similarity {
                    best_similarity = similarity;
                    best = c;
                }
            }
            assignments[index] = best;
        }

        // Update: renormalized means; empty clusters re-seed from the most
        // distant embedding.
        let mut movement = 0.0f32;
        for c in 0..k {
            let members: Vec<usize> = assignments
                .iter()
                .enumerate()
                .filter(|(_, &a)| a == c)
                .map(|(i, _)| i)
                .collect();
            let mut updated = Array1::<f32>::zeros(dim);
            if members.is_empty() {
                let farthest = embeddings
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        cosine_similarity(a.values(), centroids.row(c))
                            .partial_cmp(&cosine_similarity(b.values(), centroids.row(c)))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                updated.assign(&embeddings[farthest].values());
            } else {
                for &member in &members {
                    updated += &embeddings[member].values();
                }
                updated.mapv_inplace(|v| v / members.len() as f32);
            }
            let norm = l2_norm(updated.view());
            if norm > 1e-10 {
                updated.mapv_inplace(|v| v / norm);
            } else {
                updated.assign(&mean);
            }
            movement = movement.max(1.0 - cosine_similarity(updated.view(), centroids.row(c)));
            centroids.row_mut(c).assign(&updated);
        }

        if movement < KMEANS_TOLERANCE {
            break;
        }
    }

    PrototypeSet::new(centroids)
}

/// Read-mostly mapping `user → prototype matrix`, built once from the
/// persisted prototype file and shared by the verification engine.
#[derive(Debug, Clone, Default)]
pub struct PrototypeTable {
    entries: BTreeMap<UserId, PrototypeSet>,
}

impl PrototypeTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user's prototypes (re-enrollment overwrites).
    pub fn insert(&mut self, user: UserId, prototypes: PrototypeSet) {
        self.entries.insert(user, prototypes);
    }

    /// Look up a user's prototypes.
    #[must_use]
    pub fn get(&self, user: &UserId) -> Option<&PrototypeSet> {
        self.entries.get(user)
    }

    /// Whether the user is enrolled.
    #[must_use]
    pub fn contains(&self, user: &UserId) -> bool {
        self.entries.contains_key(user)
    }

    /// Enrolled users in sorted order.
    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.entries.keys()
    }

    /// Entries in sorted user order.
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &PrototypeSet)> {
        self.entries.iter()
    }

    /// Number of enrolled users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any user is enrolled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Save as a versioned artifact.
    pub fn save(&self, path: impl AsRef<Path>) -> CoreResult<()> {
        let path = path.as_ref();
        let users: BTreeMap<String, StoredPrototypes> = self
            .entries
            .iter()
            .map(|(user, set)| {
                (
                    user.as_str().to_owned(),
                    StoredPrototypes {
                        k: set.k(),
                        dim: set.dim(),
                        values: set.matrix().iter().copied().collect(),
                    },
                )
            })
            .collect();
        let file = PrototypeTableFile {
            format_version: ARTIFACT_FORMAT_VERSION,
            users,
        };
        let json = serde_json::to_string(&file)
            .map_err(|e| StorageError::serialization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| StorageError::io(path.display().to_string(), e))?;
        info!(path = %path.display(), users = self.entries.len(), "saved prototype table");
        Ok(())
    }

    /// Load a persisted prototype table.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        let file: PrototypeTableFile = serde_json::from_str(&json)
            .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
        if file.format_version != ARTIFACT_FORMAT_VERSION {
            return Err(ModelError::VersionMismatch {
                expected: ARTIFACT_FORMAT_VERSION,
                found: file.format_version,
            }
            .into());
        }
        let mut table = Self::new();
        for (user, stored) in file.users {
            if stored.values.len() != stored.k * stored.dim {
                return Err(ModelError::ShapeMismatch {
                    expected: vec![stored.k, stored.dim],
                    actual: vec![stored.values.len()],
                }
                .into());
            }
            let matrix = Array2::from_shape_vec((stored.k, stored.dim), stored.values)
                .map_err(|e| ModelError::load_failed(path.display().to_string(), e.to_string()))?;
            table.insert(UserId::new(user), PrototypeSet::new(matrix)?);
        }
        Ok(table)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredPrototypes {
    k: usize,
    dim: usize,
    values: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct PrototypeTableFile {
    format_version: u32,
    users: BTreeMap<String, StoredPrototypes>,
}
