//! Core trait abstractions.

use crate::error::CoreResult;
use crate::types::{Embedding, Window};

/// A learned mapping from one window to a unit-norm embedding.
///
/// Implementations must be deterministic under fixed weights; the
/// verification engine relies on this for its reload-stability guarantee.
pub trait WindowEncoder {
    /// Dimensionality of produced embeddings.
    fn embedding_dim(&self) -> usize;

    /// Encode one `(C, W)` window into a unit-norm embedding.
    fn encode(&self, window: &Window) -> CoreResult<Embedding>;

    /// Encode a batch of windows in order.
    fn encode_batch(&self, windows: &[Window]) -> CoreResult<Vec<Embedding>> {
        windows.iter().map(|w| self.encode(w)).collect()
    }
}
