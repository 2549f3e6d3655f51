//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, QuillResult};

/// Write durability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Fully durable: the write is acknowledged only once persisted.
    Hard,
    /// Soft durability: the write may be acknowledged before persistence.
    ///
    /// Secondary-index post-construction uses this; a partially built index
    /// is detected by its missing "fully constructed" flag and rebuilt.
    Soft,
}

/// Configuration for a document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of entries per leaf node before a split.
    pub leaf_capacity: usize,

    /// Serialized documents at or below this size are stored inline in the
    /// leaf; larger documents spill to the blob store.
    pub inline_value_threshold: usize,

    /// Maximum encoded length of a leaf value reference.
    pub max_ref_len: usize,

    /// Chunk budget for one ranged read: traversal halts and marks the
    /// response truncated once the cumulative estimated size of streamed
    /// rows crosses this bound.
    pub rget_max_chunk_size: usize,

    /// Default write durability.
    pub durability: Durability,
}

impl StoreConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> QuillResult<()> {
        if self.leaf_capacity < 4 {
            return Err(QuillError::invalid_argument(
                "leaf_capacity must be at least 4",
            ));
        }
        if self.inline_value_threshold == 0 {
            return Err(QuillError::invalid_argument(
                "inline_value_threshold must be non-zero",
            ));
        }
        if self.max_ref_len < 32 {
            return Err(QuillError::invalid_argument("max_ref_len must be at least 32"));
        }
        if self.rget_max_chunk_size == 0 {
            return Err(QuillError::invalid_argument(
                "rget_max_chunk_size must be non-zero",
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            leaf_capacity: 64,
            inline_value_threshold: 200,
            max_ref_len: 251,
            rget_max_chunk_size: 1024 * 1024,
            durability: Durability::Hard,
        }
    }
}
