//! Out-of-leaf blob regions.
//!
//! A document whose serialized form exceeds the inline threshold is written
//! to a blob region; the leaf then holds only a small reference. The region
//! must be cleared before the referencing leaf slot is discarded, or the
//! region leaks.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use quill_common::error::{QuillError, QuillResult};
use quill_common::types::BlobId;

/// Store of out-of-leaf byte regions, shared by every slice of one store.
#[derive(Debug, Default)]
pub struct BlobStore {
    regions: DashMap<BlobId, Bytes>,
    next_id: AtomicU64,
}

impl BlobStore {
    /// Creates an empty blob store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a region holding `data`, returning its ID.
    pub fn allocate(&self, data: Bytes) -> BlobId {
        let id = BlobId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.regions.insert(id, data);
        id
    }

    /// Reads a region.
    pub fn read(&self, id: BlobId) -> QuillResult<Bytes> {
        self.regions
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(QuillError::BlobMissing { blob_id: id })
    }

    /// Clears a region, freeing its bytes.
    pub fn clear(&self, id: BlobId) -> QuillResult<()> {
        self.regions
            .remove(&id)
            .map(|_| ())
            .ok_or(QuillError::BlobMissing { blob_id: id })
    }

    /// Returns true if the region exists.
    #[must_use]
    pub fn contains(&self, id: BlobId) -> bool {
        self.regions.contains_key(&id)
    }

    /// Number of live regions.
    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }
}
