//! Transactions.
//!
//! A [`Transaction`] is the context a group of mutations shares: the blob
//! store they allocate from, the durability they commit with, and the
//! recency stamp their primary writes carry. A batched replace shares one
//! transaction across all of its pipelined tasks.

use std::sync::Arc;

use quill_common::config::Durability;
use quill_common::types::Timestamp;

use crate::blob::BlobStore;

/// A write (or read) transaction over one store.
#[derive(Debug, Clone)]
pub struct Transaction {
    blobs: Arc<BlobStore>,
    durability: Durability,
    timestamp: Timestamp,
}

impl Transaction {
    /// Creates a transaction.
    #[must_use]
    pub fn new(blobs: Arc<BlobStore>, durability: Durability, timestamp: Timestamp) -> Self {
        Self {
            blobs,
            durability,
            timestamp,
        }
    }

    /// The blob store mutations allocate from and read through.
    #[inline]
    #[must_use]
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// The durability this transaction commits with.
    #[inline]
    #[must_use]
    pub fn durability(&self) -> Durability {
        self.durability
    }

    /// The recency stamp primary writes carry.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}
