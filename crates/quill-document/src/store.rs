//! The store facade.
//!
//! A [`Store`] owns the primary slice, the secondary-index directory, the
//! sindex-block lock, the sindex replay queue, and the blob store they all
//! share. Operations borrow the pieces they need; the store itself holds no
//! operation state.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard, OwnedMutexGuard};
use tracing::debug;

use quill_common::config::{Durability, StoreConfig};
use quill_common::error::{QuillError, QuillResult};
use quill_common::types::Timestamp;
use quill_storage::blob::BlobStore;
use quill_storage::slice::BtreeSlice;
use quill_storage::superblock::Superblock;
use quill_storage::txn::Transaction;

use crate::report::SindexChange;
use crate::sindex::SindexWriteAccess;

/// One secondary index: its opaque descriptor, its slice, and whether it
/// has been fully constructed.
#[derive(Debug)]
pub struct Sindex {
    name: String,
    descriptor: Bytes,
    slice: Arc<BtreeSlice>,
    post_constructed: AtomicBool,
}

impl Sindex {
    /// The index name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The opaque mapping descriptor.
    #[inline]
    #[must_use]
    pub fn descriptor(&self) -> &Bytes {
        &self.descriptor
    }

    /// The index's slice.
    #[inline]
    #[must_use]
    pub fn slice(&self) -> &Arc<BtreeSlice> {
        &self.slice
    }

    /// True once the index has been fully built over the existing table.
    /// Crash recovery wipes and rebuilds indexes that never got this flag.
    #[must_use]
    pub fn is_post_constructed(&self) -> bool {
        self.post_constructed.load(Ordering::Acquire)
    }
}

/// A document store: primary index, secondary indexes, replay queue.
#[derive(Debug)]
pub struct Store {
    config: StoreConfig,
    blobs: Arc<BlobStore>,
    primary: Arc<BtreeSlice>,
    sindexes: RwLock<BTreeMap<String, Arc<Sindex>>>,
    sindex_block: Arc<AsyncMutex<()>>,
    sindex_queue: parking_lot::Mutex<VecDeque<Bytes>>,
}

impl Store {
    /// Creates a store with the given configuration.
    pub fn new(name: impl Into<String>, config: StoreConfig) -> QuillResult<Arc<Self>> {
        config.validate()?;
        let name = name.into();
        let primary = BtreeSlice::new(name, config.leaf_capacity);
        Ok(Arc::new(Self {
            config,
            blobs: Arc::new(BlobStore::new()),
            primary,
            sindexes: RwLock::new(BTreeMap::new()),
            sindex_block: Arc::new(AsyncMutex::new(())),
            sindex_queue: parking_lot::Mutex::new(VecDeque::new()),
        }))
    }

    /// The store configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The shared blob store.
    #[inline]
    #[must_use]
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// The primary slice.
    #[inline]
    #[must_use]
    pub fn primary(&self) -> &Arc<BtreeSlice> {
        &self.primary
    }

    /// Begins a transaction at the current time.
    #[must_use]
    pub fn begin_transaction(&self, durability: Durability) -> Transaction {
        Transaction::new(self.blobs.clone(), durability, Timestamp::now())
    }

    /// Acquires the primary superblock for a write.
    pub async fn acquire_superblock_for_write(&self) -> Superblock {
        self.primary.superblock().acquire().await
    }

    /// Acquires the primary superblock for a read.
    pub async fn acquire_superblock_for_read(&self) -> Superblock {
        self.primary.superblock().acquire().await
    }

    /// Registers a new secondary index. The index starts out not
    /// post-constructed; run post-construction to populate it.
    pub fn sindex_create(&self, name: &str, descriptor: Bytes) -> QuillResult<()> {
        let mut sindexes = self.sindexes.write();
        if sindexes.contains_key(name) {
            return Err(QuillError::SindexExists {
                name: name.to_string(),
            });
        }
        let slice = BtreeSlice::new(format!("sindex:{name}"), self.config.leaf_capacity);
        sindexes.insert(
            name.to_string(),
            Arc::new(Sindex {
                name: name.to_string(),
                descriptor,
                slice,
                post_constructed: AtomicBool::new(false),
            }),
        );
        debug!(sindex = name, "created secondary index");
        Ok(())
    }

    /// Drops a secondary index.
    pub fn sindex_drop(&self, name: &str) -> QuillResult<()> {
        self.sindexes
            .write()
            .remove(name)
            .map(|_| debug!(sindex = name, "dropped secondary index"))
            .ok_or_else(|| QuillError::SindexNotFound {
                name: name.to_string(),
            })
    }

    /// Marks a secondary index fully constructed.
    pub fn mark_sindex_post_constructed(&self, name: &str) -> QuillResult<()> {
        let sindexes = self.sindexes.read();
        let sindex = sindexes.get(name).ok_or_else(|| QuillError::SindexNotFound {
            name: name.to_string(),
        })?;
        sindex.post_constructed.store(true, Ordering::Release);
        Ok(())
    }

    /// Snapshot of the sindex directory: name to descriptor.
    #[must_use]
    pub fn sindex_list(&self) -> BTreeMap<String, Bytes> {
        self.sindexes
            .read()
            .iter()
            .map(|(name, sindex)| (name.clone(), sindex.descriptor.clone()))
            .collect()
    }

    /// Looks up one secondary index.
    #[must_use]
    pub fn sindex(&self, name: &str) -> Option<Arc<Sindex>> {
        self.sindexes.read().get(name).cloned()
    }

    /// Acquires the sindex-block lock for write.
    pub async fn acquire_sindex_block_for_write(&self) -> MutexGuard<'_, ()> {
        self.sindex_block.lock().await
    }

    /// Acquires the sindex-block lock for write, with an owned guard that
    /// can be held across a batch.
    pub async fn acquire_sindex_block_for_write_owned(&self) -> OwnedMutexGuard<()> {
        self.sindex_block.clone().lock_owned().await
    }

    /// Acquires write access (including the superblock) to every
    /// post-constructed secondary index. Partially constructed indexes are
    /// excluded; they rebuild from scratch anyway.
    ///
    /// Acquisition happens in name order, so concurrent callers cannot
    /// deadlock against each other.
    pub async fn acquire_post_constructed_sindex_superblocks_for_write(
        &self,
    ) -> Vec<Arc<SindexWriteAccess>> {
        let selected: Vec<Arc<Sindex>> = self
            .sindexes
            .read()
            .values()
            .filter(|sindex| sindex.is_post_constructed())
            .cloned()
            .collect();

        let mut accesses = Vec::with_capacity(selected.len());
        for sindex in selected {
            let superblock = sindex.slice.superblock().acquire().await;
            accesses.push(Arc::new(SindexWriteAccess::new(sindex, superblock)));
        }
        accesses
    }

    /// Acquires write access to the named secondary indexes, skipping any
    /// that have been dropped in the meantime.
    pub async fn acquire_sindex_superblocks_for_write(
        &self,
        names: &BTreeSet<String>,
    ) -> Vec<Arc<SindexWriteAccess>> {
        let selected: Vec<Arc<Sindex>> = {
            let sindexes = self.sindexes.read();
            names
                .iter()
                .filter_map(|name| sindexes.get(name).cloned())
                .collect()
        };

        let mut accesses = Vec::with_capacity(selected.len());
        for sindex in selected {
            let superblock = sindex.slice.superblock().acquire().await;
            accesses.push(Arc::new(SindexWriteAccess::new(sindex, superblock)));
        }
        accesses
    }

    /// Pushes a wire-encoded record onto the replay queue. The push is a
    /// short synchronous section under the queue's dedicated mutex.
    pub fn sindex_queue_push(&self, record: Bytes) {
        self.sindex_queue.lock().push_back(record);
    }

    /// Number of records on the replay queue.
    #[must_use]
    pub fn sindex_queue_len(&self) -> usize {
        self.sindex_queue.lock().len()
    }

    /// Drains and decodes the replay queue, in push order. Replay
    /// scheduling is the caller's concern; this only exposes the records.
    pub fn drain_sindex_queue(&self) -> QuillResult<Vec<SindexChange>> {
        let records: Vec<Bytes> = self.sindex_queue.lock().drain(..).collect();
        records
            .iter()
            .map(|record| crate::report::decode_sindex_change(record))
            .collect()
    }
}
