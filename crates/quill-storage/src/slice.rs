//! B-tree slices.
//!
//! A [`BtreeSlice`] is one B-tree: the primary index or one secondary index.
//! Structural changes (splits, root growth) happen only during write
//! descents, which require the slice's superblock; leaf-level mutation of a
//! located slot may run after the superblock has moved on to the next
//! writer.
//!
//! Write descents split any full node on the way down while the parent is
//! still held, so a located leaf always has room for one more entry and a
//! slot mutation never propagates structural changes upward. A leaf that
//! splits between locate and apply is chased through its sibling link using
//! the high fence key.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use quill_common::error::{QuillError, QuillResult};
use quill_common::types::{KeyRange, PageId, StoreKey, Timestamp};

use crate::node::{InternalNode, LeafNode, Node};
use crate::superblock::{Superblock, SuperblockKeeper};

static NEXT_SLICE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-slice operation counters.
#[derive(Debug, Default)]
pub struct SliceStats {
    keys_read: AtomicU64,
    keys_set: AtomicU64,
    keys_deleted: AtomicU64,
    leaf_splits: AtomicU64,
}

impl SliceStats {
    /// Number of point locates for read.
    #[must_use]
    pub fn keys_read(&self) -> u64 {
        self.keys_read.load(Ordering::Relaxed)
    }

    /// Number of slot sets.
    #[must_use]
    pub fn keys_set(&self) -> u64 {
        self.keys_set.load(Ordering::Relaxed)
    }

    /// Number of slot clears.
    #[must_use]
    pub fn keys_deleted(&self) -> u64 {
        self.keys_deleted.load(Ordering::Relaxed)
    }

    /// Number of leaf splits.
    #[must_use]
    pub fn leaf_splits(&self) -> u64 {
        self.leaf_splits.load(Ordering::Relaxed)
    }
}

/// A located leaf slot: the result of a descent for one key.
///
/// `value` holds the slot's current encoded bytes, or `None` when the slot
/// is empty.
#[derive(Debug, Clone)]
pub struct KvLocation {
    /// The leaf the key belongs to (at locate time).
    pub leaf: PageId,
    /// The key that was located.
    pub key: StoreKey,
    /// Current encoded value bytes, if the slot is occupied.
    pub value: Option<Bytes>,
}

/// A mutation to apply at a located slot.
#[derive(Debug, Clone)]
pub enum SlotChange {
    /// Store the given encoded bytes in the slot.
    Set(Bytes),
    /// Clear the slot.
    Clear,
}

/// One B-tree: the primary index or a single secondary index.
#[derive(Debug)]
pub struct BtreeSlice {
    id: u64,
    name: String,
    pages: DashMap<PageId, Arc<Mutex<Node>>>,
    next_page: AtomicU64,
    root: Mutex<PageId>,
    leaf_capacity: usize,
    stats: SliceStats,
    root_eviction_priority: AtomicI64,
    key_tombstones: Mutex<Vec<(StoreKey, Timestamp)>>,
    range_tombstones: Mutex<Vec<(KeyRange, Timestamp)>>,
    superblock: SuperblockKeeper,
}

impl BtreeSlice {
    /// Creates an empty slice with the given leaf capacity.
    #[must_use]
    pub fn new(name: impl Into<String>, leaf_capacity: usize) -> Arc<Self> {
        let id = NEXT_SLICE_ID.fetch_add(1, Ordering::Relaxed);
        let pages = DashMap::new();
        let root_id = PageId::new(0);
        pages.insert(root_id, Arc::new(Mutex::new(Node::Leaf(LeafNode::new()))));

        Arc::new(Self {
            id,
            name: name.into(),
            pages,
            next_page: AtomicU64::new(1),
            root: Mutex::new(root_id),
            leaf_capacity,
            stats: SliceStats::default(),
            root_eviction_priority: AtomicI64::new(0),
            key_tombstones: Mutex::new(Vec::new()),
            range_tombstones: Mutex::new(Vec::new()),
            superblock: SuperblockKeeper::new(id),
        })
    }

    /// This slice's unique ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// This slice's name (table name or sindex name).
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The superblock keeper for this slice.
    #[inline]
    #[must_use]
    pub fn superblock(&self) -> &SuperblockKeeper {
        &self.superblock
    }

    /// Per-slice counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> &SliceStats {
        &self.stats
    }

    /// Bumps the root eviction priority; called on every write so the cache
    /// keeps hot roots resident.
    pub fn bump_root_eviction_priority(&self) {
        self.root_eviction_priority.fetch_add(1, Ordering::Relaxed);
    }

    /// Current root eviction priority.
    #[must_use]
    pub fn root_eviction_priority(&self) -> i64 {
        self.root_eviction_priority.load(Ordering::Relaxed)
    }

    fn alloc_page(&self, node: Node) -> PageId {
        let id = PageId::new(self.next_page.fetch_add(1, Ordering::Relaxed));
        self.pages.insert(id, Arc::new(Mutex::new(node)));
        id
    }

    pub(crate) fn page(&self, id: PageId) -> QuillResult<Arc<Mutex<Node>>> {
        self.pages
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(QuillError::PageNotFound { page_id: id })
    }

    fn assert_capability(&self, superblock: &Superblock) {
        debug_assert_eq!(
            superblock.slice_id(),
            self.id,
            "superblock for slice {} used against slice {} ({})",
            superblock.slice_id(),
            self.id,
            self.name,
        );
    }

    /// Locates the leaf slot for `key` without preparing for mutation.
    pub fn locate_for_read(
        &self,
        superblock: &Superblock,
        key: &StoreKey,
    ) -> QuillResult<KvLocation> {
        self.assert_capability(superblock);
        let location = self.descend(key)?;
        self.stats.keys_read.fetch_add(1, Ordering::Relaxed);
        Ok(location)
    }

    /// Locates the leaf slot for `key`, splitting any full node on the path
    /// so the returned slot can absorb one insertion without structural
    /// changes.
    ///
    /// Once this returns, the caller may hand the superblock to the next
    /// writer; the located slot stays valid through [`Self::apply_change`].
    pub fn locate_for_write(
        &self,
        superblock: &Superblock,
        key: &StoreKey,
    ) -> QuillResult<KvLocation> {
        self.assert_capability(superblock);
        self.split_root_if_full()?;

        let mut current = *self.root.lock();
        loop {
            let child = {
                let node_arc = self.page(current)?;
                let guard = node_arc.lock();
                match &*guard {
                    Node::Internal(internal) => Some(internal.find_child(key)),
                    Node::Leaf(_) => None,
                }
            };

            match child {
                Some(child_id) => {
                    if self.node_is_full(child_id)? {
                        self.split_child(current, child_id)?;
                        // Separators changed; re-route from the same node.
                        continue;
                    }
                    current = child_id;
                }
                None => {
                    return self.read_slot(current, key);
                }
            }
        }
    }

    fn descend(&self, key: &StoreKey) -> QuillResult<KvLocation> {
        let mut current = *self.root.lock();
        loop {
            let next = {
                let node_arc = self.page(current)?;
                let guard = node_arc.lock();
                match &*guard {
                    Node::Internal(internal) => Some(internal.find_child(key)),
                    Node::Leaf(_) => None,
                }
            };
            match next {
                Some(child) => current = child,
                None => return self.read_slot(current, key),
            }
        }
    }

    /// Reads the slot for `key` in the leaf at `page`, chasing sibling links
    /// if the leaf has been split past the key.
    fn read_slot(&self, page: PageId, key: &StoreKey) -> QuillResult<KvLocation> {
        let mut current = page;
        loop {
            let node_arc = self.page(current)?;
            let guard = node_arc.lock();
            let Node::Leaf(leaf) = &*guard else {
                return Err(QuillError::corruption(format!(
                    "page {current} expected to be a leaf in slice '{}'",
                    self.name
                )));
            };
            if leaf.past_high_key(key) {
                let Some(next) = leaf.next_leaf else {
                    return Err(QuillError::corruption(format!(
                        "rightmost leaf {current} carries a high fence in slice '{}'",
                        self.name
                    )));
                };
                current = next;
                continue;
            }
            return Ok(KvLocation {
                leaf: current,
                key: key.clone(),
                value: leaf.get(key).map(|entry| entry.value.clone()),
            });
        }
    }

    fn node_is_full(&self, id: PageId) -> QuillResult<bool> {
        let node_arc = self.page(id)?;
        let guard = node_arc.lock();
        Ok(guard.is_full(self.leaf_capacity))
    }

    fn split_root_if_full(&self) -> QuillResult<()> {
        let mut root = self.root.lock();
        let root_full = {
            let node_arc = self.page(*root)?;
            let full = node_arc.lock().is_full(self.leaf_capacity);
            full
        };
        if !root_full {
            return Ok(());
        }

        let old_root = *root;
        let new_root = self.alloc_page(Node::Internal(InternalNode::with_single_child(old_root)));
        *root = new_root;
        drop(root);

        self.split_child(new_root, old_root)
    }

    /// Splits a full child of `parent`. Locks parent before child, the same
    /// order every descent takes, and the only two-node lock in the slice.
    fn split_child(&self, parent: PageId, child: PageId) -> QuillResult<()> {
        let parent_arc = self.page(parent)?;
        let child_arc = self.page(child)?;
        let mut parent_guard = parent_arc.lock();
        let mut child_guard = child_arc.lock();

        let Node::Internal(parent_node) = &mut *parent_guard else {
            return Err(QuillError::corruption(format!(
                "split parent {parent} is not internal in slice '{}'",
                self.name
            )));
        };

        match &mut *child_guard {
            Node::Leaf(leaf) => {
                if leaf.len() < self.leaf_capacity {
                    return Ok(());
                }
                let (separator, right) = leaf.split();
                let right_id = self.alloc_page(Node::Leaf(right));
                leaf.next_leaf = Some(right_id);
                parent_node.insert(separator, right_id);
                self.stats.leaf_splits.fetch_add(1, Ordering::Relaxed);
                trace!(slice = %self.name, leaf = %child, right = %right_id, "split leaf");
            }
            Node::Internal(internal) => {
                if internal.len() < self.leaf_capacity {
                    return Ok(());
                }
                let (separator, right) = internal.split();
                let right_id = self.alloc_page(Node::Internal(right));
                parent_node.insert(separator, right_id);
            }
        }
        Ok(())
    }

    /// Applies a mutation at a previously located slot.
    ///
    /// Does not require the superblock: the write descent already made room,
    /// so this only touches the leaf (chasing sibling links if a later
    /// descent split it).
    pub fn apply_change(
        &self,
        location: &KvLocation,
        change: SlotChange,
        recency: Timestamp,
    ) -> QuillResult<()> {
        let mut current = location.leaf;
        loop {
            let node_arc = self.page(current)?;
            let mut guard = node_arc.lock();
            let Node::Leaf(leaf) = &mut *guard else {
                return Err(QuillError::corruption(format!(
                    "located page {current} is not a leaf in slice '{}'",
                    self.name
                )));
            };
            if leaf.past_high_key(&location.key) {
                let Some(next) = leaf.next_leaf else {
                    return Err(QuillError::corruption(format!(
                        "rightmost leaf {current} carries a high fence in slice '{}'",
                        self.name
                    )));
                };
                current = next;
                continue;
            }

            match &change {
                SlotChange::Set(bytes) => {
                    leaf.set(location.key.clone(), bytes.clone(), recency);
                    self.stats.keys_set.fetch_add(1, Ordering::Relaxed);
                }
                SlotChange::Clear => {
                    if leaf.remove(&location.key).is_some() {
                        self.stats.keys_deleted.fetch_add(1, Ordering::Relaxed);
                        self.key_tombstones
                            .lock()
                            .push((location.key.clone(), recency));
                    }
                }
            }
            self.bump_root_eviction_priority();
            return Ok(());
        }
    }

    /// Removes an entry found during a range erase, without going through a
    /// located slot. Records no key tombstone; the eraser publishes a range
    /// tombstone instead.
    pub(crate) fn remove_entry_for_erase(
        &self,
        leaf: PageId,
        key: &StoreKey,
    ) -> QuillResult<bool> {
        let node_arc = self.page(leaf)?;
        let mut guard = node_arc.lock();
        let Node::Leaf(leaf_node) = &mut *guard else {
            return Err(QuillError::corruption(format!(
                "erase target {leaf} is not a leaf in slice '{}'",
                self.name
            )));
        };
        let removed = leaf_node.remove(key).is_some();
        if removed {
            self.stats.keys_deleted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// The current root page.
    pub(crate) fn root_page(&self) -> PageId {
        *self.root.lock()
    }

    /// The leftmost leaf of the slice.
    pub(crate) fn leftmost_leaf(&self) -> QuillResult<PageId> {
        self.leaf_containing(&StoreKey::empty())
    }

    /// The leaf a key belongs to, without touching stats.
    pub(crate) fn leaf_containing(&self, key: &StoreKey) -> QuillResult<PageId> {
        Ok(self.descend(key)?.leaf)
    }

    /// Records a range tombstone (published by the range eraser, consumed by
    /// backfill).
    pub fn record_range_tombstone(&self, range: KeyRange, recency: Timestamp) {
        self.range_tombstones.lock().push((range, recency));
    }

    /// Snapshot of key deletion tombstones.
    #[must_use]
    pub fn key_tombstones(&self) -> Vec<(StoreKey, Timestamp)> {
        self.key_tombstones.lock().clone()
    }

    /// Snapshot of range deletion tombstones.
    #[must_use]
    pub fn range_tombstones(&self) -> Vec<(KeyRange, Timestamp)> {
        self.range_tombstones.lock().clone()
    }
}
