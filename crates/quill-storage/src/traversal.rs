//! Traversals over a slice.
//!
//! - [`depth_first_traversal`]: left-to-right walk of a key range, feeding
//!   each pair to a callback that can stop the walk.
//! - [`parallel_leaf_traversal`]: visits every leaf concurrently under a
//!   drain scope; used by secondary-index post-construction.
//! - [`erase_range_generic`]: deletes every tested key inside an
//!   `(left_exclusive, right_inclusive]` tree range.
//! - [`key_distribution`]: samples separator keys for distribution
//!   estimates.
//!
//! All traversals require the slice's superblock; leaf contents are
//! snapshotted per leaf so callbacks run without holding node locks.

use std::future::Future;

use bytes::Bytes;
use tokio::task::JoinSet;

use quill_common::error::{QuillError, QuillResult};
use quill_common::interrupt::Interruptor;
use quill_common::types::{KeyRange, PageId, StoreKey};

use crate::node::{LeafEntry, Node};
use crate::slice::BtreeSlice;
use crate::superblock::Superblock;

/// Decides which keys a range erase actually removes.
pub trait KeyTester: Send + Sync {
    /// Returns true if the key should be erased.
    fn key_should_be_erased(&self, key: &StoreKey) -> bool;
}

/// Releases resources owned by a value that is about to be erased.
pub trait ValueDeleter {
    /// Frees whatever the encoded value references (e.g. a blob region).
    fn delete_value(&self, value: &Bytes) -> QuillResult<()>;
}

/// Snapshots the in-range entries of one leaf and returns the next leaf.
fn snapshot_leaf(
    slice: &BtreeSlice,
    page: PageId,
) -> QuillResult<(Vec<LeafEntry>, Option<PageId>)> {
    let node_arc = slice.page(page)?;
    let guard = node_arc.lock();
    let Node::Leaf(leaf) = &*guard else {
        return Err(QuillError::corruption(format!(
            "traversal reached non-leaf page {page} in slice '{}'",
            slice.name()
        )));
    };
    Ok((leaf.entries.clone(), leaf.next_leaf))
}

/// Walks `range` left to right, calling `visit` for every live entry.
///
/// `visit` returns false to stop the walk early (budget exhausted, terminal
/// poisoned).
pub fn depth_first_traversal<F>(
    slice: &BtreeSlice,
    superblock: &Superblock,
    range: &KeyRange,
    visit: &mut F,
) -> QuillResult<()>
where
    F: FnMut(&LeafEntry) -> bool,
{
    debug_assert_eq!(superblock.slice_id(), slice.id());

    let mut page = Some(slice.leaf_containing(range.left())?);
    while let Some(current) = page {
        let (entries, next) = snapshot_leaf(slice, current)?;
        for entry in &entries {
            if entry.key < *range.left() {
                continue;
            }
            if range.is_past_right(&entry.key) {
                return Ok(());
            }
            if !visit(entry) {
                return Ok(());
            }
        }
        page = next;
    }
    Ok(())
}

/// Visits every leaf of the slice concurrently.
///
/// Each leaf's entries are snapshotted under the superblock and handed to
/// `per_leaf`, whose futures run inside a drain scope: this function does
/// not return until every spawned job has finished. The first job error is
/// returned after the drain completes.
pub async fn parallel_leaf_traversal<F, Fut>(
    slice: &BtreeSlice,
    superblock: &Superblock,
    per_leaf: F,
) -> QuillResult<()>
where
    F: Fn(Vec<LeafEntry>) -> Fut,
    Fut: Future<Output = QuillResult<()>> + Send + 'static,
{
    debug_assert_eq!(superblock.slice_id(), slice.id());

    let mut drainer = JoinSet::new();
    let mut page = Some(slice.leftmost_leaf()?);
    while let Some(current) = page {
        let (entries, next) = snapshot_leaf(slice, current)?;
        if !entries.is_empty() {
            drainer.spawn(per_leaf(entries));
        }
        page = next;
    }

    let mut result = Ok(());
    while let Some(joined) = drainer.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if result.is_ok() {
                    result = Err(err);
                }
            }
            Err(join_err) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
            }
        }
    }
    result
}

/// Erases every tested key in the tree range `(left_exclusive,
/// right_inclusive]`.
///
/// `None` bounds are open on that side. The value deleter runs before each
/// entry is removed so blob regions are freed first. Checks the interruptor
/// between leaves.
pub fn erase_range_generic(
    slice: &BtreeSlice,
    superblock: &Superblock,
    tester: &dyn KeyTester,
    deleter: &dyn ValueDeleter,
    left_exclusive: Option<&StoreKey>,
    right_inclusive: Option<&StoreKey>,
    interruptor: &Interruptor,
) -> QuillResult<()> {
    debug_assert_eq!(superblock.slice_id(), slice.id());

    let start_key = left_exclusive.cloned().unwrap_or_else(StoreKey::empty);
    let mut page = Some(slice.leaf_containing(&start_key)?);

    while let Some(current) = page {
        interruptor.check()?;
        let (entries, next) = snapshot_leaf(slice, current)?;

        for entry in &entries {
            if let Some(left) = left_exclusive {
                if entry.key <= *left {
                    continue;
                }
            }
            if let Some(right) = right_inclusive {
                if entry.key > *right {
                    return Ok(());
                }
            }
            if !tester.key_should_be_erased(&entry.key) {
                continue;
            }
            deleter.delete_value(&entry.value)?;
            slice.remove_entry_for_erase(current, &entry.key)?;
        }
        page = next;
    }
    Ok(())
}

/// Samples the slice's key distribution.
///
/// Returns the exact live key count and the separator keys found at the
/// deepest internal level within `max_depth` of the root. An empty split
/// vector means the tree is a single leaf.
pub fn key_distribution(
    slice: &BtreeSlice,
    superblock: &Superblock,
    max_depth: usize,
) -> QuillResult<(u64, Vec<StoreKey>)> {
    debug_assert_eq!(superblock.slice_id(), slice.id());

    // Exact count from the leaf chain.
    let mut count = 0u64;
    let mut page = Some(slice.leftmost_leaf()?);
    while let Some(current) = page {
        let (entries, next) = snapshot_leaf(slice, current)?;
        count += entries.len() as u64;
        page = next;
    }

    // Separator sample from the routing levels.
    let mut splits = Vec::new();
    let mut level = vec![slice.root_page()];
    for _ in 0..max_depth {
        let mut level_keys = Vec::new();
        let mut next_level = Vec::new();
        for id in &level {
            let node_arc = slice.page(*id)?;
            let guard = node_arc.lock();
            if let Node::Internal(internal) = &*guard {
                level_keys.extend(internal.keys.iter().cloned());
                next_level.extend(internal.children.iter().copied());
            }
        }
        if next_level.is_empty() {
            break;
        }
        splits = level_keys;
        level = next_level;
    }

    Ok((count, splits))
}
