//! Backfill: streaming a key range to a replication callback.
//!
//! Wraps the slice traversal and decodes each leaf pair into `(key,
//! document, recency)` before forwarding. Also forwards range-deletion and
//! key-deletion tombstones newer than the caller's horizon, and the current
//! sindex directory, so the receiving replica can rebuild both data and
//! index state.

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

use quill_common::error::{QuillError, QuillResult};
use quill_common::interrupt::Interruptor;
use quill_common::types::{JsonHandle, KeyRange, StoreKey, Timestamp};
use quill_storage::superblock::Superblock;
use quill_storage::traversal::depth_first_traversal;
use quill_storage::txn::Transaction;

use crate::store::Store;
use crate::value;

/// One live pair streamed by a backfill.
#[derive(Debug, Clone)]
pub struct BackfillAtom {
    /// The primary key.
    pub key: StoreKey,
    /// The document.
    pub value: JsonHandle,
    /// Recency of the last write to the pair.
    pub recency: Timestamp,
}

/// Receiver of a backfill stream.
pub trait BackfillCallback: Send + Sync {
    /// A range of keys was deleted.
    fn on_delete_range(&self, range: &KeyRange) -> QuillResult<()>;

    /// A single key was deleted.
    fn on_deletion(&self, key: &StoreKey, recency: Timestamp) -> QuillResult<()>;

    /// A live pair.
    fn on_keyvalue(&self, atom: BackfillAtom) -> QuillResult<()>;

    /// The current sindex directory (name to opaque descriptor).
    fn on_sindexes(&self, sindexes: &BTreeMap<String, Bytes>) -> QuillResult<()>;
}

/// Streams every pair and tombstone in `range` newer than `since_when` to
/// the callback.
pub fn backfill(
    store: &Store,
    txn: &Transaction,
    range: &KeyRange,
    since_when: Timestamp,
    callback: &dyn BackfillCallback,
    superblock: &Superblock,
    interruptor: &Interruptor,
) -> QuillResult<()> {
    let primary = store.primary();

    callback.on_sindexes(&store.sindex_list())?;

    for (erased, recency) in primary.range_tombstones() {
        if recency < since_when || !range.is_superset(&erased) {
            continue;
        }
        callback.on_delete_range(&erased)?;
    }

    for (key, recency) in primary.key_tombstones() {
        if recency < since_when || !range.contains(&key) {
            continue;
        }
        callback.on_deletion(&key, recency)?;
    }

    let mut failure: Option<QuillError> = None;
    let mut forwarded = 0usize;
    depth_first_traversal(primary, superblock, range, &mut |entry| {
        if interruptor.is_pulsed() {
            failure = Some(QuillError::Interrupted);
            return false;
        }
        if entry.recency < since_when {
            return true;
        }
        debug_assert!(range.contains(&entry.key), "backfill pair outside the requested range");

        let atom = BackfillAtom {
            key: entry.key.clone(),
            value: value::get_data(txn, &entry.value),
            recency: entry.recency,
        };
        match callback.on_keyvalue(atom) {
            Ok(()) => {
                forwarded += 1;
                true
            }
            Err(err) => {
                failure = Some(err);
                false
            }
        }
    })?;

    match failure {
        Some(err) => Err(err),
        None => {
            debug!(forwarded, "backfill complete");
            Ok(())
        }
    }
}
