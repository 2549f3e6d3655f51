//! Range erase.
//!
//! Erasing `[left, right)` from the primary index fans out to every
//! post-constructed secondary index (partially constructed ones rebuild
//! from scratch anyway), enqueues a durable replay record, and converts the
//! user's half-open range into the `(left_exclusive, right_inclusive]` pair
//! the generic tree eraser expects. The sindex jobs run under a drain
//! scope: the primary edits and all sindex edits complete before the caller
//! regains control.

use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinSet;
use tracing::debug;

use quill_common::error::{QuillError, QuillResult};
use quill_common::interrupt::Interruptor;
use quill_common::types::{KeyRange, StoreKey};
use quill_storage::superblock::Superblock;
use quill_storage::traversal::{erase_range_generic, KeyTester, ValueDeleter};
use quill_storage::txn::Transaction;

use crate::report::{encode_sindex_change, SindexChange};
use crate::sindex::{primary_of_secondary, SindexWriteAccess};
use crate::store::Store;
use crate::value::{self, DocValue};

/// Erases every key the caller's tester accepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllKeys;

impl KeyTester for AllKeys {
    fn key_should_be_erased(&self, _key: &StoreKey) -> bool {
        true
    }
}

/// Tester for sindex erase jobs: recovers the primary key from the
/// secondary key's suffix and erases the row when the primary key lies in
/// the erased range. Compensates for oversharding, where one physical
/// store's sindex holds entries for several logical shards.
#[derive(Debug, Clone)]
pub struct SindexKeyRangeTester {
    primary_key_range: KeyRange,
}

impl SindexKeyRangeTester {
    /// Creates a tester over the erased primary-key range.
    #[must_use]
    pub fn new(primary_key_range: KeyRange) -> Self {
        Self { primary_key_range }
    }
}

impl KeyTester for SindexKeyRangeTester {
    fn key_should_be_erased(&self, key: &StoreKey) -> bool {
        self.primary_key_range.contains(&primary_of_secondary(key))
    }
}

/// Frees the blob region a leaf value references before its entry goes
/// away.
struct BlobValueDeleter<'a> {
    txn: &'a Transaction,
}

impl ValueDeleter for BlobValueDeleter<'_> {
    fn delete_value(&self, value: &Bytes) -> QuillResult<()> {
        value::free(self.txn, &DocValue::from_bytes(value.clone()))
    }
}

/// One sindex's share of a range erase. Interruption here is swallowed:
/// partial progress is acceptable and the enclosing transaction decides
/// whether to commit.
async fn sindex_erase_range(
    range: KeyRange,
    txn: Arc<Transaction>,
    access: Arc<SindexWriteAccess>,
    interruptor: Interruptor,
) {
    let tester = SindexKeyRangeTester::new(range);
    let deleter = BlobValueDeleter { txn: &txn };
    let slice = access.sindex().slice().clone();
    let (_slot, superblock) = access.take_superblock().await;

    match erase_range_generic(&slice, &superblock, &tester, &deleter, None, None, &interruptor) {
        Ok(()) => {}
        Err(QuillError::Interrupted) => {
            debug!(sindex = access.sindex().name(), "sindex erase interrupted; partial progress kept");
        }
        Err(err) => panic!("sindex erase failed: {err}"),
    }
    // Release the sindex superblock now that this job's edits are done.
    superblock.release();
}

/// Erases `[left, right)` from the primary index and every live secondary
/// index, and enqueues the replay record.
///
/// The range must be non-empty. The primary superblock is released once the
/// primary tree edits are done; the function returns only after every
/// sindex job has drained.
pub async fn erase_range(
    store: &Arc<Store>,
    txn: &Arc<Transaction>,
    tester: &dyn KeyTester,
    range: &KeyRange,
    superblock: Superblock,
    interruptor: &Interruptor,
) -> QuillResult<()> {
    // The bound twiddling below would erase a key even for an empty range.
    assert!(!range.is_empty(), "erase_range over an empty range");

    let accesses = {
        let _sindex_block = store.acquire_sindex_block_for_write().await;
        let accesses = store
            .acquire_post_constructed_sindex_superblocks_for_write()
            .await;
        store.sindex_queue_push(encode_sindex_change(&SindexChange::EraseRange(
            range.clone(),
        )));
        accesses
        // The sindex block is released here; the superblocks stay held by
        // the jobs below.
    };

    let mut drainer = JoinSet::new();
    for access in accesses {
        drainer.spawn(sindex_erase_range(
            range.clone(),
            txn.clone(),
            access,
            interruptor.clone(),
        ));
    }

    // Convert [left, right) to the (left_exclusive, right_inclusive] pair
    // the generic eraser expects. A left bound of the minimum key has no
    // predecessor; a right-unbounded range has no inclusive bound.
    let left_exclusive = range.left().decrement();
    let right_inclusive = match range.right() {
        Some(right) => Some(
            right
                .decrement()
                .expect("non-empty range cannot end at the minimum key"),
        ),
        None => None,
    };

    let deleter = BlobValueDeleter { txn };
    match erase_range_generic(
        store.primary(),
        &superblock,
        tester,
        &deleter,
        left_exclusive.as_ref(),
        right_inclusive.as_ref(),
        interruptor,
    ) {
        Ok(()) => {}
        Err(QuillError::Interrupted) => {
            debug!("primary erase interrupted; partial progress kept");
        }
        Err(err) => return Err(err),
    }
    store
        .primary()
        .record_range_tombstone(range.clone(), txn.timestamp());
    superblock.release();

    // Drain: all sindex edits complete before the caller regains control.
    while let Some(joined) = drainer.join_next().await {
        if let Err(join_err) = joined {
            if join_err.is_panic() {
                std::panic::resume_unwind(join_err.into_panic());
            }
        }
    }
    Ok(())
}
