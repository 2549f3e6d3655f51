//! Secondary-index maintenance.
//!
//! Every write path produces a modification report; applying it here keeps
//! each live sindex consistent with the primary index. Mapping evaluation
//! failures are swallowed: a row whose mapping throws is simply absent from
//! that index. Secondary indexes are lossy filters, never authoritative.
//!
//! ## Canonical secondary keys
//!
//! A sindex stores a row under `escape(canonical(mapping_output)) 0x00
//! primary_key`. The canonical encoding orders datums null < bool < number
//! < string < array < object and is order-preserving within each type;
//! `0x00`/`0x01` bytes in the canonical stream are escaped so the first
//! unescaped `0x00` is always the primary-key separator.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tracing::warn;

use quill_common::config::{Durability, StoreConfig};
use quill_common::error::QuillResult;
use quill_common::interrupt::{Interruptor, InterruptorHandle};
use quill_common::types::{Json, JsonHandle, StoreKey, Timestamp};
use quill_storage::superblock::Superblock;
use quill_storage::traversal::parallel_leaf_traversal;
use quill_storage::txn::Transaction;

use crate::func::IndexMapping;
use crate::mutate::{kv_location_delete, kv_location_set};
use crate::report::{encode_sindex_change, ModificationInfo, ModificationReport, SindexChange};
use crate::store::{Sindex, Store};
use crate::value;

const TAG_NULL: u8 = 0x02;
const TAG_FALSE: u8 = 0x03;
const TAG_TRUE: u8 = 0x04;
const TAG_NUMBER: u8 = 0x05;
const TAG_STRING: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_OBJECT: u8 = 0x08;

fn ordered_f64_bits(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn canonical_encode_raw(value: &Json, out: &mut Vec<u8>) {
    match value {
        Json::Null => out.push(TAG_NULL),
        Json::Bool(false) => out.push(TAG_FALSE),
        Json::Bool(true) => out.push(TAG_TRUE),
        Json::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend(ordered_f64_bits(n.as_f64().unwrap_or(0.0)).to_be_bytes());
        }
        Json::String(s) => {
            out.push(TAG_STRING);
            out.extend(s.as_bytes());
            out.push(0x00);
        }
        Json::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                canonical_encode_raw(item, out);
            }
            out.push(0x00);
        }
        Json::Object(map) => {
            out.push(TAG_OBJECT);
            for (key, item) in map {
                out.extend(key.as_bytes());
                out.push(0x00);
                canonical_encode_raw(item, out);
            }
            out.push(0x00);
        }
    }
}

fn escape_into(raw: &[u8], out: &mut Vec<u8>) {
    for &byte in raw {
        match byte {
            0x00 => out.extend([0x01, 0x01]),
            0x01 => out.extend([0x01, 0x02]),
            other => out.push(other),
        }
    }
}

/// Builds the canonical sindex storage key for `(index_value, primary_key)`.
///
/// Preserves the ordering of `index_value` and breaks ties on the primary
/// key.
#[must_use]
pub fn secondary_key(index_value: &Json, primary_key: &StoreKey) -> StoreKey {
    let mut raw = Vec::new();
    canonical_encode_raw(index_value, &mut raw);

    let mut out = Vec::with_capacity(raw.len() + 1 + primary_key.len());
    escape_into(&raw, &mut out);
    out.push(0x00);
    out.extend(primary_key.as_bytes());
    StoreKey::from_vec(out)
}

/// Recovers the primary key from a canonical secondary key by scanning past
/// the separator.
///
/// # Panics
///
/// Panics when the key has no separator; such a key cannot have been
/// written by [`secondary_key`].
#[must_use]
pub fn primary_of_secondary(secondary: &StoreKey) -> StoreKey {
    let bytes = secondary.as_bytes();
    let separator = bytes
        .iter()
        .position(|&b| b == 0x00)
        .expect("secondary key missing its separator");
    StoreKey::from_bytes(&bytes[separator + 1..])
}

/// Write access to one sindex: the index plus its held superblock.
///
/// The superblock slot is a mutex so the access can be shared across the
/// tasks of a drain scope; each task takes the token, chains it through its
/// own locate, and puts it back.
#[derive(Debug)]
pub struct SindexWriteAccess {
    sindex: Arc<Sindex>,
    superblock: AsyncMutex<Option<Superblock>>,
}

impl SindexWriteAccess {
    /// Pairs a sindex with its acquired superblock.
    #[must_use]
    pub fn new(sindex: Arc<Sindex>, superblock: Superblock) -> Self {
        Self {
            sindex,
            superblock: AsyncMutex::new(Some(superblock)),
        }
    }

    /// The sindex this access is for.
    #[inline]
    #[must_use]
    pub fn sindex(&self) -> &Arc<Sindex> {
        &self.sindex
    }

    pub(crate) async fn take_superblock(&self) -> (tokio::sync::MutexGuard<'_, Option<Superblock>>, Superblock) {
        let mut slot = self.superblock.lock().await;
        let superblock = slot.take().expect("sindex superblock already taken");
        (slot, superblock)
    }
}

/// Applies one modification report to a single sindex.
///
/// The deleted side removes `canonical(mapping(deleted), pk)` if present;
/// the added side writes `canonical(mapping(added), pk)`. Each side chains
/// the sindex superblock through a one-shot so parallel sindex tasks never
/// block on each other's leaf work. Mapping failures are swallowed.
pub async fn update_single_sindex(
    access: Arc<SindexWriteAccess>,
    txn: Arc<Transaction>,
    report: Arc<ModificationReport>,
    config: StoreConfig,
) {
    // An empty primary key means a default-constructed report reached the
    // maintainer; reports must come from a write path.
    assert!(
        !report.primary_key.is_empty(),
        "modification report with an empty primary key"
    );

    let mapping = IndexMapping::from_descriptor(access.sindex.descriptor());
    let slice = access.sindex.slice().clone();
    let (mut slot, mut superblock) = access.take_superblock().await;

    if let Some(deleted) = &report.info.deleted {
        match mapping.eval(deleted) {
            Ok(index_value) => {
                let sindex_key = secondary_key(&index_value, &report.primary_key);
                let (return_tx, return_rx) = oneshot::channel();
                let location = slice
                    .locate_for_write(&superblock, &sindex_key)
                    .expect("sindex locate failed");
                superblock.handoff(Some(return_tx));
                if location.value.is_some() {
                    kv_location_delete(&txn, &slice, &location, Timestamp::DISTANT_PAST)
                        .expect("sindex delete failed");
                }
                superblock = return_rx.await.expect("sindex superblock chain broken");
            }
            Err(err) => {
                // The row was never in this index.
                warn!(sindex = access.sindex.name(), error = %err, "sindex mapping failed on deleted row");
            }
        }
    }

    if let Some(added) = &report.info.added {
        match mapping.eval(added) {
            Ok(index_value) => {
                let sindex_key = secondary_key(&index_value, &report.primary_key);
                let (return_tx, return_rx) = oneshot::channel();
                let location = slice
                    .locate_for_write(&superblock, &sindex_key)
                    .expect("sindex locate failed");
                superblock.handoff(Some(return_tx));
                kv_location_set(
                    &txn,
                    &slice,
                    &location,
                    added,
                    Timestamp::DISTANT_PAST,
                    &config,
                )
                .expect("sindex set failed");
                superblock = return_rx.await.expect("sindex superblock chain broken");
            }
            Err(err) => {
                // The new row is simply absent from this index.
                warn!(sindex = access.sindex.name(), error = %err, "sindex mapping failed on added row");
            }
        }
    }

    *slot = Some(superblock);
}

/// Applies one modification report to every given sindex, in parallel under
/// a drain scope.
pub async fn update_sindexes(
    accesses: &[Arc<SindexWriteAccess>],
    txn: &Arc<Transaction>,
    report: Arc<ModificationReport>,
    config: &StoreConfig,
) {
    let mut drainer = JoinSet::new();
    for access in accesses {
        drainer.spawn(update_single_sindex(
            access.clone(),
            txn.clone(),
            report.clone(),
            config.clone(),
        ));
    }
    while let Some(joined) = drainer.join_next().await {
        if let Err(join_err) = joined {
            if join_err.is_panic() {
                std::panic::resume_unwind(join_err.into_panic());
            }
        }
    }
}

struct CbState {
    _sindex_block: OwnedMutexGuard<()>,
    accesses: Vec<Arc<SindexWriteAccess>>,
}

/// Feeds modification reports to the sindex maintainer and the replay
/// queue.
///
/// The first report acquires the sindex block and every post-constructed
/// sindex superblock; both are held until the callback is dropped, so a
/// whole batch shares one acquisition.
pub struct ModificationReportCb {
    store: Arc<Store>,
    state: AsyncMutex<Option<CbState>>,
}

impl ModificationReportCb {
    /// Creates a callback over a store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            state: AsyncMutex::new(None),
        }
    }

    /// Reports a row addition.
    pub async fn add_row(&self, txn: &Arc<Transaction>, primary_key: StoreKey, added: JsonHandle) {
        let mut report = ModificationReport::new(primary_key);
        report.info.added = Some(added);
        self.on_mod_report(txn, report).await;
    }

    /// Reports a row deletion.
    pub async fn delete_row(
        &self,
        txn: &Arc<Transaction>,
        primary_key: StoreKey,
        deleted: JsonHandle,
    ) {
        let mut report = ModificationReport::new(primary_key);
        report.info.deleted = Some(deleted);
        self.on_mod_report(txn, report).await;
    }

    /// Reports a row replacement.
    pub async fn replace_row(
        &self,
        txn: &Arc<Transaction>,
        primary_key: StoreKey,
        added: JsonHandle,
        deleted: JsonHandle,
    ) {
        let mut report = ModificationReport::new(primary_key);
        report.info.added = Some(added);
        report.info.deleted = Some(deleted);
        self.on_mod_report(txn, report).await;
    }

    /// Enqueues the report on the replay queue and applies it to every
    /// post-constructed sindex.
    pub async fn on_mod_report(&self, txn: &Arc<Transaction>, report: ModificationReport) {
        let mut state = self.state.lock().await;
        if state.is_none() {
            // No interruption here: tearing between the primary write and
            // the sindex update would leave the indexes inconsistent.
            let sindex_block = self.store.acquire_sindex_block_for_write_owned().await;
            let accesses = self
                .store
                .acquire_post_constructed_sindex_superblocks_for_write()
                .await;
            *state = Some(CbState {
                _sindex_block: sindex_block,
                accesses,
            });
        }
        let cb_state = state.as_ref().expect("callback state initialized above");

        self.store
            .sindex_queue_push(encode_sindex_change(&SindexChange::Modification(
                report.clone(),
            )));
        update_sindexes(
            &cb_state.accesses,
            txn,
            Arc::new(report),
            self.store.config(),
        )
        .await;
    }
}

/// Builds the named secondary indexes over the already-populated primary
/// index.
///
/// Takes a read-side acquisition of the primary tree and traverses its
/// leaves in parallel. Each leaf opens a soft-durability write transaction:
/// a partially constructed index is fine because crash recovery wipes and
/// rebuilds any index missing its fully-constructed flag. If every
/// requested index has been dropped mid-build, the local interruptor pulses
/// and the remaining leaves stop.
pub async fn post_construct_secondary_indexes(
    store: &Arc<Store>,
    names: &BTreeSet<String>,
    interruptor: &Interruptor,
) -> QuillResult<()> {
    let (local_handle, local_interruptor) = InterruptorHandle::new();
    let combined = Interruptor::either(interruptor, &local_interruptor);

    let primary = store.primary().clone();
    let read_superblock = primary.superblock().acquire().await;

    let result = parallel_leaf_traversal(&primary, &read_superblock, |entries| {
        let store = store.clone();
        let names = names.clone();
        let combined = combined.clone();
        let local_handle = local_handle.clone();
        async move {
            if combined.is_pulsed() {
                return Ok(());
            }
            let txn = Arc::new(store.begin_transaction(Durability::Soft));
            let _sindex_block = store.acquire_sindex_block_for_write_owned().await;
            let accesses = store.acquire_sindex_superblocks_for_write(&names).await;
            if accesses.is_empty() {
                // Every requested sindex was dropped while we were building.
                local_handle.pulse_if_not_already_pulsed();
                return Ok(());
            }

            let config = store.config().clone();
            for entry in entries {
                if combined.is_pulsed() {
                    return Ok(());
                }
                let document = value::get_data(&txn, &entry.value);
                let report = Arc::new(ModificationReport {
                    primary_key: entry.key.clone(),
                    info: ModificationInfo {
                        added: Some(document),
                        deleted: None,
                    },
                });
                update_sindexes(&accesses, &txn, report, &config).await;
            }
            Ok(())
        }
    })
    .await;

    read_superblock.release();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secondary_key_orders_by_index_value() {
        let pk = StoreKey::from_str("p");
        let one = secondary_key(&json!(1), &pk);
        let two = secondary_key(&json!(2), &pk);
        let neg = secondary_key(&json!(-3), &pk);
        let text = secondary_key(&json!("a"), &pk);
        let null = secondary_key(&json!(null), &pk);

        assert!(neg < one);
        assert!(one < two);
        assert!(two < text);
        assert!(null < neg);
    }

    #[test]
    fn test_secondary_key_ties_break_on_primary() {
        let a = secondary_key(&json!(5), &StoreKey::from_str("a"));
        let b = secondary_key(&json!(5), &StoreKey::from_str("b"));
        assert!(a < b);
    }

    #[test]
    fn test_primary_recovery() {
        let pk = StoreKey::from_str("the-primary-key");
        for value in [
            json!(null),
            json!(true),
            json!(-17.25),
            json!("with\u{0}separator-looking\u{1}bytes"),
            json!([1, "two", [3]]),
            json!({"nested": {"v": 1}}),
        ] {
            let skey = secondary_key(&value, &pk);
            assert_eq!(primary_of_secondary(&skey), pk, "value {value}");
        }
    }

    #[test]
    fn test_string_order_preserved() {
        let pk = StoreKey::from_str("p");
        let a = secondary_key(&json!("apple"), &pk);
        let b = secondary_key(&json!("applesauce"), &pk);
        let c = secondary_key(&json!("banana"), &pk);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_array_prefix_order() {
        let pk = StoreKey::from_str("p");
        let short = secondary_key(&json!([1]), &pk);
        let long = secondary_key(&json!([1, 2]), &pk);
        assert!(short < long);
    }
}
