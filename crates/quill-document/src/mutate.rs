//! Leaf-slot mutation.
//!
//! These helpers assume the caller already located the slot through a write
//! descent; they only touch the leaf and the blob lifecycle. Both commit
//! synchronously inside the transaction and bump the slice's stats and root
//! eviction priority through [`quill_storage::slice::BtreeSlice::apply_change`].

use quill_common::config::StoreConfig;
use quill_common::error::QuillResult;
use quill_common::types::{JsonHandle, Timestamp};
use quill_storage::slice::{BtreeSlice, KvLocation, SlotChange};
use quill_storage::txn::Transaction;

use crate::value::{self, DocValue};

/// Encodes `json` and stores it at the located slot, freeing the prior
/// value's blob first when the slot was occupied.
pub fn kv_location_set(
    txn: &Transaction,
    slice: &BtreeSlice,
    location: &KvLocation,
    json: &JsonHandle,
    timestamp: Timestamp,
    config: &StoreConfig,
) -> QuillResult<()> {
    if let Some(old_bytes) = &location.value {
        value::free(txn, &DocValue::from_bytes(old_bytes.clone()))?;
    }
    let encoded = value::encode(txn, json, config)?;
    slice.apply_change(location, SlotChange::Set(encoded.into_bytes()), timestamp)
}

/// Clears the located slot, freeing its blob.
///
/// # Panics
///
/// Panics if the slot is empty; deleting an absent row is a caller bug.
pub fn kv_location_delete(
    txn: &Transaction,
    slice: &BtreeSlice,
    location: &KvLocation,
    timestamp: Timestamp,
) -> QuillResult<()> {
    let current = location
        .value
        .as_ref()
        .expect("kv_location_delete on an empty slot");
    value::free(txn, &DocValue::from_bytes(current.clone()))?;
    slice.apply_change(location, SlotChange::Clear, timestamp)
}
