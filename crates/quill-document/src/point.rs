//! Point operations: get, set, delete for a single key.

use tracing::trace;

use quill_common::config::StoreConfig;
use quill_common::error::QuillResult;
use quill_common::types::{JsonHandle, StoreKey, Timestamp};
use quill_storage::slice::BtreeSlice;
use quill_storage::superblock::Superblock;
use quill_storage::txn::Transaction;

use crate::mutate::{kv_location_delete, kv_location_set};
use crate::report::ModificationInfo;
use crate::value;

/// Response of a point read.
#[derive(Debug, Clone)]
pub struct PointReadResponse {
    /// The document, or `None` when the key is absent.
    pub data: Option<JsonHandle>,
}

/// Result code of a point write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointWriteResult {
    /// The key was empty and the document was stored.
    Stored,
    /// A document already existed under the key.
    Duplicate,
}

/// Response of a point write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointWriteResponse {
    /// The result code.
    pub result: PointWriteResult,
}

/// Result code of a point delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointDeleteResult {
    /// A document existed and was deleted.
    Deleted,
    /// No document existed under the key.
    Missing,
}

/// Response of a point delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointDeleteResponse {
    /// The result code.
    pub result: PointDeleteResult,
}

/// Reads the document stored under `key`.
pub fn point_get(
    slice: &BtreeSlice,
    txn: &Transaction,
    superblock: &Superblock,
    key: &StoreKey,
) -> QuillResult<PointReadResponse> {
    let location = slice.locate_for_read(superblock, key)?;
    let data = location
        .value
        .as_ref()
        .map(|bytes| value::get_data(txn, bytes));
    trace!(key = %key_display(key), found = data.is_some(), "point get");
    Ok(PointReadResponse { data })
}

/// Stores `data` under `key`.
///
/// Writes only when `overwrite` is set or the slot is empty, but the
/// modification report unconditionally records `added = data` (and the prior
/// document as `deleted` when present): the read-for-update is visible to
/// sindex maintenance even when no store happens. Callers relying on
/// `overwrite = false` must be aware of this.
#[allow(clippy::too_many_arguments)]
pub fn point_set(
    slice: &BtreeSlice,
    txn: &Transaction,
    superblock: &Superblock,
    key: &StoreKey,
    data: &JsonHandle,
    overwrite: bool,
    timestamp: Timestamp,
    mod_info: &mut ModificationInfo,
    config: &StoreConfig,
) -> QuillResult<PointWriteResponse> {
    let location = slice.locate_for_write(superblock, key)?;
    let had_value = location.value.is_some();

    if let Some(old_bytes) = &location.value {
        mod_info.deleted = Some(value::get_data(txn, old_bytes));
    }
    mod_info.added = Some(data.clone());

    if overwrite || !had_value {
        kv_location_set(txn, slice, &location, data, timestamp, config)?;
    }
    trace!(key = %key_display(key), overwrite, had_value, "point set");

    Ok(PointWriteResponse {
        result: if had_value {
            PointWriteResult::Duplicate
        } else {
            PointWriteResult::Stored
        },
    })
}

/// Deletes the document stored under `key`.
pub fn point_delete(
    slice: &BtreeSlice,
    txn: &Transaction,
    superblock: &Superblock,
    key: &StoreKey,
    timestamp: Timestamp,
    mod_info: &mut ModificationInfo,
) -> QuillResult<PointDeleteResponse> {
    let location = slice.locate_for_write(superblock, key)?;
    let exists = location.value.is_some();

    if let Some(old_bytes) = &location.value {
        mod_info.deleted = Some(value::get_data(txn, old_bytes));
    }

    if exists {
        kv_location_delete(txn, slice, &location, timestamp)?;
    }
    trace!(key = %key_display(key), existed = exists, "point delete");

    Ok(PointDeleteResponse {
        result: if exists {
            PointDeleteResult::Deleted
        } else {
            PointDeleteResult::Missing
        },
    })
}

fn key_display(key: &StoreKey) -> String {
    String::from_utf8_lossy(key.as_bytes()).into_owned()
}
