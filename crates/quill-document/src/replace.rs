//! The replace engine: read-modify-write over a user mapping.
//!
//! A replace reads the current row (JSON null when absent), invokes the
//! mapping, and classifies the transition into exactly one of skipped,
//! inserted, deleted, replaced, unchanged, or errors. The primary-key
//! attribute of an existing row can never change.
//!
//! The engine never returns an error: user evaluation failures and
//! interruption both become an `errors` response. Interruption is not
//! rethrown because the caller is presumed to be cancelled on the same
//! signal; the diagnostic locator in the message exists for the day that
//! presumption breaks.

use tokio::sync::oneshot;
use tracing::trace;

use quill_common::config::StoreConfig;
use quill_common::interrupt::Interruptor;
use quill_common::types::{json_null, Json, JsonHandle, StoreKey, Timestamp};
use quill_storage::slice::BtreeSlice;
use quill_storage::superblock::Superblock;
use quill_storage::txn::Transaction;

use crate::func::{json_type_name, EvalError, ReplaceFunc, SharedReplaceFunc};
use crate::mutate::{kv_location_delete, kv_location_set};
use crate::report::ModificationInfo;
use crate::value;

/// The classification of one replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// Row absent before and after.
    Skipped,
    /// Row created.
    Inserted,
    /// Row removed.
    Deleted,
    /// Row rewritten with the same primary key.
    Replaced,
    /// Mapping returned the row unchanged.
    Unchanged,
    /// Evaluation failed; see `first_error`.
    Errors,
}

/// Response of a replace: exactly one outcome, plus the first error message
/// when the outcome is `Errors`.
#[derive(Debug, Clone)]
pub struct ReplaceResponse {
    outcome: Option<ReplaceOutcome>,
    first_error: Option<String>,
}

impl ReplaceResponse {
    fn new() -> Self {
        Self {
            outcome: None,
            first_error: None,
        }
    }

    /// Tags the response with its outcome.
    ///
    /// # Panics
    ///
    /// Panics if the response was already tagged; classifying twice is a
    /// bug in the engine.
    fn tally(&mut self, outcome: ReplaceOutcome) {
        assert!(
            self.outcome.is_none(),
            "replace response tagged twice: {:?} then {:?}",
            self.outcome,
            outcome
        );
        self.outcome = Some(outcome);
    }

    fn tally_error(&mut self, message: String) {
        self.tally(ReplaceOutcome::Errors);
        self.first_error = Some(message);
    }

    /// Response for a batched iteration aborted before it was spawned.
    pub(crate) fn interrupted_before_spawn() -> Self {
        let mut response = Self::new();
        response.tally_error(format!("interrupted ({}:{})", file!(), line!()));
        response
    }

    /// The classification.
    ///
    /// # Panics
    ///
    /// Panics if the engine never classified the response.
    #[must_use]
    pub fn outcome(&self) -> ReplaceOutcome {
        self.outcome.expect("replace response never classified")
    }

    /// The first error message, when the outcome is `Errors`.
    #[must_use]
    pub fn first_error(&self) -> Option<&str> {
        self.first_error.as_deref()
    }
}

/// One replace of a batched request.
#[derive(Clone)]
pub struct PointReplace {
    /// The key to replace at.
    pub key: StoreKey,
    /// The table's primary-key attribute name.
    pub primary_key: String,
    /// The user mapping.
    pub func: SharedReplaceFunc,
}

impl std::fmt::Debug for PointReplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointReplace")
            .field("key", &self.key)
            .field("primary_key", &self.primary_key)
            .finish_non_exhaustive()
    }
}

/// Runs a replace, handing the superblock onward as soon as the root walk
/// completes.
///
/// `next_superblock`, when present, receives the superblock so the next
/// pipelined write can start its descent; otherwise the superblock is
/// released. Either way the superblock is never stranded, including on the
/// error paths.
#[allow(clippy::too_many_arguments)]
pub fn replace_and_return_superblock(
    slice: &BtreeSlice,
    txn: &Transaction,
    superblock: Superblock,
    primary_key: &str,
    key: &StoreKey,
    func: &dyn ReplaceFunc,
    timestamp: Timestamp,
    next_superblock: Option<oneshot::Sender<Superblock>>,
    mod_info: &mut ModificationInfo,
    config: &StoreConfig,
    interruptor: &Interruptor,
) -> ReplaceResponse {
    let mut response = ReplaceResponse::new();

    let location = match slice.locate_for_write(&superblock, key) {
        Ok(location) => {
            superblock.handoff(next_superblock);
            location
        }
        Err(err) => {
            superblock.handoff(next_superblock);
            response.tally_error(err.to_string());
            return response;
        }
    };

    if interruptor.is_pulsed() {
        response.tally_error(format!("interrupted ({}:{})", file!(), line!()));
        return response;
    }

    let (started_empty, old_val) = match &location.value {
        None => (true, json_null()),
        Some(bytes) => {
            let document = value::get_data(txn, bytes);
            assert!(
                document.get(primary_key).is_some(),
                "primary leaf document is missing the primary-key attribute `{primary_key}`"
            );
            (false, document)
        }
    };

    let new_val = match func.call(&old_val) {
        Ok(new_val) => new_val,
        Err(err) => {
            response.tally_error(err.to_string());
            return response;
        }
    };

    let ended_empty = match &*new_val {
        Json::Null => true,
        Json::Object(object) => {
            if !object.contains_key(primary_key) {
                response.tally_error(
                    EvalError::generic(format!(
                        "Inserted object must have primary key `{primary_key}`:\n{new_val}"
                    ))
                    .to_string(),
                );
                return response;
            }
            false
        }
        other => {
            response.tally_error(
                EvalError::datum(format!(
                    "Inserted value must be an OBJECT (got {}):\n{new_val}",
                    json_type_name(other)
                ))
                .to_string(),
            );
            return response;
        }
    };

    if started_empty {
        if ended_empty {
            response.tally(ReplaceOutcome::Skipped);
        } else {
            response.tally(ReplaceOutcome::Inserted);
            kv_location_set(txn, slice, &location, &new_val, timestamp, config)
                .expect("primary insert failed");
            mod_info.added = Some(new_val);
        }
    } else if ended_empty {
        response.tally(ReplaceOutcome::Deleted);
        kv_location_delete(txn, slice, &location, timestamp).expect("primary delete failed");
        mod_info.deleted = Some(old_val);
    } else {
        let old_pk = old_val
            .get(primary_key)
            .expect("existing row checked for the primary key above");
        let new_pk = new_val
            .get(primary_key)
            .expect("new object checked for the primary key above");
        if old_pk == new_pk {
            if *old_val == *new_val {
                response.tally(ReplaceOutcome::Unchanged);
            } else {
                response.tally(ReplaceOutcome::Replaced);
                kv_location_set(txn, slice, &location, &new_val, timestamp, config)
                    .expect("primary replace failed");
                mod_info.added = Some(new_val);
                mod_info.deleted = Some(old_val);
            }
        } else {
            response.tally_error(
                EvalError::generic(format!(
                    "Primary key `{primary_key}` cannot be changed ({old_pk} -> {new_pk})"
                ))
                .to_string(),
            );
        }
    }

    trace!(outcome = ?response.outcome, "replace classified");
    response
}

/// Runs a standalone replace; the superblock is released after the root
/// walk.
#[allow(clippy::too_many_arguments)]
pub fn replace(
    slice: &BtreeSlice,
    txn: &Transaction,
    superblock: Superblock,
    primary_key: &str,
    key: &StoreKey,
    func: &dyn ReplaceFunc,
    timestamp: Timestamp,
    mod_info: &mut ModificationInfo,
    config: &StoreConfig,
    interruptor: &Interruptor,
) -> ReplaceResponse {
    replace_and_return_superblock(
        slice,
        txn,
        superblock,
        primary_key,
        key,
        func,
        timestamp,
        None,
        mod_info,
        config,
        interruptor,
    )
}
