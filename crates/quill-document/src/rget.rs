//! Ranged reads.
//!
//! A ranged read walks a half-open key range depth first, pushes every row
//! through the transform chain, and either streams the results (bounded by
//! the chunk budget) or folds them into a terminal. Evaluation errors
//! mid-stream poison the result and stop the traversal; the partial state
//! is never reported as success.
//!
//! The secondary-index variant additionally filters out rows whose primary
//! key (recovered from the secondary key's suffix) lies outside the
//! caller's primary-key range. This compensates for physical-shard
//! oversharding, where one store holds several logical shards whose sindex
//! entries are merged.

use std::collections::BTreeMap;

use quill_common::config::StoreConfig;
use quill_common::error::QuillResult;
use quill_common::interrupt::Interruptor;
use quill_common::types::{estimate_json_size, JsonHandle, KeyRange, StoreKey};
use quill_storage::node::LeafEntry;
use quill_storage::slice::BtreeSlice;
use quill_storage::superblock::Superblock;
use quill_storage::traversal::depth_first_traversal;
use quill_storage::txn::Transaction;

use crate::func::EvalError;
use crate::sindex::primary_of_secondary;
use crate::transform::{terminal_apply, terminal_initialize, transform_apply, Terminal, Transform};
use crate::value;

/// The result of a ranged read.
///
/// `ReducePartial` and `GroupedPartial` are accumulator states produced
/// during traversal; [`RangeReadResult::finalize`] converts them into their
/// wire-ready forms and is the only pass with work for them.
#[derive(Debug, Clone)]
pub enum RangeReadResult {
    /// Streamed `(key, document)` pairs (no terminal).
    Stream(Vec<(StoreKey, JsonHandle)>),
    /// Finalized per-group values.
    Groups(BTreeMap<String, JsonHandle>),
    /// A single reduced value.
    Atom(JsonHandle),
    /// A row count.
    Length(u64),
    /// An insertion count.
    Inserted(u64),
    /// A reduction over zero rows.
    Empty,
    /// A flat list of documents.
    Vec(Vec<JsonHandle>),
    /// The evaluation error that poisoned the read.
    Error(EvalError),
    /// Accumulator of a reduce terminal, pre-finalization.
    ReducePartial(Option<JsonHandle>),
    /// Accumulator of a grouped terminal, pre-finalization.
    GroupedPartial(BTreeMap<String, JsonHandle>),
}

impl RangeReadResult {
    /// Converts accumulator states into their wire-ready forms. All other
    /// variants are already final.
    pub fn finalize(&mut self) {
        match self {
            RangeReadResult::ReducePartial(acc) => {
                *self = match acc.take() {
                    Some(value) => RangeReadResult::Atom(value),
                    None => RangeReadResult::Empty,
                };
            }
            RangeReadResult::GroupedPartial(groups) => {
                let groups = std::mem::take(groups);
                *self = RangeReadResult::Groups(groups);
            }
            _ => {}
        }
    }

    /// True if the read was poisoned by an evaluation error.
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, RangeReadResult::Error(_))
    }

    /// The streamed rows, if this is a stream result.
    #[must_use]
    pub fn as_stream(&self) -> Option<&[(StoreKey, JsonHandle)]> {
        match self {
            RangeReadResult::Stream(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Response of a ranged read.
#[derive(Debug, Clone)]
pub struct RangeReadResponse {
    /// The result (stream, terminal output, or poisoning error).
    pub result: RangeReadResult,
    /// The maximum key visited so far, including skipped rows. Retries
    /// resume from its successor.
    pub last_considered_key: StoreKey,
    /// True when traversal halted because the chunk budget was crossed.
    pub truncated: bool,
}

struct RgetCallback<'a> {
    txn: &'a Transaction,
    response: RangeReadResponse,
    cumulative_size: usize,
    transforms: &'a [Transform],
    terminal: Option<&'a Terminal>,
    primary_key_range: Option<&'a KeyRange>,
    max_chunk_size: usize,
    interruptor: &'a Interruptor,
}

impl<'a> RgetCallback<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        txn: &'a Transaction,
        range: &KeyRange,
        transforms: &'a [Transform],
        terminal: Option<&'a Terminal>,
        primary_key_range: Option<&'a KeyRange>,
        max_chunk_size: usize,
        interruptor: &'a Interruptor,
    ) -> Self {
        let mut result = RangeReadResult::Stream(Vec::new());
        if let Some(terminal) = terminal {
            terminal_initialize(terminal, &mut result);
        }
        Self {
            txn,
            response: RangeReadResponse {
                result,
                last_considered_key: range.left().clone(),
                truncated: false,
            },
            cumulative_size: 0,
            transforms,
            terminal,
            primary_key_range,
            max_chunk_size,
            interruptor,
        }
    }

    fn note_considered(&mut self, key: &StoreKey) {
        if self.response.last_considered_key < *key {
            self.response.last_considered_key = key.clone();
        }
    }

    fn handle_pair(&mut self, entry: &LeafEntry) -> bool {
        if self.response.result.is_error() {
            return false;
        }
        if self.interruptor.is_pulsed() {
            self.response.result = RangeReadResult::Error(EvalError::runtime(format!(
                "interrupted ({}:{})",
                file!(),
                line!()
            )));
            return false;
        }

        // Skipped rows still advance the high-water mark so retries make
        // progress past them.
        self.note_considered(&entry.key);

        if let Some(pk_range) = self.primary_key_range {
            let pk = primary_of_secondary(&entry.key);
            if !pk_range.contains(&pk) {
                return true;
            }
        }

        let document = value::get_data(self.txn, &entry.value);
        let mut data = vec![document];
        for transform in self.transforms {
            let mut next = Vec::new();
            for item in &data {
                if let Err(err) = transform_apply(transform, item, &mut next) {
                    self.response.result = RangeReadResult::Error(err);
                    return false;
                }
            }
            data = next;
        }

        match self.terminal {
            None => {
                let mut added = 0usize;
                let RangeReadResult::Stream(stream) = &mut self.response.result else {
                    panic!("stream result expected on the non-terminal path");
                };
                for item in data {
                    added += estimate_json_size(&item);
                    stream.push((entry.key.clone(), item));
                }
                self.cumulative_size += added;
                self.cumulative_size < self.max_chunk_size
            }
            Some(terminal) => {
                for item in &data {
                    if let Err(err) = terminal_apply(terminal, item, &mut self.response.result) {
                        self.response.result = RangeReadResult::Error(err);
                        return false;
                    }
                }
                true
            }
        }
    }

    fn finish(mut self) -> RangeReadResponse {
        self.response.truncated = self.cumulative_size >= self.max_chunk_size;
        self.response.result.finalize();
        self.response
    }
}

/// Ranged read over the primary index.
#[allow(clippy::too_many_arguments)]
pub fn rget_slice(
    slice: &BtreeSlice,
    txn: &Transaction,
    superblock: &Superblock,
    range: &KeyRange,
    transforms: &[Transform],
    terminal: Option<&Terminal>,
    config: &StoreConfig,
    interruptor: &Interruptor,
) -> QuillResult<RangeReadResponse> {
    let mut callback = RgetCallback::new(
        txn,
        range,
        transforms,
        terminal,
        None,
        config.rget_max_chunk_size,
        interruptor,
    );
    depth_first_traversal(slice, superblock, range, &mut |entry| {
        callback.handle_pair(entry)
    })?;
    Ok(callback.finish())
}

/// Ranged read over a secondary index, filtering out entries whose primary
/// key lies outside `primary_key_range`.
#[allow(clippy::too_many_arguments)]
pub fn rget_secondary_slice(
    slice: &BtreeSlice,
    txn: &Transaction,
    superblock: &Superblock,
    range: &KeyRange,
    transforms: &[Transform],
    terminal: Option<&Terminal>,
    primary_key_range: &KeyRange,
    config: &StoreConfig,
    interruptor: &Interruptor,
) -> QuillResult<RangeReadResponse> {
    let mut callback = RgetCallback::new(
        txn,
        range,
        transforms,
        terminal,
        Some(primary_key_range),
        config.rget_max_chunk_size,
        interruptor,
    );
    depth_first_traversal(slice, superblock, range, &mut |entry| {
        callback.handle_pair(entry)
    })?;
    Ok(callback.finish())
}
