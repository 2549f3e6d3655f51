//! Transform and terminal stages for ranged reads.
//!
//! A ranged read may carry an ordered transform chain (each stage consumes
//! the current list of intermediate documents and produces a new list) and
//! at most one terminal (a fold initialized before traversal and updated
//! per row). Without a terminal, rows stream into the response.

use std::collections::BTreeMap;

use quill_common::types::{json_handle, Json, JsonHandle};

use crate::func::{is_truthy, json_type_name, EvalError, IndexMapping};
use crate::rget::RangeReadResult;

/// One stage of a transform chain.
#[derive(Debug, Clone)]
pub enum Transform {
    /// Replace each document with the mapping's output.
    Map(IndexMapping),
    /// Keep documents for which the predicate mapping is truthy.
    Filter(IndexMapping),
    /// Replace each document with the elements of the mapping's array
    /// output.
    ConcatMap(IndexMapping),
}

/// Applies one transform stage to one intermediate document, appending its
/// outputs to `out`.
pub fn transform_apply(
    transform: &Transform,
    row: &JsonHandle,
    out: &mut Vec<JsonHandle>,
) -> Result<(), EvalError> {
    match transform {
        Transform::Map(mapping) => {
            out.push(mapping.eval(row)?);
            Ok(())
        }
        Transform::Filter(predicate) => {
            let predicate_value = predicate.eval(row)?;
            if is_truthy(&predicate_value) {
                out.push(row.clone());
            }
            Ok(())
        }
        Transform::ConcatMap(mapping) => {
            let value = mapping.eval(row)?;
            let Json::Array(items) = &*value else {
                return Err(EvalError::datum(format!(
                    "Cannot concat-map a non-array value (got {})",
                    json_type_name(&value)
                )));
            };
            out.extend(items.iter().cloned().map(json_handle));
            Ok(())
        }
    }
}

/// A numeric combiner for reduce-style terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceFunc {
    /// Numeric sum.
    Sum,
    /// Numeric minimum.
    Min,
    /// Numeric maximum.
    Max,
}

impl ReduceFunc {
    /// Combines an accumulator with one value.
    pub fn apply(&self, acc: &Json, value: &Json) -> Result<Json, EvalError> {
        let a = as_number(acc)?;
        let b = as_number(value)?;
        let combined = match self {
            ReduceFunc::Sum => a + b,
            ReduceFunc::Min => a.min(b),
            ReduceFunc::Max => a.max(b),
        };
        serde_json::Number::from_f64(combined)
            .map(Json::Number)
            .ok_or_else(|| EvalError::datum("reduction produced a non-finite number"))
    }
}

fn as_number(value: &Json) -> Result<f64, EvalError> {
    value.as_f64().ok_or_else(|| {
        EvalError::datum(format!(
            "Expected NUMBER but got {}",
            json_type_name(value)
        ))
    })
}

/// A terminal: the fold a ranged read accumulates into instead of
/// streaming.
#[derive(Debug, Clone)]
pub enum Terminal {
    /// Count matching rows.
    Count,
    /// Reduce rows with a combiner, optionally seeded with a base value.
    Reduce {
        /// Seed value; the first row when absent.
        base: Option<JsonHandle>,
        /// The combiner.
        func: ReduceFunc,
    },
    /// Group rows, map each, and reduce within each group.
    GroupedMapReduce {
        /// Produces the group key for a row.
        group: IndexMapping,
        /// Maps a row before reduction.
        map: IndexMapping,
        /// The per-group combiner.
        reduce: ReduceFunc,
    },
}

/// Initializes the response result for a terminal, before traversal.
pub fn terminal_initialize(terminal: &Terminal, result: &mut RangeReadResult) {
    *result = match terminal {
        Terminal::Count => RangeReadResult::Length(0),
        Terminal::Reduce { base, .. } => RangeReadResult::ReducePartial(base.clone()),
        Terminal::GroupedMapReduce { .. } => RangeReadResult::GroupedPartial(BTreeMap::new()),
    };
}

/// Folds one row into the terminal's accumulator.
pub fn terminal_apply(
    terminal: &Terminal,
    row: &JsonHandle,
    result: &mut RangeReadResult,
) -> Result<(), EvalError> {
    match (terminal, result) {
        (Terminal::Count, RangeReadResult::Length(count)) => {
            *count += 1;
            Ok(())
        }
        (Terminal::Reduce { func, .. }, RangeReadResult::ReducePartial(acc)) => {
            *acc = Some(match acc.take() {
                None => row.clone(),
                Some(prev) => json_handle(func.apply(&prev, row)?),
            });
            Ok(())
        }
        (
            Terminal::GroupedMapReduce { group, map, reduce },
            RangeReadResult::GroupedPartial(groups),
        ) => {
            let group_key = group.eval(row)?.to_string();
            let mapped = map.eval(row)?;
            let next = match groups.get(&group_key) {
                None => mapped,
                Some(prev) => json_handle(reduce.apply(prev, &mapped)?),
            };
            groups.insert(group_key, next);
            Ok(())
        }
        _ => panic!("terminal applied against a mismatched accumulator"),
    }
}
