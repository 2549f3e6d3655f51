//! Reference-counted immutable JSON documents.
//!
//! Write paths hand documents around by [`JsonHandle`]; reads produce them
//! by handle. The handle is cheap to clone and never mutated after creation,
//! which lets a single decoded document feed the response, the modification
//! report, and every secondary index without copying.

use std::sync::Arc;

/// A JSON document.
pub type Json = serde_json::Value;

/// A reference-counted immutable JSON document.
pub type JsonHandle = Arc<Json>;

/// Wraps a JSON value into a shared handle.
#[inline]
#[must_use]
pub fn json_handle(value: Json) -> JsonHandle {
    Arc::new(value)
}

/// A shared JSON null.
#[inline]
#[must_use]
pub fn json_null() -> JsonHandle {
    Arc::new(Json::Null)
}

/// Estimates the in-memory footprint of a JSON document in bytes.
///
/// This is a heuristic used by the range reader's chunk budget, not an exact
/// accounting. It only needs to be monotone in document size.
#[must_use]
pub fn estimate_json_size(value: &Json) -> usize {
    match value {
        Json::Null | Json::Bool(_) => 8,
        Json::Number(_) => 16,
        Json::String(s) => 16 + s.len(),
        Json::Array(items) => 16 + items.iter().map(estimate_json_size).sum::<usize>(),
        Json::Object(map) => {
            32 + map
                .iter()
                .map(|(k, v)| 16 + k.len() + estimate_json_size(v))
                .sum::<usize>()
        }
    }
}
