//! User-supplied functions and their evaluation errors.
//!
//! Two kinds of functions enter this layer from the query dispatcher:
//!
//! - [`IndexMapping`]: a pure, serializable datum-to-datum mapping. This is
//!   what a secondary-index descriptor deserializes to, and what the range
//!   reader's transforms and terminals are built from.
//! - [`ReplaceFunc`]: the read-modify-write mapping of a replace operation,
//!   passed as a trait object because replaces are not persisted.
//!
//! Both fail with an [`EvalError`]; evaluation failures are classified
//! values surfaced in responses, never process errors.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use bytes::Bytes;
use quill_common::types::{json_handle, Json, JsonHandle};

/// The three evaluation error kinds surfaced by the range reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    /// Failure in the evaluation machinery itself.
    Runtime,
    /// A generic user error (bad shape, missing attribute, forbidden
    /// primary-key change).
    Generic,
    /// A datum-level type error.
    Datum,
}

/// An error thrown by evaluating a user-supplied function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EvalError {
    /// The error's kind.
    pub kind: EvalErrorKind,
    /// Human-readable message, surfaced verbatim in responses.
    pub message: String,
}

impl EvalError {
    /// A runtime-kind error.
    #[must_use]
    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::Runtime,
            message: message.into(),
        }
    }

    /// A generic-kind error.
    #[must_use]
    pub fn generic(message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::Generic,
            message: message.into(),
        }
    }

    /// A datum-kind error.
    #[must_use]
    pub fn datum(message: impl Into<String>) -> Self {
        Self {
            kind: EvalErrorKind::Datum,
            message: message.into(),
        }
    }
}

/// Returns the datum type name used in error messages.
#[must_use]
pub fn json_type_name(value: &Json) -> &'static str {
    match value {
        Json::Null => "NULL",
        Json::Bool(_) => "BOOLEAN",
        Json::Number(_) => "NUMBER",
        Json::String(_) => "STRING",
        Json::Array(_) => "ARRAY",
        Json::Object(_) => "OBJECT",
    }
}

/// Returns true if a datum counts as truthy for filter predicates.
#[must_use]
pub fn is_truthy(value: &Json) -> bool {
    !matches!(value, Json::Null | Json::Bool(false))
}

/// A pure, serializable datum-to-datum mapping.
///
/// Secondary-index descriptors are the serialized form of this type; the
/// opaque descriptor bytes deserialize back to it when the index is
/// maintained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexMapping {
    /// Extract a top-level attribute.
    Field(String),
    /// Extract a nested attribute path.
    Path(Vec<String>),
    /// The document itself.
    Identity,
}

impl IndexMapping {
    /// Evaluates the mapping against a document.
    pub fn eval(&self, doc: &JsonHandle) -> Result<JsonHandle, EvalError> {
        match self {
            IndexMapping::Identity => Ok(doc.clone()),
            IndexMapping::Field(name) => extract(doc, std::slice::from_ref(name)),
            IndexMapping::Path(path) => extract(doc, path),
        }
    }

    /// Serializes the mapping into opaque descriptor bytes.
    #[must_use]
    pub fn to_descriptor(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("mapping serialization cannot fail"))
    }

    /// Deserializes a mapping from descriptor bytes.
    ///
    /// # Panics
    ///
    /// A descriptor that does not deserialize means the index metadata is
    /// damaged beyond repair; this aborts rather than maintaining a wrong
    /// index.
    #[must_use]
    pub fn from_descriptor(descriptor: &[u8]) -> Self {
        serde_json::from_slice(descriptor).expect("corrupted secondary index descriptor")
    }
}

fn extract(doc: &JsonHandle, path: &[String]) -> Result<JsonHandle, EvalError> {
    let mut current: &Json = doc;
    for name in path {
        let Json::Object(map) = current else {
            return Err(EvalError::datum(format!(
                "Cannot get attribute `{name}` of a non-object (got {})",
                json_type_name(current)
            )));
        };
        current = map.get(name).ok_or_else(|| {
            EvalError::generic(format!("No attribute `{name}` in object"))
        })?;
    }
    Ok(json_handle(current.clone()))
}

/// The read-modify-write mapping of a replace operation.
///
/// Receives the current row (JSON null when the row is absent) and returns
/// the replacement row (JSON null to delete or skip).
pub trait ReplaceFunc: Send + Sync {
    /// Applies the mapping.
    fn call(&self, old: &JsonHandle) -> Result<JsonHandle, EvalError>;
}

impl<F> ReplaceFunc for F
where
    F: Fn(&JsonHandle) -> Result<JsonHandle, EvalError> + Send + Sync,
{
    fn call(&self, old: &JsonHandle) -> Result<JsonHandle, EvalError> {
        self(old)
    }
}

/// A shared replace mapping, cloneable across pipelined tasks.
pub type SharedReplaceFunc = Arc<dyn ReplaceFunc>;
