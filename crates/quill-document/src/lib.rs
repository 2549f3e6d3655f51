//! # quill-document
//!
//! The document storage layer of QuillDB: the subsystem above the B-tree
//! substrate and below the query dispatcher. It translates logical
//! operations into leaf-level slice mutations and keeps every secondary
//! index consistent with the primary index in the same transaction.
//!
//! ## Operations
//!
//! - **Point ops** ([`point`]): get, set, delete for a single key.
//! - **Replace** ([`replace`]): read-modify-write through a user mapping,
//!   classified into inserted / deleted / replaced / unchanged / skipped /
//!   errors with strict primary-key immutability.
//! - **Batched replace** ([`batched`]): pipelines per-key replaces across a
//!   shared superblock token with FIFO-ordered sindex effects.
//! - **Range read** ([`rget`]): depth-first streaming with transform and
//!   terminal pipelines and a chunk-size budget.
//! - **Range erase** ([`erase`]): fans out to every post-constructed
//!   secondary index and enqueues a durable replay record.
//! - **Secondary indexes** ([`sindex`]): per-write maintenance and
//!   post-construction of new indexes over a populated table.
//! - **Backfill** ([`backfill`]): streams pairs and tombstones to a
//!   replication callback.
//! - **Distribution** ([`distribution`]): bucketed key-count estimates.
//!
//! ## Data flow
//!
//! Every write path produces a [`report::ModificationReport`] that is fed
//! to the sindex maintainer before the primary superblock's batch releases.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backfill;
pub mod batched;
pub mod distribution;
pub mod erase;
pub mod fifo;
pub mod func;
pub mod mutate;
pub mod point;
pub mod replace;
pub mod report;
pub mod rget;
pub mod sindex;
pub mod store;
pub mod transform;
pub mod value;

pub use func::{EvalError, EvalErrorKind, IndexMapping, ReplaceFunc, SharedReplaceFunc};
pub use point::{
    point_delete, point_get, point_set, PointDeleteResponse, PointDeleteResult,
    PointReadResponse, PointWriteResponse, PointWriteResult,
};
pub use replace::{replace, replace_and_return_superblock, PointReplace, ReplaceOutcome, ReplaceResponse};
pub use report::{ModificationInfo, ModificationReport, SindexChange};
pub use rget::{rget_secondary_slice, rget_slice, RangeReadResponse, RangeReadResult};
pub use store::{Sindex, Store};
