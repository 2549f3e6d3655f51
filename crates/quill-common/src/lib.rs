//! # quill-common
//!
//! Shared foundation for the QuillDB document storage layer.
//!
//! This crate provides:
//!
//! - **Keys and ranges**: [`types::StoreKey`] byte-string keys with total
//!   lexicographic ordering, and [`types::KeyRange`] half-open key ranges.
//! - **Timestamps**: replication recency stamps with a `DISTANT_PAST`
//!   sentinel used by secondary-index writes.
//! - **JSON handles**: reference-counted immutable JSON documents shared
//!   between the write paths and index maintenance.
//! - **Errors**: the unified [`error::QuillError`] type with stable error
//!   codes.
//! - **Configuration**: validated [`config::StoreConfig`] for the store.
//! - **Interruption**: the [`interrupt::Interruptor`] pulse signal threaded
//!   through long-running operations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod interrupt;
pub mod types;

pub use config::{Durability, StoreConfig};
pub use error::{ErrorCode, QuillError, QuillResult};
pub use interrupt::{Interruptor, InterruptorHandle};
pub use types::{Json, JsonHandle, KeyRange, StoreKey, Timestamp};
