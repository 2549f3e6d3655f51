//! # quill-storage
//!
//! The B-tree substrate the QuillDB document layer is built on.
//!
//! This crate provides:
//!
//! - **Slices**: one B-tree per index ([`slice::BtreeSlice`]), with write
//!   descent that splits full nodes preemptively so structural changes never
//!   propagate upward from a leaf mutation.
//! - **Superblocks**: the single-holder capability to a slice's root
//!   ([`superblock::Superblock`]), handed between writers through one-shot
//!   channels so the next writer can start as soon as the previous descent
//!   completes.
//! - **Blobs**: out-of-leaf byte regions for oversized values
//!   ([`blob::BlobStore`]).
//! - **Transactions**: the context a batch of mutations shares
//!   ([`txn::Transaction`]).
//! - **Traversal**: depth-first callback walks, parallel leaf traversal,
//!   the generic range eraser, and key-distribution sampling
//!   ([`traversal`]).
//!
//! The document layer consumes these through their public contracts; the
//! on-disk pager and buffer cache behind a production deployment are out of
//! scope here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blob;
pub mod node;
pub mod slice;
pub mod superblock;
pub mod traversal;
pub mod txn;

pub use blob::BlobStore;
pub use node::{InternalNode, LeafEntry, LeafNode, Node, LEAF_MAGIC};
pub use slice::{BtreeSlice, KvLocation, SliceStats, SlotChange};
pub use superblock::{Superblock, SuperblockKeeper};
pub use traversal::{
    depth_first_traversal, erase_range_generic, key_distribution, parallel_leaf_traversal,
    KeyTester, ValueDeleter,
};
pub use txn::Transaction;
