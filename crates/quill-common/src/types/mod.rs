//! Core types shared across the QuillDB storage layer.

mod ids;
mod json;
mod keys;
mod timestamps;

pub use ids::{BlobId, PageId};
pub use json::{estimate_json_size, json_handle, json_null, Json, JsonHandle};
pub use keys::{KeyRange, StoreKey, MAX_KEY_SIZE};
pub use timestamps::Timestamp;
