//! The leaf value codec.
//!
//! A document is serialized to JSON bytes and stored either inline in the
//! leaf (small documents) or in a blob region referenced from the leaf
//! (large documents). The encoded leaf bytes never exceed the configured
//! reference length, so any document fits a leaf slot.
//!
//! Layout of the encoded leaf value:
//!
//! ```text
//! inline:  [0x00][u32 LE serialized len][serialized JSON]
//! spilled: [0x01][u64 LE blob id][u64 LE serialized len]
//! ```
//!
//! Corrupt framing or an unreadable blob is a fatal condition: the process
//! aborts with a diagnostic rather than serving a damaged document.
//! [`deep_fsck`] performs the same walk non-fatally for integrity checks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use quill_common::config::StoreConfig;
use quill_common::error::{QuillError, QuillResult};
use quill_common::types::{json_handle, BlobId, JsonHandle};
use quill_storage::txn::Transaction;

const TAG_INLINE: u8 = 0x00;
const TAG_SPILLED: u8 = 0x01;

const INLINE_HEADER: usize = 1 + 4;
const SPILLED_LEN: usize = 1 + 8 + 8;

/// An encoded leaf value: inline JSON bytes or a blob reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocValue {
    bytes: Bytes,
}

impl DocValue {
    /// Wraps encoded leaf bytes.
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes }
    }

    /// The encoded leaf bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Consumes into the encoded leaf bytes.
    #[inline]
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Bytes this value consumes in the leaf.
    #[inline]
    #[must_use]
    pub fn inline_size(&self) -> usize {
        self.bytes.len()
    }

    /// Logical size of the serialized document in bytes.
    #[must_use]
    pub fn value_size(&self) -> u64 {
        match self.ref_kind() {
            RefKind::Inline { len } => u64::from(len),
            RefKind::Spilled { size, .. } => size,
        }
    }

    /// True if the value fits in `length_available` leaf bytes.
    #[inline]
    #[must_use]
    pub fn fits(&self, length_available: usize) -> bool {
        self.inline_size() <= length_available
    }

    /// The blob this value references, if spilled.
    #[must_use]
    pub fn blob_id(&self) -> Option<BlobId> {
        match self.ref_kind() {
            RefKind::Inline { .. } => None,
            RefKind::Spilled { id, .. } => Some(id),
        }
    }

    fn ref_kind(&self) -> RefKind {
        match self.try_ref_kind() {
            Ok(kind) => kind,
            Err(msg) => panic!("corrupt leaf value reference: {msg}"),
        }
    }

    fn try_ref_kind(&self) -> Result<RefKind, String> {
        let mut buf = &self.bytes[..];
        if buf.remaining() < 1 {
            return Err("empty value reference".to_string());
        }
        match buf.get_u8() {
            TAG_INLINE => {
                if buf.remaining() < 4 {
                    return Err("truncated inline header".to_string());
                }
                let len = buf.get_u32_le();
                if buf.remaining() != len as usize {
                    return Err(format!(
                        "inline length {len} does not match {} stored bytes",
                        buf.remaining()
                    ));
                }
                Ok(RefKind::Inline { len })
            }
            TAG_SPILLED => {
                if self.bytes.len() != SPILLED_LEN {
                    return Err(format!(
                        "spilled reference is {} bytes, expected {SPILLED_LEN}",
                        self.bytes.len()
                    ));
                }
                let id = BlobId::new(buf.get_u64_le());
                let size = buf.get_u64_le();
                Ok(RefKind::Spilled { id, size })
            }
            other => Err(format!("unknown value reference tag {other:#04x}")),
        }
    }
}

enum RefKind {
    Inline { len: u32 },
    Spilled { id: BlobId, size: u64 },
}

/// Encodes a document into a leaf value, spilling to the blob store when it
/// exceeds the inline threshold.
pub fn encode(txn: &Transaction, json: &JsonHandle, config: &StoreConfig) -> QuillResult<DocValue> {
    let serialized = serde_json::to_vec(&**json)
        .map_err(|err| QuillError::internal(format!("document serialization failed: {err}")))?;

    let inline_total = INLINE_HEADER + serialized.len();
    if serialized.len() <= config.inline_value_threshold && inline_total <= config.max_ref_len {
        let mut buf = BytesMut::with_capacity(inline_total);
        buf.put_u8(TAG_INLINE);
        buf.put_u32_le(serialized.len() as u32);
        buf.put_slice(&serialized);
        return Ok(DocValue::from_bytes(buf.freeze()));
    }

    let size = serialized.len() as u64;
    let id = txn.blobs().allocate(Bytes::from(serialized));
    let mut buf = BytesMut::with_capacity(SPILLED_LEN);
    buf.put_u8(TAG_SPILLED);
    buf.put_u64_le(id.get());
    buf.put_u64_le(size);
    Ok(DocValue::from_bytes(buf.freeze()))
}

/// Decodes a leaf value back into a document.
///
/// # Panics
///
/// Panics on corrupt framing, a missing blob region, or undecodable JSON.
#[must_use]
pub fn decode(txn: &Transaction, value: &DocValue) -> JsonHandle {
    let serialized = match value.ref_kind() {
        RefKind::Inline { .. } => value.bytes.slice(INLINE_HEADER..),
        RefKind::Spilled { id, size } => {
            let data = txn
                .blobs()
                .read(id)
                .unwrap_or_else(|err| panic!("corrupt leaf value: {err}"));
            assert_eq!(
                data.len() as u64,
                size,
                "blob {id} length does not match the leaf reference"
            );
            data
        }
    };
    let parsed: serde_json::Value = serde_json::from_slice(&serialized)
        .unwrap_or_else(|err| panic!("corrupt document payload: {err}"));
    json_handle(parsed)
}

/// Decodes raw leaf bytes into a document. See [`decode`].
#[must_use]
pub fn get_data(txn: &Transaction, leaf_bytes: &Bytes) -> JsonHandle {
    decode(txn, &DocValue::from_bytes(leaf_bytes.clone()))
}

/// Frees whatever the value references. Must be called before the leaf slot
/// holding the value is discarded, or a spilled region leaks.
pub fn free(txn: &Transaction, value: &DocValue) -> QuillResult<()> {
    if let Some(id) = value.blob_id() {
        txn.blobs().clear(id)?;
    }
    Ok(())
}

/// Integrity check: verifies the reference framing, the blob walk, and that
/// the stored length matches what a decode would consume.
pub fn deep_fsck(txn: &Transaction, value: &DocValue) -> Result<(), String> {
    let kind = value.try_ref_kind()?;
    let serialized = match kind {
        RefKind::Inline { .. } => value.bytes.slice(INLINE_HEADER..),
        RefKind::Spilled { id, size } => {
            let data = txn
                .blobs()
                .read(id)
                .map_err(|err| format!("blob walk failed: {err}"))?;
            if data.len() as u64 != size {
                return Err(format!(
                    "blob {id} holds {} bytes but the leaf reference says {size}",
                    data.len()
                ));
            }
            data
        }
    };
    serde_json::from_slice::<serde_json::Value>(&serialized)
        .map(|_| ())
        .map_err(|err| format!("payload does not deserialize: {err}"))
}
