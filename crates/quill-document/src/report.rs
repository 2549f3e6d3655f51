//! Modification reports and the sindex replay-queue codec.
//!
//! Every write path produces a [`ModificationReport`] summarizing one
//! row-level change; the sindex maintainer consumes it exactly once. The
//! same reports (and erase-range reports) are wire-encoded onto the sindex
//! replay queue so index updates can be replayed after a crash.
//!
//! On-queue layout:
//!
//! ```text
//! record:   [u8 discriminant: 0=modification, 1=erase_range][body]
//! modification body:
//!           [u32 LE pk len][pk bytes][mod info]
//! mod info: [u8 tag deleted][u32 LE len + JSON]? [u8 tag added][u32 LE len + JSON]?
//!           tag: 0=present, 1=absent
//! erase body:
//!           [u32 LE left len][left bytes][u8 right tag: 0=bounded, 1=unbounded]
//!           [u32 LE right len][right bytes]?
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use quill_common::error::{QuillError, QuillResult};
use quill_common::types::{json_handle, JsonHandle, KeyRange, StoreKey};

const HAS_VALUE: u8 = 0;
const HAS_NO_VALUE: u8 = 1;

const CHANGE_MODIFICATION: u8 = 0;
const CHANGE_ERASE_RANGE: u8 = 1;

const RIGHT_BOUNDED: u8 = 0;
const RIGHT_UNBOUNDED: u8 = 1;

/// The added/deleted document pair of one row-level change.
#[derive(Debug, Clone, Default)]
pub struct ModificationInfo {
    /// The document now stored under the key, if the change added one.
    pub added: Option<JsonHandle>,
    /// The document previously stored under the key, if the change removed
    /// one.
    pub deleted: Option<JsonHandle>,
}

impl ModificationInfo {
    /// True if the change neither added nor removed a document.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_none() && self.deleted.is_none()
    }
}

/// One row-level change: the primary key plus its modification info.
#[derive(Debug, Clone)]
pub struct ModificationReport {
    /// The primary key the change happened under.
    pub primary_key: StoreKey,
    /// What changed.
    pub info: ModificationInfo,
}

impl ModificationReport {
    /// Creates a report with empty info.
    #[must_use]
    pub fn new(primary_key: StoreKey) -> Self {
        Self {
            primary_key,
            info: ModificationInfo::default(),
        }
    }
}

/// A record on the sindex replay queue.
#[derive(Debug, Clone)]
pub enum SindexChange {
    /// A single-row modification.
    Modification(ModificationReport),
    /// A range erase.
    EraseRange(KeyRange),
}

fn put_optional_json(buf: &mut BytesMut, value: &Option<JsonHandle>) {
    match value {
        None => buf.put_u8(HAS_NO_VALUE),
        Some(json) => {
            buf.put_u8(HAS_VALUE);
            let serialized =
                serde_json::to_vec(&**json).expect("document serialization cannot fail");
            buf.put_u32_le(serialized.len() as u32);
            buf.put_slice(&serialized);
        }
    }
}

fn get_optional_json(buf: &mut &[u8]) -> QuillResult<Option<JsonHandle>> {
    if buf.remaining() < 1 {
        return Err(QuillError::corruption("truncated mod-info tag"));
    }
    match buf.get_u8() {
        HAS_NO_VALUE => Ok(None),
        HAS_VALUE => {
            if buf.remaining() < 4 {
                return Err(QuillError::corruption("truncated mod-info length"));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(QuillError::corruption("truncated mod-info payload"));
            }
            let payload = &buf[..len];
            let parsed: serde_json::Value = serde_json::from_slice(payload)
                .map_err(|err| QuillError::corruption(format!("bad mod-info JSON: {err}")))?;
            buf.advance(len);
            Ok(Some(json_handle(parsed)))
        }
        other => Err(QuillError::corruption(format!(
            "bad mod-info tag {other:#04x}"
        ))),
    }
}

/// Serializes a modification info: deleted slot first, then added slot.
pub fn encode_modification_info(buf: &mut BytesMut, info: &ModificationInfo) {
    put_optional_json(buf, &info.deleted);
    put_optional_json(buf, &info.added);
}

/// Deserializes a modification info.
pub fn decode_modification_info(buf: &mut &[u8]) -> QuillResult<ModificationInfo> {
    let deleted = get_optional_json(buf)?;
    let added = get_optional_json(buf)?;
    Ok(ModificationInfo { added, deleted })
}

/// Wire-encodes a replay-queue record.
#[must_use]
pub fn encode_sindex_change(change: &SindexChange) -> Bytes {
    let mut buf = BytesMut::new();
    match change {
        SindexChange::Modification(report) => {
            buf.put_u8(CHANGE_MODIFICATION);
            buf.put_u32_le(report.primary_key.len() as u32);
            buf.put_slice(report.primary_key.as_bytes());
            encode_modification_info(&mut buf, &report.info);
        }
        SindexChange::EraseRange(range) => {
            buf.put_u8(CHANGE_ERASE_RANGE);
            buf.put_u32_le(range.left().len() as u32);
            buf.put_slice(range.left().as_bytes());
            match range.right() {
                Some(right) => {
                    buf.put_u8(RIGHT_BOUNDED);
                    buf.put_u32_le(right.len() as u32);
                    buf.put_slice(right.as_bytes());
                }
                None => buf.put_u8(RIGHT_UNBOUNDED),
            }
        }
    }
    buf.freeze()
}

fn get_len_prefixed<'a>(buf: &mut &'a [u8], what: &str) -> QuillResult<&'a [u8]> {
    if buf.remaining() < 4 {
        return Err(QuillError::corruption(format!("truncated {what} length")));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(QuillError::corruption(format!("truncated {what} bytes")));
    }
    let out = &buf[..len];
    buf.advance(len);
    Ok(out)
}

/// Decodes a replay-queue record.
pub fn decode_sindex_change(bytes: &[u8]) -> QuillResult<SindexChange> {
    let mut buf = bytes;
    if buf.remaining() < 1 {
        return Err(QuillError::corruption("empty replay record"));
    }
    match buf.get_u8() {
        CHANGE_MODIFICATION => {
            let pk = get_len_prefixed(&mut buf, "primary key")?;
            let primary_key = StoreKey::from_bytes(pk);
            let info = decode_modification_info(&mut buf)?;
            Ok(SindexChange::Modification(ModificationReport {
                primary_key,
                info,
            }))
        }
        CHANGE_ERASE_RANGE => {
            let left = StoreKey::from_bytes(get_len_prefixed(&mut buf, "range left")?);
            if buf.remaining() < 1 {
                return Err(QuillError::corruption("truncated range bound tag"));
            }
            match buf.get_u8() {
                RIGHT_BOUNDED => {
                    let right = StoreKey::from_bytes(get_len_prefixed(&mut buf, "range right")?);
                    Ok(SindexChange::EraseRange(KeyRange::new(left, right)))
                }
                RIGHT_UNBOUNDED => Ok(SindexChange::EraseRange(KeyRange::from_left(left))),
                other => Err(QuillError::corruption(format!(
                    "bad range bound tag {other:#04x}"
                ))),
            }
        }
        other => Err(QuillError::corruption(format!(
            "bad replay record discriminant {other:#04x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mod_info_framing_bytes() {
        let mut buf = BytesMut::new();
        encode_modification_info(&mut buf, &ModificationInfo::default());
        // Absent, absent.
        assert_eq!(&buf[..], &[HAS_NO_VALUE, HAS_NO_VALUE]);
    }

    #[test]
    fn test_mod_info_roundtrip() {
        let info = ModificationInfo {
            added: Some(json_handle(json!({"id": "k", "v": 2}))),
            deleted: Some(json_handle(json!({"id": "k", "v": 1}))),
        };
        let mut buf = BytesMut::new();
        encode_modification_info(&mut buf, &info);

        let frozen = buf.freeze();
        let mut slice = &frozen[..];
        let decoded = decode_modification_info(&mut slice).unwrap();
        assert_eq!(**decoded.added.as_ref().unwrap(), json!({"id": "k", "v": 2}));
        assert_eq!(
            **decoded.deleted.as_ref().unwrap(),
            json!({"id": "k", "v": 1})
        );
        assert!(slice.is_empty());
    }

    #[test]
    fn test_modification_record_roundtrip() {
        let report = ModificationReport {
            primary_key: StoreKey::from_str("k1"),
            info: ModificationInfo {
                added: Some(json_handle(json!({"id": "k1"}))),
                deleted: None,
            },
        };
        let encoded = encode_sindex_change(&SindexChange::Modification(report));
        assert_eq!(encoded[0], CHANGE_MODIFICATION);

        match decode_sindex_change(&encoded).unwrap() {
            SindexChange::Modification(decoded) => {
                assert_eq!(decoded.primary_key, StoreKey::from_str("k1"));
                assert!(decoded.info.added.is_some());
                assert!(decoded.info.deleted.is_none());
            }
            other => panic!("wrong discriminant: {other:?}"),
        }
    }

    #[test]
    fn test_erase_record_roundtrip() {
        let range = KeyRange::new(StoreKey::from_str("a"), StoreKey::from_str("m"));
        let encoded = encode_sindex_change(&SindexChange::EraseRange(range.clone()));
        assert_eq!(encoded[0], CHANGE_ERASE_RANGE);

        match decode_sindex_change(&encoded).unwrap() {
            SindexChange::EraseRange(decoded) => assert_eq!(decoded, range),
            other => panic!("wrong discriminant: {other:?}"),
        }
    }

    #[test]
    fn test_erase_record_unbounded() {
        let range = KeyRange::from_left(StoreKey::from_str("x"));
        let encoded = encode_sindex_change(&SindexChange::EraseRange(range.clone()));
        match decode_sindex_change(&encoded).unwrap() {
            SindexChange::EraseRange(decoded) => assert_eq!(decoded, range),
            other => panic!("wrong discriminant: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_record_rejected() {
        let report = ModificationReport::new(StoreKey::from_str("k"));
        let encoded = encode_sindex_change(&SindexChange::Modification(report));
        assert!(decode_sindex_change(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode_sindex_change(&[]).is_err());
        assert!(decode_sindex_change(&[9]).is_err());
    }
}
