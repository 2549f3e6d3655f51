//! Store keys and key ranges.
//!
//! A [`StoreKey`] is an opaque variable-length byte string with total
//! lexicographic ordering. The primary index keys rows by the user primary
//! key; secondary indexes key rows by a canonical `(index value, primary
//! key)` encoding that reuses the same type.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

/// Maximum key size in bytes.
pub const MAX_KEY_SIZE: usize = 16 * 1024;

/// An opaque byte-string key, totally ordered lexicographically.
///
/// # Example
///
/// ```rust
/// use quill_common::types::StoreKey;
///
/// let key = StoreKey::from_bytes(b"user:1234");
/// assert_eq!(key.len(), 9);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct StoreKey(Bytes);

impl StoreKey {
    /// Creates the empty key, the minimum of the key space.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Creates a key from a byte slice.
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(bytes))
    }

    /// Creates a key from owned bytes.
    #[inline]
    #[must_use]
    pub fn from_vec(vec: Vec<u8>) -> Self {
        Self(Bytes::from(vec))
    }

    /// Creates a key from a string.
    #[inline]
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        Self::from_bytes(s.as_bytes())
    }

    /// Returns the length of the key in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the key is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the key as a byte slice.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the smallest key strictly greater than this key.
    #[must_use]
    pub fn successor(&self) -> Self {
        let mut bytes = self.0.to_vec();
        bytes.push(0x00);
        Self::from_vec(bytes)
    }

    /// Returns the largest key strictly less than this key, or `None` when
    /// this is the empty (minimum) key.
    ///
    /// The range eraser uses this to convert a half-open user range into the
    /// exclusive/inclusive bound pair the generic B-tree eraser expects.
    #[must_use]
    pub fn decrement(&self) -> Option<Self> {
        if self.is_empty() {
            return None;
        }
        let mut bytes = self.0.to_vec();
        let last = *bytes.last().expect("non-empty key");
        if last == 0 {
            bytes.pop();
        } else {
            *bytes.last_mut().expect("non-empty key") = last - 1;
            while bytes.len() < MAX_KEY_SIZE {
                bytes.push(0xFF);
            }
        }
        Some(Self::from_vec(bytes))
    }
}

impl Deref for StoreKey {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for StoreKey {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Ord for StoreKey {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for StoreKey {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| !c.is_control() || c == ' ') => {
                write!(f, "StoreKey({s:?})")
            }
            _ => {
                write!(f, "StoreKey(0x")?;
                for byte in &self.0[..self.0.len().min(32)] {
                    write!(f, "{byte:02x}")?;
                }
                if self.0.len() > 32 {
                    write!(f, "...")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<&[u8]> for StoreKey {
    #[inline]
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for StoreKey {
    #[inline]
    fn from(vec: Vec<u8>) -> Self {
        Self::from_vec(vec)
    }
}

impl From<&str> for StoreKey {
    #[inline]
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

/// A half-open key range `[left, right)`.
///
/// The right bound may be unbounded, covering every key at or above `left`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct KeyRange {
    left: StoreKey,
    right: Option<StoreKey>,
}

impl KeyRange {
    /// Creates a bounded half-open range `[left, right)`.
    #[must_use]
    pub fn new(left: StoreKey, right: StoreKey) -> Self {
        Self {
            left,
            right: Some(right),
        }
    }

    /// Creates a range covering every key at or above `left`.
    #[must_use]
    pub fn from_left(left: StoreKey) -> Self {
        Self { left, right: None }
    }

    /// Creates a range covering the entire key space.
    #[must_use]
    pub fn all() -> Self {
        Self {
            left: StoreKey::empty(),
            right: None,
        }
    }

    /// The inclusive left bound.
    #[inline]
    #[must_use]
    pub fn left(&self) -> &StoreKey {
        &self.left
    }

    /// The exclusive right bound, or `None` when right-unbounded.
    #[inline]
    #[must_use]
    pub fn right(&self) -> Option<&StoreKey> {
        self.right.as_ref()
    }

    /// Returns true if the range contains no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match &self.right {
            Some(right) => self.left >= *right,
            None => false,
        }
    }

    /// Returns true if `key` lies inside the range.
    #[must_use]
    pub fn contains(&self, key: &StoreKey) -> bool {
        if *key < self.left {
            return false;
        }
        match &self.right {
            Some(right) => key < right,
            None => true,
        }
    }

    /// Returns true if `key` lies at or past the exclusive right bound.
    #[must_use]
    pub fn is_past_right(&self, key: &StoreKey) -> bool {
        match &self.right {
            Some(right) => key >= right,
            None => false,
        }
    }

    /// Returns true if `other` is entirely contained in this range.
    #[must_use]
    pub fn is_superset(&self, other: &KeyRange) -> bool {
        if other.left < self.left {
            return false;
        }
        match (&self.right, &other.right) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => theirs <= mine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = StoreKey::from_bytes(b"aaa");
        let b = StoreKey::from_bytes(b"bbb");
        let aa = StoreKey::from_bytes(b"aa");

        assert!(a < b);
        assert!(aa < a);
        assert!(StoreKey::empty() < aa);
    }

    #[test]
    fn test_key_successor() {
        let key = StoreKey::from_bytes(b"abc");
        let succ = key.successor();
        assert!(key < succ);
        assert_eq!(succ.as_bytes(), b"abc\x00");
    }

    #[test]
    fn test_key_decrement() {
        assert_eq!(StoreKey::empty().decrement(), None);

        let key = StoreKey::from_bytes(b"ab\x00");
        let prev = key.decrement().unwrap();
        assert_eq!(prev.as_bytes(), b"ab");
        assert!(prev < key);

        let key = StoreKey::from_bytes(b"ab");
        let prev = key.decrement().unwrap();
        assert!(prev < key);
        assert_eq!(prev.len(), MAX_KEY_SIZE);
        assert_eq!(&prev.as_bytes()[..2], b"aa");
    }

    #[test]
    fn test_decrement_is_greatest_below() {
        // No key fits strictly between decrement(k) and k.
        let key = StoreKey::from_bytes(b"b");
        let prev = key.decrement().unwrap();
        let between = StoreKey::from_bytes(b"a\xFF\xFF");
        assert!(between < prev || between >= key || between == prev);
    }

    #[test]
    fn test_range_contains() {
        let range = KeyRange::new(StoreKey::from_str("b"), StoreKey::from_str("e"));

        assert!(!range.contains(&StoreKey::from_str("a")));
        assert!(range.contains(&StoreKey::from_str("b")));
        assert!(range.contains(&StoreKey::from_str("d")));
        assert!(!range.contains(&StoreKey::from_str("e")));
        assert!(range.is_past_right(&StoreKey::from_str("e")));
    }

    #[test]
    fn test_range_unbounded() {
        let range = KeyRange::from_left(StoreKey::from_str("m"));
        assert!(range.contains(&StoreKey::from_str("zzzz")));
        assert!(!range.contains(&StoreKey::from_str("a")));
        assert!(!range.is_empty());
    }

    #[test]
    fn test_range_empty() {
        let range = KeyRange::new(StoreKey::from_str("x"), StoreKey::from_str("x"));
        assert!(range.is_empty());
        assert!(!range.contains(&StoreKey::from_str("x")));
    }

    #[test]
    fn test_range_superset() {
        let outer = KeyRange::new(StoreKey::from_str("a"), StoreKey::from_str("z"));
        let inner = KeyRange::new(StoreKey::from_str("c"), StoreKey::from_str("f"));
        assert!(outer.is_superset(&inner));
        assert!(!inner.is_superset(&outer));
        assert!(KeyRange::all().is_superset(&outer));
    }
}
