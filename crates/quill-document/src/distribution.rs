//! Distribution sampling: bucketed key-count estimates for shard planning.

use std::collections::BTreeMap;

use quill_common::error::QuillResult;
use quill_common::types::StoreKey;
use quill_storage::slice::BtreeSlice;
use quill_storage::superblock::Superblock;
use quill_storage::traversal::key_distribution;

/// Response of a distribution read: representative key to estimated key
/// count per bucket.
#[derive(Debug, Clone)]
pub struct DistributionResponse {
    /// Estimated keys per bucket, keyed by the bucket's representative key.
    pub key_counts: BTreeMap<StoreKey, u64>,
}

/// Samples the slice's key distribution down to `max_depth` routing levels.
///
/// Each split key (and `left_key`, representing the leftmost bucket) is
/// attributed `max(1, total / splits)` keys; when the tree is a single leaf
/// the entire count lands on `left_key`.
pub fn distribution_get(
    slice: &BtreeSlice,
    superblock: &Superblock,
    max_depth: usize,
    left_key: StoreKey,
) -> QuillResult<DistributionResponse> {
    let (key_count, splits) = key_distribution(slice, superblock, max_depth)?;

    let keys_per_bucket = if splits.is_empty() {
        key_count
    } else {
        (key_count / splits.len() as u64).max(1)
    };

    let mut key_counts = BTreeMap::new();
    key_counts.insert(left_key, keys_per_bucket);
    for split in splits {
        key_counts.insert(split, keys_per_bucket);
    }
    Ok(DistributionResponse { key_counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use quill_common::types::Timestamp;
    use quill_storage::slice::SlotChange;

    async fn populated(n: usize) -> std::sync::Arc<BtreeSlice> {
        let slice = BtreeSlice::new("t", 8);
        let sb = slice.superblock().acquire().await;
        for i in 0..n {
            let key = StoreKey::from_str(&format!("key{i:04}"));
            let loc = slice.locate_for_write(&sb, &key).unwrap();
            slice
                .apply_change(&loc, SlotChange::Set(Bytes::from_static(b"{}")), Timestamp::now())
                .unwrap();
        }
        slice
    }

    #[tokio::test]
    async fn test_single_leaf_attributes_all_to_left_key() {
        let slice = populated(3).await;
        let sb = slice.superblock().acquire().await;

        let response =
            distribution_get(&slice, &sb, 4, StoreKey::from_str("key0000")).unwrap();
        assert_eq!(response.key_counts.len(), 1);
        assert_eq!(response.key_counts[&StoreKey::from_str("key0000")], 3);
    }

    #[tokio::test]
    async fn test_buckets_cover_splits() {
        let slice = populated(400).await;
        let sb = slice.superblock().acquire().await;

        let response = distribution_get(&slice, &sb, 2, StoreKey::empty()).unwrap();
        assert!(response.key_counts.len() > 1);

        let per_bucket: Vec<u64> = response.key_counts.values().copied().collect();
        assert!(per_bucket.iter().all(|count| *count >= 1));
        // Every bucket gets the same estimate.
        assert!(per_bucket.windows(2).all(|w| w[0] == w[1]));
    }
}
