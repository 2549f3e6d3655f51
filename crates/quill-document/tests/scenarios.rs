//! End-to-end scenarios over a full store: replaces, batched pipelines,
//! secondary-index consistency, range reads with budgets, range erase, and
//! post-construction.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use quill_common::config::{Durability, StoreConfig};
use quill_common::interrupt::Interruptor;
use quill_common::types::{json_handle, json_null, Json, JsonHandle, KeyRange, StoreKey, Timestamp};
use quill_document::batched::batched_replace;
use quill_document::erase::{erase_range, AllKeys};
use quill_document::func::{EvalError, IndexMapping, SharedReplaceFunc};
use quill_document::point::{point_get, point_set};
use quill_document::replace::{PointReplace, ReplaceOutcome};
use quill_document::report::{ModificationInfo, SindexChange};
use quill_document::rget::{rget_secondary_slice, rget_slice, RangeReadResult};
use quill_document::sindex::{post_construct_secondary_indexes, primary_of_secondary, ModificationReportCb};
use quill_document::store::Store;
use quill_storage::traversal::depth_first_traversal;
use quill_storage::txn::Transaction;

fn returning(doc: Json) -> SharedReplaceFunc {
    Arc::new(move |_old: &JsonHandle| -> Result<JsonHandle, EvalError> {
        Ok(json_handle(doc.clone()))
    })
}

fn deleting() -> SharedReplaceFunc {
    Arc::new(|_old: &JsonHandle| -> Result<JsonHandle, EvalError> { Ok(json_null()) })
}

fn point(key: &str, func: SharedReplaceFunc) -> PointReplace {
    PointReplace {
        key: StoreKey::from_str(key),
        primary_key: "id".to_string(),
        func,
    }
}

async fn run_batch(
    store: &Arc<Store>,
    txn: &Arc<Transaction>,
    replaces: Vec<(i64, PointReplace)>,
) -> Vec<(i64, quill_document::replace::ReplaceResponse)> {
    let cb = Arc::new(ModificationReportCb::new(store.clone()));
    let superblock = store.acquire_superblock_for_write().await;
    batched_replace(
        store,
        txn,
        Timestamp::now(),
        &replaces,
        superblock,
        &cb,
        &Interruptor::never(),
    )
    .await
}

async fn read(store: &Store, txn: &Transaction, key: &str) -> Option<Json> {
    let sb = store.acquire_superblock_for_read().await;
    let response = point_get(store.primary(), txn, &sb, &StoreKey::from_str(key)).unwrap();
    response.data.map(|doc| (*doc).clone())
}

/// Collects a sindex's contents as `(primary key, indexed document)` pairs.
async fn sindex_contents(store: &Store, txn: &Transaction, name: &str) -> Vec<(StoreKey, Json)> {
    let sindex = store.sindex(name).unwrap();
    let sb = sindex.slice().superblock().acquire().await;
    let mut rows = Vec::new();
    depth_first_traversal(sindex.slice(), &sb, &KeyRange::all(), &mut |entry| {
        let doc = quill_document::value::get_data(txn, &entry.value);
        rows.push((primary_of_secondary(&entry.key), (*doc).clone()));
        true
    })
    .unwrap();
    rows
}

#[tokio::test]
async fn scenario_insert_into_empty_table() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));

    let responses = run_batch(
        &store,
        &txn,
        vec![(1, point("k1", returning(json!({"id": "k1", "v": 1}))))],
    )
    .await;

    assert_eq!(responses[0].1.outcome(), ReplaceOutcome::Inserted);
    assert_eq!(read(&store, &txn, "k1").await.unwrap(), json!({"id": "k1", "v": 1}));
}

#[tokio::test]
async fn scenario_primary_key_change_rejected() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));

    run_batch(
        &store,
        &txn,
        vec![(1, point("k1", returning(json!({"id": "k1", "v": 1}))))],
    )
    .await;

    let responses = run_batch(
        &store,
        &txn,
        vec![(2, point("k1", returning(json!({"id": "k2", "v": 2}))))],
    )
    .await;

    assert_eq!(responses[0].1.outcome(), ReplaceOutcome::Errors);
    assert_eq!(
        responses[0].1.first_error().unwrap(),
        "Primary key `id` cannot be changed (\"k1\" -> \"k2\")"
    );
    // Row unchanged.
    assert_eq!(read(&store, &txn, "k1").await.unwrap(), json!({"id": "k1", "v": 1}));
}

#[tokio::test]
async fn scenario_unchanged_emits_no_sindex_writes() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));
    store
        .sindex_create("s", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    store.mark_sindex_post_constructed("s").unwrap();

    run_batch(
        &store,
        &txn,
        vec![(1, point("k1", returning(json!({"id": "k1", "v": 1}))))],
    )
    .await;
    let before = sindex_contents(&store, &txn, "s").await;
    let writes_before = store.sindex("s").unwrap().slice().stats().keys_set();
    store.drain_sindex_queue().unwrap();

    let identity: SharedReplaceFunc =
        Arc::new(|old: &JsonHandle| -> Result<JsonHandle, EvalError> { Ok(old.clone()) });
    let responses = run_batch(&store, &txn, vec![(5, point("k1", identity))]).await;

    assert_eq!(responses[0].1.outcome(), ReplaceOutcome::Unchanged);
    // No sindex rows written or changed by the unchanged replace.
    assert_eq!(sindex_contents(&store, &txn, "s").await, before);
    assert_eq!(
        store.sindex("s").unwrap().slice().stats().keys_set(),
        writes_before
    );
    // The report still reaches the replay queue, with both slots absent.
    let records = store.drain_sindex_queue().unwrap();
    assert_eq!(records.len(), 1);
    match &records[0] {
        SindexChange::Modification(report) => {
            assert!(report.info.added.is_none());
            assert!(report.info.deleted.is_none());
        }
        other => panic!("unexpected record {other:?}"),
    }
}

#[tokio::test]
async fn scenario_delete_via_null_feeds_sindex_maintainer() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));
    store
        .sindex_create("s", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    store.mark_sindex_post_constructed("s").unwrap();

    run_batch(
        &store,
        &txn,
        vec![(1, point("k1", returning(json!({"id": "k1", "v": 1}))))],
    )
    .await;
    store.drain_sindex_queue().unwrap();
    assert_eq!(sindex_contents(&store, &txn, "s").await.len(), 1);

    let responses = run_batch(&store, &txn, vec![(2, point("k1", deleting()))]).await;
    assert_eq!(responses[0].1.outcome(), ReplaceOutcome::Deleted);
    assert!(read(&store, &txn, "k1").await.is_none());
    assert!(sindex_contents(&store, &txn, "s").await.is_empty());

    let records = store.drain_sindex_queue().unwrap();
    assert_eq!(records.len(), 1);
    match &records[0] {
        SindexChange::Modification(report) => {
            assert_eq!(**report.info.deleted.as_ref().unwrap(), json!({"id": "k1", "v": 1}));
            assert!(report.info.added.is_none());
        }
        other => panic!("unexpected record {other:?}"),
    }
}

#[tokio::test]
async fn scenario_sindex_consistency_under_batched_replace() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));
    store
        .sindex_create("s", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    store.mark_sindex_post_constructed("s").unwrap();

    run_batch(
        &store,
        &txn,
        vec![
            (1, point("k1", returning(json!({"id": "k1", "v": 1})))),
            (2, point("k2", returning(json!({"id": "k2", "v": 2})))),
        ],
    )
    .await;
    store.drain_sindex_queue().unwrap();

    let responses = run_batch(
        &store,
        &txn,
        vec![
            (7, point("k1", returning(json!({"id": "k1", "v": 3})))),
            (11, point("k2", deleting())),
        ],
    )
    .await;

    assert_eq!(responses[0].0, 7);
    assert_eq!(responses[0].1.outcome(), ReplaceOutcome::Replaced);
    assert_eq!(responses[1].0, 11);
    assert_eq!(responses[1].1.outcome(), ReplaceOutcome::Deleted);

    // The sindex holds exactly (3, "k1").
    let contents = sindex_contents(&store, &txn, "s").await;
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].0, StoreKey::from_str("k1"));
    assert_eq!(contents[0].1, json!({"id": "k1", "v": 3}));

    // The queue holds the two records in FIFO order: 7's key then 11's.
    let records = store.drain_sindex_queue().unwrap();
    assert_eq!(records.len(), 2);
    let keys: Vec<StoreKey> = records
        .iter()
        .map(|record| match record {
            SindexChange::Modification(report) => report.primary_key.clone(),
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    assert_eq!(keys, vec![StoreKey::from_str("k1"), StoreKey::from_str("k2")]);
}

#[tokio::test]
async fn scenario_chunked_range_read_reaches_full_coverage() {
    let config = StoreConfig {
        rget_max_chunk_size: 16 * 1024,
        ..StoreConfig::default()
    };
    let store = Store::new("t", config).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));

    let total = 1_000usize;
    let sb = store.acquire_superblock_for_write().await;
    for i in 0..total {
        let key = StoreKey::from_str(&format!("key{i:05}"));
        let doc = json_handle(json!({
            "id": format!("key{i:05}"),
            "payload": "x".repeat(100),
        }));
        let mut info = ModificationInfo::default();
        point_set(
            store.primary(),
            &txn,
            &sb,
            &key,
            &doc,
            true,
            Timestamp::now(),
            &mut info,
            store.config(),
        )
        .unwrap();
    }
    sb.release();

    let mut covered = Vec::new();
    let mut cursor = StoreKey::empty();
    let mut rounds = 0;
    loop {
        rounds += 1;
        assert!(rounds < 100, "retries failed to converge");

        let sb = store.acquire_superblock_for_read().await;
        let response = rget_slice(
            store.primary(),
            &txn,
            &sb,
            &KeyRange::from_left(cursor.clone()),
            &[],
            None,
            store.config(),
            &Interruptor::never(),
        )
        .unwrap();
        sb.release();

        let rows = response.result.as_stream().unwrap();
        covered.extend(rows.iter().map(|(key, _)| key.clone()));

        if !response.truncated {
            break;
        }
        assert!(!rows.is_empty(), "a truncated chunk must make progress");
        cursor = response.last_considered_key.successor();
    }

    assert!(rounds > 1, "budget never truncated; test is vacuous");
    assert_eq!(covered.len(), total);
    assert!(covered.windows(2).all(|w| w[0] < w[1]), "coverage must be ordered and disjoint");
}

#[tokio::test]
async fn sindex_equivalence_after_mixed_operations() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));
    // Mapping that throws on rows without "v": those rows must simply be
    // absent from the index.
    store
        .sindex_create("s", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    store.mark_sindex_post_constructed("s").unwrap();

    run_batch(
        &store,
        &txn,
        vec![
            (0, point("a", returning(json!({"id": "a", "v": 10})))),
            (1, point("b", returning(json!({"id": "b"})))), // no "v"
            (2, point("c", returning(json!({"id": "c", "v": 30})))),
        ],
    )
    .await;
    run_batch(
        &store,
        &txn,
        vec![
            (3, point("a", returning(json!({"id": "a", "v": 11})))),
            (4, point("c", deleting())),
        ],
    )
    .await;

    // Expected index: exactly the rows whose mapping succeeds.
    let contents = sindex_contents(&store, &txn, "s").await;
    assert_eq!(contents.len(), 1);
    assert_eq!(contents[0].0, StoreKey::from_str("a"));
    assert_eq!(contents[0].1, json!({"id": "a", "v": 11}));
}

#[tokio::test]
async fn erase_range_clears_primary_and_sindexes() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));
    store
        .sindex_create("s", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    store.mark_sindex_post_constructed("s").unwrap();

    let replaces: Vec<(i64, PointReplace)> = (0..20)
        .map(|i| {
            let key = format!("key{i:02}");
            (
                i,
                point(&key, returning(json!({"id": key.clone(), "v": i}))),
            )
        })
        .collect();
    run_batch(&store, &txn, replaces).await;

    let range = KeyRange::new(StoreKey::from_str("key05"), StoreKey::from_str("key15"));
    let sb = store.acquire_superblock_for_write().await;
    erase_range(&store, &txn, &AllKeys, &range, sb, &Interruptor::never())
        .await
        .unwrap();

    // Primary: nothing within [key05, key15) remains; outside untouched.
    for i in 0..20 {
        let key = format!("key{i:02}");
        let present = read(&store, &txn, &key).await.is_some();
        assert_eq!(present, !(5..15).contains(&i), "{key}");
    }

    // Sindex: exactly the surviving primary keys.
    let contents = sindex_contents(&store, &txn, "s").await;
    let mut indexed: Vec<StoreKey> = contents.iter().map(|(pk, _)| pk.clone()).collect();
    indexed.sort();
    let expected: Vec<StoreKey> = (0..20)
        .filter(|i| !(5..15).contains(i))
        .map(|i| StoreKey::from_str(&format!("key{i:02}")))
        .collect();
    assert_eq!(indexed, expected);
}

#[tokio::test]
async fn post_construction_builds_index_over_existing_rows() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));

    let replaces: Vec<(i64, PointReplace)> = (0..200)
        .map(|i| {
            let key = format!("key{i:03}");
            (
                i,
                point(&key, returning(json!({"id": key.clone(), "v": i % 7}))),
            )
        })
        .collect();
    run_batch(&store, &txn, replaces).await;

    store
        .sindex_create("by_v", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    let names: BTreeSet<String> = [String::from("by_v")].into();
    post_construct_secondary_indexes(&store, &names, &Interruptor::never())
        .await
        .unwrap();
    store.mark_sindex_post_constructed("by_v").unwrap();

    let contents = sindex_contents(&store, &txn, "by_v").await;
    assert_eq!(contents.len(), 200);

    // Reads through the secondary index see the same documents, ordered by
    // index value.
    let sindex = store.sindex("by_v").unwrap();
    let sb = sindex.slice().superblock().acquire().await;
    let response = rget_secondary_slice(
        sindex.slice(),
        &txn,
        &sb,
        &KeyRange::all(),
        &[],
        None,
        &KeyRange::all(),
        store.config(),
        &Interruptor::never(),
    )
    .unwrap();
    let rows = response.result.as_stream().unwrap();
    assert_eq!(rows.len(), 200);
    let values: Vec<i64> = rows
        .iter()
        .map(|(_, doc)| doc.get("v").unwrap().as_i64().unwrap())
        .collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "secondary scan must follow index order");
}

#[tokio::test]
async fn secondary_read_filters_foreign_primary_keys() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));
    store
        .sindex_create("s", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    store.mark_sindex_post_constructed("s").unwrap();

    run_batch(
        &store,
        &txn,
        vec![
            (0, point("a1", returning(json!({"id": "a1", "v": 1})))),
            (1, point("b1", returning(json!({"id": "b1", "v": 2})))),
            (2, point("b2", returning(json!({"id": "b2", "v": 3})))),
        ],
    )
    .await;

    // Restrict to primary keys starting with "b": the merged sindex rows
    // for the other logical shard are skipped but still advance the
    // high-water mark.
    let sindex = store.sindex("s").unwrap();
    let sb = sindex.slice().superblock().acquire().await;
    let response = rget_secondary_slice(
        sindex.slice(),
        &txn,
        &sb,
        &KeyRange::all(),
        &[],
        None,
        &KeyRange::new(StoreKey::from_str("b"), StoreKey::from_str("c")),
        store.config(),
        &Interruptor::never(),
    )
    .unwrap();

    let rows = response.result.as_stream().unwrap();
    let ids: Vec<&str> = rows
        .iter()
        .map(|(_, doc)| doc.get("id").unwrap().as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["b1", "b2"]);
}

#[tokio::test]
async fn sindex_equivalence_under_random_operations() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));
    store
        .sindex_create("s", IndexMapping::Field("v".to_string()).to_descriptor())
        .unwrap();
    store.mark_sindex_post_constructed("s").unwrap();

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut model: BTreeMap<String, Json> = BTreeMap::new();

    for round in 0..40 {
        // Distinct keys per batch; a batch never writes one key twice.
        let keys: BTreeSet<String> = (0..rng.gen_range(1..6))
            .map(|_| format!("key{:02}", rng.gen_range(0..25)))
            .collect();

        let mut batch = Vec::new();
        for key in keys {
            let op = rng.gen_range(0..4);
            if op == 0 {
                model.remove(&key);
                batch.push((round, point(&key, deleting())));
            } else {
                // Some documents lack "v": the mapping throws and the row
                // must be absent from the index.
                let doc = if op == 1 {
                    json!({"id": key.clone()})
                } else {
                    json!({"id": key.clone(), "v": rng.gen_range(0..10)})
                };
                model.insert(key.clone(), doc.clone());
                batch.push((round, point(&key, returning(doc))));
            }
        }
        run_batch(&store, &txn, batch).await;
    }

    // The index must hold exactly the model rows whose mapping succeeds.
    let mut expected: Vec<(StoreKey, Json)> = model
        .iter()
        .filter(|(_, doc)| doc.get("v").is_some())
        .map(|(key, doc)| (StoreKey::from_str(key), doc.clone()))
        .collect();
    expected.sort_by(|a, b| a.0.cmp(&b.0));

    let mut contents = sindex_contents(&store, &txn, "s").await;
    contents.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(contents.len(), expected.len());
    for ((got_pk, got_doc), (want_pk, want_doc)) in contents.iter().zip(expected.iter()) {
        assert_eq!(got_pk, want_pk);
        assert_eq!(got_doc, want_doc);
    }

    // And the primary agrees with the model.
    for (key, doc) in &model {
        assert_eq!(read(&store, &txn, key).await.as_ref(), Some(doc));
    }
}

#[tokio::test]
async fn terminal_count_over_store() {
    let store = Store::new("t", StoreConfig::default()).unwrap();
    let txn = Arc::new(store.begin_transaction(Durability::Hard));

    let replaces: Vec<(i64, PointReplace)> = (0..50)
        .map(|i| {
            let key = format!("key{i:02}");
            (i, point(&key, returning(json!({"id": key.clone()}))))
        })
        .collect();
    run_batch(&store, &txn, replaces).await;

    let sb = store.acquire_superblock_for_read().await;
    let response = rget_slice(
        store.primary(),
        &txn,
        &sb,
        &KeyRange::new(StoreKey::from_str("key10"), StoreKey::from_str("key30")),
        &[],
        Some(&quill_document::transform::Terminal::Count),
        store.config(),
        &Interruptor::never(),
    )
    .unwrap();

    assert!(matches!(response.result, RangeReadResult::Length(20)));
}
