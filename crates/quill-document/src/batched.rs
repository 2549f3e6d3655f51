//! The batched-replace pipeline.
//!
//! Runs an ordered list of `(sequence_tag, replace)` pairs over one shared
//! transaction. Each iteration moves the superblock into a spawned task and
//! waits on a one-shot for the task to hand it back — typically as soon as
//! the task's root walk completes, long before its leaf work finishes — so
//! replaces for different keys pipeline.
//!
//! Sindex effects commit in FIFO token order: a task may finish its B-tree
//! work early, but it waits its turn at the sink before feeding its
//! modification report to the sindex maintainer. Responses preserve the
//! input sequence tags verbatim so reassembly across shards is stable.
//!
//! The drain scope owns every in-flight task and is drained before the
//! sink goes away; the coroutines being drained use that sink.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::debug;

use quill_common::interrupt::Interruptor;
use quill_common::types::Timestamp;
use quill_storage::superblock::Superblock;
use quill_storage::txn::Transaction;

use crate::fifo::{FifoSink, FifoSource};
use crate::replace::{replace_and_return_superblock, PointReplace, ReplaceResponse};
use crate::report::ModificationReport;
use crate::sindex::ModificationReportCb;
use crate::store::Store;

/// Runs a batch of replaces, pipelined across one superblock.
///
/// Responses come back in input order with their sequence tags preserved.
/// Interruption aborts iterations that have not been spawned yet (they
/// report `errors`); already-spawned tasks run to completion because
/// dropping them mid-flight would leak transaction state.
pub async fn batched_replace(
    store: &Arc<Store>,
    txn: &Arc<Transaction>,
    timestamp: Timestamp,
    replaces: &[(i64, PointReplace)],
    superblock: Superblock,
    sindex_cb: &Arc<ModificationReportCb>,
    interruptor: &Interruptor,
) -> Vec<(i64, ReplaceResponse)> {
    let source = FifoSource::new();
    let sink = Arc::new(FifoSink::new());
    let mut drainer: JoinSet<(usize, ReplaceResponse)> = JoinSet::new();

    let mut slots: Vec<Option<ReplaceResponse>> = replaces.iter().map(|_| None).collect();
    let mut current_superblock = Some(superblock);
    let mut spawned = 0usize;

    for (index, (_tag, point_replace)) in replaces.iter().enumerate() {
        if interruptor.is_pulsed() {
            debug!(remaining = replaces.len() - index, "batched replace interrupted before spawn");
            break;
        }

        let token = source.enter_write();
        let (superblock_tx, superblock_rx) = oneshot::channel();

        let slice = store.primary().clone();
        let config = store.config().clone();
        let task_txn = txn.clone();
        let task_sink = sink.clone();
        let task_cb = sindex_cb.clone();
        let task_replace = point_replace.clone();
        let task_interruptor = interruptor.clone();
        let task_superblock = current_superblock.take().expect("superblock in flight");

        drainer.spawn(async move {
            let mut report = ModificationReport::new(task_replace.key.clone());
            let response = replace_and_return_superblock(
                &slice,
                &task_txn,
                task_superblock,
                &task_replace.primary_key,
                &task_replace.key,
                task_replace.func.as_ref(),
                timestamp,
                Some(superblock_tx),
                &mut report.info,
                &config,
                &task_interruptor,
            );

            // Wait for this write's FIFO turn before its sindex effects
            // become visible.
            let _exit = task_sink.exit_write(token).await;
            task_cb.on_mod_report(&task_txn, report).await;
            (index, response)
        });
        spawned += 1;

        let returned = superblock_rx
            .await
            .expect("replace task dropped the superblock");
        current_superblock = Some(returned);
    }

    if let Some(superblock) = current_superblock.take() {
        superblock.release();
    }

    while let Some(joined) = drainer.join_next().await {
        match joined {
            Ok((index, response)) => slots[index] = Some(response),
            Err(join_err) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
            }
        }
    }

    replaces
        .iter()
        .enumerate()
        .map(|(index, (tag, _))| {
            let response = slots[index]
                .take()
                .unwrap_or_else(|| interrupted_response(index, spawned));
            (*tag, response)
        })
        .collect()
}

fn interrupted_response(index: usize, spawned: usize) -> ReplaceResponse {
    debug_assert!(index >= spawned, "spawned replace produced no response");
    ReplaceResponse::interrupted_before_spawn()
}
