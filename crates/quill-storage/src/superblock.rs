//! The superblock: a single-holder capability to a slice's root.
//!
//! At most one [`Superblock`] exists per slice at any time. Writers acquire
//! it, descend to their leaf, and then hand it to the next writer through a
//! one-shot channel (or release it back to the keeper) while their leaf
//! mutation is still in flight. This is what lets a batch of writes pipeline
//! across keys: the next write starts as soon as the previous one is done
//! with the root, not when it is done with its leaf.

use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// Shared state behind a keeper and its outstanding token.
#[derive(Debug)]
struct KeeperInner {
    slice_id: u64,
    available: parking_lot::Mutex<bool>,
    notify: Notify,
}

/// Issues and reclaims the superblock for one slice.
#[derive(Debug, Clone)]
pub struct SuperblockKeeper {
    inner: Arc<KeeperInner>,
}

impl SuperblockKeeper {
    /// Creates a keeper whose superblock starts out available.
    #[must_use]
    pub fn new(slice_id: u64) -> Self {
        Self {
            inner: Arc::new(KeeperInner {
                slice_id,
                available: parking_lot::Mutex::new(true),
                notify: Notify::new(),
            }),
        }
    }

    /// The slice this keeper guards.
    #[inline]
    #[must_use]
    pub fn slice_id(&self) -> u64 {
        self.inner.slice_id
    }

    /// Acquires the superblock, waiting until the current holder releases it.
    pub async fn acquire(&self) -> Superblock {
        loop {
            {
                let mut available = self.inner.available.lock();
                if *available {
                    *available = false;
                    return Superblock {
                        keeper: Some(self.inner.clone()),
                    };
                }
            }
            self.inner.notify.notified().await;
        }
    }
}

/// The exclusive capability to a slice's root.
///
/// Never cloned. Moving the value moves the capability; dropping it returns
/// the capability to the keeper.
#[derive(Debug)]
pub struct Superblock {
    keeper: Option<Arc<KeeperInner>>,
}

impl Superblock {
    /// The slice this superblock belongs to.
    #[inline]
    #[must_use]
    pub fn slice_id(&self) -> u64 {
        self.keeper
            .as_ref()
            .expect("superblock already released")
            .slice_id
    }

    /// Releases the superblock back to its keeper, waking one waiter.
    pub fn release(self) {
        drop(self);
    }

    /// Hands the superblock to the next holder, or releases it when there is
    /// no next holder.
    ///
    /// If the receiving end has already gone away the superblock falls back
    /// to the keeper, so the capability is never stranded.
    pub fn handoff(self, next: Option<oneshot::Sender<Superblock>>) {
        match next {
            Some(tx) => {
                if let Err(unclaimed) = tx.send(self) {
                    unclaimed.release();
                }
            }
            None => self.release(),
        }
    }
}

impl Drop for Superblock {
    fn drop(&mut self) {
        if let Some(inner) = self.keeper.take() {
            *inner.available.lock() = true;
            inner.notify.notify_one();
        }
    }
}
