//! Interruption signals for long-running operations.
//!
//! An [`Interruptor`] is a cloneable receiver of a one-way pulse. Backfill,
//! ranged reads, range erase, and sindex post-construction all poll or wait
//! on one; the owner pulses the paired [`InterruptorHandle`] to cancel.
//!
//! A pulse is permanent: once pulsed, every clone observes it forever.

use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{QuillError, QuillResult};

/// The pulse side of an interruption signal.
#[derive(Debug, Clone)]
pub struct InterruptorHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl InterruptorHandle {
    /// Creates a fresh handle/interruptor pair.
    #[must_use]
    pub fn new() -> (Self, Interruptor) {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        (
            Self { tx: tx.clone() },
            Interruptor {
                rx,
                _keepalive: tx,
            },
        )
    }

    /// Pulses the signal. Idempotent.
    pub fn pulse(&self) {
        self.tx.send_replace(true);
    }

    /// Pulses the signal if it has not been pulsed yet.
    pub fn pulse_if_not_already_pulsed(&self) {
        if !*self.tx.borrow() {
            self.tx.send_replace(true);
        }
    }
}

/// The observing side of an interruption signal.
#[derive(Debug, Clone)]
pub struct Interruptor {
    rx: watch::Receiver<bool>,
    // Keeps the channel open so `never()` interruptors stay quiescent
    // instead of reporting a closed sender.
    _keepalive: Arc<watch::Sender<bool>>,
}

impl Interruptor {
    /// Creates an interruptor that can never fire.
    ///
    /// Used where interruption must not be allowed, e.g. while applying a
    /// modification report to the secondary indexes.
    #[must_use]
    pub fn never() -> Self {
        let (_, interruptor) = InterruptorHandle::new();
        interruptor
    }

    /// Creates an interruptor that fires when either input fires.
    #[must_use]
    pub fn either(a: &Interruptor, b: &Interruptor) -> Self {
        let (handle, combined) = InterruptorHandle::new();
        for src in [a.clone(), b.clone()] {
            let handle = handle.clone();
            let mut rx = src.rx;
            tokio::spawn(async move {
                let already_pulsed = *rx.borrow();
                if already_pulsed || rx.wait_for(|pulsed| *pulsed).await.is_ok() {
                    handle.pulse();
                }
            });
        }
        combined
    }

    /// Returns true if the signal has been pulsed.
    #[must_use]
    pub fn is_pulsed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Returns `Err(QuillError::Interrupted)` if the signal has been pulsed.
    pub fn check(&self) -> QuillResult<()> {
        if self.is_pulsed() {
            Err(QuillError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Waits until the signal is pulsed.
    pub async fn pulsed(&self) {
        let mut rx = self.rx.clone();
        // wait_for only errs when the sender is dropped, which the keepalive
        // prevents; treat a closed channel as "never fires".
        if rx.wait_for(|pulsed| *pulsed).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pulse_observed() {
        let (handle, interruptor) = InterruptorHandle::new();
        assert!(!interruptor.is_pulsed());
        assert!(interruptor.check().is_ok());

        handle.pulse();
        assert!(interruptor.is_pulsed());
        assert!(interruptor.check().unwrap_err().is_interrupted());
    }

    #[tokio::test]
    async fn test_clones_share_pulse() {
        let (handle, interruptor) = InterruptorHandle::new();
        let clone = interruptor.clone();
        handle.pulse();
        assert!(clone.is_pulsed());
    }

    #[tokio::test]
    async fn test_never_stays_quiet() {
        let interruptor = Interruptor::never();
        assert!(!interruptor.is_pulsed());
    }

    #[tokio::test]
    async fn test_wait_for_pulse() {
        let (handle, interruptor) = InterruptorHandle::new();
        let waiter = tokio::spawn(async move {
            interruptor.pulsed().await;
        });
        handle.pulse();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_either_fires_on_first() {
        let (handle_a, a) = InterruptorHandle::new();
        let (_handle_b, b) = InterruptorHandle::new();
        let combined = Interruptor::either(&a, &b);
        handle_a.pulse();
        combined.pulsed().await;
        assert!(combined.is_pulsed());
    }
}
