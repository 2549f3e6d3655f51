//! FIFO write ordering.
//!
//! A [`FifoSource`] hands out monotonically ordered write tokens; the
//! paired [`FifoSink`] lets each holder pass only when every earlier token
//! has passed. The batched-replace pipeline uses this to commit sindex
//! effects in issue order even when the tasks' B-tree work overlaps.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// Issues write tokens in monotone order.
#[derive(Debug, Default)]
pub struct FifoSource {
    next_turn: AtomicU64,
}

impl FifoSource {
    /// Creates a source whose first token is turn zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next write token.
    pub fn enter_write(&self) -> WriteToken {
        WriteToken {
            turn: self.next_turn.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// A token representing one turn in the FIFO order.
#[derive(Debug)]
pub struct WriteToken {
    turn: u64,
}

impl WriteToken {
    /// The token's turn number.
    #[inline]
    #[must_use]
    pub fn turn(&self) -> u64 {
        self.turn
    }
}

/// Orders exits by token turn.
///
/// Must outlive every task that waits on it; tasks are drained before the
/// sink is dropped.
#[derive(Debug)]
pub struct FifoSink {
    current: watch::Sender<u64>,
}

impl FifoSink {
    /// Creates a sink whose first admitted turn is zero.
    #[must_use]
    pub fn new() -> Self {
        let (current, _) = watch::channel(0);
        Self { current }
    }

    /// Waits until it is `token`'s turn. The returned guard admits the next
    /// turn when dropped, whether or not the holder's work succeeded.
    pub async fn exit_write(&self, token: WriteToken) -> FifoExitGuard<'_> {
        let mut rx = self.current.subscribe();
        rx.wait_for(|current| *current == token.turn)
            .await
            .expect("fifo sink dropped with tokens outstanding");
        FifoExitGuard { sink: self }
    }
}

impl Default for FifoSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Admission for one turn; advances the sink on drop.
#[derive(Debug)]
pub struct FifoExitGuard<'a> {
    sink: &'a FifoSink,
}

impl Drop for FifoExitGuard<'_> {
    fn drop(&mut self) {
        self.sink.current.send_modify(|current| *current += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn test_tokens_are_monotone() {
        let source = FifoSource::new();
        assert_eq!(source.enter_write().turn(), 0);
        assert_eq!(source.enter_write().turn(), 1);
        assert_eq!(source.enter_write().turn(), 2);
    }

    #[tokio::test]
    async fn test_exits_run_in_token_order() {
        let source = FifoSource::new();
        let sink = Arc::new(FifoSink::new());
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut tasks = JoinSet::new();
        // Spawn in reverse so scheduling order fights token order.
        let tokens: Vec<WriteToken> = (0..8).map(|_| source.enter_write()).collect();
        for token in tokens.into_iter().rev() {
            let sink = sink.clone();
            let order = order.clone();
            tasks.spawn(async move {
                let turn = token.turn();
                let _exit = sink.exit_write(token).await;
                order.lock().push(turn);
            });
        }
        while tasks.join_next().await.is_some() {}

        assert_eq!(*order.lock(), (0..8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_guard_advances_even_without_work() {
        let source = FifoSource::new();
        let sink = FifoSink::new();

        let first = source.enter_write();
        let second = source.enter_write();
        drop(sink.exit_write(first).await);
        // The second turn is admitted because the first guard dropped.
        let _guard = sink.exit_write(second).await;
    }
}
