//! Off-loop delivery of results to waiters
//!
//! The event loop never writes to caller-facing channels itself: a caller
//! may have stopped listening, and a blocked send would stall every shard.
//! Dispatches are queued here and a dedicated task performs each send,
//! racing it against the waiter's cancellation.

use crate::coordinator::task::Dispatch;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Drain the dispatch queue until shutdown or queue closure.
pub(crate) async fn run(mut rx: mpsc::Receiver<Dispatch>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(dispatch) => dispatch.deliver().await,
                None => break,
            },
        }
    }
}

impl Dispatch {
    /// Send the result to the waiter, dropping it if the waiter has
    /// cancelled or stopped receiving.
    pub(crate) async fn deliver(self) {
        let Dispatch { res, waiter } = self;
        let Some(out) = waiter.out else {
            return;
        };
        let key = res.key.clone();

        tokio::select! {
            _ = waiter.cancel.cancelled() => {
                tracing::debug!(shard = %key, "waiter cancelled; dropping result");
            }
            sent = out.send(res) => {
                if sent.is_err() {
                    tracing::debug!(shard = %key, "reply channel closed; dropping result");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::shard::ShardKey;
    use crate::coordinator::task::{ShardResult, Waiter};
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivers_to_live_waiter() {
        let (tx, mut rx) = mpsc::channel(1);
        let dispatch = Dispatch {
            res: ShardResult::ok(ShardKey::from("d1")),
            waiter: Waiter::new(CancellationToken::new(), tx),
        };

        dispatch.deliver().await;
        let res = rx.recv().await.unwrap();
        assert_eq!(res.key, ShardKey::from("d1"));
        assert!(res.error.is_none());
    }

    #[tokio::test]
    async fn test_drops_for_cancelled_waiter() {
        // a full channel would block forever without the cancellation race
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(ShardResult::ok(ShardKey::from("filler")))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let dispatch = Dispatch {
            res: ShardResult::ok(ShardKey::from("d2")),
            waiter: Waiter::new(cancel, tx),
        };

        tokio::time::timeout(Duration::from_secs(1), dispatch.deliver())
            .await
            .expect("deliver must not block on a cancelled waiter");

        assert_eq!(rx.recv().await.unwrap().key, ShardKey::from("filler"));
    }

    #[tokio::test]
    async fn test_detached_waiter_is_noop() {
        let dispatch = Dispatch {
            res: ShardResult::ok(ShardKey::from("d3")),
            waiter: Waiter::detached(CancellationToken::new()),
        };
        dispatch.deliver().await;
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel() {
        let (_tx, rx) = mpsc::channel::<Dispatch>(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(rx, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dispatcher must exit on cancel")
            .unwrap();
    }
}
