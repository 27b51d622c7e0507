//! Task channels feeding the event loop
//!
//! Three inputs with a strict consumption order: the internal channel
//! (follow-ups the loop enqueues for itself) is always drained before
//! external or completion work is admitted, so compound transitions finish
//! before any newly submitted task can observe them.

use crate::common::{CoordinatorConfig, Error, Result};
use crate::coordinator::task::Task;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) struct TaskSenders {
    /// Loop-internal follow-ups; unbounded so the loop never suspends on
    /// its own queue
    pub internal: mpsc::UnboundedSender<Task>,
    /// Caller-submitted operations
    pub external: mpsc::Sender<Task>,
    /// Worker completion reports
    pub completion: mpsc::Sender<Task>,
}

pub(crate) struct TaskReceivers {
    internal: mpsc::UnboundedReceiver<Task>,
    external: mpsc::Receiver<Task>,
    completion: mpsc::Receiver<Task>,
}

pub(crate) fn task_channels(config: &CoordinatorConfig) -> (TaskSenders, TaskReceivers) {
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (external_tx, external_rx) = mpsc::channel(config.external_queue_depth);
    let (completion_tx, completion_rx) = mpsc::channel(config.completion_queue_depth);

    (
        TaskSenders {
            internal: internal_tx,
            external: external_tx,
            completion: completion_tx,
        },
        TaskReceivers {
            internal: internal_rx,
            external: external_rx,
            completion: completion_rx,
        },
    )
}

impl TaskReceivers {
    /// Pop the next task.
    ///
    /// Internal tasks and shutdown are checked without blocking first; only
    /// then does the call suspend on external and completion work. Returns
    /// `Error::Shutdown` once the token fires.
    pub async fn consume_next(&mut self, cancel: &CancellationToken) -> Result<Task> {
        if let Ok(task) = self.internal.try_recv() {
            return Ok(task);
        }
        if cancel.is_cancelled() {
            return Err(Error::Shutdown);
        }

        tokio::select! {
            task = self.external.recv() => task.ok_or(Error::Shutdown),
            task = self.completion.recv() => task.ok_or(Error::Shutdown),
            _ = cancel.cancelled() => Err(Error::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::shard::{Shard, ShardKey};
    use crate::coordinator::task::Op;
    use crate::storage::mount::MemoryMount;
    use std::sync::Arc;

    fn dummy_task(op: Op) -> Task {
        let mount = Arc::new(MemoryMount::new("q", vec![]));
        Task::new(op, Shard::new(ShardKey::from("q"), mount, false))
    }

    #[tokio::test]
    async fn test_internal_has_priority() {
        let config = CoordinatorConfig::default();
        let (senders, mut receivers) = task_channels(&config);
        let cancel = CancellationToken::new();

        senders.external.send(dummy_task(Op::Acquire)).await.unwrap();
        senders.completion.send(dummy_task(Op::Fail)).await.unwrap();
        senders.internal.send(dummy_task(Op::Initialize)).unwrap();
        senders.internal.send(dummy_task(Op::MakeAvailable)).unwrap();

        let first = receivers.consume_next(&cancel).await.unwrap();
        assert_eq!(first.op, Op::Initialize);
        let second = receivers.consume_next(&cancel).await.unwrap();
        assert_eq!(second.op, Op::MakeAvailable);

        // internal drained; the remaining two arrive in some order
        let third = receivers.consume_next(&cancel).await.unwrap();
        let fourth = receivers.consume_next(&cancel).await.unwrap();
        let mut rest = vec![third.op, fourth.op];
        rest.sort_by_key(|op| format!("{}", op));
        assert_eq!(rest, vec![Op::Acquire, Op::Fail]);
    }

    #[tokio::test]
    async fn test_shutdown_observed() {
        let config = CoordinatorConfig::default();
        let (_senders, mut receivers) = task_channels(&config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = receivers.consume_next(&cancel).await.unwrap_err();
        assert!(err.is_shutdown());
    }

    #[tokio::test]
    async fn test_internal_wins_over_shutdown_path() {
        let config = CoordinatorConfig::default();
        let (senders, mut receivers) = task_channels(&config);
        let cancel = CancellationToken::new();

        senders.internal.send(dummy_task(Op::Initialize)).unwrap();
        cancel.cancel();

        // a queued follow-up is still handed out before shutdown is reported
        let task = receivers.consume_next(&cancel).await.unwrap();
        assert_eq!(task.op, Op::Initialize);
        assert!(receivers.consume_next(&cancel).await.is_err());
    }
}
