//! Tasks, waiters, results, and traces flowing through the event loop

use crate::common::Error;
use crate::coordinator::shard::{Shard, ShardInfo, ShardKey};
use crate::storage::accessor::ShardAccessor;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Operation tag carried by a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Register,
    Initialize,
    MakeAvailable,
    Destroy,
    Acquire,
    Fail,
    Recover,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Register => "register",
            Op::Initialize => "initialize",
            Op::MakeAvailable => "make-available",
            Op::Destroy => "destroy",
            Op::Acquire => "acquire",
            Op::Fail => "fail",
            Op::Recover => "recover",
        };
        f.write_str(s)
    }
}

/// Reply destination for one operation.
///
/// The sender is optional: synthetic waiters (detached recoveries, failure
/// notifications with no sink) carry only a cancellation token.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub(crate) cancel: CancellationToken,
    pub(crate) out: Option<mpsc::Sender<ShardResult>>,
}

impl Waiter {
    pub fn new(cancel: CancellationToken, out: mpsc::Sender<ShardResult>) -> Self {
        Self {
            cancel,
            out: Some(out),
        }
    }

    /// A waiter with no reply destination.
    pub fn detached(cancel: CancellationToken) -> Self {
        Self { cancel, out: None }
    }

    /// Same reply destination, different cancellation scope.
    pub(crate) fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            out: self.out.clone(),
        }
    }
}

/// Unit of work consumed by the event loop
pub(crate) struct Task {
    pub op: Op,
    pub shard: Arc<Shard>,
    pub waiter: Option<Waiter>,
    pub err: Option<Arc<Error>>,
}

impl Task {
    pub fn new(op: Op, shard: Arc<Shard>) -> Self {
        Self {
            op,
            shard,
            waiter: None,
            err: None,
        }
    }

    pub fn with_waiter(op: Op, shard: Arc<Shard>, waiter: Waiter) -> Self {
        Self {
            op,
            shard,
            waiter: Some(waiter),
            err: None,
        }
    }

    pub fn failure(shard: Arc<Shard>, err: Arc<Error>) -> Self {
        Self {
            op: Op::Fail,
            shard,
            waiter: None,
            err: Some(err),
        }
    }
}

/// Outcome of one operation, delivered to a waiter
#[derive(Debug, Clone)]
pub struct ShardResult {
    pub key: ShardKey,
    pub accessor: Option<ShardAccessor>,
    pub error: Option<Arc<Error>>,
}

impl ShardResult {
    pub fn ok(key: ShardKey) -> Self {
        Self {
            key,
            accessor: None,
            error: None,
        }
    }

    pub fn with_accessor(key: ShardKey, accessor: ShardAccessor) -> Self {
        Self {
            key,
            accessor: Some(accessor),
            error: None,
        }
    }

    pub fn err(key: ShardKey, error: Arc<Error>) -> Self {
        Self {
            key,
            accessor: None,
            error: Some(error),
        }
    }

    /// Convert into a plain result, surfacing the accessor if one was
    /// delivered.
    pub fn into_result(self) -> crate::Result<Option<ShardAccessor>> {
        match self.error {
            None => Ok(self.accessor),
            Some(e) => Err(Error::from_shared(e)),
        }
    }
}

/// Observation of one transition, emitted after it is applied
#[derive(Debug, Clone)]
pub struct Trace {
    pub key: ShardKey,
    pub op: Op,
    pub after: ShardInfo,
}

/// A result paired with its waiter, queued for off-loop delivery
pub(crate) struct Dispatch {
    pub res: ShardResult,
    pub waiter: Waiter,
}
