//! Shard coordinator: construction, restore, public operations
//!
//! The coordinator owns the event loop and the dispatcher tasks. Callers
//! submit operations here; each operation is a task on the external channel
//! and a waiter carrying the reply destination.

use crate::common::{CoordinatorConfig, Error, RecoverPolicy, Result};
use crate::coordinator::dispatcher;
use crate::coordinator::queue::{task_channels, TaskSenders};
use crate::coordinator::shard::{
    shard_meta_key, PersistedShard, Shard, ShardInfo, ShardKey, ShardState, SHARD_META_PREFIX,
};
use crate::coordinator::task::{Dispatch, Op, ShardResult, Task, Trace, Waiter};
use crate::coordinator::metadata::MetaStore;
use crate::storage::accessor::ShardAccessor;
use crate::storage::index::IndexRepo;
use crate::storage::mount::{Mount, MountRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Registration options
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOpts {
    /// Skip initialization at registration; the first acquire triggers it
    pub lazy: bool,
}

/// Optional application-supplied sinks.
///
/// The trace sink is serviced synchronously by the event loop and must be
/// drained by the application; the failure sink is serviced through the
/// dispatcher and receives one result per failure transition.
#[derive(Default)]
pub struct Sinks {
    pub trace: Option<mpsc::Sender<Trace>>,
    pub failure: Option<mpsc::Sender<ShardResult>>,
}

pub(crate) struct CoordinatorInner {
    pub(crate) config: CoordinatorConfig,
    pub(crate) shards: RwLock<HashMap<ShardKey, Arc<Shard>>>,
    pub(crate) store: Arc<dyn MetaStore>,
    pub(crate) indices: IndexRepo,
    pub(crate) mounts: Arc<MountRegistry>,
    pub(crate) internal_tx: mpsc::UnboundedSender<Task>,
    pub(crate) external_tx: mpsc::Sender<Task>,
    pub(crate) completion_tx: mpsc::Sender<Task>,
    pub(crate) dispatch_tx: mpsc::Sender<Dispatch>,
    pub(crate) dispatch_failure_tx: mpsc::Sender<Dispatch>,
    pub(crate) trace_tx: Option<mpsc::Sender<Trace>>,
    pub(crate) failure_tx: Option<mpsc::Sender<ShardResult>>,
    pub(crate) cancel: CancellationToken,
}

/// Shard lifecycle coordinator
pub struct ShardCoordinator {
    inner: Arc<CoordinatorInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardCoordinator {
    /// Restore persisted shards and start the event loop and dispatchers.
    pub async fn start(
        config: CoordinatorConfig,
        store: Arc<dyn MetaStore>,
        mounts: Arc<MountRegistry>,
        sinks: Sinks,
    ) -> Result<Self> {
        config.validate()?;

        let indices = IndexRepo::open(&config.index_dir)?;
        let (senders, receivers) = task_channels(&config);
        let TaskSenders {
            internal,
            external,
            completion,
        } = senders;
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_depth);
        let (dispatch_failure_tx, dispatch_failure_rx) = mpsc::channel(config.dispatch_queue_depth);
        let cancel = CancellationToken::new();

        let inner = Arc::new(CoordinatorInner {
            config,
            shards: RwLock::new(HashMap::new()),
            store,
            indices,
            mounts,
            internal_tx: internal,
            external_tx: external,
            completion_tx: completion,
            dispatch_tx,
            dispatch_failure_tx,
            trace_tx: sinks.trace,
            failure_tx: sinks.failure,
            cancel: cancel.clone(),
        });

        inner.restore()?;

        let handles = vec![
            tokio::spawn(Arc::clone(&inner).control(receivers)),
            tokio::spawn(dispatcher::run(dispatch_rx, cancel.clone())),
            tokio::spawn(dispatcher::run(dispatch_failure_rx, cancel)),
        ];

        Ok(Self {
            inner,
            handles: Mutex::new(handles),
        })
    }

    /// Register a new shard and await the outcome.
    pub async fn register_shard(
        &self,
        key: impl Into<ShardKey>,
        mount: Arc<dyn Mount>,
        opts: RegisterOpts,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(1);
        let waiter = Waiter::new(CancellationToken::new(), tx);
        self.register_shard_with(key, mount, opts, waiter).await?;
        match rx.recv().await {
            Some(res) => res.into_result().map(|_| ()),
            None => Err(Error::Shutdown),
        }
    }

    /// Register a new shard, replying on the waiter's channel.
    pub async fn register_shard_with(
        &self,
        key: impl Into<ShardKey>,
        mount: Arc<dyn Mount>,
        opts: RegisterOpts,
        waiter: Waiter,
    ) -> Result<()> {
        let key = key.into();
        let shard = {
            let mut shards = self.inner.shards.write().unwrap();
            if shards.contains_key(&key) {
                return Err(Error::ShardExists(key.to_string()));
            }
            let shard = Shard::new(key.clone(), mount, opts.lazy);
            shards.insert(key.clone(), Arc::clone(&shard));
            shard
        };

        let task = Task::with_waiter(Op::Register, shard, waiter);
        if let Err(e) = self.inner.queue_external(task).await {
            self.inner.shards.write().unwrap().remove(&key);
            return Err(e);
        }
        Ok(())
    }

    /// Acquire a read handle on a shard.
    pub async fn acquire_shard(&self, key: &ShardKey) -> Result<ShardAccessor> {
        let (tx, mut rx) = mpsc::channel(1);
        self.acquire_shard_with(key, CancellationToken::new(), tx)
            .await?;
        match rx.recv().await {
            Some(res) => res
                .into_result()?
                .ok_or_else(|| Error::Internal("acquire completed without an accessor".into())),
            None => Err(Error::Shutdown),
        }
    }

    /// Acquire with a caller-supplied cancellation token and reply channel.
    /// The same channel may serve many acquires.
    pub async fn acquire_shard_with(
        &self,
        key: &ShardKey,
        cancel: CancellationToken,
        out: mpsc::Sender<ShardResult>,
    ) -> Result<()> {
        let shard = self.lookup(key)?;
        let task = Task::with_waiter(Op::Acquire, shard, Waiter::new(cancel, out));
        self.inner.queue_external(task).await
    }

    /// Recover an errored shard and await the outcome.
    pub async fn recover_shard(&self, key: &ShardKey) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(1);
        let waiter = Waiter::new(CancellationToken::new(), tx);
        self.recover_shard_with(key, waiter).await?;
        match rx.recv().await {
            Some(res) => res.into_result().map(|_| ()),
            None => Err(Error::Shutdown),
        }
    }

    /// Recover an errored shard, replying on the waiter's channel.
    pub async fn recover_shard_with(&self, key: &ShardKey, waiter: Waiter) -> Result<()> {
        let shard = self.lookup(key)?;
        let task = Task::with_waiter(Op::Recover, shard, waiter);
        self.inner.queue_external(task).await
    }

    /// Destroy a shard: drop its metadata record and index, remove it from
    /// the shard map. Destroying an unknown shard succeeds.
    pub async fn destroy_shard(&self, key: &ShardKey) -> Result<()> {
        let shard = self.inner.shards.read().unwrap().get(key).cloned();
        let Some(shard) = shard else {
            // idempotent: clear any orphaned record
            return self.inner.store.delete(&shard_meta_key(key));
        };

        let (tx, mut rx) = mpsc::channel(1);
        let waiter = Waiter::new(CancellationToken::new(), tx);
        let task = Task::with_waiter(Op::Destroy, shard, waiter);
        self.inner.queue_external(task).await?;
        match rx.recv().await {
            Some(res) => res.into_result().map(|_| ()),
            None => Err(Error::Shutdown),
        }
    }

    /// Snapshot one shard's observable record.
    pub async fn shard_info(&self, key: &ShardKey) -> Result<ShardInfo> {
        let shard = self.lookup(key)?;
        Ok(shard.info().await)
    }

    /// Snapshot every shard's observable record.
    pub async fn all_shards_info(&self) -> HashMap<ShardKey, ShardInfo> {
        let shards: Vec<Arc<Shard>> = self
            .inner
            .shards
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();

        let mut out = HashMap::with_capacity(shards.len());
        for shard in shards {
            out.insert(shard.key().clone(), shard.info().await);
        }
        out
    }

    /// Shut down: stop the loop and dispatchers, flush the metadata store.
    /// Queued tasks are dropped; their waiters observe cancellation or
    /// channel closure.
    pub async fn close(&self) {
        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "background task panicked during shutdown");
            }
        }

        if let Err(e) = self.inner.store.flush() {
            tracing::warn!(error = %e, "failed to flush metadata store on close");
        }
    }

    fn lookup(&self, key: &ShardKey) -> Result<Arc<Shard>> {
        self.inner
            .shards
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ShardUnknown(key.to_string()))
    }
}

impl CoordinatorInner {
    pub(crate) async fn queue_external(&self, task: Task) -> Result<()> {
        self.external_tx
            .send(task)
            .await
            .map_err(|_| Error::Shutdown)
    }

    /// Rebuild the shard map from the metadata store.
    ///
    /// Shards persisted as available come back available. Shards caught
    /// mid-initialization come back new and re-initialize on their next
    /// acquire. Errored shards follow the configured recovery policy.
    fn restore(&self) -> Result<()> {
        let mut shards = self.shards.write().unwrap();

        for meta_key in self.store.list()? {
            if !meta_key.starts_with(SHARD_META_PREFIX) {
                continue;
            }
            let Some(raw) = self.store.get(&meta_key)? else {
                continue;
            };
            let persisted = match PersistedShard::decode(&raw) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(key = %meta_key, error = %e, "skipping undecodable shard record");
                    continue;
                }
            };
            let mount = match self.mounts.resolve(&persisted.mount_url) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(shard = %persisted.key, error = %e, "skipping shard with unresolvable mount");
                    continue;
                }
            };

            let (state, recover_on_next_acquire, recover_now) = match persisted.state {
                ShardState::Available => (ShardState::Available, false, false),
                ShardState::Errored => match self.config.recover_policy {
                    RecoverPolicy::Never => (ShardState::Errored, false, false),
                    RecoverPolicy::OnAcquire => (ShardState::Errored, true, false),
                    RecoverPolicy::Now => (ShardState::Errored, false, true),
                },
                _ => (ShardState::New, false, false),
            };

            let shard = Shard::restored(&persisted, mount, state, recover_on_next_acquire);
            if recover_now {
                self.queue_internal(Task::with_waiter(
                    Op::Recover,
                    Arc::clone(&shard),
                    Waiter::detached(self.cancel.clone()),
                ));
            }

            tracing::info!(shard = %persisted.key, state = %state, "restored shard record");
            shards.insert(persisted.key.clone(), shard);
        }

        Ok(())
    }
}
