//! The event loop: sole writer of shard lifecycle state
//!
//! Every transition runs here. A task is popped, the target shard's lock is
//! taken, the transition applied, the record persisted, a trace emitted,
//! and only then is the lock released — so the observable record is always
//! a consistent post-transition snapshot.

use crate::common::Error;
use crate::coordinator::queue::TaskReceivers;
use crate::coordinator::server::CoordinatorInner;
use crate::coordinator::shard::{load_persisted, shard_meta_key, Shard, ShardInner, ShardState};
use crate::coordinator::task::{Dispatch, Op, ShardResult, Task, Trace, Waiter};
use crate::storage::accessor::ShardAccessor;
use crate::storage::index::ShardIndex;
use crate::storage::mount::Mount;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

impl CoordinatorInner {
    /// Run the event loop until shutdown.
    pub(crate) async fn control(self: Arc<Self>, mut queue: TaskReceivers) {
        // Synthetic waiter for failure notifications: scoped to the
        // coordinator's lifetime, pointed at the application's failure sink.
        let w_failure = self
            .failure_tx
            .clone()
            .map(|tx| Waiter::new(self.cancel.clone(), tx));

        loop {
            let tsk = match queue.consume_next(&self.cancel).await {
                Ok(tsk) => tsk,
                Err(e) if e.is_shutdown() => {
                    tracing::info!("shard coordinator closed");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "consuming next task failed; event loop aborted");
                    return;
                }
            };

            let shard = Arc::clone(&tsk.shard);
            tracing::debug!(op = %tsk.op, shard = %shard.key(), "processing task");

            let mut inner = shard.inner.lock().await;
            let prev_state = inner.state;

            if inner.state == ShardState::Destroyed {
                tracing::debug!(op = %tsk.op, shard = %shard.key(), "dropping task for destroyed shard");
                continue;
            }

            let persist = match tsk.op {
                Op::Register => self.on_register(&shard, &mut inner, &tsk).await,
                Op::Initialize => Self::on_initialize(&self, &shard, &mut inner, &tsk),
                Op::MakeAvailable => Self::on_make_available(&self, &shard, &mut inner).await,
                Op::Acquire => Self::on_acquire(&self, &shard, &mut inner, &tsk).await,
                Op::Fail => {
                    self.on_fail(&shard, &mut inner, &tsk, w_failure.as_ref())
                        .await
                }
                Op::Recover => Self::on_recover(&self, &shard, &mut inner, &tsk).await,
                Op::Destroy => self.on_destroy(&shard, &mut inner, &tsk).await,
            };

            if persist {
                if let Err(e) = inner.persist(shard.key(), self.store.as_ref()) {
                    tracing::warn!(shard = %shard.key(), error = %e, "failed to persist shard");
                }
            }

            // Synchronous with the loop: a slow trace consumer back-pressures
            // every shard. Callers providing a trace sink must drain it.
            if let Some(trace_tx) = &self.trace_tx {
                let trace = Trace {
                    key: shard.key().clone(),
                    op: tsk.op,
                    after: crate::coordinator::shard::ShardInfo {
                        state: inner.state,
                        error: inner.err.clone(),
                        lazy: inner.lazy,
                    },
                };
                if trace_tx.send(trace).await.is_err() {
                    tracing::warn!(shard = %shard.key(), "trace channel closed; dropping trace");
                }
            }

            tracing::debug!(
                op = %tsk.op,
                shard = %shard.key(),
                prev_state = %prev_state,
                curr_state = %inner.state,
                "finished processing task"
            );
        }
    }

    async fn on_register(&self, shard: &Arc<Shard>, s: &mut ShardInner, tsk: &Task) -> bool {
        if s.state != ShardState::New {
            // sanity check failed
            let err = Arc::new(Error::InitializationFailed(format!(
                "expected shard to be in 'new' state; was: {}",
                s.state
            )));
            self.fail_shard(shard, err);
            return true;
        }

        // Lazy registration completes right away; the first acquire will
        // trigger initialization.
        if s.lazy {
            tracing::debug!(shard = %shard.key(), "shard registered with lazy initialization");
            if let Some(w) = &tsk.waiter {
                self.dispatch_result(ShardResult::ok(shard.key().clone()), [w.clone()])
                    .await;
            }
            return true;
        }

        // Park the registration waiter and queue the initialization.
        s.w_register = tsk.waiter.clone();
        self.queue_internal(match &tsk.waiter {
            Some(w) => Task::with_waiter(Op::Initialize, Arc::clone(shard), w.clone()),
            None => Task::new(Op::Initialize, Arc::clone(shard)),
        });
        true
    }

    fn on_initialize(this: &Arc<Self>, shard: &Arc<Shard>, s: &mut ShardInner, tsk: &Task) -> bool {
        if s.state != ShardState::New {
            tracing::debug!(shard = %shard.key(), state = %s.state, "initialization already under way, nothing to do");
            return true;
        }
        s.state = ShardState::Initializing;

        // A full index on disk means there is nothing to fetch or compute.
        if let Ok(stat) = this.indices.stat_full_index(shard.key().as_str()) {
            if stat.exists {
                tracing::debug!(shard = %shard.key(), "full index already on disk, skipping fetch");
                this.queue_internal(Task::new(Op::MakeAvailable, Arc::clone(shard)));
                return true;
            }
        }

        let cancel = tsk
            .waiter
            .as_ref()
            .map(|w| w.cancel.clone())
            .unwrap_or_else(|| this.cancel.child_token());
        tokio::spawn(Self::initialize_worker(
            Arc::clone(this),
            cancel,
            Arc::clone(shard),
            Arc::clone(&s.mount),
        ));
        true
    }

    async fn on_make_available(this: &Arc<Self>, shard: &Arc<Shard>, s: &mut ShardInner) -> bool {
        // Arrived here after initializing a new shard, or after recovery.
        s.state = ShardState::Available;
        s.err = None;

        if let Some(w) = s.w_register.take() {
            this.dispatch_result(ShardResult::ok(shard.key().clone()), [w])
                .await;
        }

        if let Some(w) = s.w_recover.take() {
            this.dispatch_result(ShardResult::ok(shard.key().clone()), [w])
                .await;
        }

        // Promote queued acquirers, in arrival order, each under its own
        // cancellation scope.
        for w in s.w_acquire.drain(..) {
            tokio::spawn(Self::acquire_worker(
                Arc::clone(this),
                w,
                Arc::clone(shard),
                Arc::clone(&s.mount),
            ));
        }

        true
    }

    async fn on_acquire(this: &Arc<Self>, shard: &Arc<Shard>, s: &mut ShardInner, tsk: &Task) -> bool {
        let Some(w) = tsk.waiter.clone() else {
            tracing::warn!(shard = %shard.key(), "acquire task without a waiter; ignoring");
            return true;
        };
        let key = shard.key().clone();

        // Refresh the record from the store first; acquires must observe
        // persisted truth.
        match load_persisted(this.store.as_ref(), &key) {
            Ok(persisted) => s.reload_from(&persisted),
            Err(e) => {
                let err = Arc::new(Error::AcquireFailed(Arc::new(e)));
                this.dispatch_result(ShardResult::err(key, err), [w]).await;
                return false;
            }
        }

        tracing::debug!(shard = %key, state = %s.state, "got request to acquire shard");

        if s.state == ShardState::Errored {
            if s.recover_on_next_acquire {
                // Park the acquirer and trigger a recovery. The recovery
                // runs under the coordinator's own scope: the first
                // acquirer cancelling must not abort work that other,
                // longer-lived acquirers are waiting on.
                s.w_acquire.push(w);
                s.recover_on_next_acquire = false;
                this.queue_internal(Task::with_waiter(
                    Op::Recover,
                    Arc::clone(shard),
                    Waiter::detached(this.cancel.clone()),
                ));
            } else {
                let cause = s
                    .err
                    .clone()
                    .unwrap_or_else(|| Arc::new(Error::Other("unknown failure".into())));
                let err = Arc::new(Error::ShardErrored(cause));
                this.dispatch_result(ShardResult::err(key, err), [w]).await;
            }
            return true;
        }

        if s.state != ShardState::Available {
            tracing::debug!(shard = %key, "shard not yet available; queueing acquirer");

            if s.state == ShardState::New {
                // First acquire of a lazily registered shard. Initialization
                // is detached from the acquirer: with several concurrent
                // acquirers, the first one cancelling must not kill the
                // shared job. Only shutdown cancels it.
                let init_waiter = w.with_cancel(this.cancel.child_token());
                s.w_acquire.push(w);
                this.queue_internal(Task::with_waiter(
                    Op::Initialize,
                    Arc::clone(shard),
                    init_waiter,
                ));
            } else {
                s.w_acquire.push(w);
            }
            return true;
        }

        // Available: serve the acquire under the acquirer's own scope.
        tokio::spawn(Self::acquire_worker(
            Arc::clone(this),
            w,
            Arc::clone(shard),
            Arc::clone(&s.mount),
        ));
        true
    }

    async fn on_fail(
        &self,
        shard: &Arc<Shard>,
        s: &mut ShardInner,
        tsk: &Task,
        w_failure: Option<&Waiter>,
    ) -> bool {
        let cause = tsk
            .err
            .clone()
            .unwrap_or_else(|| Arc::new(Error::Other("unknown failure".into())));
        s.state = ShardState::Errored;
        s.err = Some(Arc::clone(&cause));
        let key = shard.key().clone();

        if let Some(w) = s.w_register.take() {
            let err = Arc::new(Error::RegisterFailed(Arc::clone(&cause)));
            self.dispatch_result(ShardResult::err(key.clone(), err), [w])
                .await;
        }

        if let Some(w) = s.w_recover.take() {
            let err = Arc::new(Error::RecoverFailed(Arc::clone(&cause)));
            self.dispatch_result(ShardResult::err(key.clone(), err), [w])
                .await;
        }

        if !s.w_acquire.is_empty() {
            let err = Arc::new(Error::AcquireFailed(Arc::clone(&cause)));
            let res = ShardResult::err(key.clone(), err);
            let waiters: Vec<Waiter> = s.w_acquire.drain(..).collect();
            self.dispatch_result(res, waiters).await;
        }

        // Acquirers already holding accessors are left alone. This layer
        // cannot tell which kind of failure occurred; if the bytes are
        // really gone, their reads fail at the accessor.

        if let Some(wf) = w_failure {
            let res = ShardResult::err(key.clone(), cause);
            let dispatch = Dispatch {
                res,
                waiter: wf.clone(),
            };
            if self.dispatch_failure_tx.send(dispatch).await.is_err() {
                tracing::warn!(shard = %key, "failure dispatch queue closed; dropping notification");
            }
        }

        true
    }

    async fn on_recover(this: &Arc<Self>, shard: &Arc<Shard>, s: &mut ShardInner, tsk: &Task) -> bool {
        let Some(w) = tsk.waiter.clone() else {
            tracing::warn!(shard = %shard.key(), "recover task without a waiter; ignoring");
            return true;
        };
        let key = shard.key().clone();

        match load_persisted(this.store.as_ref(), &key) {
            Ok(persisted) => s.reload_from(&persisted),
            Err(e) => {
                let err = Arc::new(Error::RecoverFailed(Arc::new(e)));
                this.dispatch_result(ShardResult::err(key, err), [w]).await;
                return false;
            }
        }

        if s.state != ShardState::Errored {
            let err = Arc::new(Error::RecoveryRefused(s.state.to_string()));
            this.dispatch_result(ShardResult::err(key, err), [w]).await;
            return true;
        }

        // Park the waiter, then fetch and reindex as in initialization.
        s.w_recover = Some(w.clone());
        s.state = ShardState::Initializing;
        s.err = None;

        tokio::spawn(Self::initialize_worker(
            Arc::clone(this),
            w.cancel.clone(),
            Arc::clone(shard),
            Arc::clone(&s.mount),
        ));
        true
    }

    async fn on_destroy(&self, shard: &Arc<Shard>, s: &mut ShardInner, tsk: &Task) -> bool {
        let key = shard.key().clone();

        if let Err(e) = self.store.delete(&shard_meta_key(&key)) {
            let err = Arc::new(Error::DeleteFailed {
                key: key.to_string(),
                cause: Arc::new(e),
            });
            if let Some(w) = &tsk.waiter {
                self.dispatch_result(ShardResult::err(key, err), [w.clone()])
                    .await;
            }
            return false;
        }

        if let Err(e) = self.indices.drop_full_index(key.as_str()) {
            tracing::warn!(shard = %key, error = %e, "failed to drop index of destroyed shard");
        }

        s.state = ShardState::Destroyed;
        s.err = None;
        self.shards.write().unwrap().remove(&key);

        if let Some(w) = &tsk.waiter {
            self.dispatch_result(ShardResult::ok(key), [w.clone()]).await;
        }

        // destroy never persists; the record has left the store
        false
    }

    // === workers ===

    /// Fetch the mount, build and store the full index, and report the
    /// outcome on the completion channel.
    async fn initialize_worker(
        this: Arc<Self>,
        cancel: CancellationToken,
        shard: Arc<Shard>,
        mount: Arc<dyn Mount>,
    ) {
        let key = shard.key().clone();

        if cancel.is_cancelled() {
            let err = Arc::new(Error::InitializationFailed(
                "initialization cancelled".into(),
            ));
            this.queue_completion(Task::failure(shard, err)).await;
            return;
        }

        let outcome = mount
            .fetch()
            .and_then(|bytes| ShardIndex::build(&bytes))
            .and_then(|index| this.indices.save_full_index(key.as_str(), &index));

        match outcome {
            Ok(()) => {
                this.queue_completion(Task::new(Op::MakeAvailable, shard))
                    .await;
            }
            Err(e) => {
                tracing::debug!(shard = %key, error = %e, "shard initialization failed");
                this.queue_completion(Task::failure(shard, Arc::new(e)))
                    .await;
            }
        }
    }

    /// Build an accessor for one acquirer and deliver it through the
    /// dispatcher. Physical failures stay with the acquirer; they do not
    /// feed back into the state machine.
    async fn acquire_worker(this: Arc<Self>, waiter: Waiter, shard: Arc<Shard>, mount: Arc<dyn Mount>) {
        let key = shard.key().clone();

        if waiter.cancel.is_cancelled() {
            tracing::debug!(shard = %key, "acquirer already cancelled; not building accessor");
            return;
        }

        let outcome: crate::Result<ShardAccessor> = (|| {
            let index = this.indices.get_full_index(key.as_str())?;
            let bytes = mount.fetch()?;
            Ok(ShardAccessor::new(key.clone(), bytes, index))
        })();

        let res = match outcome {
            Ok(accessor) => ShardResult::with_accessor(key, accessor),
            Err(e) => {
                let err = Arc::new(Error::AcquireFailed(Arc::new(e)));
                ShardResult::err(key, err)
            }
        };
        this.dispatch_result(res, [waiter]).await;
    }

    // === loop plumbing ===

    /// Queue a follow-up for the loop itself. Never blocks.
    pub(crate) fn queue_internal(&self, task: Task) {
        if self.internal_tx.send(task).is_err() {
            tracing::warn!("internal task queue closed; dropping task");
        }
    }

    /// Report a worker outcome. Quietly dropped after shutdown.
    pub(crate) async fn queue_completion(&self, task: Task) {
        if self.completion_tx.send(task).await.is_err() {
            tracing::debug!("completion channel closed; coordinator shut down");
        }
    }

    /// Synthesize a failure transition for a shard.
    fn fail_shard(&self, shard: &Arc<Shard>, err: Arc<Error>) {
        self.queue_internal(Task::failure(Arc::clone(shard), err));
    }

    /// Hand results to the dispatcher; one dispatch per waiter.
    async fn dispatch_result(&self, res: ShardResult, waiters: impl IntoIterator<Item = Waiter>) {
        for waiter in waiters {
            let dispatch = Dispatch {
                res: res.clone(),
                waiter,
            };
            if self.dispatch_tx.send(dispatch).await.is_err() {
                tracing::warn!(shard = %res.key, "dispatch queue closed; dropping result");
            }
        }
    }
}
