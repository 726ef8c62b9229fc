//! Multiplexes informer events into ordered watcher and reconciler pipelines

pub mod keyed_list;

use self::keyed_list::KeyedList;
use crate::informer::Informer;
use crate::policy::{RetryDequeuePolicy, RetryPolicy};
use crate::reconciler::{ReconcileRequest, Reconciler, State};
use crate::resource::{ResourceAction, ResourceObject};
use crate::scheduler::{
    arc_addr, invoke_reconciler, invoke_watcher, RetryEntry, RetryKey, RetryOutcome, RetryScheduler,
};
use crate::watcher::ResourceWatcher;
use crate::BoxError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors surfaced by the control API and the run loop.
#[derive(Debug, Error)]
pub enum Error {
    /// An empty kind was passed to one of the `add_*` operations.
    #[error("resourceKind cannot be empty")]
    EmptyResourceKind,
    /// `run` was called while an earlier `run` is still active.
    #[error("controller is already running")]
    AlreadyRunning,
    /// An informer's run loop returned an error; the first one wins.
    #[error("informer run failed: {0}")]
    InformerRunFailed(#[source] BoxError),
}

const DEFAULT_RETRY_TICKER_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning knobs for [`InformerController`]. Open for extension; everything
/// has a usable default.
#[derive(Clone)]
pub struct InformerControllerConfig {
    /// Consulted after a failed handler invocation to decide whether and when
    /// to retry. `None` disables retries: failed events are dropped.
    pub retry_policy: Option<RetryPolicy>,
    /// Consulted when a new event arrives for an object that has pending
    /// retries. `None` drops every pending retry for that object, treating
    /// any fresh event as superseding outstanding work; set a policy (such as
    /// [`crate::policy::opinionated_retry_dequeue_policy`]) for finer calls.
    pub retry_dequeue_policy: Option<RetryDequeuePolicy>,
    /// Interval of the ticker that drains due retries. Retries never fire
    /// earlier than their scheduled time, but may fire up to one interval
    /// late.
    pub retry_ticker_interval: Duration,
}

impl Default for InformerControllerConfig {
    fn default() -> Self {
        Self {
            retry_policy: None,
            retry_dequeue_policy: None,
            retry_ticker_interval: DEFAULT_RETRY_TICKER_INTERVAL,
        }
    }
}

/// Fans resource events from per-kind informers out to ordered lists of
/// watchers and reconcilers, retrying failed handler calls on a schedule.
///
/// Handlers and informers can be added and removed at any time, including
/// while the controller is running; dispatch works against a snapshot, so a
/// change takes effect on the next event. Cheap to clone; clones share all
/// state.
#[derive(Clone)]
pub struct InformerController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    watchers: RwLock<KeyedList<Arc<dyn ResourceWatcher>>>,
    reconcilers: RwLock<KeyedList<Arc<dyn Reconciler>>>,
    informers: RwLock<KeyedList<Arc<dyn Informer>>>,
    retries: RetryScheduler,
    retry_policy: Option<RetryPolicy>,
    retry_dequeue_policy: Option<RetryDequeuePolicy>,
    retry_ticker_interval: Duration,
    run_state: Mutex<Option<RunState>>,
}

struct RunState {
    stop: CancellationToken,
    err_tx: mpsc::UnboundedSender<BoxError>,
    tasks: JoinSet<()>,
    handle: Handle,
    /// (informer address, kind) pairs already started, so a binding is
    /// started exactly once even when `add_informer` races `run`.
    started: HashSet<(usize, String)>,
}

impl InformerController {
    #[must_use]
    pub fn new(config: InformerControllerConfig) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                watchers: RwLock::new(KeyedList::default()),
                reconcilers: RwLock::new(KeyedList::default()),
                informers: RwLock::new(KeyedList::default()),
                retries: RetryScheduler::default(),
                retry_policy: config.retry_policy,
                retry_dequeue_policy: config.retry_dequeue_policy,
                retry_ticker_interval: config.retry_ticker_interval,
                run_state: Mutex::new(None),
            }),
        }
    }

    /// Register a watcher for events on `kind`, appended after any watchers
    /// already registered for that kind.
    pub fn add_watcher(&self, watcher: Arc<dyn ResourceWatcher>, kind: &str) -> Result<(), Error> {
        if kind.is_empty() {
            return Err(Error::EmptyResourceKind);
        }
        self.inner.watchers.write().insert(kind, watcher);
        Ok(())
    }

    /// Remove `watcher` from `kind`, matching by identity. No-op if it was
    /// never added; later watchers shift left.
    pub fn remove_watcher(&self, watcher: &Arc<dyn ResourceWatcher>, kind: &str) {
        self.inner
            .watchers
            .write()
            .remove_where(kind, |registered| Arc::ptr_eq(registered, watcher));
    }

    /// Remove every watcher registered for `kind`.
    pub fn remove_all_watchers_for_resource(&self, kind: &str) {
        self.inner.watchers.write().remove_all(kind);
    }

    /// Register a reconciler for events on `kind`, appended after any
    /// reconcilers already registered for that kind.
    pub fn add_reconciler(&self, reconciler: Arc<dyn Reconciler>, kind: &str) -> Result<(), Error> {
        if kind.is_empty() {
            return Err(Error::EmptyResourceKind);
        }
        self.inner.reconcilers.write().insert(kind, reconciler);
        Ok(())
    }

    /// Remove `reconciler` from `kind`, matching by identity.
    pub fn remove_reconciler(&self, reconciler: &Arc<dyn Reconciler>, kind: &str) {
        self.inner
            .reconcilers
            .write()
            .remove_where(kind, |registered| Arc::ptr_eq(registered, reconciler));
    }

    /// Remove every reconciler registered for `kind`.
    pub fn remove_all_reconcilers_for_resource(&self, kind: &str) {
        self.inner.reconcilers.write().remove_all(kind);
    }

    /// Bind an informer to `kind`. If the controller is already running the
    /// informer is registered and started immediately; otherwise it starts
    /// with [`run`](Self::run).
    pub fn add_informer(&self, informer: Arc<dyn Informer>, kind: &str) -> Result<(), Error> {
        if kind.is_empty() {
            return Err(Error::EmptyResourceKind);
        }
        self.inner.informers.write().insert(kind, informer.clone());
        self.inner.start_if_running(kind, &informer);
        Ok(())
    }

    /// Run the controller until `stop` is cancelled.
    ///
    /// Starts the retry ticker and every bound informer on their own tasks,
    /// then blocks. On stop, all derived tokens are cancelled, informer
    /// tasks are awaited, and the first informer run error (if any) is
    /// returned.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), Error> {
        let child = stop.child_token();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        {
            let mut run_state = self.inner.run_state.lock();
            if run_state.is_some() {
                return Err(Error::AlreadyRunning);
            }
            let handle = Handle::current();
            let mut tasks = JoinSet::new();
            tasks.spawn_on(
                run_retry_ticker(
                    Arc::downgrade(&self.inner),
                    self.inner.retry_ticker_interval,
                    child.clone(),
                ),
                &handle,
            );
            *run_state = Some(RunState {
                stop: child.clone(),
                err_tx,
                tasks,
                handle,
                started: HashSet::new(),
            });
        }
        let bindings: Vec<(String, Arc<dyn Informer>)> = self
            .inner
            .informers
            .read()
            .iter()
            .map(|(kind, informer)| (kind.to_owned(), informer.clone()))
            .collect();
        for (kind, informer) in &bindings {
            self.inner.start_if_running(kind, informer);
        }
        debug!(informers = bindings.len(), "informer controller running");

        stop.cancelled().await;
        debug!("stop signal received, shutting down informer controller");
        let state = self.inner.run_state.lock().take();
        if let Some(mut state) = state {
            state.stop.cancel();
            while state.tasks.join_next().await.is_some() {}
        }
        match err_rx.try_recv() {
            Ok(error) => Err(Error::InformerRunFailed(error)),
            Err(_) => Ok(()),
        }
    }
}

impl ControllerInner {
    /// Register the dispatch handler with `informer` and start its run loop,
    /// if the controller is currently running and this binding has not been
    /// started yet.
    fn start_if_running(self: &Arc<Self>, kind: &str, informer: &Arc<dyn Informer>) {
        {
            let mut run_state = self.run_state.lock();
            let Some(state) = run_state.as_mut() else { return };
            if state.stop.is_cancelled() {
                return;
            }
            if !state.started.insert((arc_addr(informer), kind.to_owned())) {
                return;
            }
        }
        // Registration happens outside the lock: it calls into informer code.
        let dispatcher: Arc<dyn ResourceWatcher> = Arc::new(EventDispatcher {
            controller: Arc::downgrade(self),
            kind: kind.to_owned(),
        });
        if let Err(error) = informer.add_event_handler(dispatcher) {
            warn!(kind = kind, error = %error, "failed to register dispatch handler with informer");
            return;
        }
        let mut run_state = self.run_state.lock();
        let Some(state) = run_state.as_mut() else { return };
        let informer = informer.clone();
        let stop = state.stop.clone();
        let err_tx = state.err_tx.clone();
        let task_kind = kind.to_owned();
        let handle = state.handle.clone();
        state.tasks.spawn_on(
            async move {
                debug!(kind = task_kind.as_str(), "informer started");
                if let Err(error) = informer.run(stop).await {
                    warn!(kind = task_kind.as_str(), error = %error, "informer run returned error");
                    let _ = err_tx.send(error);
                }
                debug!(kind = task_kind.as_str(), "informer stopped");
            },
            &handle,
        );
    }

    /// Fan one informer event out to the kind's watchers and reconcilers.
    async fn handle_event(
        &self,
        kind: &str,
        ctx: CancellationToken,
        action: ResourceAction,
        old_object: Option<Arc<dyn ResourceObject>>,
        object: Arc<dyn ResourceObject>,
    ) {
        self.dequeue_superseded(kind, action, object.as_ref());
        let watchers = self.watchers.read().snapshot(kind);
        let reconcilers = self.reconcilers.read().snapshot(kind);
        debug!(
            kind = kind,
            action = %action,
            object = object.name(),
            watchers = watchers.len(),
            reconcilers = reconcilers.len(),
            "dispatching resource event"
        );
        for watcher in &watchers {
            if let Err(error) = invoke_watcher(watcher, ctx.clone(), action, old_object.as_ref(), &object).await {
                warn!(
                    kind = kind,
                    action = %action,
                    object = object.name(),
                    error = %error,
                    "watcher failed"
                );
                let key = RetryKey::watcher(kind, object.name(), watcher, action);
                let entry = RetryEntry::for_watcher(watcher.clone(), action, object.clone(), old_object.clone());
                self.schedule_failure(key, entry, error);
            }
        }
        for reconciler in &reconcilers {
            let request = ReconcileRequest {
                action,
                object: object.clone(),
                old_object: old_object.clone(),
                state: State::new(),
            };
            let key = RetryKey::reconciler(kind, object.name(), reconciler, action);
            match invoke_reconciler(reconciler, ctx.clone(), request).await {
                Ok(result) => {
                    if let Some(after) = result.requeue_after {
                        let entry = RetryEntry::for_reconciler(
                            reconciler.clone(),
                            action,
                            object.clone(),
                            old_object.clone(),
                        );
                        self.schedule_requeue(key, entry, after, result.state);
                    }
                }
                Err(error) => {
                    warn!(
                        kind = kind,
                        action = %action,
                        object = object.name(),
                        error = %error,
                        "reconciler failed"
                    );
                    let entry = RetryEntry::for_reconciler(
                        reconciler.clone(),
                        action,
                        object.clone(),
                        old_object.clone(),
                    );
                    self.schedule_failure(key, entry, error);
                }
            }
        }
    }

    /// Drop pending retries for this object that the new event obsoletes.
    fn dequeue_superseded(&self, kind: &str, new_action: ResourceAction, new_object: &dyn ResourceObject) {
        let removed = if let Some(policy) = &self.retry_dequeue_policy {
            self.retries.dequeue_matching(kind, new_object.name(), |entry| {
                policy(
                    new_action,
                    Some(new_object),
                    entry.action,
                    Some(entry.object.as_ref()),
                    entry.error.as_deref(),
                )
            })
        } else {
            self.retries.dequeue_matching(kind, new_object.name(), |_| true)
        };
        if removed > 0 {
            debug!(
                kind = kind,
                object = new_object.name(),
                removed = removed,
                "dequeued pending retries superseded by new event"
            );
        }
    }

    /// Consult the retry policy about a failed invocation and schedule the
    /// next attempt, or drop the event when the policy is exhausted.
    /// `entry.attempt` is the number of retries already performed.
    fn schedule_failure(&self, key: RetryKey, mut entry: RetryEntry, error: BoxError) {
        if self.stopping() {
            return;
        }
        let Some(policy) = &self.retry_policy else {
            debug!(
                kind = key.kind.as_str(),
                object = key.object_name.as_str(),
                "no retry policy configured, dropping failed event"
            );
            return;
        };
        match policy(error.as_ref(), entry.attempt) {
            Some(after) => {
                debug!(
                    kind = key.kind.as_str(),
                    object = key.object_name.as_str(),
                    attempt = entry.attempt,
                    after = ?after,
                    "scheduling retry"
                );
                entry.error = Some(error);
                entry.attempt += 1;
                entry.run_at = Instant::now() + after;
                self.retries.schedule(key, entry);
            }
            None => debug!(
                kind = key.kind.as_str(),
                object = key.object_name.as_str(),
                attempts = entry.attempt,
                "retry policy exhausted, dropping event"
            ),
        }
    }

    /// Schedule a reconciler re-invocation it asked for itself. The retry
    /// policy is not consulted: a requeue is requested work, not a failure.
    fn schedule_requeue(&self, key: RetryKey, mut entry: RetryEntry, after: Duration, state: State) {
        if self.stopping() {
            return;
        }
        debug!(
            kind = key.kind.as_str(),
            object = key.object_name.as_str(),
            after = ?after,
            "scheduling requested requeue"
        );
        entry.state = state;
        entry.error = None;
        entry.attempt += 1;
        entry.run_at = Instant::now() + after;
        self.retries.schedule(key, entry);
    }

    fn stopping(&self) -> bool {
        self.run_state
            .lock()
            .as_ref()
            .is_some_and(|state| state.stop.is_cancelled())
    }

    /// Invoke every due retry and reschedule or drop based on the outcome.
    async fn process_due_retries(&self, stop: &CancellationToken) {
        let due = self.retries.take_due(Instant::now());
        for (key, entry) in due {
            if stop.is_cancelled() {
                return;
            }
            let outcome = entry.invoke(stop.child_token()).await;
            match outcome {
                RetryOutcome::Done => debug!(
                    kind = key.kind.as_str(),
                    object = key.object_name.as_str(),
                    "retried handler succeeded"
                ),
                RetryOutcome::Failed(error) => self.schedule_failure(key, entry, error),
                RetryOutcome::Requeue { after, state } => self.schedule_requeue(key, entry, after, state),
            }
        }
    }
}

/// Ticker loop driving the retry store. Holds only a weak handle so a
/// dropped controller tears the loop down even without a stop signal.
async fn run_retry_ticker(controller: Weak<ControllerInner>, period: Duration, stop: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                let Some(controller) = controller.upgrade() else { break };
                controller.process_due_retries(&stop).await;
            }
        }
    }
    debug!("retry ticker stopped");
}

/// The handler the controller registers with each informer: forwards events
/// into `handle_event` for its kind. Holds a weak controller reference so
/// informers outliving the controller do not keep it alive.
struct EventDispatcher {
    controller: Weak<ControllerInner>,
    kind: String,
}

#[async_trait]
impl ResourceWatcher for EventDispatcher {
    async fn add(&self, ctx: CancellationToken, object: Arc<dyn ResourceObject>) -> Result<(), BoxError> {
        if let Some(controller) = self.controller.upgrade() {
            controller
                .handle_event(&self.kind, ctx, ResourceAction::Create, None, object)
                .await;
        }
        Ok(())
    }

    async fn update(
        &self,
        ctx: CancellationToken,
        old_object: Option<Arc<dyn ResourceObject>>,
        new_object: Arc<dyn ResourceObject>,
    ) -> Result<(), BoxError> {
        if let Some(controller) = self.controller.upgrade() {
            controller
                .handle_event(&self.kind, ctx, ResourceAction::Update, old_object, new_object)
                .await;
        }
        Ok(())
    }

    async fn delete(&self, ctx: CancellationToken, object: Arc<dyn ResourceObject>) -> Result<(), BoxError> {
        if let Some(controller) = self.controller.upgrade() {
            controller
                .handle_event(&self.kind, ctx, ResourceAction::Delete, None, object)
                .await;
        }
        Ok(())
    }
}
