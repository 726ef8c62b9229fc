//! Pending-retry store drained by the controller's fixed-interval ticker

use crate::reconciler::{ReconcileRequest, ReconcileResult, Reconciler, State};
use crate::resource::{ResourceAction, ResourceObject};
use crate::watcher::ResourceWatcher;
use crate::BoxError;
use futures::FutureExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which pipeline a retry entry re-invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum HandlerRole {
    Watcher,
    Reconciler,
}

/// Identity of a scheduled retry.
///
/// One slot exists per (kind, object, role, handler, action); scheduling the
/// same key again replaces the earlier entry with the latest one. Handler
/// identity is the address of the `Arc`'s allocation, so it stays stable
/// while the handler lists are mutated around it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RetryKey {
    pub(crate) kind: String,
    pub(crate) object_name: String,
    pub(crate) role: HandlerRole,
    pub(crate) handler: usize,
    pub(crate) action: ResourceAction,
}

impl RetryKey {
    pub(crate) fn watcher(
        kind: &str,
        object_name: &str,
        handler: &Arc<dyn ResourceWatcher>,
        action: ResourceAction,
    ) -> Self {
        Self {
            kind: kind.to_owned(),
            object_name: object_name.to_owned(),
            role: HandlerRole::Watcher,
            handler: arc_addr(handler),
            action,
        }
    }

    pub(crate) fn reconciler(
        kind: &str,
        object_name: &str,
        handler: &Arc<dyn Reconciler>,
        action: ResourceAction,
    ) -> Self {
        Self {
            kind: kind.to_owned(),
            object_name: object_name.to_owned(),
            role: HandlerRole::Reconciler,
            handler: arc_addr(handler),
            action,
        }
    }
}

/// Address of an `Arc`'s allocation, used as handler identity.
pub(crate) fn arc_addr<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc).cast::<()>() as usize
}

pub(crate) enum RetryTarget {
    Watcher(Arc<dyn ResourceWatcher>),
    Reconciler(Arc<dyn Reconciler>),
}

/// A failed (or requeued) handler invocation waiting to run again.
pub(crate) struct RetryEntry {
    pub(crate) target: RetryTarget,
    pub(crate) action: ResourceAction,
    pub(crate) object: Arc<dyn ResourceObject>,
    pub(crate) old_object: Option<Arc<dyn ResourceObject>>,
    /// Carried into the next `ReconcileRequest`; unused for watchers.
    pub(crate) state: State,
    /// Error from the most recent failed attempt, if the entry was scheduled
    /// by a failure rather than a requeue request.
    pub(crate) error: Option<BoxError>,
    /// 1 after the first failure; the initial invocation is attempt 0.
    pub(crate) attempt: usize,
    pub(crate) run_at: Instant,
}

impl RetryEntry {
    pub(crate) fn for_watcher(
        watcher: Arc<dyn ResourceWatcher>,
        action: ResourceAction,
        object: Arc<dyn ResourceObject>,
        old_object: Option<Arc<dyn ResourceObject>>,
    ) -> Self {
        Self {
            target: RetryTarget::Watcher(watcher),
            action,
            object,
            old_object,
            state: State::new(),
            error: None,
            attempt: 0,
            run_at: Instant::now(),
        }
    }

    pub(crate) fn for_reconciler(
        reconciler: Arc<dyn Reconciler>,
        action: ResourceAction,
        object: Arc<dyn ResourceObject>,
        old_object: Option<Arc<dyn ResourceObject>>,
    ) -> Self {
        Self {
            target: RetryTarget::Reconciler(reconciler),
            action,
            object,
            old_object,
            state: State::new(),
            error: None,
            attempt: 0,
            run_at: Instant::now(),
        }
    }

    /// Re-invoke the stored handler with the stored payloads.
    pub(crate) async fn invoke(&self, ctx: CancellationToken) -> RetryOutcome {
        match &self.target {
            RetryTarget::Watcher(watcher) => {
                match invoke_watcher(watcher, ctx, self.action, self.old_object.as_ref(), &self.object).await {
                    Ok(()) => RetryOutcome::Done,
                    Err(error) => RetryOutcome::Failed(error),
                }
            }
            RetryTarget::Reconciler(reconciler) => {
                let request = ReconcileRequest {
                    action: self.action,
                    object: self.object.clone(),
                    old_object: self.old_object.clone(),
                    state: self.state.clone(),
                };
                match invoke_reconciler(reconciler, ctx, request).await {
                    Ok(result) => match result.requeue_after {
                        Some(after) => RetryOutcome::Requeue {
                            after,
                            state: result.state,
                        },
                        None => RetryOutcome::Done,
                    },
                    Err(error) => RetryOutcome::Failed(error),
                }
            }
        }
    }
}

/// What happened when a retry entry ran.
pub(crate) enum RetryOutcome {
    Done,
    Failed(BoxError),
    Requeue { after: Duration, state: State },
}

struct Scheduled {
    seq: u64,
    entry: RetryEntry,
}

/// Set of pending retries, keyed by [`RetryKey`].
///
/// The store only holds and hands out entries; the controller's ticker task
/// drains due entries each tick and decides whether the outcome reschedules
/// them. Lock is held for map operations only, never across an invocation.
#[derive(Default)]
pub(crate) struct RetryScheduler {
    entries: Mutex<HashMap<RetryKey, Scheduled>>,
    seq: AtomicU64,
}

impl RetryScheduler {
    /// Insert an entry, replacing any pending entry with the same key.
    pub(crate) fn schedule(&self, key: RetryKey, entry: RetryEntry) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(key, Scheduled { seq, entry });
    }

    /// Remove and return every entry due at `now`, ordered by scheduled time
    /// and, within the same instant, by scheduling order. The second tiebreak
    /// keeps handler-list order intact when several handlers failed on the
    /// same event.
    pub(crate) fn take_due(&self, now: Instant) -> Vec<(RetryKey, RetryEntry)> {
        let mut due = Vec::new();
        {
            let mut entries = self.entries.lock();
            let keys: Vec<RetryKey> = entries
                .iter()
                .filter(|(_, scheduled)| scheduled.entry.run_at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(scheduled) = entries.remove(&key) {
                    due.push((scheduled.seq, key, scheduled.entry));
                }
            }
        }
        due.sort_by_key(|(seq, _, entry)| (entry.run_at, *seq));
        due.into_iter().map(|(_, key, entry)| (key, entry)).collect()
    }

    /// Remove pending entries for (kind, object) that `should_dequeue`
    /// marks obsolete; returns how many were removed.
    pub(crate) fn dequeue_matching(
        &self,
        kind: &str,
        object_name: &str,
        mut should_dequeue: impl FnMut(&RetryEntry) -> bool,
    ) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, scheduled| {
            !(key.kind == kind && key.object_name == object_name && should_dequeue(&scheduled.entry))
        });
        before - entries.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Invoke the watcher method matching `action`, converting panics into
/// ordinary handler errors so a misbehaving handler cannot take down the
/// dispatching task.
pub(crate) async fn invoke_watcher(
    watcher: &Arc<dyn ResourceWatcher>,
    ctx: CancellationToken,
    action: ResourceAction,
    old_object: Option<&Arc<dyn ResourceObject>>,
    object: &Arc<dyn ResourceObject>,
) -> Result<(), BoxError> {
    let call = async {
        match action {
            ResourceAction::Create => watcher.add(ctx, object.clone()).await,
            ResourceAction::Update => watcher.update(ctx, old_object.cloned(), object.clone()).await,
            ResourceAction::Delete => watcher.delete(ctx, object.clone()).await,
        }
    };
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic.as_ref()).into()),
    }
}

/// Invoke a reconciler, converting panics into ordinary handler errors.
pub(crate) async fn invoke_reconciler(
    reconciler: &Arc<dyn Reconciler>,
    ctx: CancellationToken,
    request: ReconcileRequest,
) -> Result<ReconcileResult, BoxError> {
    match AssertUnwindSafe(reconciler.reconcile(ctx, request)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic.as_ref()).into()),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_owned()
    }
}
