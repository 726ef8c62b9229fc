//! Convergence handlers that may request future work

use crate::resource::{ResourceAction, ResourceObject};
use crate::BoxError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Opaque state carried between reconcile attempts for the same event.
///
/// Whatever a reconcile returns in [`ReconcileResult::state`] is handed back
/// in [`ReconcileRequest::state`] on the next attempt, letting a reconciler
/// distinguish a first attempt from a retry.
pub type State = HashMap<String, serde_json::Value>;

/// A single piece of work handed to a [`Reconciler`].
#[derive(Clone)]
pub struct ReconcileRequest {
    pub action: ResourceAction,
    pub object: Arc<dyn ResourceObject>,
    /// Previous version of the object, present for update events when the
    /// informer supplies one.
    pub old_object: Option<Arc<dyn ResourceObject>>,
    /// Empty on the first attempt; carries [`ReconcileResult::state`] from
    /// the previous attempt on retries.
    pub state: State,
}

impl fmt::Debug for ReconcileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileRequest")
            .field("action", &self.action)
            .field("object", &self.object.name())
            .field("old_object", &self.old_object.as_ref().map(|o| o.name()))
            .field("state", &self.state)
            .finish()
    }
}

/// Outcome of a reconcile attempt.
#[derive(Debug, Clone, Default)]
pub struct ReconcileResult {
    /// State to hand to the next attempt, if one is scheduled.
    pub state: State,
    /// When set, the controller re-invokes the reconciler after (at least)
    /// this duration, even though the attempt succeeded.
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Result requesting re-invocation after (at least) `after`.
    #[must_use]
    pub fn requeue(after: Duration) -> Self {
        Self {
            state: State::new(),
            requeue_after: Some(after),
        }
    }

    #[must_use]
    pub fn with_state(mut self, state: State) -> Self {
        self.state = state;
        self
    }
}

/// Idempotent convergence step for one resource kind.
///
/// Unlike a watcher, a reconciler can deliberately request future work by
/// returning a [`ReconcileResult`] with `requeue_after` set; an error makes
/// the controller retry the request per its retry policy.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(
        &self,
        ctx: CancellationToken,
        request: ReconcileRequest,
    ) -> Result<ReconcileResult, BoxError>;
}

type ReconcileFn = Box<
    dyn Fn(CancellationToken, ReconcileRequest) -> BoxFuture<'static, Result<ReconcileResult, BoxError>>
        + Send
        + Sync,
>;

/// Closure-backed [`Reconciler`]. Without a registered closure every request
/// succeeds with the default result.
#[derive(Default)]
pub struct SimpleReconciler {
    reconcile_fn: Option<ReconcileFn>,
}

impl SimpleReconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_reconcile<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken, ReconcileRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReconcileResult, BoxError>> + Send + 'static,
    {
        self.reconcile_fn = Some(Box::new(move |ctx, request| f(ctx, request).boxed()));
        self
    }
}

#[async_trait]
impl Reconciler for SimpleReconciler {
    async fn reconcile(
        &self,
        ctx: CancellationToken,
        request: ReconcileRequest,
    ) -> Result<ReconcileResult, BoxError> {
        match &self.reconcile_fn {
            Some(f) => f(ctx, request).await,
            None => Ok(ReconcileResult::default()),
        }
    }
}
