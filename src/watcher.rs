//! Event sinks that react to resource changes with side effects

use crate::resource::ResourceObject;
use crate::BoxError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Handler for resource-change events on a single kind.
///
/// Watchers express side effects that must succeed: a returned error makes
/// the controller re-invoke the same method for the same payload later,
/// subject to its retry policy.
#[async_trait]
pub trait ResourceWatcher: Send + Sync {
    /// Called when an object is first observed.
    async fn add(&self, ctx: CancellationToken, object: Arc<dyn ResourceObject>) -> Result<(), BoxError>;

    /// Called when an object changes. `old_object` may be unavailable
    /// depending on the informer.
    async fn update(
        &self,
        ctx: CancellationToken,
        old_object: Option<Arc<dyn ResourceObject>>,
        new_object: Arc<dyn ResourceObject>,
    ) -> Result<(), BoxError>;

    /// Called when an object is removed.
    async fn delete(&self, ctx: CancellationToken, object: Arc<dyn ResourceObject>) -> Result<(), BoxError>;
}

type WatchFn =
    Box<dyn Fn(CancellationToken, Arc<dyn ResourceObject>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
type UpdateFn = Box<
    dyn Fn(
            CancellationToken,
            Option<Arc<dyn ResourceObject>>,
            Arc<dyn ResourceObject>,
        ) -> BoxFuture<'static, Result<(), BoxError>>
        + Send
        + Sync,
>;

/// Closure-backed [`ResourceWatcher`].
///
/// Actions without a registered closure succeed without doing anything, so a
/// watcher that only cares about deletes needs nothing but `on_delete`.
#[derive(Default)]
pub struct SimpleWatcher {
    add_fn: Option<WatchFn>,
    update_fn: Option<UpdateFn>,
    delete_fn: Option<WatchFn>,
}

impl SimpleWatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_add<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken, Arc<dyn ResourceObject>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.add_fn = Some(Box::new(move |ctx, object| f(ctx, object).boxed()));
        self
    }

    #[must_use]
    pub fn on_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken, Option<Arc<dyn ResourceObject>>, Arc<dyn ResourceObject>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.update_fn = Some(Box::new(move |ctx, old_object, new_object| {
            f(ctx, old_object, new_object).boxed()
        }));
        self
    }

    #[must_use]
    pub fn on_delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(CancellationToken, Arc<dyn ResourceObject>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.delete_fn = Some(Box::new(move |ctx, object| f(ctx, object).boxed()));
        self
    }
}

#[async_trait]
impl ResourceWatcher for SimpleWatcher {
    async fn add(&self, ctx: CancellationToken, object: Arc<dyn ResourceObject>) -> Result<(), BoxError> {
        match &self.add_fn {
            Some(f) => f(ctx, object).await,
            None => Ok(()),
        }
    }

    async fn update(
        &self,
        ctx: CancellationToken,
        old_object: Option<Arc<dyn ResourceObject>>,
        new_object: Arc<dyn ResourceObject>,
    ) -> Result<(), BoxError> {
        match &self.update_fn {
            Some(f) => f(ctx, old_object, new_object).await,
            None => Ok(()),
        }
    }

    async fn delete(&self, ctx: CancellationToken, object: Arc<dyn ResourceObject>) -> Result<(), BoxError> {
        match &self.delete_fn {
            Some(f) => f(ctx, object).await,
            None => Ok(()),
        }
    }
}
