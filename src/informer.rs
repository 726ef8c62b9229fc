//! Per-kind resource event sources

use crate::watcher::ResourceWatcher;
use crate::BoxError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A source of resource-change events for one resource kind.
///
/// The controller registers its dispatch handler via `add_event_handler`
/// and then drives `run` on a dedicated task until the stop token fires.
/// How events are produced (watch connections, polling, replays) is the
/// informer's business.
#[async_trait]
pub trait Informer: Send + Sync {
    /// Register a handler to be invoked for every event this informer
    /// produces. Informers are expected to support multiple handlers.
    fn add_event_handler(&self, handler: Arc<dyn ResourceWatcher>) -> Result<(), BoxError>;

    /// Produce events until `stop` is cancelled.
    ///
    /// A returned error is surfaced by the controller's run loop after
    /// shutdown; transient event-delivery problems should be handled
    /// internally instead.
    async fn run(&self, stop: CancellationToken) -> Result<(), BoxError>;
}
