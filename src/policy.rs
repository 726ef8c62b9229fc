//! Pluggable retry and dequeue decision functions, plus the stock policies

use crate::resource::{ResourceAction, ResourceObject};
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a failed handler invocation is retried, and after how long.
///
/// Consulted with the error and the number of retries already performed for
/// the event (`0` when the initial invocation fails). Returning `None` drops
/// the event.
pub type RetryPolicy = Arc<dyn Fn(&(dyn std::error::Error + Send + Sync), usize) -> Option<Duration> + Send + Sync>;

/// Decides whether a pending retry is obsoleted by a newer event for the
/// same object.
///
/// Arguments: the new event's action and object, then the pending retry's
/// action, object, and last error. Returning `true` removes the pending
/// retry.
pub type RetryDequeuePolicy = Arc<
    dyn Fn(
            ResourceAction,
            Option<&dyn ResourceObject>,
            ResourceAction,
            Option<&dyn ResourceObject>,
            Option<&(dyn std::error::Error + Send + Sync)>,
        ) -> bool
        + Send
        + Sync,
>;

/// Retry policy with exponentially growing delays.
///
/// The n-th retry (0-based) is delayed by `base * 2^n`, so
/// `exponential_backoff_retry_policy(Duration::from_secs(1), 5)` retries
/// after 1s, 2s, 4s, 8s, and 16s, then gives up.
#[must_use]
pub fn exponential_backoff_retry_policy(base: Duration, max_attempts: usize) -> RetryPolicy {
    Arc::new(move |_err, attempt| {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        (attempt < max_attempts).then(|| base.saturating_mul(2_u32.saturating_pow(exponent)))
    })
}

/// Retry policy with a constant delay and no attempt cap.
///
/// Mostly useful in tests and for callers that cap attempts with their own
/// predicate; unbounded retries of a permanently failing handler never stop.
#[must_use]
pub fn linear_retry_policy(delay: Duration) -> RetryPolicy {
    Arc::new(move |_err, _attempt| Some(delay))
}

/// Dequeue policy that cancels pending retries only when the new event makes
/// their work demonstrably obsolete.
///
/// A delete supersedes any outstanding work for the object. Otherwise a
/// pending retry survives unless the new event is for the same action and
/// carries a different generation (fresher desired state will be handled by
/// the new event itself). Events whose generation is unreadable keep the
/// pending retry: a change that did not bump the generation may be
/// subresource-only, and cancelling an in-flight retry for it would lose
/// work on the same revision.
pub fn opinionated_retry_dequeue_policy(
    new_action: ResourceAction,
    new_object: Option<&dyn ResourceObject>,
    pending_action: ResourceAction,
    pending_object: Option<&dyn ResourceObject>,
    _pending_error: Option<&(dyn std::error::Error + Send + Sync)>,
) -> bool {
    if new_action == ResourceAction::Delete {
        return true;
    }
    if new_action != pending_action {
        return false;
    }
    match (
        new_object.and_then(|o| o.generation()),
        pending_object.and_then(|o| o.generation()),
    ) {
        (Some(new_generation), Some(pending_generation)) => new_generation != pending_generation,
        _ => false,
    }
}
