//! Runtime building blocks for informer-driven controllers
//!
//! This crate contains the dispatch core for controllers that react to
//! resource-change events: per-kind [`Informer`]s feed an
//! [`InformerController`], which fans each event out to insertion-ordered
//! lists of [`ResourceWatcher`]s and [`Reconciler`]s, schedules retries for
//! failed handler invocations, and drops pending retries that fresher events
//! have made obsolete.
//!
//! Retry and dequeue behavior are plain function values (see [`policy`]),
//! so callers can swap the stock policies for their own without any trait
//! machinery.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
// Handler and policy boundaries traffic in boxed errors on purpose.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod controller;
pub mod informer;
pub mod policy;
pub mod reconciler;
pub mod resource;
mod scheduler;
pub mod watcher;

pub use controller::{Error, InformerController, InformerControllerConfig};
pub use informer::Informer;
pub use policy::{
    exponential_backoff_retry_policy, linear_retry_policy, opinionated_retry_dequeue_policy,
    RetryDequeuePolicy, RetryPolicy,
};
pub use reconciler::{ReconcileRequest, ReconcileResult, Reconciler, SimpleReconciler, State};
pub use resource::{ResourceAction, ResourceObject, SimpleObject};
pub use watcher::{ResourceWatcher, SimpleWatcher};

/// Boxed error produced by watchers, reconcilers, and informers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
