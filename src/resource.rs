//! Opaque resource carriers and the actions that can happen to them

use serde::{Deserialize, Serialize};
use std::fmt;

/// A resource object flowing through the controller.
///
/// The controller treats objects as opaque: it only needs a cluster-unique
/// name to identify pending work for the same object, and (optionally) a
/// generation so dequeue policies can tell stale work from fresh state.
pub trait ResourceObject: Send + Sync + 'static {
    /// Cluster-unique name of the object.
    fn name(&self) -> &str;

    /// Revision of the object's desired state, monotonically increasing when
    /// the desired state changes. `None` when the field is not available.
    fn generation(&self) -> Option<i64> {
        None
    }
}

/// The kind of change an informer observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAction::Create => f.write_str("create"),
            ResourceAction::Update => f.write_str("update"),
            ResourceAction::Delete => f.write_str("delete"),
        }
    }
}

/// Minimal [`ResourceObject`] implementation, useful as a payload in tests
/// and for callers whose objects carry no more than identity and revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleObject {
    pub name: String,
    pub generation: Option<i64>,
}

impl SimpleObject {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: None,
        }
    }

    #[must_use]
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }
}

impl ResourceObject for SimpleObject {
    fn name(&self) -> &str {
        &self.name
    }

    fn generation(&self) -> Option<i64> {
        self.generation
    }
}
