//! Node constructors keyed by record kind.
//!
//! Restoring a tree needs to turn a record kind name back into a concrete
//! node type. A [`NodeRegistry`] maps each kind to a plain constructor
//! function that receives the decoded fields and the already restored
//! children. The registry is assembled at startup and passed to the
//! [`CheckpointStore`](crate::CheckpointStore) explicitly.

use std::collections::BTreeMap;
use std::fmt;

use cadence_core::node::SCHEDULE_NODE_KIND;
use cadence_core::scheduler::SCHEDULER_KIND;
use cadence_core::{ScheduleNode, Scheduler, Steppable};
use cadence_types::{FieldError, FieldMap};

/// Constructor for one node kind.
///
/// Receives the decoded fields (minus the `children` reference list) and
/// the restored children in their original order.
pub type NodeFactory =
    fn(&FieldMap, Vec<Box<dyn Steppable>>) -> Result<Box<dyn Steppable>, FieldError>;

/// Immutable map from record kind to constructor.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    factories: BTreeMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that knows the built-in `ScheduleNode` and `Scheduler`
    /// kinds.
    pub fn with_builtins() -> Self {
        Self::new()
            .with_kind(SCHEDULE_NODE_KIND, build_schedule_node)
            .with_kind(SCHEDULER_KIND, build_scheduler)
    }

    /// Add or replace the constructor for `kind`.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>, factory: NodeFactory) -> Self {
        self.factories.insert(kind.into(), factory);
        self
    }

    /// Constructor for `kind`, if registered.
    pub fn get(&self, kind: &str) -> Option<NodeFactory> {
        self.factories.get(kind).copied()
    }

    /// Whether `kind` has a constructor.
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Leaf constructor: a plain [`ScheduleNode`] has no children.
///
/// # Errors
///
/// Returns [`FieldError`] if the fields are invalid or children are given.
pub fn build_schedule_node(
    fields: &FieldMap,
    children: Vec<Box<dyn Steppable>>,
) -> Result<Box<dyn Steppable>, FieldError> {
    if !children.is_empty() {
        return Err(FieldError::Malformed {
            name: "children".to_owned(),
            reason: format!("{SCHEDULE_NODE_KIND} cannot own children"),
        });
    }
    Ok(Box::new(ScheduleNode::from_fields(fields)?))
}

/// Constructor for a plain [`Scheduler`].
///
/// # Errors
///
/// Returns [`FieldError`] if the fields are invalid.
pub fn build_scheduler(
    fields: &FieldMap,
    children: Vec<Box<dyn Steppable>>,
) -> Result<Box<dyn Steppable>, FieldError> {
    Ok(Box::new(Scheduler::from_fields(fields, children)?))
}
