//! Schedulable nodes and the capability trait shared by every node kind.
//!
//! A [`ScheduleNode`] is the base building block of a scheduling tree: it
//! carries an identity, a [`StepState`] timeline, a private [`RngStream`],
//! and a non-owning reference to its parent. Domain entities embed a
//! `ScheduleNode` and implement [`Steppable`] to take part in a tree; a
//! [`Scheduler`] is itself a `Steppable` that owns further nodes.
//!
//! Persisted attributes are declared once in [`ScheduleNode::FIELDS`].

use std::path::{Path, PathBuf};

use cadence_types::{
    Field, FieldDescriptor, FieldError, FieldMap, FieldValue, IntervalValue, NodeId, StepValue,
};
use rand_chacha::ChaCha8Rng;
use tracing::trace;

use crate::error::ScheduleError;
use crate::rng::RngStream;
use crate::scheduler::Scheduler;
use crate::step::{StepOutcome, StepState};

/// Record kind name of a plain [`ScheduleNode`].
pub const SCHEDULE_NODE_KIND: &str = "ScheduleNode";

/// Clock of the parent handed to a child while it is stepped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParentClock {
    /// Identity of the parent.
    pub id: NodeId,
    /// Step the parent just moved to.
    pub current_step: StepValue,
    /// Step the parent will move to next, if any.
    pub next_step: Option<StepValue>,
}

/// Identity, timeline, and random stream of one schedulable entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleNode {
    /// Stable identity, unique within a tree.
    id: NodeId,

    /// The node's own timeline.
    steps: StepState,

    /// Private random stream.
    rng: RngStream,

    /// Owning scheduler, if attached.
    parent: Option<NodeId>,

    /// Position among the parent's children.
    index: Option<usize>,

    /// Checkpoint directory associated on first save.
    checkpoint_dir: Option<PathBuf>,
}

impl ScheduleNode {
    /// Persisted attributes of every node, in record order.
    pub const FIELDS: &'static [FieldDescriptor<Self>] = &[
        FieldDescriptor {
            name: "id",
            get: field_id,
        },
        FieldDescriptor {
            name: "initial_step",
            get: field_initial_step,
        },
        FieldDescriptor {
            name: "interval",
            get: field_interval,
        },
        FieldDescriptor {
            name: "max_step",
            get: field_max_step,
        },
        FieldDescriptor {
            name: "current_step",
            get: field_current_step,
        },
        FieldDescriptor {
            name: "next_step",
            get: field_next_step,
        },
        FieldDescriptor {
            name: "step_count",
            get: field_step_count,
        },
        FieldDescriptor {
            name: "rng_state",
            get: field_rng_state,
        },
        FieldDescriptor {
            name: "checkpoint_dir",
            get: field_checkpoint_dir,
        },
    ];

    /// Create a detached node with a fresh identity.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the timeline parameters are
    /// rejected by [`StepState::new`].
    pub fn new(
        initial_step: StepValue,
        interval: IntervalValue,
        max_step: Option<StepValue>,
        seed: Option<u64>,
    ) -> Result<Self, ScheduleError> {
        Ok(Self::from_state(
            NodeId::new(),
            StepState::new(initial_step, interval, max_step)?,
            RngStream::new(seed),
        ))
    }

    /// Assemble a detached node from existing parts.
    pub const fn from_state(id: NodeId, steps: StepState, rng: RngStream) -> Self {
        Self {
            id,
            steps,
            rng,
            parent: None,
            index: None,
            checkpoint_dir: None,
        }
    }

    /// Rebuild a detached node from decoded record fields.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if a field is missing, mistyped, or describes
    /// an invalid timeline.
    pub fn from_fields(fields: &FieldMap) -> Result<Self, FieldError> {
        let id = NodeId::parse(fields.str("id")?).map_err(|err| FieldError::Malformed {
            name: "id".to_owned(),
            reason: err.to_string(),
        })?;

        let steps = StepState::from_parts(
            fields.step("initial_step")?,
            fields.interval("interval")?,
            fields.optional_step("max_step")?,
            fields.step("current_step")?,
            fields.optional_step("next_step")?,
            fields.count("step_count")?,
        )
        .map_err(|err| FieldError::Malformed {
            name: "next_step".to_owned(),
            reason: err.to_string(),
        })?;

        let rng = RngStream::from_field_value("rng_state", fields.get("rng_state")?)?;

        let mut node = Self::from_state(id, steps, rng);
        if fields.contains("checkpoint_dir") {
            match fields.get("checkpoint_dir")? {
                FieldValue::Null => {}
                _ => node.checkpoint_dir = Some(fields.path("checkpoint_dir")?.to_path_buf()),
            }
        }
        Ok(node)
    }

    /// Overwrite identity, timeline, and stream from record fields while
    /// keeping the parent link.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if the fields do not describe a valid node, or
    /// [`FieldError::Malformed`] if they belong to another node. The node is
    /// unchanged on error.
    pub fn load_fields(&mut self, fields: &FieldMap) -> Result<(), FieldError> {
        let loaded = Self::from_fields(fields)?;
        if loaded.id != self.id {
            return Err(FieldError::Malformed {
                name: "id".to_owned(),
                reason: format!("record belongs to node {}, not {}", loaded.id, self.id),
            });
        }
        self.steps = loaded.steps;
        self.rng = loaded.rng;
        if loaded.checkpoint_dir.is_some() {
            self.checkpoint_dir = loaded.checkpoint_dir;
        }
        Ok(())
    }

    /// Evaluate [`ScheduleNode::FIELDS`] against this node.
    pub fn fields(&self) -> Vec<Field> {
        FieldDescriptor::collect(Self::FIELDS, self)
    }

    /// Advance as a root (no parent clock).
    ///
    /// # Errors
    ///
    /// Same as [`ScheduleNode::advance_under`].
    pub fn step(&mut self) -> Result<StepOutcome, ScheduleError> {
        self.advance_under(None)
    }

    /// Advance the timeline, never planning a next step before the parent's
    /// next step.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::TerminalState`] if the node is done, and
    /// [`ScheduleError::Validation`] on arithmetic failure.
    pub fn advance_under(
        &mut self,
        parent: Option<&ParentClock>,
    ) -> Result<StepOutcome, ScheduleError> {
        let floor = parent.and_then(|p| p.next_step.as_ref());
        let outcome = self.steps.advance(floor)?;
        trace!(
            node_id = %self.id,
            current_step = %outcome.current_step,
            done = outcome.done,
            "Node stepped"
        );
        Ok(outcome)
    }

    /// Stable identity.
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// The node's timeline.
    pub const fn steps(&self) -> &StepState {
        &self.steps
    }

    /// Mutable timeline, for schedulers adjusting their own plan.
    pub(crate) const fn steps_mut(&mut self) -> &mut StepState {
        &mut self.steps
    }

    /// Step the node is at now.
    pub const fn current_step(&self) -> &StepValue {
        self.steps.current_step()
    }

    /// Step the node moves to next, or `None` once done.
    pub const fn next_step(&self) -> Option<&StepValue> {
        self.steps.next_step()
    }

    /// Whether the node's timeline has ended.
    pub fn is_done(&self) -> bool {
        self.steps.is_done()
    }

    /// Replace the interval; see [`StepState::set_interval`].
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the interval is rejected.
    pub fn set_interval(&mut self, interval: IntervalValue) -> Result<(), ScheduleError> {
        self.steps.set_interval(interval)
    }

    /// Replace the bound; see [`StepState::set_max_step`].
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the bound is rejected.
    pub fn set_max_step(&mut self, max_step: Option<StepValue>) -> Result<(), ScheduleError> {
        self.steps.set_max_step(max_step)
    }

    /// The node's random stream.
    pub const fn rng_stream(&self) -> &RngStream {
        &self.rng
    }

    /// Generator for domain draws.
    pub const fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        self.rng.rng_mut()
    }

    /// Owning scheduler, if attached.
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Position among the parent's children.
    pub const fn index(&self) -> Option<usize> {
        self.index
    }

    /// Checkpoint directory associated with this node.
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        self.checkpoint_dir.as_deref()
    }

    /// Associate a checkpoint directory.
    pub fn set_checkpoint_dir(&mut self, dir: Option<PathBuf>) {
        self.checkpoint_dir = dir;
    }

    pub(crate) const fn attach(&mut self, parent: NodeId, index: usize) {
        self.parent = Some(parent);
        self.index = Some(index);
    }

    pub(crate) const fn set_index(&mut self, index: usize) {
        self.index = Some(index);
    }

    pub(crate) const fn detach(&mut self) {
        self.parent = None;
        self.index = None;
    }
}

fn field_id(node: &ScheduleNode) -> FieldValue {
    FieldValue::Str(node.id.to_string())
}

fn field_initial_step(node: &ScheduleNode) -> FieldValue {
    FieldValue::from_step(node.steps.initial_step())
}

fn field_interval(node: &ScheduleNode) -> FieldValue {
    FieldValue::from_interval(node.steps.interval())
}

fn field_max_step(node: &ScheduleNode) -> FieldValue {
    FieldValue::from_optional_step(node.steps.max_step())
}

fn field_current_step(node: &ScheduleNode) -> FieldValue {
    FieldValue::from_step(node.steps.current_step())
}

fn field_next_step(node: &ScheduleNode) -> FieldValue {
    FieldValue::from_optional_step(node.steps.next_step())
}

fn field_step_count(node: &ScheduleNode) -> FieldValue {
    FieldValue::from_count(node.steps.step_count())
}

fn field_rng_state(node: &ScheduleNode) -> FieldValue {
    node.rng.to_field_value()
}

fn field_checkpoint_dir(node: &ScheduleNode) -> FieldValue {
    node.checkpoint_dir
        .clone()
        .map_or(FieldValue::Null, FieldValue::Path)
}

// ---------------------------------------------------------------------------
// Steppable
// ---------------------------------------------------------------------------

/// Capability shared by every node in a scheduling tree.
///
/// Implementors embed a [`ScheduleNode`] and expose it through
/// [`Steppable::node`] and [`Steppable::node_mut`]. The defaults step the
/// embedded node and persist its [`ScheduleNode::FIELDS`]; domain types
/// override [`Steppable::step_under`] to run their own logic and extend
/// [`Steppable::record_fields`] / [`Steppable::load_fields`] with their own
/// state.
pub trait Steppable: Send + std::fmt::Debug {
    /// Record kind name used to find the constructor on restore.
    fn kind_name(&self) -> &'static str;

    /// The embedded node.
    fn node(&self) -> &ScheduleNode;

    /// The embedded node, mutably.
    fn node_mut(&mut self) -> &mut ScheduleNode;

    /// Advance one step under an optional parent clock.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] if the node cannot advance.
    fn step_under(&mut self, parent: Option<&ParentClock>) -> Result<StepOutcome, ScheduleError> {
        self.node_mut().advance_under(parent)
    }

    /// Every persisted attribute, node fields first.
    fn record_fields(&self) -> Vec<Field> {
        self.node().fields()
    }

    /// Restore persisted attributes.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if the fields do not describe this node.
    fn load_fields(&mut self, fields: &FieldMap) -> Result<(), FieldError> {
        self.node_mut().load_fields(fields)
    }

    /// This node as a scheduler, if it is one.
    fn as_scheduler(&self) -> Option<&Scheduler> {
        None
    }

    /// This node as a mutable scheduler, if it is one.
    fn as_scheduler_mut(&mut self) -> Option<&mut Scheduler> {
        None
    }

    /// Unwrap a boxed node that is exactly a [`Scheduler`], handing the box
    /// back otherwise. Used to pace a restored root.
    fn into_scheduler(self: Box<Self>) -> Result<Scheduler, Box<dyn Steppable>>;
}

impl Steppable for ScheduleNode {
    fn kind_name(&self) -> &'static str {
        SCHEDULE_NODE_KIND
    }

    fn node(&self) -> &ScheduleNode {
        self
    }

    fn node_mut(&mut self) -> &mut ScheduleNode {
        self
    }

    fn into_scheduler(self: Box<Self>) -> Result<Scheduler, Box<dyn Steppable>> {
        Err(self)
    }
}
