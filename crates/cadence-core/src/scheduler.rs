//! Schedulers: nodes that own and step child nodes.
//!
//! A [`Scheduler`] embeds its own [`ScheduleNode`] and owns an ordered list
//! of children. On every step it advances its own timeline first, then
//! steps each child that is due at the new current step, in insertion
//! order. A child is due when it is not done and its planned next step is
//! at or before the scheduler's current step.
//!
//! With skip-step enabled the scheduler jumps straight to the earliest step
//! any child needs, so idle stretches of the timeline are never visited.
//! Children are stepped with a [`ParentClock`] so they never plan a step
//! earlier than their parent's next step.

use cadence_types::{Field, FieldError, FieldMap, FieldValue, IntervalValue, NodeId, StepValue};
use tracing::debug;

use crate::error::{AttachError, ScheduleError};
use crate::node::{ParentClock, ScheduleNode, Steppable};
use crate::step::StepOutcome;

/// Record kind name of a plain [`Scheduler`].
pub const SCHEDULER_KIND: &str = "Scheduler";

/// A node that owns an ordered list of child nodes and steps the due ones.
#[derive(Debug)]
pub struct Scheduler {
    /// The scheduler's own node.
    node: ScheduleNode,

    /// Owned children, in insertion order.
    children: Vec<Box<dyn Steppable>>,

    /// Whether idle steps are skipped.
    skip_step: bool,
}

impl Scheduler {
    /// Create a detached scheduler with no children.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the timeline parameters are
    /// rejected.
    pub fn new(
        initial_step: StepValue,
        interval: IntervalValue,
        max_step: Option<StepValue>,
        seed: Option<u64>,
        skip_step: bool,
    ) -> Result<Self, ScheduleError> {
        Ok(Self::from_node(
            ScheduleNode::new(initial_step, interval, max_step, seed)?,
            skip_step,
        ))
    }

    /// Wrap an existing node as a scheduler with no children.
    pub const fn from_node(node: ScheduleNode, skip_step: bool) -> Self {
        Self {
            node,
            children: Vec::new(),
            skip_step,
        }
    }

    /// Rebuild a scheduler from decoded record fields and restored children.
    ///
    /// Children are reattached as-is, without aligning their clocks.
    ///
    /// # Errors
    ///
    /// Returns [`FieldError`] if the fields are invalid or two children
    /// share an identity.
    pub fn from_fields(
        fields: &FieldMap,
        children: Vec<Box<dyn Steppable>>,
    ) -> Result<Self, FieldError> {
        let mut scheduler = Self::from_node(
            ScheduleNode::from_fields(fields)?,
            fields.bool("skip_step")?,
        );
        for child in children {
            scheduler
                .reattach_child(child)
                .map_err(|err| FieldError::Malformed {
                    name: "children".to_owned(),
                    reason: err.to_string(),
                })?;
        }
        Ok(scheduler)
    }

    /// Advance as a root scheduler.
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::step_under`].
    pub fn step(&mut self) -> Result<StepOutcome, ScheduleError> {
        self.step_under(None)
    }

    /// Advance the scheduler and every due child.
    ///
    /// The scheduler's own timeline moves first. Children are then checked
    /// in insertion order against the new current step and stepped under
    /// this scheduler's clock. With skip-step enabled, the next step is
    /// finally raised to the earliest next step among the children.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::TerminalState`] if the scheduler is done and
    /// propagates the first child error. Children stepped before a failing
    /// child keep their new state.
    pub fn step_under(
        &mut self,
        parent: Option<&ParentClock>,
    ) -> Result<StepOutcome, ScheduleError> {
        let own = self.node.advance_under(parent)?;
        let clock = self.clock();

        let mut stepped: usize = 0;
        for child in &mut self.children {
            if is_due(child.node(), &own.current_step)? {
                child.step_under(Some(&clock))?;
                stepped = stepped.saturating_add(1);
            }
        }

        if self.skip_step {
            self.apply_skip_step()?;
        }

        let outcome = self.node.steps().outcome();
        debug!(
            node_id = %self.node.id(),
            current_step = %outcome.current_step,
            next_step = ?outcome.next_step,
            stepped,
            children = self.children.len(),
            "Scheduler stepped"
        );
        Ok(outcome)
    }

    /// This scheduler's clock as seen by its children.
    pub fn clock(&self) -> ParentClock {
        ParentClock {
            id: self.node.id(),
            current_step: *self.node.current_step(),
            next_step: self.node.next_step().copied(),
        }
    }

    /// The scheduler's own node.
    pub const fn node(&self) -> &ScheduleNode {
        &self.node
    }

    /// The scheduler's own node, mutably.
    pub const fn node_mut(&mut self) -> &mut ScheduleNode {
        &mut self.node
    }

    /// Whether idle steps are skipped.
    pub const fn skip_step(&self) -> bool {
        self.skip_step
    }

    /// Enable or disable skip-step here and in every nested scheduler.
    pub fn set_skip_step(&mut self, skip_step: bool) {
        self.skip_step = skip_step;
        for child in &mut self.children {
            if let Some(scheduler) = child.as_scheduler_mut() {
                scheduler.set_skip_step(skip_step);
            }
        }
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// Whether the scheduler has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Direct children in insertion order.
    pub fn children(&self) -> impl Iterator<Item = &dyn Steppable> {
        self.children.iter().map(|child| &**child)
    }

    /// Direct children in insertion order, mutably.
    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn Steppable>> {
        self.children.iter_mut()
    }

    /// Identities of the direct children, in insertion order.
    pub fn child_ids(&self) -> Vec<NodeId> {
        self.children.iter().map(|c| c.node().id()).collect()
    }

    /// Whether `id` is a direct child.
    pub fn contains(&self, id: NodeId) -> bool {
        self.position(id).is_some()
    }

    /// Direct child with identity `id`.
    pub fn child(&self, id: NodeId) -> Option<&dyn Steppable> {
        self.children
            .iter()
            .find(|c| c.node().id() == id)
            .map(|child| &**child)
    }

    /// Direct child with identity `id`, mutably.
    pub fn child_mut(&mut self, id: NodeId) -> Option<&mut Box<dyn Steppable>> {
        self.children.iter_mut().find(|c| c.node().id() == id)
    }

    /// Attach a child and align its clock with this scheduler.
    ///
    /// The child's current step is raised to this scheduler's current step
    /// and its next step replanned if it no longer lies ahead. A nested
    /// scheduler inherits this scheduler's skip-step setting.
    ///
    /// # Errors
    ///
    /// Returns an [`AttachError`] holding the untouched child and
    /// [`ScheduleError::Identity`] if the id is already a child (or is this
    /// scheduler's own id), or [`ScheduleError::Validation`] if the child's
    /// timeline has another kind. Nothing is attached on error.
    pub fn add_child(&mut self, mut child: Box<dyn Steppable>) -> Result<(), AttachError> {
        if let Err(source) = self.check_new_child(child.node().id()) {
            return Err(AttachError { child, source });
        }
        if let Err(source) = child
            .node_mut()
            .steps_mut()
            .rebase(self.node.current_step(), self.node.next_step())
        {
            return Err(AttachError { child, source });
        }
        if let Some(scheduler) = child.as_scheduler_mut() {
            scheduler.set_skip_step(self.skip_step);
        }

        self.push_child(child);
        Ok(())
    }

    /// Attach several children in order, stopping at the first failure.
    /// Children attached before the failure stay attached and the rejected
    /// one comes back in the error. Children after it are dropped with the
    /// iterator.
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::add_child`].
    pub fn add_children<I>(&mut self, children: I) -> Result<(), AttachError>
    where
        I: IntoIterator<Item = Box<dyn Steppable>>,
    {
        for child in children {
            self.add_child(child)?;
        }
        Ok(())
    }

    /// Attach a restored child without touching its clock.
    ///
    /// # Errors
    ///
    /// Returns an [`AttachError`] holding the child and
    /// [`ScheduleError::Identity`] on a duplicate id.
    pub fn reattach_child(&mut self, child: Box<dyn Steppable>) -> Result<(), AttachError> {
        if let Err(source) = self.check_new_child(child.node().id()) {
            return Err(AttachError { child, source });
        }
        self.push_child(child);
        Ok(())
    }

    /// Detach and return the child with identity `id`. Remaining children
    /// keep their relative order and are reindexed.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Identity`] if `id` is not a direct child.
    pub fn remove_child(&mut self, id: NodeId) -> Result<Box<dyn Steppable>, ScheduleError> {
        let position = self.position(id).ok_or_else(|| ScheduleError::Identity {
            node_id: id,
            reason: format!("not a child of scheduler {}", self.node.id()),
        })?;

        let mut child = self.children.remove(position);
        child.node_mut().detach();
        for (index, sibling) in self.children.iter_mut().enumerate().skip(position) {
            sibling.node_mut().set_index(index);
        }
        Ok(child)
    }

    /// Detach several children.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Identity`] for the first id that is not a
    /// direct child. Children removed before it stay removed.
    pub fn remove_children(
        &mut self,
        ids: &[NodeId],
    ) -> Result<Vec<Box<dyn Steppable>>, ScheduleError> {
        ids.iter().map(|id| self.remove_child(*id)).collect()
    }

    /// Detach and return every child, in order.
    pub fn take_children(&mut self) -> Vec<Box<dyn Steppable>> {
        let mut children = std::mem::take(&mut self.children);
        for child in &mut children {
            child.node_mut().detach();
        }
        children
    }

    /// Siblings of `node`, i.e. every child of this scheduler except `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Identity`] if `node` has no parent or its
    /// parent is not this scheduler.
    pub fn other_children<'a>(
        &'a self,
        node: &ScheduleNode,
    ) -> Result<impl Iterator<Item = &'a dyn Steppable> + use<'a>, ScheduleError> {
        match node.parent() {
            Some(parent) if parent == self.node.id() => {}
            Some(_) => {
                return Err(ScheduleError::Identity {
                    node_id: node.id(),
                    reason: format!("parent is not scheduler {}", self.node.id()),
                });
            }
            None => {
                return Err(ScheduleError::Identity {
                    node_id: node.id(),
                    reason: "node has no parent".to_owned(),
                });
            }
        }
        let id = node.id();
        Ok(self
            .children
            .iter()
            .filter(move |c| c.node().id() != id)
            .map(|child| &**child))
    }

    /// Persisted attributes: node fields plus the skip-step flag.
    pub fn fields(&self) -> Vec<Field> {
        let mut fields = self.node.fields();
        fields.push(Field::new("skip_step", FieldValue::Bool(self.skip_step)));
        fields
    }

    fn check_new_child(&self, id: NodeId) -> Result<(), ScheduleError> {
        if id == self.node.id() {
            return Err(ScheduleError::Identity {
                node_id: id,
                reason: "a scheduler cannot be its own child".to_owned(),
            });
        }
        if self.contains(id) {
            return Err(ScheduleError::Identity {
                node_id: id,
                reason: format!("already a child of scheduler {}", self.node.id()),
            });
        }
        Ok(())
    }

    fn push_child(&mut self, mut child: Box<dyn Steppable>) {
        child.node_mut().attach(self.node.id(), self.children.len());
        self.children.push(child);
    }

    fn position(&self, id: NodeId) -> Option<usize> {
        self.children.iter().position(|c| c.node().id() == id)
    }

    /// Raise the next step to the earliest next step among the children.
    /// Leaves the plan alone when no child has a next step.
    fn apply_skip_step(&mut self) -> Result<(), ScheduleError> {
        let mut earliest: Option<StepValue> = None;
        for child in &self.children {
            if let Some(next) = child.node().next_step() {
                earliest = Some(match earliest {
                    Some(current) if current.try_cmp(next)?.is_le() => current,
                    _ => *next,
                });
            }
        }
        if let Some(target) = earliest {
            self.node.steps_mut().raise_next_to(&target)?;
        }
        Ok(())
    }
}

/// A child is due when it is not done and its next step is at or before
/// `current`.
fn is_due(child: &ScheduleNode, current: &StepValue) -> Result<bool, ScheduleError> {
    if child.is_done() {
        return Ok(false);
    }
    match child.next_step() {
        Some(next) => Ok(next.try_cmp(current)?.is_le()),
        None => Ok(false),
    }
}

impl Steppable for Scheduler {
    fn kind_name(&self) -> &'static str {
        SCHEDULER_KIND
    }

    fn node(&self) -> &ScheduleNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ScheduleNode {
        &mut self.node
    }

    fn step_under(&mut self, parent: Option<&ParentClock>) -> Result<StepOutcome, ScheduleError> {
        Self::step_under(self, parent)
    }

    fn record_fields(&self) -> Vec<Field> {
        self.fields()
    }

    fn load_fields(&mut self, fields: &FieldMap) -> Result<(), FieldError> {
        let skip_step = fields.bool("skip_step")?;
        self.node.load_fields(fields)?;
        self.skip_step = skip_step;
        Ok(())
    }

    fn as_scheduler(&self) -> Option<&Scheduler> {
        Some(self)
    }

    fn as_scheduler_mut(&mut self) -> Option<&mut Scheduler> {
        Some(self)
    }

    fn into_scheduler(self: Box<Self>) -> Result<Scheduler, Box<dyn Steppable>> {
        Ok(*self)
    }
}
