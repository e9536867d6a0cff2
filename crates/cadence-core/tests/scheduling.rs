//! Integration tests for hierarchical scheduling in `cadence-core`.
//!
//! These drive small trees through the public API only and check the
//! timeline guarantees: children tick on their own grid, never run ahead of
//! their parent, never pass their bound, and skip-step never drops a tick
//! that a child needed.

// Integration tests use expect/unwrap extensively for clarity -- panicking
// on failure is the correct behavior in test code.
#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::indexing_slicing
)]

use std::sync::{Arc, Mutex};

use cadence_core::{ParentClock, ScheduleError, ScheduleNode, Scheduler, StepOutcome, Steppable};
use cadence_types::{IntervalValue, NodeId, StepValue};
use rand::RngCore;

/// One observed child step: child id, step reached, parent's current step.
type Visit = (NodeId, StepValue, StepValue);

/// A leaf that reports every step it takes to a shared log.
#[derive(Debug)]
struct Recorder {
    node: ScheduleNode,
    log: Arc<Mutex<Vec<Visit>>>,
}

impl Recorder {
    fn boxed(interval: i64, max: Option<i64>, log: &Arc<Mutex<Vec<Visit>>>) -> Box<Self> {
        Box::new(Self {
            node: ScheduleNode::new(
                StepValue::Integer(0),
                IntervalValue::Integer(interval),
                max.map(StepValue::Integer),
                Some(7),
            )
            .unwrap(),
            log: Arc::clone(log),
        })
    }
}

impl Steppable for Recorder {
    fn kind_name(&self) -> &'static str {
        "Recorder"
    }

    fn node(&self) -> &ScheduleNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ScheduleNode {
        &mut self.node
    }

    fn step_under(&mut self, parent: Option<&ParentClock>) -> Result<StepOutcome, ScheduleError> {
        let outcome = self.node.advance_under(parent)?;
        let parent_current = parent.map_or(outcome.current_step, |p| p.current_step);
        self.log
            .lock()
            .unwrap()
            .push((self.node.id(), outcome.current_step, parent_current));
        Ok(outcome)
    }

    fn into_scheduler(self: Box<Self>) -> Result<Scheduler, Box<dyn Steppable>> {
        Err(self)
    }
}

fn new_log() -> Arc<Mutex<Vec<Visit>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn visits_of(log: &Arc<Mutex<Vec<Visit>>>, id: NodeId) -> Vec<StepValue> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(child, _, _)| *child == id)
        .map(|(_, step, _)| *step)
        .collect()
}

fn ints(values: &[i64]) -> Vec<StepValue> {
    values.iter().copied().map(StepValue::Integer).collect()
}

#[test]
fn two_children_on_their_own_grids() {
    let mut root = Scheduler::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        Some(StepValue::Integer(10)),
        Some(1),
        false,
    )
    .unwrap();
    let log = new_log();
    root.add_child(Recorder::boxed(3, None, &log)).unwrap();
    root.add_child(Recorder::boxed(5, None, &log)).unwrap();
    let ids = root.child_ids();

    let mut done_at = Vec::new();
    while !root.node().is_done() {
        let outcome = root.step().unwrap();
        if outcome.done {
            done_at.push(outcome.current_step);
        }
    }

    assert_eq!(done_at, ints(&[10]));
    assert_eq!(visits_of(&log, ids[0]), ints(&[3, 6, 9]));
    assert_eq!(visits_of(&log, ids[1]), ints(&[5, 10]));
}

#[test]
fn done_root_refuses_to_step_and_keeps_state() {
    let mut root = Scheduler::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        Some(StepValue::Integer(3)),
        None,
        false,
    )
    .unwrap();
    for _ in 0..3 {
        root.step().unwrap();
    }
    let before = root.node().clone();
    assert!(matches!(
        root.step(),
        Err(ScheduleError::TerminalState { .. })
    ));
    assert_eq!(root.node(), &before);
}

#[test]
fn timelines_are_monotonic_and_bounded() {
    let mut root = Scheduler::new(
        StepValue::Integer(0),
        IntervalValue::Integer(2),
        Some(StepValue::Integer(41)),
        Some(3),
        true,
    )
    .unwrap();
    let log = new_log();
    for interval in [3, 4, 7] {
        root.add_child(Recorder::boxed(interval, Some(30), &log)).unwrap();
    }

    let mut previous = *root.node().current_step();
    while !root.node().is_done() {
        let outcome = root.step().unwrap();
        assert!(outcome.current_step > previous);
        assert!(outcome.current_step <= StepValue::Integer(41));
        if let Some(next) = outcome.next_step {
            assert!(next > outcome.current_step);
            assert!(next <= StepValue::Integer(41));
        }
        previous = outcome.current_step;
    }

    for child in root.children() {
        assert!(*child.node().current_step() <= StepValue::Integer(30));
        assert!(*child.node().current_step() <= previous);
    }
    for (_, step, parent_current) in log.lock().unwrap().iter() {
        assert!(step <= parent_current);
    }
}

#[test]
fn skip_step_visits_every_step_a_child_needs() {
    let log = new_log();
    let build = |skip_step: bool| {
        let mut root = Scheduler::new(
            StepValue::Integer(0),
            IntervalValue::Integer(1),
            Some(StepValue::Integer(60)),
            Some(11),
            skip_step,
        )
        .unwrap();
        root.add_child(Recorder::boxed(7, None, &log)).unwrap();
        root.add_child(Recorder::boxed(12, None, &log)).unwrap();
        root
    };

    let mut dense = build(false);
    let mut sparse = build(true);
    let mut dense_ticks = 0_u32;
    let mut sparse_ticks = 0_u32;
    while !dense.node().is_done() {
        dense.step().unwrap();
        dense_ticks = dense_ticks.saturating_add(1);
    }
    while !sparse.node().is_done() {
        sparse.step().unwrap();
        sparse_ticks = sparse_ticks.saturating_add(1);
    }

    assert!(sparse_ticks < dense_ticks);
    for (a, b) in dense.children().zip(sparse.children()) {
        assert_eq!(a.node().steps().step_count(), b.node().steps().step_count());
        assert_eq!(a.node().current_step(), b.node().current_step());
    }
}

#[test]
fn children_draw_from_private_streams() {
    let mut a = ScheduleNode::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        None,
        Some(5),
    )
    .unwrap();
    let mut b = a.clone();
    let mut c = ScheduleNode::new(
        StepValue::Integer(0),
        IntervalValue::Integer(1),
        None,
        Some(6),
    )
    .unwrap();

    let x = a.rng_mut().next_u64();
    assert_eq!(x, b.rng_mut().next_u64());
    assert_ne!(x, c.rng_mut().next_u64());
}
