//! Hierarchical discrete-time scheduling kernel for Cadence.
//!
//! This crate owns simulated time. Every schedulable entity embeds a
//! [`StepState`] and an [`RngStream`] inside a [`ScheduleNode`]; a
//! [`Scheduler`] is a node that owns an ordered list of child nodes and
//! decides which of them are due on each tick. A [`RealTimePacer`] wraps a
//! root scheduler and paces its ticks against the wall clock.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `cadence-config.yaml` into
//!   strongly-typed structs.
//! - [`error`] -- [`ScheduleError`], the error type of every stepping operation.
//! - [`node`] -- [`ScheduleNode`] and the [`Steppable`] capability trait.
//! - [`pacer`] -- Wall-clock pacing of a root scheduler.
//! - [`rng`] -- Per-node seeded random streams with exact state capture.
//! - [`scheduler`] -- Child ownership, due-set computation, and skip-step.
//! - [`step`] -- The single-entity timeline state machine.
//!
//! The kernel is single-threaded and synchronous: a `step` runs to
//! completion before it returns, and `&mut self` rules out reentrancy.

pub mod config;
pub mod error;
pub mod node;
pub mod pacer;
pub mod rng;
pub mod scheduler;
pub mod step;

pub use error::{AttachError, ScheduleError};
pub use node::{ParentClock, ScheduleNode, Steppable};
pub use pacer::{NoOpObserver, RealTimePacer, RunEndReason, RunSummary, TickObserver};
pub use rng::{RngState, RngStream};
pub use scheduler::Scheduler;
pub use step::{StepOutcome, StepState};
