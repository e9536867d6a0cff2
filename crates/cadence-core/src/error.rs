//! Error types for the scheduling kernel.
//!
//! All fallible stepping and pacing operations return [`ScheduleError`].
//! Attaching a child returns [`AttachError`], which hands the rejected child
//! back. Failed operations leave the target unchanged.

use cadence_types::{NodeId, StepValue, StepValueError};

use crate::node::Steppable;

/// Errors that can occur while building or advancing a scheduling tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    /// An interval, bound, or step value was rejected.
    #[error("validation error: {reason}")]
    Validation {
        /// Explanation of what is wrong with the value.
        reason: String,
    },

    /// `step` was called on a timeline that has already finished.
    #[error("timeline is done at step {current_step}")]
    TerminalState {
        /// The last step the timeline reached.
        current_step: StepValue,
    },

    /// A node identity rule was violated (duplicate id, missing parent).
    #[error("identity error for node {node_id}: {reason}")]
    Identity {
        /// The node the operation was about.
        node_id: NodeId,
        /// What went wrong.
        reason: String,
    },

    /// A wall-clock query was made before the first step.
    #[error("pacer has not executed any step yet")]
    NotStarted,
}

impl From<StepValueError> for ScheduleError {
    fn from(source: StepValueError) -> Self {
        Self::Validation {
            reason: source.to_string(),
        }
    }
}

/// A child the scheduler refused to attach, handed back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("child not attached: {source}")]
pub struct AttachError {
    /// The rejected child, exactly as it was passed in.
    pub child: Box<dyn Steppable>,
    /// Why it was rejected.
    pub source: ScheduleError,
}

impl From<AttachError> for ScheduleError {
    fn from(err: AttachError) -> Self {
        err.source
    }
}
