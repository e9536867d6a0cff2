//! Tick observer that saves the tree every N root ticks.
//!
//! A failed save stops the paced run at the next tick boundary instead of
//! letting the simulation drift ahead of its last good checkpoint. The
//! failure is handed back to `main` through [`CheckpointObserver::take_failure`].

use std::path::PathBuf;
use std::sync::Arc;

use cadence_checkpoint::{CheckpointError, CheckpointStore};
use cadence_core::{Scheduler, StepOutcome, TickObserver};
use tracing::{debug, error};

/// Pushes the root scheduler to its checkpoint directory on a fixed tick
/// cadence.
pub struct CheckpointObserver {
    store: Arc<CheckpointStore>,
    dir: PathBuf,
    every_ticks: u64,
    since_save: u64,
    saves: u64,
    failure: Option<CheckpointError>,
}

impl CheckpointObserver {
    /// Save to `dir` every `every_ticks` ticks; `0` disables periodic saves.
    pub const fn new(store: Arc<CheckpointStore>, dir: PathBuf, every_ticks: u64) -> Self {
        Self {
            store,
            dir,
            every_ticks,
            since_save: 0,
            saves: 0,
            failure: None,
        }
    }

    /// Number of periodic saves completed.
    pub const fn saves(&self) -> u64 {
        self.saves
    }

    /// The save error that stopped the run, if any.
    pub const fn take_failure(&mut self) -> Option<CheckpointError> {
        self.failure.take()
    }
}

impl TickObserver for CheckpointObserver {
    fn on_tick(&mut self, outcome: &StepOutcome, scheduler: &mut Scheduler) {
        self.since_save = self.since_save.saturating_add(1);
        if self.every_ticks == 0 || self.since_save < self.every_ticks {
            return;
        }
        match self.store.push(scheduler, Some(&self.dir)) {
            Ok(_) => {
                self.since_save = 0;
                self.saves = self.saves.saturating_add(1);
                debug!(
                    step = %outcome.current_step,
                    saves = self.saves,
                    "Periodic checkpoint saved"
                );
            }
            Err(e) => {
                error!(step = %outcome.current_step, error = %e, "Periodic checkpoint failed");
                self.failure = Some(e);
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.failure.is_some()
    }
}
