//! Wall-clock pacing of a root scheduler.
//!
//! A [`RealTimePacer`] owns a root [`Scheduler`] and a speed factor. When
//! run in sync mode it sleeps after every step so that simulated time moves
//! at `speed` simulated seconds per real second. Integer and float steps
//! count as seconds; timestamp steps use their calendar distance.
//!
//! The wall-clock anchor is captured on the first step and is not part of
//! any checkpoint: a restored run re-anchors on its first step.
//!
//! The run loop is cooperative. It checks the [`TickObserver`] for a stop
//! request between steps and never interrupts a step in progress.

use std::time::Duration;

use cadence_types::{IntervalValue, StepValue};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ScheduleError;
use crate::scheduler::Scheduler;
use crate::step::StepOutcome;

/// Why a [`RealTimePacer::run`] loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEndReason {
    /// The root scheduler has no next step.
    Exhausted,
    /// The next step lies beyond the caller-supplied ceiling.
    CeilingReached,
    /// The observer asked the loop to stop.
    Stopped,
}

/// Result of a paced run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// The reason the run ended.
    pub end_reason: RunEndReason,
    /// Number of root steps executed by this run.
    pub ticks: u64,
    /// The root's current step when the run ended.
    pub final_step: StepValue,
    /// The root's next step when the run ended.
    pub next_step: Option<StepValue>,
}

/// Callback invoked after each paced step.
///
/// Implementations can checkpoint, report progress, or request a stop. The
/// observer receives the step outcome and mutable access to the scheduler.
pub trait TickObserver: Send {
    /// Called after a step completes successfully.
    fn on_tick(&mut self, outcome: &StepOutcome, scheduler: &mut Scheduler);

    /// Checked before every step; returning `true` ends the run.
    fn should_stop(&self) -> bool {
        false
    }
}

/// A tick observer that does nothing.
pub struct NoOpObserver;

impl TickObserver for NoOpObserver {
    fn on_tick(&mut self, _outcome: &StepOutcome, _scheduler: &mut Scheduler) {}
}

/// Paces a root scheduler against the wall clock.
#[derive(Debug)]
pub struct RealTimePacer {
    /// The root scheduler being paced.
    scheduler: Scheduler,

    /// Simulated seconds per real second. Always positive and finite.
    speed: f64,

    /// Wall-clock instant of the first step.
    real_anchor: Option<Instant>,

    /// Simulated step the root reached on the first step.
    sim_anchor: Option<StepValue>,
}

impl RealTimePacer {
    /// Wrap a root scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if `speed` is not a positive
    /// finite number.
    pub fn new(scheduler: Scheduler, speed: f64) -> Result<Self, ScheduleError> {
        validate_speed(speed)?;
        Ok(Self {
            scheduler,
            speed,
            real_anchor: None,
            sim_anchor: None,
        })
    }

    /// The root scheduler.
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The root scheduler, mutably.
    pub const fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Give back the root scheduler.
    pub fn into_scheduler(self) -> Scheduler {
        self.scheduler
    }

    /// Simulated seconds per real second.
    pub const fn speed(&self) -> f64 {
        self.speed
    }

    /// Change the speed. The wall-clock anchor is moved to now so the new
    /// speed applies from the current step onward.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if `speed` is not a positive
    /// finite number.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), ScheduleError> {
        validate_speed(speed)?;
        self.speed = speed;
        if self.real_anchor.is_some() {
            self.real_anchor = Some(Instant::now());
            self.sim_anchor = Some(*self.scheduler.node().current_step());
        }
        Ok(())
    }

    /// Real time a single step should take: the distance to the next step
    /// divided by the speed, or one interval when skip-step is enabled (the
    /// planned distance is not final until children have been stepped).
    /// `None` once the root is done.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the delay does not fit in a
    /// [`Duration`], which a very small speed can cause.
    pub fn step_delay(&self) -> Result<Option<Duration>, ScheduleError> {
        let node = self.scheduler.node();
        let Some(next) = node.next_step() else {
            return Ok(None);
        };
        let seconds = if self.scheduler.skip_step() {
            node.steps().interval().as_seconds()
        } else {
            next.seconds_since(node.current_step())?
        };
        real_duration(seconds / self.speed).map(Some)
    }

    /// Advance the root once without sleeping.
    ///
    /// The first successful call anchors the wall clock to the step it
    /// reached.
    ///
    /// # Errors
    ///
    /// Propagates [`ScheduleError`] from the scheduler.
    pub fn step(&mut self) -> Result<StepOutcome, ScheduleError> {
        let outcome = self.scheduler.step()?;
        if self.real_anchor.is_none() {
            self.real_anchor = Some(Instant::now());
            self.sim_anchor = Some(outcome.current_step);
        }
        Ok(outcome)
    }

    /// Advance the root once and, in sync mode, sleep until the wall clock
    /// catches up with the next simulated step.
    ///
    /// # Errors
    ///
    /// Propagates [`ScheduleError`] from the scheduler.
    pub async fn step_await(&mut self, sync: bool) -> Result<StepOutcome, ScheduleError> {
        let outcome = self.step()?;
        if sync {
            if let Some(wait) = self.sync_wait(&outcome)? {
                tokio::time::sleep(wait).await;
            }
        }
        Ok(outcome)
    }

    /// Step until the root is done, the next step passes `ceiling`, or the
    /// observer requests a stop.
    ///
    /// `ceiling` bounds this run only; the root's own `max_step` is not
    /// modified.
    ///
    /// # Errors
    ///
    /// Propagates the first [`ScheduleError`]. Steps completed before the
    /// failure are kept.
    pub async fn run<O>(
        &mut self,
        sync: bool,
        ceiling: Option<StepValue>,
        observer: &mut O,
    ) -> Result<RunSummary, ScheduleError>
    where
        O: TickObserver + ?Sized,
    {
        info!(
            root_id = %self.scheduler.node().id(),
            current_step = %self.scheduler.node().current_step(),
            speed = self.speed,
            sync,
            ceiling = ?ceiling,
            "Paced run starting"
        );

        let mut ticks: u64 = 0;
        let end_reason = loop {
            let Some(next) = self.scheduler.node().next_step().copied() else {
                break RunEndReason::Exhausted;
            };
            if let Some(ceiling) = &ceiling {
                if next.try_cmp(ceiling)?.is_gt() {
                    break RunEndReason::CeilingReached;
                }
            }
            if observer.should_stop() {
                break RunEndReason::Stopped;
            }

            let outcome = self.step_await(sync).await?;
            ticks = ticks.saturating_add(1);
            observer.on_tick(&outcome, &mut self.scheduler);
        };

        let summary = RunSummary {
            end_reason,
            ticks,
            final_step: *self.scheduler.node().current_step(),
            next_step: self.scheduler.node().next_step().copied(),
        };
        info!(
            reason = ?summary.end_reason,
            ticks = summary.ticks,
            final_step = %summary.final_step,
            "Paced run ended"
        );
        Ok(summary)
    }

    /// Real time since the first step.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::NotStarted`] if no step has run yet.
    pub fn total_real_time_elapsed(&self) -> Result<Duration, ScheduleError> {
        self.real_anchor
            .map(|anchor| anchor.elapsed())
            .ok_or(ScheduleError::NotStarted)
    }

    /// Simulated time since the root's initial step.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] on arithmetic overflow.
    pub fn total_time_elapsed(&self) -> Result<IntervalValue, ScheduleError> {
        self.scheduler.node().steps().elapsed()
    }

    /// How long to sleep after `outcome` so the next step starts on time.
    /// Logs a warning when the run is behind real time by at least one
    /// interval.
    fn sync_wait(&self, outcome: &StepOutcome) -> Result<Option<Duration>, ScheduleError> {
        let (Some(real_anchor), Some(sim_anchor)) = (self.real_anchor, self.sim_anchor) else {
            return Ok(None);
        };
        let Some(next) = outcome.next_step else {
            return Ok(None);
        };

        let real_elapsed = real_anchor.elapsed().as_secs_f64();
        let sim_elapsed = outcome.current_step.seconds_since(&sim_anchor)?;
        let behind = real_elapsed.mul_add(self.speed, -sim_elapsed);
        let interval = self.scheduler.node().steps().interval().as_seconds();
        if behind >= interval {
            warn!(
                current_step = %outcome.current_step,
                behind_seconds = behind,
                "Simulation is behind real time"
            );
        }

        let target = next.seconds_since(&sim_anchor)? / self.speed;
        let wait = target - real_elapsed;
        if wait > 0.0 {
            real_duration(wait).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Wall-clock duration of `seconds`, clamped at zero.
fn real_duration(seconds: f64) -> Result<Duration, ScheduleError> {
    Duration::try_from_secs_f64(seconds.max(0.0)).map_err(|err| ScheduleError::Validation {
        reason: format!("real-time delay of {seconds} s is out of range: {err}"),
    })
}

fn validate_speed(speed: f64) -> Result<(), ScheduleError> {
    if speed.is_finite() && speed > 0.0 {
        Ok(())
    } else {
        Err(ScheduleError::Validation {
            reason: format!("speed must be positive and finite, got {speed}"),
        })
    }
}
