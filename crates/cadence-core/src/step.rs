//! The timeline state machine of a single schedulable entity.
//!
//! A [`StepState`] tracks where an entity is on its own simulated timeline:
//! the step it started at, the step it is at now, the step it will move to
//! next, and an optional upper bound. The timeline is monotonic. Every
//! successful [`StepState::advance`] moves `current_step` strictly forward
//! and every value the state ever holds respects `max_step`.
//!
//! # Design Principles
//!
//! - All arithmetic is checked. Overflow and non-finite floats are
//!   validation errors, never wrapped.
//! - `done` is derived, never stored: the timeline is done exactly when no
//!   next step exists.
//! - A failed operation leaves the state untouched. New values are computed
//!   in full before anything is assigned.

use cadence_types::{IntervalValue, StepKind, StepValue};

use crate::error::ScheduleError;

/// Result of one successful advance of a timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// The step the timeline is at after advancing.
    pub current_step: StepValue,
    /// The step it will move to next, if any.
    pub next_step: Option<StepValue>,
    /// Whether the timeline has reached its end.
    pub done: bool,
}

/// Timeline of one entity: initial, current, next, and bounding steps.
#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
    /// Step the timeline started at.
    initial_step: StepValue,

    /// Distance between consecutive steps. Always positive.
    interval: IntervalValue,

    /// Inclusive upper bound, same kind as `initial_step`.
    max_step: Option<StepValue>,

    /// Step the timeline is at now.
    current_step: StepValue,

    /// Step the timeline moves to on the next advance. `None` once done.
    next_step: Option<StepValue>,

    /// Number of successful advances.
    step_count: u64,
}

impl StepState {
    /// Create a timeline at `initial_step`.
    ///
    /// The interval and bound are cast to the kind of `initial_step` (an
    /// integer interval on a float timeline becomes a float, on a timestamp
    /// timeline it becomes seconds). The first `next_step` is computed
    /// immediately and is `None` if one interval already exceeds the bound.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the interval is not positive,
    /// if a value cannot be cast to the timeline's kind, or if arithmetic
    /// overflows.
    pub fn new(
        initial_step: StepValue,
        interval: IntervalValue,
        max_step: Option<StepValue>,
    ) -> Result<Self, ScheduleError> {
        let kind = initial_step.kind();
        let interval = validate_interval(interval, kind)?;
        let max_step = max_step.map(|m| m.cast(kind)).transpose()?;

        let next_step = compute_next(&initial_step, &interval, max_step.as_ref(), None)?;

        Ok(Self {
            initial_step,
            interval,
            max_step,
            current_step: initial_step,
            next_step,
            step_count: 0,
        })
    }

    /// Rebuild a timeline from persisted parts.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the parts mix kinds, the
    /// interval is not positive, or `next_step` does not lie strictly after
    /// `current_step` within the bound.
    pub fn from_parts(
        initial_step: StepValue,
        interval: IntervalValue,
        max_step: Option<StepValue>,
        current_step: StepValue,
        next_step: Option<StepValue>,
        step_count: u64,
    ) -> Result<Self, ScheduleError> {
        let kind = initial_step.kind();
        let interval = validate_interval(interval, kind)?;
        let max_step = max_step.map(|m| m.cast(kind)).transpose()?;
        let current_step = current_step.cast(kind)?;
        let next_step = next_step.map(|n| n.cast(kind)).transpose()?;

        if let Some(next) = &next_step {
            if next.try_cmp(&current_step)?.is_le() {
                return Err(ScheduleError::Validation {
                    reason: format!("next step {next} must be after current step {current_step}"),
                });
            }
            if let Some(max) = &max_step {
                if next.try_cmp(max)?.is_gt() {
                    return Err(ScheduleError::Validation {
                        reason: format!("next step {next} exceeds max step {max}"),
                    });
                }
            }
        }

        Ok(Self {
            initial_step,
            interval,
            max_step,
            current_step,
            next_step,
            step_count,
        })
    }

    /// Step the timeline started at.
    pub const fn initial_step(&self) -> &StepValue {
        &self.initial_step
    }

    /// Step the timeline is at now.
    pub const fn current_step(&self) -> &StepValue {
        &self.current_step
    }

    /// Step the timeline moves to next, or `None` once done.
    pub const fn next_step(&self) -> Option<&StepValue> {
        self.next_step.as_ref()
    }

    /// Inclusive upper bound, if any.
    pub const fn max_step(&self) -> Option<&StepValue> {
        self.max_step.as_ref()
    }

    /// Distance between consecutive steps.
    pub const fn interval(&self) -> &IntervalValue {
        &self.interval
    }

    /// Number of successful advances.
    pub const fn step_count(&self) -> u64 {
        self.step_count
    }

    /// The kind shared by every value of this timeline.
    pub const fn kind(&self) -> StepKind {
        self.initial_step.kind()
    }

    /// Whether the timeline has reached its end.
    ///
    /// A timeline is done when no next step exists, which also covers a
    /// current step at or past the bound.
    pub fn is_done(&self) -> bool {
        match &self.next_step {
            None => true,
            Some(_) => self
                .max_step
                .as_ref()
                .is_some_and(|max| self.current_step >= *max),
        }
    }

    /// Advance without a floor. Equivalent to `advance(None)`.
    ///
    /// # Errors
    ///
    /// Same as [`StepState::advance`].
    pub fn step(&mut self) -> Result<StepOutcome, ScheduleError> {
        self.advance(None)
    }

    /// Move `current_step` to the previous `next_step` and compute a new
    /// `next_step`.
    ///
    /// The new next step is `current + interval`, raised to `floor` when a
    /// floor is given (a child never plans a step earlier than its parent's
    /// next step), then dropped to `None` if it exceeds the bound.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::TerminalState`] if the timeline is already
    /// done, and [`ScheduleError::Validation`] on arithmetic failure or if
    /// `floor` has another kind. The state is unchanged on error.
    pub fn advance(&mut self, floor: Option<&StepValue>) -> Result<StepOutcome, ScheduleError> {
        let current = match self.next_step {
            Some(next) if !self.is_done() => next,
            _ => {
                return Err(ScheduleError::TerminalState {
                    current_step: self.current_step,
                });
            }
        };

        let next = compute_next(&current, &self.interval, self.max_step.as_ref(), floor)?;
        let step_count = self
            .step_count
            .checked_add(1)
            .ok_or_else(|| ScheduleError::Validation {
                reason: "step counter overflow".to_owned(),
            })?;

        self.current_step = current;
        self.next_step = next;
        self.step_count = step_count;

        Ok(self.outcome())
    }

    /// Snapshot of the current position as an outcome.
    pub fn outcome(&self) -> StepOutcome {
        StepOutcome {
            current_step: self.current_step,
            next_step: self.next_step,
            done: self.is_done(),
        }
    }

    /// Replace the interval. The new interval applies from the next advance;
    /// the already planned `next_step` is kept.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the interval is not positive
    /// or cannot be cast to the timeline's kind.
    pub fn set_interval(&mut self, interval: IntervalValue) -> Result<(), ScheduleError> {
        self.interval = validate_interval(interval, self.kind())?;
        Ok(())
    }

    /// Replace the bound and re-clamp the planned next step.
    ///
    /// Lowering the bound below the planned next step ends the timeline.
    /// Raising the bound of a timeline that ended only because of the old
    /// bound plans a new next step from `current_step`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the bound cannot be cast to
    /// the timeline's kind or arithmetic fails.
    pub fn set_max_step(&mut self, max_step: Option<StepValue>) -> Result<(), ScheduleError> {
        let max_step = max_step.map(|m| m.cast(self.kind())).transpose()?;

        let next_step = match self.next_step {
            Some(next) => clamp(next, max_step.as_ref())?,
            None => compute_next(&self.current_step, &self.interval, max_step.as_ref(), None)?,
        };

        self.max_step = max_step;
        self.next_step = next_step;
        Ok(())
    }

    /// Distance travelled since `initial_step`.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] on arithmetic overflow.
    pub fn elapsed(&self) -> Result<IntervalValue, ScheduleError> {
        Ok(self.current_step.checked_sub(&self.initial_step)?)
    }

    /// Align a timeline that is joining a parent.
    ///
    /// `current_step` is raised to the parent's current step. If the planned
    /// next step no longer lies ahead, it is replanned from the raised
    /// current step with the parent's next step as floor.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if the parent's steps have
    /// another kind or arithmetic fails. The state is unchanged on error.
    pub fn rebase(
        &mut self,
        parent_current: &StepValue,
        parent_next: Option<&StepValue>,
    ) -> Result<(), ScheduleError> {
        let current = self.current_step.max_of(*parent_current)?;

        let next = match self.next_step {
            Some(next) if next.try_cmp(&current)?.is_gt() => Some(next),
            Some(_) => compute_next(&current, &self.interval, self.max_step.as_ref(), parent_next)?,
            None => None,
        };

        self.current_step = current;
        self.next_step = next;
        Ok(())
    }

    /// Push the planned next step forward to at least `target`, clamped to
    /// the bound. A done timeline stays done.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Validation`] if `target` has another kind.
    pub fn raise_next_to(&mut self, target: &StepValue) -> Result<(), ScheduleError> {
        if let Some(next) = self.next_step {
            let raised = next.max_of(*target)?;
            self.next_step = clamp(raised, self.max_step.as_ref())?;
        }
        Ok(())
    }
}

/// Cast `interval` to `kind` and require it to be strictly positive.
fn validate_interval(
    interval: IntervalValue,
    kind: StepKind,
) -> Result<IntervalValue, ScheduleError> {
    let interval = interval.cast(kind)?;
    if !interval.is_positive() {
        return Err(ScheduleError::Validation {
            reason: format!("interval must be positive, got {interval}"),
        });
    }
    Ok(interval)
}

/// `current + interval`, raised to `floor`, then clamped to `max`.
fn compute_next(
    current: &StepValue,
    interval: &IntervalValue,
    max: Option<&StepValue>,
    floor: Option<&StepValue>,
) -> Result<Option<StepValue>, ScheduleError> {
    let mut next = current.checked_add(interval)?;
    if let Some(floor) = floor {
        next = next.max_of(*floor)?;
    }
    clamp(next, max)
}

/// `None` if `step` lies beyond `max`.
fn clamp(step: StepValue, max: Option<&StepValue>) -> Result<Option<StepValue>, ScheduleError> {
    match max {
        Some(max) if step.try_cmp(max)?.is_gt() => Ok(None),
        _ => Ok(Some(step)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::{DateTime, TimeDelta};

    use super::*;

    fn int_state(initial: i64, interval: i64, max: Option<i64>) -> StepState {
        StepState::new(
            StepValue::Integer(initial),
            IntervalValue::Integer(interval),
            max.map(StepValue::Integer),
        )
        .unwrap()
    }

    #[test]
    fn new_plans_first_step() {
        let state = int_state(0, 1, Some(10));
        assert_eq!(state.current_step(), &StepValue::Integer(0));
        assert_eq!(state.next_step(), Some(&StepValue::Integer(1)));
        assert!(!state.is_done());
        assert_eq!(state.step_count(), 0);
    }

    #[test]
    fn rejects_non_positive_interval() {
        for interval in [0, -3] {
            let result = StepState::new(
                StepValue::Integer(0),
                IntervalValue::Integer(interval),
                None,
            );
            assert!(matches!(result, Err(ScheduleError::Validation { .. })));
        }
    }

    #[test]
    fn interval_is_cast_to_step_kind() {
        let state = StepState::new(StepValue::Float(0.5), IntervalValue::Integer(2), None).unwrap();
        assert_eq!(state.interval(), &IntervalValue::Float(2.0));
        assert_eq!(state.next_step(), Some(&StepValue::Float(2.5)));

        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let state =
            StepState::new(StepValue::Timestamp(start), IntervalValue::Integer(60), None).unwrap();
        assert_eq!(
            state.interval(),
            &IntervalValue::Duration(TimeDelta::seconds(60))
        );
    }

    #[test]
    fn runs_to_bound_and_then_refuses() {
        let mut state = int_state(0, 1, Some(10));
        for expected in 1..=10 {
            let outcome = state.step().unwrap();
            assert_eq!(outcome.current_step, StepValue::Integer(expected));
            assert_eq!(outcome.done, expected == 10);
        }
        assert!(state.is_done());
        assert_eq!(state.next_step(), None);

        let before = state.clone();
        let err = state.step().unwrap_err();
        assert!(matches!(err, ScheduleError::TerminalState { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn bound_not_on_grid_stops_before_it() {
        let mut state = int_state(0, 3, Some(10));
        let mut visited = Vec::new();
        while !state.is_done() {
            visited.push(state.step().unwrap().current_step);
        }
        assert_eq!(
            visited,
            vec![
                StepValue::Integer(3),
                StepValue::Integer(6),
                StepValue::Integer(9)
            ]
        );
    }

    #[test]
    fn interval_larger_than_bound_is_done_at_construction() {
        let state = int_state(0, 20, Some(10));
        assert!(state.is_done());
    }

    #[test]
    fn floor_raises_next_step() {
        let mut state = int_state(0, 1, None);
        let outcome = state.advance(Some(&StepValue::Integer(5))).unwrap();
        assert_eq!(outcome.current_step, StepValue::Integer(1));
        assert_eq!(outcome.next_step, Some(StepValue::Integer(5)));
    }

    #[test]
    fn floor_of_other_kind_leaves_state_untouched() {
        let mut state = int_state(0, 1, None);
        let before = state.clone();
        let err = state.advance(Some(&StepValue::Float(5.0))).unwrap_err();
        assert!(matches!(err, ScheduleError::Validation { .. }));
        assert_eq!(state, before);
    }

    #[test]
    fn overflow_is_validation_error() {
        let mut state = int_state(i64::MAX - 1, 1, None);
        let err = state.step().unwrap_err();
        assert!(matches!(err, ScheduleError::Validation { .. }));
        assert_eq!(state.current_step(), &StepValue::Integer(i64::MAX - 1));
    }

    #[test]
    fn lowering_bound_ends_timeline_and_raising_revives_it() {
        let mut state = int_state(0, 1, Some(10));
        state.step().unwrap();
        state.set_max_step(Some(StepValue::Integer(1))).unwrap();
        assert!(state.is_done());

        state.set_max_step(Some(StepValue::Integer(3))).unwrap();
        assert_eq!(state.next_step(), Some(&StepValue::Integer(2)));
    }

    #[test]
    fn rebase_raises_current_and_replans_next() {
        let mut state = int_state(0, 2, None);
        state
            .rebase(&StepValue::Integer(7), Some(&StepValue::Integer(8)))
            .unwrap();
        assert_eq!(state.current_step(), &StepValue::Integer(7));
        assert_eq!(state.next_step(), Some(&StepValue::Integer(9)));

        let mut ahead = int_state(20, 2, None);
        ahead
            .rebase(&StepValue::Integer(7), Some(&StepValue::Integer(8)))
            .unwrap();
        assert_eq!(ahead.current_step(), &StepValue::Integer(20));
        assert_eq!(ahead.next_step(), Some(&StepValue::Integer(22)));
    }

    #[test]
    fn raise_next_to_respects_bound() {
        let mut state = int_state(0, 1, Some(5));
        state.raise_next_to(&StepValue::Integer(4)).unwrap();
        assert_eq!(state.next_step(), Some(&StepValue::Integer(4)));
        state.raise_next_to(&StepValue::Integer(9)).unwrap();
        assert!(state.is_done());
    }

    #[test]
    fn from_parts_validates_ordering() {
        let result = StepState::from_parts(
            StepValue::Integer(0),
            IntervalValue::Integer(1),
            None,
            StepValue::Integer(5),
            Some(StepValue::Integer(5)),
            5,
        );
        assert!(matches!(result, Err(ScheduleError::Validation { .. })));
    }

    #[test]
    fn elapsed_tracks_distance_from_start() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut state = StepState::new(
            StepValue::Timestamp(start),
            IntervalValue::Duration(TimeDelta::minutes(15)),
            None,
        )
        .unwrap();
        state.step().unwrap();
        state.step().unwrap();
        assert_eq!(
            state.elapsed().unwrap(),
            IntervalValue::Duration(TimeDelta::minutes(30))
        );
    }
}
