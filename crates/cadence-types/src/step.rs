//! Step positions and intervals.
//!
//! A [`StepValue`] is a position on a node's simulated timeline and an
//! [`IntervalValue`] is the distance between two positions. Both come in
//! three concrete kinds that never mix:
//!
//! | [`StepKind`]  | step             | interval         |
//! |---------------|------------------|------------------|
//! | `Integer`     | `i64`            | `i64`            |
//! | `Float`       | `f64`            | `f64`            |
//! | `Timestamp`   | `DateTime<Utc>`  | `TimeDelta`      |
//!
//! Arithmetic is checked: overflow and non-finite floats are errors, never
//! silently wrapped or propagated.

use core::cmp::Ordering;
use core::fmt;

use chrono::{DateTime, TimeDelta, Utc};

/// Microseconds in one second, used for timestamp and duration conversions.
const MICROS_PER_SECOND: f64 = 1_000_000.0;

/// Errors from step arithmetic, comparison, and casting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepValueError {
    /// Two values of different kinds were combined.
    #[error("step kind mismatch: expected {expected}, found {found}")]
    KindMismatch {
        /// The kind the operation required.
        expected: StepKind,
        /// The kind that was supplied.
        found: StepKind,
    },

    /// Integer or timestamp arithmetic left the representable range.
    #[error("step arithmetic overflow")]
    Overflow,

    /// A float operand or result was NaN or infinite.
    #[error("non-finite float step value")]
    NonFinite,

    /// A value could not be converted to the requested kind.
    #[error("cannot cast {value} to {target}: {reason}")]
    InvalidCast {
        /// Text form of the rejected value.
        value: String,
        /// The kind that was requested.
        target: StepKind,
        /// Why the conversion is not possible.
        reason: String,
    },
}

/// The concrete representation shared by a step and its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Whole-number ticks.
    Integer,
    /// Fractional ticks (commonly seconds).
    Float,
    /// Wall-calendar instants with duration intervals.
    Timestamp,
}

impl StepKind {
    /// Symbolic name used in configuration and checkpoint records.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Timestamp => "timestamp",
        }
    }

    /// Parse a symbolic kind name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "integer" | "int" => Some(Self::Integer),
            "float" => Some(Self::Float),
            "timestamp" | "datetime" => Some(Self::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepValue
// ---------------------------------------------------------------------------

/// A position on a simulated timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepValue {
    /// Integer tick.
    Integer(i64),
    /// Floating point tick.
    Float(f64),
    /// Calendar instant.
    Timestamp(DateTime<Utc>),
}

impl StepValue {
    /// Return the kind of this value.
    pub const fn kind(&self) -> StepKind {
        match self {
            Self::Integer(_) => StepKind::Integer,
            Self::Float(_) => StepKind::Float,
            Self::Timestamp(_) => StepKind::Timestamp,
        }
    }

    /// Add an interval of the matching kind.
    ///
    /// # Errors
    ///
    /// Returns [`StepValueError::KindMismatch`] if the interval kind differs,
    /// [`StepValueError::Overflow`] on integer/timestamp overflow, and
    /// [`StepValueError::NonFinite`] if a float result is not finite.
    pub fn checked_add(&self, interval: &IntervalValue) -> Result<Self, StepValueError> {
        match (self, interval) {
            (Self::Integer(step), IntervalValue::Integer(delta)) => step
                .checked_add(*delta)
                .map(Self::Integer)
                .ok_or(StepValueError::Overflow),
            (Self::Float(step), IntervalValue::Float(delta)) => {
                let sum = step + delta;
                if sum.is_finite() {
                    Ok(Self::Float(sum))
                } else {
                    Err(StepValueError::NonFinite)
                }
            }
            (Self::Timestamp(step), IntervalValue::Duration(delta)) => step
                .checked_add_signed(*delta)
                .map(Self::Timestamp)
                .ok_or(StepValueError::Overflow),
            _ => Err(StepValueError::KindMismatch {
                expected: self.kind(),
                found: interval.kind(),
            }),
        }
    }

    /// Distance from `earlier` to `self` as an interval of the matching kind.
    ///
    /// # Errors
    ///
    /// Returns [`StepValueError::KindMismatch`] if the kinds differ and
    /// [`StepValueError::Overflow`] if the distance is not representable.
    pub fn checked_sub(&self, earlier: &Self) -> Result<IntervalValue, StepValueError> {
        match (self, earlier) {
            (Self::Integer(a), Self::Integer(b)) => a
                .checked_sub(*b)
                .map(IntervalValue::Integer)
                .ok_or(StepValueError::Overflow),
            (Self::Float(a), Self::Float(b)) => {
                let diff = a - b;
                if diff.is_finite() {
                    Ok(IntervalValue::Float(diff))
                } else {
                    Err(StepValueError::NonFinite)
                }
            }
            (Self::Timestamp(a), Self::Timestamp(b)) => {
                Ok(IntervalValue::Duration(a.signed_duration_since(*b)))
            }
            _ => Err(StepValueError::KindMismatch {
                expected: self.kind(),
                found: earlier.kind(),
            }),
        }
    }

    /// Seconds from `earlier` to `self`; integer and float steps count as
    /// seconds, timestamps use their calendar distance.
    ///
    /// # Errors
    ///
    /// Same as [`StepValue::checked_sub`].
    pub fn seconds_since(&self, earlier: &Self) -> Result<f64, StepValueError> {
        self.checked_sub(earlier).map(|interval| interval.as_seconds())
    }

    /// Compare two values of the same kind.
    ///
    /// # Errors
    ///
    /// Returns [`StepValueError::KindMismatch`] if the kinds differ, and
    /// [`StepValueError::NonFinite`] if a float operand is NaN.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering, StepValueError> {
        if self.kind() != other.kind() {
            return Err(StepValueError::KindMismatch {
                expected: self.kind(),
                found: other.kind(),
            });
        }
        self.partial_cmp(other).ok_or(StepValueError::NonFinite)
    }

    /// Return the later of two same-kind values (`self` on ties).
    ///
    /// # Errors
    ///
    /// Same as [`StepValue::try_cmp`].
    pub fn max_of(self, other: Self) -> Result<Self, StepValueError> {
        Ok(match self.try_cmp(&other)? {
            Ordering::Less => other,
            Ordering::Equal | Ordering::Greater => self,
        })
    }

    /// Convert this value to another kind.
    ///
    /// Integer to float is always allowed. Float to integer requires an
    /// integral value. Numbers become timestamps as unix seconds. Timestamps
    /// never become numbers.
    ///
    /// # Errors
    ///
    /// Returns [`StepValueError::InvalidCast`] if the conversion would lose
    /// information or is not defined.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn cast(self, target: StepKind) -> Result<Self, StepValueError> {
        let invalid = |reason: &str| StepValueError::InvalidCast {
            value: self.to_string(),
            target,
            reason: reason.to_owned(),
        };
        match (self, target) {
            (Self::Integer(_), StepKind::Integer)
            | (Self::Float(_), StepKind::Float)
            | (Self::Timestamp(_), StepKind::Timestamp) => Ok(self),
            (Self::Integer(v), StepKind::Float) => Ok(Self::Float(v as f64)),
            (Self::Float(v), StepKind::Integer) => {
                if !v.is_finite() || v.fract() != 0.0 {
                    return Err(invalid("value is not integral"));
                }
                if v < i64::MIN as f64 || v > i64::MAX as f64 {
                    return Err(invalid("value is out of integer range"));
                }
                Ok(Self::Integer(v as i64))
            }
            (Self::Integer(secs), StepKind::Timestamp) => DateTime::from_timestamp(secs, 0)
                .map(Self::Timestamp)
                .ok_or_else(|| invalid("unix seconds out of range")),
            (Self::Float(secs), StepKind::Timestamp) => {
                if !secs.is_finite() {
                    return Err(invalid("value is not finite"));
                }
                let micros = (secs * MICROS_PER_SECOND).round();
                if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
                    return Err(invalid("unix seconds out of range"));
                }
                DateTime::from_timestamp_micros(micros as i64)
                    .map(Self::Timestamp)
                    .ok_or_else(|| invalid("unix seconds out of range"))
            }
            (Self::Timestamp(_), StepKind::Integer | StepKind::Float) => {
                Err(invalid("timestamps do not convert to numeric steps"))
            }
        }
    }
}

impl PartialOrd for StepValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for StepValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

// ---------------------------------------------------------------------------
// IntervalValue
// ---------------------------------------------------------------------------

/// Distance between two step positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IntervalValue {
    /// Integer ticks.
    Integer(i64),
    /// Fractional ticks.
    Float(f64),
    /// Calendar duration, paired with timestamp steps.
    Duration(TimeDelta),
}

impl IntervalValue {
    /// The step kind this interval can be added to.
    pub const fn kind(&self) -> StepKind {
        match self {
            Self::Integer(_) => StepKind::Integer,
            Self::Float(_) => StepKind::Float,
            Self::Duration(_) => StepKind::Timestamp,
        }
    }

    /// Whether the interval moves time strictly forward.
    pub fn is_positive(&self) -> bool {
        match self {
            Self::Integer(v) => *v > 0,
            Self::Float(v) => v.is_finite() && *v > 0.0,
            Self::Duration(v) => *v > TimeDelta::zero(),
        }
    }

    /// Length of the interval in seconds (integer and float ticks count as
    /// seconds).
    #[allow(clippy::cast_precision_loss)]
    pub fn as_seconds(&self) -> f64 {
        match self {
            Self::Integer(v) => *v as f64,
            Self::Float(v) => *v,
            Self::Duration(v) => v
                .num_microseconds()
                .map_or_else(|| v.num_seconds() as f64, |us| us as f64 / MICROS_PER_SECOND),
        }
    }

    /// Build a duration from (fractional) seconds at microsecond precision.
    ///
    /// # Errors
    ///
    /// Returns [`StepValueError::NonFinite`] for NaN/infinite input and
    /// [`StepValueError::Overflow`] if the duration is not representable.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn duration_from_seconds(seconds: f64) -> Result<TimeDelta, StepValueError> {
        if !seconds.is_finite() {
            return Err(StepValueError::NonFinite);
        }
        let micros = (seconds * MICROS_PER_SECOND).round();
        if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
            return Err(StepValueError::Overflow);
        }
        Ok(TimeDelta::microseconds(micros as i64))
    }

    /// Convert this interval to the interval kind of `target`.
    ///
    /// Integer to float is always allowed, float to integer requires an
    /// integral value, and numbers become durations as seconds.
    ///
    /// # Errors
    ///
    /// Returns [`StepValueError::InvalidCast`] if the conversion is lossy or
    /// undefined.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn cast(self, target: StepKind) -> Result<Self, StepValueError> {
        let invalid = |reason: &str| StepValueError::InvalidCast {
            value: self.to_string(),
            target,
            reason: reason.to_owned(),
        };
        match (self, target) {
            (Self::Integer(_), StepKind::Integer)
            | (Self::Float(_), StepKind::Float)
            | (Self::Duration(_), StepKind::Timestamp) => Ok(self),
            (Self::Integer(v), StepKind::Float) => Ok(Self::Float(v as f64)),
            (Self::Float(v), StepKind::Integer) => {
                if !v.is_finite() || v.fract() != 0.0 {
                    return Err(invalid("interval is not integral"));
                }
                if v < i64::MIN as f64 || v > i64::MAX as f64 {
                    return Err(invalid("interval is out of integer range"));
                }
                Ok(Self::Integer(v as i64))
            }
            (Self::Integer(secs), StepKind::Timestamp) => TimeDelta::try_seconds(secs)
                .map(Self::Duration)
                .ok_or_else(|| invalid("seconds out of range")),
            (Self::Float(secs), StepKind::Timestamp) => Self::duration_from_seconds(secs)
                .map(Self::Duration)
                .map_err(|err| invalid(&err.to_string())),
            (Self::Duration(_), StepKind::Integer | StepKind::Float) => {
                Err(invalid("durations do not convert to numeric intervals"))
            }
        }
    }
}

impl fmt::Display for IntervalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Duration(_) => write!(f, "{}s", self.as_seconds()),
        }
    }
}
