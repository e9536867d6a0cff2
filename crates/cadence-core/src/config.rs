//! Configuration loading and typed config structures for Cadence.
//!
//! The canonical configuration lives in `cadence-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure, and provides a loader that reads the file and applies
//! environment overrides. Every field has a default, so an empty document
//! is a valid configuration.
//!
//! Step values are written as strings and interpreted according to
//! `clock.kind`: integers and floats as numbers, timestamps as RFC 3339.

use std::path::Path;

use cadence_types::{IntervalValue, StepKind, StepValue};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is not usable.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong with the configuration.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level kernel configuration.
///
/// Mirrors the structure of `cadence-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct KernelConfig {
    /// Root clock settings.
    #[serde(default)]
    pub clock: ClockConfig,

    /// Wall-clock pacing settings.
    #[serde(default)]
    pub pacer: PacerConfig,

    /// Checkpoint directory and cadence.
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Partitioned execution settings.
    #[serde(default)]
    pub partition: PartitionConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl KernelConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string and apply environment
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override selected values with environment variables when set.
    ///
    /// - `CADENCE_CHECKPOINT_DIR` replaces `checkpoint.dir`.
    /// - `CADENCE_LOG` replaces `logging.level`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CADENCE_CHECKPOINT_DIR") {
            self.checkpoint.dir = val;
        }
        if let Ok(val) = std::env::var("CADENCE_LOG") {
            self.logging.level = val;
        }
    }
}

/// Root clock settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClockConfig {
    /// Step kind: `integer`, `float`, or `timestamp`.
    #[serde(default = "default_clock_kind")]
    pub kind: String,

    /// Initial step. Defaults to `0` for numeric clocks and the current
    /// time for timestamp clocks.
    #[serde(default)]
    pub initial: Option<String>,

    /// Interval in ticks (numeric clocks) or seconds (timestamp clocks).
    #[serde(default = "default_clock_interval")]
    pub interval: f64,

    /// Inclusive upper bound of the root timeline.
    #[serde(default)]
    pub max: Option<String>,

    /// Whether the root scheduler skips idle steps.
    #[serde(default)]
    pub skip_step: bool,

    /// Seed of the root random stream; children derive theirs from it.
    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
}

impl ClockConfig {
    /// The configured step kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown kind name.
    pub fn step_kind(&self) -> Result<StepKind, ConfigError> {
        StepKind::from_name(&self.kind).ok_or_else(|| ConfigError::Invalid {
            reason: format!("unknown clock kind `{}`", self.kind),
        })
    }

    /// The configured initial step.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not parse as the
    /// configured kind.
    pub fn initial_step(&self) -> Result<StepValue, ConfigError> {
        let kind = self.step_kind()?;
        match &self.initial {
            Some(text) => parse_step(text, kind),
            None => Ok(match kind {
                StepKind::Integer => StepValue::Integer(0),
                StepKind::Float => StepValue::Float(0.0),
                StepKind::Timestamp => StepValue::Timestamp(Utc::now()),
            }),
        }
    }

    /// The configured interval, cast to the clock's kind.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the interval is not positive or
    /// cannot be represented in the configured kind.
    pub fn interval_value(&self) -> Result<IntervalValue, ConfigError> {
        let kind = self.step_kind()?;
        let interval = IntervalValue::Float(self.interval)
            .cast(kind)
            .map_err(|err| ConfigError::Invalid {
                reason: format!("clock.interval: {err}"),
            })?;
        if !interval.is_positive() {
            return Err(ConfigError::Invalid {
                reason: format!("clock.interval must be positive, got {}", self.interval),
            });
        }
        Ok(interval)
    }

    /// The configured upper bound.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the value does not parse as the
    /// configured kind.
    pub fn max_step(&self) -> Result<Option<StepValue>, ConfigError> {
        let kind = self.step_kind()?;
        self.max
            .as_deref()
            .map(|text| parse_step(text, kind))
            .transpose()
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            kind: default_clock_kind(),
            initial: None,
            interval: default_clock_interval(),
            max: None,
            skip_step: false,
            seed: default_seed(),
        }
    }
}

/// Wall-clock pacing settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PacerConfig {
    /// Simulated seconds per real second.
    #[serde(default = "default_speed")]
    pub speed: f64,

    /// Whether steps are paced against the wall clock.
    #[serde(default = "default_true")]
    pub sync: bool,

    /// Step beyond which this run stops, without changing the clock bound.
    #[serde(default)]
    pub ceiling: Option<String>,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            speed: default_speed(),
            sync: true,
            ceiling: None,
        }
    }
}

/// Checkpoint directory and cadence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding the root record.
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,

    /// Save every N root ticks; `0` saves only at the end of the run.
    #[serde(default = "default_every_ticks")]
    pub every_ticks: u64,

    /// Resume from `dir` when it already holds a record.
    #[serde(default = "default_true")]
    pub resume: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
            every_ticks: default_every_ticks(),
            resume: true,
        }
    }
}

/// Partitioned execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionConfig {
    /// Number of partitions; `1` runs the tree in-process.
    #[serde(default = "default_partitions")]
    pub partitions: usize,

    /// Root ticks each partition advances before merging.
    #[serde(default = "default_partition_ticks")]
    pub ticks: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            ticks: default_partition_ticks(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter
    /// directive.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Parse a step written in configuration as the given kind.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] if `text` is not a valid value of `kind`.
pub fn parse_step(text: &str, kind: StepKind) -> Result<StepValue, ConfigError> {
    let invalid = |detail: String| ConfigError::Invalid {
        reason: format!("`{text}` is not a valid {kind} step: {detail}"),
    };
    let text = text.trim();
    match kind {
        StepKind::Integer => text
            .parse::<i64>()
            .map(StepValue::Integer)
            .map_err(|err| invalid(err.to_string())),
        StepKind::Float => {
            let value = text.parse::<f64>().map_err(|err| invalid(err.to_string()))?;
            if value.is_finite() {
                Ok(StepValue::Float(value))
            } else {
                Err(invalid("value is not finite".to_owned()))
            }
        }
        StepKind::Timestamp => DateTime::parse_from_rfc3339(text)
            .map(|dt| StepValue::Timestamp(dt.with_timezone(&Utc)))
            .map_err(|err| invalid(err.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_clock_kind() -> String {
    "timestamp".to_owned()
}

const fn default_clock_interval() -> f64 {
    60.0
}

#[allow(clippy::unnecessary_wraps)]
const fn default_seed() -> Option<u64> {
    Some(42)
}

const fn default_speed() -> f64 {
    600.0
}

const fn default_true() -> bool {
    true
}

fn default_checkpoint_dir() -> String {
    "checkpoints".to_owned()
}

const fn default_every_ticks() -> u64 {
    10
}

const fn default_partitions() -> usize {
    1
}

const fn default_partition_ticks() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_owned()
}
