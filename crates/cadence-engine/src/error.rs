//! Error types for the engine binary.
//!
//! [`EngineError`] wraps every failure mode of startup and execution so
//! that `main` can propagate with `?`.

/// Top-level error for the engine binary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: cadence_core::config::ConfigError,
    },

    /// Building or stepping the scheduling tree failed.
    #[error("schedule error: {source}")]
    Schedule {
        /// The underlying scheduling error.
        #[from]
        source: cadence_core::ScheduleError,
    },

    /// Saving or restoring a checkpoint failed.
    #[error("checkpoint error: {source}")]
    Checkpoint {
        /// The underlying checkpoint error.
        #[from]
        source: cadence_checkpoint::CheckpointError,
    },

    /// Partitioned execution failed.
    #[error("partition error: {source}")]
    Partition {
        /// The underlying partition error.
        #[from]
        source: cadence_partition::PartitionError,
    },

    /// The demo tree could not be built or its config section is invalid.
    #[error("demo error: {message}")]
    Demo {
        /// Description of the demo failure.
        message: String,
    },

    /// The restored checkpoint root cannot be paced.
    #[error("checkpoint root at {dir} is a `{kind}`, expected a `Scheduler`")]
    RootKind {
        /// Checkpoint directory.
        dir: String,
        /// Kind name of the restored root.
        kind: String,
    },
}
