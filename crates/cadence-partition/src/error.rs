//! Error types for partitioned runs.

use std::path::PathBuf;

use cadence_checkpoint::CheckpointError;
use cadence_core::ScheduleError;

/// Errors that can occur while splitting, advancing, or merging partitions.
#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    /// Reading or writing a checkpoint failed.
    #[error("checkpoint error: {source}")]
    Checkpoint {
        /// The underlying checkpoint error.
        #[from]
        source: CheckpointError,
    },

    /// Stepping a restored partition failed.
    #[error("schedule error: {source}")]
    Schedule {
        /// The underlying scheduling error.
        #[from]
        source: ScheduleError,
    },

    /// A `partition.json` manifest is missing, malformed, or inconsistent
    /// with its siblings.
    #[error("manifest error at {}: {reason}", path.display())]
    Manifest {
        /// Directory holding the manifest.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The requested split or merge is not well formed.
    #[error("invalid partition request: {reason}")]
    Invalid {
        /// Why the request was rejected.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path the operation was applied to.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A partition worker panicked or was cancelled.
    #[error("partition {index} worker failed: {source}")]
    Worker {
        /// Index of the partition whose worker failed.
        index: usize,
        /// The join error reported by the runtime.
        #[source]
        source: tokio::task::JoinError,
    },
}

impl PartitionError {
    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a manifest error for the partition at `path`.
    pub fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Build an invalid-request error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}
