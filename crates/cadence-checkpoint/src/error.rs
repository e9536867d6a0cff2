//! Error types for checkpoint persistence.

use std::path::PathBuf;

/// Errors that can occur while saving, loading, or recovering checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A value could not be encoded (unregistered record kind, non-finite
    /// float, non-UTF-8 path).
    #[error("serialization error in field `{field}`: {reason}")]
    Serialization {
        /// Name of the field being encoded.
        field: String,
        /// Why encoding failed.
        reason: String,
    },

    /// A stored record could not be decoded into the requested node.
    #[error("deserialization error at {}: {reason}", path.display())]
    Deserialization {
        /// Directory of the offending record.
        path: PathBuf,
        /// Why decoding failed.
        reason: String,
    },

    /// An operation needed a checkpoint directory and none was given or
    /// previously associated.
    #[error("configuration error: {reason}")]
    Configuration {
        /// Explanation of what is missing.
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
}

impl CheckpointError {
    /// Wrap an I/O error with the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a deserialization error for the record at `path`.
    pub fn deserialization(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Deserialization {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
