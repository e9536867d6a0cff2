//! Atomic directory-tree checkpoints for Cadence scheduling trees.
//!
//! A scheduling tree is persisted as a tree of directories, one per node,
//! each holding a self-describing `record.json`. Records are written
//! through a temp file and an atomic rename so a crash never leaves a
//! half-written canonical record behind.
//!
//! # Modules
//!
//! - [`codec`] -- Codecs for domain records stored inline in a node record.
//! - [`error`] -- [`CheckpointError`].
//! - [`record`] -- The `[kind, [[name, tag, value], ...]]` wire format.
//! - [`registry`] -- Node constructors keyed by record kind.
//! - [`store`] -- [`CheckpointStore`]: push, pull, restore, delete, recover.

pub mod codec;
pub mod error;
pub mod record;
pub mod registry;
pub mod store;

pub use codec::{CodecTable, RecordCodec, TypedCodec};
pub use error::CheckpointError;
pub use record::{CheckpointRecord, RECORD_FILE, TEMP_FILE};
pub use registry::{NodeFactory, NodeRegistry};
pub use store::{
    CHILDREN_RELATION, CheckpointStore, RecoveryOutcome, child_dir_name, next_child_generation,
    parse_child_dir_name, prune_stale_children,
};
