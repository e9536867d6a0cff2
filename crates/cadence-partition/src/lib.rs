//! Partitioned execution for Cadence checkpoint trees.
//!
//! A checkpointed tree whose root is a scheduler can be split into N
//! partition directories, each holding a disjoint share of the root's
//! children. Partitions advance independently on blocking workers and are
//! then merged back into one restorable tree.
//!
//! # Modules
//!
//! - [`error`] -- [`PartitionError`], wrapping checkpoint and scheduling errors
//! - [`manifest`] -- The `partition.json` manifest
//! - [`runner`] -- [`PartitionRunner`]: split, advance, merge

pub mod error;
pub mod manifest;
pub mod runner;

pub use error::PartitionError;
pub use manifest::{MANIFEST_FILE, PartitionManifest};
pub use runner::{PartitionReport, PartitionRunner};
