//! Shared type definitions for the Cadence scheduling kernel.
//!
//! This crate is the single source of truth for the value types that flow
//! between the scheduling core, the checkpoint store, and the partition
//! runner. It has no behaviour beyond arithmetic on step positions and
//! typed access to checkpoint fields.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrapper for schedulable node identifiers
//! - [`step`] -- Step positions ([`StepValue`]) and intervals ([`IntervalValue`])
//! - [`field`] -- The closed field model used by checkpoint records

pub mod field;
pub mod ids;
pub mod step;

// Re-export all public types at crate root for convenience.
pub use field::{Field, FieldDescriptor, FieldError, FieldMap, FieldValue, TypeTag};
pub use ids::NodeId;
pub use step::{IntervalValue, StepKind, StepValue, StepValueError};
