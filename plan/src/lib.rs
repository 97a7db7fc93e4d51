//! Logical graph model and physical plan construction for the skein control plane.
//!
//! A user-declared [`LogicalGraph`](logical::LogicalGraph) of operators, ports, and
//! streams is translated by [`builder::build`] into a [`PhysicalPlan`](physical::PhysicalPlan):
//! operators are expanded into parallel replicas according to their partition count,
//! merge (unifier) operators are synthesized wherever a partitioned output converges
//! on a single downstream input, and the resulting physical operators are packed into
//! deployable containers under a maximum-container bound.
//!
//! Everything in this crate is pure data transformation: no locks, no I/O. The
//! orchestration of built plans against live cluster resources lives in the `skein`
//! crate.

#![forbid(missing_docs)]

pub mod attributes;
pub mod builder;
pub mod logical;
pub mod physical;

pub use attributes::{AttrValue, Attributes};
pub use builder::{build, BuildError, DefaultPacking, Packing};
pub use logical::{LogicalGraph, OperatorId, PortRef, StreamId};
pub use physical::{
    ContainerState, OperatorKind, PhysicalContainer, PhysicalEdge, PhysicalOperator, PhysicalPlan,
};
