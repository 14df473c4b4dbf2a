//! Partitioning of parameter trees over a device mesh
//!
//! - [`Mesh`]: explicit device grid with named axes
//! - [`PartitionRule`] / [`resolve`]: ordered regex rules mapping leaf paths to specs
//! - [`ShardGatherFns`]: per-leaf shard and gather functions built from specs and shapes

mod mesh;
mod rules;
mod shard;
mod spec;

pub use mesh::{Mesh, MeshAxis};
pub use rules::{resolve, resolve_mirrored, PartitionRule};
pub use shard::{GatherFn, LeafLayout, ShardFn, ShardGatherFns, ShardedLeaf, ShardedTree};
pub use spec::{AxisLabel, PartitionSpec};

#[cfg(test)]
mod property_tests;
