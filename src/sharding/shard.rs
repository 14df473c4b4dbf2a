//! Shard and gather functions
//!
//! A [`LeafLayout`] records, for one leaf, the slice of the full tensor
//! that every device of the mesh holds. Devices holding the same slice are
//! replicas; the lowest-numbered one is the primary. Shard and gather
//! functions are thin handles around a shared layout, so they are cheap to
//! clone and safe to reuse across checkpoint operations.

use super::mesh::Mesh;
use super::spec::{AxisLabel, PartitionSpec};
use crate::tree::{at_path, Leaf, LeafShape, ParameterTree, Tree, TreeShape};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// Per-device slices of one leaf
#[derive(Debug, Clone, PartialEq)]
pub struct LeafLayout {
    path: String,
    shape: LeafShape,
    spec: PartitionSpec,
    shard_shape: Vec<usize>,
    slices: Vec<Vec<Range<usize>>>,
    primary: Vec<usize>,
}

impl LeafLayout {
    /// Compute the layout of `shape` under `spec` on `mesh`
    pub fn new(path: &str, shape: &LeafShape, spec: &PartitionSpec, mesh: &Mesh) -> Result<Self> {
        if spec.rank() != shape.rank() {
            return Err(Error::PartitionRankMismatch {
                path: path.to_string(),
                spec_rank: spec.rank(),
                leaf_rank: shape.rank(),
            });
        }

        // (dimension, mesh axis index, mesh axis size) for every sharded dimension
        let mut sharded = Vec::new();
        for (dim, label) in spec.labels().iter().enumerate() {
            let AxisLabel::Mesh(axis) = label else {
                continue;
            };
            let axis_index = mesh.axis_index(axis).ok_or_else(|| Error::UnknownMeshAxis {
                path: path.to_string(),
                axis: axis.clone(),
            })?;
            if sharded.iter().any(|&(_, a, _)| a == axis_index) {
                return Err(Error::ConfigError(format!(
                    "partition spec {spec} for '{path}' uses mesh axis '{axis}' twice"
                )));
            }
            let mesh_size = mesh.axes()[axis_index].size();
            let size = shape.shape[dim];
            if size % mesh_size != 0 {
                return Err(Error::ShardDivisibility {
                    path: path.to_string(),
                    dim,
                    size,
                    mesh_axis: axis.clone(),
                    mesh_size,
                });
            }
            sharded.push((dim, axis_index, mesh_size));
        }

        let mut shard_shape = shape.shape.clone();
        for &(dim, _, mesh_size) in &sharded {
            shard_shape[dim] /= mesh_size;
        }

        let devices = mesh.device_count();
        let mut slices = Vec::with_capacity(devices);
        let mut primary = Vec::with_capacity(devices);
        for device in 0..devices {
            let coordinate = mesh.coordinate(device);
            let mut ranges: Vec<Range<usize>> = shape.shape.iter().map(|&n| 0..n).collect();
            for &(dim, axis_index, _) in &sharded {
                let piece = shard_shape[dim];
                let start = coordinate[axis_index] * piece;
                ranges[dim] = start..start + piece;
            }
            let first = slices.iter().position(|s| *s == ranges).unwrap_or(device);
            primary.push(first);
            slices.push(ranges);
        }

        Ok(Self {
            path: path.to_string(),
            shape: shape.clone(),
            spec: spec.clone(),
            shard_shape,
            slices,
            primary,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full (unsharded) shape and dtype
    pub fn shape(&self) -> &LeafShape {
        &self.shape
    }

    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    /// Shape of the piece each device holds
    pub fn shard_shape(&self) -> &[usize] {
        &self.shard_shape
    }

    pub fn device_count(&self) -> usize {
        self.slices.len()
    }

    /// Index ranges of the full tensor held by `device`
    pub fn slice_of(&self, device: usize) -> &[Range<usize>] {
        &self.slices[device]
    }

    /// Whether `device` holds the first copy of its slice
    pub fn is_primary(&self, device: usize) -> bool {
        self.primary[device] == device
    }

    /// Device holding the first copy of `device`'s slice
    pub fn primary_of(&self, device: usize) -> usize {
        self.primary[device]
    }
}

/// A leaf split over the devices of a mesh, one piece per device
#[derive(Debug, Clone, PartialEq)]
pub struct ShardedLeaf {
    layout: Arc<LeafLayout>,
    shards: Vec<Leaf>,
}

impl ShardedLeaf {
    /// Wrap per-device pieces, checking them against the layout
    pub fn new(layout: Arc<LeafLayout>, shards: Vec<Leaf>) -> Result<Self> {
        if shards.len() != layout.device_count() {
            return Err(Error::ShapeMismatch {
                path: layout.path.clone(),
                expected: vec![layout.device_count()],
                got: vec![shards.len()],
            });
        }
        let expected = LeafShape::new(layout.shard_shape.clone(), layout.shape.dtype);
        for shard in &shards {
            expected.check(&layout.path, &shard.leaf_shape())?;
        }
        Ok(Self { layout, shards })
    }

    pub fn layout(&self) -> &Arc<LeafLayout> {
        &self.layout
    }

    pub fn shards(&self) -> &[Leaf] {
        &self.shards
    }

    pub fn shard(&self, device: usize) -> &Leaf {
        &self.shards[device]
    }

    /// Sum of squares over primary replicas only
    pub fn sum_squares(&self) -> f64 {
        self.shards
            .iter()
            .enumerate()
            .filter(|(device, _)| self.layout.is_primary(*device))
            .map(|(_, shard)| shard.sum_squares())
            .sum()
    }

    /// `self += alpha * other`, piece by piece
    pub fn axpy(&mut self, alpha: f64, other: &ShardedLeaf) -> Result<()> {
        if self.layout != other.layout {
            return Err(Error::ConfigError(format!(
                "cannot combine '{}' with a leaf of a different layout",
                self.layout.path
            )));
        }
        for (dst, src) in self.shards.iter_mut().zip(&other.shards) {
            dst.axpy(alpha, src).map_err(|e| at_path(&self.layout.path, e))?;
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) -> Result<()> {
        for shard in &mut self.shards {
            shard.scale(factor).map_err(|e| at_path(&self.layout.path, e))?;
        }
        Ok(())
    }
}

/// Splits a full host tensor into per-device pieces
#[derive(Debug, Clone)]
pub struct ShardFn {
    layout: Arc<LeafLayout>,
}

impl ShardFn {
    pub fn layout(&self) -> &Arc<LeafLayout> {
        &self.layout
    }

    pub fn apply(&self, full: &Leaf) -> Result<ShardedLeaf> {
        let layout = &self.layout;
        layout.shape.check(&layout.path, &full.leaf_shape())?;
        let shards = layout.slices.iter().map(|ranges| full.slice(ranges)).collect();
        Ok(ShardedLeaf {
            layout: Arc::clone(layout),
            shards,
        })
    }
}

/// Reassembles the full host tensor from per-device pieces
///
/// Replicas are required to be bit-identical to their primary; a
/// disagreement is reported as [`Error::ReplicaMismatch`] rather than
/// resolved by picking or averaging.
#[derive(Debug, Clone)]
pub struct GatherFn {
    layout: Arc<LeafLayout>,
}

impl GatherFn {
    pub fn layout(&self) -> &Arc<LeafLayout> {
        &self.layout
    }

    pub fn apply(&self, sharded: &ShardedLeaf) -> Result<Leaf> {
        let layout = &self.layout;
        if sharded.layout.shape != layout.shape || sharded.layout.slices != layout.slices {
            return Err(Error::ConfigError(format!(
                "gather for '{}' received a leaf with a different layout",
                layout.path
            )));
        }
        let mut full = Leaf::zeros(&layout.shape);
        for (device, shard) in sharded.shards.iter().enumerate() {
            let primary = layout.primary[device];
            if primary == device {
                full.assign_slice(&layout.slices[device], shard)
                    .map_err(|e| at_path(&layout.path, e))?;
            } else if !shard.same_bits(&sharded.shards[primary]) {
                return Err(Error::ReplicaMismatch {
                    path: layout.path.clone(),
                    device,
                });
            }
        }
        Ok(full)
    }
}

/// A tree of sharded leaves
pub type ShardedTree = Tree<ShardedLeaf>;

/// Shard and gather functions for every leaf of a tree
#[derive(Debug, Clone, Default)]
pub struct ShardGatherFns {
    pub shard: Tree<ShardFn>,
    pub gather: Tree<GatherFn>,
}

impl ShardGatherFns {
    /// Build one shard and one gather function per leaf
    ///
    /// Every divisibility and axis problem is reported here, before any
    /// tensor is touched.
    pub fn build(specs: &Tree<PartitionSpec>, shapes: &TreeShape, mesh: &Mesh) -> Result<Self> {
        shapes.check_same_paths(specs)?;
        let layouts = shapes.try_map(|path, shape| {
            let spec = specs.require(path)?;
            Ok(Arc::new(LeafLayout::new(path, shape, spec, mesh)?))
        })?;
        Ok(Self {
            shard: layouts.map(|_, l| ShardFn {
                layout: Arc::clone(l),
            }),
            gather: layouts.map(|_, l| GatherFn {
                layout: Arc::clone(l),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.shard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shard.is_empty()
    }

    /// Full shapes of all leaves
    pub fn shapes(&self) -> TreeShape {
        self.shard.map(|_, f| f.layout.shape.clone())
    }

    pub fn layouts(&self) -> Tree<Arc<LeafLayout>> {
        self.shard.map(|_, f| Arc::clone(&f.layout))
    }

    /// Re-key all functions under `prefix.`
    pub fn prefixed(self, prefix: &str) -> Self {
        Self {
            shard: self.shard.prefixed(prefix),
            gather: self.gather.prefixed(prefix),
        }
    }

    pub fn extend(&mut self, other: ShardGatherFns) {
        self.shard.extend(other.shard);
        self.gather.extend(other.gather);
    }

    pub fn shard_tree(&self, tree: &ParameterTree) -> Result<ShardedTree> {
        self.shard.try_zip_map(tree, |_, f, leaf| f.apply(leaf))
    }

    pub fn gather_tree(&self, tree: &ShardedTree) -> Result<ParameterTree> {
        self.gather.try_zip_map(tree, |_, f, leaf| f.apply(leaf))
    }
}

impl ShardedTree {
    /// L2 norm of the logical tree, counting each replicated value once
    pub fn global_norm(&self) -> f64 {
        self.iter()
            .map(|(_, leaf)| leaf.sum_squares())
            .sum::<f64>()
            .sqrt()
    }

    /// Number of devices the leaves are split over (1 for an empty tree)
    pub fn device_count(&self) -> usize {
        self.iter()
            .next()
            .map(|(_, leaf)| leaf.layout.device_count())
            .unwrap_or(1)
    }

    /// The pieces held by one device, as a plain tree
    pub fn device_view(&self, device: usize) -> ParameterTree {
        self.map(|_, leaf| leaf.shards[device].clone())
    }

    /// Reassemble a sharded tree from one plain tree per device
    pub fn from_device_views(
        layouts: &Tree<Arc<LeafLayout>>,
        views: Vec<ParameterTree>,
    ) -> Result<ShardedTree> {
        let mut pieces: BTreeMap<String, Vec<Leaf>> = BTreeMap::new();
        for view in views {
            layouts.check_same_paths(&view)?;
            for (path, leaf) in view {
                pieces.entry(path).or_default().push(leaf);
            }
        }
        layouts.try_map(|path, layout| {
            let shards = pieces.remove(path).unwrap_or_default();
            ShardedLeaf::new(Arc::clone(layout), shards)
        })
    }
}
