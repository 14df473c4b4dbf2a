//! Parameter trees keyed by dotted paths
//!
//! A [`Tree`] is an ordered mapping from dotted string paths (for example
//! `lm.table` or `mu.lm.table`) to values. Enumeration order is the
//! lexicographic path order, which is the order checkpoints are written
//! and read in.

mod leaf;

pub use leaf::{DType, Leaf, LeafShape};
pub(crate) use leaf::at_path;

use crate::{Error, Result};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// Ordered mapping from dotted paths to values
#[derive(Debug, Clone, PartialEq)]
pub struct Tree<T> {
    leaves: BTreeMap<String, T>,
}

/// A tree of tensor values
pub type ParameterTree = Tree<Leaf>;

/// A tree of shapes, as produced by shape-only model evaluation
pub type TreeShape = Tree<LeafShape>;

impl<T> Default for Tree<T> {
    fn default() -> Self {
        Self {
            leaves: BTreeMap::new(),
        }
    }
}

/// Join a prefix and a path with a dot
pub fn join_path(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{prefix}.{path}")
    }
}

impl<T> Tree<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: T) -> Option<T> {
        self.leaves.insert(path.into(), value)
    }

    pub fn get(&self, path: &str) -> Option<&T> {
        self.leaves.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut T> {
        self.leaves.get_mut(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<T> {
        self.leaves.remove(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.leaves.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.leaves.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.leaves.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut T)> {
        self.leaves.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Value at `path`, or `MissingLeaf`
    pub fn require(&self, path: &str) -> Result<&T> {
        self.get(path).ok_or_else(|| Error::MissingLeaf {
            path: path.to_string(),
        })
    }

    pub fn map<U>(&self, mut f: impl FnMut(&str, &T) -> U) -> Tree<U> {
        Tree {
            leaves: self
                .leaves
                .iter()
                .map(|(k, v)| (k.clone(), f(k, v)))
                .collect(),
        }
    }

    pub fn try_map<U>(&self, mut f: impl FnMut(&str, &T) -> Result<U>) -> Result<Tree<U>> {
        let mut leaves = BTreeMap::new();
        for (k, v) in &self.leaves {
            leaves.insert(k.clone(), f(k, v)?);
        }
        Ok(Tree { leaves })
    }

    /// Combine two trees with identical path sets leaf by leaf
    pub fn try_zip_map<U, V>(
        &self,
        other: &Tree<U>,
        mut f: impl FnMut(&str, &T, &U) -> Result<V>,
    ) -> Result<Tree<V>> {
        self.check_same_paths(other)?;
        self.try_map(|path, a| {
            let b = other.require(path)?;
            f(path, a, b)
        })
    }

    /// Fail unless both trees contain exactly the same paths
    pub fn check_same_paths<U>(&self, other: &Tree<U>) -> Result<()> {
        if let Some(path) = self.paths().find(|p| !other.contains(p)) {
            return Err(Error::MissingLeaf {
                path: path.to_string(),
            });
        }
        if let Some(path) = other.paths().find(|p| !self.contains(p)) {
            return Err(Error::UnexpectedLeaf {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    /// Re-key every path as `prefix.path`
    pub fn prefixed(self, prefix: &str) -> Tree<T> {
        self.leaves
            .into_iter()
            .map(|(k, v)| (join_path(prefix, &k), v))
            .collect()
    }

    /// Keep the paths under `prefix.` and strip the prefix
    pub fn strip_prefix(self, prefix: &str) -> Tree<T> {
        let dotted = format!("{prefix}.");
        self.leaves
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&dotted).map(|rest| (rest.to_string(), v)))
            .collect()
    }

    /// Move all leaves of `other` into `self`
    pub fn extend(&mut self, other: Tree<T>) {
        self.leaves.extend(other.leaves);
    }
}

impl<T> FromIterator<(String, T)> for Tree<T> {
    fn from_iter<I: IntoIterator<Item = (String, T)>>(iter: I) -> Self {
        Self {
            leaves: iter.into_iter().collect(),
        }
    }
}

impl<T> IntoIterator for Tree<T> {
    type Item = (String, T);
    type IntoIter = btree_map::IntoIter<String, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.leaves.into_iter()
    }
}

impl ParameterTree {
    /// Shape skeleton of this tree
    pub fn shapes(&self) -> TreeShape {
        self.map(|_, leaf| leaf.leaf_shape())
    }

    /// L2 norm over every element of every leaf
    pub fn global_norm(&self) -> f64 {
        self.iter()
            .map(|(_, leaf)| leaf.sum_squares())
            .sum::<f64>()
            .sqrt()
    }

    /// Zero-filled tree with the same skeleton
    pub fn zeros_like(&self) -> ParameterTree {
        self.map(|_, leaf| leaf.zeros_like())
    }
}

impl TreeShape {
    /// Zero-filled tree matching this skeleton
    pub fn zeros(&self) -> ParameterTree {
        self.map(|_, shape| Leaf::zeros(shape))
    }

    /// Fail with the first differing path if `tree` does not match this skeleton
    pub fn check_tree(&self, tree: &ParameterTree) -> Result<()> {
        self.check_same_paths(tree)?;
        for (path, expected) in self.iter() {
            expected.check(path, &tree.require(path)?.leaf_shape())?;
        }
        Ok(())
    }
}
