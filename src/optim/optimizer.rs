//! Optimizer trait

use crate::error::{Error, Result};
use crate::tree::{at_path, join_path, DType, Leaf, ParameterTree, TreeShape};
use ndarray::ArrayD;
use regex::Regex;

/// Functional optimizer over parameter trees
///
/// State is a plain tree whose leaves are named `<slot>.<param path>`, one
/// slot per entry of [`Optimizer::slots`], each shaped like its parameter.
/// Because the state mirrors the parameters, it partitions the same way and
/// an update can run independently on every device's shard.
pub trait Optimizer {
    /// Names of the per-parameter state slots
    fn slots(&self) -> &[&'static str];

    /// Learning rate applied at `step`
    fn learning_rate(&self, step: u64) -> f64;

    /// Compute updates for `grads`, consuming the previous state
    ///
    /// `step` is the number of updates applied so far. Returns
    /// `(updates, new_state)`; updates are added to the parameters with
    /// [`apply_updates`].
    fn update(
        &self,
        grads: &ParameterTree,
        state: ParameterTree,
        params: &ParameterTree,
        step: u64,
    ) -> Result<(ParameterTree, ParameterTree)>;

    /// Shape skeleton of the state for a given parameter skeleton
    fn state_shapes(&self, params: &TreeShape) -> TreeShape {
        let mut shapes = TreeShape::new();
        for slot in self.slots() {
            for (path, shape) in params.iter() {
                shapes.insert(join_path(slot, path), shape.clone());
            }
        }
        shapes
    }

    /// Zero-initialized state
    fn init(&self, params: &ParameterTree) -> ParameterTree {
        self.state_shapes(&params.shapes()).zeros()
    }
}

/// `params + updates`, leaf by leaf
pub fn apply_updates(mut params: ParameterTree, updates: &ParameterTree) -> Result<ParameterTree> {
    params.check_same_paths(updates)?;
    for (path, leaf) in params.iter_mut() {
        leaf.axpy(1.0, updates.require(path)?)
            .map_err(|e| at_path(path, e))?;
    }
    Ok(params)
}

/// Factor that brings a gradient of norm `norm` down to `max_norm`
///
/// `None` when no clipping is needed.
pub fn clip_factor(norm: f64, max_norm: f64) -> Option<f64> {
    (norm > max_norm && norm > 0.0).then(|| max_norm / norm)
}

/// Parameters excluded from weight decay, by regex search over the path
#[derive(Debug, Clone, Default)]
pub struct WeightDecayMask {
    exclusions: Vec<Regex>,
}

impl WeightDecayMask {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let exclusions = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    Error::ConfigError(format!(
                        "invalid weight decay exclusion '{}': {e}",
                        p.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { exclusions })
    }

    /// Whether weight decay applies to the parameter at `path`
    pub fn applies(&self, path: &str) -> bool {
        !self.exclusions.iter().any(|re| re.is_match(path))
    }
}

pub(crate) fn f32_array<'a>(path: &str, leaf: &'a Leaf) -> Result<&'a ArrayD<f32>> {
    leaf.as_f32().ok_or_else(|| Error::DTypeMismatch {
        path: path.to_string(),
        expected: DType::F32,
        got: leaf.dtype(),
    })
}

/// Remove the `slot` entry for `path` from `state` as an owned f32 array
pub(crate) fn take_slot(
    state: &mut ParameterTree,
    slot: &str,
    path: &str,
    shape: &[usize],
) -> Result<ArrayD<f32>> {
    let key = join_path(slot, path);
    let leaf = state
        .remove(&key)
        .ok_or_else(|| Error::MissingLeaf { path: key.clone() })?;
    match leaf {
        Leaf::F32(a) if a.shape() == shape => Ok(a),
        Leaf::F32(a) => Err(Error::ShapeMismatch {
            path: key,
            expected: shape.to_vec(),
            got: a.shape().to_vec(),
        }),
        other => Err(Error::DTypeMismatch {
            path: key,
            expected: DType::F32,
            got: other.dtype(),
        }),
    }
}

/// Fail if `state` still holds entries nobody consumed
pub(crate) fn ensure_consumed(state: &ParameterTree) -> Result<()> {
    match state.paths().next() {
        Some(path) => Err(Error::UnexpectedLeaf {
            path: path.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_updates_adds_leafwise() {
        let mut params = ParameterTree::new();
        params.insert("w", Leaf::f32(&[2], vec![1.0, 2.0]).unwrap());
        let mut updates = ParameterTree::new();
        updates.insert("w", Leaf::f32(&[2], vec![0.5, -1.0]).unwrap());

        let out = apply_updates(params, &updates).unwrap();
        assert_eq!(out.get("w").unwrap().as_f32().unwrap().as_slice().unwrap(), &[1.5, 1.0]);
    }

    #[test]
    fn test_apply_updates_rejects_missing_update() {
        let mut params = ParameterTree::new();
        params.insert("w", Leaf::f32(&[1], vec![1.0]).unwrap());
        let err = apply_updates(params, &ParameterTree::new()).unwrap_err();
        assert!(matches!(err, Error::MissingLeaf { path } if path == "w"));
    }

    #[test]
    fn test_clip_factor() {
        assert_eq!(clip_factor(0.5, 1.0), None);
        assert_eq!(clip_factor(4.0, 1.0), Some(0.25));
        assert_eq!(clip_factor(0.0, 0.0), None);
    }

    #[test]
    fn test_weight_decay_mask() {
        let mask = WeightDecayMask::new(&["bias$", "ln_"]).unwrap();
        assert!(mask.applies("lm.table"));
        assert!(!mask.applies("lm.bias"));
        assert!(!mask.applies("block.ln_1.scale"));
        assert!(WeightDecayMask::new(&["("]).is_err());
    }
}
