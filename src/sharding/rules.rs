//! Ordered regex partition rules
//!
//! Rules are tried in declared order against each leaf path and the first
//! full-path match wins. Resolution only needs the shape skeleton, so it
//! runs before any parameter is materialized.

use super::spec::PartitionSpec;
use crate::tree::{LeafShape, Tree, TreeShape};
use crate::{Error, Result};
use regex::Regex;
use tracing::debug;

/// A `(pattern, spec)` pair
#[derive(Debug, Clone)]
pub struct PartitionRule {
    pattern: String,
    regex: Regex,
    spec: PartitionSpec,
}

impl PartitionRule {
    /// Compile `pattern`, anchored to match the whole path
    pub fn new(pattern: impl Into<String>, spec: PartitionSpec) -> Result<Self> {
        let pattern = pattern.into();
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
            Error::ConfigError(format!("invalid partition rule pattern '{pattern}': {e}"))
        })?;
        Ok(Self {
            pattern,
            regex,
            spec,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

fn resolve_leaf(rules: &[PartitionRule], path: &str, shape: &LeafShape) -> Result<PartitionSpec> {
    // Scalars and single-element leaves never need a rule.
    if shape.rank() == 0 || shape.numel() == 1 {
        return Ok(PartitionSpec::replicated(shape.rank()));
    }
    let rule = rules
        .iter()
        .find(|rule| rule.matches(path))
        .ok_or_else(|| Error::UnresolvedPartition {
            path: path.to_string(),
        })?;
    check_rank(path, rule.spec(), shape)?;
    debug!(path, pattern = rule.pattern(), spec = %rule.spec(), "resolved partition");
    Ok(rule.spec().clone())
}

fn check_rank(path: &str, spec: &PartitionSpec, shape: &LeafShape) -> Result<()> {
    if spec.rank() != shape.rank() {
        return Err(Error::PartitionRankMismatch {
            path: path.to_string(),
            spec_rank: spec.rank(),
            leaf_rank: shape.rank(),
        });
    }
    Ok(())
}

/// Map every leaf path to the spec of the first matching rule
///
/// Paths are visited in enumeration order, so an unresolved tree always
/// fails on the same path.
pub fn resolve(rules: &[PartitionRule], shapes: &TreeShape) -> Result<Tree<PartitionSpec>> {
    shapes.try_map(|path, shape| resolve_leaf(rules, path, shape))
}

/// Resolve optimizer-state leaves
///
/// A state leaf named `<slot>.<param path>` takes the spec of that
/// parameter when the ranks agree. Anything else goes through the rule
/// table like a parameter.
pub fn resolve_mirrored(
    rules: &[PartitionRule],
    state_shapes: &TreeShape,
    param_specs: &Tree<PartitionSpec>,
) -> Result<Tree<PartitionSpec>> {
    state_shapes.try_map(|path, shape| {
        let mirrored = path
            .split_once('.')
            .and_then(|(_, param)| param_specs.get(param))
            .filter(|spec| spec.rank() == shape.rank());
        match mirrored {
            Some(spec) => Ok(spec.clone()),
            None => resolve_leaf(rules, path, shape),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::DType;

    fn rules() -> Vec<PartitionRule> {
        vec![
            PartitionRule::new(r"lm\.table", PartitionSpec::from_axes([Some("dp"), None])).unwrap(),
            PartitionRule::new(r".*bias", PartitionSpec::from_axes([None::<&str>])).unwrap(),
            PartitionRule::new(r".*", PartitionSpec::from_axes([None, Some("mp")])).unwrap(),
        ]
    }

    fn shapes() -> TreeShape {
        let mut shapes = TreeShape::new();
        shapes.insert("lm.table", LeafShape::new([8, 4], DType::F32));
        shapes.insert("proj.bias", LeafShape::new([4], DType::F32));
        shapes.insert("proj.kernel", LeafShape::new([4, 4], DType::F32));
        shapes.insert("step_scale", LeafShape::new([], DType::F32));
        shapes
    }

    #[test]
    fn test_first_match_wins() {
        let specs = resolve(&rules(), &shapes()).unwrap();
        assert_eq!(specs.get("lm.table").unwrap().to_string(), "[dp, _]");
        assert_eq!(specs.get("proj.bias").unwrap().to_string(), "[_]");
        assert_eq!(specs.get("proj.kernel").unwrap().to_string(), "[_, mp]");
    }

    #[test]
    fn test_patterns_are_anchored() {
        let rule = PartitionRule::new("table", PartitionSpec::replicated(2)).unwrap();
        assert!(!rule.matches("lm.table"));
        assert!(rule.matches("table"));
    }

    #[test]
    fn test_scalars_are_replicated_without_rules() {
        let specs = resolve(&[], &{
            let mut s = TreeShape::new();
            s.insert("step_scale", LeafShape::new([], DType::F32));
            s.insert("gate", LeafShape::new([1, 1], DType::F32));
            s
        })
        .unwrap();
        assert_eq!(specs.get("step_scale").unwrap().rank(), 0);
        assert!(specs.get("gate").unwrap().is_replicated());
    }

    #[test]
    fn test_unmatched_leaf_is_fatal_and_deterministic() {
        let only_table = vec![rules().remove(0)];
        for _ in 0..3 {
            match resolve(&only_table, &shapes()) {
                Err(Error::UnresolvedPartition { path }) => assert_eq!(path, "proj.bias"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_rank_mismatch() {
        let rules = vec![PartitionRule::new(".*", PartitionSpec::from_axes([Some("dp")])).unwrap()];
        let mut s = TreeShape::new();
        s.insert("w", LeafShape::new([4, 4], DType::F32));
        assert!(matches!(
            resolve(&rules, &s),
            Err(Error::PartitionRankMismatch { spec_rank: 1, leaf_rank: 2, .. })
        ));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(matches!(
            PartitionRule::new("(", PartitionSpec::default()),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_optimizer_state_mirrors_params() {
        let params = resolve(&rules(), &shapes()).unwrap();
        let mut state = TreeShape::new();
        state.insert("mu.lm.table", LeafShape::new([8, 4], DType::F32));
        state.insert("nu.proj.kernel", LeafShape::new([4, 4], DType::F32));
        state.insert("count", LeafShape::new([], DType::I64));
        let specs = resolve_mirrored(&[], &state, &params).unwrap();
        assert_eq!(specs.get("mu.lm.table"), params.get("lm.table"));
        assert_eq!(specs.get("nu.proj.kernel"), params.get("proj.kernel"));
        assert_eq!(specs.get("count").unwrap().rank(), 0);
    }
}
