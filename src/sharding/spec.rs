//! Per-axis partition specifications

use serde::{Deserialize, Serialize};
use std::fmt;

/// How one tensor dimension is laid out over the mesh
///
/// In config files a label is either a mesh axis name or `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum AxisLabel {
    /// Replicated along this dimension
    Unsharded,
    /// Split evenly along the named mesh axis
    Mesh(String),
}

impl From<Option<String>> for AxisLabel {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(name) => AxisLabel::Mesh(name),
            None => AxisLabel::Unsharded,
        }
    }
}

impl From<AxisLabel> for Option<String> {
    fn from(label: AxisLabel) -> Self {
        match label {
            AxisLabel::Unsharded => None,
            AxisLabel::Mesh(name) => Some(name),
        }
    }
}

impl fmt::Display for AxisLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisLabel::Unsharded => f.write_str("_"),
            AxisLabel::Mesh(name) => f.write_str(name),
        }
    }
}

/// One [`AxisLabel`] per tensor dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionSpec(Vec<AxisLabel>);

impl PartitionSpec {
    pub fn new(labels: Vec<AxisLabel>) -> Self {
        Self(labels)
    }

    /// Fully replicated spec of the given rank
    pub fn replicated(rank: usize) -> Self {
        Self(vec![AxisLabel::Unsharded; rank])
    }

    /// Build from a list of optional axis names, `None` meaning unsharded
    pub fn from_axes<S: Into<String>>(axes: impl IntoIterator<Item = Option<S>>) -> Self {
        Self(
            axes.into_iter()
                .map(|a| AxisLabel::from(a.map(Into::into)))
                .collect(),
        )
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn labels(&self) -> &[AxisLabel] {
        &self.0
    }

    pub fn is_replicated(&self) -> bool {
        self.0.iter().all(|l| *l == AxisLabel::Unsharded)
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", labels.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_nulls_are_unsharded() {
        let spec: PartitionSpec = serde_yaml::from_str("[dp, null]").unwrap();
        assert_eq!(spec, PartitionSpec::from_axes([Some("dp"), None]));
        assert_eq!(spec.to_string(), "[dp, _]");
        assert!(!spec.is_replicated());
    }

    #[test]
    fn test_replicated() {
        let spec = PartitionSpec::replicated(3);
        assert_eq!(spec.rank(), 3);
        assert!(spec.is_replicated());
    }
}
