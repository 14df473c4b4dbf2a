//! Logical device mesh

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named axis of the device mesh
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    pub fn new(name: impl Into<String>, size: usize) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::ConfigError("mesh axis name must not be empty".into()));
        }
        if size == 0 {
            return Err(Error::ConfigError(format!(
                "mesh axis '{name}' must have a positive size"
            )));
        }
        Ok(Self { name, size })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// An explicit description of the device grid
///
/// Devices are numbered `0..device_count()` in row-major order over the
/// axes, so the last axis varies fastest. The mesh is a plain value passed
/// to whoever needs it; there is no process-wide mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mesh {
    axes: Vec<MeshAxis>,
}

impl Mesh {
    pub fn new(axes: Vec<MeshAxis>) -> Result<Self> {
        for (i, axis) in axes.iter().enumerate() {
            if axes[..i].iter().any(|a| a.name == axis.name) {
                return Err(Error::ConfigError(format!(
                    "mesh axis '{}' is declared twice",
                    axis.name
                )));
            }
        }
        Ok(Self { axes })
    }

    /// A single-device mesh
    ///
    /// Keeps the usual `dp` and `mp` axes at size 1 so rules written for a
    /// larger mesh still resolve.
    pub fn single() -> Self {
        Self {
            axes: vec![
                MeshAxis { name: "dp".to_string(), size: 1 },
                MeshAxis { name: "mp".to_string(), size: 1 },
            ],
        }
    }

    /// Parse a descriptor such as `dp=2,mp=4`
    ///
    /// At most one axis may have size `-1`; it absorbs whatever is left of
    /// `device_count`. The product of all sizes must equal `device_count`.
    pub fn parse(descriptor: &str, device_count: usize) -> Result<Self> {
        let descriptor = descriptor.trim();
        if descriptor.is_empty() {
            return if device_count == 1 {
                Ok(Self::single())
            } else {
                Err(Error::ConfigError(format!(
                    "empty mesh descriptor cannot cover {device_count} devices"
                )))
            };
        }

        let mut entries: Vec<(String, Option<usize>)> = Vec::new();
        for part in descriptor.split(',') {
            let (name, size) = part.split_once('=').ok_or_else(|| {
                Error::ConfigError(format!("mesh entry '{part}' is not of the form name=size"))
            })?;
            let size: i64 = size.trim().parse().map_err(|_| {
                Error::ConfigError(format!("mesh entry '{part}' has a non-integer size"))
            })?;
            let size = match size {
                -1 => None,
                s if s > 0 => Some(s as usize),
                _ => {
                    return Err(Error::ConfigError(format!(
                        "mesh entry '{part}' must have a positive size or -1"
                    )))
                }
            };
            entries.push((name.trim().to_string(), size));
        }

        let wildcards = entries.iter().filter(|(_, s)| s.is_none()).count();
        if wildcards > 1 {
            return Err(Error::ConfigError(format!(
                "mesh descriptor '{descriptor}' has more than one -1 axis"
            )));
        }
        let known: usize = entries.iter().filter_map(|(_, s)| *s).product();
        if known == 0 || device_count % known != 0 {
            return Err(Error::ConfigError(format!(
                "mesh descriptor '{descriptor}' does not divide {device_count} devices"
            )));
        }
        let inferred = device_count / known;

        let axes = entries
            .into_iter()
            .map(|(name, size)| MeshAxis::new(name, size.unwrap_or(inferred)))
            .collect::<Result<Vec<_>>>()?;
        let mesh = Self::new(axes)?;
        if mesh.device_count() != device_count {
            return Err(Error::ConfigError(format!(
                "mesh '{mesh}' has {} devices, expected {device_count}",
                mesh.device_count()
            )));
        }
        Ok(mesh)
    }

    pub fn axes(&self) -> &[MeshAxis] {
        &self.axes
    }

    pub fn device_count(&self) -> usize {
        self.axes.iter().map(MeshAxis::size).product()
    }

    pub fn axis_index(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name == name)
    }

    pub fn axis_size(&self, name: &str) -> Option<usize> {
        self.axes.iter().find(|a| a.name == name).map(MeshAxis::size)
    }

    /// Row-major mesh coordinate of `device`
    pub fn coordinate(&self, mut device: usize) -> Vec<usize> {
        let mut coordinate = vec![0usize; self.axes.len()];
        for axis in (0..self.axes.len()).rev() {
            let size = self.axes[axis].size;
            coordinate[axis] = device % size;
            device /= size;
        }
        coordinate
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .axes
            .iter()
            .map(|a| format!("{}={}", a.name, a.size))
            .collect();
        f.write_str(&parts.join(","))
    }
}
