//! SafeTensors import

use crate::tree::{DType, Leaf, LeafShape, ParameterTree};
use crate::{Error, Result};
use safetensors::tensor::Dtype;
use safetensors::SafeTensors;
use std::path::Path;

fn from_safetensors_dtype(name: &str, dtype: Dtype) -> Result<DType> {
    match dtype {
        Dtype::F32 => Ok(DType::F32),
        Dtype::F64 => Ok(DType::F64),
        Dtype::I32 => Ok(DType::I32),
        Dtype::I64 => Ok(DType::I64),
        Dtype::U8 => Ok(DType::U8),
        other => Err(Error::Serialization(format!(
            "tensor '{name}' has unsupported dtype {other:?}"
        ))),
    }
}

/// Load a SafeTensors file into a plain parameter tree
///
/// Tensor names are used as leaf paths.
pub fn load_safetensors(path: impl AsRef<Path>) -> Result<ParameterTree> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&data).map_err(|e| {
        Error::Serialization(format!("SafeTensors parsing failed for {}: {e}", path.display()))
    })?;

    let mut tree = ParameterTree::new();
    for (name, view) in tensors.tensors() {
        let dtype = from_safetensors_dtype(&name, view.dtype())?;
        let shape = LeafShape::new(view.shape(), dtype);
        let leaf = Leaf::from_raw(&shape, view.data())?;
        tree.insert(name, leaf);
    }
    Ok(tree)
}
