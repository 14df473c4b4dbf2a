//! SafeTensors export

use crate::tree::{DType, ParameterTree};
use crate::{Error, Result};
use safetensors::tensor::{Dtype, TensorView};
use std::collections::HashMap;
use std::path::Path;

pub(crate) fn to_safetensors_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F32 => Dtype::F32,
        DType::F64 => Dtype::F64,
        DType::I32 => Dtype::I32,
        DType::I64 => Dtype::I64,
        DType::U8 => Dtype::U8,
    }
}

/// Save a plain (unsharded) parameter tree in SafeTensors format
///
/// Leaf paths become tensor names. `metadata` is stored in the file header.
pub fn save_safetensors(
    tree: &ParameterTree,
    path: impl AsRef<Path>,
    metadata: Option<HashMap<String, String>>,
) -> Result<()> {
    let tensor_data: Vec<(&str, DType, Vec<usize>, Vec<u8>)> = tree
        .iter()
        .map(|(name, leaf)| (name, leaf.dtype(), leaf.shape().to_vec(), leaf.to_raw_bytes()))
        .collect();

    let views = tensor_data
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(to_safetensors_dtype(*dtype), shape.clone(), bytes)
                .map(|view| (*name, view))
                .map_err(|e| Error::Serialization(format!("tensor '{name}': {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let bytes = safetensors::serialize(views, &metadata)
        .map_err(|e| Error::Serialization(format!("SafeTensors serialization failed: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
}
