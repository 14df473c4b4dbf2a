//! Dtype-tagged tensor leaves

use crate::{Error, Result};
use ndarray::{ArrayD, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::ops::Range;

/// Element type of a leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DType {
    /// Stable one-byte tag used by the checkpoint format
    pub fn tag(self) -> u8 {
        match self {
            DType::F32 => 0,
            DType::F64 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::U8 => 4,
        }
    }

    /// Inverse of [`DType::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DType::F32),
            1 => Some(DType::F64),
            2 => Some(DType::I32),
            3 => Some(DType::I64),
            4 => Some(DType::U8),
            _ => None,
        }
    }

    /// Size of one element in bytes
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape and dtype of a leaf, without data
///
/// This is what shape-only evaluation of a model produces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeafShape {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl LeafShape {
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size_of()
    }

    /// Byte size, or `None` if it does not fit in `usize`
    pub fn checked_nbytes(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(self.dtype.size_of(), |acc, &dim| acc.checked_mul(dim))
    }

    /// Fail with the offending path if `other` differs in shape or dtype
    pub fn check(&self, path: &str, other: &LeafShape) -> Result<()> {
        if self.shape != other.shape {
            return Err(Error::ShapeMismatch {
                path: path.to_string(),
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        if self.dtype != other.dtype {
            return Err(Error::DTypeMismatch {
                path: path.to_string(),
                expected: self.dtype,
                got: other.dtype,
            });
        }
        Ok(())
    }
}

/// A single named tensor value
///
/// Each variant owns an n-dimensional array of one element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
}

/// Apply the same expression to the array inside any variant
macro_rules! with_array {
    ($leaf:expr, $arr:ident => $body:expr) => {
        match $leaf {
            Leaf::F32($arr) => $body,
            Leaf::F64($arr) => $body,
            Leaf::I32($arr) => $body,
            Leaf::I64($arr) => $body,
            Leaf::U8($arr) => $body,
        }
    };
}

/// Like `with_array!`, rewrapping the result in the same variant
macro_rules! map_array {
    ($leaf:expr, $arr:ident => $body:expr) => {
        match $leaf {
            Leaf::F32($arr) => Leaf::F32($body),
            Leaf::F64($arr) => Leaf::F64($body),
            Leaf::I32($arr) => Leaf::I32($body),
            Leaf::I64($arr) => Leaf::I64($body),
            Leaf::U8($arr) => Leaf::U8($body),
        }
    };
}

fn from_shape_vec<T>(shape: &[usize], data: Vec<T>) -> Result<ArrayD<T>> {
    let len = data.len();
    ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| Error::ShapeMismatch {
        path: String::new(),
        expected: shape.to_vec(),
        got: vec![len],
    })
}

fn slice_info(ranges: &[Range<usize>]) -> impl Fn(ndarray::AxisDescription) -> Slice + '_ {
    move |ax| Slice::from(ranges[ax.axis.index()].clone())
}

impl Leaf {
    /// Zero-filled leaf of the given shape and dtype
    pub fn zeros(shape: &LeafShape) -> Self {
        let dim = IxDyn(&shape.shape);
        match shape.dtype {
            DType::F32 => Leaf::F32(ArrayD::zeros(dim)),
            DType::F64 => Leaf::F64(ArrayD::zeros(dim)),
            DType::I32 => Leaf::I32(ArrayD::zeros(dim)),
            DType::I64 => Leaf::I64(ArrayD::zeros(dim)),
            DType::U8 => Leaf::U8(ArrayD::zeros(dim)),
        }
    }

    pub fn f32(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        Ok(Leaf::F32(from_shape_vec(shape, data)?))
    }

    pub fn f64(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        Ok(Leaf::F64(from_shape_vec(shape, data)?))
    }

    pub fn i32(shape: &[usize], data: Vec<i32>) -> Result<Self> {
        Ok(Leaf::I32(from_shape_vec(shape, data)?))
    }

    pub fn i64(shape: &[usize], data: Vec<i64>) -> Result<Self> {
        Ok(Leaf::I64(from_shape_vec(shape, data)?))
    }

    pub fn u8(shape: &[usize], data: Vec<u8>) -> Result<Self> {
        Ok(Leaf::U8(from_shape_vec(shape, data)?))
    }

    /// Scalar f32 leaf (rank 0)
    pub fn scalar_f32(value: f32) -> Self {
        Leaf::F32(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn dtype(&self) -> DType {
        match self {
            Leaf::F32(_) => DType::F32,
            Leaf::F64(_) => DType::F64,
            Leaf::I32(_) => DType::I32,
            Leaf::I64(_) => DType::I64,
            Leaf::U8(_) => DType::U8,
        }
    }

    pub fn shape(&self) -> &[usize] {
        with_array!(self, a => a.shape())
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    pub fn numel(&self) -> usize {
        with_array!(self, a => a.len())
    }

    pub fn leaf_shape(&self) -> LeafShape {
        LeafShape::new(self.shape(), self.dtype())
    }

    pub fn zeros_like(&self) -> Self {
        Leaf::zeros(&self.leaf_shape())
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            Leaf::F32(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut ArrayD<f32>> {
        match self {
            Leaf::F32(a) => Some(a),
            _ => None,
        }
    }

    /// Copy out the hyper-rectangle selected by one range per axis
    pub fn slice(&self, ranges: &[Range<usize>]) -> Leaf {
        map_array!(self, a => a.slice_each_axis(slice_info(ranges)).to_owned())
    }

    /// Write `src` into the hyper-rectangle selected by `ranges`
    pub fn assign_slice(&mut self, ranges: &[Range<usize>], src: &Leaf) -> Result<()> {
        match (self, src) {
            (Leaf::F32(dst), Leaf::F32(s)) => dst.slice_each_axis_mut(slice_info(ranges)).assign(s),
            (Leaf::F64(dst), Leaf::F64(s)) => dst.slice_each_axis_mut(slice_info(ranges)).assign(s),
            (Leaf::I32(dst), Leaf::I32(s)) => dst.slice_each_axis_mut(slice_info(ranges)).assign(s),
            (Leaf::I64(dst), Leaf::I64(s)) => dst.slice_each_axis_mut(slice_info(ranges)).assign(s),
            (Leaf::U8(dst), Leaf::U8(s)) => dst.slice_each_axis_mut(slice_info(ranges)).assign(s),
            (dst, s) => {
                return Err(Error::DTypeMismatch {
                    path: String::new(),
                    expected: dst.dtype(),
                    got: s.dtype(),
                })
            }
        }
        Ok(())
    }

    /// Write the elements in row-major order as raw little-endian bytes
    ///
    /// Assumes a little-endian host, like the safetensors layout.
    pub fn write_raw<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        with_array!(self, a => {
            let contiguous = a.as_standard_layout();
            match contiguous.as_slice() {
                Some(values) => writer.write_all(bytemuck::cast_slice(values)),
                None => Err(std::io::Error::other("leaf is not contiguous")),
            }
        })
    }

    /// Raw bytes of the leaf in row-major order
    pub fn to_raw_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.numel() * self.dtype().size_of());
        // Writing into a Vec cannot fail.
        let _ = self.write_raw(&mut bytes);
        bytes
    }

    /// Rebuild a leaf from raw row-major bytes
    pub fn from_raw(shape: &LeafShape, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != shape.nbytes() {
            return Err(Error::Serialization(format!(
                "expected {} bytes for {} {:?}, got {}",
                shape.nbytes(),
                shape.dtype,
                shape.shape,
                bytes.len()
            )));
        }
        let dims = &shape.shape;
        match shape.dtype {
            DType::F32 => Leaf::f32(dims, bytemuck::pod_collect_to_vec(bytes)),
            DType::F64 => Leaf::f64(dims, bytemuck::pod_collect_to_vec(bytes)),
            DType::I32 => Leaf::i32(dims, bytemuck::pod_collect_to_vec(bytes)),
            DType::I64 => Leaf::i64(dims, bytemuck::pod_collect_to_vec(bytes)),
            DType::U8 => Leaf::u8(dims, bytes.to_vec()),
        }
    }

    /// Bit-level equality (treats identical NaN payloads as equal)
    pub fn same_bits(&self, other: &Leaf) -> bool {
        self.dtype() == other.dtype()
            && self.shape() == other.shape()
            && self.to_raw_bytes() == other.to_raw_bytes()
    }

    /// Sum of squared elements, accumulated in f64
    pub fn sum_squares(&self) -> f64 {
        match self {
            Leaf::F32(a) => a.iter().map(|&x| (x as f64) * (x as f64)).sum(),
            Leaf::F64(a) => a.iter().map(|&x| x * x).sum(),
            Leaf::I32(a) => a.iter().map(|&x| (x as f64) * (x as f64)).sum(),
            Leaf::I64(a) => a.iter().map(|&x| (x as f64) * (x as f64)).sum(),
            Leaf::U8(a) => a.iter().map(|&x| (x as f64) * (x as f64)).sum(),
        }
    }

    /// `self += alpha * x`, elementwise; float leaves only
    pub fn axpy(&mut self, alpha: f64, x: &Leaf) -> Result<()> {
        if self.shape() != x.shape() {
            return Err(Error::ShapeMismatch {
                path: String::new(),
                expected: self.shape().to_vec(),
                got: x.shape().to_vec(),
            });
        }
        match (self, x) {
            (Leaf::F32(y), Leaf::F32(x)) => y.scaled_add(alpha as f32, x),
            (Leaf::F64(y), Leaf::F64(x)) => y.scaled_add(alpha, x),
            (y, x) => {
                return Err(Error::DTypeMismatch {
                    path: String::new(),
                    expected: y.dtype(),
                    got: x.dtype(),
                })
            }
        }
        Ok(())
    }

    /// Multiply every element by `factor`; float leaves only
    pub fn scale(&mut self, factor: f64) -> Result<()> {
        match self {
            Leaf::F32(a) => a.mapv_inplace(|x| x * factor as f32),
            Leaf::F64(a) => a.mapv_inplace(|x| x * factor),
            other => {
                return Err(Error::DTypeMismatch {
                    path: String::new(),
                    expected: DType::F32,
                    got: other.dtype(),
                })
            }
        }
        Ok(())
    }
}

/// Attach a leaf path to errors raised by path-less leaf operations
pub(crate) fn at_path(path: &str, err: Error) -> Error {
    match err {
        Error::ShapeMismatch {
            path: p,
            expected,
            got,
        } if p.is_empty() => Error::ShapeMismatch {
            path: path.to_string(),
            expected,
            got,
        },
        Error::DTypeMismatch {
            path: p,
            expected,
            got,
        } if p.is_empty() => Error::DTypeMismatch {
            path: path.to_string(),
            expected,
            got,
        },
        other => other,
    }
}
