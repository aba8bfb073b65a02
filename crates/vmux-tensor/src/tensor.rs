//! Tensor headers: dtype and shape metadata over a device buffer

use crate::buffer::DeviceBuffer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use vmux_resource::DeviceSpec;

/// Tensor element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TensorDtype {
    /// 32-bit float
    #[default]
    Float32,
    /// 16-bit float (half precision)
    Float16,
    /// Brain float 16
    BFloat16,
    /// 32-bit integer
    Int32,
    /// 64-bit integer
    Int64,
    /// 8-bit unsigned integer
    UInt8,
}

impl TensorDtype {
    /// Element size in bytes
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        match self {
            TensorDtype::Float32 | TensorDtype::Int32 => 4,
            TensorDtype::Float16 | TensorDtype::BFloat16 => 2,
            TensorDtype::Int64 => 8,
            TensorDtype::UInt8 => 1,
        }
    }

    /// Short lowercase name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            TensorDtype::Float32 => "float32",
            TensorDtype::Float16 => "float16",
            TensorDtype::BFloat16 => "bfloat16",
            TensorDtype::Int32 => "int32",
            TensorDtype::Int64 => "int64",
            TensorDtype::UInt8 => "uint8",
        }
    }
}

impl fmt::Display for TensorDtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape and dtype of a tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Element type
    pub dtype: TensorDtype,
    /// Dimension sizes
    pub shape: Vec<usize>,
}

impl TensorMeta {
    /// Create metadata for a shape and dtype
    #[must_use]
    pub fn new(shape: Vec<usize>, dtype: TensorDtype) -> Self {
        Self { dtype, shape }
    }

    /// Number of elements
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Total size in bytes
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        (self.numel() * self.dtype.size_bytes()) as u64
    }

    /// Number of dimensions
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

/// A tensor header: metadata plus the buffer backing it
///
/// Headers are cheap to clone and re-target; the data itself never
/// moves unless the backing buffer does.
#[derive(Debug, Clone)]
pub struct Tensor {
    meta: TensorMeta,
    buffer: Arc<DeviceBuffer>,
}

impl Tensor {
    /// Create a header over a buffer
    #[must_use]
    pub fn new(meta: TensorMeta, buffer: Arc<DeviceBuffer>) -> Self {
        Self { meta, buffer }
    }

    /// Metadata
    #[inline]
    #[must_use]
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    /// Backing buffer
    #[inline]
    #[must_use]
    pub fn buffer(&self) -> &Arc<DeviceBuffer> {
        &self.buffer
    }

    /// Device the tensor data lives on
    #[inline]
    #[must_use]
    pub fn spec(&self) -> DeviceSpec {
        self.buffer.spec()
    }

    /// Duplicate the header onto a different buffer without copying data
    #[must_use]
    pub fn clone_with_buffer(&self, buffer: &Arc<DeviceBuffer>) -> Self {
        Self {
            meta: self.meta.clone(),
            buffer: Arc::clone(buffer),
        }
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}@{}", self.meta.dtype, self.meta.shape, self.spec())
    }
}
