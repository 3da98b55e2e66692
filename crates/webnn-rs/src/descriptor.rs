use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{validation_ensure, WebnnResult};

/// Element types an operand can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    /// 32-bit IEEE float.
    Float32,
    /// 16-bit IEEE float.
    Float16,
    /// 32-bit signed integer.
    Int32,
    /// 32-bit unsigned integer.
    Uint32,
    /// 8-bit signed integer.
    Int8,
    /// 8-bit unsigned integer.
    Uint8,
}

impl OperandType {
    pub fn is_float(self) -> bool {
        matches!(self, OperandType::Float32 | OperandType::Float16)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            OperandType::Float32 | OperandType::Int32 | OperandType::Uint32 => 4,
            OperandType::Float16 => 2,
            OperandType::Int8 | OperandType::Uint8 => 1,
        }
    }
}

impl fmt::Display for OperandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperandType::Float32 => "float32",
            OperandType::Float16 => "float16",
            OperandType::Int32 => "int32",
            OperandType::Uint32 => "uint32",
            OperandType::Int8 => "int8",
            OperandType::Uint8 => "uint8",
        };
        f.write_str(name)
    }
}

/// Caller-facing description of an input or constant: element type plus signed dimensions.
///
/// Dimensions are signed so that malformed descriptors can be reported as validation errors
/// rather than silently wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandDescriptor {
    #[serde(rename = "type")]
    pub ty: OperandType,
    pub dimensions: Vec<i32>,
}

impl OperandDescriptor {
    pub fn new(ty: OperandType, dimensions: impl Into<Vec<i32>>) -> Self {
        Self {
            ty,
            dimensions: dimensions.into(),
        }
    }

    /// Checks dimensions and converts to a validated [`TensorSpec`].
    pub fn to_spec(&self) -> WebnnResult<TensorSpec> {
        let mut dims = Vec::with_capacity(self.dimensions.len());
        for (axis, &dim) in self.dimensions.iter().enumerate() {
            validation_ensure!(
                dim >= 0,
                "dimension {axis} of the operand descriptor is negative ({dim})"
            );
            dims.push(dim as u32);
        }
        let spec = TensorSpec::new(self.ty, Shape::new(dims));
        validation_ensure!(
            spec.byte_len().is_some(),
            "operand descriptor {:?} overflows the addressable size",
            self.dimensions
        );
        Ok(spec)
    }
}

/// Static tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: SmallVec<[u32; 4]>,
}

impl Shape {
    pub fn new(dims: impl IntoIterator<Item = u32>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    pub fn scalar() -> Self {
        Self::default()
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[u32] {
        &self.dims
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.dims.to_vec()
    }

    /// Number of elements; a rank-0 shape holds one element.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim as usize))
    }
}

impl From<Vec<u32>> for Shape {
    fn from(dims: Vec<u32>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[u32]> for Shape {
    fn from(dims: &[u32]) -> Self {
        Shape::new(dims.iter().copied())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims.as_slice())
    }
}

/// Type and shape of an operand after inference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub ty: OperandType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(ty: OperandType, shape: impl Into<Shape>) -> Self {
        Self {
            ty,
            shape: shape.into(),
        }
    }

    pub fn dims(&self) -> &[u32] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.shape
            .element_count()
            .and_then(|count| count.checked_mul(self.ty.size_in_bytes()))
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.ty, self.shape)
    }
}
