//! Native tensor descriptors and the stride algebra used for zero-copy views.

use serde::Serialize;

use crate::descriptor::OperandType;
use crate::error::{lowering_ensure, WebnnError, WebnnResult};
use crate::graph::ops::{
    Conv2dFilterOperandLayout, ConvTranspose2dFilterOperandLayout, InputOperandLayout,
};

/// Upper bound on descriptor rank across native backends.
pub const MAX_TENSOR_DIMENSIONS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NativeDataType {
    Float32,
    Float16,
    Int32,
    Uint32,
}

impl NativeDataType {
    pub fn size_in_bytes(self) -> u64 {
        match self {
            NativeDataType::Float32 | NativeDataType::Int32 | NativeDataType::Uint32 => 4,
            NativeDataType::Float16 => 2,
        }
    }

    pub fn from_operand_type(ty: OperandType) -> WebnnResult<Self> {
        match ty {
            OperandType::Float32 => Ok(NativeDataType::Float32),
            OperandType::Float16 => Ok(NativeDataType::Float16),
            OperandType::Int32 => Ok(NativeDataType::Int32),
            OperandType::Uint32 => Ok(NativeDataType::Uint32),
            OperandType::Int8 | OperandType::Uint8 => Err(WebnnError::lowering(format!(
                "operand type {ty} is not supported by native tensors"
            ))),
        }
    }
}

/// Dimensions, optional strides and element type of a native tensor.
///
/// `strides == None` means densely packed row-major. A stride of 0 repeats the same element along
/// that axis (broadcast).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeTensorDesc {
    pub data_type: NativeDataType,
    pub dims: Vec<u32>,
    pub strides: Option<Vec<u32>>,
    /// Set for constants whose storage the backend takes over at initialization.
    pub owned_by_backend: bool,
}

impl NativeTensorDesc {
    /// Dense descriptor; rank-0 shapes are promoted to `[1]`.
    pub fn new(data_type: NativeDataType, dims: &[u32]) -> WebnnResult<Self> {
        let dims = if dims.is_empty() { vec![1] } else { dims.to_vec() };
        lowering_ensure!(
            dims.len() <= MAX_TENSOR_DIMENSIONS,
            "tensor rank {} exceeds the maximum of {MAX_TENSOR_DIMENSIONS}",
            dims.len()
        );
        Ok(Self {
            data_type,
            dims,
            strides: None,
            owned_by_backend: false,
        })
    }

    pub fn from_operand(ty: OperandType, dims: &[u32]) -> WebnnResult<Self> {
        Self::new(NativeDataType::from_operand_type(ty)?, dims)
    }

    pub fn with_strides(mut self, strides: Vec<u32>) -> WebnnResult<Self> {
        lowering_ensure!(
            strides.len() == self.dims.len(),
            "stride count {} does not match rank {}",
            strides.len(),
            self.dims.len()
        );
        self.strides = Some(strides);
        Ok(self)
    }

    pub fn owned_by_backend(mut self, owned: bool) -> Self {
        self.owned_by_backend = owned;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn element_count(&self) -> u64 {
        self.dims.iter().map(|&d| d as u64).product()
    }

    /// Strides in elements, synthesizing packed strides when none are set.
    pub fn effective_strides(&self) -> Vec<u32> {
        match &self.strides {
            Some(strides) => strides.clone(),
            None => contiguous_strides(&self.dims),
        }
    }

    /// Whether the descriptor addresses memory in packed row-major order.
    pub fn is_contiguous(&self) -> bool {
        match &self.strides {
            None => true,
            Some(strides) => self
                .dims
                .iter()
                .zip(strides)
                .zip(contiguous_strides(&self.dims))
                .all(|((&dim, &stride), packed)| dim == 1 || stride == packed),
        }
    }

    /// Bytes spanned by the descriptor, rounded up to 4.
    pub fn total_bytes(&self) -> u64 {
        let element_size = self.data_type.size_in_bytes();
        let elements = match &self.strides {
            None => self.element_count(),
            Some(strides) => {
                if self.dims.iter().any(|&d| d == 0) {
                    0
                } else {
                    self.dims
                        .iter()
                        .zip(strides)
                        .map(|(&dim, &stride)| (dim as u64 - 1) * stride as u64)
                        .sum::<u64>()
                        + 1
                }
            }
        };
        (elements * element_size + 3) & !3
    }

    /// Dense descriptor over the same storage with new dimensions.
    pub fn reshaped(&self, dims: &[u32]) -> WebnnResult<Self> {
        let mut desc = Self::new(self.data_type, dims)?;
        desc.owned_by_backend = self.owned_by_backend;
        Ok(desc)
    }

    /// View with axes reordered: output axis `i` reads input axis `permutation[i]`.
    pub fn permuted(&self, permutation: &[u32]) -> WebnnResult<Self> {
        lowering_ensure!(
            permutation.len() == self.rank(),
            "permutation {permutation:?} does not match rank {}",
            self.rank()
        );
        let strides = self.effective_strides();
        let mut dims = Vec::with_capacity(permutation.len());
        let mut permuted = Vec::with_capacity(permutation.len());
        for &axis in permutation {
            let axis = axis as usize;
            lowering_ensure!(axis < self.rank(), "permutation axis {axis} is out of range");
            dims.push(self.dims[axis]);
            permuted.push(strides[axis]);
        }
        Ok(Self {
            data_type: self.data_type,
            dims,
            strides: Some(permuted),
            owned_by_backend: self.owned_by_backend,
        })
    }

    /// View with a size-1 axis inserted at `position`.
    pub fn with_unit_axis(&self, position: usize) -> WebnnResult<Self> {
        lowering_ensure!(
            position <= self.rank() && self.rank() < MAX_TENSOR_DIMENSIONS,
            "cannot insert an axis at {position} into rank {}",
            self.rank()
        );
        let mut dims = self.dims.clone();
        dims.insert(position, 1);
        let strides = self.strides.as_ref().map(|strides| {
            let mut strides = strides.clone();
            strides.insert(position, 0);
            strides
        });
        Ok(Self {
            dims,
            strides,
            ..self.clone()
        })
    }

    /// View with leading size-1 axes until the rank reaches `rank`.
    pub fn expanded_to_rank(&self, rank: usize) -> WebnnResult<Self> {
        let mut desc = self.clone();
        while desc.rank() < rank {
            desc = desc.with_unit_axis(0)?;
        }
        Ok(desc)
    }

    /// View `[C]` as `[1, C, 1, 1]`.
    pub fn as_channel_vector(&self) -> WebnnResult<Self> {
        lowering_ensure!(
            self.rank() == 1,
            "channel vector must be 1-D, got {:?}",
            self.dims
        );
        self.with_unit_axis(0)?.with_unit_axis(2)?.with_unit_axis(3)
    }
}

/// Packed row-major strides.
pub fn contiguous_strides(dims: &[u32]) -> Vec<u32> {
    let mut strides = vec![1u32; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1].saturating_mul(dims[axis + 1]);
    }
    strides
}

/// Broadcasts `desc` to `target` by synthesizing zero strides.
///
/// New leading axes and size-1 axes stretched against a larger target get stride 0. The trailing
/// `skip_axes` axes keep their own dimensions (used by matrix multiplication).
pub fn broadcast_desc(
    desc: &NativeTensorDesc,
    target: &[u32],
    skip_axes: usize,
) -> WebnnResult<NativeTensorDesc> {
    let rank = target.len();
    lowering_ensure!(
        desc.rank() <= rank && skip_axes <= desc.rank(),
        "cannot broadcast {:?} to {target:?}",
        desc.dims
    );
    let offset = rank - desc.rank();
    let strides = desc.effective_strides();
    let mut dims = Vec::with_capacity(rank);
    let mut out_strides = Vec::with_capacity(rank);
    let mut broadcasted = offset > 0;
    for axis in 0..rank {
        if axis < offset {
            dims.push(target[axis]);
            out_strides.push(0);
            continue;
        }
        let source = axis - offset;
        let dim = desc.dims[source];
        if axis >= rank - skip_axes {
            dims.push(dim);
            out_strides.push(strides[source]);
        } else if dim == target[axis] {
            dims.push(dim);
            out_strides.push(strides[source]);
        } else if dim == 1 {
            dims.push(target[axis]);
            out_strides.push(0);
            broadcasted = true;
        } else {
            return Err(WebnnError::lowering(format!(
                "cannot broadcast {:?} to {target:?}",
                desc.dims
            )));
        }
    }
    if !broadcasted && desc.strides.is_none() {
        return Ok(NativeTensorDesc {
            dims,
            ..desc.clone()
        });
    }
    desc.clone().reshaped_view(dims, out_strides)
}

impl NativeTensorDesc {
    fn reshaped_view(mut self, dims: Vec<u32>, strides: Vec<u32>) -> WebnnResult<Self> {
        lowering_ensure!(
            dims.len() <= MAX_TENSOR_DIMENSIONS,
            "tensor rank {} exceeds the maximum of {MAX_TENSOR_DIMENSIONS}",
            dims.len()
        );
        self.dims = dims;
        self.with_strides(strides)
    }
}

/// Reinterprets an NHWC tensor as NCHW by permuting strides.
pub fn nhwc_as_nchw(desc: &NativeTensorDesc) -> WebnnResult<NativeTensorDesc> {
    lowering_ensure!(desc.rank() == 4, "layout conversion requires a 4-D tensor");
    desc.permuted(&[0, 3, 1, 2])
}

/// Reinterprets an NCHW tensor as NHWC by permuting strides.
pub fn nchw_as_nhwc(desc: &NativeTensorDesc) -> WebnnResult<NativeTensorDesc> {
    lowering_ensure!(desc.rank() == 4, "layout conversion requires a 4-D tensor");
    desc.permuted(&[0, 2, 3, 1])
}

pub fn input_as_nchw(
    desc: &NativeTensorDesc,
    layout: InputOperandLayout,
) -> WebnnResult<NativeTensorDesc> {
    match layout {
        InputOperandLayout::Nchw => Ok(desc.clone()),
        InputOperandLayout::Nhwc => nhwc_as_nchw(desc),
    }
}

pub fn output_from_nchw(
    desc: &NativeTensorDesc,
    layout: InputOperandLayout,
) -> WebnnResult<NativeTensorDesc> {
    match layout {
        InputOperandLayout::Nchw => Ok(desc.clone()),
        InputOperandLayout::Nhwc => nchw_as_nhwc(desc),
    }
}

/// Views a convolution filter as OIHW.
pub fn filter_as_oihw(
    desc: &NativeTensorDesc,
    layout: Conv2dFilterOperandLayout,
) -> WebnnResult<NativeTensorDesc> {
    lowering_ensure!(desc.rank() == 4, "filter must be 4-D");
    match layout {
        Conv2dFilterOperandLayout::Oihw => Ok(desc.clone()),
        Conv2dFilterOperandLayout::Hwio => desc.permuted(&[3, 2, 0, 1]),
        Conv2dFilterOperandLayout::Ohwi => desc.permuted(&[0, 3, 1, 2]),
        Conv2dFilterOperandLayout::Ihwo => desc.permuted(&[3, 0, 1, 2]),
    }
}

/// Views a transposed-convolution filter as IOHW.
pub fn filter_as_iohw(
    desc: &NativeTensorDesc,
    layout: ConvTranspose2dFilterOperandLayout,
) -> WebnnResult<NativeTensorDesc> {
    lowering_ensure!(desc.rank() == 4, "filter must be 4-D");
    match layout {
        ConvTranspose2dFilterOperandLayout::Iohw => Ok(desc.clone()),
        ConvTranspose2dFilterOperandLayout::Hwoi => desc.permuted(&[3, 2, 0, 1]),
        ConvTranspose2dFilterOperandLayout::Ohwi => desc.permuted(&[3, 0, 1, 2]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(dims: &[u32]) -> NativeTensorDesc {
        NativeTensorDesc::new(NativeDataType::Float32, dims).unwrap()
    }

    #[test]
    fn transposed_views_swap_strides() {
        let view = dense(&[2, 3]).permuted(&[1, 0]).unwrap();
        assert_eq!(view.dims, [3, 2]);
        assert_eq!(view.strides.as_deref(), Some(&[1, 3][..]));
        assert!(!view.is_contiguous());
        assert_eq!(view.total_bytes(), 24);
    }

    #[test]
    fn broadcasting_uses_zero_strides() {
        let row = broadcast_desc(&dense(&[3]), &[2, 3], 0).unwrap();
        assert_eq!(row.dims, [2, 3]);
        assert_eq!(row.strides.as_deref(), Some(&[0, 1][..]));

        let column = broadcast_desc(&dense(&[2, 1]), &[2, 4], 0).unwrap();
        assert_eq!(column.strides.as_deref(), Some(&[1, 0][..]));

        assert!(broadcast_desc(&dense(&[3]), &[2, 4], 0).is_err());
    }

    #[test]
    fn unit_axes_keep_views_contiguous() {
        let desc = dense(&[4]).as_channel_vector().unwrap();
        assert_eq!(desc.dims, [1, 4, 1, 1]);
        assert!(desc.is_contiguous());
        assert_eq!(dense(&[]).dims, [1]);
    }

    #[test]
    fn byte_sizes_round_up_to_four() {
        let half = NativeTensorDesc::new(NativeDataType::Float16, &[3]).unwrap();
        assert_eq!(half.total_bytes(), 8);
        assert!(NativeTensorDesc::from_operand(OperandType::Int8, &[3]).is_err());
    }
}
