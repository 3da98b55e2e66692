//! Validation and shape inference rules, one function per operator family.
//!
//! Every rule is a pure function of input specs and resolved attributes so the builder, the lowering
//! engine and tests share the exact same arithmetic.

use std::collections::HashSet;

use crate::descriptor::{OperandType, Shape, TensorSpec};
use crate::error::{validation_bail, validation_ensure, WebnnError, WebnnResult};

use super::ops::{
    AutoPad, BatchNormOptions, BinaryOp, Conv2dFilterOperandLayout, Conv2dOptions,
    ConvTranspose2dFilterOperandLayout, ConvTranspose2dOptions, FusedActivation, GemmOptions,
    GruOptions, InputOperandLayout, InstanceNormOptions, Pool2dOptions, ReduceOp,
    Resample2dOptions, RoundingType, SplitSpec, UnaryOp,
};

/// NumPy-style bidirectional broadcast. A rank-0 shape behaves like `[1]`.
pub fn broadcast_shapes(a: &[u32], b: &[u32]) -> Option<Vec<u32>> {
    let a = if a.is_empty() { &[1][..] } else { a };
    let b = if b.is_empty() { &[1][..] } else { b };
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for axis in 0..rank {
        let da = aligned_dim(a, rank, axis);
        let db = aligned_dim(b, rank, axis);
        let dim = if da == db {
            da
        } else if da == 1 {
            db
        } else if db == 1 {
            da
        } else {
            return None;
        };
        out.push(dim);
    }
    Some(out)
}

/// Whether `from` can be stretched to `to` without changing `to`.
pub fn is_unidirectionally_broadcastable(from: &[u32], to: &[u32]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    let offset = to.len() - from.len();
    from.iter()
        .enumerate()
        .all(|(axis, &dim)| dim == to[axis + offset] || dim == 1)
}

fn aligned_dim(dims: &[u32], rank: usize, axis: usize) -> u32 {
    let offset = rank - dims.len();
    if axis < offset {
        1
    } else {
        dims[axis - offset]
    }
}

fn ensure_same_type(what: &str, a: &TensorSpec, b: &TensorSpec) -> WebnnResult<()> {
    validation_ensure!(
        a.ty == b.ty,
        "{what}: operand types differ ({} vs {})",
        a.ty,
        b.ty
    );
    Ok(())
}

fn ensure_rank(what: &str, spec: &TensorSpec, rank: usize) -> WebnnResult<()> {
    validation_ensure!(
        spec.rank() == rank,
        "{what} must be {rank}-D, got shape {}",
        spec.shape
    );
    Ok(())
}

fn pair(what: &str, values: &[u32]) -> WebnnResult<[u32; 2]> {
    match values {
        [a, b] => Ok([*a, *b]),
        _ => Err(WebnnError::validation(format!(
            "{what} must have 2 values, got {}",
            values.len()
        ))),
    }
}

fn quad(what: &str, values: &[u32]) -> WebnnResult<[u32; 4]> {
    match values {
        [a, b, c, d] => Ok([*a, *b, *c, *d]),
        _ => Err(WebnnError::validation(format!(
            "{what} must have 4 values, got {}",
            values.len()
        ))),
    }
}

fn positive_pair(what: &str, values: &[u32]) -> WebnnResult<[u32; 2]> {
    let values = pair(what, values)?;
    validation_ensure!(
        values.iter().all(|&v| v > 0),
        "{what} must be positive, got {values:?}"
    );
    Ok(values)
}

/// Normalizes a possibly negative axis into `[0, rank)`.
pub fn normalize_axis(axis: i32, rank: usize) -> WebnnResult<u32> {
    let rank_i = rank as i64;
    let axis_i = axis as i64;
    validation_ensure!(
        axis_i >= -rank_i && axis_i < rank_i,
        "axis {axis} is out of range for rank {rank}"
    );
    Ok(if axis_i < 0 { axis_i + rank_i } else { axis_i } as u32)
}

pub fn infer_binary(op: BinaryOp, a: &TensorSpec, b: &TensorSpec) -> WebnnResult<TensorSpec> {
    ensure_same_type("binary", a, b)?;
    if op == BinaryOp::MatMul {
        return Ok(TensorSpec::new(a.ty, matmul_shape(a.dims(), b.dims())?));
    }
    let dims = broadcast_shapes(a.dims(), b.dims()).ok_or_else(|| {
        WebnnError::validation(format!(
            "shapes {} and {} are not broadcast compatible",
            a.shape, b.shape
        ))
    })?;
    Ok(TensorSpec::new(a.ty, dims))
}

pub fn matmul_shape(a: &[u32], b: &[u32]) -> WebnnResult<Vec<u32>> {
    validation_ensure!(
        !a.is_empty() && !b.is_empty(),
        "matmul operands must be at least 1-D"
    );
    match (a.len(), b.len()) {
        (1, 1) => {
            validation_ensure!(a[0] == b[0], "matmul vector lengths differ: {a:?} vs {b:?}");
            return Ok(vec![1]);
        }
        (2, 1) => {
            validation_ensure!(a[1] == b[0], "matmul inner dimensions differ: {a:?} vs {b:?}");
            return Ok(vec![a[0], 1]);
        }
        (1, 2) => {
            validation_ensure!(a[0] == b[0], "matmul inner dimensions differ: {a:?} vs {b:?}");
            return Ok(vec![1, b[1]]);
        }
        _ => {}
    }
    let a: Vec<u32> = if a.len() == 1 { vec![1, a[0]] } else { a.to_vec() };
    let b: Vec<u32> = if b.len() == 1 { vec![b[0], 1] } else { b.to_vec() };
    let (ra, rb) = (a.len(), b.len());
    validation_ensure!(
        a[ra - 1] == b[rb - 2],
        "matmul inner dimensions differ: {a:?} vs {b:?}"
    );
    let (batch_a, batch_b) = (&a[..ra - 2], &b[..rb - 2]);
    let mut dims = match (batch_a.is_empty(), batch_b.is_empty()) {
        (true, true) => Vec::new(),
        (true, false) => batch_b.to_vec(),
        (false, true) => batch_a.to_vec(),
        (false, false) => broadcast_shapes(batch_a, batch_b).ok_or_else(|| {
            WebnnError::validation(format!(
                "matmul batch dimensions of {a:?} and {b:?} are not broadcast compatible"
            ))
        })?,
    };
    dims.push(a[ra - 2]);
    dims.push(b[rb - 1]);
    Ok(dims)
}

pub fn infer_unary(op: UnaryOp, input: &TensorSpec) -> WebnnResult<TensorSpec> {
    if op == UnaryOp::Softmax {
        ensure_rank("softmax input", input, 2)?;
    }
    Ok(input.clone())
}

/// `1 + (in - dilation*(filter-1) - 1 + begin + end) / stride`.
pub fn conv_output_size(
    input: u32,
    filter: u32,
    pad_begin: u32,
    pad_end: u32,
    stride: u32,
    dilation: u32,
) -> WebnnResult<u32> {
    let (dilated, padded) = dilated_window(input, filter, pad_begin, pad_end, dilation)?;
    output_dim((padded - dilated) / stride as i64 + 1)
}

fn output_dim(size: i64) -> WebnnResult<u32> {
    u32::try_from(size)
        .map_err(|_| WebnnError::validation(format!("output dimension {size} is out of range")))
}

fn dilated_window(
    input: u32,
    filter: u32,
    pad_begin: u32,
    pad_end: u32,
    dilation: u32,
) -> WebnnResult<(i64, i64)> {
    validation_ensure!(filter > 0, "window size must be positive");
    let dilated = dilation as i64 * (filter as i64 - 1) + 1;
    let padded = input as i64 + pad_begin as i64 + pad_end as i64;
    validation_ensure!(
        padded >= dilated,
        "window of size {dilated} does not fit the padded input of size {padded}"
    );
    Ok((dilated, padded))
}

/// `begin`/`end` padding so that `out = ceil(in / stride)`.
pub fn compute_same_padding(
    auto_pad: AutoPad,
    input: u32,
    filter: u32,
    stride: u32,
    dilation: u32,
) -> (u32, u32) {
    let input = input as i64;
    let stride = stride.max(1) as i64;
    let out = (input + stride - 1) / stride;
    let dilated = (filter as i64 - 1) * dilation as i64 + 1;
    let needed = (out - 1) * stride + dilated;
    let total = (needed - input).max(0) as u32;
    split_padding(auto_pad, total)
}

/// Padding for a transposed convolution producing `out = in * stride` (or `output_size`).
pub fn compute_same_transpose_padding(
    auto_pad: AutoPad,
    input: u32,
    filter: u32,
    stride: u32,
    dilation: u32,
    output_padding: u32,
    output_size: Option<u32>,
) -> (u32, u32) {
    let out = output_size.map_or(input as i64 * stride as i64, |size| size as i64);
    let total = stride as i64 * (input as i64 - 1)
        + output_padding as i64
        + (filter as i64 - 1) * dilation as i64
        + 1
        - out;
    split_padding(auto_pad, total.max(0) as u32)
}

fn split_padding(auto_pad: AutoPad, total: u32) -> (u32, u32) {
    let half = total / 2;
    match auto_pad {
        AutoPad::SameLower => (total - half, half),
        AutoPad::SameUpper | AutoPad::Explicit => (half, total - half),
    }
}

/// Splits a 4-D shape into `[N, C, H, W]` according to the layout.
pub fn nchw_dims(dims: &[u32], layout: InputOperandLayout) -> WebnnResult<[u32; 4]> {
    let [a, b, c, d] = quad("input dimensions", dims)?;
    Ok(match layout {
        InputOperandLayout::Nchw => [a, b, c, d],
        InputOperandLayout::Nhwc => [a, d, b, c],
    })
}

pub fn from_nchw(nchw: [u32; 4], layout: InputOperandLayout) -> Vec<u32> {
    let [n, c, h, w] = nchw;
    match layout {
        InputOperandLayout::Nchw => vec![n, c, h, w],
        InputOperandLayout::Nhwc => vec![n, h, w, c],
    }
}

/// Conv2d filter as `[O, I, H, W]`.
pub fn oihw_dims(dims: &[u32], layout: Conv2dFilterOperandLayout) -> WebnnResult<[u32; 4]> {
    let [a, b, c, d] = quad("filter dimensions", dims)?;
    Ok(match layout {
        Conv2dFilterOperandLayout::Oihw => [a, b, c, d],
        Conv2dFilterOperandLayout::Hwio => [d, c, a, b],
        Conv2dFilterOperandLayout::Ohwi => [a, d, b, c],
        Conv2dFilterOperandLayout::Ihwo => [d, a, b, c],
    })
}

/// Transposed-convolution filter as `[I, O, H, W]`.
pub fn iohw_dims(
    dims: &[u32],
    layout: ConvTranspose2dFilterOperandLayout,
) -> WebnnResult<[u32; 4]> {
    let [a, b, c, d] = quad("filter dimensions", dims)?;
    Ok(match layout {
        ConvTranspose2dFilterOperandLayout::Iohw => [a, b, c, d],
        ConvTranspose2dFilterOperandLayout::Hwoi => [d, c, a, b],
        ConvTranspose2dFilterOperandLayout::Ohwi => [d, a, b, c],
    })
}

/// Explicit `[beginH, endH, beginW, endW]` padding after applying auto-pad.
pub fn resolve_conv2d_padding(
    options: &Conv2dOptions,
    input_hw: [u32; 2],
    filter_hw: [u32; 2],
) -> WebnnResult<[u32; 4]> {
    let padding = quad("conv2d padding", &options.padding)?;
    let strides = positive_pair("conv2d strides", &options.strides)?;
    let dilations = positive_pair("conv2d dilations", &options.dilations)?;
    if options.auto_pad == AutoPad::Explicit {
        return Ok(padding);
    }
    let (bh, eh) =
        compute_same_padding(options.auto_pad, input_hw[0], filter_hw[0], strides[0], dilations[0]);
    let (bw, ew) =
        compute_same_padding(options.auto_pad, input_hw[1], filter_hw[1], strides[1], dilations[1]);
    Ok([bh, eh, bw, ew])
}

pub fn resolve_conv_transpose2d_padding(
    options: &ConvTranspose2dOptions,
    input_hw: [u32; 2],
    filter_hw: [u32; 2],
) -> WebnnResult<[u32; 4]> {
    let padding = quad("convTranspose2d padding", &options.padding)?;
    let strides = positive_pair("convTranspose2d strides", &options.strides)?;
    let dilations = positive_pair("convTranspose2d dilations", &options.dilations)?;
    let output_padding = pair("convTranspose2d outputPadding", &options.output_padding)?;
    if options.auto_pad == AutoPad::Explicit {
        return Ok(padding);
    }
    let output_sizes = match &options.output_sizes {
        Some(sizes) => Some(pair("convTranspose2d outputSizes", sizes)?),
        None => None,
    };
    let (bh, eh) = compute_same_transpose_padding(
        options.auto_pad,
        input_hw[0],
        filter_hw[0],
        strides[0],
        dilations[0],
        output_padding[0],
        output_sizes.map(|s| s[0]),
    );
    let (bw, ew) = compute_same_transpose_padding(
        options.auto_pad,
        input_hw[1],
        filter_hw[1],
        strides[1],
        dilations[1],
        output_padding[1],
        output_sizes.map(|s| s[1]),
    );
    Ok([bh, eh, bw, ew])
}

pub fn infer_conv2d(
    input: &TensorSpec,
    filter: &TensorSpec,
    bias: Option<&TensorSpec>,
    options: &Conv2dOptions,
) -> WebnnResult<TensorSpec> {
    ensure_rank("conv2d input", input, 4)?;
    ensure_rank("conv2d filter", filter, 4)?;
    ensure_same_type("conv2d", input, filter)?;
    validation_ensure!(options.groups > 0, "conv2d groups must be positive");
    let [n, c, h, w] = nchw_dims(input.dims(), options.input_layout)?;
    let [o, i, kh, kw] = oihw_dims(filter.dims(), options.filter_layout)?;
    validation_ensure!(
        i.checked_mul(options.groups) == Some(c),
        "conv2d input channels ({c}) must equal filter input channels ({i}) times groups ({})",
        options.groups
    );
    validation_ensure!(
        o % options.groups == 0,
        "conv2d output channels ({o}) must be divisible by groups ({})",
        options.groups
    );
    if let Some(bias) = bias {
        ensure_same_type("conv2d bias", input, bias)?;
        validation_ensure!(
            bias.dims() == [o],
            "conv2d bias must be 1-D of size {o}, got {}",
            bias.shape
        );
    }
    if let Some(activation) = &options.activation {
        ensure_float_activation(input.ty, activation)?;
    }
    let strides = positive_pair("conv2d strides", &options.strides)?;
    let dilations = positive_pair("conv2d dilations", &options.dilations)?;
    let padding = resolve_conv2d_padding(options, [h, w], [kh, kw])?;
    let oh = conv_output_size(h, kh, padding[0], padding[1], strides[0], dilations[0])?;
    let ow = conv_output_size(w, kw, padding[2], padding[3], strides[1], dilations[1])?;
    Ok(TensorSpec::new(
        input.ty,
        from_nchw([n, o, oh, ow], options.input_layout),
    ))
}

/// `stride*(in-1) + outputPadding + dilation*(filter-1) + 1 - begin - end`.
pub fn conv_transpose_output_size(
    input: u32,
    filter: u32,
    pad_begin: u32,
    pad_end: u32,
    stride: u32,
    dilation: u32,
    output_padding: u32,
) -> WebnnResult<u32> {
    let size = stride as i64 * (input as i64 - 1)
        + output_padding as i64
        + dilation as i64 * (filter as i64 - 1)
        + 1
        - pad_begin as i64
        - pad_end as i64;
    validation_ensure!(
        size > 0,
        "convTranspose2d output size is not positive ({size})"
    );
    output_dim(size)
}

pub fn infer_conv_transpose2d(
    input: &TensorSpec,
    filter: &TensorSpec,
    bias: Option<&TensorSpec>,
    options: &ConvTranspose2dOptions,
) -> WebnnResult<TensorSpec> {
    ensure_rank("convTranspose2d input", input, 4)?;
    ensure_rank("convTranspose2d filter", filter, 4)?;
    ensure_same_type("convTranspose2d", input, filter)?;
    validation_ensure!(options.groups > 0, "convTranspose2d groups must be positive");
    let [n, c, h, w] = nchw_dims(input.dims(), options.input_layout)?;
    let [i, o, kh, kw] = iohw_dims(filter.dims(), options.filter_layout)?;
    validation_ensure!(
        c == i,
        "convTranspose2d input channels ({c}) must equal filter input channels ({i})"
    );
    validation_ensure!(
        i % options.groups == 0,
        "convTranspose2d input channels ({i}) must be divisible by groups ({})",
        options.groups
    );
    let Some(out_channels) = o.checked_mul(options.groups) else {
        validation_bail!(
            "convTranspose2d output channels ({o}) times groups ({}) overflow",
            options.groups
        );
    };
    if let Some(bias) = bias {
        ensure_same_type("convTranspose2d bias", input, bias)?;
        validation_ensure!(
            bias.dims() == [out_channels],
            "convTranspose2d bias must be 1-D of size {out_channels}, got {}",
            bias.shape
        );
    }
    if let Some(activation) = &options.activation {
        ensure_float_activation(input.ty, activation)?;
    }
    let strides = positive_pair("convTranspose2d strides", &options.strides)?;
    let dilations = positive_pair("convTranspose2d dilations", &options.dilations)?;
    let output_padding = pair("convTranspose2d outputPadding", &options.output_padding)?;
    for axis in 0..2 {
        validation_ensure!(
            output_padding[axis] < strides[axis] || output_padding[axis] < dilations[axis],
            "convTranspose2d outputPadding {output_padding:?} must be smaller than the stride or dilation"
        );
    }
    let (oh, ow) = match &options.output_sizes {
        Some(sizes) => {
            let sizes = positive_pair("convTranspose2d outputSizes", sizes)?;
            (sizes[0], sizes[1])
        }
        None => {
            let padding = resolve_conv_transpose2d_padding(options, [h, w], [kh, kw])?;
            (
                conv_transpose_output_size(
                    h,
                    kh,
                    padding[0],
                    padding[1],
                    strides[0],
                    dilations[0],
                    output_padding[0],
                )?,
                conv_transpose_output_size(
                    w,
                    kw,
                    padding[2],
                    padding[3],
                    strides[1],
                    dilations[1],
                    output_padding[1],
                )?,
            )
        }
    };
    Ok(TensorSpec::new(
        input.ty,
        from_nchw([n, out_channels, oh, ow], options.input_layout),
    ))
}

/// Window dimensions, defaulting to the full spatial extent.
pub fn resolve_pool_window(input: &TensorSpec, options: &Pool2dOptions) -> WebnnResult<[u32; 2]> {
    ensure_rank("pool2d input", input, 4)?;
    let [_, _, h, w] = nchw_dims(input.dims(), options.layout)?;
    match &options.window_dimensions {
        Some(window) => positive_pair("pool2d windowDimensions", window),
        None => Ok([h, w]),
    }
}

pub fn resolve_pool2d_padding(
    options: &Pool2dOptions,
    input_hw: [u32; 2],
    window: [u32; 2],
) -> WebnnResult<[u32; 4]> {
    let padding = quad("pool2d padding", &options.padding)?;
    let strides = positive_pair("pool2d strides", &options.strides)?;
    let dilations = positive_pair("pool2d dilations", &options.dilations)?;
    if options.auto_pad == AutoPad::Explicit {
        return Ok(padding);
    }
    let (bh, eh) =
        compute_same_padding(options.auto_pad, input_hw[0], window[0], strides[0], dilations[0]);
    let (bw, ew) =
        compute_same_padding(options.auto_pad, input_hw[1], window[1], strides[1], dilations[1]);
    Ok([bh, eh, bw, ew])
}

fn pool_output_size(
    input: u32,
    window: u32,
    pad_begin: u32,
    pad_end: u32,
    stride: u32,
    dilation: u32,
    rounding: RoundingType,
) -> WebnnResult<u32> {
    let (dilated, padded) = dilated_window(input, window, pad_begin, pad_end, dilation)?;
    let span = padded - dilated;
    let stride = stride as i64;
    let steps = match rounding {
        RoundingType::Floor => span / stride,
        RoundingType::Ceil => (span + stride - 1) / stride,
    };
    output_dim(steps + 1)
}

pub fn infer_pool2d(input: &TensorSpec, options: &Pool2dOptions) -> WebnnResult<TensorSpec> {
    let window = resolve_pool_window(input, options)?;
    let [n, c, h, w] = nchw_dims(input.dims(), options.layout)?;
    let strides = positive_pair("pool2d strides", &options.strides)?;
    let dilations = positive_pair("pool2d dilations", &options.dilations)?;
    let padding = resolve_pool2d_padding(options, [h, w], window)?;
    let output_hw = |rounding: RoundingType| -> WebnnResult<[u32; 2]> {
        Ok([
            pool_output_size(h, window[0], padding[0], padding[1], strides[0], dilations[0], rounding)?,
            pool_output_size(w, window[1], padding[2], padding[3], strides[1], dilations[1], rounding)?,
        ])
    };
    let [oh, ow] = match &options.output_sizes {
        Some(sizes) => {
            let sizes = positive_pair("pool2d outputSizes", sizes)?;
            let floor = output_hw(RoundingType::Floor)?;
            let ceil = output_hw(RoundingType::Ceil)?;
            validation_ensure!(
                sizes == floor || sizes == ceil,
                "pool2d outputSizes {sizes:?} must be {floor:?} or {ceil:?}"
            );
            sizes
        }
        None => output_hw(options.rounding_type)?,
    };
    Ok(TensorSpec::new(input.ty, from_nchw([n, c, oh, ow], options.layout)))
}

pub fn infer_gemm(
    a: &TensorSpec,
    b: &TensorSpec,
    c: Option<&TensorSpec>,
    options: &GemmOptions,
) -> WebnnResult<TensorSpec> {
    ensure_rank("gemm a", a, 2)?;
    ensure_rank("gemm b", b, 2)?;
    ensure_same_type("gemm", a, b)?;
    let (m, k) = if options.a_transpose {
        (a.dims()[1], a.dims()[0])
    } else {
        (a.dims()[0], a.dims()[1])
    };
    let (k2, n) = if options.b_transpose {
        (b.dims()[1], b.dims()[0])
    } else {
        (b.dims()[0], b.dims()[1])
    };
    validation_ensure!(
        k == k2,
        "gemm contraction dimensions differ: {} vs {}",
        a.shape,
        b.shape
    );
    if let Some(c) = c {
        ensure_same_type("gemm c", a, c)?;
        validation_ensure!(c.rank() <= 2, "gemm c must have rank <= 2, got {}", c.shape);
        validation_ensure!(
            is_unidirectionally_broadcastable(c.dims(), &[m, n]),
            "gemm c {} is not broadcastable to [{m}, {n}]",
            c.shape
        );
    }
    Ok(TensorSpec::new(a.ty, vec![m, n]))
}

pub fn infer_concat(inputs: &[&TensorSpec], axis: u32) -> WebnnResult<TensorSpec> {
    let Some(first) = inputs.first() else {
        validation_bail!("concat requires at least one input");
    };
    let rank = first.rank();
    let axis = axis as usize;
    validation_ensure!(axis < rank, "concat axis {axis} is out of range for rank {rank}");
    let mut dims = first.dims().to_vec();
    for input in &inputs[1..] {
        ensure_same_type("concat", first, input)?;
        validation_ensure!(
            input.rank() == rank,
            "concat inputs must share rank {rank}, got {}",
            input.shape
        );
        for (d, (&lhs, &rhs)) in first.dims().iter().zip(input.dims()).enumerate() {
            if d != axis {
                validation_ensure!(
                    lhs == rhs,
                    "concat inputs {} and {} differ outside axis {axis}",
                    first.shape,
                    input.shape
                );
            }
        }
        dims[axis] = dims[axis]
            .checked_add(input.dims()[axis])
            .ok_or_else(|| WebnnError::validation("concat axis size overflows"))?;
    }
    Ok(TensorSpec::new(first.ty, dims))
}

pub fn infer_reshape(input: &TensorSpec, new_shape: &[i32]) -> WebnnResult<TensorSpec> {
    let total = input
        .shape
        .element_count()
        .ok_or_else(|| WebnnError::validation("reshape input is too large"))?;
    let mut inferred = None;
    let mut known = 1usize;
    for (axis, &dim) in new_shape.iter().enumerate() {
        validation_ensure!(dim >= -1, "reshape dimension {axis} is invalid ({dim})");
        if dim == -1 {
            validation_ensure!(
                inferred.is_none(),
                "reshape accepts at most one -1 dimension"
            );
            inferred = Some(axis);
        } else {
            known = known.saturating_mul(dim as usize);
        }
    }
    let mut dims: Vec<u32> = new_shape.iter().map(|&d| d.max(0) as u32).collect();
    if let Some(axis) = inferred {
        validation_ensure!(
            known > 0 && total % known == 0,
            "cannot infer reshape dimension: {total} elements into {new_shape:?}"
        );
        dims[axis] = (total / known) as u32;
    } else {
        validation_ensure!(
            known == total,
            "reshape from {} ({total} elements) to {new_shape:?} changes the element count",
            input.shape
        );
    }
    Ok(TensorSpec::new(input.ty, dims))
}

/// Returns the output spec and the resolved permutation (reversed axes by default).
pub fn infer_transpose(
    input: &TensorSpec,
    permutation: Option<&[u32]>,
) -> WebnnResult<(TensorSpec, Vec<u32>)> {
    let rank = input.rank();
    let permutation: Vec<u32> = match permutation {
        Some(perm) => perm.to_vec(),
        None => (0..rank as u32).rev().collect(),
    };
    validation_ensure!(
        permutation.len() == rank,
        "transpose permutation {permutation:?} must have {rank} entries"
    );
    let mut seen = vec![false; rank];
    for &axis in &permutation {
        let axis = axis as usize;
        validation_ensure!(
            axis < rank && !seen[axis],
            "transpose permutation {permutation:?} is not a permutation of 0..{rank}"
        );
        seen[axis] = true;
    }
    let dims = permutation
        .iter()
        .map(|&axis| input.dims()[axis as usize])
        .collect::<Vec<_>>();
    Ok((TensorSpec::new(input.ty, dims), permutation))
}

/// Normalizes reduce axes: all axes by default, unique, in `[-rank, rank-1]`.
pub fn resolve_reduce_axes(rank: usize, axes: Option<&[i32]>) -> WebnnResult<Vec<u32>> {
    let Some(axes) = axes else {
        return Ok((0..rank as u32).collect());
    };
    validation_ensure!(
        axes.len() <= rank,
        "reduce axes {axes:?} exceed the input rank {rank}"
    );
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(axes.len());
    for &axis in axes {
        let axis = normalize_axis(axis, rank)?;
        validation_ensure!(seen.insert(axis), "reduce axes {axes:?} contain duplicates");
        resolved.push(axis);
    }
    Ok(resolved)
}

pub fn infer_reduce(
    input: &TensorSpec,
    op: ReduceOp,
    axes: &[u32],
    keep_dimensions: bool,
) -> WebnnResult<TensorSpec> {
    let mut dims = Vec::with_capacity(input.rank());
    for (axis, &dim) in input.dims().iter().enumerate() {
        if axes.contains(&(axis as u32)) {
            if keep_dimensions {
                dims.push(1);
            }
        } else {
            dims.push(dim);
        }
    }
    if dims.is_empty() {
        dims.push(1);
    }
    let ty = if op.is_arg_reduction() {
        OperandType::Int32
    } else {
        input.ty
    };
    Ok(TensorSpec::new(ty, dims))
}

/// Decodes a `[rank, 2]` padding constant into `(begin, end)` pairs.
pub fn decode_padding(
    padding: &TensorSpec,
    bytes: &[u8],
    rank: usize,
) -> WebnnResult<Vec<[u32; 2]>> {
    validation_ensure!(
        padding.dims() == [rank as u32, 2],
        "pad padding must have shape [{rank}, 2], got {}",
        padding.shape
    );
    let mut pairs = Vec::with_capacity(rank);
    let mut values = bytes.chunks_exact(4).map(|chunk| {
        let raw = [chunk[0], chunk[1], chunk[2], chunk[3]];
        match padding.ty {
            OperandType::Int32 => {
                let value = i32::from_le_bytes(raw);
                validation_ensure!(value >= 0, "pad padding values must be non-negative");
                Ok(value as u32)
            }
            _ => Ok(u32::from_le_bytes(raw)),
        }
    });
    validation_ensure!(
        matches!(padding.ty, OperandType::Int32 | OperandType::Uint32),
        "pad padding must be int32 or uint32, got {}",
        padding.ty
    );
    for _ in 0..rank {
        let begin = values
            .next()
            .ok_or_else(|| WebnnError::validation("pad padding constant is truncated"))??;
        let end = values
            .next()
            .ok_or_else(|| WebnnError::validation("pad padding constant is truncated"))??;
        pairs.push([begin, end]);
    }
    Ok(pairs)
}

pub fn infer_pad(input: &TensorSpec, padding: &[[u32; 2]]) -> WebnnResult<TensorSpec> {
    validation_ensure!(
        padding.len() == input.rank(),
        "pad padding must have one pair per input dimension"
    );
    let mut dims = Vec::with_capacity(padding.len());
    for (&dim, [begin, end]) in input.dims().iter().zip(padding) {
        let Some(padded) = dim.checked_add(*begin).and_then(|size| size.checked_add(*end)) else {
            validation_bail!("pad of dimension {dim} by ({begin}, {end}) overflows");
        };
        dims.push(padded);
    }
    Ok(TensorSpec::new(input.ty, dims))
}

fn ensure_channel_vector(
    what: &str,
    input: &TensorSpec,
    vector: &TensorSpec,
    channels: u32,
) -> WebnnResult<()> {
    ensure_same_type(what, input, vector)?;
    validation_ensure!(
        vector.dims() == [channels],
        "{what} must be 1-D of size {channels}, got {}",
        vector.shape
    );
    Ok(())
}

pub fn infer_batch_norm(
    input: &TensorSpec,
    mean: &TensorSpec,
    variance: &TensorSpec,
    scale: Option<&TensorSpec>,
    bias: Option<&TensorSpec>,
    options: &BatchNormOptions,
) -> WebnnResult<TensorSpec> {
    ensure_rank("batchNorm input", input, 4)?;
    validation_ensure!(
        options.axis == 1 || options.axis == 3,
        "batchNorm axis must be 1 or 3, got {}",
        options.axis
    );
    let channels = input.dims()[options.axis as usize];
    ensure_channel_vector("batchNorm mean", input, mean, channels)?;
    ensure_channel_vector("batchNorm variance", input, variance, channels)?;
    if let Some(scale) = scale {
        ensure_channel_vector("batchNorm scale", input, scale, channels)?;
    }
    if let Some(bias) = bias {
        ensure_channel_vector("batchNorm bias", input, bias, channels)?;
    }
    if let Some(activation) = &options.activation {
        ensure_float_activation(input.ty, activation)?;
    }
    Ok(input.clone())
}

pub fn infer_instance_norm(
    input: &TensorSpec,
    scale: Option<&TensorSpec>,
    bias: Option<&TensorSpec>,
    options: &InstanceNormOptions,
) -> WebnnResult<TensorSpec> {
    ensure_rank("instanceNorm input", input, 4)?;
    let [_, channels, _, _] = nchw_dims(input.dims(), options.layout)?;
    if let Some(scale) = scale {
        ensure_channel_vector("instanceNorm scale", input, scale, channels)?;
    }
    if let Some(bias) = bias {
        ensure_channel_vector("instanceNorm bias", input, bias, channels)?;
    }
    Ok(input.clone())
}

fn ensure_float_activation(ty: OperandType, activation: &FusedActivation) -> WebnnResult<()> {
    validation_ensure!(
        ty.is_float(),
        "fused activation {activation} requires a floating point operand, got {ty}"
    );
    Ok(())
}

pub struct GruSpecs<'a> {
    pub input: &'a TensorSpec,
    pub weight: &'a TensorSpec,
    pub recurrent_weight: &'a TensorSpec,
    pub bias: Option<&'a TensorSpec>,
    pub recurrent_bias: Option<&'a TensorSpec>,
    pub initial_hidden_state: Option<&'a TensorSpec>,
}

pub fn infer_gru(
    specs: &GruSpecs<'_>,
    steps: u32,
    hidden_size: u32,
    options: &GruOptions,
) -> WebnnResult<Vec<TensorSpec>> {
    let input = specs.input;
    ensure_rank("gru input", input, 3)?;
    ensure_rank("gru weight", specs.weight, 3)?;
    ensure_rank("gru recurrentWeight", specs.recurrent_weight, 3)?;
    ensure_same_type("gru weight", input, specs.weight)?;
    ensure_same_type("gru recurrentWeight", input, specs.recurrent_weight)?;
    validation_ensure!(steps > 0, "gru steps must be positive");
    validation_ensure!(hidden_size > 0, "gru hiddenSize must be positive");
    let [input_steps, batch, input_size] = [input.dims()[0], input.dims()[1], input.dims()[2]];
    validation_ensure!(
        input_steps == steps,
        "gru input has {input_steps} steps, expected {steps}"
    );
    let dirs = options.direction.num_directions();
    let gates = hidden_size
        .checked_mul(3)
        .ok_or_else(|| WebnnError::validation("gru hiddenSize overflows"))?;
    validation_ensure!(
        specs.weight.dims() == [dirs, gates, input_size],
        "gru weight must be [{dirs}, {gates}, {input_size}], got {}",
        specs.weight.shape
    );
    validation_ensure!(
        specs.recurrent_weight.dims() == [dirs, gates, hidden_size],
        "gru recurrentWeight must be [{dirs}, {gates}, {hidden_size}], got {}",
        specs.recurrent_weight.shape
    );
    for (what, bias) in [("bias", specs.bias), ("recurrentBias", specs.recurrent_bias)] {
        if let Some(bias) = bias {
            ensure_same_type("gru bias", input, bias)?;
            validation_ensure!(
                bias.dims() == [dirs, gates],
                "gru {what} must be [{dirs}, {gates}], got {}",
                bias.shape
            );
        }
    }
    if let Some(hidden) = specs.initial_hidden_state {
        ensure_same_type("gru initialHiddenState", input, hidden)?;
        validation_ensure!(
            hidden.dims() == [dirs, batch, hidden_size],
            "gru initialHiddenState must be [{dirs}, {batch}, {hidden_size}], got {}",
            hidden.shape
        );
    }
    if let Some(activations) = &options.activations {
        validation_ensure!(
            activations.len() == 2,
            "gru expects 2 activations, got {}",
            activations.len()
        );
        for activation in activations {
            validation_ensure!(
                matches!(
                    activation,
                    FusedActivation::Relu
                        | FusedActivation::Sigmoid
                        | FusedActivation::Tanh
                        | FusedActivation::LeakyRelu { .. }
                ),
                "gru activation {activation} is not supported"
            );
        }
    }
    let mut outputs = vec![TensorSpec::new(input.ty, vec![dirs, batch, hidden_size])];
    if options.return_sequence {
        outputs.push(TensorSpec::new(
            input.ty,
            vec![steps, dirs, batch, hidden_size],
        ));
    }
    Ok(outputs)
}

/// Returns one spec per part plus the resolved part sizes.
pub fn infer_split(
    input: &TensorSpec,
    split: &SplitSpec,
    axis: i32,
) -> WebnnResult<(Vec<TensorSpec>, Vec<u32>, u32)> {
    let axis = normalize_axis(axis, input.rank())?;
    let dim = input.dims()[axis as usize];
    let sizes = match split {
        SplitSpec::Count(count) => {
            validation_ensure!(
                *count > 0 && dim % count == 0,
                "split count {count} does not evenly divide dimension {dim}"
            );
            vec![dim / count; *count as usize]
        }
        SplitSpec::Sizes(sizes) => {
            validation_ensure!(
                !sizes.is_empty() && sizes.iter().all(|&s| s > 0),
                "split sizes {sizes:?} must be positive"
            );
            let total: u64 = sizes.iter().map(|&s| s as u64).sum();
            validation_ensure!(
                total == dim as u64,
                "split sizes {sizes:?} must sum to dimension {dim}"
            );
            sizes.clone()
        }
    };
    let outputs = sizes
        .iter()
        .map(|&size| {
            let mut dims = input.dims().to_vec();
            dims[axis as usize] = size;
            TensorSpec::new(input.ty, dims)
        })
        .collect();
    Ok((outputs, sizes, axis))
}

pub fn infer_squeeze(
    input: &TensorSpec,
    axes: Option<&[i32]>,
) -> WebnnResult<(TensorSpec, Vec<u32>)> {
    let rank = input.rank();
    let mut resolved = match axes {
        Some(axes) => {
            let mut resolved = Vec::with_capacity(axes.len());
            for &axis in axes {
                let axis = normalize_axis(axis, rank)?;
                validation_ensure!(
                    input.dims()[axis as usize] == 1,
                    "squeeze axis {axis} has size {}",
                    input.dims()[axis as usize]
                );
                validation_ensure!(
                    !resolved.contains(&axis),
                    "squeeze axes {axes:?} contain duplicates"
                );
                resolved.push(axis);
            }
            resolved
        }
        None => input
            .dims()
            .iter()
            .enumerate()
            .filter(|&(_, &dim)| dim == 1)
            .map(|(axis, _)| axis as u32)
            .collect(),
    };
    resolved.sort_unstable();
    let dims = input
        .dims()
        .iter()
        .enumerate()
        .filter(|(axis, _)| !resolved.contains(&(*axis as u32)))
        .map(|(_, &dim)| dim)
        .collect::<Vec<_>>();
    Ok((TensorSpec::new(input.ty, dims), resolved))
}

pub struct ResolvedSlice {
    pub spec: TensorSpec,
    pub starts: Vec<u32>,
    pub sizes: Vec<u32>,
    pub axes: Vec<u32>,
}

pub fn infer_slice(
    input: &TensorSpec,
    starts: &[i32],
    sizes: &[i32],
    axes: Option<&[i32]>,
) -> WebnnResult<ResolvedSlice> {
    let rank = input.rank();
    validation_ensure!(
        starts.len() == sizes.len(),
        "slice starts and sizes must have the same length"
    );
    validation_ensure!(starts.len() <= rank, "slice has more starts than input dimensions");
    let axes: Vec<u32> = match axes {
        Some(axes) => {
            validation_ensure!(
                axes.len() == starts.len(),
                "slice axes must have the same length as starts"
            );
            let mut resolved = Vec::with_capacity(axes.len());
            for &axis in axes {
                let axis = normalize_axis(axis, rank)?;
                validation_ensure!(
                    !resolved.contains(&axis),
                    "slice axes {axes:?} contain duplicates"
                );
                resolved.push(axis);
            }
            resolved
        }
        None => (0..starts.len() as u32).collect(),
    };
    let mut dims = input.dims().to_vec();
    let mut resolved_starts = Vec::with_capacity(starts.len());
    let mut resolved_sizes = Vec::with_capacity(sizes.len());
    for ((&start, &size), &axis) in starts.iter().zip(sizes).zip(&axes) {
        let dim = input.dims()[axis as usize] as i64;
        let begin = if start < 0 { dim + start as i64 } else { start as i64 };
        validation_ensure!(
            begin >= 0 && begin < dim,
            "slice start {start} is out of range for axis {axis} of size {dim}"
        );
        let length = match size {
            -1 => dim - begin,
            s if s > 0 => s as i64,
            s => validation_bail!("slice size {s} on axis {axis} is invalid"),
        };
        validation_ensure!(
            begin + length <= dim,
            "slice [{begin}, {}) exceeds axis {axis} of size {dim}",
            begin + length
        );
        dims[axis as usize] = length as u32;
        resolved_starts.push(begin as u32);
        resolved_sizes.push(length as u32);
    }
    Ok(ResolvedSlice {
        spec: TensorSpec::new(input.ty, dims),
        starts: resolved_starts,
        sizes: resolved_sizes,
        axes,
    })
}

/// Returns the output spec, resolved axes and output sizes along those axes.
pub fn infer_resample2d(
    input: &TensorSpec,
    options: &Resample2dOptions,
) -> WebnnResult<(TensorSpec, [u32; 2], [u32; 2])> {
    ensure_rank("resample2d input", input, 4)?;
    let axes = match &options.axes {
        Some(axes) => pair("resample2d axes", axes)?,
        None => [2, 3],
    };
    validation_ensure!(
        matches!(axes, [0, 1] | [1, 2] | [2, 3]),
        "resample2d axes {axes:?} must be [0, 1], [1, 2] or [2, 3]"
    );
    let in_sizes = [input.dims()[axes[0] as usize], input.dims()[axes[1] as usize]];
    let sizes = match (&options.sizes, &options.scales) {
        (Some(sizes), _) => positive_pair("resample2d sizes", sizes)?,
        (None, Some(scales)) => {
            let [sh, sw] = match scales.as_slice() {
                [a, b] => [*a, *b],
                _ => validation_bail!("resample2d scales must have 2 values"),
            };
            validation_ensure!(
                sh > 0.0 && sw > 0.0,
                "resample2d scales {scales:?} must be positive"
            );
            let scaled = [
                (in_sizes[0] as f64 * sh as f64).floor() as u32,
                (in_sizes[1] as f64 * sw as f64).floor() as u32,
            ];
            validation_ensure!(
                scaled.iter().all(|&s| s > 0),
                "resample2d scales {scales:?} produce an empty output"
            );
            scaled
        }
        (None, None) => in_sizes,
    };
    let mut dims = input.dims().to_vec();
    dims[axes[0] as usize] = sizes[0];
    dims[axes[1] as usize] = sizes[1];
    Ok((TensorSpec::new(input.ty, dims), axes, sizes))
}

/// Shape of a rank-0 operand seen through native descriptors.
pub fn promote_scalar(dims: &[u32]) -> Shape {
    if dims.is_empty() {
        Shape::new([1])
    } else {
        Shape::from(dims)
    }
}
