//! Reference kernels for every native primitive.
//!
//! Kernels take dense [`CpuTensor`]s gathered from strided storage and return dense results. Values
//! are carried as `f64`, which holds every float16, float32, int32 and uint32 value exactly.

use webnn_rs::backend::{BackendError, BackendResult};
use webnn_rs::graph::ops::{InterpolationMode, PaddingMode, RecurrentDirection};
use webnn_rs::native::primitive::{
    ConvolutionDirection, ElementWiseFunction, NativeActivation, PoolingFunction, Primitive,
    ReduceFunction,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub dims: Vec<usize>,
    pub values: Vec<f64>,
}

impl CpuTensor {
    pub fn new(dims: Vec<usize>, values: Vec<f64>) -> Self {
        Self { dims, values }
    }

    pub fn zeros(dims: &[usize]) -> Self {
        let len = dims.iter().product();
        Self {
            dims: dims.to_vec(),
            values: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn at(&self, coords: &[usize]) -> f64 {
        self.values[flat_index(coords, &self.dims)]
    }

    /// Reads `coords`, treating size-1 axes of this tensor as broadcast.
    fn at_broadcast(&self, coords: &[usize]) -> f64 {
        let offset = coords.len() - self.dims.len();
        let mut index = 0usize;
        for (axis, &dim) in self.dims.iter().enumerate() {
            let coord = if dim == 1 { 0 } else { coords[axis + offset] };
            index = index * dim + coord;
        }
        self.values[index]
    }
}

/// Output tensors of one primitive, indexed like its output slots.
pub type KernelOutputs = Vec<Option<CpuTensor>>;

/// Runs `primitive` on gathered inputs. `outputs` holds the dense output dimensions per slot.
pub fn execute_primitive(
    primitive: &Primitive,
    inputs: &[Option<CpuTensor>],
    outputs: &[Option<Vec<usize>>],
) -> BackendResult<KernelOutputs> {
    let op = primitive.name();
    match primitive {
        Primitive::ElementWise(function) => {
            let a = required(inputs, 0, op)?;
            let b = optional(inputs, 1);
            single(op_element_wise(*function, a, b)?)
        }
        Primitive::Clip { min, max } => {
            let input = required(inputs, 0, op)?;
            single(map_values(input, |v| v.max(*min as f64).min(*max as f64)))
        }
        Primitive::Activation(activation) => {
            let input = required(inputs, 0, op)?;
            single(op_activation(*activation, input)?)
        }
        Primitive::Gemm {
            transpose_a,
            transpose_b,
            alpha,
            beta,
            fused_activation,
        } => {
            let out = op_gemm(
                required(inputs, 0, op)?,
                required(inputs, 1, op)?,
                optional(inputs, 2),
                *transpose_a,
                *transpose_b,
                *alpha as f64,
                *beta as f64,
            )?;
            single(fuse(out, *fused_activation)?)
        }
        Primitive::Convolution {
            direction,
            strides,
            dilations,
            start_padding,
            end_padding: _,
            output_padding: _,
            groups,
            fused_activation,
        } => {
            let out_dims = output_dims(outputs, 0, op)?;
            let params = ConvParams {
                strides: [strides[0] as usize, strides[1] as usize],
                dilations: [dilations[0] as usize, dilations[1] as usize],
                start_padding: [start_padding[0] as usize, start_padding[1] as usize],
                groups: *groups as usize,
            };
            let input = required(inputs, 0, op)?;
            let filter = required(inputs, 1, op)?;
            let mut out = match direction {
                ConvolutionDirection::Forward => op_conv_forward(input, filter, out_dims, &params)?,
                ConvolutionDirection::Backward => {
                    op_conv_backward(input, filter, out_dims, &params)?
                }
            };
            if let Some(bias) = optional(inputs, 2) {
                add_channel_bias(&mut out, bias)?;
            }
            single(fuse(out, *fused_activation)?)
        }
        Primitive::Pooling {
            function,
            window,
            strides,
            dilations,
            start_padding,
            end_padding: _,
        } => {
            let input = required(inputs, 0, op)?;
            let out_dims = output_dims(outputs, 0, op)?;
            single(op_pooling(
                *function,
                input,
                out_dims,
                [window[0] as usize, window[1] as usize],
                [strides[0] as usize, strides[1] as usize],
                [dilations[0] as usize, dilations[1] as usize],
                [start_padding[0] as usize, start_padding[1] as usize],
            )?)
        }
        Primitive::Padding {
            mode,
            value,
            start_padding,
            end_padding: _,
        } => {
            let input = required(inputs, 0, op)?;
            let out_dims = output_dims(outputs, 0, op)?;
            single(op_padding(*mode, *value as f64, input, start_padding, out_dims)?)
        }
        Primitive::Reduce { function, axes } => {
            let input = required(inputs, 0, op)?;
            single(op_reduce(*function, input, axes)?)
        }
        Primitive::BatchNormalization {
            epsilon,
            fused_activation,
        } => {
            let out = op_batch_norm(
                required(inputs, 0, op)?,
                required(inputs, 1, op)?,
                required(inputs, 2, op)?,
                required(inputs, 3, op)?,
                required(inputs, 4, op)?,
                *epsilon as f64,
            )?;
            single(fuse(out, *fused_activation)?)
        }
        Primitive::MeanVarianceNormalization {
            axes,
            epsilon,
            normalize_variance,
        } => single(op_mean_variance_norm(
            required(inputs, 0, op)?,
            optional(inputs, 1),
            optional(inputs, 2),
            axes,
            *epsilon as f64,
            *normalize_variance,
        )?),
        Primitive::Join { axis } => {
            let parts = inputs
                .iter()
                .map(|input| {
                    input
                        .as_ref()
                        .ok_or_else(|| BackendError::execution("join input is missing"))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            let out_dims = output_dims(outputs, 0, op)?;
            single(op_join(&parts, *axis as usize, out_dims)?)
        }
        Primitive::Split { axis } => {
            let input = required(inputs, 0, op)?;
            let dims = outputs
                .iter()
                .map(|dims| {
                    dims.as_deref()
                        .ok_or_else(|| BackendError::execution("split output is missing"))
                })
                .collect::<BackendResult<Vec<_>>>()?;
            Ok(op_split(input, *axis as usize, &dims)?
                .into_iter()
                .map(Some)
                .collect())
        }
        Primitive::Slice {
            offsets,
            sizes,
            strides,
        } => {
            let input = required(inputs, 0, op)?;
            single(op_slice(input, offsets, sizes, strides)?)
        }
        Primitive::Resample { mode, scales } => {
            let input = required(inputs, 0, op)?;
            let out_dims = output_dims(outputs, 0, op)?;
            single(op_resample(*mode, input, scales, out_dims)?)
        }
        Primitive::Gru {
            direction,
            linear_before_reset,
            activations,
        } => {
            let (sequence, last) = op_gru(
                GruInputs {
                    input: required(inputs, 0, op)?,
                    weight: required(inputs, 1, op)?,
                    recurrence: required(inputs, 2, op)?,
                    bias: required(inputs, 3, op)?,
                    initial_hidden: optional(inputs, 4),
                },
                *direction,
                *linear_before_reset,
                *activations,
                outputs.first().is_some_and(Option::is_some),
            )?;
            Ok(vec![sequence, Some(last)])
        }
    }
}

fn required<'a>(
    inputs: &'a [Option<CpuTensor>],
    index: usize,
    op: &'static str,
) -> BackendResult<&'a CpuTensor> {
    inputs
        .get(index)
        .and_then(Option::as_ref)
        .ok_or_else(|| BackendError::execution(format!("{op} expects input {index}")))
}

fn optional(inputs: &[Option<CpuTensor>], index: usize) -> Option<&CpuTensor> {
    inputs.get(index).and_then(Option::as_ref)
}

fn output_dims<'a>(
    outputs: &'a [Option<Vec<usize>>],
    index: usize,
    op: &'static str,
) -> BackendResult<&'a [usize]> {
    outputs
        .get(index)
        .and_then(Option::as_deref)
        .ok_or_else(|| BackendError::execution(format!("{op} expects output {index}")))
}

fn single(tensor: CpuTensor) -> BackendResult<KernelOutputs> {
    Ok(vec![Some(tensor)])
}

fn map_values(input: &CpuTensor, f: impl Fn(f64) -> f64) -> CpuTensor {
    CpuTensor::new(input.dims.clone(), input.values.iter().map(|&v| f(v)).collect())
}

fn fuse(tensor: CpuTensor, activation: Option<NativeActivation>) -> BackendResult<CpuTensor> {
    match activation {
        Some(activation) => op_activation(activation, &tensor),
        None => Ok(tensor),
    }
}

pub fn scalar_activation(activation: NativeActivation, value: f64) -> BackendResult<f64> {
    Ok(match activation {
        NativeActivation::Relu => value.max(0.0),
        NativeActivation::Sigmoid => 1.0 / (1.0 + (-value).exp()),
        NativeActivation::Tanh => value.tanh(),
        NativeActivation::LeakyRelu { alpha } => {
            if value < 0.0 {
                value * alpha as f64
            } else {
                value
            }
        }
        NativeActivation::Softmax => {
            return Err(BackendError::invalid_argument(
                "softmax is not an element-wise activation",
            ))
        }
    })
}

fn op_activation(activation: NativeActivation, input: &CpuTensor) -> BackendResult<CpuTensor> {
    if activation != NativeActivation::Softmax {
        let values = input
            .values
            .iter()
            .map(|&v| scalar_activation(activation, v))
            .collect::<BackendResult<Vec<_>>>()?;
        return Ok(CpuTensor::new(input.dims.clone(), values));
    }
    // Softmax normalizes along the last axis.
    let width = input.dims.last().copied().unwrap_or(1).max(1);
    let mut values = input.values.clone();
    for row in values.chunks_mut(width) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    Ok(CpuTensor::new(input.dims.clone(), values))
}

fn op_element_wise(
    function: ElementWiseFunction,
    a: &CpuTensor,
    b: Option<&CpuTensor>,
) -> BackendResult<CpuTensor> {
    if function.arity() == 1 {
        let f: fn(f64) -> f64 = match function {
            ElementWiseFunction::Identity => |v| v,
            ElementWiseFunction::Abs => f64::abs,
            ElementWiseFunction::Ceil => f64::ceil,
            ElementWiseFunction::Cos => f64::cos,
            ElementWiseFunction::Exp => f64::exp,
            ElementWiseFunction::Floor => f64::floor,
            ElementWiseFunction::Log => f64::ln,
            ElementWiseFunction::Sin => f64::sin,
            ElementWiseFunction::Tan => f64::tan,
            _ => return Err(BackendError::invalid_argument(format!("{function:?} is binary"))),
        };
        return Ok(map_values(a, f));
    }
    let b = b.ok_or_else(|| BackendError::execution(format!("{function:?} expects two inputs")))?;
    if a.dims != b.dims {
        return Err(BackendError::execution(format!(
            "{function:?} operands disagree: {:?} vs {:?}",
            a.dims, b.dims
        )));
    }
    let f: fn(f64, f64) -> f64 = match function {
        ElementWiseFunction::Add => |x, y| x + y,
        ElementWiseFunction::Subtract => |x, y| x - y,
        ElementWiseFunction::Multiply => |x, y| x * y,
        ElementWiseFunction::Divide => |x, y| x / y,
        ElementWiseFunction::Max => f64::max,
        ElementWiseFunction::Min => f64::min,
        ElementWiseFunction::Pow => f64::powf,
        _ => return Err(BackendError::invalid_argument(format!("{function:?} is unary"))),
    };
    let values = a
        .values
        .iter()
        .zip(&b.values)
        .map(|(&x, &y)| f(x, y))
        .collect();
    Ok(CpuTensor::new(a.dims.clone(), values))
}

/// Batched matrix product over 4-D operands; the batch axes are already broadcast.
fn op_gemm(
    a: &CpuTensor,
    b: &CpuTensor,
    c: Option<&CpuTensor>,
    transpose_a: bool,
    transpose_b: bool,
    alpha: f64,
    beta: f64,
) -> BackendResult<CpuTensor> {
    if a.dims.len() != 4 || b.dims.len() != 4 {
        return Err(BackendError::execution("gemm operands must be 4-D"));
    }
    let (m, k) = if transpose_a {
        (a.dims[3], a.dims[2])
    } else {
        (a.dims[2], a.dims[3])
    };
    let (k_b, n) = if transpose_b {
        (b.dims[3], b.dims[2])
    } else {
        (b.dims[2], b.dims[3])
    };
    if k != k_b || a.dims[..2] != b.dims[..2] {
        return Err(BackendError::execution(format!(
            "gemm shapes {:?} and {:?} are incompatible",
            a.dims, b.dims
        )));
    }
    let batches = [a.dims[0], a.dims[1]];
    let mut out = CpuTensor::zeros(&[batches[0], batches[1], m, n]);
    for b0 in 0..batches[0] {
        for b1 in 0..batches[1] {
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.0;
                    for p in 0..k {
                        let lhs = if transpose_a {
                            a.at(&[b0, b1, p, i])
                        } else {
                            a.at(&[b0, b1, i, p])
                        };
                        let rhs = if transpose_b {
                            b.at(&[b0, b1, j, p])
                        } else {
                            b.at(&[b0, b1, p, j])
                        };
                        sum += lhs * rhs;
                    }
                    let mut value = alpha * sum;
                    if let Some(c) = c {
                        value += beta * c.at_broadcast(&[b0, b1, i, j]);
                    }
                    let index = flat_index(&[b0, b1, i, j], &out.dims);
                    out.values[index] = value;
                }
            }
        }
    }
    Ok(out)
}

struct ConvParams {
    strides: [usize; 2],
    dilations: [usize; 2],
    start_padding: [usize; 2],
    groups: usize,
}

/// Input NCHW, filter OIHW.
fn op_conv_forward(
    input: &CpuTensor,
    filter: &CpuTensor,
    out_dims: &[usize],
    params: &ConvParams,
) -> BackendResult<CpuTensor> {
    let [batch, in_channels, in_h, in_w] = dims4(&input.dims, "convolution input")?;
    let [out_channels, group_in, kernel_h, kernel_w] = dims4(&filter.dims, "convolution filter")?;
    let [_, _, out_h, out_w] = dims4(out_dims, "convolution output")?;
    let groups = params.groups.max(1);
    if group_in * groups != in_channels || out_channels % groups != 0 {
        return Err(BackendError::execution(format!(
            "filter {:?} does not match {in_channels} input channels in {groups} groups",
            filter.dims
        )));
    }
    let group_out = out_channels / groups;
    let mut out = CpuTensor::zeros(out_dims);
    for n in 0..batch {
        for o in 0..out_channels {
            let group = o / group_out;
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut sum = 0.0;
                    for c in 0..group_in {
                        for ky in 0..kernel_h {
                            let Some(iy) = window_coord(oy, ky, 0, params) else {
                                continue;
                            };
                            if iy >= in_h {
                                continue;
                            }
                            for kx in 0..kernel_w {
                                let Some(ix) = window_coord(ox, kx, 1, params) else {
                                    continue;
                                };
                                if ix >= in_w {
                                    continue;
                                }
                                sum += input.at(&[n, group * group_in + c, iy, ix])
                                    * filter.at(&[o, c, ky, kx]);
                            }
                        }
                    }
                    let index = flat_index(&[n, o, oy, ox], out_dims);
                    out.values[index] = sum;
                }
            }
        }
    }
    Ok(out)
}

/// Input NCHW, filter IOHW; each input pixel scatters a scaled filter into the output.
fn op_conv_backward(
    input: &CpuTensor,
    filter: &CpuTensor,
    out_dims: &[usize],
    params: &ConvParams,
) -> BackendResult<CpuTensor> {
    let [batch, in_channels, in_h, in_w] = dims4(&input.dims, "transposed convolution input")?;
    let [filter_in, group_out, kernel_h, kernel_w] =
        dims4(&filter.dims, "transposed convolution filter")?;
    let [_, out_channels, out_h, out_w] = dims4(out_dims, "transposed convolution output")?;
    let groups = params.groups.max(1);
    if filter_in != in_channels || group_out * groups != out_channels {
        return Err(BackendError::execution(format!(
            "filter {:?} does not match {in_channels} input channels in {groups} groups",
            filter.dims
        )));
    }
    let group_in = in_channels / groups;
    let mut out = CpuTensor::zeros(out_dims);
    for n in 0..batch {
        for ci in 0..in_channels {
            let group = ci / group_in;
            for iy in 0..in_h {
                for ix in 0..in_w {
                    let value = input.at(&[n, ci, iy, ix]);
                    for co in 0..group_out {
                        for ky in 0..kernel_h {
                            let y = (iy * params.strides[0] + ky * params.dilations[0]) as isize
                                - params.start_padding[0] as isize;
                            if y < 0 || y as usize >= out_h {
                                continue;
                            }
                            for kx in 0..kernel_w {
                                let x = (ix * params.strides[1] + kx * params.dilations[1]) as isize
                                    - params.start_padding[1] as isize;
                                if x < 0 || x as usize >= out_w {
                                    continue;
                                }
                                let index = flat_index(
                                    &[n, group * group_out + co, y as usize, x as usize],
                                    out_dims,
                                );
                                out.values[index] += value * filter.at(&[ci, co, ky, kx]);
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(out)
}

fn window_coord(out: usize, k: usize, axis: usize, params: &ConvParams) -> Option<usize> {
    let coord = (out * params.strides[axis] + k * params.dilations[axis]) as isize
        - params.start_padding[axis] as isize;
    (coord >= 0).then_some(coord as usize)
}

fn add_channel_bias(out: &mut CpuTensor, bias: &CpuTensor) -> BackendResult<()> {
    let channels = out.dims.get(1).copied().unwrap_or(0);
    if bias.len() != channels {
        return Err(BackendError::execution(format!(
            "bias has {} values for {channels} channels",
            bias.len()
        )));
    }
    let spatial: usize = out.dims[2..].iter().product();
    for (index, value) in out.values.iter_mut().enumerate() {
        let channel = (index / spatial.max(1)) % channels;
        *value += bias.values[channel];
    }
    Ok(())
}

/// Average pooling divides by the number of in-bounds elements; padding never counts.
fn op_pooling(
    function: PoolingFunction,
    input: &CpuTensor,
    out_dims: &[usize],
    window: [usize; 2],
    strides: [usize; 2],
    dilations: [usize; 2],
    start_padding: [usize; 2],
) -> BackendResult<CpuTensor> {
    let [batch, channels, in_h, in_w] = dims4(&input.dims, "pooling input")?;
    let [_, _, out_h, out_w] = dims4(out_dims, "pooling output")?;
    let mut out = CpuTensor::zeros(out_dims);
    for n in 0..batch {
        for c in 0..channels {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = match function {
                        PoolingFunction::Max => f64::NEG_INFINITY,
                        PoolingFunction::Average | PoolingFunction::L2 => 0.0,
                    };
                    let mut count = 0usize;
                    for ky in 0..window[0] {
                        let y = (oy * strides[0] + ky * dilations[0]) as isize
                            - start_padding[0] as isize;
                        if y < 0 || y as usize >= in_h {
                            continue;
                        }
                        for kx in 0..window[1] {
                            let x = (ox * strides[1] + kx * dilations[1]) as isize
                                - start_padding[1] as isize;
                            if x < 0 || x as usize >= in_w {
                                continue;
                            }
                            let value = input.at(&[n, c, y as usize, x as usize]);
                            acc = match function {
                                PoolingFunction::Max => acc.max(value),
                                PoolingFunction::Average => acc + value,
                                PoolingFunction::L2 => acc + value * value,
                            };
                            count += 1;
                        }
                    }
                    let value = match function {
                        _ if count == 0 => 0.0,
                        PoolingFunction::Max => acc,
                        PoolingFunction::Average => acc / count as f64,
                        PoolingFunction::L2 => acc.sqrt(),
                    };
                    let index = flat_index(&[n, c, oy, ox], out_dims);
                    out.values[index] = value;
                }
            }
        }
    }
    Ok(out)
}

fn op_padding(
    mode: PaddingMode,
    value: f64,
    input: &CpuTensor,
    start_padding: &[u32],
    out_dims: &[usize],
) -> BackendResult<CpuTensor> {
    let rank = input.dims.len();
    if start_padding.len() != rank || out_dims.len() != rank {
        return Err(BackendError::execution("padding rank does not match its input"));
    }
    let mut out = CpuTensor::zeros(out_dims);
    let mut source = vec![0usize; rank];
    for (index, slot) in out.values.iter_mut().enumerate() {
        let coords = unravel_index(index, out_dims);
        let mut inside = true;
        for axis in 0..rank {
            let dim = input.dims[axis] as isize;
            let coord = coords[axis] as isize - start_padding[axis] as isize;
            let mapped = if (0..dim).contains(&coord) {
                coord
            } else {
                match mode {
                    PaddingMode::Constant => {
                        inside = false;
                        break;
                    }
                    PaddingMode::Edge => coord.clamp(0, dim - 1),
                    PaddingMode::Reflection => reflect(coord, dim, false),
                    PaddingMode::Symmetric => reflect(coord, dim, true),
                }
            };
            source[axis] = mapped as usize;
        }
        *slot = if inside { input.at(&source) } else { value };
    }
    Ok(out)
}

/// Mirrors `coord` back into `[0, dim)`. Symmetric mirroring repeats the edge element.
fn reflect(mut coord: isize, dim: isize, symmetric: bool) -> isize {
    if dim <= 1 {
        return 0;
    }
    let edge = if symmetric { 1 } else { 0 };
    while !(0..dim).contains(&coord) {
        coord = if coord < 0 {
            -coord - edge
        } else {
            2 * (dim - 1) - coord + edge
        };
    }
    coord
}

fn op_reduce(
    function: ReduceFunction,
    input: &CpuTensor,
    axes: &[u32],
) -> BackendResult<CpuTensor> {
    let rank = input.dims.len();
    if axes.iter().any(|&axis| axis as usize >= rank) {
        return Err(BackendError::execution(format!(
            "reduce axes {axes:?} exceed rank {rank}"
        )));
    }
    let reduced = |axis: usize| axes.contains(&(axis as u32));
    let out_dims: Vec<usize> = input
        .dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if reduced(axis) { 1 } else { dim })
        .collect();
    let window_dims: Vec<usize> = input
        .dims
        .iter()
        .enumerate()
        .filter(|(axis, _)| reduced(*axis))
        .map(|(_, &dim)| dim)
        .collect();
    let window: usize = window_dims.iter().product();
    let out_len: usize = out_dims.iter().product();
    let init = match function {
        ReduceFunction::Max | ReduceFunction::ArgMax => f64::NEG_INFINITY,
        ReduceFunction::Min | ReduceFunction::ArgMin => f64::INFINITY,
        ReduceFunction::Product => 1.0,
        _ => 0.0,
    };
    let mut acc = vec![init; out_len];
    let mut best = vec![0usize; out_len];
    for (index, &value) in input.values.iter().enumerate() {
        let coords = unravel_index(index, &input.dims);
        let mut out_index = 0usize;
        let mut window_index = 0usize;
        for (axis, &coord) in coords.iter().enumerate() {
            if reduced(axis) {
                window_index = window_index * input.dims[axis] + coord;
            } else {
                out_index = out_index * input.dims[axis] + coord;
            }
        }
        let slot = &mut acc[out_index];
        match function {
            ReduceFunction::Sum | ReduceFunction::Mean => *slot += value,
            ReduceFunction::L1 => *slot += value.abs(),
            ReduceFunction::L2 => *slot += value * value,
            ReduceFunction::Product => *slot *= value,
            ReduceFunction::Max => *slot = slot.max(value),
            ReduceFunction::Min => *slot = slot.min(value),
            ReduceFunction::ArgMax => {
                if value > *slot {
                    *slot = value;
                    best[out_index] = window_index;
                }
            }
            ReduceFunction::ArgMin => {
                if value < *slot {
                    *slot = value;
                    best[out_index] = window_index;
                }
            }
        }
    }
    let values = match function {
        ReduceFunction::Mean => acc.into_iter().map(|v| v / window.max(1) as f64).collect(),
        ReduceFunction::L2 => acc.into_iter().map(f64::sqrt).collect(),
        ReduceFunction::ArgMax | ReduceFunction::ArgMin => {
            best.into_iter().map(|index| index as f64).collect()
        }
        _ => acc,
    };
    Ok(CpuTensor::new(out_dims, values))
}

fn op_batch_norm(
    input: &CpuTensor,
    mean: &CpuTensor,
    variance: &CpuTensor,
    scale: &CpuTensor,
    bias: &CpuTensor,
    epsilon: f64,
) -> BackendResult<CpuTensor> {
    let channels = input.dims.get(1).copied().unwrap_or(0);
    for (what, tensor) in [
        ("mean", mean),
        ("variance", variance),
        ("scale", scale),
        ("bias", bias),
    ] {
        if tensor.len() != channels {
            return Err(BackendError::execution(format!(
                "batch normalization {what} has {} values for {channels} channels",
                tensor.len()
            )));
        }
    }
    let spatial: usize = input.dims[2..].iter().product::<usize>().max(1);
    let values = input
        .values
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            let c = (index / spatial) % channels;
            (value - mean.values[c]) / (variance.values[c] + epsilon).sqrt() * scale.values[c]
                + bias.values[c]
        })
        .collect();
    Ok(CpuTensor::new(input.dims.clone(), values))
}

fn op_mean_variance_norm(
    input: &CpuTensor,
    scale: Option<&CpuTensor>,
    bias: Option<&CpuTensor>,
    axes: &[u32],
    epsilon: f64,
    normalize_variance: bool,
) -> BackendResult<CpuTensor> {
    let stats = op_reduce(ReduceFunction::Mean, input, axes)?;
    let squares = map_values(input, |v| v * v);
    let mean_squares = op_reduce(ReduceFunction::Mean, &squares, axes)?;
    let mut out = input.clone();
    for (index, value) in out.values.iter_mut().enumerate() {
        let coords = unravel_index(index, &input.dims);
        let mean = stats.at_broadcast(&coords);
        let mut normalized = *value - mean;
        if normalize_variance {
            let variance = (mean_squares.at_broadcast(&coords) - mean * mean).max(0.0);
            normalized /= (variance + epsilon).sqrt();
        }
        if let Some(scale) = scale {
            normalized *= scale.at_broadcast(&coords);
        }
        if let Some(bias) = bias {
            normalized += bias.at_broadcast(&coords);
        }
        *value = normalized;
    }
    Ok(out)
}

fn op_join(parts: &[&CpuTensor], axis: usize, out_dims: &[usize]) -> BackendResult<CpuTensor> {
    let total: usize = parts.iter().map(|part| part.dims.get(axis).copied().unwrap_or(0)).sum();
    if out_dims.get(axis) != Some(&total) {
        return Err(BackendError::execution(format!(
            "join along axis {axis} yields {total}, expected {out_dims:?}"
        )));
    }
    let outer: usize = out_dims[..axis].iter().product();
    let mut values = Vec::with_capacity(out_dims.iter().product());
    for block in 0..outer {
        for part in parts {
            let chunk: usize = part.dims[axis..].iter().product();
            values.extend_from_slice(&part.values[block * chunk..(block + 1) * chunk]);
        }
    }
    Ok(CpuTensor::new(out_dims.to_vec(), values))
}

fn op_split(input: &CpuTensor, axis: usize, outputs: &[&[usize]]) -> BackendResult<Vec<CpuTensor>> {
    let total: usize = outputs.iter().map(|dims| dims.get(axis).copied().unwrap_or(0)).sum();
    if input.dims.get(axis) != Some(&total) {
        return Err(BackendError::execution(format!(
            "split sizes sum to {total}, input is {:?}",
            input.dims
        )));
    }
    let outer: usize = input.dims[..axis].iter().product();
    let row: usize = input.dims[axis..].iter().product();
    let mut results = Vec::with_capacity(outputs.len());
    let mut start = 0usize;
    for dims in outputs {
        let chunk: usize = dims[axis..].iter().product();
        let mut values = Vec::with_capacity(outer * chunk);
        for block in 0..outer {
            let begin = block * row + start;
            values.extend_from_slice(&input.values[begin..begin + chunk]);
        }
        start += chunk;
        results.push(CpuTensor::new(dims.to_vec(), values));
    }
    Ok(results)
}

fn op_slice(
    input: &CpuTensor,
    offsets: &[u32],
    sizes: &[u32],
    strides: &[u32],
) -> BackendResult<CpuTensor> {
    let rank = input.dims.len();
    if offsets.len() != rank || sizes.len() != rank || strides.len() != rank {
        return Err(BackendError::execution("slice parameters do not match input rank"));
    }
    let out_dims: Vec<usize> = sizes.iter().map(|&size| size as usize).collect();
    for axis in 0..rank {
        let last = offsets[axis] as usize
            + (out_dims[axis].saturating_sub(1)) * strides[axis] as usize;
        if out_dims[axis] > 0 && last >= input.dims[axis] {
            return Err(BackendError::execution(format!(
                "slice reads past axis {axis} of {:?}",
                input.dims
            )));
        }
    }
    let mut out = CpuTensor::zeros(&out_dims);
    let mut source = vec![0usize; rank];
    for (index, slot) in out.values.iter_mut().enumerate() {
        let coords = unravel_index(index, &out_dims);
        for axis in 0..rank {
            source[axis] = offsets[axis] as usize + coords[axis] * strides[axis] as usize;
        }
        *slot = input.at(&source);
    }
    Ok(out)
}

/// Half-pixel resampling: output coordinate `o` samples input `(o + 0.5) / scale - 0.5`.
fn op_resample(
    mode: InterpolationMode,
    input: &CpuTensor,
    scales: &[f32],
    out_dims: &[usize],
) -> BackendResult<CpuTensor> {
    let rank = input.dims.len();
    if scales.len() != rank || out_dims.len() != rank {
        return Err(BackendError::execution("resample parameters do not match input rank"));
    }
    let mut out = CpuTensor::zeros(out_dims);
    for (index, slot) in out.values.iter_mut().enumerate() {
        let coords = unravel_index(index, out_dims);
        *slot = match mode {
            InterpolationMode::NearestNeighbor => {
                let source: Vec<usize> = (0..rank)
                    .map(|axis| {
                        let position = (coords[axis] as f64 + 0.5) / scales[axis] as f64;
                        (position.floor() as usize).min(input.dims[axis] - 1)
                    })
                    .collect();
                input.at(&source)
            }
            InterpolationMode::Linear => {
                let taps: Vec<(usize, usize, f64)> = (0..rank)
                    .map(|axis| {
                        let position = ((coords[axis] as f64 + 0.5) / scales[axis] as f64 - 0.5)
                            .clamp(0.0, (input.dims[axis] - 1) as f64);
                        let low = position.floor() as usize;
                        let high = (low + 1).min(input.dims[axis] - 1);
                        (low, high, position - low as f64)
                    })
                    .collect();
                let mut sum = 0.0;
                let mut corner = vec![0usize; rank];
                for mask in 0..(1usize << rank) {
                    let mut weight = 1.0;
                    for (axis, &(low, high, fraction)) in taps.iter().enumerate() {
                        if mask & (1 << axis) == 0 {
                            corner[axis] = low;
                            weight *= 1.0 - fraction;
                        } else {
                            corner[axis] = high;
                            weight *= fraction;
                        }
                    }
                    if weight != 0.0 {
                        sum += weight * input.at(&corner);
                    }
                }
                sum
            }
        };
    }
    Ok(out)
}

struct GruInputs<'a> {
    input: &'a CpuTensor,
    weight: &'a CpuTensor,
    recurrence: &'a CpuTensor,
    bias: &'a CpuTensor,
    initial_hidden: Option<&'a CpuTensor>,
}

/// Gates are laid out update, reset, new along the `3 * hidden` axis.
fn op_gru(
    inputs: GruInputs<'_>,
    direction: RecurrentDirection,
    linear_before_reset: bool,
    activations: [NativeActivation; 2],
    return_sequence: bool,
) -> BackendResult<(Option<CpuTensor>, CpuTensor)> {
    let [_, steps, batch, input_size] = dims4(&inputs.input.dims, "gru input")?;
    let [_, dirs, gates, weight_input] = dims4(&inputs.weight.dims, "gru weight")?;
    let hidden = gates / 3;
    if weight_input != input_size || gates != hidden * 3 {
        return Err(BackendError::execution(format!(
            "gru weight {:?} does not match input {:?}",
            inputs.weight.dims, inputs.input.dims
        )));
    }
    if inputs.recurrence.dims != [1, dirs, gates, hidden] || inputs.bias.len() != dirs * gates * 2 {
        return Err(BackendError::execution("gru recurrence or bias shape mismatch"));
    }
    let [gate_fn, candidate_fn] = activations;
    let mut sequence = return_sequence.then(|| CpuTensor::zeros(&[steps, dirs, batch, hidden]));
    let mut last = CpuTensor::zeros(&[1, dirs, batch, hidden]);

    for dir in 0..dirs {
        let backward = direction == RecurrentDirection::Backward
            || (direction == RecurrentDirection::Both && dir == 1);
        let mut state: Vec<f64> = match inputs.initial_hidden {
            Some(h0) => (0..batch * hidden)
                .map(|i| h0.at(&[0, dir, i / hidden, i % hidden]))
                .collect(),
            None => vec![0.0; batch * hidden],
        };
        let bias = |j: usize| inputs.bias.values[dir * gates * 2 + j];
        for step in 0..steps {
            let t = if backward { steps - 1 - step } else { step };
            let mut next = vec![0.0; batch * hidden];
            for b in 0..batch {
                let h = &state[b * hidden..(b + 1) * hidden];
                let project = |gate: usize, unit: usize| {
                    let row = gate * hidden + unit;
                    let mut x_part = bias(row);
                    for i in 0..input_size {
                        x_part +=
                            inputs.input.at(&[0, t, b, i]) * inputs.weight.at(&[0, dir, row, i]);
                    }
                    let mut h_part = bias(gates + row);
                    for (i, &hv) in h.iter().enumerate() {
                        h_part += hv * inputs.recurrence.at(&[0, dir, row, i]);
                    }
                    (x_part, h_part)
                };
                let mut z = vec![0.0; hidden];
                let mut r = vec![0.0; hidden];
                for unit in 0..hidden {
                    let (zx, zh) = project(0, unit);
                    z[unit] = scalar_activation(gate_fn, zx + zh)?;
                    let (rx, rh) = project(1, unit);
                    r[unit] = scalar_activation(gate_fn, rx + rh)?;
                }
                for unit in 0..hidden {
                    let row = 2 * hidden + unit;
                    let (nx, nh) = project(2, unit);
                    let pre = if linear_before_reset {
                        nx + r[unit] * nh
                    } else {
                        let mut reset_h = bias(gates + row);
                        for (i, &hv) in h.iter().enumerate() {
                            reset_h += r[i] * hv * inputs.recurrence.at(&[0, dir, row, i]);
                        }
                        nx + reset_h
                    };
                    let n = scalar_activation(candidate_fn, pre)?;
                    next[b * hidden + unit] = (1.0 - z[unit]) * n + z[unit] * h[unit];
                }
            }
            state = next;
            if let Some(sequence) = sequence.as_mut() {
                for (i, &value) in state.iter().enumerate() {
                    let index = flat_index(&[t, dir, i / hidden, i % hidden], &sequence.dims);
                    sequence.values[index] = value;
                }
            }
        }
        for (i, &value) in state.iter().enumerate() {
            let index = flat_index(&[0, dir, i / hidden, i % hidden], &last.dims);
            last.values[index] = value;
        }
    }
    Ok((sequence, last))
}

fn dims4(dims: &[usize], what: &str) -> BackendResult<[usize; 4]> {
    match dims {
        [a, b, c, d] => Ok([*a, *b, *c, *d]),
        _ => Err(BackendError::execution(format!(
            "{what} must be 4-D, got {dims:?}"
        ))),
    }
}

pub(crate) fn flat_index(coords: &[usize], dims: &[usize]) -> usize {
    coords
        .iter()
        .zip(dims)
        .fold(0usize, |acc, (&coord, &dim)| acc * dim + coord)
}

pub(crate) fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        if *dim == 0 {
            continue;
        }
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}
