//! Lowering of a scheduled IR graph into a [`NativeGraph`].
//!
//! Every IR operand maps to a [`NativeNode`]. Layout changes, reshapes and broadcasts rewrite the
//! node descriptor instead of emitting compute nodes, so most views are free.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};

use crate::backend::NativeBackend;
use crate::descriptor::TensorSpec;
use crate::error::{lowering_ensure, ResultExt, WebnnError, WebnnResult};
use crate::graph::ir::{GraphArena, OperandId, OperatorId, OperatorRecord};
use crate::graph::ops::{
    BatchNormOptions, BinaryOp, Conv2dOptions, ConvTranspose2dOptions, FusedActivation,
    GemmOptions, GruOptions, InstanceNormOptions, OperatorKind, PadOptions, Pool2dOptions, PoolKind,
    ReduceOp, UnaryOp,
};
use crate::graph::shape;

use super::desc::{
    broadcast_desc, filter_as_iohw, filter_as_oihw, input_as_nchw, nchw_as_nhwc, nhwc_as_nchw,
    output_from_nchw, NativeDataType, NativeTensorDesc,
};
use super::graph::{NativeGraph, NativeGraphBuilder, NativeInputKind, NativeNode};
use super::primitive::{
    ConvolutionDirection, ElementWiseFunction, NativeActivation, PoolingFunction, Primitive,
    ReduceFunction,
};

/// Lowers the operators of `schedule` and exposes `outputs` as named graph outputs.
pub fn lower(
    arena: &GraphArena,
    schedule: &[OperatorId],
    outputs: &[(String, OperandId)],
    backend: &dyn NativeBackend,
) -> WebnnResult<NativeGraph> {
    let mut lowering = Lowering {
        arena,
        native: NativeGraphBuilder::new(backend),
        nodes: HashMap::new(),
    };
    for &operator_id in schedule {
        let record = arena.operator(operator_id)?;
        lowering
            .lower_operator(operator_id, record)
            .with_context(|| format!("lowering {} ({operator_id})", record.kind.name()))?;
    }
    for (name, operand) in outputs {
        let mut node = lowering.node(*operand)?;
        if node.is_graph_input() || !node.desc.is_contiguous() {
            node = lowering.identity(&node)?;
        }
        lowering.native.set_graph_output(&node, name.clone(), true)?;
    }
    let graph = lowering.native.finish();
    debug!(
        "lowered {} IR operators into {} native operators, {} inputs, {} outputs",
        schedule.len(),
        graph.operators.len(),
        graph.inputs.len(),
        graph.outputs.len()
    );
    Ok(graph)
}

struct Lowering<'a> {
    arena: &'a GraphArena,
    native: NativeGraphBuilder<'a>,
    nodes: HashMap<OperandId, NativeNode>,
}

impl Lowering<'_> {
    fn node(&self, operand: OperandId) -> WebnnResult<NativeNode> {
        self.nodes
            .get(&operand)
            .cloned()
            .ok_or_else(|| WebnnError::internal(format!("operand {operand} was not lowered")))
    }

    fn optional_node(&self, operand: Option<OperandId>) -> WebnnResult<Option<NativeNode>> {
        operand.map(|operand| self.node(operand)).transpose()
    }

    fn spec(&self, operand: OperandId) -> WebnnResult<&TensorSpec> {
        self.arena.spec(operand)
    }

    fn bind(&mut self, operand: OperandId, node: NativeNode) {
        self.nodes.insert(operand, node);
    }

    fn output_desc(&self, record: &OperatorRecord, index: usize) -> WebnnResult<NativeTensorDesc> {
        let operand = output_operand(record, index)?;
        let spec = self.spec(operand)?;
        NativeTensorDesc::from_operand(spec.ty, spec.dims())
    }

    fn add_single(
        &mut self,
        primitive: Primitive,
        inputs: &[Option<&NativeNode>],
        output: NativeTensorDesc,
    ) -> WebnnResult<NativeNode> {
        let operator = self.native.add_operator(primitive, inputs, vec![Some(output)])?;
        self.native.output_node(operator, 0)
    }

    /// Dense copy of `node`.
    fn identity(&mut self, node: &NativeNode) -> WebnnResult<NativeNode> {
        let output = NativeTensorDesc::new(node.desc.data_type, &node.desc.dims)?;
        self.add_single(
            Primitive::ElementWise(ElementWiseFunction::Identity),
            &[Some(node)],
            output,
        )
    }

    /// Backend-owned constant of `dims` with every element set to `value`.
    fn filled_constant(
        &mut self,
        data_type: NativeDataType,
        dims: &[u32],
        value: f64,
    ) -> WebnnResult<NativeNode> {
        let desc = NativeTensorDesc::new(data_type, dims)?.owned_by_backend(true);
        let bytes = encode_fill(data_type, desc.element_count() as usize, value);
        self.native.add_input(
            None,
            NativeInputKind::Constant {
                bytes: Arc::from(bytes),
            },
            desc,
        )
    }

    /// One-element constant viewed with zero strides at the shape of `like`.
    fn broadcast_scalar(&mut self, like: &NativeTensorDesc, value: f64) -> WebnnResult<NativeNode> {
        let scalar = self.filled_constant(like.data_type, &[1], value)?;
        let desc = broadcast_desc(&scalar.desc, &like.dims, 0)?;
        Ok(scalar.with_desc(desc))
    }

    fn element_wise(
        &mut self,
        function: ElementWiseFunction,
        a: &NativeNode,
        b: Option<&NativeNode>,
    ) -> WebnnResult<NativeNode> {
        let output = NativeTensorDesc::new(a.desc.data_type, &a.desc.dims)?;
        self.add_single(Primitive::ElementWise(function), &[Some(a), b], output)
    }

    fn lower_operator(&mut self, operator_id: OperatorId, record: &OperatorRecord) -> WebnnResult<()> {
        let inputs = record.inputs.as_slice();
        match &record.kind {
            OperatorKind::Input { name } => {
                let desc = self.output_desc(record, 0)?;
                let node = self
                    .native
                    .add_input(Some(name.clone()), NativeInputKind::NonConstant, desc)?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::Constant { bytes } => {
                let desc = self.output_desc(record, 0)?.owned_by_backend(true);
                let node = self.native.add_input(
                    None,
                    NativeInputKind::Constant {
                        bytes: Arc::clone(bytes),
                    },
                    desc,
                )?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::Binary(BinaryOp::MatMul) => self.lower_matmul(record)?,
            OperatorKind::Binary(op) => {
                let a = self.node(input_operand(inputs, 0)?)?;
                let b = self.node(input_operand(inputs, 1)?)?;
                let output = self.output_desc(record, 0)?;
                let a = a.with_desc(broadcast_desc(&a.desc, &output.dims, 0)?);
                let b = b.with_desc(broadcast_desc(&b.desc, &output.dims, 0)?);
                let node = self.add_single(
                    Primitive::ElementWise(binary_function(*op)),
                    &[Some(&a), Some(&b)],
                    output,
                )?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::Unary(op) => {
                let input = self.node(input_operand(inputs, 0)?)?;
                let node = self.lower_unary(*op, &input)?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::LeakyRelu(options) => {
                let input = self.node(input_operand(inputs, 0)?)?;
                let node = self.apply_activation(
                    &input,
                    FusedActivation::LeakyRelu {
                        alpha: options.alpha,
                    },
                )?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::Clamp(options) => {
                let input = self.node(input_operand(inputs, 0)?)?;
                let node = self.apply_activation(
                    &input,
                    FusedActivation::Clamp {
                        min_value: options.min_value,
                        max_value: options.max_value,
                    },
                )?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::Conv2d(options) => self.lower_conv2d(record, options)?,
            OperatorKind::ConvTranspose2d(options) => self.lower_conv_transpose2d(record, options)?,
            OperatorKind::Pool2d { kind, options } => self.lower_pool2d(record, *kind, options)?,
            OperatorKind::Gemm(options) => self.lower_gemm(record, options)?,
            OperatorKind::Concat { axis } => self.lower_concat(record, *axis)?,
            OperatorKind::Reshape { .. } | OperatorKind::Squeeze { .. } => {
                let mut node = self.node(input_operand(inputs, 0)?)?;
                if !node.desc.is_contiguous() {
                    node = self.identity(&node)?;
                }
                let output = output_operand(record, 0)?;
                let dims = self.spec(output)?.dims().to_vec();
                let desc = node.desc.reshaped(&dims)?;
                self.bind(output, node.with_desc(desc));
            }
            OperatorKind::Transpose { permutation } => {
                let node = self.node(input_operand(inputs, 0)?)?;
                let desc = node.desc.permuted(permutation)?;
                self.bind(output_operand(record, 0)?, node.with_desc(desc));
            }
            OperatorKind::Reduce {
                op,
                axes,
                keep_dimensions: _,
            } => self.lower_reduce(record, *op, axes)?,
            OperatorKind::Pad(options) => self.lower_pad(operator_id, record, options)?,
            OperatorKind::BatchNorm(options) => self.lower_batch_norm(record, options)?,
            OperatorKind::InstanceNorm(options) => self.lower_instance_norm(record, options)?,
            OperatorKind::Gru {
                steps,
                hidden_size,
                options,
            } => self.lower_gru(record, *steps, *hidden_size, options)?,
            OperatorKind::Split { sizes: _, axis } => {
                let input = self.node(input_operand(inputs, 0)?)?;
                let outputs = (0..record.outputs.len())
                    .map(|index| self.output_desc(record, index).map(Some))
                    .collect::<WebnnResult<Vec<_>>>()?;
                let operator =
                    self.native
                        .add_operator(Primitive::Split { axis: *axis }, &[Some(&input)], outputs)?;
                for (index, &operand) in record.outputs.iter().enumerate() {
                    let node = self.native.output_node(operator, index as u32)?;
                    self.bind(operand, node);
                }
            }
            OperatorKind::Slice {
                starts,
                sizes,
                axes,
            } => {
                let input = self.node(input_operand(inputs, 0)?)?;
                let mut offsets = vec![0u32; input.desc.rank()];
                let mut full_sizes = input.desc.dims.clone();
                for ((&axis, &start), &size) in axes.iter().zip(starts).zip(sizes) {
                    let axis = axis as usize;
                    lowering_ensure!(axis < offsets.len(), "slice axis {axis} is out of range");
                    offsets[axis] = start;
                    full_sizes[axis] = size;
                }
                let output = NativeTensorDesc::new(input.desc.data_type, &full_sizes)?;
                let strides = vec![1u32; offsets.len()];
                let node = self.add_single(
                    Primitive::Slice {
                        offsets,
                        sizes: full_sizes,
                        strides,
                    },
                    &[Some(&input)],
                    output,
                )?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::Resample2d { mode, axes, sizes } => {
                let input = self.node(input_operand(inputs, 0)?)?;
                let mut scales = vec![1.0f32; input.desc.rank()];
                for (&axis, &size) in axes.iter().zip(sizes) {
                    let axis = axis as usize;
                    lowering_ensure!(axis < scales.len(), "resample axis {axis} is out of range");
                    scales[axis] = size as f32 / input.desc.dims[axis] as f32;
                }
                let output = self.output_desc(record, 0)?;
                let node = self.add_single(
                    Primitive::Resample {
                        mode: *mode,
                        scales,
                    },
                    &[Some(&input)],
                    output,
                )?;
                self.bind(output_operand(record, 0)?, node);
            }
            OperatorKind::Invalid { op } => {
                return Err(WebnnError::internal(format!(
                    "invalid {op} operator reached lowering"
                )))
            }
        }
        Ok(())
    }

    fn lower_unary(&mut self, op: UnaryOp, input: &NativeNode) -> WebnnResult<NativeNode> {
        let output = NativeTensorDesc::new(input.desc.data_type, &input.desc.dims)?;
        let primitive = match op {
            UnaryOp::Abs => Primitive::ElementWise(ElementWiseFunction::Abs),
            UnaryOp::Ceil => Primitive::ElementWise(ElementWiseFunction::Ceil),
            UnaryOp::Cos => Primitive::ElementWise(ElementWiseFunction::Cos),
            UnaryOp::Exp => Primitive::ElementWise(ElementWiseFunction::Exp),
            UnaryOp::Floor => Primitive::ElementWise(ElementWiseFunction::Floor),
            UnaryOp::Log => Primitive::ElementWise(ElementWiseFunction::Log),
            UnaryOp::Sin => Primitive::ElementWise(ElementWiseFunction::Sin),
            UnaryOp::Tan => Primitive::ElementWise(ElementWiseFunction::Tan),
            UnaryOp::Relu => Primitive::Activation(NativeActivation::Relu),
            UnaryOp::Sigmoid => Primitive::Activation(NativeActivation::Sigmoid),
            UnaryOp::Tanh => Primitive::Activation(NativeActivation::Tanh),
            UnaryOp::Softmax => Primitive::Activation(NativeActivation::Softmax),
            UnaryOp::HardSwish => return self.emulate_hard_swish(input),
            UnaryOp::Neg => {
                lowering_ensure!(
                    matches!(
                        input.desc.data_type,
                        NativeDataType::Float32 | NativeDataType::Int32
                    ),
                    "neg supports float32 and int32, got {:?}",
                    input.desc.data_type
                );
                let minus_one = self.broadcast_scalar(&input.desc, -1.0)?;
                return self.element_wise(ElementWiseFunction::Multiply, input, Some(&minus_one));
            }
        };
        self.add_single(primitive, &[Some(input)], output)
    }

    /// `x * max(0, min(6, x + 3)) / 6` as a chain of element-wise nodes.
    fn emulate_hard_swish(&mut self, input: &NativeNode) -> WebnnResult<NativeNode> {
        lowering_ensure!(
            matches!(
                input.desc.data_type,
                NativeDataType::Float32 | NativeDataType::Float16
            ),
            "hardSwish requires a floating point tensor, got {:?}",
            input.desc.data_type
        );
        warn!("hardSwish is emulated with 5 element-wise operators");
        let three = self.broadcast_scalar(&input.desc, 3.0)?;
        let six = self.broadcast_scalar(&input.desc, 6.0)?;
        let zero = self.broadcast_scalar(&input.desc, 0.0)?;
        let shifted = self.element_wise(ElementWiseFunction::Add, input, Some(&three))?;
        let upper = self.element_wise(ElementWiseFunction::Min, &shifted, Some(&six))?;
        let gate = self.element_wise(ElementWiseFunction::Max, &upper, Some(&zero))?;
        let scaled = self.element_wise(ElementWiseFunction::Multiply, &gate, Some(input))?;
        self.element_wise(ElementWiseFunction::Divide, &scaled, Some(&six))
    }

    /// Appends `activation` after `input` as standalone native nodes.
    fn apply_activation(
        &mut self,
        input: &NativeNode,
        activation: FusedActivation,
    ) -> WebnnResult<NativeNode> {
        let output = NativeTensorDesc::new(input.desc.data_type, &input.desc.dims)?;
        match activation {
            FusedActivation::Clamp {
                min_value,
                max_value,
            } => self.add_single(
                Primitive::Clip {
                    min: min_value,
                    max: max_value,
                },
                &[Some(input)],
                output,
            ),
            FusedActivation::HardSwish => self.emulate_hard_swish(input),
            other => {
                let native = native_activation(other).ok_or_else(|| {
                    WebnnError::internal(format!("{other} has no native activation"))
                })?;
                self.add_single(Primitive::Activation(native), &[Some(input)], output)
            }
        }
    }

    /// Splits an activation into the part the primitive fuses and the part appended after it.
    fn split_activation(
        &self,
        activation: Option<FusedActivation>,
    ) -> (Option<NativeActivation>, Option<FusedActivation>) {
        let Some(activation) = activation else {
            return (None, None);
        };
        match native_activation(activation) {
            Some(native) if self.native.backend().supports_fused_activation(&native) => {
                debug!("fusing {activation} into the primitive");
                (Some(native), None)
            }
            _ => (None, Some(activation)),
        }
    }

    fn finish_activation(
        &mut self,
        node: NativeNode,
        appended: Option<FusedActivation>,
    ) -> WebnnResult<NativeNode> {
        match appended {
            Some(activation) => self.apply_activation(&node, activation),
            None => Ok(node),
        }
    }

    fn lower_matmul(&mut self, record: &OperatorRecord) -> WebnnResult<()> {
        let a = self.node(input_operand(&record.inputs, 0)?)?;
        let b = self.node(input_operand(&record.inputs, 1)?)?;
        let output = output_operand(record, 0)?;
        let output_dims = self.spec(output)?.dims().to_vec();
        lowering_ensure!(
            output_dims.len() <= 4,
            "matmul supports up to 4 dimensions, got {}",
            output_dims.len()
        );
        let mut a_desc = a.desc.clone();
        if a_desc.rank() == 1 {
            a_desc = a_desc.with_unit_axis(0)?;
        }
        let mut b_desc = b.desc.clone();
        if b_desc.rank() == 1 {
            b_desc = b_desc.with_unit_axis(1)?;
        }
        lowering_ensure!(
            a_desc.rank() <= 4 && b_desc.rank() <= 4,
            "matmul supports up to 4 dimensions"
        );
        let a_desc = a_desc.expanded_to_rank(4)?;
        let b_desc = b_desc.expanded_to_rank(4)?;
        let batch = [
            a_desc.dims[0].max(b_desc.dims[0]),
            a_desc.dims[1].max(b_desc.dims[1]),
        ];
        let a_desc = broadcast_desc(
            &a_desc,
            &[batch[0], batch[1], a_desc.dims[2], a_desc.dims[3]],
            2,
        )?;
        let b_desc = broadcast_desc(
            &b_desc,
            &[batch[0], batch[1], b_desc.dims[2], b_desc.dims[3]],
            2,
        )?;
        let product = NativeTensorDesc::new(
            a_desc.data_type,
            &[batch[0], batch[1], a_desc.dims[2], b_desc.dims[3]],
        )?;
        let node = self.add_single(
            Primitive::Gemm {
                transpose_a: false,
                transpose_b: false,
                alpha: 1.0,
                beta: 0.0,
                fused_activation: None,
            },
            &[Some(&a.with_desc(a_desc)), Some(&b.with_desc(b_desc)), None],
            product,
        )?;
        let desc = node.desc.reshaped(&output_dims)?;
        self.bind(output, node.with_desc(desc));
        Ok(())
    }

    fn lower_conv2d(&mut self, record: &OperatorRecord, options: &Conv2dOptions) -> WebnnResult<()> {
        let input_id = input_operand(&record.inputs, 0)?;
        let filter_id = input_operand(&record.inputs, 1)?;
        let input_hw = spatial(&shape::nchw_dims(self.spec(input_id)?.dims(), options.input_layout)?);
        let filter_hw = spatial(&shape::oihw_dims(
            self.spec(filter_id)?.dims(),
            options.filter_layout,
        )?);
        let padding = shape::resolve_conv2d_padding(options, input_hw, filter_hw)?;
        let output = output_operand(record, 0)?;
        let output_nchw = shape::nchw_dims(self.spec(output)?.dims(), options.input_layout)?;

        let input = self.node(input_id)?;
        let input = input.with_desc(input_as_nchw(&input.desc, options.input_layout)?);
        let filter = self.node(filter_id)?;
        let filter = filter.with_desc(filter_as_oihw(&filter.desc, options.filter_layout)?);
        let bias = match self.optional_node(options.bias)? {
            Some(bias) => Some(bias.with_desc(bias.desc.as_channel_vector()?)),
            None => None,
        };
        let (fused, appended) = self.split_activation(options.activation);
        let node = self.add_single(
            Primitive::Convolution {
                direction: ConvolutionDirection::Forward,
                strides: pair("conv2d strides", &options.strides)?,
                dilations: pair("conv2d dilations", &options.dilations)?,
                start_padding: [padding[0], padding[2]],
                end_padding: [padding[1], padding[3]],
                output_padding: [0, 0],
                groups: options.groups,
                fused_activation: fused,
            },
            &[Some(&input), Some(&filter), bias.as_ref()],
            NativeTensorDesc::new(input.desc.data_type, &output_nchw)?,
        )?;
        let node = self.finish_activation(node, appended)?;
        let desc = output_from_nchw(&node.desc, options.input_layout)?;
        self.bind(output, node.with_desc(desc));
        Ok(())
    }

    fn lower_conv_transpose2d(
        &mut self,
        record: &OperatorRecord,
        options: &ConvTranspose2dOptions,
    ) -> WebnnResult<()> {
        let input_id = input_operand(&record.inputs, 0)?;
        let filter_id = input_operand(&record.inputs, 1)?;
        let input_hw = spatial(&shape::nchw_dims(self.spec(input_id)?.dims(), options.input_layout)?);
        let filter_hw = spatial(&shape::iohw_dims(
            self.spec(filter_id)?.dims(),
            options.filter_layout,
        )?);
        let padding = shape::resolve_conv_transpose2d_padding(options, input_hw, filter_hw)?;
        let output = output_operand(record, 0)?;
        let output_nchw = shape::nchw_dims(self.spec(output)?.dims(), options.input_layout)?;

        let input = self.node(input_id)?;
        let input = input.with_desc(input_as_nchw(&input.desc, options.input_layout)?);
        let filter = self.node(filter_id)?;
        let filter = filter.with_desc(filter_as_iohw(&filter.desc, options.filter_layout)?);
        let bias = match self.optional_node(options.bias)? {
            Some(bias) => Some(bias.with_desc(bias.desc.as_channel_vector()?)),
            None => None,
        };
        let (fused, appended) = self.split_activation(options.activation);
        let node = self.add_single(
            Primitive::Convolution {
                direction: ConvolutionDirection::Backward,
                strides: pair("convTranspose2d strides", &options.strides)?,
                dilations: pair("convTranspose2d dilations", &options.dilations)?,
                start_padding: [padding[0], padding[2]],
                end_padding: [padding[1], padding[3]],
                output_padding: pair("convTranspose2d outputPadding", &options.output_padding)?,
                groups: options.groups,
                fused_activation: fused,
            },
            &[Some(&input), Some(&filter), bias.as_ref()],
            NativeTensorDesc::new(input.desc.data_type, &output_nchw)?,
        )?;
        let node = self.finish_activation(node, appended)?;
        let desc = output_from_nchw(&node.desc, options.input_layout)?;
        self.bind(output, node.with_desc(desc));
        Ok(())
    }

    fn lower_pool2d(
        &mut self,
        record: &OperatorRecord,
        kind: PoolKind,
        options: &Pool2dOptions,
    ) -> WebnnResult<()> {
        let input_id = input_operand(&record.inputs, 0)?;
        let input_spec = self.spec(input_id)?;
        let window = shape::resolve_pool_window(input_spec, options)?;
        let input_nchw = shape::nchw_dims(input_spec.dims(), options.layout)?;
        let padding = shape::resolve_pool2d_padding(options, spatial(&input_nchw), window)?;
        let strides = pair("pool2d strides", &options.strides)?;
        let dilations = pair("pool2d dilations", &options.dilations)?;
        let function = match kind {
            PoolKind::Average => PoolingFunction::Average,
            PoolKind::L2 => PoolingFunction::L2,
            PoolKind::Max => PoolingFunction::Max,
        };
        lowering_ensure!(
            kind == PoolKind::Max || dilations == [1, 1],
            "{function:?} pooling does not support dilations {dilations:?}"
        );
        let output = output_operand(record, 0)?;
        let output_nchw = shape::nchw_dims(self.spec(output)?.dims(), options.layout)?;

        // Ceil rounding and explicit output sizes can need more end padding than requested.
        let mut end_padding = [padding[1], padding[3]];
        for axis in 0..2 {
            let span = (output_nchw[axis + 2] as i64 - 1) * strides[axis] as i64
                + (window[axis] as i64 - 1) * dilations[axis] as i64
                + 1;
            let needed = span - input_nchw[axis + 2] as i64 - padding[axis * 2] as i64;
            end_padding[axis] = end_padding[axis].max(needed.max(0) as u32);
        }

        let input = self.node(input_id)?;
        let input = input.with_desc(input_as_nchw(&input.desc, options.layout)?);
        let node = self.add_single(
            Primitive::Pooling {
                function,
                window,
                strides,
                dilations,
                start_padding: [padding[0], padding[2]],
                end_padding,
            },
            &[Some(&input)],
            NativeTensorDesc::new(input.desc.data_type, &output_nchw)?,
        )?;
        let desc = output_from_nchw(&node.desc, options.layout)?;
        self.bind(output, node.with_desc(desc));
        Ok(())
    }

    fn lower_gemm(&mut self, record: &OperatorRecord, options: &GemmOptions) -> WebnnResult<()> {
        let a = self.node(input_operand(&record.inputs, 0)?)?;
        let b = self.node(input_operand(&record.inputs, 1)?)?;
        let output = output_operand(record, 0)?;
        let output_dims = self.spec(output)?.dims().to_vec();
        let [m, n] = pair("gemm output", &output_dims)?;
        let a = a.with_desc(a.desc.expanded_to_rank(4)?);
        let b = b.with_desc(b.desc.expanded_to_rank(4)?);
        let c = match self.optional_node(options.c)? {
            Some(c) => Some(c.with_desc(broadcast_desc(&c.desc, &[1, 1, m, n], 0)?)),
            None => None,
        };
        let node = self.add_single(
            Primitive::Gemm {
                transpose_a: options.a_transpose,
                transpose_b: options.b_transpose,
                alpha: options.alpha,
                beta: options.beta,
                fused_activation: None,
            },
            &[Some(&a), Some(&b), c.as_ref()],
            NativeTensorDesc::new(a.desc.data_type, &[1, 1, m, n])?,
        )?;
        let desc = node.desc.reshaped(&output_dims)?;
        self.bind(output, node.with_desc(desc));
        Ok(())
    }

    fn lower_concat(&mut self, record: &OperatorRecord, axis: u32) -> WebnnResult<()> {
        let output = output_operand(record, 0)?;
        let output_dims = self.spec(output)?.dims().to_vec();
        let rank = output_dims.len();
        let lift = 4usize.saturating_sub(rank);
        let mut inputs = Vec::with_capacity(record.inputs.len());
        for &operand in &record.inputs {
            let node = self.node(operand)?;
            let desc = node.desc.expanded_to_rank(rank + lift)?;
            inputs.push(node.with_desc(desc));
        }
        let mut joined_dims = vec![1u32; lift];
        joined_dims.extend_from_slice(&output_dims);
        let data_type = inputs
            .first()
            .map(|node| node.desc.data_type)
            .ok_or_else(|| WebnnError::internal("concat without inputs"))?;
        let slots = inputs.iter().map(Some).collect::<Vec<_>>();
        let node = self.add_single(
            Primitive::Join {
                axis: axis + lift as u32,
            },
            &slots,
            NativeTensorDesc::new(data_type, &joined_dims)?,
        )?;
        let desc = node.desc.reshaped(&output_dims)?;
        self.bind(output, node.with_desc(desc));
        Ok(())
    }

    fn lower_reduce(&mut self, record: &OperatorRecord, op: ReduceOp, axes: &[u32]) -> WebnnResult<()> {
        let input = self.node(input_operand(&record.inputs, 0)?)?;
        let output = output_operand(record, 0)?;
        let output_dims = self.spec(output)?.dims().to_vec();
        let kept_dims = input
            .desc
            .dims
            .iter()
            .enumerate()
            .map(|(axis, &dim)| if axes.contains(&(axis as u32)) { 1 } else { dim })
            .collect::<Vec<_>>();
        let data_type = if op.is_arg_reduction() {
            NativeDataType::Int32
        } else {
            input.desc.data_type
        };
        let node = self.add_single(
            Primitive::Reduce {
                function: reduce_function(op),
                axes: axes.to_vec(),
            },
            &[Some(&input)],
            NativeTensorDesc::new(data_type, &kept_dims)?,
        )?;
        let desc = node.desc.reshaped(&output_dims)?;
        self.bind(output, node.with_desc(desc));
        Ok(())
    }

    fn lower_pad(
        &mut self,
        operator_id: OperatorId,
        record: &OperatorRecord,
        options: &PadOptions,
    ) -> WebnnResult<()> {
        let input_id = input_operand(&record.inputs, 0)?;
        let padding_id = input_operand(&record.inputs, 1)?;
        let arena = self.arena;
        let OperatorKind::Constant { bytes } = &arena.producer(padding_id)?.kind else {
            return Err(WebnnError::lowering("pad padding must be a constant operand"));
        };
        let input = self.node(input_id)?;
        let pairs = shape::decode_padding(self.spec(padding_id)?, bytes, input.desc.rank())?;
        let output = self.output_desc(record, 0)?;
        let node = self.add_single(
            Primitive::Padding {
                mode: options.mode,
                value: options.value,
                start_padding: pairs.iter().map(|[begin, _]| *begin).collect(),
                end_padding: pairs.iter().map(|[_, end]| *end).collect(),
            },
            &[Some(&input)],
            output,
        )?;
        self.bind(output_operand(record, 0)?, node);

        // Every constant input needs an edge: give the padding constant an unrequested output.
        let padding = self.node(padding_id)?;
        let sink = self.identity(&padding)?;
        self.native
            .set_graph_output(&sink, format!("__pad_{}_padding", operator_id.0), false)?;
        Ok(())
    }

    /// `[C]` channel operand as `[1, C, 1, 1]`, synthesized with `fill` when absent.
    fn channel_operand(
        &mut self,
        operand: Option<OperandId>,
        data_type: NativeDataType,
        channels: u32,
        fill: f64,
    ) -> WebnnResult<NativeNode> {
        let node = match self.optional_node(operand)? {
            Some(node) => node,
            None => self.filled_constant(data_type, &[channels], fill)?,
        };
        Ok(node.with_desc(node.desc.as_channel_vector()?))
    }

    fn lower_batch_norm(
        &mut self,
        record: &OperatorRecord,
        options: &BatchNormOptions,
    ) -> WebnnResult<()> {
        let input = self.node(input_operand(&record.inputs, 0)?)?;
        let channel_last = options.axis == 3;
        let input = if channel_last {
            input.with_desc(nhwc_as_nchw(&input.desc)?)
        } else {
            input
        };
        let data_type = input.desc.data_type;
        let channels = input.desc.dims[1];
        let mean_id = input_operand(&record.inputs, 1)?;
        let variance_id = input_operand(&record.inputs, 2)?;
        let mean = self.channel_operand(Some(mean_id), data_type, channels, 0.0)?;
        let variance = self.channel_operand(Some(variance_id), data_type, channels, 1.0)?;
        let scale = self.channel_operand(options.scale, data_type, channels, 1.0)?;
        let bias = self.channel_operand(options.bias, data_type, channels, 0.0)?;
        let (fused, appended) = self.split_activation(options.activation);
        let node = self.add_single(
            Primitive::BatchNormalization {
                epsilon: options.epsilon,
                fused_activation: fused,
            },
            &[
                Some(&input),
                Some(&mean),
                Some(&variance),
                Some(&scale),
                Some(&bias),
            ],
            NativeTensorDesc::new(data_type, &input.desc.dims)?,
        )?;
        let node = self.finish_activation(node, appended)?;
        let node = if channel_last {
            let desc = nchw_as_nhwc(&node.desc)?;
            node.with_desc(desc)
        } else {
            node
        };
        self.bind(output_operand(record, 0)?, node);
        Ok(())
    }

    fn lower_instance_norm(
        &mut self,
        record: &OperatorRecord,
        options: &InstanceNormOptions,
    ) -> WebnnResult<()> {
        let input = self.node(input_operand(&record.inputs, 0)?)?;
        let input = input.with_desc(input_as_nchw(&input.desc, options.layout)?);
        let data_type = input.desc.data_type;
        let channels = input.desc.dims[1];
        let scale = self.channel_operand(options.scale, data_type, channels, 1.0)?;
        let bias = self.channel_operand(options.bias, data_type, channels, 0.0)?;
        let node = self.add_single(
            Primitive::MeanVarianceNormalization {
                axes: vec![2, 3],
                epsilon: options.epsilon,
                normalize_variance: true,
            },
            &[Some(&input), Some(&scale), Some(&bias)],
            NativeTensorDesc::new(data_type, &input.desc.dims)?,
        )?;
        let desc = output_from_nchw(&node.desc, options.layout)?;
        self.bind(output_operand(record, 0)?, node.with_desc(desc));
        Ok(())
    }

    fn lower_gru(
        &mut self,
        record: &OperatorRecord,
        steps: u32,
        hidden_size: u32,
        options: &GruOptions,
    ) -> WebnnResult<()> {
        let input = self.node(input_operand(&record.inputs, 0)?)?;
        let weight = self.node(input_operand(&record.inputs, 1)?)?;
        let recurrent_weight = self.node(input_operand(&record.inputs, 2)?)?;
        let data_type = input.desc.data_type;
        let dirs = options.direction.num_directions();
        let batch = input.desc.dims[1];
        let gates = hidden_size * 3;

        let input = input.with_desc(input.desc.with_unit_axis(0)?);
        let weight = weight.with_desc(weight.desc.with_unit_axis(0)?);
        let recurrent_weight = recurrent_weight.with_desc(recurrent_weight.desc.with_unit_axis(0)?);

        let bias = match self.optional_node(options.bias)? {
            Some(bias) => bias,
            None => self.filled_constant(data_type, &[dirs, gates], 0.0)?,
        };
        let recurrent_bias = match self.optional_node(options.recurrent_bias)? {
            Some(bias) => bias,
            None => self.filled_constant(data_type, &[dirs, gates], 0.0)?,
        };
        let joined = self.add_single(
            Primitive::Join { axis: 1 },
            &[Some(&bias), Some(&recurrent_bias)],
            NativeTensorDesc::new(data_type, &[dirs, gates * 2])?,
        )?;
        let joined = joined.with_desc(joined.desc.expanded_to_rank(4)?);
        let hidden = match self.optional_node(options.initial_hidden_state)? {
            Some(hidden) => Some(hidden.with_desc(hidden.desc.with_unit_axis(0)?)),
            None => None,
        };

        let [gate, candidate] = options.resolved_activations();
        let activations = [gru_activation(gate)?, gru_activation(candidate)?];
        let sequence = if options.return_sequence {
            Some(NativeTensorDesc::new(
                data_type,
                &[steps, dirs, batch, hidden_size],
            )?)
        } else {
            None
        };
        let single = NativeTensorDesc::new(data_type, &[1, dirs, batch, hidden_size])?;
        let operator = self.native.add_operator(
            Primitive::Gru {
                direction: options.direction,
                linear_before_reset: options.reset_after,
                activations,
            },
            &[
                Some(&input),
                Some(&weight),
                Some(&recurrent_weight),
                Some(&joined),
                hidden.as_ref(),
            ],
            vec![sequence, Some(single)],
        )?;
        let last = self.native.output_node(operator, 1)?;
        let desc = last.desc.reshaped(&[dirs, batch, hidden_size])?;
        self.bind(output_operand(record, 0)?, last.with_desc(desc));
        if options.return_sequence {
            let sequence = self.native.output_node(operator, 0)?;
            self.bind(output_operand(record, 1)?, sequence);
        }
        Ok(())
    }
}

fn input_operand(inputs: &[OperandId], index: usize) -> WebnnResult<OperandId> {
    inputs
        .get(index)
        .copied()
        .ok_or_else(|| WebnnError::internal(format!("operator has no input {index}")))
}

fn output_operand(record: &OperatorRecord, index: usize) -> WebnnResult<OperandId> {
    record
        .outputs
        .get(index)
        .copied()
        .ok_or_else(|| WebnnError::internal(format!("operator has no output {index}")))
}

fn pair(what: &str, values: &[u32]) -> WebnnResult<[u32; 2]> {
    match values {
        [a, b] => Ok([*a, *b]),
        _ => Err(WebnnError::lowering(format!(
            "{what} must have 2 values, got {values:?}"
        ))),
    }
}

fn spatial(nchw: &[u32; 4]) -> [u32; 2] {
    [nchw[2], nchw[3]]
}

fn binary_function(op: BinaryOp) -> ElementWiseFunction {
    match op {
        BinaryOp::Add => ElementWiseFunction::Add,
        BinaryOp::Sub => ElementWiseFunction::Subtract,
        BinaryOp::Mul => ElementWiseFunction::Multiply,
        BinaryOp::Div => ElementWiseFunction::Divide,
        BinaryOp::Max => ElementWiseFunction::Max,
        BinaryOp::Min => ElementWiseFunction::Min,
        BinaryOp::Pow => ElementWiseFunction::Pow,
        // Lowered separately as GEMM.
        BinaryOp::MatMul => ElementWiseFunction::Identity,
    }
}

fn reduce_function(op: ReduceOp) -> ReduceFunction {
    match op {
        ReduceOp::ArgMax => ReduceFunction::ArgMax,
        ReduceOp::ArgMin => ReduceFunction::ArgMin,
        ReduceOp::L1 => ReduceFunction::L1,
        ReduceOp::L2 => ReduceFunction::L2,
        ReduceOp::Max => ReduceFunction::Max,
        ReduceOp::Mean => ReduceFunction::Mean,
        ReduceOp::Min => ReduceFunction::Min,
        ReduceOp::Product => ReduceFunction::Product,
        ReduceOp::Sum => ReduceFunction::Sum,
    }
}

fn native_activation(activation: FusedActivation) -> Option<NativeActivation> {
    match activation {
        FusedActivation::Relu => Some(NativeActivation::Relu),
        FusedActivation::Sigmoid => Some(NativeActivation::Sigmoid),
        FusedActivation::Tanh => Some(NativeActivation::Tanh),
        FusedActivation::LeakyRelu { alpha } => Some(NativeActivation::LeakyRelu { alpha }),
        FusedActivation::Clamp { .. } | FusedActivation::HardSwish => None,
    }
}

fn gru_activation(activation: FusedActivation) -> WebnnResult<NativeActivation> {
    native_activation(activation)
        .ok_or_else(|| WebnnError::lowering(format!("gru activation {activation} is not supported")))
}

/// Little-endian bytes of `count` elements equal to `value`.
fn encode_fill(data_type: NativeDataType, count: usize, value: f64) -> Vec<u8> {
    let element = match data_type {
        NativeDataType::Float32 => (value as f32).to_le_bytes().to_vec(),
        NativeDataType::Float16 => half::f16::from_f64(value).to_le_bytes().to_vec(),
        NativeDataType::Int32 => (value as i32).to_le_bytes().to_vec(),
        NativeDataType::Uint32 => (value as u32).to_le_bytes().to_vec(),
    };
    element.repeat(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_encodes_every_element() {
        let bytes = encode_fill(NativeDataType::Float32, 3, -1.0);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[8..], &(-1.0f32).to_le_bytes());
        let half_bytes = encode_fill(NativeDataType::Float16, 2, 6.0);
        assert_eq!(&half_bytes[2..], &half::f16::from_f32(6.0).to_le_bytes());
    }

    #[test]
    fn clamp_and_hard_swish_are_never_fused() {
        assert_eq!(native_activation(FusedActivation::HardSwish), None);
        assert_eq!(
            native_activation(FusedActivation::Clamp {
                min_value: 0.0,
                max_value: 6.0
            }),
            None
        );
        assert_eq!(
            native_activation(FusedActivation::LeakyRelu { alpha: 0.2 }),
            Some(NativeActivation::LeakyRelu { alpha: 0.2 })
        );
    }
}
