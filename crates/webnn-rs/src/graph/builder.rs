use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, warn};
use smallvec::SmallVec;

use crate::backend::NativeBackend;
use crate::descriptor::{OperandDescriptor, OperandType, TensorSpec};
use crate::error::{validation_bail, validation_ensure, WebnnError, WebnnResult};
use crate::scope::ErrorReporter;

use super::ir::{GraphArena, OperandId, OperandState};
use super::model::Graph;
use super::ops::{
    BatchNormOptions, BinaryOp, ClampOptions, Conv2dOptions, ConvTranspose2dOptions, GemmOptions,
    GruOptions, InstanceNormOptions, LeakyReluOptions, OperatorKind, PadOptions, Pool2dOptions,
    PoolKind, ReduceOp, ReduceOptions, Resample2dOptions, SliceOptions, SplitSpec, UnaryOp,
};
use super::scheduler::schedule;
use super::shape;

/// Incrementally records operators and infers their output types and shapes.
///
/// Builder methods never fail. A call whose validation fails returns an error-tagged operand;
/// every operand derived from it carries the same error, which `build` reports when the operand
/// is a requested output.
pub struct GraphBuilder {
    arena: GraphArena,
    errors: Vec<WebnnError>,
    backend: Arc<dyn NativeBackend>,
    min_buffer_bytes: u64,
    reporter: Option<ErrorReporter>,
}

type InferResult = WebnnResult<(OperatorKind, Vec<TensorSpec>)>;

impl GraphBuilder {
    pub fn new(backend: Arc<dyn NativeBackend>, min_buffer_bytes: u64) -> Self {
        Self {
            arena: GraphArena::new(),
            errors: Vec::new(),
            backend,
            min_buffer_bytes,
            reporter: None,
        }
    }

    /// Reports `build` failures, and the built graph's failures, to `reporter`.
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn arena(&self) -> &GraphArena {
        &self.arena
    }

    /// Validation failures recorded so far, in call order.
    pub fn errors(&self) -> &[WebnnError] {
        &self.errors
    }

    /// Inferred spec of `operand`, or the error that poisoned it.
    pub fn spec(&self, operand: OperandId) -> WebnnResult<&TensorSpec> {
        self.arena.spec(operand)
    }

    /// Registers an operator. `infer` sees the specs of `inputs` in order; when any input is
    /// error-tagged it is not called and the upstream error is propagated to the outputs.
    fn add_operator<F>(
        &mut self,
        op: &'static str,
        inputs: &[OperandId],
        outputs_on_error: usize,
        infer: F,
    ) -> SmallVec<[OperandId; 2]>
    where
        F: FnOnce(&[TensorSpec]) -> InferResult,
    {
        let mut specs = Vec::with_capacity(inputs.len());
        let mut upstream = None;
        for &input in inputs {
            match self.arena.operand(input).and_then(|record| record.spec()) {
                Ok(spec) => specs.push(spec.clone()),
                Err(err) => {
                    upstream = Some((err, self.arena.operand(input).is_ok()));
                    break;
                }
            }
        }
        let failure = match upstream {
            // Already recorded where it happened.
            Some((err, true)) => err,
            Some((err, false)) => self.record_error(op, err),
            None => match infer(&specs) {
                Ok((kind, specs)) => {
                    let states = specs.into_iter().map(OperandState::Valid).collect();
                    let (operator, outputs) = self.arena.push_operator(kind, inputs, states);
                    debug!("registered {op} as {operator} with outputs {outputs:?}");
                    return outputs;
                }
                Err(err) => self.record_error(op, err),
            },
        };
        let states = (0..outputs_on_error.max(1))
            .map(|_| OperandState::Error(failure.clone()))
            .collect();
        let known_inputs = inputs
            .iter()
            .copied()
            .filter(|&input| self.arena.operand(input).is_ok())
            .collect::<Vec<_>>();
        let (_, outputs) =
            self.arena
                .push_operator(OperatorKind::Invalid { op }, &known_inputs, states);
        outputs
    }

    fn record_error(&mut self, op: &'static str, err: WebnnError) -> WebnnError {
        let err = err.with_context(op);
        warn!("{err}");
        self.errors.push(err.clone());
        err
    }

    fn single(
        &mut self,
        op: &'static str,
        inputs: &[OperandId],
        infer: impl FnOnce(&[TensorSpec]) -> WebnnResult<(OperatorKind, TensorSpec)>,
    ) -> OperandId {
        let outputs = self.add_operator(op, inputs, 1, |specs| {
            let (kind, spec) = infer(specs)?;
            Ok((kind, vec![spec]))
        });
        outputs[0]
    }

    /// Declares a named caller-provided input.
    pub fn input(&mut self, name: &str, descriptor: &OperandDescriptor) -> OperandId {
        let duplicate = self.arena.inputs().any(|(existing, _)| existing == name);
        let name = name.to_string();
        self.single("input", &[], move |_| {
            validation_ensure!(!name.is_empty(), "input name must not be empty");
            validation_ensure!(!duplicate, "input name {name} is already used");
            let spec = descriptor.to_spec()?;
            Ok((OperatorKind::Input { name }, spec))
        })
    }

    /// Declares a constant; `bytes` must hold exactly the descriptor's byte length.
    pub fn constant(&mut self, descriptor: &OperandDescriptor, bytes: &[u8]) -> OperandId {
        self.single("constant", &[], |_| {
            let spec = descriptor.to_spec()?;
            let expected = spec.byte_len().unwrap_or(usize::MAX);
            validation_ensure!(
                bytes.len() == expected,
                "constant {spec} needs {expected} bytes, got {}",
                bytes.len()
            );
            Ok((
                OperatorKind::Constant {
                    bytes: Arc::from(bytes),
                },
                spec,
            ))
        })
    }

    pub fn constant_f32(&mut self, dims: &[i32], values: &[f32]) -> OperandId {
        let bytes = values
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<_>>();
        self.constant(&OperandDescriptor::new(OperandType::Float32, dims), &bytes)
    }

    pub fn constant_i32(&mut self, dims: &[i32], values: &[i32]) -> OperandId {
        let bytes = values
            .iter()
            .flat_map(|value| value.to_le_bytes())
            .collect::<Vec<_>>();
        self.constant(&OperandDescriptor::new(OperandType::Int32, dims), &bytes)
    }

    fn binary(&mut self, op: BinaryOp, a: OperandId, b: OperandId) -> OperandId {
        let name = if op == BinaryOp::MatMul { "matmul" } else { "binary" };
        self.single(name, &[a, b], |specs| {
            let spec = shape::infer_binary(op, &specs[0], &specs[1])?;
            Ok((OperatorKind::Binary(op), spec))
        })
    }

    pub fn add(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn sub(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::Sub, a, b)
    }

    pub fn mul(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::Mul, a, b)
    }

    pub fn div(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::Div, a, b)
    }

    pub fn max(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::Max, a, b)
    }

    pub fn min(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::Min, a, b)
    }

    pub fn pow(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::Pow, a, b)
    }

    /// Matrix product with NumPy semantics for 1-D operands and broadcast batch dimensions.
    pub fn matmul(&mut self, a: OperandId, b: OperandId) -> OperandId {
        self.binary(BinaryOp::MatMul, a, b)
    }

    fn unary(&mut self, op: UnaryOp, input: OperandId) -> OperandId {
        self.single("unary", &[input], |specs| {
            let spec = shape::infer_unary(op, &specs[0])?;
            Ok((OperatorKind::Unary(op), spec))
        })
    }

    pub fn abs(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Abs, input)
    }

    pub fn ceil(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Ceil, input)
    }

    pub fn cos(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Cos, input)
    }

    pub fn exp(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Exp, input)
    }

    pub fn floor(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Floor, input)
    }

    pub fn hard_swish(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::HardSwish, input)
    }

    pub fn log(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Log, input)
    }

    pub fn neg(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Neg, input)
    }

    pub fn relu(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Relu, input)
    }

    pub fn sigmoid(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Sigmoid, input)
    }

    pub fn sin(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Sin, input)
    }

    /// Softmax over the last axis of a 2-D operand.
    pub fn softmax(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Softmax, input)
    }

    pub fn tan(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Tan, input)
    }

    pub fn tanh(&mut self, input: OperandId) -> OperandId {
        self.unary(UnaryOp::Tanh, input)
    }

    pub fn leaky_relu(&mut self, input: OperandId, options: LeakyReluOptions) -> OperandId {
        self.single("leakyRelu", &[input], |specs| {
            Ok((OperatorKind::LeakyRelu(options), specs[0].clone()))
        })
    }

    pub fn clamp(&mut self, input: OperandId, options: ClampOptions) -> OperandId {
        self.single("clamp", &[input], |specs| {
            validation_ensure!(
                options.min_value <= options.max_value,
                "clamp minValue {} exceeds maxValue {}",
                options.min_value,
                options.max_value
            );
            Ok((OperatorKind::Clamp(options), specs[0].clone()))
        })
    }

    pub fn conv2d(&mut self, input: OperandId, filter: OperandId, options: Conv2dOptions) -> OperandId {
        let mut inputs = vec![input, filter];
        let bias = push_optional(&mut inputs, options.bias);
        self.single("conv2d", &inputs, |specs| {
            let bias = bias.map(|index| &specs[index]);
            let spec = shape::infer_conv2d(&specs[0], &specs[1], bias, &options)?;
            Ok((OperatorKind::Conv2d(options), spec))
        })
    }

    pub fn conv_transpose2d(
        &mut self,
        input: OperandId,
        filter: OperandId,
        options: ConvTranspose2dOptions,
    ) -> OperandId {
        let mut inputs = vec![input, filter];
        let bias = push_optional(&mut inputs, options.bias);
        self.single("convTranspose2d", &inputs, |specs| {
            let bias = bias.map(|index| &specs[index]);
            let spec = shape::infer_conv_transpose2d(&specs[0], &specs[1], bias, &options)?;
            Ok((OperatorKind::ConvTranspose2d(options), spec))
        })
    }

    fn pool2d(&mut self, kind: PoolKind, input: OperandId, options: Pool2dOptions) -> OperandId {
        self.single("pool2d", &[input], |specs| {
            let spec = shape::infer_pool2d(&specs[0], &options)?;
            Ok((OperatorKind::Pool2d { kind, options }, spec))
        })
    }

    pub fn average_pool2d(&mut self, input: OperandId, options: Pool2dOptions) -> OperandId {
        self.pool2d(PoolKind::Average, input, options)
    }

    pub fn l2_pool2d(&mut self, input: OperandId, options: Pool2dOptions) -> OperandId {
        self.pool2d(PoolKind::L2, input, options)
    }

    pub fn max_pool2d(&mut self, input: OperandId, options: Pool2dOptions) -> OperandId {
        self.pool2d(PoolKind::Max, input, options)
    }

    pub fn gemm(&mut self, a: OperandId, b: OperandId, options: GemmOptions) -> OperandId {
        let mut inputs = vec![a, b];
        let c = push_optional(&mut inputs, options.c);
        self.single("gemm", &inputs, |specs| {
            let c = c.map(|index| &specs[index]);
            let spec = shape::infer_gemm(&specs[0], &specs[1], c, &options)?;
            Ok((OperatorKind::Gemm(options), spec))
        })
    }

    pub fn concat(&mut self, inputs: &[OperandId], axis: u32) -> OperandId {
        self.single("concat", inputs, |specs| {
            let refs = specs.iter().collect::<Vec<_>>();
            let spec = shape::infer_concat(&refs, axis)?;
            Ok((OperatorKind::Concat { axis }, spec))
        })
    }

    /// Reshapes to `new_shape`; one component may be -1 and is inferred.
    pub fn reshape(&mut self, input: OperandId, new_shape: &[i32]) -> OperandId {
        self.single("reshape", &[input], |specs| {
            let spec = shape::infer_reshape(&specs[0], new_shape)?;
            Ok((
                OperatorKind::Reshape {
                    new_shape: new_shape.to_vec(),
                },
                spec,
            ))
        })
    }

    /// Permutes axes; reverses them when `permutation` is `None`.
    pub fn transpose(&mut self, input: OperandId, permutation: Option<&[u32]>) -> OperandId {
        self.single("transpose", &[input], |specs| {
            let (spec, permutation) = shape::infer_transpose(&specs[0], permutation)?;
            Ok((OperatorKind::Transpose { permutation }, spec))
        })
    }

    fn reduce(&mut self, op: ReduceOp, input: OperandId, options: ReduceOptions) -> OperandId {
        self.single("reduce", &[input], |specs| {
            let axes = shape::resolve_reduce_axes(specs[0].rank(), options.axes.as_deref())?;
            let spec = shape::infer_reduce(&specs[0], op, &axes, options.keep_dimensions)?;
            Ok((
                OperatorKind::Reduce {
                    op,
                    axes,
                    keep_dimensions: options.keep_dimensions,
                },
                spec,
            ))
        })
    }

    pub fn reduce_arg_max(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::ArgMax, input, options)
    }

    pub fn reduce_arg_min(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::ArgMin, input, options)
    }

    pub fn reduce_l1(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::L1, input, options)
    }

    pub fn reduce_l2(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::L2, input, options)
    }

    pub fn reduce_max(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::Max, input, options)
    }

    pub fn reduce_mean(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::Mean, input, options)
    }

    pub fn reduce_min(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::Min, input, options)
    }

    pub fn reduce_product(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::Product, input, options)
    }

    pub fn reduce_sum(&mut self, input: OperandId, options: ReduceOptions) -> OperandId {
        self.reduce(ReduceOp::Sum, input, options)
    }

    /// Pads `input`; `padding` must be an int32/uint32 constant of shape `[rank, 2]`.
    pub fn pad(&mut self, input: OperandId, padding: OperandId, options: PadOptions) -> OperandId {
        let padding_bytes = match self.arena.producer(padding).map(|record| &record.kind) {
            Ok(OperatorKind::Constant { bytes }) => Some(Arc::clone(bytes)),
            _ => None,
        };
        self.single("pad", &[input, padding], |specs| {
            let Some(bytes) = padding_bytes else {
                validation_bail!("padding must be a constant operand");
            };
            let pairs = shape::decode_padding(&specs[1], &bytes, specs[0].rank())?;
            let spec = shape::infer_pad(&specs[0], &pairs)?;
            Ok((OperatorKind::Pad(options), spec))
        })
    }

    pub fn batch_norm(
        &mut self,
        input: OperandId,
        mean: OperandId,
        variance: OperandId,
        options: BatchNormOptions,
    ) -> OperandId {
        let mut inputs = vec![input, mean, variance];
        let scale = push_optional(&mut inputs, options.scale);
        let bias = push_optional(&mut inputs, options.bias);
        self.single("batchNorm", &inputs, |specs| {
            let spec = shape::infer_batch_norm(
                &specs[0],
                &specs[1],
                &specs[2],
                scale.map(|index| &specs[index]),
                bias.map(|index| &specs[index]),
                &options,
            )?;
            Ok((OperatorKind::BatchNorm(options), spec))
        })
    }

    pub fn instance_norm(&mut self, input: OperandId, options: InstanceNormOptions) -> OperandId {
        let mut inputs = vec![input];
        let scale = push_optional(&mut inputs, options.scale);
        let bias = push_optional(&mut inputs, options.bias);
        self.single("instanceNorm", &inputs, |specs| {
            let spec = shape::infer_instance_norm(
                &specs[0],
                scale.map(|index| &specs[index]),
                bias.map(|index| &specs[index]),
                &options,
            )?;
            Ok((OperatorKind::InstanceNorm(options), spec))
        })
    }

    /// Gated recurrent unit. Returns the final hidden state, then the full sequence when
    /// `return_sequence` is set.
    pub fn gru(
        &mut self,
        input: OperandId,
        weight: OperandId,
        recurrent_weight: OperandId,
        steps: u32,
        hidden_size: u32,
        options: GruOptions,
    ) -> Vec<OperandId> {
        let mut inputs = vec![input, weight, recurrent_weight];
        let bias = push_optional(&mut inputs, options.bias);
        let recurrent_bias = push_optional(&mut inputs, options.recurrent_bias);
        let hidden = push_optional(&mut inputs, options.initial_hidden_state);
        let expected_outputs = if options.return_sequence { 2 } else { 1 };
        self.add_operator("gru", &inputs, expected_outputs, |specs| {
            let gru_specs = shape::GruSpecs {
                input: &specs[0],
                weight: &specs[1],
                recurrent_weight: &specs[2],
                bias: bias.map(|index| &specs[index]),
                recurrent_bias: recurrent_bias.map(|index| &specs[index]),
                initial_hidden_state: hidden.map(|index| &specs[index]),
            };
            let outputs = shape::infer_gru(&gru_specs, steps, hidden_size, &options)?;
            Ok((
                OperatorKind::Gru {
                    steps,
                    hidden_size,
                    options,
                },
                outputs,
            ))
        })
        .into_vec()
    }

    pub fn split(&mut self, input: OperandId, split: SplitSpec, axis: i32) -> Vec<OperandId> {
        let expected_outputs = match &split {
            SplitSpec::Count(count) => *count as usize,
            SplitSpec::Sizes(sizes) => sizes.len(),
        };
        self.add_operator("split", &[input], expected_outputs, |specs| {
            let (outputs, sizes, axis) = shape::infer_split(&specs[0], &split, axis)?;
            Ok((OperatorKind::Split { sizes, axis }, outputs))
        })
        .into_vec()
    }

    /// Removes `axes` (each of size 1), or every size-1 axis when `None`.
    pub fn squeeze(&mut self, input: OperandId, axes: Option<&[i32]>) -> OperandId {
        self.single("squeeze", &[input], |specs| {
            let (spec, axes) = shape::infer_squeeze(&specs[0], axes)?;
            Ok((OperatorKind::Squeeze { axes }, spec))
        })
    }

    pub fn slice(
        &mut self,
        input: OperandId,
        starts: &[i32],
        sizes: &[i32],
        options: SliceOptions,
    ) -> OperandId {
        self.single("slice", &[input], |specs| {
            let resolved = shape::infer_slice(&specs[0], starts, sizes, options.axes.as_deref())?;
            Ok((
                OperatorKind::Slice {
                    starts: resolved.starts,
                    sizes: resolved.sizes,
                    axes: resolved.axes,
                },
                resolved.spec,
            ))
        })
    }

    pub fn resample2d(&mut self, input: OperandId, options: Resample2dOptions) -> OperandId {
        self.single("resample2d", &[input], |specs| {
            let (spec, axes, sizes) = shape::infer_resample2d(&specs[0], &options)?;
            Ok((
                OperatorKind::Resample2d {
                    mode: options.mode,
                    axes,
                    sizes,
                },
                spec,
            ))
        })
    }

    /// Freezes the builder into a [`Graph`] computing the named outputs.
    ///
    /// Fails with the recorded error of any requested output that is error-tagged, or when the
    /// outputs do not depend on at least one input.
    pub fn build(self, outputs: &[(&str, OperandId)]) -> WebnnResult<Graph> {
        match self.reporter.clone() {
            Some(reporter) => reporter.observe(self.finish(outputs)),
            None => self.finish(outputs),
        }
    }

    fn finish(self, outputs: &[(&str, OperandId)]) -> WebnnResult<Graph> {
        validation_ensure!(!outputs.is_empty(), "at least one output must be named");
        let mut names = HashSet::new();
        for &(name, operand) in outputs {
            validation_ensure!(!name.is_empty(), "output names must not be empty");
            validation_ensure!(names.insert(name), "output name {name} is used twice");
            if let Err(err) = self.arena.spec(operand) {
                return Err(err.with_context(format!("output {name}")));
            }
        }
        let operands = outputs.iter().map(|&(_, operand)| operand).collect::<Vec<_>>();
        let order = schedule(&self.arena, &operands)?;
        let has_input = order.iter().any(|&operator| {
            matches!(
                self.arena.operator(operator).map(|record| &record.kind),
                Ok(OperatorKind::Input { .. })
            )
        });
        validation_ensure!(has_input, "Model inputs must be set");
        let outputs = outputs
            .iter()
            .map(|&(name, operand)| (name.to_string(), operand))
            .collect();
        Ok(Graph::new(
            self.arena,
            order,
            outputs,
            self.backend,
            self.min_buffer_bytes,
            self.reporter,
        ))
    }
}

/// Appends an optional operand and returns its position in the input list.
fn push_optional(inputs: &mut Vec<OperandId>, operand: Option<OperandId>) -> Option<usize> {
    operand.map(|operand| {
        inputs.push(operand);
        inputs.len() - 1
    })
}
