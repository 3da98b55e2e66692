use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use half::f16;
use log::{debug, trace};
use smallvec::SmallVec;
use webnn_rs::backend::{
    BackendError, BackendResult, BufferId, BufferUsage, CompiledGraphId, CompiledGraphInfo,
    NativeBackend,
};
use webnn_rs::exec::binding::{round_up_to_multiple, BindingTable, BUFFER_ALIGNMENT};
use webnn_rs::native::desc::{NativeDataType, NativeTensorDesc};
use webnn_rs::native::graph::{NativeEdge, NativeGraph, NativeOperator};
use webnn_rs::native::primitive::{NativeActivation, PoolingFunction, Primitive};

use crate::kernels::{execute_primitive, unravel_index, CpuTensor};

/// Where an operator input slot reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    GraphInput(usize),
    Operator { operator: usize, output: usize },
}

#[derive(Debug, Clone)]
struct OperatorPlan {
    operator: NativeOperator,
    sources: SmallVec<[Option<Source>; 5]>,
    /// Offset of each produced output inside the temporary buffer.
    output_offsets: SmallVec<[Option<u64>; 2]>,
}

#[derive(Debug, Clone)]
struct InputPlan {
    desc: NativeTensorDesc,
    /// Offset inside the persistent buffer for constants.
    persistent_offset: Option<u64>,
}

#[derive(Debug, Clone)]
struct OutputPlan {
    operator: usize,
    output: usize,
    desc: NativeTensorDesc,
}

/// Execution plan built by `compile_graph`.
#[derive(Debug)]
struct GraphPlan {
    inputs: Vec<InputPlan>,
    operators: Vec<OperatorPlan>,
    outputs: Vec<OutputPlan>,
    temporary_bytes: u64,
    persistent_bytes: u64,
}

/// Host-memory reference implementation of [`NativeBackend`].
///
/// Buffers are plain byte vectors; dispatch runs synchronously, so `wait_for_completion` has
/// nothing to wait for.
#[derive(Default)]
pub struct CpuBackend {
    buffers: Mutex<HashMap<BufferId, Vec<u8>>>,
    plans: Mutex<HashMap<CompiledGraphId, Arc<GraphPlan>>>,
    next_id: AtomicU64,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> usize {
        self.lock_buffers().len()
    }

    /// Number of compiled graphs that have not been released.
    pub fn graph_count(&self) -> usize {
        self.lock_plans().len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lock_buffers(&self) -> MutexGuard<'_, HashMap<BufferId, Vec<u8>>> {
        self.buffers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_plans(&self) -> MutexGuard<'_, HashMap<CompiledGraphId, Arc<GraphPlan>>> {
        self.plans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn plan(&self, graph: CompiledGraphId) -> BackendResult<Arc<GraphPlan>> {
        self.lock_plans()
            .get(&graph)
            .cloned()
            .ok_or_else(|| BackendError::invalid_argument(format!("unknown graph {graph:?}")))
    }
}

impl NativeBackend for CpuBackend {
    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn supports_fused_activation(&self, activation: &NativeActivation) -> bool {
        !matches!(activation, NativeActivation::Softmax)
    }

    fn validate_operator(&self, operator: &NativeOperator) -> BackendResult<()> {
        let present = operator.inputs.iter().filter(|slot| slot.is_some()).count();
        let (min, max) = match &operator.primitive {
            Primitive::ElementWise(function) => (function.arity(), function.arity()),
            Primitive::Clip { .. }
            | Primitive::Activation(_)
            | Primitive::Pooling { .. }
            | Primitive::Padding { .. }
            | Primitive::Reduce { .. }
            | Primitive::Split { .. }
            | Primitive::Slice { .. }
            | Primitive::Resample { .. } => (1, 1),
            Primitive::Gemm { .. } | Primitive::Convolution { .. } => (2, 3),
            Primitive::BatchNormalization { .. } => (5, 5),
            Primitive::MeanVarianceNormalization { .. } => (1, 3),
            Primitive::Join { .. } => (1, usize::MAX),
            Primitive::Gru { .. } => (4, 5),
        };
        if present < min || present > max {
            return Err(BackendError::invalid_argument(format!(
                "{} takes {min}..={max} inputs, got {present}",
                operator.primitive.name()
            )));
        }
        if let Primitive::Pooling {
            function,
            dilations,
            ..
        } = &operator.primitive
        {
            if *function != PoolingFunction::Max && *dilations != [1, 1] {
                return Err(BackendError::unimplemented(
                    "pooling",
                    "dilations are only supported by max pooling",
                ));
            }
        }
        Ok(())
    }

    fn compile_graph(&self, graph: &NativeGraph) -> BackendResult<CompiledGraphInfo> {
        let plan = build_plan(graph)?;
        let info = CompiledGraphInfo {
            id: CompiledGraphId(self.next_id()),
            temporary_bytes: plan.temporary_bytes,
            persistent_bytes: plan.persistent_bytes,
        };
        debug!(
            "cpu backend compiled graph {:?}: {} operators, {} temporary bytes, {} persistent bytes",
            info.id,
            plan.operators.len(),
            info.temporary_bytes,
            info.persistent_bytes
        );
        self.lock_plans().insert(info.id, Arc::new(plan));
        Ok(info)
    }

    fn release_graph(&self, graph: CompiledGraphId) {
        self.lock_plans().remove(&graph);
    }

    fn allocate_buffer(&self, bytes: u64, usage: BufferUsage) -> BackendResult<BufferId> {
        let len = usize::try_from(bytes).map_err(|_| BackendError::OutOfMemory { requested: bytes })?;
        let id = BufferId(self.next_id());
        trace!("allocating {usage:?} buffer {id:?} of {bytes} bytes");
        self.lock_buffers().insert(id, vec![0u8; len]);
        Ok(id)
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.lock_buffers().remove(&buffer);
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()> {
        let mut buffers = self.lock_buffers();
        let target = buffer_mut(&mut buffers, buffer)?;
        let range = byte_range(target.len(), offset, data.len() as u64)?;
        target[range].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        let buffers = self.lock_buffers();
        let source = buffer_ref(&buffers, buffer)?;
        let range = byte_range(source.len(), offset, out.len() as u64)?;
        out.copy_from_slice(&source[range]);
        Ok(())
    }

    fn copy_buffer(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        bytes: u64,
    ) -> BackendResult<()> {
        let mut buffers = self.lock_buffers();
        let source = buffer_ref(&buffers, src)?;
        let range = byte_range(source.len(), src_offset, bytes)?;
        let chunk = source[range].to_vec();
        let target = buffer_mut(&mut buffers, dst)?;
        let range = byte_range(target.len(), dst_offset, bytes)?;
        target[range].copy_from_slice(&chunk);
        Ok(())
    }

    fn initialize_graph(
        &self,
        graph: CompiledGraphId,
        bindings: &BindingTable,
    ) -> BackendResult<()> {
        let plan = self.plan(graph)?;
        if plan.persistent_bytes == 0 {
            return Ok(());
        }
        let persistent = bindings
            .persistent
            .ok_or_else(|| BackendError::invalid_argument("persistent resource is not bound"))?;
        let mut buffers = self.lock_buffers();
        for (index, input) in plan.inputs.iter().enumerate() {
            let Some(offset) = input.persistent_offset else {
                continue;
            };
            let binding = bindings
                .inputs
                .get(index)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    BackendError::invalid_argument(format!("constant {index} is not bound"))
                })?;
            let bytes = input.desc.total_bytes();
            let source = buffer_ref(&buffers, binding.buffer)?;
            let range = byte_range(source.len(), binding.offset, bytes)?;
            let chunk = source[range].to_vec();
            let target = buffer_mut(&mut buffers, persistent.buffer)?;
            let range = byte_range(target.len(), persistent.offset + offset, bytes)?;
            target[range].copy_from_slice(&chunk);
        }
        Ok(())
    }

    fn dispatch(&self, graph: CompiledGraphId, bindings: &BindingTable) -> BackendResult<()> {
        let plan = self.plan(graph)?;
        let mut buffers = self.lock_buffers();
        // Intermediates live in the temporary resource; take it out of the map while running.
        let (temporary_id, temporary_base) = match bindings.temporary {
            Some(binding) => (Some(binding.buffer), binding.offset),
            None if plan.temporary_bytes == 0 => (None, 0),
            None => {
                return Err(BackendError::invalid_argument(
                    "temporary resource is not bound",
                ))
            }
        };
        let mut scratch = match temporary_id {
            Some(id) => std::mem::take(buffer_mut(&mut buffers, id)?),
            None => Vec::new(),
        };
        let result = run_plan(&plan, bindings, &buffers, &mut scratch, temporary_base);
        if let Some(id) = temporary_id {
            if let Some(slot) = buffers.get_mut(&id) {
                *slot = scratch;
            }
        }
        let outputs = result?;
        for (index, tensor) in outputs.into_iter().enumerate() {
            let Some(binding) = bindings.outputs.get(index).copied().flatten() else {
                continue;
            };
            let desc = &plan.outputs[index].desc;
            let target = buffer_mut(&mut buffers, binding.buffer)?;
            scatter(target, binding.offset, desc, &tensor)?;
        }
        Ok(())
    }

    fn wait_for_completion(&self) -> BackendResult<()> {
        Ok(())
    }
}

fn build_plan(graph: &NativeGraph) -> BackendResult<GraphPlan> {
    let mut persistent_bytes = 0u64;
    let inputs = graph
        .inputs
        .iter()
        .map(|input| {
            let persistent_offset = input.is_constant().then(|| {
                let offset = persistent_bytes;
                persistent_bytes =
                    round_up_to_multiple(offset + input.desc.total_bytes(), BUFFER_ALIGNMENT);
                offset
            });
            InputPlan {
                desc: input.desc.clone(),
                persistent_offset,
            }
        })
        .collect::<Vec<_>>();

    let mut temporary_bytes = 0u64;
    let mut operators = Vec::with_capacity(graph.operators.len());
    for operator in &graph.operators {
        let output_offsets = operator
            .outputs
            .iter()
            .map(|desc| {
                desc.as_ref().map(|desc| {
                    let offset = temporary_bytes;
                    temporary_bytes =
                        round_up_to_multiple(offset + desc.total_bytes(), BUFFER_ALIGNMENT);
                    offset
                })
            })
            .collect();
        operators.push(OperatorPlan {
            operator: operator.clone(),
            sources: SmallVec::from_elem(None, operator.inputs.len()),
            output_offsets,
        });
    }

    let mut outputs: Vec<Option<OutputPlan>> = vec![None; graph.outputs.len()];
    for edge in &graph.edges {
        match *edge {
            NativeEdge::Input {
                graph_input,
                to_operator,
                to_input,
            } => {
                if graph_input as usize >= inputs.len() {
                    return Err(BackendError::invalid_argument(format!(
                        "edge reads missing graph input {graph_input}"
                    )));
                }
                connect(
                    &mut operators,
                    to_operator,
                    to_input,
                    Source::GraphInput(graph_input as usize),
                )?;
            }
            NativeEdge::Intermediate {
                from_operator,
                from_output,
                to_operator,
                to_input,
            } => {
                if from_operator >= to_operator {
                    return Err(BackendError::invalid_argument(format!(
                        "edge from operator {from_operator} to {to_operator} breaks dispatch order"
                    )));
                }
                check_output(&operators, from_operator, from_output)?;
                connect(
                    &mut operators,
                    to_operator,
                    to_input,
                    Source::Operator {
                        operator: from_operator as usize,
                        output: from_output as usize,
                    },
                )?;
            }
            NativeEdge::Output {
                from_operator,
                from_output,
                graph_output,
            } => {
                check_output(&operators, from_operator, from_output)?;
                let desc = graph
                    .outputs
                    .get(graph_output as usize)
                    .map(|output| output.desc.clone())
                    .ok_or_else(|| {
                        BackendError::invalid_argument(format!(
                            "edge writes missing graph output {graph_output}"
                        ))
                    })?;
                outputs[graph_output as usize] = Some(OutputPlan {
                    operator: from_operator as usize,
                    output: from_output as usize,
                    desc,
                });
            }
        }
    }

    for (index, plan) in operators.iter().enumerate() {
        for (slot, (source, desc)) in plan.sources.iter().zip(&plan.operator.inputs).enumerate() {
            if desc.is_some() && source.is_none() {
                return Err(BackendError::invalid_argument(format!(
                    "input {slot} of operator {index} has no edge"
                )));
            }
        }
    }
    let outputs = outputs
        .into_iter()
        .enumerate()
        .map(|(index, output)| {
            output.ok_or_else(|| {
                BackendError::invalid_argument(format!("graph output {index} has no edge"))
            })
        })
        .collect::<BackendResult<Vec<_>>>()?;

    Ok(GraphPlan {
        inputs,
        operators,
        outputs,
        temporary_bytes,
        persistent_bytes,
    })
}

fn connect(
    operators: &mut [OperatorPlan],
    to_operator: u32,
    to_input: u32,
    source: Source,
) -> BackendResult<()> {
    let slot = operators
        .get_mut(to_operator as usize)
        .and_then(|plan| plan.sources.get_mut(to_input as usize))
        .ok_or_else(|| {
            BackendError::invalid_argument(format!(
                "edge targets missing input {to_input} of operator {to_operator}"
            ))
        })?;
    if slot.is_some() {
        return Err(BackendError::invalid_argument(format!(
            "input {to_input} of operator {to_operator} has two edges"
        )));
    }
    *slot = Some(source);
    Ok(())
}

fn check_output(operators: &[OperatorPlan], operator: u32, output: u32) -> BackendResult<()> {
    let produced = operators
        .get(operator as usize)
        .and_then(|plan| plan.output_offsets.get(output as usize))
        .is_some_and(Option::is_some);
    if produced {
        Ok(())
    } else {
        Err(BackendError::invalid_argument(format!(
            "operator {operator} does not produce output {output}"
        )))
    }
}

/// Runs every operator in order and returns the graph outputs.
fn run_plan(
    plan: &GraphPlan,
    bindings: &BindingTable,
    buffers: &HashMap<BufferId, Vec<u8>>,
    scratch: &mut [u8],
    scratch_base: u64,
) -> BackendResult<Vec<CpuTensor>> {
    let persistent = match bindings.persistent {
        Some(binding) => Some((buffer_ref(buffers, binding.buffer)?, binding.offset)),
        None => None,
    };
    for (index, operator_plan) in plan.operators.iter().enumerate() {
        let operator = &operator_plan.operator;
        let mut inputs = Vec::with_capacity(operator.inputs.len());
        for (source, desc) in operator_plan.sources.iter().zip(&operator.inputs) {
            let tensor = match (source, desc) {
                (Some(source), Some(desc)) => {
                    let (storage, base) = source_storage(
                        plan,
                        *source,
                        bindings,
                        buffers,
                        persistent,
                        (&*scratch, scratch_base),
                    )?;
                    Some(gather(storage, base, desc)?)
                }
                _ => None,
            };
            inputs.push(tensor);
        }
        let output_dims = operator
            .outputs
            .iter()
            .map(|desc| desc.as_ref().map(dims_of))
            .collect::<Vec<_>>();
        let results = execute_primitive(&operator.primitive, &inputs, &output_dims).map_err(
            |err| match err {
                BackendError::Execution { message } => BackendError::execution(format!(
                    "operator {index} ({}): {message}",
                    operator.primitive.name()
                )),
                other => other,
            },
        )?;
        trace!("ran operator {index} ({})", operator.primitive.name());
        for ((result, desc), offset) in results
            .iter()
            .zip(&operator.outputs)
            .zip(&operator_plan.output_offsets)
        {
            if let (Some(result), Some(desc), Some(offset)) = (result, desc, offset) {
                scatter(scratch, scratch_base + offset, desc, result)?;
            }
        }
    }

    plan.outputs
        .iter()
        .map(|output| {
            let offset = plan.operators[output.operator].output_offsets[output.output]
                .ok_or_else(|| BackendError::execution("graph output was not produced"))?;
            gather(scratch, scratch_base + offset, &output.desc)
        })
        .collect()
}

fn source_storage<'a>(
    plan: &GraphPlan,
    source: Source,
    bindings: &BindingTable,
    buffers: &'a HashMap<BufferId, Vec<u8>>,
    persistent: Option<(&'a Vec<u8>, u64)>,
    scratch: (&'a [u8], u64),
) -> BackendResult<(&'a [u8], u64)> {
    match source {
        Source::GraphInput(index) => {
            if let Some(offset) = plan.inputs[index].persistent_offset {
                let (storage, base) = persistent.ok_or_else(|| {
                    BackendError::invalid_argument("persistent resource is not bound")
                })?;
                return Ok((storage.as_slice(), base + offset));
            }
            let binding = bindings
                .inputs
                .get(index)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    BackendError::invalid_argument(format!("graph input {index} is not bound"))
                })?;
            Ok((buffer_ref(buffers, binding.buffer)?.as_slice(), binding.offset))
        }
        Source::Operator { operator, output } => {
            let offset = plan.operators[operator].output_offsets[output]
                .ok_or_else(|| BackendError::execution("input reads an absent output"))?;
            let (storage, base) = scratch;
            Ok((storage, base + offset))
        }
    }
}

fn dims_of(desc: &NativeTensorDesc) -> Vec<usize> {
    desc.dims.iter().map(|&dim| dim as usize).collect()
}

/// Reads the elements `desc` addresses, in row-major order of its dimensions.
pub fn gather(storage: &[u8], base: u64, desc: &NativeTensorDesc) -> BackendResult<CpuTensor> {
    let dims = dims_of(desc);
    let strides = desc.effective_strides();
    let size = desc.data_type.size_in_bytes() as usize;
    let count: usize = dims.iter().product();
    let mut values = Vec::with_capacity(count);
    for index in 0..count {
        let coords = unravel_index(index, &dims);
        let element: usize = coords
            .iter()
            .zip(&strides)
            .map(|(&coord, &stride)| coord * stride as usize)
            .sum();
        let start = base as usize + element * size;
        let bytes = storage.get(start..start + size).ok_or_else(|| {
            BackendError::execution(format!(
                "tensor {:?} reads past the end of its {} byte storage",
                desc.dims,
                storage.len()
            ))
        })?;
        values.push(decode(desc.data_type, bytes));
    }
    Ok(CpuTensor::new(dims, values))
}

/// Writes `tensor` through the strides of `desc`.
pub fn scatter(
    storage: &mut [u8],
    base: u64,
    desc: &NativeTensorDesc,
    tensor: &CpuTensor,
) -> BackendResult<()> {
    let dims = dims_of(desc);
    if dims != tensor.dims {
        return Err(BackendError::execution(format!(
            "result {:?} does not match output {:?}",
            tensor.dims, desc.dims
        )));
    }
    let strides = desc.effective_strides();
    let size = desc.data_type.size_in_bytes() as usize;
    let storage_len = storage.len();
    for (index, &value) in tensor.values.iter().enumerate() {
        let coords = unravel_index(index, &dims);
        let element: usize = coords
            .iter()
            .zip(&strides)
            .map(|(&coord, &stride)| coord * stride as usize)
            .sum();
        let start = base as usize + element * size;
        let bytes = storage.get_mut(start..start + size).ok_or_else(|| {
            BackendError::execution(format!(
                "tensor {:?} writes past the end of its {storage_len} byte storage",
                desc.dims
            ))
        })?;
        encode(desc.data_type, value, bytes);
    }
    Ok(())
}

fn decode(data_type: NativeDataType, bytes: &[u8]) -> f64 {
    match data_type {
        NativeDataType::Float32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        NativeDataType::Float16 => f16::from_le_bytes([bytes[0], bytes[1]]).to_f64(),
        NativeDataType::Int32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        NativeDataType::Uint32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
    }
}

fn encode(data_type: NativeDataType, value: f64, out: &mut [u8]) {
    match data_type {
        NativeDataType::Float32 => out.copy_from_slice(&(value as f32).to_le_bytes()),
        NativeDataType::Float16 => out.copy_from_slice(&f16::from_f64(value).to_le_bytes()),
        NativeDataType::Int32 => out.copy_from_slice(&(value as i32).to_le_bytes()),
        NativeDataType::Uint32 => out.copy_from_slice(&(value as u32).to_le_bytes()),
    }
}

fn buffer_ref(buffers: &HashMap<BufferId, Vec<u8>>, id: BufferId) -> BackendResult<&Vec<u8>> {
    buffers
        .get(&id)
        .ok_or_else(|| BackendError::invalid_argument(format!("unknown buffer {id:?}")))
}

fn buffer_mut(
    buffers: &mut HashMap<BufferId, Vec<u8>>,
    id: BufferId,
) -> BackendResult<&mut Vec<u8>> {
    buffers
        .get_mut(&id)
        .ok_or_else(|| BackendError::invalid_argument(format!("unknown buffer {id:?}")))
}

fn byte_range(len: usize, offset: u64, bytes: u64) -> BackendResult<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = offset
        .checked_add(bytes)
        .map(|end| end as usize)
        .filter(|&end| end <= len)
        .ok_or_else(|| {
            BackendError::invalid_argument(format!(
                "range {offset}+{bytes} exceeds buffer of {len} bytes"
            ))
        })?;
    Ok(start..end)
}
