use std::sync::Arc;

use log::{debug, info};

use crate::backend::{CompiledGraphInfo, NativeBackend};
use crate::error::{WebnnError, WebnnResult};
use crate::native::graph::{NativeGraph, NativeInputKind};

use super::binding::{BindingTable, BufferBinding, BufferLayout};
use super::named::{NamedInputs, NamedOutputs, OutputBuffer};
use super::resource::{PoolBuffer, ResourcePool};

/// Binds resources to one compiled native graph and runs it.
///
/// The input buffer holds every constant first, then every caller input, each 16-byte aligned.
/// Outputs are packed the same way in the output buffer and mirrored into the readback buffer.
pub struct ExecutionEngine {
    backend: Arc<dyn NativeBackend>,
    compiled: CompiledGraphInfo,
    pool: ResourcePool,
    constant_layout: BufferLayout,
    input_layout: BufferLayout,
    output_layout: BufferLayout,
}

impl ExecutionEngine {
    /// Allocates resources, uploads constants and runs the backend initializer.
    pub fn initialize(
        backend: Arc<dyn NativeBackend>,
        graph: &NativeGraph,
        compiled: CompiledGraphInfo,
        min_buffer_bytes: u64,
    ) -> WebnnResult<Self> {
        let constant_layout = BufferLayout::pack(
            0,
            graph
                .inputs
                .iter()
                .map(|input| input.is_constant().then(|| input.desc.total_bytes())),
        );
        let input_layout = BufferLayout::pack(
            constant_layout.total(),
            graph
                .inputs
                .iter()
                .map(|input| (!input.is_constant()).then(|| input.desc.total_bytes())),
        );
        let output_layout = BufferLayout::pack(
            0,
            graph
                .outputs
                .iter()
                .map(|output| Some(output.desc.total_bytes())),
        );
        let mut engine = Self {
            backend: Arc::clone(&backend),
            compiled,
            pool: ResourcePool::new(backend, min_buffer_bytes),
            constant_layout,
            input_layout,
            output_layout,
        };
        engine.upload_constants(graph).map_err(compile_time_error)?;
        engine
            .pool
            .ensure(PoolBuffer::Output, engine.output_layout.total())
            .map_err(compile_time_error)?;
        engine
            .pool
            .ensure(PoolBuffer::Readback, engine.output_layout.total())
            .map_err(compile_time_error)?;
        info!(
            "initialized graph {:?}: {} constant bytes, {} input bytes, {} output bytes, {} temporary, {} persistent",
            compiled.id,
            engine.constant_layout.total(),
            engine.input_layout.total() - engine.constant_layout.total(),
            engine.output_layout.total(),
            compiled.temporary_bytes,
            compiled.persistent_bytes
        );
        Ok(engine)
    }

    fn upload_constants(&mut self, graph: &NativeGraph) -> WebnnResult<()> {
        let input_total = self.input_layout.total();
        let constant_total = self.constant_layout.total();
        let upload = self.pool.ensure(PoolBuffer::Upload, input_total)?;
        let input = self.pool.ensure(PoolBuffer::Input, input_total)?;

        let mut bindings = BindingTable::with_slots(graph.inputs.len(), graph.outputs.len());
        for (index, graph_input) in graph.constant_inputs() {
            let NativeInputKind::Constant { bytes } = &graph_input.kind else {
                continue;
            };
            let offset = self.constant_layout.offset(index).ok_or_else(|| {
                WebnnError::internal(format!("constant {index} has no upload offset"))
            })?;
            self.backend.write_buffer(upload, offset, bytes)?;
            bindings.inputs[index] = self.constant_layout.binding(index, input);
        }
        if constant_total > 0 {
            self.backend
                .copy_buffer(upload, 0, input, 0, constant_total)?;
        }
        self.bind_scratch(&mut bindings)?;
        self.backend
            .initialize_graph(self.compiled.id, &bindings)?;
        self.backend.wait_for_completion()?;
        Ok(())
    }

    fn bind_scratch(&mut self, bindings: &mut BindingTable) -> WebnnResult<()> {
        if self.compiled.temporary_bytes > 0 {
            let buffer = self
                .pool
                .ensure(PoolBuffer::Temporary, self.compiled.temporary_bytes)?;
            bindings.temporary = Some(BufferBinding {
                buffer,
                offset: 0,
                size: self.compiled.temporary_bytes,
            });
        }
        if self.compiled.persistent_bytes > 0 {
            let buffer = self
                .pool
                .ensure(PoolBuffer::Persistent, self.compiled.persistent_bytes)?;
            bindings.persistent = Some(BufferBinding {
                buffer,
                offset: 0,
                size: self.compiled.persistent_bytes,
            });
        }
        Ok(())
    }

    /// Uploads inputs, dispatches, waits and copies outputs back.
    pub fn compute(
        &mut self,
        graph: &NativeGraph,
        inputs: &NamedInputs<'_>,
        outputs: &mut NamedOutputs<'_>,
    ) -> WebnnResult<()> {
        self.validate(graph, inputs, outputs)?;

        let input_total = self.input_layout.total();
        let constant_total = self.constant_layout.total();
        let upload = self.pool.ensure(PoolBuffer::Upload, input_total)?;
        let input_buffer = self.pool.ensure(PoolBuffer::Input, input_total)?;
        let output_buffer = self
            .pool
            .ensure(PoolBuffer::Output, self.output_layout.total())?;
        let readback = self
            .pool
            .ensure(PoolBuffer::Readback, self.output_layout.total())?;

        let mut bindings = BindingTable::with_slots(graph.inputs.len(), graph.outputs.len());
        for (index, graph_input) in graph.non_constant_inputs() {
            let name = graph_input.name.as_deref().unwrap_or_default();
            let data = inputs
                .get(name)
                .and_then(|input| input.data())
                .ok_or_else(|| WebnnError::execution(format!("input {name} is not set")))?;
            let offset = self.input_layout.offset(index).ok_or_else(|| {
                WebnnError::internal(format!("input {name} has no upload offset"))
            })?;
            self.backend.write_buffer(upload, offset, data)?;
            bindings.inputs[index] = self.input_layout.binding(index, input_buffer);
        }
        if input_total > constant_total {
            self.backend.copy_buffer(
                upload,
                constant_total,
                input_buffer,
                constant_total,
                input_total - constant_total,
            )?;
        }
        for index in 0..graph.outputs.len() {
            bindings.outputs[index] = self.output_layout.binding(index, output_buffer);
        }
        self.bind_scratch(&mut bindings)?;

        debug!(
            "dispatching graph {:?} with {} inputs and {} outputs",
            self.compiled.id,
            inputs.len(),
            graph.outputs.len()
        );
        self.backend.dispatch(self.compiled.id, &bindings)?;
        self.backend.copy_buffer(
            output_buffer,
            0,
            readback,
            0,
            self.output_layout.total(),
        )?;
        self.backend.wait_for_completion()?;

        for (index, graph_output) in graph.outputs.iter().enumerate() {
            if !graph_output.requested {
                continue;
            }
            let offset = self.output_layout.offset(index).ok_or_else(|| {
                WebnnError::internal(format!("output {} has no offset", graph_output.name))
            })?;
            let byte_len = packed_byte_len(
                graph_output.desc.element_count(),
                graph_output.desc.data_type.size_in_bytes(),
            );
            match outputs.buffer_mut(&graph_output.name) {
                Some(OutputBuffer::Borrowed(bytes)) => {
                    self.backend.read_buffer(readback, offset, bytes)?;
                }
                Some(OutputBuffer::Owned(bytes)) => {
                    bytes.resize(byte_len, 0);
                    self.backend.read_buffer(readback, offset, bytes)?;
                }
                None => {
                    let mut bytes = vec![0u8; byte_len];
                    self.backend.read_buffer(readback, offset, &mut bytes)?;
                    outputs.insert_owned(&graph_output.name, bytes);
                }
            }
        }
        Ok(())
    }

    fn validate(
        &self,
        graph: &NativeGraph,
        inputs: &NamedInputs<'_>,
        outputs: &NamedOutputs<'_>,
    ) -> WebnnResult<()> {
        for name in inputs.names() {
            let known = graph
                .non_constant_inputs()
                .any(|(_, input)| input.name.as_deref() == Some(name));
            if !known {
                return Err(WebnnError::execution(format!("unknown input {name}")));
            }
        }
        for (_, graph_input) in graph.non_constant_inputs() {
            let name = graph_input.name.as_deref().unwrap_or_default();
            let Some(input) = inputs.get(name) else {
                return Err(WebnnError::execution(format!("input {name} is not set")));
            };
            let expected = packed_byte_len(
                graph_input.desc.element_count(),
                graph_input.desc.data_type.size_in_bytes(),
            );
            match input.data() {
                Some(data) if data.len() == expected => {}
                Some(data) => {
                    return Err(WebnnError::execution(format!(
                        "input {name} has {} bytes, expected {expected}",
                        data.len()
                    )))
                }
                None => {
                    return Err(WebnnError::execution(format!(
                        "input {name} byte offset {} is past the end of its {} byte buffer",
                        input.byte_offset,
                        input.bytes.len()
                    )))
                }
            }
        }
        for name in outputs.names() {
            let output = graph
                .outputs
                .iter()
                .find(|output| output.requested && output.name == name)
                .ok_or_else(|| WebnnError::execution(format!("unknown output {name}")))?;
            let expected = packed_byte_len(
                output.desc.element_count(),
                output.desc.data_type.size_in_bytes(),
            );
            if let Some(bytes) = outputs.get(name) {
                if bytes.len() != expected && !outputs.is_owned(name) {
                    return Err(WebnnError::execution(format!(
                        "output {name} has {} bytes, expected {expected}",
                        bytes.len()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn compiled(&self) -> CompiledGraphInfo {
        self.compiled
    }

    /// Current capacity of one of the engine's resource buffers.
    pub fn resource_capacity(&self, which: PoolBuffer) -> u64 {
        self.pool.get(which).capacity()
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        self.backend.release_graph(self.compiled.id);
    }
}

/// Backend failures while a graph is being compiled are reported as lowering errors.
fn compile_time_error(err: WebnnError) -> WebnnError {
    match err {
        WebnnError::Execution { message, .. } => WebnnError::lowering(message),
        other => other,
    }
}

fn packed_byte_len(elements: u64, element_size: u64) -> usize {
    (elements * element_size) as usize
}
