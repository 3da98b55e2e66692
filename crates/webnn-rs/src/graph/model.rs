use std::sync::Arc;

use log::{debug, info, warn};

use crate::backend::{CompiledGraphInfo, NativeBackend};
use crate::descriptor::TensorSpec;
use crate::env;
use crate::error::{WebnnError, WebnnResult};
use crate::exec::engine::ExecutionEngine;
use crate::exec::named::{NamedInputs, NamedOutputs};
use crate::exec::resource::PoolBuffer;
use crate::native::graph::NativeGraph;
use crate::native::lower::lower;
use crate::scope::ErrorReporter;

use super::ir::{GraphArena, OperandId, OperatorId};
use super::ops::OperatorKind;
use super::scheduler::validate_schedule;

enum GraphState {
    Finished,
    Compiled(Box<CompiledGraph>),
    /// Terminal; every later call reports this error.
    Error(WebnnError),
}

struct CompiledGraph {
    native: NativeGraph,
    engine: ExecutionEngine,
}

/// A built graph: frozen IR plus, after [`Graph::compile`], its native graph and resources.
pub struct Graph {
    arena: GraphArena,
    schedule: Vec<OperatorId>,
    outputs: Vec<(String, OperandId)>,
    backend: Arc<dyn NativeBackend>,
    min_buffer_bytes: u64,
    state: GraphState,
    reporter: Option<ErrorReporter>,
}

impl Graph {
    pub(crate) fn new(
        arena: GraphArena,
        schedule: Vec<OperatorId>,
        outputs: Vec<(String, OperandId)>,
        backend: Arc<dyn NativeBackend>,
        min_buffer_bytes: u64,
        reporter: Option<ErrorReporter>,
    ) -> Self {
        Self {
            arena,
            schedule,
            outputs,
            backend,
            min_buffer_bytes,
            state: GraphState::Finished,
            reporter,
        }
    }

    /// Lowers, compiles and initializes the graph. A graph compiles once.
    pub fn compile(&mut self) -> WebnnResult<()> {
        match &self.state {
            GraphState::Error(err) => return Err(err.clone()),
            GraphState::Compiled(_) => {
                return Err(self.report(WebnnError::validation("graph is already compiled")));
            }
            GraphState::Finished => {}
        }
        match self.compile_native() {
            Ok(compiled) => {
                self.state = GraphState::Compiled(Box::new(compiled));
                Ok(())
            }
            Err(err) => {
                warn!("graph compilation failed: {err}");
                self.state = GraphState::Error(err.clone());
                Err(self.report(err))
            }
        }
    }

    fn compile_native(&self) -> WebnnResult<CompiledGraph> {
        validate_schedule(&self.arena, &self.schedule)
            .map_err(|err| WebnnError::internal(err.to_string()))?;
        let native = lower(
            &self.arena,
            &self.schedule,
            &self.outputs,
            self.backend.as_ref(),
        )?;
        if env::dump_native_graph() {
            match serde_json::to_string_pretty(&native) {
                Ok(json) => debug!("native graph:\n{json}"),
                Err(err) => debug!("native graph could not be serialized: {err}"),
            }
        }
        let compiled = self
            .backend
            .compile_graph(&native)
            .map_err(|err| WebnnError::lowering(err.to_string()))?;
        info!(
            "compiled graph on {}: {} IR operators, {} native operators",
            self.backend.backend_name(),
            self.schedule.len(),
            native.operators.len()
        );
        let engine = ExecutionEngine::initialize(
            Arc::clone(&self.backend),
            &native,
            compiled,
            self.min_buffer_bytes,
        )?;
        Ok(CompiledGraph { native, engine })
    }

    /// Runs the compiled graph. Outputs not present in `outputs` are allocated and stored there.
    pub fn compute(
        &mut self,
        inputs: &NamedInputs<'_>,
        outputs: &mut NamedOutputs<'_>,
    ) -> WebnnResult<()> {
        let compiled = match &mut self.state {
            GraphState::Error(err) => return Err(err.clone()),
            GraphState::Finished => {
                return Err(self.report(WebnnError::execution(
                    "graph must be compiled before compute",
                )));
            }
            GraphState::Compiled(compiled) => compiled,
        };
        let result = compiled
            .engine
            .compute(&compiled.native, inputs, outputs);
        if let Err(err) = result {
            if err.poisons_graph() {
                warn!("graph is no longer usable: {err}");
                self.state = GraphState::Error(err.clone());
            }
            return Err(self.report(err));
        }
        Ok(())
    }

    /// Hands a freshly raised error to the context's error scopes. Replays of a terminal error
    /// are not reported again.
    fn report(&self, err: WebnnError) -> WebnnError {
        if let Some(reporter) = &self.reporter {
            reporter.report(&err);
        }
        err
    }

    /// Runs [`Graph::compute`] and reports its outcome through `callback`.
    pub fn compute_with_callback<F>(
        &mut self,
        inputs: &NamedInputs<'_>,
        outputs: &mut NamedOutputs<'_>,
        callback: F,
    ) where
        F: FnOnce(WebnnResult<()>),
    {
        callback(self.compute(inputs, outputs));
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, GraphState::Compiled(_))
    }

    /// The error that moved the graph into its terminal state, if any.
    pub fn error(&self) -> Option<&WebnnError> {
        match &self.state {
            GraphState::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn native_graph(&self) -> Option<&NativeGraph> {
        match &self.state {
            GraphState::Compiled(compiled) => Some(&compiled.native),
            _ => None,
        }
    }

    pub fn compiled_info(&self) -> Option<CompiledGraphInfo> {
        match &self.state {
            GraphState::Compiled(compiled) => Some(compiled.engine.compiled()),
            _ => None,
        }
    }

    /// Capacity of one of the compiled graph's pooled buffers.
    pub fn resource_capacity(&self, which: PoolBuffer) -> Option<u64> {
        match &self.state {
            GraphState::Compiled(compiled) => Some(compiled.engine.resource_capacity(which)),
            _ => None,
        }
    }

    pub fn schedule(&self) -> &[OperatorId] {
        &self.schedule
    }

    pub fn arena(&self) -> &GraphArena {
        &self.arena
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    /// Named inputs the graph depends on, in schedule order.
    pub fn input_names(&self) -> Vec<&str> {
        self.schedule
            .iter()
            .filter_map(|&operator| match self.arena.operator(operator) {
                Ok(record) => match &record.kind {
                    OperatorKind::Input { name } => Some(name.as_str()),
                    _ => None,
                },
                Err(_) => None,
            })
            .collect()
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _)| name.as_str())
    }

    pub fn output_spec(&self, name: &str) -> WebnnResult<&TensorSpec> {
        let (_, operand) = self
            .outputs
            .iter()
            .find(|(existing, _)| existing == name)
            .ok_or_else(|| WebnnError::validation(format!("unknown output {name}")))?;
        self.arena.spec(*operand)
    }
}
