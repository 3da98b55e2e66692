//! Native backend collaborator interface.
//!
//! A backend compiles a lowered [`NativeGraph`], owns device buffers and executes dispatches
//! against a [`BindingTable`]. Everything above this trait is backend-agnostic.

use std::fmt;

use serde::Serialize;

use crate::error::WebnnError;
use crate::exec::binding::BindingTable;
use crate::native::desc::{NativeDataType, MAX_TENSOR_DIMENSIONS};
use crate::native::graph::{NativeGraph, NativeOperator};
use crate::native::primitive::NativeActivation;

/// Opaque handle of a backend buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId(pub u64);

/// Opaque handle of a compiled native graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CompiledGraphId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BufferUsage {
    /// Host-visible staging memory written by the host.
    Upload,
    /// Device-resident memory bound to graph inputs, outputs, temporaries and persistent state.
    Device,
    /// Host-visible memory the device copies results into.
    Readback,
}

/// What compilation produced and how much scratch memory the graph needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledGraphInfo {
    pub id: CompiledGraphId,
    pub temporary_bytes: u64,
    pub persistent_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    InvalidArgument { message: String },
    OutOfMemory { requested: u64 },
    Execution { message: String },
    DeviceLost { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BackendError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn device_lost(message: impl Into<String>) -> Self {
        BackendError::DeviceLost {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::InvalidArgument { message } => {
                write!(f, "invalid backend argument: {message}")
            }
            BackendError::OutOfMemory { requested } => {
                write!(f, "backend out of memory allocating {requested} bytes")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::DeviceLost { message } => write!(f, "device lost: {message}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<BackendError> for WebnnError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::DeviceLost { .. } => WebnnError::device_lost(err.to_string()),
            _ => WebnnError::execution(err.to_string()),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Native backend trait consumed by the lowering and execution engines.
///
/// Calls on one compiled graph are externally serialized by its owner; implementations still need
/// to be `Send + Sync` because a backend instance can be shared between graphs.
pub trait NativeBackend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Largest descriptor rank the backend accepts.
    fn max_tensor_dimensions(&self) -> usize {
        MAX_TENSOR_DIMENSIONS
    }

    fn supports_data_type(&self, _data_type: NativeDataType) -> bool {
        true
    }

    /// Whether primitives can apply `activation` themselves instead of a trailing node.
    fn supports_fused_activation(&self, _activation: &NativeActivation) -> bool {
        false
    }

    /// Rejects operators the backend cannot create.
    fn validate_operator(&self, _operator: &NativeOperator) -> BackendResult<()> {
        Ok(())
    }

    /// Compiles the whole native graph; called once per graph.
    fn compile_graph(&self, graph: &NativeGraph) -> BackendResult<CompiledGraphInfo>;

    fn release_graph(&self, graph: CompiledGraphId);

    fn allocate_buffer(&self, bytes: u64, usage: BufferUsage) -> BackendResult<BufferId>;

    fn release_buffer(&self, buffer: BufferId);

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()>;

    fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> BackendResult<()>;

    fn copy_buffer(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        bytes: u64,
    ) -> BackendResult<()>;

    /// Runs the graph initializer: constants bound in `bindings.inputs` are taken over into
    /// persistent storage.
    fn initialize_graph(&self, graph: CompiledGraphId, bindings: &BindingTable)
        -> BackendResult<()>;

    /// Records execution of the compiled graph against `bindings`.
    fn dispatch(&self, graph: CompiledGraphId, bindings: &BindingTable) -> BackendResult<()>;

    /// Blocks until every recorded dispatch and copy has completed.
    fn wait_for_completion(&self) -> BackendResult<()>;
}
