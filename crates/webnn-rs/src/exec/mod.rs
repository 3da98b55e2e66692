pub mod binding;
pub mod engine;
pub mod named;
pub mod resource;

pub use binding::{BindingTable, BufferBinding, BufferLayout, BUFFER_ALIGNMENT};
pub use engine::ExecutionEngine;
pub use named::{Input, NamedInputs, NamedOutputs, OutputBuffer};
pub use resource::{PoolBuffer, ResourceBuffer, ResourcePool};
