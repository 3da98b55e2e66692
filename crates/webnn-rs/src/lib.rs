//! Graph construction, shape inference, lowering and execution for neural-network graphs.
//!
//! A [`Context`] owns a native backend and hands out [`GraphBuilder`]s. Builder calls record
//! operators and infer their outputs; [`GraphBuilder::build`] schedules the requested outputs into
//! a [`Graph`], which is lowered to a native graph on [`Graph::compile`] and executed by
//! [`Graph::compute`].
//!
//! ```ignore
//! let context = Context::from_env()?;
//! let mut builder = context.create_builder();
//! let desc = OperandDescriptor::new(OperandType::Float32, [2, 2]);
//! let a = builder.input("a", &desc);
//! let b = builder.constant_f32(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
//! let sum = builder.add(a, b);
//! let mut graph = builder.build(&[("sum", sum)])?;
//! graph.compile()?;
//! ```

pub mod backend;
pub mod context;
pub mod descriptor;
mod env;
pub mod error;
pub mod exec;
pub mod graph;
pub mod native;
pub mod registry;
pub mod scope;

pub use backend::{BackendError, BackendResult, NativeBackend};
pub use context::{Context, ContextOptions, DevicePreference, PowerPreference};
pub use descriptor::{OperandDescriptor, OperandType, Shape, TensorSpec};
pub use error::{ErrorKind, ResultExt, WebnnError, WebnnResult};
pub use exec::{Input, NamedInputs, NamedOutputs};
pub use graph::{Graph, GraphBuilder, OperandId, OperatorId};
pub use scope::{ErrorFilter, ErrorReporter};
