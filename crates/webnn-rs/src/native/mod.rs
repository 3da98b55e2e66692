//! Backend-native graph representation and the lowering engine that produces it.

pub mod desc;
pub mod graph;
pub mod lower;
pub mod primitive;

pub use desc::{NativeDataType, NativeTensorDesc};
pub use graph::{NativeEdge, NativeGraph, NativeGraphInput, NativeGraphOutput, NativeOperator};
pub use lower::lower;
pub use primitive::{NativeActivation, Primitive};
