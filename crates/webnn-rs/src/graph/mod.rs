//! Graph IR, shape inference, builder, scheduler and the graph state machine.
//!
//! Operands and operators live in an append-only [`GraphArena`]; the [`GraphBuilder`] records
//! operators with their inferred output specs and [`GraphBuilder::build`] freezes the arena into a
//! [`Graph`].

pub mod builder;
pub mod ir;
pub mod model;
pub mod ops;
pub mod scheduler;
pub mod shape;

pub use builder::GraphBuilder;
pub use ir::{GraphArena, OperandId, OperandState, OperatorId};
pub use model::Graph;
pub use ops::*;
pub use scheduler::{schedule, validate_schedule, TopologyError};
