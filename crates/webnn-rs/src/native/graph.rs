//! Backend-native node/edge graph produced by lowering.

use std::sync::Arc;

use serde::Serialize;

use crate::backend::NativeBackend;
use crate::error::{WebnnError, WebnnResult};

use super::desc::NativeTensorDesc;
use super::primitive::Primitive;

#[derive(Debug, Clone, Serialize)]
pub enum NativeInputKind {
    Constant {
        #[serde(skip_serializing)]
        bytes: Arc<[u8]>,
    },
    NonConstant,
}

/// A native graph input: caller-provided tensor or backend-owned constant.
#[derive(Debug, Clone, Serialize)]
pub struct NativeGraphInput {
    /// Caller-visible name; constants are unnamed.
    pub name: Option<String>,
    pub kind: NativeInputKind,
    pub desc: NativeTensorDesc,
}

impl NativeGraphInput {
    pub fn is_constant(&self) -> bool {
        matches!(self.kind, NativeInputKind::Constant { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NativeGraphOutput {
    pub name: String,
    pub desc: NativeTensorDesc,
    /// False for outputs that only exist to satisfy backend graph constraints.
    pub requested: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NativeOperator {
    pub primitive: Primitive,
    /// Input slot descriptors; `None` marks an absent optional slot.
    pub inputs: Vec<Option<NativeTensorDesc>>,
    /// Output slot descriptors; `None` marks an output the primitive does not produce.
    pub outputs: Vec<Option<NativeTensorDesc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NativeEdge {
    Input {
        graph_input: u32,
        to_operator: u32,
        to_input: u32,
    },
    Intermediate {
        from_operator: u32,
        from_output: u32,
        to_operator: u32,
        to_input: u32,
    },
    Output {
        from_operator: u32,
        from_output: u32,
        graph_output: u32,
    },
}

/// Operators are stored in dispatch order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NativeGraph {
    pub inputs: Vec<NativeGraphInput>,
    pub operators: Vec<NativeOperator>,
    pub edges: Vec<NativeEdge>,
    pub outputs: Vec<NativeGraphOutput>,
}

impl NativeGraph {
    pub fn non_constant_inputs(&self) -> impl Iterator<Item = (usize, &NativeGraphInput)> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| !input.is_constant())
    }

    pub fn constant_inputs(&self) -> impl Iterator<Item = (usize, &NativeGraphInput)> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| input.is_constant())
    }

    /// Edges feeding `operator`, in slot order.
    pub fn edges_into(&self, operator: u32) -> impl Iterator<Item = &NativeEdge> {
        self.edges.iter().filter(move |edge| match edge {
            NativeEdge::Input { to_operator, .. } | NativeEdge::Intermediate { to_operator, .. } => {
                *to_operator == operator
            }
            NativeEdge::Output { .. } => false,
        })
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|output| output.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NativeNodeKind {
    ConstantInput { input_index: u32 },
    NonConstantInput { input_index: u32 },
    Intermediate { operator_index: u32, output_index: u32 },
}

/// A value available during lowering: where it comes from and how to read it.
///
/// Rewriting `desc` yields a zero-copy view of the same storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NativeNode {
    pub kind: NativeNodeKind,
    pub desc: NativeTensorDesc,
}

impl NativeNode {
    pub fn with_desc(&self, desc: NativeTensorDesc) -> Self {
        Self {
            kind: self.kind,
            desc,
        }
    }

    pub fn is_graph_input(&self) -> bool {
        !matches!(self.kind, NativeNodeKind::Intermediate { .. })
    }
}

/// Incrementally assembles a [`NativeGraph`], validating each operator against the backend.
pub struct NativeGraphBuilder<'a> {
    backend: &'a dyn NativeBackend,
    graph: NativeGraph,
}

impl<'a> NativeGraphBuilder<'a> {
    pub fn new(backend: &'a dyn NativeBackend) -> Self {
        Self {
            backend,
            graph: NativeGraph::default(),
        }
    }

    pub fn backend(&self) -> &dyn NativeBackend {
        self.backend
    }

    pub fn add_input(
        &mut self,
        name: Option<String>,
        kind: NativeInputKind,
        desc: NativeTensorDesc,
    ) -> WebnnResult<NativeNode> {
        self.check_desc(&desc)?;
        let input_index = self.graph.inputs.len() as u32;
        let node_kind = match kind {
            NativeInputKind::Constant { .. } => NativeNodeKind::ConstantInput { input_index },
            NativeInputKind::NonConstant => NativeNodeKind::NonConstantInput { input_index },
        };
        self.graph.inputs.push(NativeGraphInput {
            name,
            kind,
            desc: desc.clone(),
        });
        Ok(NativeNode {
            kind: node_kind,
            desc,
        })
    }

    /// Records an operator fed by `inputs` and wires one edge per present slot.
    ///
    /// Each slot reads its node through the node's current descriptor.
    pub fn add_operator(
        &mut self,
        primitive: Primitive,
        inputs: &[Option<&NativeNode>],
        outputs: Vec<Option<NativeTensorDesc>>,
    ) -> WebnnResult<u32> {
        for desc in inputs
            .iter()
            .flatten()
            .map(|node| &node.desc)
            .chain(outputs.iter().flatten())
        {
            self.check_desc(desc)?;
        }
        let operator = NativeOperator {
            primitive,
            inputs: inputs
                .iter()
                .map(|node| node.map(|node| node.desc.clone()))
                .collect(),
            outputs,
        };
        self.backend
            .validate_operator(&operator)
            .map_err(|err| WebnnError::lowering(err.to_string()))?;

        let operator_index = self.graph.operators.len() as u32;
        for (slot, node) in inputs.iter().enumerate() {
            let Some(node) = node else {
                continue;
            };
            let edge = match node.kind {
                NativeNodeKind::ConstantInput { input_index }
                | NativeNodeKind::NonConstantInput { input_index } => NativeEdge::Input {
                    graph_input: input_index,
                    to_operator: operator_index,
                    to_input: slot as u32,
                },
                NativeNodeKind::Intermediate {
                    operator_index: from_operator,
                    output_index,
                } => NativeEdge::Intermediate {
                    from_operator,
                    from_output: output_index,
                    to_operator: operator_index,
                    to_input: slot as u32,
                },
            };
            self.graph.edges.push(edge);
        }
        self.graph.operators.push(operator);
        Ok(operator_index)
    }

    /// Node reading output `output_index` of `operator`.
    pub fn output_node(&self, operator: u32, output_index: u32) -> WebnnResult<NativeNode> {
        let desc = self
            .graph
            .operators
            .get(operator as usize)
            .and_then(|op| op.outputs.get(output_index as usize))
            .and_then(|desc| desc.clone())
            .ok_or_else(|| {
                WebnnError::internal(format!(
                    "native operator {operator} has no output {output_index}"
                ))
            })?;
        Ok(NativeNode {
            kind: NativeNodeKind::Intermediate {
                operator_index: operator,
                output_index,
            },
            desc,
        })
    }

    /// Exposes an intermediate node as a graph output.
    pub fn set_graph_output(
        &mut self,
        node: &NativeNode,
        name: impl Into<String>,
        requested: bool,
    ) -> WebnnResult<u32> {
        let NativeNodeKind::Intermediate {
            operator_index,
            output_index,
        } = node.kind
        else {
            return Err(WebnnError::internal(
                "graph outputs must be produced by a native operator",
            ));
        };
        let graph_output = self.graph.outputs.len() as u32;
        self.graph.outputs.push(NativeGraphOutput {
            name: name.into(),
            desc: node.desc.clone(),
            requested,
        });
        self.graph.edges.push(NativeEdge::Output {
            from_operator: operator_index,
            from_output: output_index,
            graph_output,
        });
        Ok(graph_output)
    }

    pub fn finish(self) -> NativeGraph {
        self.graph
    }

    fn check_desc(&self, desc: &NativeTensorDesc) -> WebnnResult<()> {
        let max = self.backend.max_tensor_dimensions();
        if desc.rank() > max {
            return Err(WebnnError::lowering(format!(
                "tensor rank {} exceeds the backend maximum of {max}",
                desc.rank()
            )));
        }
        if !self.backend.supports_data_type(desc.data_type) {
            return Err(WebnnError::lowering(format!(
                "data type {:?} is not supported by backend {}",
                desc.data_type,
                self.backend.backend_name()
            )));
        }
        Ok(())
    }
}
