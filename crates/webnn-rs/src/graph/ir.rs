use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::descriptor::TensorSpec;
use crate::error::{WebnnError, WebnnResult};

use super::ops::OperatorKind;

/// Handle of an operand inside a graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperandId(pub u32);

/// Handle of an operator inside a graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub u32);

impl fmt::Display for OperandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Result of shape inference for one operand: a valid spec or the error that poisoned it.
#[derive(Debug, Clone, PartialEq)]
pub enum OperandState {
    Valid(TensorSpec),
    Error(WebnnError),
}

#[derive(Debug, Clone)]
pub struct OperandRecord {
    pub producer: OperatorId,
    pub output_index: usize,
    pub state: OperandState,
}

impl OperandRecord {
    pub fn spec(&self) -> WebnnResult<&TensorSpec> {
        match &self.state {
            OperandState::Valid(spec) => Ok(spec),
            OperandState::Error(err) => Err(err.clone()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.state, OperandState::Error(_))
    }
}

#[derive(Debug, Clone)]
pub struct OperatorRecord {
    pub kind: OperatorKind,
    pub inputs: SmallVec<[OperandId; 4]>,
    pub outputs: SmallVec<[OperandId; 2]>,
}

/// Append-only arena of operands and operators.
///
/// An operator can only reference operands that already exist, so the reference structure is
/// acyclic by construction and registration order is itself a valid topological order.
#[derive(Debug, Clone, Default)]
pub struct GraphArena {
    operands: Vec<OperandRecord>,
    operators: Vec<OperatorRecord>,
}

impl GraphArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an operator and one operand per entry of `outputs`.
    pub fn push_operator(
        &mut self,
        kind: OperatorKind,
        inputs: &[OperandId],
        outputs: Vec<OperandState>,
    ) -> (OperatorId, SmallVec<[OperandId; 2]>) {
        let operator_id = OperatorId(self.operators.len() as u32);
        let mut output_ids = SmallVec::with_capacity(outputs.len());
        for (output_index, state) in outputs.into_iter().enumerate() {
            let id = OperandId(self.operands.len() as u32);
            self.operands.push(OperandRecord {
                producer: operator_id,
                output_index,
                state,
            });
            output_ids.push(id);
        }
        self.operators.push(OperatorRecord {
            kind,
            inputs: inputs.iter().copied().collect(),
            outputs: output_ids.clone(),
        });
        (operator_id, output_ids)
    }

    pub fn operand(&self, id: OperandId) -> WebnnResult<&OperandRecord> {
        self.operands
            .get(id.0 as usize)
            .ok_or_else(|| WebnnError::validation(format!("unknown operand {id}")))
    }

    pub fn operator(&self, id: OperatorId) -> WebnnResult<&OperatorRecord> {
        self.operators
            .get(id.0 as usize)
            .ok_or_else(|| WebnnError::internal(format!("unknown operator {id}")))
    }

    /// Inferred spec of an operand, or the error that poisoned it.
    pub fn spec(&self, id: OperandId) -> WebnnResult<&TensorSpec> {
        self.operand(id)?.spec()
    }

    pub fn producer(&self, id: OperandId) -> WebnnResult<&OperatorRecord> {
        let producer = self.operand(id)?.producer;
        self.operator(producer)
    }

    pub fn operators(&self) -> impl Iterator<Item = (OperatorId, &OperatorRecord)> {
        self.operators
            .iter()
            .enumerate()
            .map(|(index, record)| (OperatorId(index as u32), record))
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Named graph inputs in registration order.
    pub fn inputs(&self) -> impl Iterator<Item = (&str, OperandId)> {
        self.operators.iter().filter_map(|record| match &record.kind {
            OperatorKind::Input { name } => record.outputs.first().map(|id| (name.as_str(), *id)),
            _ => None,
        })
    }
}
