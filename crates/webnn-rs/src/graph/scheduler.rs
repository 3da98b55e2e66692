use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use log::debug;

use crate::error::{WebnnError, WebnnResult};

use super::ir::{GraphArena, OperandId, OperatorId};

/// Computes the operators needed for `outputs` in dependency order.
///
/// Reverse reachability from each requested operand marks the minimal subgraph; a Kahn pass then
/// emits producers before consumers, breaking ties by registration order.
pub fn schedule(arena: &GraphArena, outputs: &[OperandId]) -> WebnnResult<Vec<OperatorId>> {
    let mut needed: HashSet<OperatorId> = HashSet::new();
    let mut stack = Vec::with_capacity(outputs.len());
    for &output in outputs {
        let record = arena.operand(output)?;
        if let Err(err) = record.spec() {
            return Err(err.with_context(format!("requested output {output} is invalid")));
        }
        stack.push(record.producer);
    }
    while let Some(operator) = stack.pop() {
        if !needed.insert(operator) {
            continue;
        }
        for &input in &arena.operator(operator)?.inputs {
            let record = arena.operand(input)?;
            if !needed.contains(&record.producer) {
                stack.push(record.producer);
            }
        }
    }

    let mut pending: HashMap<OperatorId, usize> = HashMap::with_capacity(needed.len());
    let mut consumers: HashMap<OperatorId, Vec<OperatorId>> = HashMap::new();
    for &operator in &needed {
        let record = arena.operator(operator)?;
        let mut producers = HashSet::new();
        for &input in &record.inputs {
            producers.insert(arena.operand(input)?.producer);
        }
        pending.insert(operator, producers.len());
        for producer in producers {
            consumers.entry(producer).or_default().push(operator);
        }
    }

    let mut ready: BinaryHeap<Reverse<OperatorId>> = pending
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(&operator, _)| Reverse(operator))
        .collect();
    let mut order = Vec::with_capacity(needed.len());
    while let Some(Reverse(operator)) = ready.pop() {
        order.push(operator);
        for consumer in consumers.get(&operator).into_iter().flatten() {
            if let Some(count) = pending.get_mut(consumer) {
                *count -= 1;
                if *count == 0 {
                    ready.push(Reverse(*consumer));
                }
            }
        }
    }
    if order.len() != needed.len() {
        return Err(WebnnError::internal(format!(
            "graph contains a cycle: scheduled {} of {} operators",
            order.len(),
            needed.len()
        )));
    }
    debug!(
        "scheduled {} of {} operators for {} outputs",
        order.len(),
        arena.operator_count(),
        outputs.len()
    );
    Ok(order)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyError {
    pub missing_operand: OperandId,
    pub operator: OperatorId,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operand {} is missing before operator {}",
            self.missing_operand, self.operator
        )
    }
}

impl std::error::Error for TopologyError {}

/// Checks that every operator in `order` only consumes operands produced earlier in `order`.
pub fn validate_schedule(arena: &GraphArena, order: &[OperatorId]) -> Result<(), TopologyError> {
    let mut available = HashSet::new();
    for &operator in order {
        let Ok(record) = arena.operator(operator) else {
            continue;
        };
        for &input in &record.inputs {
            if !available.contains(&input) {
                return Err(TopologyError {
                    missing_operand: input,
                    operator,
                });
            }
        }
        available.extend(record.outputs.iter().copied());
    }
    Ok(())
}
