use std::sync::Arc;

use anyhow::Result;
use webnn_rs::graph::{schedule, validate_schedule};
use webnn_rs::{GraphBuilder, OperandDescriptor, OperandType, OperatorId};
use webnn_rs_backend_ref_cpu::CpuBackend;

fn builder() -> GraphBuilder {
    GraphBuilder::new(Arc::new(CpuBackend::new()), 256)
}

fn desc(dims: &[i32]) -> OperandDescriptor {
    OperandDescriptor::new(OperandType::Float32, dims)
}

#[test]
fn producers_precede_consumers_and_ties_follow_registration() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &desc(&[2]));
    let b = builder.input("b", &desc(&[2]));
    let c = builder.constant_f32(&[2], &[1.0, 2.0]);
    let x = builder.add(a, c);
    let y = builder.exp(b);
    let z = builder.mul(x, y);

    let order = schedule(builder.arena(), &[z])?;
    let ids: Vec<u32> = order.iter().map(|operator| operator.0).collect();
    assert_eq!(ids, [0, 1, 2, 3, 4, 5]);
    assert!(validate_schedule(builder.arena(), &order).is_ok());
    Ok(())
}

#[test]
fn only_operators_reaching_an_output_are_scheduled() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &desc(&[2]));
    let unused_input = builder.input("unused", &desc(&[2]));
    let _dead = builder.relu(unused_input);
    let _also_dead = builder.sigmoid(a);
    let out = builder.tanh(a);

    let order = schedule(builder.arena(), &[out])?;
    assert_eq!(order, [OperatorId(0), OperatorId(4)]);

    let graph = builder.build(&[("out", out)])?;
    assert_eq!(graph.schedule(), [OperatorId(0), OperatorId(4)]);
    assert_eq!(graph.input_names(), ["a"]);
    Ok(())
}

#[test]
fn shared_producers_are_scheduled_once() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &desc(&[3]));
    let e = builder.exp(a);
    let left = builder.add(e, e);
    let right = builder.mul(e, a);
    let joined = builder.sub(left, right);

    let order = schedule(builder.arena(), &[joined, left])?;
    assert_eq!(order.len(), 5);
    let position = |id: u32| order.iter().position(|op| op.0 == id);
    assert!(position(1) < position(2));
    assert!(position(1) < position(3));
    assert!(position(3) < position(4));
    Ok(())
}

#[test]
fn out_of_order_schedules_are_rejected() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &desc(&[2]));
    let e = builder.exp(a);
    let r = builder.relu(e);

    let mut order = schedule(builder.arena(), &[r])?;
    order.swap(1, 2);
    let err = validate_schedule(builder.arena(), &order).unwrap_err();
    assert_eq!(err.operator, OperatorId(2));
    assert_eq!(err.missing_operand, e);
    Ok(())
}

#[test]
fn poisoned_outputs_cannot_be_scheduled() {
    let mut builder = builder();
    let a = builder.input("a", &desc(&[2]));
    let b = builder.input("b", &desc(&[3]));
    let bad = builder.add(a, b);
    assert!(schedule(builder.arena(), &[bad]).is_err());
}
