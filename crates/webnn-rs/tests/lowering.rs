use std::sync::Arc;

use anyhow::{Context as _, Result};
use webnn_rs::graph::{Conv2dOptions, FusedActivation, PadOptions};
use webnn_rs::native::graph::NativeEdge;
use webnn_rs::native::primitive::{ElementWiseFunction, NativeActivation};
use webnn_rs::native::{NativeGraph, Primitive};
use webnn_rs::{ErrorKind, Graph, GraphBuilder, OperandDescriptor, OperandType};
use webnn_rs_backend_ref_cpu::CpuBackend;

fn builder() -> GraphBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    GraphBuilder::new(Arc::new(CpuBackend::new()), 256)
}

fn desc(dims: &[i32]) -> OperandDescriptor {
    OperandDescriptor::new(OperandType::Float32, dims)
}

fn compiled(builder: GraphBuilder, outputs: &[(&str, webnn_rs::OperandId)]) -> Result<Graph> {
    let mut graph = builder.build(outputs)?;
    graph.compile()?;
    Ok(graph)
}

fn native(graph: &Graph) -> Result<&NativeGraph> {
    graph.native_graph().context("graph is not compiled")
}

fn primitives(native: &NativeGraph) -> Vec<&Primitive> {
    native.operators.iter().map(|op| &op.primitive).collect()
}

#[test]
fn hard_swish_is_emulated_with_element_wise_nodes() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 3]));
    let y = builder.hard_swish(x);
    let graph = compiled(builder, &[("y", y)])?;
    let native = native(&graph)?;

    let expected = [
        ElementWiseFunction::Add,
        ElementWiseFunction::Min,
        ElementWiseFunction::Max,
        ElementWiseFunction::Multiply,
        ElementWiseFunction::Divide,
    ];
    let functions: Vec<_> = primitives(native)
        .into_iter()
        .map(|primitive| match primitive {
            Primitive::ElementWise(function) => Some(*function),
            _ => None,
        })
        .collect();
    assert_eq!(functions, expected.map(Some));
    assert_eq!(native.constant_inputs().count(), 3);
    assert_eq!(native.non_constant_inputs().count(), 1);
    for (_, constant) in native.constant_inputs() {
        assert_eq!(constant.desc.element_count(), 1);
    }
    Ok(())
}

#[test]
fn reshape_only_rewrites_the_descriptor() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 3, 4]));
    let e = builder.exp(x);
    let r = builder.reshape(e, &[6, 4]);
    let graph = compiled(builder, &[("r", r)])?;
    let native = native(&graph)?;

    assert_eq!(
        primitives(native),
        [&Primitive::ElementWise(ElementWiseFunction::Exp)]
    );
    assert_eq!(native.outputs[0].desc.dims, [6, 4]);
    Ok(())
}

#[test]
fn transposed_outputs_are_materialized() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 3]));
    let e = builder.exp(x);
    let t = builder.transpose(e, None);
    let graph = compiled(builder, &[("t", t)])?;
    let native = native(&graph)?;

    assert_eq!(native.operators.len(), 2);
    assert_eq!(
        native.operators[1].primitive,
        Primitive::ElementWise(ElementWiseFunction::Identity)
    );
    let view = native.operators[1].inputs[0].as_ref().context("identity input")?;
    assert_eq!(view.dims, [3, 2]);
    assert!(!view.is_contiguous());
    assert!(native.outputs[0].desc.is_contiguous());
    Ok(())
}

#[test]
fn graph_inputs_exposed_as_outputs_get_a_copy() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[4]));
    let y = builder.relu(x);
    let graph = compiled(builder, &[("echo", x), ("y", y)])?;
    let native = native(&graph)?;

    assert_eq!(native.operators.len(), 2);
    let echo = native.output_index("echo").context("echo output")? as u32;
    let producer = native
        .edges
        .iter()
        .find_map(|edge| match edge {
            NativeEdge::Output {
                from_operator,
                graph_output,
                ..
            } if *graph_output == echo => Some(*from_operator),
            _ => None,
        })
        .context("echo has no producing edge")?;
    assert_eq!(
        native.operators[producer as usize].primitive,
        Primitive::ElementWise(ElementWiseFunction::Identity)
    );
    Ok(())
}

#[test]
fn pad_routes_its_padding_constant_to_an_unrequested_output() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 2]));
    let padding = builder.constant_i32(&[2, 2], &[1, 0, 0, 2]);
    let y = builder.pad(x, padding, PadOptions::default());
    let graph = compiled(builder, &[("y", y)])?;
    let native = native(&graph)?;

    assert_eq!(native.outputs.len(), 2);
    let y_index = native.output_index("y").context("y output")?;
    assert!(native.outputs[y_index].requested);
    assert_eq!(native.outputs[y_index].desc.dims, [3, 4]);
    let sink = native
        .outputs
        .iter()
        .find(|output| !output.requested)
        .context("padding sink")?;
    assert!(sink.name.starts_with("__pad_"));
    assert_eq!(graph.output_names().collect::<Vec<_>>(), ["y"]);
    Ok(())
}

#[test]
fn every_graph_input_feeds_an_edge() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 1, 3, 3]));
    let filter = builder.constant_f32(&[1, 1, 2, 2], &[1.0, 0.0, 0.0, 1.0]);
    let conv = builder.conv2d(x, filter, Conv2dOptions::default());
    let graph = compiled(builder, &[("conv", conv)])?;
    let native = native(&graph)?;

    for index in 0..native.inputs.len() as u32 {
        let used = native.edges.iter().any(|edge| {
            matches!(edge, NativeEdge::Input { graph_input, .. } if *graph_input == index)
        });
        assert!(used, "graph input {index} has no edge");
    }
    Ok(())
}

#[test]
fn supported_activations_fuse_into_convolution() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 1, 3, 3]));
    let filter = builder.constant_f32(&[1, 1, 2, 2], &[1.0; 4]);
    let relu = builder.conv2d(
        x,
        filter,
        Conv2dOptions {
            activation: Some(FusedActivation::Relu),
            ..Conv2dOptions::default()
        },
    );
    let clamped = builder.conv2d(
        x,
        filter,
        Conv2dOptions {
            activation: Some(FusedActivation::Clamp {
                min_value: 0.0,
                max_value: 6.0,
            }),
            ..Conv2dOptions::default()
        },
    );
    let graph = compiled(builder, &[("relu", relu), ("clamped", clamped)])?;
    let native = native(&graph)?;

    let fused: Vec<_> = native
        .operators
        .iter()
        .filter_map(|op| match &op.primitive {
            Primitive::Convolution {
                fused_activation, ..
            } => Some(*fused_activation),
            _ => None,
        })
        .collect();
    assert_eq!(fused, [Some(NativeActivation::Relu), None]);
    assert!(native
        .operators
        .iter()
        .any(|op| matches!(op.primitive, Primitive::Clip { .. })));
    Ok(())
}

#[test]
fn nhwc_convolution_is_lowered_through_views() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 3, 3, 2]));
    let filter = builder.constant_f32(&[4, 2, 2, 2], &[0.25; 32]);
    let conv = builder.conv2d(
        x,
        filter,
        Conv2dOptions {
            input_layout: webnn_rs::graph::InputOperandLayout::Nhwc,
            filter_layout: webnn_rs::graph::Conv2dFilterOperandLayout::Ohwi,
            ..Conv2dOptions::default()
        },
    );
    let graph = compiled(builder, &[("conv", conv)])?;
    let native = native(&graph)?;

    let conv_op = native
        .operators
        .iter()
        .find(|op| matches!(op.primitive, Primitive::Convolution { .. }))
        .context("convolution operator")?;
    let input = conv_op.inputs[0].as_ref().context("convolution input")?;
    assert_eq!(input.dims, [1, 2, 3, 3]);
    assert_eq!(graph.output_spec("conv")?.dims(), [1, 2, 2, 4]);
    Ok(())
}

#[test]
fn eight_bit_operands_fail_to_lower() {
    let mut builder = builder();
    let x = builder.input("x", &OperandDescriptor::new(OperandType::Int8, [4]));
    let y = builder.abs(x);
    let mut graph = builder.build(&[("y", y)]).expect("int8 passes validation");
    let err = graph.compile().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lowering);
    assert_eq!(graph.error(), Some(&err));
    assert!(graph.compile().is_err());
}

#[test]
fn compiling_twice_is_rejected_without_poisoning() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2]));
    let y = builder.exp(x);
    let mut graph = compiled(builder, &[("y", y)])?;

    let err = graph.compile().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(graph.is_compiled());
    assert!(graph.error().is_none());
    Ok(())
}
