use std::sync::Arc;

use anyhow::{Context as _, Result};
use webnn_rs::graph::{
    BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions, GruOptions,
    InstanceNormOptions, InterpolationMode, LeakyReluOptions, PadOptions, PaddingMode,
    Pool2dOptions, RecurrentDirection, ReduceOptions, Resample2dOptions, SliceOptions, SplitSpec,
};
use webnn_rs::{GraphBuilder, NamedInputs, NamedOutputs, OperandDescriptor, OperandId, OperandType};
use webnn_rs_backend_ref_cpu::CpuBackend;

fn builder() -> GraphBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    GraphBuilder::new(Arc::new(CpuBackend::new()), 256)
}

fn desc(dims: &[i32]) -> OperandDescriptor {
    OperandDescriptor::new(OperandType::Float32, dims)
}

/// Builds, compiles and runs the graph once, returning the engine-allocated outputs.
fn run(
    builder: GraphBuilder,
    outputs: &[(&str, OperandId)],
    inputs: &[(&str, &[f32])],
) -> Result<NamedOutputs<'static>> {
    let mut graph = builder.build(outputs)?;
    graph.compile()?;
    let data: Vec<(&str, Vec<u8>)> = inputs
        .iter()
        .map(|(name, values)| {
            let bytes: Vec<u8> = values.iter().flat_map(|value| value.to_le_bytes()).collect();
            (*name, bytes)
        })
        .collect();
    let mut named = NamedInputs::new();
    for (name, bytes) in &data {
        named.set_bytes(*name, bytes);
    }
    let mut results = NamedOutputs::new();
    graph.compute(&named, &mut results)?;
    Ok(results)
}

fn values(outputs: &NamedOutputs<'_>, name: &str) -> Result<Vec<f32>> {
    outputs.get_f32(name).with_context(|| format!("missing output {name}"))
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-4, "element {index}: {a} vs {e}");
    }
}

#[test]
fn padding_modes_fill_the_border_differently() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[3]));
    let mut outputs = Vec::new();
    for (name, mode) in [
        ("constant", PaddingMode::Constant),
        ("edge", PaddingMode::Edge),
        ("reflection", PaddingMode::Reflection),
        ("symmetric", PaddingMode::Symmetric),
    ] {
        let padding = builder.constant_i32(&[1, 2], &[2, 2]);
        let padded = builder.pad(x, padding, PadOptions { mode, value: 9.0 });
        outputs.push((name, padded));
    }
    let results = run(builder, &outputs, &[("x", &[1.0, 2.0, 3.0])])?;

    assert_close(&values(&results, "constant")?, &[9.0, 9.0, 1.0, 2.0, 3.0, 9.0, 9.0]);
    assert_close(&values(&results, "edge")?, &[1.0, 1.0, 1.0, 2.0, 3.0, 3.0, 3.0]);
    assert_close(&values(&results, "reflection")?, &[3.0, 2.0, 1.0, 2.0, 3.0, 2.0, 1.0]);
    assert_close(&values(&results, "symmetric")?, &[2.0, 1.0, 1.0, 2.0, 3.0, 3.0, 2.0]);
    Ok(())
}

#[test]
fn reductions_collapse_the_requested_axes() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 3]));
    let rows = |keep_dimensions| ReduceOptions {
        axes: Some(vec![1]),
        keep_dimensions,
    };
    let sum = builder.reduce_sum(x, rows(false));
    let max = builder.reduce_max(x, rows(true));
    let product = builder.reduce_product(x, rows(false));
    let l1 = builder.reduce_l1(x, rows(false));
    let mean = builder.reduce_mean(x, ReduceOptions::default());
    let arg_max = builder.reduce_arg_max(x, rows(false));
    let arg_min = builder.reduce_arg_min(
        x,
        ReduceOptions {
            axes: Some(vec![0]),
            keep_dimensions: false,
        },
    );
    let results = run(
        builder,
        &[
            ("sum", sum),
            ("max", max),
            ("product", product),
            ("l1", l1),
            ("mean", mean),
            ("arg_max", arg_max),
            ("arg_min", arg_min),
        ],
        &[("x", &[1.0, 5.0, 3.0, -4.0, 2.0, 6.0])],
    )?;

    assert_close(&values(&results, "sum")?, &[9.0, 4.0]);
    assert_close(&values(&results, "max")?, &[5.0, 6.0]);
    assert_close(&values(&results, "product")?, &[15.0, -48.0]);
    assert_close(&values(&results, "l1")?, &[9.0, 12.0]);
    assert_close(&values(&results, "mean")?, &[13.0 / 6.0]);

    let indices = |name: &str| -> Result<Vec<i32>> {
        let bytes = results.get(name).with_context(|| format!("missing {name}"))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    };
    assert_eq!(indices("arg_max")?, [1, 2]);
    assert_eq!(indices("arg_min")?, [1, 1, 0]);
    Ok(())
}

#[test]
fn normalizations_use_channel_statistics() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 2, 1, 2]));
    let mean = builder.constant_f32(&[2], &[1.0, 3.0]);
    let variance = builder.constant_f32(&[2], &[1.0, 4.0]);
    let bias = builder.constant_f32(&[2], &[0.0, 10.0]);
    let batch = builder.batch_norm(
        x,
        mean,
        variance,
        BatchNormOptions {
            bias: Some(bias),
            epsilon: 0.0,
            ..BatchNormOptions::default()
        },
    );
    let instance = builder.instance_norm(x, InstanceNormOptions::default());
    let results = run(
        builder,
        &[("batch", batch), ("instance", instance)],
        &[("x", &[1.0, 2.0, 3.0, 4.0])],
    )?;

    assert_close(&values(&results, "batch")?, &[0.0, 1.0, 10.0, 10.5]);
    assert_close(&values(&results, "instance")?, &[-1.0, 1.0, -1.0, 1.0]);
    Ok(())
}

#[test]
fn channel_last_batch_norm_reads_the_trailing_axis() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 1, 2, 2]));
    let mean = builder.constant_f32(&[2], &[1.0, 2.0]);
    let variance = builder.constant_f32(&[2], &[1.0, 1.0]);
    let scale = builder.constant_f32(&[2], &[1.0, 2.0]);
    let y = builder.batch_norm(
        x,
        mean,
        variance,
        BatchNormOptions {
            scale: Some(scale),
            axis: 3,
            epsilon: 0.0,
            ..BatchNormOptions::default()
        },
    );
    let results = run(builder, &[("y", y)], &[("x", &[1.0, 2.0, 3.0, 4.0])])?;
    assert_close(&values(&results, "y")?, &[0.0, 0.0, 2.0, 4.0]);
    Ok(())
}

#[test]
fn split_slice_and_concat_move_blocks() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 4]));
    let halves = builder.split(x, SplitSpec::Count(2), 1);
    let joined = builder.concat(&[halves[1], halves[0]], 1);
    let sliced = builder.slice(x, &[1, 1], &[1, -1], SliceOptions::default());
    let column = builder.slice(
        x,
        &[-1],
        &[1],
        SliceOptions {
            axes: Some(vec![1]),
        },
    );
    let squeezed = builder.squeeze(column, None);
    let results = run(
        builder,
        &[
            ("left", halves[0]),
            ("right", halves[1]),
            ("joined", joined),
            ("sliced", sliced),
            ("squeezed", squeezed),
        ],
        &[("x", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0])],
    )?;

    assert_close(&values(&results, "left")?, &[1.0, 2.0, 5.0, 6.0]);
    assert_close(&values(&results, "right")?, &[3.0, 4.0, 7.0, 8.0]);
    assert_close(
        &values(&results, "joined")?,
        &[3.0, 4.0, 1.0, 2.0, 7.0, 8.0, 5.0, 6.0],
    );
    assert_close(&values(&results, "sliced")?, &[6.0, 7.0, 8.0]);
    assert_close(&values(&results, "squeezed")?, &[4.0, 8.0]);
    Ok(())
}

#[test]
fn resample_uses_half_pixel_centers() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 1, 2, 2]));
    let nearest = builder.resample2d(
        x,
        Resample2dOptions {
            scales: Some(vec![2.0, 2.0]),
            ..Resample2dOptions::default()
        },
    );
    let row = builder.input("row", &desc(&[1, 1, 1, 2]));
    let linear = builder.resample2d(
        row,
        Resample2dOptions {
            mode: InterpolationMode::Linear,
            sizes: Some(vec![1, 4]),
            ..Resample2dOptions::default()
        },
    );
    let results = run(
        builder,
        &[("nearest", nearest), ("linear", linear)],
        &[("x", &[1.0, 2.0, 3.0, 4.0]), ("row", &[0.0, 1.0])],
    )?;

    assert_close(
        &values(&results, "nearest")?,
        &[
            1.0, 1.0, 2.0, 2.0, //
            1.0, 1.0, 2.0, 2.0, //
            3.0, 3.0, 4.0, 4.0, //
            3.0, 3.0, 4.0, 4.0,
        ],
    );
    assert_close(&values(&results, "linear")?, &[0.0, 0.25, 0.75, 1.0]);
    Ok(())
}

fn gru_graph(direction: RecurrentDirection) -> Result<(GraphBuilder, Vec<OperandId>)> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 1, 1]));
    // Only the candidate gate sees the input.
    let weight = builder.constant_f32(&[1, 3, 1], &[0.0, 0.0, 1.0]);
    let recurrent = builder.constant_f32(&[1, 3, 1], &[0.0, 0.0, 0.0]);
    let outputs = builder.gru(
        x,
        weight,
        recurrent,
        2,
        1,
        GruOptions {
            return_sequence: true,
            direction,
            ..GruOptions::default()
        },
    );
    anyhow::ensure!(outputs.len() == 2, "gru must return state and sequence");
    Ok((builder, outputs))
}

#[test]
fn gru_accumulates_state_over_time() -> Result<()> {
    let (builder, outputs) = gru_graph(RecurrentDirection::Forward)?;
    let results = run(
        builder,
        &[("last", outputs[0]), ("sequence", outputs[1])],
        &[("x", &[1.0, 1.0])],
    )?;

    let candidate = 1.0f32.tanh();
    let first = 0.5 * candidate;
    let second = 0.5 * candidate + 0.5 * first;
    assert_close(&values(&results, "sequence")?, &[first, second]);
    assert_close(&values(&results, "last")?, &[second]);
    Ok(())
}

#[test]
fn backward_gru_stores_states_at_their_time_step() -> Result<()> {
    let (builder, outputs) = gru_graph(RecurrentDirection::Backward)?;
    let results = run(
        builder,
        &[("last", outputs[0]), ("sequence", outputs[1])],
        &[("x", &[1.0, 0.0])],
    )?;

    let state = 0.5 * 1.0f32.tanh();
    assert_close(&values(&results, "sequence")?, &[state, 0.0]);
    assert_close(&values(&results, "last")?, &[state]);
    Ok(())
}

#[test]
fn grouped_convolution_adds_bias_per_channel() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 2, 1, 2]));
    let filter = builder.constant_f32(&[2, 1, 1, 1], &[2.0, 3.0]);
    let bias = builder.constant_f32(&[2], &[1.0, -1.0]);
    let y = builder.conv2d(
        x,
        filter,
        Conv2dOptions {
            groups: 2,
            bias: Some(bias),
            ..Conv2dOptions::default()
        },
    );
    let results = run(builder, &[("y", y)], &[("x", &[1.0, 2.0, 3.0, 4.0])])?;
    assert_close(&values(&results, "y")?, &[3.0, 5.0, 8.0, 11.0]);
    Ok(())
}

#[test]
fn transposed_convolution_spreads_each_input() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 1, 2, 2]));
    let filter = builder.constant_f32(&[1, 1, 2, 2], &[1.0; 4]);
    let y = builder.conv_transpose2d(x, filter, ConvTranspose2dOptions::default());
    let results = run(builder, &[("y", y)], &[("x", &[1.0, 2.0, 3.0, 4.0])])?;
    assert_close(
        &values(&results, "y")?,
        &[1.0, 3.0, 2.0, 4.0, 10.0, 6.0, 3.0, 7.0, 4.0],
    );
    Ok(())
}

#[test]
fn l2_pooling_takes_the_window_norm() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 1, 2, 2]));
    let y = builder.l2_pool2d(x, Pool2dOptions::default());
    let results = run(builder, &[("y", y)], &[("x", &[3.0, 4.0, 0.0, 0.0])])?;
    assert_close(&values(&results, "y")?, &[5.0]);
    Ok(())
}

#[test]
fn activations_and_unary_functions() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 3]));
    let clamp = builder.clamp(
        x,
        ClampOptions {
            min_value: 0.0,
            max_value: 1.0,
        },
    );
    let leaky = builder.leaky_relu(x, LeakyReluOptions { alpha: 0.1 });
    let neg = builder.neg(x);
    let ceil = builder.ceil(x);
    let softmax = builder.softmax(x);
    let two = builder.constant_f32(&[1], &[2.0]);
    let squared = builder.pow(x, two);
    let halved = builder.div(x, two);
    let smaller = builder.min(x, two);
    let results = run(
        builder,
        &[
            ("clamp", clamp),
            ("leaky", leaky),
            ("neg", neg),
            ("ceil", ceil),
            ("softmax", softmax),
            ("squared", squared),
            ("halved", halved),
            ("smaller", smaller),
        ],
        &[("x", &[-1.0, 0.5, 3.0])],
    )?;

    assert_close(&values(&results, "clamp")?, &[0.0, 0.5, 1.0]);
    assert_close(&values(&results, "leaky")?, &[-0.1, 0.5, 3.0]);
    assert_close(&values(&results, "neg")?, &[1.0, -0.5, -3.0]);
    assert_close(&values(&results, "ceil")?, &[-1.0, 1.0, 3.0]);
    assert_close(&values(&results, "squared")?, &[1.0, 0.25, 9.0]);
    assert_close(&values(&results, "halved")?, &[-0.5, 0.25, 1.5]);
    assert_close(&values(&results, "smaller")?, &[-1.0, 0.5, 2.0]);

    let softmax = values(&results, "softmax")?;
    assert_close(&[softmax.iter().sum::<f32>()], &[1.0]);
    assert!(softmax[0] < softmax[1] && softmax[1] < softmax[2]);
    Ok(())
}

#[test]
fn backend_buffers_are_released_with_the_graph() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    {
        let mut builder = GraphBuilder::new(backend.clone(), 256);
        let x = builder.input("x", &desc(&[4]));
        let y = builder.exp(x);
        let mut graph = builder.build(&[("y", y)])?;
        graph.compile()?;
        assert_eq!(backend.graph_count(), 1);
        assert!(backend.buffer_count() > 0);
    }
    assert_eq!(backend.graph_count(), 0);
    assert_eq!(backend.buffer_count(), 0);
    Ok(())
}
