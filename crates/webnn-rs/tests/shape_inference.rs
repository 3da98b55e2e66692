use std::sync::Arc;

use anyhow::Result;
use webnn_rs::graph::{
    AutoPad, Conv2dOptions, ConvTranspose2dOptions, GemmOptions, GruOptions, PadOptions,
    Pool2dOptions, ReduceOptions, RecurrentDirection, RoundingType, SplitSpec,
};
use webnn_rs::{ErrorKind, GraphBuilder, OperandDescriptor, OperandType};
use webnn_rs_backend_ref_cpu::CpuBackend;

fn builder() -> GraphBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    GraphBuilder::new(Arc::new(CpuBackend::new()), 256)
}

fn f32_desc(dims: &[i32]) -> OperandDescriptor {
    OperandDescriptor::new(OperandType::Float32, dims)
}

#[test]
fn binary_operands_broadcast_from_the_trailing_axis() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2, 1, 3]));
    let b = builder.input("b", &f32_desc(&[4, 1]));
    let sum = builder.add(a, b);
    assert_eq!(builder.spec(sum)?.dims(), [2, 4, 3]);

    let c = builder.input("c", &f32_desc(&[2, 5]));
    let bad = builder.mul(a, c);
    let err = builder.spec(bad).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.message().contains("broadcast"), "{err}");
    Ok(())
}

#[test]
fn binary_operands_must_share_a_type() {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2]));
    let b = builder.input("b", &OperandDescriptor::new(OperandType::Int32, [2]));
    let sum = builder.add(a, b);
    assert_eq!(builder.spec(sum).unwrap_err().kind(), ErrorKind::Validation);
}

#[test]
fn concat_sums_the_joined_axis() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2, 3]));
    let b = builder.input("b", &f32_desc(&[2, 4]));
    let joined = builder.concat(&[a, b], 1);
    assert_eq!(builder.spec(joined)?.dims(), [2, 7]);

    let mismatched = builder.concat(&[a, b], 0);
    assert!(builder.spec(mismatched).is_err());
    let out_of_range = builder.concat(&[a, b], 2);
    assert!(builder.spec(out_of_range).is_err());
    Ok(())
}

#[test]
fn conv2d_output_follows_padding_and_strides() -> Result<()> {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[1, 3, 4, 4]));
    let filter = builder.constant_f32(&[8, 3, 3, 3], &[0.5; 8 * 3 * 3 * 3]);
    let valid = builder.conv2d(input, filter, Conv2dOptions::default());
    assert_eq!(builder.spec(valid)?.dims(), [1, 8, 2, 2]);

    let padded = builder.conv2d(
        input,
        filter,
        Conv2dOptions {
            padding: vec![1, 1, 1, 1],
            ..Conv2dOptions::default()
        },
    );
    assert_eq!(builder.spec(padded)?.dims(), [1, 8, 4, 4]);

    let wide = builder.input("wide", &f32_desc(&[1, 3, 5, 5]));
    let same = builder.conv2d(
        wide,
        filter,
        Conv2dOptions {
            strides: vec![2, 2],
            auto_pad: AutoPad::SameUpper,
            ..Conv2dOptions::default()
        },
    );
    assert_eq!(builder.spec(same)?.dims(), [1, 8, 3, 3]);
    Ok(())
}

#[test]
fn conv2d_rejects_mismatched_channels() {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[1, 2, 4, 4]));
    let filter = builder.constant_f32(&[1, 3, 1, 1], &[1.0; 3]);
    let out = builder.conv2d(input, filter, Conv2dOptions::default());
    assert_eq!(builder.spec(out).unwrap_err().kind(), ErrorKind::Validation);
}

#[test]
fn gemm_multiplies_inner_dimensions() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2, 3]));
    let b = builder.input("b", &f32_desc(&[3, 4]));
    let product = builder.gemm(a, b, GemmOptions::default());
    assert_eq!(builder.spec(product)?.dims(), [2, 4]);

    let transposed = builder.gemm(
        b,
        a,
        GemmOptions {
            a_transpose: true,
            b_transpose: true,
            ..GemmOptions::default()
        },
    );
    assert_eq!(builder.spec(transposed)?.dims(), [4, 2]);

    let mismatched = builder.gemm(a, a, GemmOptions::default());
    assert!(builder.spec(mismatched).is_err());
    Ok(())
}

#[test]
fn matmul_broadcasts_batch_dimensions() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[5, 2, 3]));
    let b = builder.input("b", &f32_desc(&[3, 4]));
    let product = builder.matmul(a, b);
    assert_eq!(builder.spec(product)?.dims(), [5, 2, 4]);

    let v = builder.input("v", &f32_desc(&[3]));
    let row = builder.matmul(v, b);
    assert_eq!(builder.spec(row)?.dims(), [1, 4]);
    Ok(())
}

#[test]
fn reduce_drops_or_keeps_reduced_axes() -> Result<()> {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[2, 3, 4]));
    let last = builder.reduce_sum(
        input,
        ReduceOptions {
            axes: Some(vec![-1]),
            keep_dimensions: false,
        },
    );
    assert_eq!(builder.spec(last)?.dims(), [2, 3]);

    let kept = builder.reduce_mean(
        input,
        ReduceOptions {
            axes: Some(vec![0, 2]),
            keep_dimensions: true,
        },
    );
    assert_eq!(builder.spec(kept)?.dims(), [1, 3, 1]);

    let arg = builder.reduce_arg_max(
        input,
        ReduceOptions {
            axes: Some(vec![1]),
            keep_dimensions: false,
        },
    );
    assert_eq!(builder.spec(arg)?.ty, OperandType::Int32);

    let duplicate = builder.reduce_max(
        input,
        ReduceOptions {
            axes: Some(vec![1, -2]),
            keep_dimensions: false,
        },
    );
    assert!(builder.spec(duplicate).is_err());
    Ok(())
}

#[test]
fn reduce_axes_outside_the_rank_are_rejected() {
    for axes in [vec![3], vec![-4]] {
        let mut builder = builder();
        let input = builder.input("x", &f32_desc(&[2, 3, 4]));
        let out = builder.reduce_sum(
            input,
            ReduceOptions {
                axes: Some(axes.clone()),
                keep_dimensions: false,
            },
        );
        assert_eq!(builder.spec(out).unwrap_err().kind(), ErrorKind::Validation);
        let err = match builder.build(&[("out", out)]) {
            Ok(_) => panic!("reduce over axes {axes:?} must not build"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.message().contains("out of range"), "{err}");
    }
}

#[test]
fn padding_that_overflows_a_dimension_is_rejected() {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[2]));
    let bytes: Vec<u8> = [u32::MAX, 1]
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect();
    let padding = builder.constant(&OperandDescriptor::new(OperandType::Uint32, [1, 2]), &bytes);
    let padded = builder.pad(input, padding, PadOptions::default());
    assert_eq!(builder.spec(padded).unwrap_err().kind(), ErrorKind::Validation);

    let err = match builder.build(&[("padded", padded)]) {
        Ok(_) => panic!("overflowing padding must not build"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.message().contains("overflows"), "{err}");
}

#[test]
fn oversized_conv2d_groups_are_rejected() {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[1, 2, 4, 4]));
    let filter = builder.constant_f32(&[2, 2, 1, 1], &[1.0; 4]);
    let out = builder.conv2d(
        input,
        filter,
        Conv2dOptions {
            groups: u32::MAX,
            ..Conv2dOptions::default()
        },
    );
    assert_eq!(builder.spec(out).unwrap_err().kind(), ErrorKind::Validation);
    let err = match builder.build(&[("out", out)]) {
        Ok(_) => panic!("oversized groups must not build"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn conv_transpose2d_output_channels_must_fit() {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[1, 65536, 1, 1]));
    let filter = builder.input("w", &f32_desc(&[65536, 65536, 1, 1]));
    let out = builder.conv_transpose2d(
        input,
        filter,
        ConvTranspose2dOptions {
            groups: 65536,
            ..ConvTranspose2dOptions::default()
        },
    );
    let err = builder.spec(out).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.message().contains("overflow"), "{err}");
}

#[test]
fn pool_rounding_selects_floor_or_ceil() -> Result<()> {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[1, 1, 5, 5]));
    let options = Pool2dOptions {
        window_dimensions: Some(vec![2, 2]),
        strides: vec![2, 2],
        ..Pool2dOptions::default()
    };
    let floor = builder.max_pool2d(input, options.clone());
    assert_eq!(builder.spec(floor)?.dims(), [1, 1, 2, 2]);

    let ceil = builder.average_pool2d(
        input,
        Pool2dOptions {
            rounding_type: RoundingType::Ceil,
            ..options.clone()
        },
    );
    assert_eq!(builder.spec(ceil)?.dims(), [1, 1, 3, 3]);

    let sized = builder.l2_pool2d(
        input,
        Pool2dOptions {
            output_sizes: Some(vec![3, 3]),
            ..options.clone()
        },
    );
    assert_eq!(builder.spec(sized)?.dims(), [1, 1, 3, 3]);

    let bad_size = builder.max_pool2d(
        input,
        Pool2dOptions {
            output_sizes: Some(vec![4, 4]),
            ..options
        },
    );
    assert!(builder.spec(bad_size).is_err());

    let global = builder.average_pool2d(input, Pool2dOptions::default());
    assert_eq!(builder.spec(global)?.dims(), [1, 1, 1, 1]);
    Ok(())
}

#[test]
fn reshape_infers_a_single_free_dimension() -> Result<()> {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[2, 3, 4]));
    let reshaped = builder.reshape(input, &[4, -1]);
    assert_eq!(builder.spec(reshaped)?.dims(), [4, 6]);

    let two_free = builder.reshape(input, &[-1, -1]);
    assert!(builder.spec(two_free).is_err());
    let wrong_count = builder.reshape(input, &[5, 5]);
    assert!(builder.spec(wrong_count).is_err());
    Ok(())
}

#[test]
fn transpose_reverses_axes_by_default() -> Result<()> {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[2, 3, 4]));
    let reversed = builder.transpose(input, None);
    assert_eq!(builder.spec(reversed)?.dims(), [4, 3, 2]);

    let permuted = builder.transpose(input, Some(&[1, 0, 2]));
    assert_eq!(builder.spec(permuted)?.dims(), [3, 2, 4]);

    let repeated = builder.transpose(input, Some(&[0, 0, 1]));
    assert!(builder.spec(repeated).is_err());
    Ok(())
}

#[test]
fn split_produces_one_operand_per_part() -> Result<()> {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[6, 4]));
    let even = builder.split(input, SplitSpec::Count(3), 0);
    assert_eq!(even.len(), 3);
    for part in &even {
        assert_eq!(builder.spec(*part)?.dims(), [2, 4]);
    }

    let sized = builder.split(input, SplitSpec::Sizes(vec![1, 3]), -1);
    assert_eq!(builder.spec(sized[0])?.dims(), [6, 1]);
    assert_eq!(builder.spec(sized[1])?.dims(), [6, 3]);

    let uneven = builder.split(input, SplitSpec::Count(4), 0);
    assert!(!uneven.is_empty());
    assert!(uneven.iter().all(|&part| builder.spec(part).is_err()));
    Ok(())
}

#[test]
fn gru_reports_last_state_and_optional_sequence() -> Result<()> {
    let mut builder = builder();
    let (steps, batch, input_size, hidden) = (3, 2, 4, 5);
    let input = builder.input("x", &f32_desc(&[steps, batch, input_size]));
    let weight = builder.input("w", &f32_desc(&[2, 3 * hidden, input_size]));
    let recurrent = builder.input("r", &f32_desc(&[2, 3 * hidden, hidden]));
    let outputs = builder.gru(
        input,
        weight,
        recurrent,
        steps as u32,
        hidden as u32,
        GruOptions {
            return_sequence: true,
            direction: RecurrentDirection::Both,
            ..GruOptions::default()
        },
    );
    assert_eq!(outputs.len(), 2);
    assert_eq!(builder.spec(outputs[0])?.dims(), [2, 2, 5]);
    assert_eq!(builder.spec(outputs[1])?.dims(), [3, 2, 2, 5]);

    let forward_only = builder.gru(
        input,
        weight,
        recurrent,
        steps as u32,
        hidden as u32,
        GruOptions::default(),
    );
    assert!(forward_only.iter().all(|&out| builder.spec(out).is_err()));
    Ok(())
}

#[test]
fn descriptors_reject_negative_dimensions() {
    let mut builder = builder();
    let input = builder.input("x", &f32_desc(&[2, -1]));
    assert_eq!(builder.spec(input).unwrap_err().kind(), ErrorKind::Validation);
}

#[test]
fn input_names_must_be_unique() {
    let mut builder = builder();
    let first = builder.input("x", &f32_desc(&[2]));
    let second = builder.input("x", &f32_desc(&[2]));
    assert!(builder.spec(first).is_ok());
    let err = builder.spec(second).unwrap_err();
    assert!(err.message().contains("already used"), "{err}");
}

#[test]
fn constants_must_match_their_byte_length() {
    let mut builder = builder();
    let constant = builder.constant(&f32_desc(&[2, 2]), &[0u8; 12]);
    assert_eq!(builder.spec(constant).unwrap_err().kind(), ErrorKind::Validation);
}

#[test]
fn errors_propagate_without_being_recorded_twice() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2, 3]));
    let b = builder.input("b", &f32_desc(&[4]));
    let bad = builder.add(a, b);
    let relu = builder.relu(bad);
    let downstream = builder.mul(relu, a);
    let healthy = builder.exp(a);

    assert_eq!(builder.errors().len(), 1);
    let original = builder.spec(bad).unwrap_err();
    assert_eq!(builder.spec(downstream).unwrap_err(), original);
    assert!(builder.spec(healthy).is_ok());

    let err = match builder.build(&[("out", downstream)]) {
        Ok(_) => anyhow::bail!("building a poisoned output must fail"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.message().starts_with("output out"), "{err}");
    Ok(())
}

#[test]
fn unrequested_errors_do_not_block_build() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2, 3]));
    let b = builder.input("b", &f32_desc(&[4]));
    let _unused = builder.add(a, b);
    let healthy = builder.exp(a);
    let graph = builder.build(&[("out", healthy)])?;
    assert_eq!(graph.input_names(), ["a"]);
    Ok(())
}

#[test]
fn build_requires_a_graph_input() {
    let mut builder = builder();
    let a = builder.constant_f32(&[2], &[1.0, 2.0]);
    let b = builder.constant_f32(&[2], &[3.0, 4.0]);
    let sum = builder.add(a, b);
    let err = match builder.build(&[("sum", sum)]) {
        Ok(_) => panic!("a constant-only graph must not build"),
        Err(err) => err,
    };
    assert!(err.message().contains("Model inputs must be set"), "{err}");
}

#[test]
fn build_rejects_empty_output_lists() {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2]));
    let _ = builder.exp(a);
    assert!(builder.build(&[]).is_err());
}

#[test]
fn build_rejects_duplicate_output_names() {
    let mut builder = builder();
    let a = builder.input("a", &f32_desc(&[2]));
    let b = builder.exp(a);
    let err = match builder.build(&[("y", b), ("y", a)]) {
        Ok(_) => panic!("duplicate output names must not build"),
        Err(err) => err,
    };
    assert!(err.message().contains("used twice"), "{err}");
}
