use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use half::f16;
use webnn_rs::backend::{BufferId, BufferUsage, CompiledGraphId, CompiledGraphInfo};
use webnn_rs::exec::resource::grown_capacity;
use webnn_rs::exec::{BindingTable, PoolBuffer};
use webnn_rs::graph::{Conv2dOptions, GemmOptions, Pool2dOptions};
use webnn_rs::native::{NativeActivation, NativeGraph, NativeOperator};
use webnn_rs::{
    BackendError, BackendResult, ErrorKind, Graph, GraphBuilder, Input, NamedInputs,
    NamedOutputs, NativeBackend, OperandDescriptor, OperandId, OperandType,
};
use webnn_rs_backend_ref_cpu::CpuBackend;

/// Delegates to the CPU backend and reports a lost device while `lost` is set.
///
/// `failing_init` makes graph initialization fail instead.
struct FlakyBackend {
    inner: Arc<CpuBackend>,
    lost: AtomicBool,
    failing_init: AtomicBool,
    dispatches: AtomicUsize,
}

impl FlakyBackend {
    fn new() -> Self {
        FlakyBackend {
            inner: Arc::new(CpuBackend::new()),
            lost: AtomicBool::new(false),
            failing_init: AtomicBool::new(false),
            dispatches: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }
}

impl NativeBackend for FlakyBackend {
    fn backend_name(&self) -> &str {
        "cpu-flaky"
    }

    fn supports_fused_activation(&self, activation: &NativeActivation) -> bool {
        self.inner.supports_fused_activation(activation)
    }

    fn validate_operator(&self, operator: &NativeOperator) -> BackendResult<()> {
        self.inner.validate_operator(operator)
    }

    fn compile_graph(&self, graph: &NativeGraph) -> BackendResult<CompiledGraphInfo> {
        self.inner.compile_graph(graph)
    }

    fn release_graph(&self, graph: CompiledGraphId) {
        self.inner.release_graph(graph)
    }

    fn allocate_buffer(&self, bytes: u64, usage: BufferUsage) -> BackendResult<BufferId> {
        self.inner.allocate_buffer(bytes, usage)
    }

    fn release_buffer(&self, buffer: BufferId) {
        self.inner.release_buffer(buffer)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> BackendResult<()> {
        self.inner.write_buffer(buffer, offset, data)
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> BackendResult<()> {
        self.inner.read_buffer(buffer, offset, out)
    }

    fn copy_buffer(
        &self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        bytes: u64,
    ) -> BackendResult<()> {
        self.inner
            .copy_buffer(src, src_offset, dst, dst_offset, bytes)
    }

    fn initialize_graph(
        &self,
        graph: CompiledGraphId,
        bindings: &BindingTable,
    ) -> BackendResult<()> {
        if self.failing_init.load(Ordering::SeqCst) {
            return Err(BackendError::execution("constant upload rejected"));
        }
        self.inner.initialize_graph(graph, bindings)
    }

    fn dispatch(&self, graph: CompiledGraphId, bindings: &BindingTable) -> BackendResult<()> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        if self.lost.load(Ordering::SeqCst) {
            return Err(BackendError::device_lost("adapter reset"));
        }
        self.inner.dispatch(graph, bindings)
    }

    fn wait_for_completion(&self) -> BackendResult<()> {
        self.inner.wait_for_completion()
    }
}

fn builder() -> GraphBuilder {
    let _ = env_logger::builder().is_test(true).try_init();
    GraphBuilder::new(Arc::new(CpuBackend::new()), 256)
}

fn desc(dims: &[i32]) -> OperandDescriptor {
    OperandDescriptor::new(OperandType::Float32, dims)
}

fn bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn compiled(builder: GraphBuilder, outputs: &[(&str, OperandId)]) -> Result<Graph> {
    let mut graph = builder.build(outputs)?;
    graph.compile()?;
    Ok(graph)
}

/// Runs a single-input, single-output graph and returns the output values.
fn run(graph: &mut Graph, input: &str, values: &[f32], output: &str) -> Result<Vec<f32>> {
    let data = bytes(values);
    let mut inputs = NamedInputs::new();
    inputs.set_bytes(input, &data);
    let mut outputs = NamedOutputs::new();
    graph.compute(&inputs, &mut outputs)?;
    Ok(outputs.get_f32(output).unwrap_or_default())
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
    for (index, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= 1e-4, "element {index}: {a} vs {e}");
    }
}

#[test]
fn add_broadcasts_a_constant_row() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &desc(&[2, 3]));
    let b = builder.constant_f32(&[3], &[10.0, 20.0, 30.0]);
    let sum = builder.add(a, b);
    let mut graph = compiled(builder, &[("sum", sum)])?;

    let result = run(&mut graph, "a", &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], "sum")?;
    assert_close(&result, &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    Ok(())
}

#[test]
fn convolution_and_pooling_slide_over_the_input() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1, 1, 3, 3]));
    let filter = builder.constant_f32(&[1, 1, 2, 2], &[1.0; 4]);
    let conv = builder.conv2d(x, filter, Conv2dOptions::default());
    let window = Pool2dOptions {
        window_dimensions: Some(vec![2, 2]),
        ..Pool2dOptions::default()
    };
    let max = builder.max_pool2d(x, window.clone());
    let avg = builder.average_pool2d(x, window);
    let mut graph = compiled(builder, &[("conv", conv), ("max", max), ("avg", avg)])?;

    let data = bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]);
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &data);
    let mut outputs = NamedOutputs::new();
    graph.compute(&inputs, &mut outputs)?;

    assert_close(&outputs.get_f32("conv").unwrap_or_default(), &[12.0, 16.0, 24.0, 28.0]);
    assert_close(&outputs.get_f32("max").unwrap_or_default(), &[5.0, 6.0, 8.0, 9.0]);
    assert_close(&outputs.get_f32("avg").unwrap_or_default(), &[3.0, 4.0, 6.0, 7.0]);
    Ok(())
}

#[test]
fn gemm_and_matmul_agree_on_the_product() -> Result<()> {
    let mut builder = builder();
    let a = builder.input("a", &desc(&[2, 3]));
    let b = builder.constant_f32(&[3, 2], &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    let c = builder.constant_f32(&[2], &[0.5, -0.5]);
    let gemm = builder.gemm(
        a,
        b,
        GemmOptions {
            c: Some(c),
            alpha: 2.0,
            ..GemmOptions::default()
        },
    );
    let matmul = builder.matmul(a, b);
    let mut graph = compiled(builder, &[("gemm", gemm), ("matmul", matmul)])?;

    let data = bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("a", &data);
    let mut outputs = NamedOutputs::new();
    graph.compute(&inputs, &mut outputs)?;

    assert_close(&outputs.get_f32("matmul").unwrap_or_default(), &[4.0, 5.0, 10.0, 11.0]);
    assert_close(&outputs.get_f32("gemm").unwrap_or_default(), &[8.5, 9.5, 20.5, 21.5]);
    Ok(())
}

#[test]
fn transposed_views_are_copied_into_outputs() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 3]));
    let t = builder.transpose(x, None);
    let r = builder.reshape(t, &[6]);
    let mut graph = compiled(builder, &[("t", t), ("r", r)])?;

    let data = bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &data);
    let mut outputs = NamedOutputs::new();
    graph.compute(&inputs, &mut outputs)?;

    let expected = [1.0, 4.0, 2.0, 5.0, 3.0, 6.0];
    assert_close(&outputs.get_f32("t").unwrap_or_default(), &expected);
    assert_close(&outputs.get_f32("r").unwrap_or_default(), &expected);
    Ok(())
}

#[test]
fn repeated_computes_are_deterministic() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2, 2]));
    let s = builder.sigmoid(x);
    let h = builder.hard_swish(s);
    let mut graph = compiled(builder, &[("h", h)])?;

    let data = bytes(&[-1.0, 0.0, 0.5, 2.0]);
    let mut first = vec![0u8; 16];
    let mut second = vec![0u8; 16];
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &data);
    {
        let mut outputs = NamedOutputs::new();
        outputs.set("h", &mut first);
        graph.compute(&inputs, &mut outputs)?;
    }
    {
        let mut outputs = NamedOutputs::new();
        outputs.set("h", &mut second);
        graph.compute(&inputs, &mut outputs)?;
    }
    assert_eq!(first, second);
    assert!(first.iter().any(|&byte| byte != 0));
    Ok(())
}

#[test]
fn unset_outputs_are_allocated_by_the_engine() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[3]));
    let y = builder.neg(x);
    let z = builder.abs(x);
    let mut graph = compiled(builder, &[("y", y), ("z", z)])?;

    let data = bytes(&[1.0, -2.0, 3.0]);
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &data);
    let mut provided = vec![0u8; 12];
    let mut outputs = NamedOutputs::new();
    outputs.set("y", &mut provided);
    graph.compute(&inputs, &mut outputs)?;

    assert_close(&outputs.get_f32("z").unwrap_or_default(), &[1.0, 2.0, 3.0]);
    let owned = outputs.take("z").unwrap_or_default();
    assert_eq!(owned.len(), 12);
    assert!(outputs.take("y").is_none());
    drop(outputs);
    assert_eq!(provided, bytes(&[-1.0, 2.0, -3.0]));
    Ok(())
}

#[test]
fn inputs_can_start_at_a_byte_offset() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2]));
    let y = builder.exp(x);
    let mut graph = compiled(builder, &[("y", y)])?;

    let mut data = vec![0xffu8; 4];
    data.extend(bytes(&[0.0, 1.0]));
    let mut inputs = NamedInputs::new();
    inputs.set("x", Input::with_offset(&data, 4));
    let mut outputs = NamedOutputs::new();
    graph.compute(&inputs, &mut outputs)?;
    assert_close(
        &outputs.get_f32("y").unwrap_or_default(),
        &[1.0, std::f32::consts::E],
    );

    let mut inputs = NamedInputs::new();
    inputs.set("x", Input::with_offset(&data, 2));
    let err = graph.compute(&inputs, &mut NamedOutputs::new()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.message().contains("has 10 bytes, expected 8"), "{err}");
    Ok(())
}

#[test]
fn half_precision_graphs_round_trip_through_f16() -> Result<()> {
    let mut builder = builder();
    let half_desc = OperandDescriptor::new(OperandType::Float16, [4]);
    let x = builder.input("x", &half_desc);
    let y = builder.relu(x);
    let mut graph = compiled(builder, &[("y", y)])?;

    let data: Vec<u8> = [-1.5f32, 0.25, 2.0, -0.0]
        .iter()
        .flat_map(|&value| f16::from_f32(value).to_le_bytes())
        .collect();
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &data);
    let mut outputs = NamedOutputs::new();
    graph.compute(&inputs, &mut outputs)?;

    let values: Vec<f32> = outputs
        .get("y")
        .unwrap_or_default()
        .chunks_exact(2)
        .map(|chunk| f16::from_le_bytes([chunk[0], chunk[1]]).to_f32())
        .collect();
    assert_close(&values, &[0.0, 0.25, 2.0, 0.0]);
    Ok(())
}

#[test]
fn compute_before_compile_is_rejected() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2]));
    let y = builder.exp(x);
    let mut graph = builder.build(&[("y", y)])?;

    let err = run(&mut graph, "x", &[1.0, 2.0], "y").unwrap_err();
    let err = err.downcast::<webnn_rs::WebnnError>()?;
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(graph.error().is_none());

    graph.compile()?;
    assert_close(
        &run(&mut graph, "x", &[0.0, 0.0], "y")?,
        &[1.0, 1.0],
    );
    Ok(())
}

#[test]
fn bad_bindings_fail_without_poisoning_the_graph() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[2]));
    let y = builder.relu(x);
    let mut graph = compiled(builder, &[("y", y)])?;
    let good = bytes(&[-1.0, 1.0]);

    let mut outputs = NamedOutputs::new();
    let err = graph.compute(&NamedInputs::new(), &mut outputs).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.message().contains("not set"), "{err}");

    let short = bytes(&[1.0]);
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &short);
    let err = graph.compute(&inputs, &mut outputs).unwrap_err();
    assert!(err.message().contains("bytes"), "{err}");

    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &good).set_bytes("extra", &good);
    let err = graph.compute(&inputs, &mut outputs).unwrap_err();
    assert!(err.message().contains("unknown input"), "{err}");

    let mut wrong_size = vec![0u8; 4];
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &good);
    let mut sized = NamedOutputs::new();
    sized.set("y", &mut wrong_size);
    assert!(graph.compute(&inputs, &mut sized).is_err());

    let mut unknown = vec![0u8; 8];
    let mut named = NamedOutputs::new();
    named.set("nope", &mut unknown);
    assert!(graph.compute(&inputs, &mut named).is_err());

    assert!(graph.error().is_none());
    assert_close(&run(&mut graph, "x", &[-1.0, 1.0], "y")?, &[0.0, 1.0]);
    Ok(())
}

#[test]
fn device_loss_poisons_the_graph() -> Result<()> {
    let backend = Arc::new(FlakyBackend::new());
    let mut builder = GraphBuilder::new(backend.clone(), 256);
    let x = builder.input("x", &desc(&[2]));
    let y = builder.exp(x);
    let mut graph = compiled(builder, &[("y", y)])?;
    assert_eq!(graph.backend_name(), "cpu-flaky");

    assert_close(&run(&mut graph, "x", &[0.0, 0.0], "y")?, &[1.0, 1.0]);
    assert_eq!(backend.calls(), 1);

    backend.lost.store(true, Ordering::SeqCst);
    let err = run(&mut graph, "x", &[0.0, 0.0], "y")
        .unwrap_err()
        .downcast::<webnn_rs::WebnnError>()?;
    assert!(err.is_device_lost());
    assert_eq!(graph.error(), Some(&err));

    backend.lost.store(false, Ordering::SeqCst);
    let again = run(&mut graph, "x", &[0.0, 0.0], "y")
        .unwrap_err()
        .downcast::<webnn_rs::WebnnError>()?;
    assert_eq!(again, err);
    assert_eq!(backend.calls(), 2, "a poisoned graph must not dispatch");
    Ok(())
}

#[test]
fn initialization_failures_are_lowering_errors() -> Result<()> {
    let backend = Arc::new(FlakyBackend::new());
    backend.failing_init.store(true, Ordering::SeqCst);
    let mut builder = GraphBuilder::new(backend.clone(), 256);
    let x = builder.input("x", &desc(&[2]));
    let c = builder.constant_f32(&[2], &[1.0, 2.0]);
    let y = builder.add(x, c);
    let mut graph = builder.build(&[("y", y)])?;

    let err = graph.compile().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lowering);
    assert!(err.message().contains("constant upload rejected"), "{err}");
    assert_eq!(graph.error(), Some(&err));
    assert!(!graph.is_compiled());
    assert_eq!(backend.calls(), 0);
    Ok(())
}

#[test]
fn callbacks_receive_the_compute_outcome() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[1]));
    let y = builder.floor(x);
    let mut graph = compiled(builder, &[("y", y)])?;

    let data = bytes(&[2.75]);
    let mut inputs = NamedInputs::new();
    inputs.set_bytes("x", &data);
    let mut outputs = NamedOutputs::new();
    let mut outcome = None;
    graph.compute_with_callback(&inputs, &mut outputs, |result| outcome = Some(result));
    assert_eq!(outcome, Some(Ok(())));
    assert_close(&outputs.get_f32("y").unwrap_or_default(), &[2.0]);

    let mut outcome = None;
    graph.compute_with_callback(&NamedInputs::new(), &mut outputs, |result| {
        outcome = Some(result)
    });
    assert!(matches!(outcome, Some(Err(_))));
    Ok(())
}

#[test]
fn pool_capacities_grow_to_powers_of_two() {
    assert_eq!(grown_capacity(0, 100, 256), 256);
    assert_eq!(grown_capacity(256, 300, 256), 512);
    assert_eq!(grown_capacity(512, 100, 256), 512);
    assert_eq!(grown_capacity(0, 1025, 16), 2048);
}

#[test]
fn resource_buffers_are_reused_across_computes() -> Result<()> {
    let mut builder = builder();
    let x = builder.input("x", &desc(&[100]));
    let y = builder.tanh(x);
    let mut graph = compiled(builder, &[("y", y)])?;
    assert_eq!(graph.resource_capacity(PoolBuffer::Input), Some(512));

    let values = vec![0.5f32; 100];
    run(&mut graph, "x", &values, "y")?;
    let upload = graph.resource_capacity(PoolBuffer::Upload);
    let output = graph.resource_capacity(PoolBuffer::Output);
    assert_eq!(upload, Some(512));
    assert_eq!(output, Some(512));

    run(&mut graph, "x", &values, "y")?;
    assert_eq!(graph.resource_capacity(PoolBuffer::Upload), upload);
    assert_eq!(graph.resource_capacity(PoolBuffer::Output), output);
    Ok(())
}
