use serde::Serialize;

use crate::graph::ops::{InterpolationMode, PaddingMode, RecurrentDirection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ElementWiseFunction {
    Identity,
    Add,
    Subtract,
    Multiply,
    Divide,
    Max,
    Min,
    Pow,
    Abs,
    Ceil,
    Cos,
    Exp,
    Floor,
    Log,
    Sin,
    Tan,
}

impl ElementWiseFunction {
    pub fn arity(self) -> usize {
        match self {
            ElementWiseFunction::Add
            | ElementWiseFunction::Subtract
            | ElementWiseFunction::Multiply
            | ElementWiseFunction::Divide
            | ElementWiseFunction::Max
            | ElementWiseFunction::Min
            | ElementWiseFunction::Pow => 2,
            _ => 1,
        }
    }
}

/// Activations a native primitive can apply, standalone or fused.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum NativeActivation {
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu { alpha: f32 },
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConvolutionDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PoolingFunction {
    Average,
    L2,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ReduceFunction {
    ArgMax,
    ArgMin,
    L1,
    L2,
    Max,
    Mean,
    Min,
    Product,
    Sum,
}

/// Backend-native operation. Inputs and outputs are described by the enclosing operator's slots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Primitive {
    ElementWise(ElementWiseFunction),
    Clip {
        min: f32,
        max: f32,
    },
    Activation(NativeActivation),
    /// Slots: `a`, `b`, optional `c`; all 4-D.
    Gemm {
        transpose_a: bool,
        transpose_b: bool,
        alpha: f32,
        beta: f32,
        fused_activation: Option<NativeActivation>,
    },
    /// Slots: input (NCHW), filter (OIHW forward, IOHW backward), optional bias `[1, C, 1, 1]`.
    Convolution {
        direction: ConvolutionDirection,
        strides: [u32; 2],
        dilations: [u32; 2],
        start_padding: [u32; 2],
        end_padding: [u32; 2],
        output_padding: [u32; 2],
        groups: u32,
        fused_activation: Option<NativeActivation>,
    },
    Pooling {
        function: PoolingFunction,
        window: [u32; 2],
        strides: [u32; 2],
        dilations: [u32; 2],
        start_padding: [u32; 2],
        end_padding: [u32; 2],
    },
    Padding {
        mode: PaddingMode,
        value: f32,
        start_padding: Vec<u32>,
        end_padding: Vec<u32>,
    },
    /// Reduced axes stay in the output with size 1.
    Reduce {
        function: ReduceFunction,
        axes: Vec<u32>,
    },
    /// Slots: input, mean, variance, scale, bias; all channel operands `[1, C, 1, 1]`.
    BatchNormalization {
        epsilon: f32,
        fused_activation: Option<NativeActivation>,
    },
    /// Slots: input, optional scale, optional bias.
    MeanVarianceNormalization {
        axes: Vec<u32>,
        epsilon: f32,
        normalize_variance: bool,
    },
    Join {
        axis: u32,
    },
    Split {
        axis: u32,
    },
    Slice {
        offsets: Vec<u32>,
        sizes: Vec<u32>,
        strides: Vec<u32>,
    },
    /// `scales[i] = output_dim[i] / input_dim[i]`.
    Resample {
        mode: InterpolationMode,
        scales: Vec<f32>,
    },
    /// Slots: input `[1, steps, batch, input]`, weight `[1, dirs, 3h, input]`, recurrence
    /// `[1, dirs, 3h, h]`, bias `[1, 1, dirs, 6h]`, optional initial hidden `[1, dirs, batch, h]`.
    /// Outputs: optional sequence `[steps, dirs, batch, h]`, single `[1, dirs, batch, h]`.
    Gru {
        direction: RecurrentDirection,
        linear_before_reset: bool,
        activations: [NativeActivation; 2],
    },
}

impl Primitive {
    pub fn name(&self) -> &'static str {
        match self {
            Primitive::ElementWise(_) => "element_wise",
            Primitive::Clip { .. } => "clip",
            Primitive::Activation(_) => "activation",
            Primitive::Gemm { .. } => "gemm",
            Primitive::Convolution { .. } => "convolution",
            Primitive::Pooling { .. } => "pooling",
            Primitive::Padding { .. } => "padding",
            Primitive::Reduce { .. } => "reduce",
            Primitive::BatchNormalization { .. } => "batch_normalization",
            Primitive::MeanVarianceNormalization { .. } => "mean_variance_normalization",
            Primitive::Join { .. } => "join",
            Primitive::Split { .. } => "split",
            Primitive::Slice { .. } => "slice",
            Primitive::Resample { .. } => "resample",
            Primitive::Gru { .. } => "gru",
        }
    }
}
