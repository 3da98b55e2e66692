//! Operator kinds and their attribute dictionaries.
//!
//! Every option struct implements `Default` with the documented defaults, so callers only spell out
//! the attributes they care about:
//!
//! ```ignore
//! let options = Conv2dOptions {
//!     strides: vec![2, 2],
//!     auto_pad: AutoPad::SameUpper,
//!     ..Conv2dOptions::default()
//! };
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ir::OperandId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
    MatMul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Ceil,
    Cos,
    Exp,
    Floor,
    HardSwish,
    Log,
    Neg,
    Relu,
    Sigmoid,
    Sin,
    Softmax,
    Tan,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InputOperandLayout {
    #[default]
    Nchw,
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Conv2dFilterOperandLayout {
    #[default]
    Oihw,
    Hwio,
    Ohwi,
    Ihwo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConvTranspose2dFilterOperandLayout {
    #[default]
    Iohw,
    Hwoi,
    Ohwi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AutoPad {
    #[default]
    Explicit,
    SameUpper,
    SameLower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RoundingType {
    #[default]
    Floor,
    Ceil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    Average,
    L2,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
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

impl ReduceOp {
    pub fn is_arg_reduction(self) -> bool {
        matches!(self, ReduceOp::ArgMax | ReduceOp::ArgMin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PaddingMode {
    #[default]
    Constant,
    Edge,
    Reflection,
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InterpolationMode {
    #[default]
    NearestNeighbor,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecurrentDirection {
    #[default]
    Forward,
    Backward,
    Both,
}

impl RecurrentDirection {
    pub fn num_directions(self) -> u32 {
        match self {
            RecurrentDirection::Both => 2,
            RecurrentDirection::Forward | RecurrentDirection::Backward => 1,
        }
    }
}

/// Activation applied to the result of a convolution, GEMM, batch normalization or recurrent cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FusedActivation {
    Clamp { min_value: f32, max_value: f32 },
    HardSwish,
    LeakyRelu { alpha: f32 },
    Relu,
    Sigmoid,
    Tanh,
}

impl fmt::Display for FusedActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FusedActivation::Clamp {
                min_value,
                max_value,
            } => write!(f, "clamp({min_value}, {max_value})"),
            FusedActivation::HardSwish => f.write_str("hardSwish"),
            FusedActivation::LeakyRelu { alpha } => write!(f, "leakyRelu({alpha})"),
            FusedActivation::Relu => f.write_str("relu"),
            FusedActivation::Sigmoid => f.write_str("sigmoid"),
            FusedActivation::Tanh => f.write_str("tanh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampOptions {
    pub min_value: f32,
    pub max_value: f32,
}

impl Default for ClampOptions {
    fn default() -> Self {
        Self {
            min_value: f32::NEG_INFINITY,
            max_value: f32::INFINITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyReluOptions {
    pub alpha: f32,
}

impl Default for LeakyReluOptions {
    fn default() -> Self {
        Self { alpha: 0.01 }
    }
}

/// Padding is `[beginHeight, endHeight, beginWidth, endWidth]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dOptions {
    pub padding: Vec<u32>,
    pub strides: Vec<u32>,
    pub dilations: Vec<u32>,
    pub auto_pad: AutoPad,
    pub groups: u32,
    pub input_layout: InputOperandLayout,
    pub filter_layout: Conv2dFilterOperandLayout,
    pub bias: Option<OperandId>,
    pub activation: Option<FusedActivation>,
}

impl Default for Conv2dOptions {
    fn default() -> Self {
        Self {
            padding: vec![0; 4],
            strides: vec![1, 1],
            dilations: vec![1, 1],
            auto_pad: AutoPad::Explicit,
            groups: 1,
            input_layout: InputOperandLayout::Nchw,
            filter_layout: Conv2dFilterOperandLayout::Oihw,
            bias: None,
            activation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvTranspose2dOptions {
    pub padding: Vec<u32>,
    pub strides: Vec<u32>,
    pub dilations: Vec<u32>,
    pub output_padding: Vec<u32>,
    pub output_sizes: Option<Vec<u32>>,
    pub auto_pad: AutoPad,
    pub groups: u32,
    pub input_layout: InputOperandLayout,
    pub filter_layout: ConvTranspose2dFilterOperandLayout,
    pub bias: Option<OperandId>,
    pub activation: Option<FusedActivation>,
}

impl Default for ConvTranspose2dOptions {
    fn default() -> Self {
        Self {
            padding: vec![0; 4],
            strides: vec![1, 1],
            dilations: vec![1, 1],
            output_padding: vec![0, 0],
            output_sizes: None,
            auto_pad: AutoPad::Explicit,
            groups: 1,
            input_layout: InputOperandLayout::Nchw,
            filter_layout: ConvTranspose2dFilterOperandLayout::Iohw,
            bias: None,
            activation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2dOptions {
    /// Spatial window; defaults to the full input height and width.
    pub window_dimensions: Option<Vec<u32>>,
    pub padding: Vec<u32>,
    pub strides: Vec<u32>,
    pub dilations: Vec<u32>,
    pub auto_pad: AutoPad,
    pub layout: InputOperandLayout,
    pub rounding_type: RoundingType,
    pub output_sizes: Option<Vec<u32>>,
}

impl Default for Pool2dOptions {
    fn default() -> Self {
        Self {
            window_dimensions: None,
            padding: vec![0; 4],
            strides: vec![1, 1],
            dilations: vec![1, 1],
            auto_pad: AutoPad::Explicit,
            layout: InputOperandLayout::Nchw,
            rounding_type: RoundingType::Floor,
            output_sizes: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GemmOptions {
    pub c: Option<OperandId>,
    pub alpha: f32,
    pub beta: f32,
    pub a_transpose: bool,
    pub b_transpose: bool,
}

impl Default for GemmOptions {
    fn default() -> Self {
        Self {
            c: None,
            alpha: 1.0,
            beta: 1.0,
            a_transpose: false,
            b_transpose: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReduceOptions {
    /// Axes to reduce; `None` reduces every axis. Negative values count from the end.
    pub axes: Option<Vec<i32>>,
    pub keep_dimensions: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PadOptions {
    pub mode: PaddingMode,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormOptions {
    pub scale: Option<OperandId>,
    pub bias: Option<OperandId>,
    pub axis: u32,
    pub epsilon: f32,
    pub activation: Option<FusedActivation>,
}

impl Default for BatchNormOptions {
    fn default() -> Self {
        Self {
            scale: None,
            bias: None,
            axis: 1,
            epsilon: 1e-5,
            activation: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstanceNormOptions {
    pub scale: Option<OperandId>,
    pub bias: Option<OperandId>,
    pub epsilon: f32,
    pub layout: InputOperandLayout,
}

impl Default for InstanceNormOptions {
    fn default() -> Self {
        Self {
            scale: None,
            bias: None,
            epsilon: 1e-5,
            layout: InputOperandLayout::Nchw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruOptions {
    pub bias: Option<OperandId>,
    pub recurrent_bias: Option<OperandId>,
    pub initial_hidden_state: Option<OperandId>,
    pub reset_after: bool,
    pub return_sequence: bool,
    pub direction: RecurrentDirection,
    /// Update/reset gate activation followed by the new-gate activation.
    pub activations: Option<Vec<FusedActivation>>,
}

impl Default for GruOptions {
    fn default() -> Self {
        Self {
            bias: None,
            recurrent_bias: None,
            initial_hidden_state: None,
            reset_after: true,
            return_sequence: false,
            direction: RecurrentDirection::Forward,
            activations: None,
        }
    }
}

impl GruOptions {
    pub fn resolved_activations(&self) -> [FusedActivation; 2] {
        match self.activations.as_deref() {
            Some([gate, candidate]) => [*gate, *candidate],
            _ => [FusedActivation::Sigmoid, FusedActivation::Tanh],
        }
    }
}

/// How `split` divides its axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitSpec {
    /// Number of equally sized parts.
    Count(u32),
    /// Explicit part sizes.
    Sizes(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SliceOptions {
    pub axes: Option<Vec<i32>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resample2dOptions {
    pub mode: InterpolationMode,
    pub scales: Option<Vec<f32>>,
    pub sizes: Option<Vec<u32>>,
    pub axes: Option<Vec<u32>>,
}

impl Default for Resample2dOptions {
    fn default() -> Self {
        Self {
            mode: InterpolationMode::NearestNeighbor,
            scales: None,
            sizes: None,
            axes: None,
        }
    }
}

/// Closed set of operator kinds recorded in the graph arena.
///
/// Attributes are stored resolved: defaults applied, negative axes normalized and optional operand
/// references kept alongside the operator's input list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OperatorKind {
    Input {
        name: String,
    },
    Constant {
        #[serde(skip)]
        bytes: Arc<[u8]>,
    },
    Binary(BinaryOp),
    Unary(UnaryOp),
    LeakyRelu(LeakyReluOptions),
    Clamp(ClampOptions),
    Conv2d(Conv2dOptions),
    ConvTranspose2d(ConvTranspose2dOptions),
    Pool2d {
        kind: PoolKind,
        options: Pool2dOptions,
    },
    Gemm(GemmOptions),
    Concat {
        axis: u32,
    },
    Reshape {
        new_shape: Vec<i32>,
    },
    Transpose {
        permutation: Vec<u32>,
    },
    Reduce {
        op: ReduceOp,
        axes: Vec<u32>,
        keep_dimensions: bool,
    },
    Pad(PadOptions),
    BatchNorm(BatchNormOptions),
    InstanceNorm(InstanceNormOptions),
    Gru {
        steps: u32,
        hidden_size: u32,
        options: GruOptions,
    },
    Split {
        sizes: Vec<u32>,
        axis: u32,
    },
    Squeeze {
        axes: Vec<u32>,
    },
    Slice {
        starts: Vec<u32>,
        sizes: Vec<u32>,
        axes: Vec<u32>,
    },
    Resample2d {
        mode: InterpolationMode,
        axes: [u32; 2],
        sizes: [u32; 2],
    },
    /// Placeholder for an operator whose validation failed; its outputs are error-tagged.
    Invalid {
        op: &'static str,
    },
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Input { .. } => "input",
            OperatorKind::Constant { .. } => "constant",
            OperatorKind::Binary(BinaryOp::MatMul) => "matmul",
            OperatorKind::Binary(_) => "binary",
            OperatorKind::Unary(_) => "unary",
            OperatorKind::LeakyRelu(_) => "leakyRelu",
            OperatorKind::Clamp(_) => "clamp",
            OperatorKind::Conv2d(_) => "conv2d",
            OperatorKind::ConvTranspose2d(_) => "convTranspose2d",
            OperatorKind::Pool2d { .. } => "pool2d",
            OperatorKind::Gemm(_) => "gemm",
            OperatorKind::Concat { .. } => "concat",
            OperatorKind::Reshape { .. } => "reshape",
            OperatorKind::Transpose { .. } => "transpose",
            OperatorKind::Reduce { .. } => "reduce",
            OperatorKind::Pad(_) => "pad",
            OperatorKind::BatchNorm(_) => "batchNorm",
            OperatorKind::InstanceNorm(_) => "instanceNorm",
            OperatorKind::Gru { .. } => "gru",
            OperatorKind::Split { .. } => "split",
            OperatorKind::Squeeze { .. } => "squeeze",
            OperatorKind::Slice { .. } => "slice",
            OperatorKind::Resample2d { .. } => "resample2d",
            OperatorKind::Invalid { op } => op,
        }
    }
}
