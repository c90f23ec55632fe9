use serde::{Deserialize, Serialize};

use crate::filler::Filler;

/// The closed set of layer types the engine can instantiate, along with their type specific
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    Input {
        shape: Vec<Vec<usize>>,
    },
    DummyData {
        shape: Vec<Vec<usize>>,
        #[serde(default)]
        filler: Vec<Filler>,
    },
    MemoryData {
        batch_size: usize,
        channels: usize,
        height: usize,
        width: usize,
    },
    InnerProduct(InnerProductSpec),
    Bias(BiasSpec),
    Scale {
        #[serde(default = "default_axis")]
        axis: isize,
    },
    Eltwise {
        #[serde(default)]
        operation: EltwiseOp,
        #[serde(default)]
        coeff: Vec<f32>,
    },
    #[serde(rename = "tanh")]
    TanH,
    Sigmoid,
    #[serde(rename = "relu")]
    ReLU {
        #[serde(default)]
        negative_slope: f32,
    },
    Slice {
        #[serde(default = "default_axis")]
        axis: isize,
        #[serde(default)]
        slice_point: Vec<usize>,
    },
    Concat {
        #[serde(default = "default_axis")]
        axis: isize,
    },
    Reshape {
        shape: Vec<i64>,
    },
    Reduction {
        #[serde(default)]
        operation: ReductionOp,
        #[serde(default)]
        axis: isize,
        #[serde(default = "default_coeff")]
        coeff: f32,
    },
    EuclideanLoss,
    ArgMax {
        #[serde(default)]
        out_max_val: bool,
        #[serde(default = "default_top_k")]
        top_k: usize,
        #[serde(default)]
        axis: Option<isize>,
    },
    Recurrent(RecurrentSpec),
}

fn default_axis() -> isize {
    1
}

fn default_coeff() -> f32 {
    1.0
}

fn default_top_k() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_num_axes() -> usize {
    1
}

impl LayerKind {
    /// The type tag of the layer, as used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "Input",
            LayerKind::DummyData { .. } => "DummyData",
            LayerKind::MemoryData { .. } => "MemoryData",
            LayerKind::InnerProduct(_) => "InnerProduct",
            LayerKind::Bias(_) => "Bias",
            LayerKind::Scale { .. } => "Scale",
            LayerKind::Eltwise { .. } => "Eltwise",
            LayerKind::TanH => "TanH",
            LayerKind::Sigmoid => "Sigmoid",
            LayerKind::ReLU { .. } => "ReLU",
            LayerKind::Slice { .. } => "Slice",
            LayerKind::Concat { .. } => "Concat",
            LayerKind::Reshape { .. } => "Reshape",
            LayerKind::Reduction { .. } => "Reduction",
            LayerKind::EuclideanLoss => "EuclideanLoss",
            LayerKind::ArgMax { .. } => "ArgMax",
            LayerKind::Recurrent(_) => "Recurrent",
        }
    }
}

/// The description of a fully connected layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct InnerProductSpec {
    pub num_output: usize,
    #[serde(default = "default_true")]
    pub bias_term: bool,
    #[serde(default = "default_axis")]
    pub axis: isize,
    #[serde(default)]
    pub weight_filler: Filler,
    #[serde(default)]
    pub bias_filler: Filler,
}

impl InnerProductSpec {
    /// Creates a new `InnerProductSpec` with a bias, flattening from axis 1.
    pub fn new(num_output: usize) -> Self {
        Self {
            num_output,
            bias_term: true,
            axis: default_axis(),
            weight_filler: Filler::default(),
            bias_filler: Filler::default(),
        }
    }

    pub fn axis(mut self, axis: isize) -> Self {
        self.axis = axis;
        self
    }

    pub fn bias_term(mut self, bias_term: bool) -> Self {
        self.bias_term = bias_term;
        self
    }

    pub fn weight_filler(mut self, filler: Filler) -> Self {
        self.weight_filler = filler;
        self
    }

    pub fn bias_filler(mut self, filler: Filler) -> Self {
        self.bias_filler = filler;
        self
    }
}

/// The description of a learnable bias broadcast over `shape[axis..axis + num_axes]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BiasSpec {
    #[serde(default = "default_axis")]
    pub axis: isize,
    #[serde(default = "default_num_axes")]
    pub num_axes: usize,
    #[serde(default)]
    pub filler: Filler,
}

impl Default for BiasSpec {
    fn default() -> Self {
        Self {
            axis: default_axis(),
            num_axes: default_num_axes(),
            filler: Filler::default(),
        }
    }
}

/// The element wise operation of an `Eltwise` layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EltwiseOp {
    #[default]
    Sum,
    Prod,
}

/// The reduction applied by a `Reduction` layer over the trailing axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionOp {
    #[default]
    Sum,
    Asum,
    SumSq,
    Mean,
}

/// The description of a recurrent layer.
///
/// `architecture` names an entry of the `ArchitectureRegistry` the network is built with, and
/// `config` is handed to that entry untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RecurrentSpec {
    pub architecture: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub expose_hidden: bool,
}

impl RecurrentSpec {
    /// Creates a new `RecurrentSpec`.
    ///
    /// # Arguments
    /// * `architecture` - The registered name of the unrolled architecture.
    /// * `config` - The architecture's own configuration.
    pub fn new(architecture: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            architecture: architecture.into(),
            config,
            expose_hidden: false,
        }
    }

    pub fn expose_hidden(mut self, expose_hidden: bool) -> Self {
        self.expose_hidden = expose_hidden;
        self
    }
}
