use std::fmt;

/// Operator kinds known to the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Input,
    TextInput,
    Output,
    Linear,
    Conv2d,
    MaxPool2d,
    MaxPool1d,
    AdaptiveAvgPool2d,
    Flatten,
    Activation,
    ReLU,
    Gelu,
    Sigmoid,
    Tanh,
    Softmax,
    Dropout,
    LayerNorm,
    BatchNorm,
    Embedding,
    TextEmbedding,
    PositionalEmbedding,
    PositionalEncoding,
    Attention,
    Add,
    Concat,
}

/// A typed operator with its parsed parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Input(Input),
    TextInput(TextInput),
    Output,
    Linear(Linear),
    Conv2d(Conv2d),
    MaxPool2d(MaxPool),
    MaxPool1d(MaxPool),
    AdaptiveAvgPool2d(AdaptiveAvgPool2d),
    Flatten,
    Activation(ActivationFn),
    Softmax(Softmax),
    Dropout(Dropout),
    LayerNorm,
    BatchNorm,
    Embedding(Embedding),
    PositionalEmbedding(Positional),
    PositionalEncoding(Positional),
    Attention(Attention),
    Add,
    Concat(Concat),
    /// Pass-through used for kinds the catalog does not know.
    Identity,
}

/// A named input port on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub name: &'static str,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    /// Feature dimensions after the batch dimension.
    pub features: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextInput {
    pub seq_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Linear {
    pub in_features: Option<usize>,
    pub out_features: usize,
    pub bias: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conv2d {
    pub in_channels: Option<usize>,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub bias: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaxPool {
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptiveAvgPool2d {
    pub output_size: [usize; 2],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationFn {
    ReLU,
    Gelu,
    Sigmoid,
    Tanh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Softmax {
    pub dim: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dropout {
    pub p: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Embedding {
    pub num_embeddings: usize,
    pub embedding_dim: usize,
}

/// Learned (`PositionalEmbedding`) or sinusoidal (`PositionalEncoding`)
/// position information added to a `[B, seq, d_model]` sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Positional {
    pub max_len: usize,
    pub d_model: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attention {
    pub embed_dim: Option<usize>,
    pub num_heads: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concat {
    pub dim: i64,
}

impl Op {
    pub const IN: &'static str = "in";
    pub const IN_A: &'static str = "in_a";
    pub const IN_B: &'static str = "in_b";
    pub const IN_C: &'static str = "in_c";
    pub const IN_D: &'static str = "in_d";
    pub const OUT: &'static str = "out";

    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Input(_) => "Input",
            Op::TextInput(_) => "TextInput",
            Op::Output => "Output",
            Op::Linear(_) => "Linear",
            Op::Conv2d(_) => "Conv2D",
            Op::MaxPool2d(_) => "MaxPool2D",
            Op::MaxPool1d(_) => "MaxPool1D",
            Op::AdaptiveAvgPool2d(_) => "AdaptiveAvgPool2D",
            Op::Flatten => "Flatten",
            Op::Activation(f) => f.display_name(),
            Op::Softmax(_) => "Softmax",
            Op::Dropout(_) => "Dropout",
            Op::LayerNorm => "LayerNorm",
            Op::BatchNorm => "BatchNorm",
            Op::Embedding(_) => "Embedding",
            Op::PositionalEmbedding(_) => "PositionalEmbedding",
            Op::PositionalEncoding(_) => "PositionalEncoding",
            Op::Attention(_) => "Attention",
            Op::Add => "Add",
            Op::Concat(_) => "Concat",
            Op::Identity => "Identity",
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Op::Input(_) | Op::TextInput(_))
    }
}

impl OpKind {
    pub const ALL: [OpKind; 25] = [
        OpKind::Input,
        OpKind::TextInput,
        OpKind::Output,
        OpKind::Linear,
        OpKind::Conv2d,
        OpKind::MaxPool2d,
        OpKind::MaxPool1d,
        OpKind::AdaptiveAvgPool2d,
        OpKind::Flatten,
        OpKind::Activation,
        OpKind::ReLU,
        OpKind::Gelu,
        OpKind::Sigmoid,
        OpKind::Tanh,
        OpKind::Softmax,
        OpKind::Dropout,
        OpKind::LayerNorm,
        OpKind::BatchNorm,
        OpKind::Embedding,
        OpKind::TextEmbedding,
        OpKind::PositionalEmbedding,
        OpKind::PositionalEncoding,
        OpKind::Attention,
        OpKind::Add,
        OpKind::Concat,
    ];

    /// Canonical lowercase name, as used in graph descriptions.
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Input => "input",
            OpKind::TextInput => "text_input",
            OpKind::Output => "output",
            OpKind::Linear => "linear",
            OpKind::Conv2d => "conv2d",
            OpKind::MaxPool2d => "maxpool2d",
            OpKind::MaxPool1d => "maxpool1d",
            OpKind::AdaptiveAvgPool2d => "adaptiveavgpool2d",
            OpKind::Flatten => "flatten",
            OpKind::Activation => "activation",
            OpKind::ReLU => "relu",
            OpKind::Gelu => "gelu",
            OpKind::Sigmoid => "sigmoid",
            OpKind::Tanh => "tanh",
            OpKind::Softmax => "softmax",
            OpKind::Dropout => "dropout",
            OpKind::LayerNorm => "layernorm",
            OpKind::BatchNorm => "batchnorm",
            OpKind::Embedding => "embedding",
            OpKind::TextEmbedding => "text_embedding",
            OpKind::PositionalEmbedding => "positional_embedding",
            OpKind::PositionalEncoding => "positional_encoding",
            OpKind::Attention => "attention",
            OpKind::Add => "add",
            OpKind::Concat => "concat",
        }
    }

    pub fn input_handles(self) -> &'static [Handle] {
        const NONE: &[Handle] = &[];
        const UNARY: &[Handle] = &[Handle::required(Op::IN)];
        const BINARY: &[Handle] = &[Handle::required(Op::IN_A), Handle::required(Op::IN_B)];
        const CONCAT: &[Handle] = &[
            Handle::required(Op::IN_A),
            Handle::required(Op::IN_B),
            Handle::optional(Op::IN_C),
            Handle::optional(Op::IN_D),
        ];
        match self {
            OpKind::Input | OpKind::TextInput => NONE,
            OpKind::Add => BINARY,
            OpKind::Concat => CONCAT,
            _ => UNARY,
        }
    }

    pub fn has_output(self) -> bool {
        self != OpKind::Output
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Handle {
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

impl ActivationFn {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "relu" => Some(ActivationFn::ReLU),
            "gelu" => Some(ActivationFn::Gelu),
            "sigmoid" => Some(ActivationFn::Sigmoid),
            "tanh" => Some(ActivationFn::Tanh),
            _ => None,
        }
    }

    /// The dedicated kind implementing this function.
    pub fn kind(self) -> OpKind {
        match self {
            ActivationFn::ReLU => OpKind::ReLU,
            ActivationFn::Gelu => OpKind::Gelu,
            ActivationFn::Sigmoid => OpKind::Sigmoid,
            ActivationFn::Tanh => OpKind::Tanh,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ActivationFn::ReLU => "ReLU",
            ActivationFn::Gelu => "GELU",
            ActivationFn::Sigmoid => "Sigmoid",
            ActivationFn::Tanh => "Tanh",
        }
    }
}

#[test]
fn handles() {
    assert!(OpKind::Input.input_handles().is_empty());
    assert_eq!(OpKind::Linear.input_handles(), &[Handle::required("in")]);
    let concat = OpKind::Concat.input_handles();
    assert_eq!(concat.iter().filter(|h| h.required).count(), 2);
    assert!(!OpKind::Output.has_output());
    assert!(OpKind::Add.has_output());
}

#[test]
fn activation_names() {
    assert_eq!(ActivationFn::from_name(" GELU "), Some(ActivationFn::Gelu));
    assert_eq!(ActivationFn::from_name("swish"), None);
    assert_eq!(ActivationFn::Tanh.kind().name(), "tanh");
}
