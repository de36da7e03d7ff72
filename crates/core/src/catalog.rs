//! The operator catalog: which kinds exist, how their parameters are parsed
//! into typed `Op`s, and which handles they expose.
//!
//! Shape transfer lives in `analysis::shape` and parameter counting in
//! `analysis::num_params`, both as methods on `Op`.

use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

use crate::{
    op::{
        ActivationFn, AdaptiveAvgPool2d, Attention, Concat, Conv2d, Dropout, Embedding, Input,
        Linear, MaxPool, Op, OpKind, Positional, Softmax, TextInput,
    },
    params::{ParamError, Params},
};

pub type ParseFn = fn(&Params) -> Result<Op, ParamError>;

/// Catalog entry for one operator kind.
#[derive(Clone, Copy)]
pub struct OpSchema {
    pub kind: OpKind,
    pub parse: ParseFn,
}

/// Immutable registry from type names to operator schemas.
#[derive(Clone)]
pub struct Catalog {
    schemas: FxHashMap<String, OpSchema>,
}

impl Catalog {
    /// An empty catalog. Every type name is unknown to it.
    pub fn empty() -> Self {
        Self {
            schemas: FxHashMap::default(),
        }
    }

    /// The catalog of all built-in operator kinds.
    pub fn standard() -> Self {
        let mut catalog = Self::empty();
        for kind in OpKind::ALL {
            catalog = catalog.with_schema(kind.name(), kind, parser_for(kind));
        }
        catalog
            .with_schema("maxpool", OpKind::MaxPool2d, parse_maxpool2d)
            .with_schema("batchnorm1d", OpKind::BatchNorm, parse_batchnorm)
            .with_schema("batchnorm2d", OpKind::BatchNorm, parse_batchnorm)
            .with_schema("multiheadattention", OpKind::Attention, parse_attention)
    }

    pub fn with_schema(mut self, name: &str, kind: OpKind, parse: ParseFn) -> Self {
        self.schemas
            .insert(normalize_type_name(name), OpSchema { kind, parse });
        self
    }

    pub fn lookup(&self, type_name: &str) -> Option<&OpSchema> {
        self.schemas.get(&normalize_type_name(type_name))
    }

    /// Resolves `type_name` and parses `params` into a typed `Op`.
    /// Returns `None` if the kind is unknown.
    pub fn parse(
        &self,
        type_name: &str,
        params: &Map<String, Value>,
    ) -> Option<(OpKind, Result<Op, ParamError>)> {
        let schema = self.lookup(type_name)?;
        Some((schema.kind, (schema.parse)(&Params::new(params))))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

/// Type names match case-insensitively, ignoring `_`, `-` and spaces, so
/// `TextInput`, `text_input` and `textinput` are the same kind.
pub fn normalize_type_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn parser_for(kind: OpKind) -> ParseFn {
    match kind {
        OpKind::Input => parse_input,
        OpKind::TextInput => parse_text_input,
        OpKind::Output => |_| Ok(Op::Output),
        OpKind::Linear => parse_linear,
        OpKind::Conv2d => parse_conv2d,
        OpKind::MaxPool2d => parse_maxpool2d,
        OpKind::MaxPool1d => |p| parse_maxpool(p).map(Op::MaxPool1d),
        OpKind::AdaptiveAvgPool2d => parse_adaptive_avg_pool2d,
        OpKind::Flatten => |_| Ok(Op::Flatten),
        OpKind::Activation => parse_activation,
        OpKind::ReLU => |_| Ok(Op::Activation(ActivationFn::ReLU)),
        OpKind::Gelu => |_| Ok(Op::Activation(ActivationFn::Gelu)),
        OpKind::Sigmoid => |_| Ok(Op::Activation(ActivationFn::Sigmoid)),
        OpKind::Tanh => |_| Ok(Op::Activation(ActivationFn::Tanh)),
        OpKind::Softmax => |p| {
            Ok(Op::Softmax(Softmax {
                dim: p.i64_or("dim", -1)?,
            }))
        },
        OpKind::Dropout => parse_dropout,
        OpKind::LayerNorm => |_| Ok(Op::LayerNorm),
        OpKind::BatchNorm => parse_batchnorm,
        OpKind::Embedding | OpKind::TextEmbedding => parse_embedding,
        OpKind::PositionalEmbedding => |p| parse_positional(p).map(Op::PositionalEmbedding),
        OpKind::PositionalEncoding => |p| parse_positional(p).map(Op::PositionalEncoding),
        OpKind::Attention => parse_attention,
        OpKind::Add => |_| Ok(Op::Add),
        OpKind::Concat => |p| {
            Ok(Op::Concat(Concat {
                dim: p.i64_or("dim", 1)?,
            }))
        },
    }
}

const DEFAULT_INPUT_FEATURES: [usize; 3] = [1, 28, 28];

fn parse_input(p: &Params) -> Result<Op, ParamError> {
    let features = match p.usize_list("shape")? {
        Some(shape) => shape,
        None => match p.get("input_shape") {
            Some(raw) => parse_input_shape(raw)?,
            None => Vec::new(),
        },
    };
    let features = if features.is_empty() {
        DEFAULT_INPUT_FEATURES.to_vec()
    } else {
        features
    };
    Ok(Op::Input(Input { features }))
}

/// `input_shape` comes from the editor either as a list whose leading entry
/// may be the batch (`null`, or `1` on a 4-d image shape) or as `"3,224,224"`.
fn parse_input_shape(raw: &Value) -> Result<Vec<usize>, ParamError> {
    let invalid = || ParamError::InvalidType {
        name: "input_shape",
        expected: "a list of non-negative integers",
        found: raw.to_string(),
    };
    match raw {
        Value::Array(items) => {
            let mut items = items.as_slice();
            if items.first().is_some_and(Value::is_null)
                || (items.len() == 4 && items[0].as_u64() == Some(1))
            {
                items = &items[1..];
            }
            items
                .iter()
                .map(|v| v.as_u64().map(|d| d as usize).ok_or_else(invalid))
                .collect()
        }
        Value::String(s) => s
            .split(',')
            .filter(|d| !d.trim().is_empty())
            .map(|d| d.trim().parse().map_err(|_| invalid()))
            .collect(),
        _ => Err(invalid()),
    }
}

fn parse_text_input(p: &Params) -> Result<Op, ParamError> {
    Ok(Op::TextInput(TextInput {
        seq_len: p.positive_or("seq_len", 256)?,
    }))
}

fn parse_linear(p: &Params) -> Result<Op, ParamError> {
    Ok(Op::Linear(Linear {
        in_features: p.optional_positive("in_features")?,
        out_features: p.required_positive("out_features")?,
        bias: p.bool_or("bias", true)?,
    }))
}

fn parse_conv2d(p: &Params) -> Result<Op, ParamError> {
    let kernel_size = p.positive_or("kernel_size", 3)?;
    let padding = match p.get("padding") {
        Some(Value::String(s)) if s.trim().eq_ignore_ascii_case("same") => kernel_size / 2,
        Some(Value::String(s)) if s.trim().eq_ignore_ascii_case("valid") => 0,
        _ => p.usize_or("padding", 0)?,
    };
    Ok(Op::Conv2d(Conv2d {
        in_channels: p.optional_positive("in_channels")?,
        out_channels: p.required_positive("out_channels")?,
        kernel_size,
        stride: p.positive_or("stride", 1)?,
        padding,
        bias: p.bool_or("bias", true)?,
    }))
}

fn parse_maxpool(p: &Params) -> Result<MaxPool, ParamError> {
    let kernel_size = p.positive_or("kernel_size", 2)?;
    let padding = p.usize_or("padding", 0)?;
    if padding > kernel_size / 2 {
        return Err(ParamError::OutOfRange {
            name: "padding",
            value: padding.to_string(),
            reason: "must be at most half of kernel_size",
        });
    }
    Ok(MaxPool {
        kernel_size,
        stride: p.positive_or("stride", kernel_size)?,
        padding,
    })
}

fn parse_maxpool2d(p: &Params) -> Result<Op, ParamError> {
    parse_maxpool(p).map(Op::MaxPool2d)
}

fn parse_adaptive_avg_pool2d(p: &Params) -> Result<Op, ParamError> {
    let output_size = match p.usize_list("output_size")?.as_deref() {
        None => [1, 1],
        Some(&[n]) => [n, n],
        Some(&[h, w]) => [h, w],
        Some(other) => {
            return Err(ParamError::OutOfRange {
                name: "output_size",
                value: format!("{other:?}"),
                reason: "must have one or two entries",
            })
        }
    };
    if output_size.contains(&0) {
        return Err(ParamError::OutOfRange {
            name: "output_size",
            value: format!("{output_size:?}"),
            reason: "must be positive",
        });
    }
    Ok(Op::AdaptiveAvgPool2d(AdaptiveAvgPool2d { output_size }))
}

fn parse_activation(p: &Params) -> Result<Op, ParamError> {
    let function = match p.get_any(&["function", "activation"]) {
        None => ActivationFn::ReLU,
        Some(value) => value
            .as_str()
            .and_then(ActivationFn::from_name)
            .ok_or_else(|| ParamError::InvalidType {
                name: "function",
                expected: "one of relu, gelu, sigmoid, tanh",
                found: value.to_string(),
            })?,
    };
    Ok(Op::Activation(function))
}

fn parse_dropout(p: &Params) -> Result<Op, ParamError> {
    let prob = p.f64_or("p", 0.5)?;
    if !(0.0..1.0).contains(&prob) {
        return Err(ParamError::OutOfRange {
            name: "p",
            value: prob.to_string(),
            reason: "must be in [0, 1)",
        });
    }
    Ok(Op::Dropout(Dropout { p: prob }))
}

fn parse_batchnorm(_: &Params) -> Result<Op, ParamError> {
    Ok(Op::BatchNorm)
}

fn parse_embedding(p: &Params) -> Result<Op, ParamError> {
    let num_embeddings = match p.optional_positive("num_embeddings")? {
        Some(n) => n,
        None => p.positive_or("vocab_size", 10000)?,
    };
    Ok(Op::Embedding(Embedding {
        num_embeddings,
        embedding_dim: p.positive_or("embedding_dim", 128)?,
    }))
}

fn parse_positional(p: &Params) -> Result<Positional, ParamError> {
    Ok(Positional {
        max_len: p.positive_or("max_len", 512)?,
        d_model: p.optional_positive("d_model")?,
    })
}

fn parse_attention(p: &Params) -> Result<Op, ParamError> {
    let num_heads = p.positive_or("num_heads", 4)?;
    let embed_dim = p.optional_positive("embed_dim")?;
    if let Some(embed_dim) = embed_dim {
        if embed_dim % num_heads != 0 {
            return Err(ParamError::OutOfRange {
                name: "embed_dim",
                value: embed_dim.to_string(),
                reason: "must be divisible by num_heads",
            });
        }
    }
    Ok(Op::Attention(Attention {
        embed_dim,
        num_heads,
    }))
}

#[cfg(test)]
fn parse(ty: &str, params: Value) -> Option<(OpKind, Result<Op, ParamError>)> {
    Catalog::standard().parse(ty, params.as_object().unwrap())
}

#[test]
fn kind_names_are_normalized() {
    let catalog = Catalog::standard();
    for name in ["TextInput", "text_input", "textinput", "Text-Input"] {
        assert_eq!(catalog.lookup(name).map(|s| s.kind), Some(OpKind::TextInput));
    }
    assert_eq!(catalog.lookup("MaxPool").map(|s| s.kind), Some(OpKind::MaxPool2d));
    assert_eq!(catalog.lookup("Conv2D").map(|s| s.kind), Some(OpKind::Conv2d));
    assert!(catalog.lookup("transformer").is_none());
    assert!(Catalog::empty().lookup("linear").is_none());
}

#[test]
fn input_shapes() {
    let features = |params| match parse("Input", params) {
        Some((_, Ok(Op::Input(input)))) => input.features,
        other => panic!("{other:?}"),
    };
    assert_eq!(features(serde_json::json!({})), vec![1, 28, 28]);
    assert_eq!(features(serde_json::json!({ "shape": [784] })), vec![784]);
    assert_eq!(
        features(serde_json::json!({ "input_shape": [null, 3, 224, 224] })),
        vec![3, 224, 224]
    );
    assert_eq!(
        features(serde_json::json!({ "input_shape": [1, 3, 32, 32] })),
        vec![3, 32, 32]
    );
    assert_eq!(
        features(serde_json::json!({ "input_shape": "3, 64, 64" })),
        vec![3, 64, 64]
    );
    assert!(matches!(
        parse("input", serde_json::json!({ "input_shape": [3, "x"] })),
        Some((_, Err(ParamError::InvalidType { .. })))
    ));
}

#[test]
fn linear_requires_out_features() {
    assert_eq!(
        parse("Linear", serde_json::json!({ "in_features": 784 })).map(|(_, op)| op),
        Some(Err(ParamError::Missing("out_features")))
    );
    let (kind, op) = parse("Linear", serde_json::json!({ "out_features": 10 })).unwrap();
    assert_eq!(kind, OpKind::Linear);
    assert_eq!(
        op,
        Ok(Op::Linear(Linear {
            in_features: None,
            out_features: 10,
            bias: true
        }))
    );
}

#[test]
fn conv2d_same_padding() {
    let (_, op) = parse(
        "Conv2D",
        serde_json::json!({ "out_channels": 16, "kernel_size": 5, "padding": "same" }),
    )
    .unwrap();
    let Ok(Op::Conv2d(conv)) = op else { panic!() };
    assert_eq!(conv.padding, 2);
    assert_eq!(conv.stride, 1);
}

#[test]
fn activation_function() {
    let op = |params| parse("Activation", params).unwrap().1;
    assert_eq!(op(serde_json::json!({})), Ok(Op::Activation(ActivationFn::ReLU)));
    assert_eq!(
        op(serde_json::json!({ "function": "Tanh" })),
        Ok(Op::Activation(ActivationFn::Tanh))
    );
    assert_eq!(
        op(serde_json::json!({ "activation": "gelu" })),
        Ok(Op::Activation(ActivationFn::Gelu))
    );
    assert!(op(serde_json::json!({ "function": "swish" })).is_err());
}

#[test]
fn param_ranges() {
    let err = |ty, params| parse(ty, params).unwrap().1.unwrap_err();
    assert!(matches!(
        err("dropout", serde_json::json!({ "p": 1.0 })),
        ParamError::OutOfRange { name: "p", .. }
    ));
    assert!(matches!(
        err("attention", serde_json::json!({ "embed_dim": 10, "num_heads": 4 })),
        ParamError::OutOfRange { name: "embed_dim", .. }
    ));
    assert!(matches!(
        err("attention", serde_json::json!({ "num_heads": 0 })),
        ParamError::OutOfRange { name: "num_heads", .. }
    ));
    assert!(matches!(
        err("maxpool2d", serde_json::json!({ "kernel_size": 2, "padding": 2 })),
        ParamError::OutOfRange { name: "padding", .. }
    ));
    assert!(matches!(
        err("adaptiveavgpool2d", serde_json::json!({ "output_size": [1, 2, 3] })),
        ParamError::OutOfRange { name: "output_size", .. }
    ));
}
