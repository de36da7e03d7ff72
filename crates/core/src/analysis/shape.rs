use std::time::Instant;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    dim::{Dimension, Dimensions},
    graph::Graph,
    node::NodeId,
    op::{MaxPool, Op},
    params::ParamError,
};

/// A rank or dimension mismatch at one operator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{op} expects a rank-{expected} input, got {shape}")]
    Rank {
        op: &'static str,
        expected: usize,
        shape: Dimensions,
    },

    #[error("{op} expects an input of rank at least {min}, got {shape}")]
    MinRank {
        op: &'static str,
        min: usize,
        shape: Dimensions,
    },

    #[error("{param} mismatch at {op}: expected {expected}, got {actual}")]
    ParamMismatch {
        op: &'static str,
        param: &'static str,
        expected: usize,
        actual: Dimension,
    },

    #[error("shape mismatch at {op}: {lhs} vs {rhs}")]
    Mismatch {
        op: &'static str,
        lhs: Dimensions,
        rhs: Dimensions,
    },

    #[error("{op} cannot infer {param} from the symbolic last dimension of {shape}")]
    Symbolic {
        op: &'static str,
        param: &'static str,
        shape: Dimensions,
    },

    #[error("{op} output dimensions are non-positive for input {shape}")]
    NonPositive { op: &'static str, shape: Dimensions },

    #[error("{op}: embed_dim {embed_dim} is not divisible by num_heads {num_heads}")]
    NotDivisible {
        op: &'static str,
        embed_dim: usize,
        num_heads: usize,
    },

    #[error("{op}: dim {dim} is out of range for {shape}")]
    Axis {
        op: &'static str,
        dim: i64,
        shape: Dimensions,
    },

    #[error("{op} output size does not fit in 64 bits for input {shape}")]
    Overflow { op: &'static str, shape: Dimensions },

    #[error("{op}: sequence length {len} exceeds max_len {max_len}")]
    SequenceTooLong {
        op: &'static str,
        len: usize,
        max_len: usize,
    },
}

/// Why a node failed on its own account.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Resolution state of a node's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Resolved(Dimensions),
    /// An upstream node errored or is itself unresolved.
    Unresolved,
    /// A required handle has no edge, here or upstream.
    Unreachable,
    Errored(NodeError),
}

#[derive(Debug, Clone, Default)]
pub struct ShapeInference {
    pub order: Vec<NodeId>,
    pub states: FxHashMap<NodeId, NodeState>,
}

impl NodeState {
    pub fn shape(&self) -> Option<&Dimensions> {
        match self {
            NodeState::Resolved(shape) => Some(shape),
            _ => None,
        }
    }
}

impl ShapeInference {
    pub fn state(&self, id: NodeId) -> Option<&NodeState> {
        self.states.get(&id)
    }

    pub fn shape(&self, id: NodeId) -> Option<&Dimensions> {
        self.state(id).and_then(NodeState::shape)
    }

    /// Resolved shapes feeding `id`, or `None` unless all of them resolved.
    pub fn input_shapes(&self, graph: &Graph, id: NodeId) -> Option<Vec<&Dimensions>> {
        graph.nodes[id]
            .inputs
            .iter()
            .flatten()
            .map(|&input| self.shape(input))
            .collect()
    }
}

/// Propagates shapes through `graph` in topological order. Failures are
/// recorded per node and evaluation continues on independent branches.
/// `input_shapes` maps source node ids to externally resolved shapes.
pub fn infer_shapes(
    graph: &Graph,
    input_shapes: &FxHashMap<String, Dimensions>,
) -> ShapeInference {
    let start = Instant::now();
    let mut inference = ShapeInference {
        order: graph.topo_sort_nodes(),
        states: FxHashMap::default(),
    };

    for &id in &inference.order {
        let state = infer_shape(graph, &inference.states, input_shapes, id);
        log::debug!(
            "infer_shape: {} ({}) => {:?}",
            graph.nodes[id].name,
            graph.nodes[id].ty,
            state
        );
        inference.states.insert(id, state);
    }

    log::info!("infer_shapes: {:?}", start.elapsed());

    inference
}

fn infer_shape(
    graph: &Graph,
    states: &FxHashMap<NodeId, NodeState>,
    input_shapes: &FxHashMap<String, Dimensions>,
    id: NodeId,
) -> NodeState {
    let node = &graph.nodes[id];
    let op = match &node.op {
        Ok(op) => op,
        Err(err) => return NodeState::Errored(err.clone().into()),
    };

    if op.is_source() {
        if let Some(shape) = input_shapes.get(&node.name) {
            return NodeState::Resolved(shape.clone());
        }
    }

    let mut unreachable = node.unconnected_handles().next().is_some();
    let mut inputs = vec![];
    for input in node.inputs.iter().flatten() {
        match states.get(input) {
            Some(NodeState::Resolved(shape)) => inputs.push(shape),
            Some(NodeState::Unreachable) => unreachable = true,
            Some(NodeState::Unresolved | NodeState::Errored(_)) | None => {
                return NodeState::Unresolved
            }
        }
    }
    if unreachable {
        return NodeState::Unreachable;
    }

    match op.compute_output_shape(&inputs) {
        Ok(shape) => NodeState::Resolved(shape),
        Err(err) => NodeState::Errored(err.into()),
    }
}

impl Op {
    /// Computes the output shape from the shapes on the connected input
    /// handles, in handle order.
    pub fn compute_output_shape(&self, inputs: &[&Dimensions]) -> Result<Dimensions, ShapeError> {
        let op = self.name();

        match self {
            Op::Input(input) => Ok(Dimensions::batched(&input.features)),
            Op::TextInput(input) => Ok(Dimensions::batched(&[input.seq_len])),
            // Element-wise and pass-through operations.
            Op::Output | Op::Identity | Op::Activation(_) | Op::Dropout(_) => {
                Ok(inputs[0].clone())
            }
            Op::LayerNorm => {
                expect_min_rank(op, inputs[0], 1)?;
                Ok(inputs[0].clone())
            }
            Op::BatchNorm => {
                expect_min_rank(op, inputs[0], 2)?;
                Ok(inputs[0].clone())
            }
            Op::Softmax(softmax) => {
                let input = inputs[0];
                input.normalize_axis(softmax.dim).ok_or_else(|| ShapeError::Axis {
                    op,
                    dim: softmax.dim,
                    shape: input.clone(),
                })?;
                Ok(input.clone())
            }
            Op::Flatten => {
                let input = inputs[0];
                expect_min_rank(op, input, 2)?;
                let features =
                    Dimensions::product(&input[1..]).ok_or_else(|| overflow(op, input))?;
                Ok(vec![input[0], features].into())
            }
            Op::Linear(linear) => {
                let input = inputs[0];
                expect_min_rank(op, input, 1)?;
                check_features(op, "in_features", linear.in_features, input, input.len() - 1)?;
                Ok(input.with_last(Dimension::Static(linear.out_features)))
            }
            Op::Conv2d(conv) => {
                let input = inputs[0];
                expect_rank(op, input, 4)?;
                check_features(op, "in_channels", conv.in_channels, input, 1)?;
                let pool = MaxPool {
                    kernel_size: conv.kernel_size,
                    stride: conv.stride,
                    padding: conv.padding,
                };
                Ok(vec![
                    input[0],
                    Dimension::Static(conv.out_channels),
                    window_output(op, &pool, input, input[2])?,
                    window_output(op, &pool, input, input[3])?,
                ]
                .into())
            }
            Op::MaxPool2d(pool) => {
                let input = inputs[0];
                expect_rank(op, input, 4)?;
                Ok(vec![
                    input[0],
                    input[1],
                    window_output(op, pool, input, input[2])?,
                    window_output(op, pool, input, input[3])?,
                ]
                .into())
            }
            Op::MaxPool1d(pool) => {
                let input = inputs[0];
                expect_rank(op, input, 3)?;
                Ok(vec![input[0], input[1], window_output(op, pool, input, input[2])?].into())
            }
            Op::AdaptiveAvgPool2d(pool) => {
                let input = inputs[0];
                expect_rank(op, input, 4)?;
                let [h, w] = pool.output_size;
                Ok(vec![input[0], input[1], h.into(), w.into()].into())
            }
            Op::Embedding(embedding) => {
                let input = inputs[0];
                expect_rank(op, input, 2)?;
                Ok(vec![input[0], input[1], embedding.embedding_dim.into()].into())
            }
            Op::PositionalEmbedding(pos) | Op::PositionalEncoding(pos) => {
                let input = inputs[0];
                expect_rank(op, input, 3)?;
                if let Dimension::Static(len) = input[1] {
                    if len > pos.max_len {
                        return Err(ShapeError::SequenceTooLong {
                            op,
                            len,
                            max_len: pos.max_len,
                        });
                    }
                }
                check_features(op, "d_model", pos.d_model, input, 2)?;
                Ok(input.clone())
            }
            Op::Attention(attention) => {
                let input = inputs[0];
                expect_rank(op, input, 3)?;
                let embed_dim =
                    check_features(op, "embed_dim", attention.embed_dim, input, 2)?;
                if embed_dim % attention.num_heads != 0 {
                    return Err(ShapeError::NotDivisible {
                        op,
                        embed_dim,
                        num_heads: attention.num_heads,
                    });
                }
                Ok(input.clone())
            }
            Op::Add => {
                let (lhs, rhs) = (inputs[0], inputs[1]);
                if !lhs.is_compatible(rhs) {
                    return Err(ShapeError::Mismatch {
                        op,
                        lhs: lhs.clone(),
                        rhs: rhs.clone(),
                    });
                }
                Ok(lhs.clone())
            }
            Op::Concat(concat) => {
                let first = inputs[0];
                let axis = first.normalize_axis(concat.dim).ok_or_else(|| ShapeError::Axis {
                    op,
                    dim: concat.dim,
                    shape: first.clone(),
                })?;
                for &other in &inputs[1..] {
                    let compatible = first.len() == other.len()
                        && (0..first.len())
                            .filter(|&i| i != axis)
                            .all(|i| first[i].is_compatible(other[i]));
                    if !compatible {
                        return Err(ShapeError::Mismatch {
                            op,
                            lhs: first.clone(),
                            rhs: other.clone(),
                        });
                    }
                }
                let mut output = first.0.clone();
                output[axis] = if inputs.iter().any(|input| input[axis] == Dimension::Batch) {
                    Dimension::Batch
                } else {
                    inputs
                        .iter()
                        .try_fold(0usize, |acc, input| acc.checked_add(input[axis].as_static()?))
                        .map(Dimension::Static)
                        .ok_or_else(|| overflow(op, first))?
                };
                Ok(output.into())
            }
        }
    }
}

fn overflow(op: &'static str, input: &Dimensions) -> ShapeError {
    ShapeError::Overflow {
        op,
        shape: input.clone(),
    }
}

fn expect_rank(op: &'static str, input: &Dimensions, rank: usize) -> Result<(), ShapeError> {
    if input.len() != rank {
        return Err(ShapeError::Rank {
            op,
            expected: rank,
            shape: input.clone(),
        });
    }
    Ok(())
}

fn expect_min_rank(op: &'static str, input: &Dimensions, min: usize) -> Result<(), ShapeError> {
    if input.len() < min {
        return Err(ShapeError::MinRank {
            op,
            min,
            shape: input.clone(),
        });
    }
    Ok(())
}

/// Checks the feature dimension at `axis` against a declared size, or infers
/// it from the input when none was declared.
fn check_features(
    op: &'static str,
    param: &'static str,
    declared: Option<usize>,
    input: &Dimensions,
    axis: usize,
) -> Result<usize, ShapeError> {
    let actual = input[axis];
    match (declared, actual) {
        (Some(expected), Dimension::Static(actual)) if expected == actual => Ok(expected),
        (Some(expected), actual) => Err(ShapeError::ParamMismatch {
            op,
            param,
            expected,
            actual,
        }),
        (None, Dimension::Static(actual)) => Ok(actual),
        (None, Dimension::Batch) => Err(ShapeError::Symbolic {
            op,
            param,
            shape: input.clone(),
        }),
    }
}

/// `floor((size + 2 * padding - kernel_size) / stride) + 1`
fn window_output(
    op: &'static str,
    window: &MaxPool,
    input: &Dimensions,
    size: Dimension,
) -> Result<Dimension, ShapeError> {
    let Dimension::Static(size) = size else {
        return Ok(Dimension::Batch);
    };
    let padded = window
        .padding
        .checked_mul(2)
        .and_then(|padding| padding.checked_add(size))
        .ok_or_else(|| overflow(op, input))?;
    if padded < window.kernel_size {
        return Err(ShapeError::NonPositive {
            op,
            shape: input.clone(),
        });
    }
    Ok(Dimension::Static(
        (padded - window.kernel_size) / window.stride + 1,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{
        ActivationFn, AdaptiveAvgPool2d, Attention, Concat, Conv2d, Embedding, Linear, Positional,
        Softmax,
    };

    fn b(features: &[usize]) -> Dimensions {
        Dimensions::batched(features)
    }

    fn linear(in_features: Option<usize>, out_features: usize) -> Op {
        Op::Linear(Linear {
            in_features,
            out_features,
            bias: true,
        })
    }

    #[test]
    fn flatten_law() {
        let out = Op::Flatten.compute_output_shape(&[&b(&[1, 28, 28])]).unwrap();
        assert_eq!(out, b(&[784]));
        let out = Op::Flatten.compute_output_shape(&[&b(&[64, 7, 7])]).unwrap();
        assert_eq!(out, b(&[3136]));
        assert!(matches!(
            Op::Flatten.compute_output_shape(&[&b(&[])]),
            Err(ShapeError::MinRank { .. })
        ));
        let err = Op::Flatten
            .compute_output_shape(&[&b(&[1 << 40, 1 << 40])])
            .unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"Flatten output size does not fit in 64 bits for input [B, 1099511627776, 1099511627776]");
    }

    #[test]
    fn linear_law() {
        let op = linear(Some(784), 128);
        assert_eq!(op.compute_output_shape(&[&b(&[784])]).unwrap(), b(&[128]));
        let err = op.compute_output_shape(&[&b(&[512])]).unwrap_err();
        assert!(err.to_string().starts_with("in_features mismatch"));
        insta::assert_snapshot!(err.to_string(), @"in_features mismatch at Linear: expected 784, got 512");
    }

    #[test]
    fn linear_infers_in_features() {
        let op = linear(None, 10);
        assert_eq!(op.compute_output_shape(&[&b(&[16, 32])]).unwrap(), b(&[16, 10]));
        assert!(matches!(
            op.compute_output_shape(&[&Dimensions(vec![Dimension::Batch])]),
            Err(ShapeError::Symbolic { .. })
        ));
    }

    #[test]
    fn add_law() {
        let x = b(&[784]);
        assert_eq!(Op::Add.compute_output_shape(&[&x, &x]).unwrap(), x);
        let err = Op::Add.compute_output_shape(&[&x, &b(&[512])]).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"shape mismatch at Add: [B, 784] vs [B, 512]");
    }

    #[test]
    fn conv2d() {
        let conv = |in_channels, kernel_size, stride, padding| {
            Op::Conv2d(Conv2d {
                in_channels,
                out_channels: 32,
                kernel_size,
                stride,
                padding,
                bias: true,
            })
        };
        let x = b(&[3, 32, 32]);
        assert_eq!(
            conv(Some(3), 3, 1, 0).compute_output_shape(&[&x]).unwrap(),
            b(&[32, 30, 30])
        );
        assert_eq!(
            conv(None, 3, 2, 1).compute_output_shape(&[&x]).unwrap(),
            b(&[32, 16, 16])
        );
        assert!(matches!(
            conv(Some(1), 3, 1, 0).compute_output_shape(&[&x]),
            Err(ShapeError::ParamMismatch { param: "in_channels", .. })
        ));
        assert!(matches!(
            conv(None, 7, 1, 0).compute_output_shape(&[&b(&[3, 4, 4])]),
            Err(ShapeError::NonPositive { .. })
        ));
        assert!(matches!(
            conv(None, 3, 1, 0).compute_output_shape(&[&b(&[784])]),
            Err(ShapeError::Rank { expected: 4, .. })
        ));
        assert!(matches!(
            conv(None, 3, 1, usize::MAX / 2).compute_output_shape(&[&x]),
            Err(ShapeError::Overflow { op: "Conv2D", .. })
        ));
        assert!(matches!(
            conv(None, 3, 1, 1 << 63).compute_output_shape(&[&x]),
            Err(ShapeError::Overflow { .. })
        ));
    }

    #[test]
    fn pooling() {
        let pool = MaxPool {
            kernel_size: 2,
            stride: 2,
            padding: 0,
        };
        assert_eq!(
            Op::MaxPool2d(pool.clone())
                .compute_output_shape(&[&b(&[8, 28, 28])])
                .unwrap(),
            b(&[8, 14, 14])
        );
        assert_eq!(
            Op::MaxPool1d(pool)
                .compute_output_shape(&[&b(&[8, 9])])
                .unwrap(),
            b(&[8, 4])
        );
        let adaptive = Op::AdaptiveAvgPool2d(AdaptiveAvgPool2d {
            output_size: [1, 1],
        });
        assert_eq!(
            adaptive.compute_output_shape(&[&b(&[64, 7, 7])]).unwrap(),
            b(&[64, 1, 1])
        );
    }

    #[test]
    fn sequence_ops() {
        let ids = b(&[16]);
        let embedded = Op::Embedding(Embedding {
            num_embeddings: 1000,
            embedding_dim: 64,
        })
        .compute_output_shape(&[&ids])
        .unwrap();
        assert_eq!(embedded, b(&[16, 64]));

        let positional = Op::PositionalEmbedding(Positional {
            max_len: 8,
            d_model: None,
        });
        assert!(matches!(
            positional.compute_output_shape(&[&embedded]),
            Err(ShapeError::SequenceTooLong { len: 16, max_len: 8, .. })
        ));

        let attention = |embed_dim, num_heads| {
            Op::Attention(Attention {
                embed_dim,
                num_heads,
            })
        };
        assert_eq!(
            attention(Some(64), 8).compute_output_shape(&[&embedded]).unwrap(),
            embedded
        );
        assert!(matches!(
            attention(None, 5).compute_output_shape(&[&embedded]),
            Err(ShapeError::NotDivisible { embed_dim: 64, num_heads: 5, .. })
        ));
        assert!(matches!(
            attention(Some(64), 4).compute_output_shape(&[&b(&[64])]),
            Err(ShapeError::Rank { expected: 3, .. })
        ));
    }

    #[test]
    fn concat() {
        let op = Op::Concat(Concat { dim: 1 });
        assert_eq!(
            op.compute_output_shape(&[&b(&[16, 4]), &b(&[8, 4]), &b(&[1, 4])])
                .unwrap(),
            b(&[25, 4])
        );
        assert!(matches!(
            op.compute_output_shape(&[&b(&[16, 4]), &b(&[16, 5])]),
            Err(ShapeError::Mismatch { .. })
        ));
        let op = Op::Concat(Concat { dim: -3 });
        assert!(matches!(
            op.compute_output_shape(&[&b(&[4]), &b(&[4])]),
            Err(ShapeError::Axis { dim: -3, .. })
        ));
        assert!(matches!(
            op.compute_output_shape(&[&b(&[usize::MAX, 4]), &b(&[1, 4])]),
            Err(ShapeError::Overflow { .. })
        ));
        // Concatenating along the batch keeps it symbolic.
        let op = Op::Concat(Concat { dim: 0 });
        assert_eq!(
            op.compute_output_shape(&[&b(&[4]), &b(&[4])]).unwrap(),
            b(&[4])
        );
    }

    #[test]
    fn identity_ops() {
        let x = b(&[10, 20]);
        for op in [
            Op::Output,
            Op::Identity,
            Op::Activation(ActivationFn::Gelu),
            Op::LayerNorm,
            Op::BatchNorm,
            Op::Softmax(Softmax { dim: -1 }),
        ] {
            assert_eq!(op.compute_output_shape(&[&x]).unwrap(), x, "{op:?}");
        }
        assert!(Op::Softmax(Softmax { dim: 3 })
            .compute_output_shape(&[&x])
            .is_err());
    }
}
