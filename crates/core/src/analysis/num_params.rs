use std::time::Instant;

use crate::{
    analysis::shape::ShapeInference,
    dim::{Dimension, Dimensions},
    graph::Graph,
    node::NodeId,
    op::Op,
    params::ParamError,
};

#[derive(Debug, Clone, Default)]
pub struct NumParams {
    pub total: usize,
    /// Nodes left out of `total` because their count overflows.
    pub errors: Vec<(NodeId, ParamError)>,
}

/// Sums learnable parameters over every node whose shape resolved.
pub fn compute_num_params(graph: &Graph, inference: &ShapeInference) -> NumParams {
    let start = Instant::now();
    let mut num_params = NumParams::default();

    for &id in &inference.order {
        let node = &graph.nodes[id];
        let Ok(op) = &node.op else { continue };
        if inference.shape(id).is_none() {
            continue;
        }
        let Some(inputs) = inference.input_shapes(graph, id) else {
            continue;
        };
        match op
            .num_params(&inputs)
            .and_then(|count| Some((count, num_params.total.checked_add(count)?)))
        {
            Some((count, total)) => {
                if count > 0 {
                    log::debug!("num_params: {} ({}) = {}", node.name, op.name(), count);
                }
                num_params.total = total;
            }
            None => {
                log::debug!("num_params: {} ({}) overflows", node.name, op.name());
                num_params
                    .errors
                    .push((id, ParamError::CountOverflow { op: op.name() }));
            }
        }
    }

    log::info!("compute_num_params: {:?}", start.elapsed());

    num_params
}

impl Op {
    /// Learnable parameter count, or `None` if it does not fit in a `usize`.
    /// Sizes the operator does not declare are taken from its resolved input
    /// shapes.
    pub fn num_params(&self, inputs: &[&Dimensions]) -> Option<usize> {
        let feature = |axis: usize| {
            inputs
                .first()
                .and_then(|x| x.get(axis).copied())
                .and_then(Dimension::as_static)
                .unwrap_or(0)
        };
        let last = || {
            inputs
                .first()
                .and_then(|x| x.last())
                .and_then(Dimension::as_static)
                .unwrap_or(0)
        };

        match self {
            // (in + bias) * out
            Op::Linear(linear) => linear
                .in_features
                .unwrap_or_else(last)
                .checked_add(usize::from(linear.bias))?
                .checked_mul(linear.out_features),
            // (in * k * k + bias) * out
            Op::Conv2d(conv) => conv
                .in_channels
                .unwrap_or_else(|| feature(1))
                .checked_mul(conv.kernel_size)?
                .checked_mul(conv.kernel_size)?
                .checked_add(usize::from(conv.bias))?
                .checked_mul(conv.out_channels),
            // Scale and shift.
            Op::LayerNorm => last().checked_mul(2),
            Op::BatchNorm => feature(1).checked_mul(2),
            Op::Embedding(embedding) => embedding
                .num_embeddings
                .checked_mul(embedding.embedding_dim),
            Op::PositionalEmbedding(pos) => {
                pos.max_len.checked_mul(pos.d_model.unwrap_or_else(last))
            }
            // Q, K, V and output projections, each with a bias: 4 * (e * e + e).
            Op::Attention(attention) => {
                let e = attention.embed_dim.unwrap_or_else(last);
                e.checked_add(1)?.checked_mul(e)?.checked_mul(4)
            }
            Op::Input(_)
            | Op::TextInput(_)
            | Op::Output
            | Op::MaxPool2d(_)
            | Op::MaxPool1d(_)
            | Op::AdaptiveAvgPool2d(_)
            | Op::Flatten
            | Op::Activation(_)
            | Op::Softmax(_)
            | Op::Dropout(_)
            | Op::PositionalEncoding(_)
            | Op::Add
            | Op::Concat(_)
            | Op::Identity => Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{Attention, Conv2d, Embedding, Linear, Positional};

    #[test]
    fn declared_sizes() {
        let linear = Op::Linear(Linear {
            in_features: Some(784),
            out_features: 128,
            bias: true,
        });
        assert_eq!(linear.num_params(&[]), Some(100480));

        let conv = Op::Conv2d(Conv2d {
            in_channels: Some(3),
            out_channels: 16,
            kernel_size: 3,
            stride: 1,
            padding: 1,
            bias: false,
        });
        assert_eq!(conv.num_params(&[]), Some(432));

        let embedding = Op::Embedding(Embedding {
            num_embeddings: 1000,
            embedding_dim: 64,
        });
        assert_eq!(embedding.num_params(&[]), Some(64000));
    }

    #[test]
    fn inferred_sizes() {
        let x = Dimensions::batched(&[16, 64]);
        let linear = Op::Linear(Linear {
            in_features: None,
            out_features: 10,
            bias: true,
        });
        assert_eq!(linear.num_params(&[&x]), Some(650));
        assert_eq!(Op::LayerNorm.num_params(&[&x]), Some(128));
        assert_eq!(Op::BatchNorm.num_params(&[&x]), Some(32));

        let attention = Op::Attention(Attention {
            embed_dim: None,
            num_heads: 8,
        });
        assert_eq!(attention.num_params(&[&x]), Some(4 * 64 * 64 + 4 * 64));

        let pos = Op::PositionalEmbedding(Positional {
            max_len: 128,
            d_model: None,
        });
        assert_eq!(pos.num_params(&[&x]), Some(128 * 64));
        let pos = Op::PositionalEncoding(Positional {
            max_len: 128,
            d_model: None,
        });
        assert_eq!(pos.num_params(&[&x]), Some(0));
    }

    #[test]
    fn overflowing_sizes() {
        let embedding = Op::Embedding(Embedding {
            num_embeddings: 1 << 40,
            embedding_dim: 1 << 40,
        });
        assert_eq!(embedding.num_params(&[]), None);

        let linear = Op::Linear(Linear {
            in_features: Some(usize::MAX),
            out_features: 1,
            bias: true,
        });
        assert_eq!(linear.num_params(&[]), None);

        let wide = Dimensions::batched(&[1 << 32]);
        let attention = Op::Attention(Attention {
            embed_dim: None,
            num_heads: 1,
        });
        assert_eq!(attention.num_params(&[&wide]), None);
        assert_eq!(Op::LayerNorm.num_params(&[&wide]), Some(1 << 33));
    }
}
