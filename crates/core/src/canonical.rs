//! Canonical forms of graph descriptions, for structural comparison.

use std::{cmp::Ordering, time::Instant};

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::{
    catalog::{normalize_type_name, Catalog},
    description::{GraphDescription, NodeDescription},
    op::Op,
};

/// How nodes are sequenced before labels and edges are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CanonicalOrder {
    /// By layout position: x, then y, then description order.
    #[default]
    Layout,
    /// Kahn's algorithm with ties broken by label, degrees and layout, so
    /// that moving nodes around the canvas does not matter.
    Topological,
}

/// Node labels in canonical order, plus edges as sorted index pairs into
/// that order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct CanonicalForm {
    pub labels: Vec<String>,
    pub edges: Vec<(usize, usize)>,
}

/// Kind name of a node. A generic activation that selects a concrete
/// function is labelled with that function, so it matches the dedicated
/// operator.
pub fn canonical_label(node: &NodeDescription, catalog: &Catalog) -> String {
    match catalog.parse(&node.ty, &node.params) {
        Some((_, Ok(Op::Activation(f)))) => f.kind().name().to_owned(),
        Some((kind, _)) => kind.name().to_owned(),
        None => normalize_type_name(&node.ty),
    }
}

pub fn canonicalize(
    desc: &GraphDescription,
    catalog: &Catalog,
    order: CanonicalOrder,
) -> CanonicalForm {
    let start = Instant::now();

    let labels = desc
        .nodes
        .iter()
        .map(|node| canonical_label(node, catalog))
        .collect::<Vec<_>>();
    let sequence = match order {
        CanonicalOrder::Layout => layout_order(&desc.nodes),
        CanonicalOrder::Topological => topological_order(desc, &labels),
    };

    let mut canonical_index = FxHashMap::default();
    for (i, &node) in sequence.iter().enumerate() {
        canonical_index
            .entry(desc.nodes[node].id.as_str())
            .or_insert(i);
    }

    let mut edges = desc
        .edges
        .iter()
        .filter_map(|edge| {
            let source = *canonical_index.get(edge.source.as_str())?;
            let target = *canonical_index.get(edge.target.as_str())?;
            Some((source, target))
        })
        .collect::<Vec<_>>();
    edges.sort_unstable();

    let labels = sequence.iter().map(|&node| labels[node].clone()).collect();

    log::info!(
        "canonicalize '{}' ({:?}): {:?}",
        desc.metadata.name,
        order,
        start.elapsed()
    );

    CanonicalForm { labels, edges }
}

/// Description indices sorted by position. The sort is stable, so ties keep
/// description order.
fn layout_order(nodes: &[NodeDescription]) -> Vec<usize> {
    let mut order = (0..nodes.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| compare_position(&nodes[a], &nodes[b]));
    order
}

fn compare_position(a: &NodeDescription, b: &NodeDescription) -> Ordering {
    a.position
        .x
        .total_cmp(&b.position.x)
        .then_with(|| a.position.y.total_cmp(&b.position.y))
}

fn topological_order(desc: &GraphDescription, labels: &[String]) -> Vec<usize> {
    let nodes = &desc.nodes;

    let mut index = FxHashMap::default();
    for (i, node) in nodes.iter().enumerate() {
        index.entry(node.id.as_str()).or_insert(i);
    }

    let mut users = vec![vec![]; nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];
    let mut out_degree = vec![0usize; nodes.len()];
    for edge in &desc.edges {
        let (Some(&source), Some(&target)) = (
            index.get(edge.source.as_str()),
            index.get(edge.target.as_str()),
        ) else {
            continue;
        };
        users[source].push(target);
        in_degree[target] += 1;
        out_degree[source] += 1;
    }

    let key = |&a: &usize, &b: &usize| {
        labels[a]
            .cmp(&labels[b])
            .then(in_degree[a].cmp(&in_degree[b]))
            .then(out_degree[a].cmp(&out_degree[b]))
            .then_with(|| compare_position(&nodes[a], &nodes[b]))
            .then(a.cmp(&b))
    };

    let mut remaining = in_degree.clone();
    let mut ready = (0..nodes.len())
        .filter(|&i| remaining[i] == 0)
        .collect::<Vec<_>>();
    let mut order = Vec::with_capacity(nodes.len());
    let mut placed = vec![false; nodes.len()];

    while let Some(pos) = ready
        .iter()
        .enumerate()
        .min_by(|x, y| key(x.1, y.1))
        .map(|(pos, _)| pos)
    {
        let node = ready.swap_remove(pos);
        order.push(node);
        placed[node] = true;
        for &user in &users[node] {
            remaining[user] -= 1;
            if remaining[user] == 0 {
                ready.push(user);
            }
        }
    }

    // Whatever is left sits on or behind a cycle.
    order.extend(
        layout_order(nodes)
            .into_iter()
            .filter(|&node| !placed[node]),
    );

    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mlp(ids: [&str; 3], xs: [f64; 3]) -> GraphDescription {
        GraphDescription::new("mlp")
            .with_node(NodeDescription::new(ids[2], "Output").at(xs[2], 0.0))
            .with_node(NodeDescription::new(ids[0], "Input").at(xs[0], 0.0))
            .with_node(
                NodeDescription::new(ids[1], "Linear")
                    .with_param("out_features", 10)
                    .at(xs[1], 0.0),
            )
            .with_edge(ids[0], ids[1], "in")
            .with_edge(ids[1], ids[2], "in")
    }

    #[test]
    fn layout() {
        let form = canonicalize(
            &mlp(["a", "b", "c"], [0.0, 100.0, 200.0]),
            &Catalog::standard(),
            CanonicalOrder::Layout,
        );
        assert_eq!(form.labels, vec!["input", "linear", "output"]);
        assert_eq!(form.edges, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn topological_ignores_positions() {
        let catalog = Catalog::standard();
        let a = canonicalize(
            &mlp(["a", "b", "c"], [0.0, 100.0, 200.0]),
            &catalog,
            CanonicalOrder::Topological,
        );
        let b = canonicalize(
            &mlp(["x", "y", "z"], [500.0, -20.0, 0.0]),
            &catalog,
            CanonicalOrder::Topological,
        );
        assert_eq!(a, b);

        // Layout order does see the shuffle.
        let c = canonicalize(
            &mlp(["x", "y", "z"], [500.0, -20.0, 0.0]),
            &catalog,
            CanonicalOrder::Layout,
        );
        assert_eq!(c.labels, vec!["linear", "output", "input"]);
        assert_ne!(a, c);
    }

    #[test]
    fn labels() {
        let catalog = Catalog::standard();
        let label = |node: NodeDescription| canonical_label(&node, &catalog);
        assert_eq!(
            label(NodeDescription::new("a", "Activation").with_param("function", "GELU")),
            "gelu"
        );
        assert_eq!(label(NodeDescription::new("a", "Activation")), "relu");
        assert_eq!(
            label(NodeDescription::new("a", "Activation").with_param("function", "swish")),
            "activation"
        );
        assert_eq!(label(NodeDescription::new("a", "MaxPool")), "maxpool2d");
        assert_eq!(label(NodeDescription::new("a", "My-Block")), "myblock");
    }

    #[test]
    fn drops_dangling_edges_and_keeps_cycles() {
        let desc = GraphDescription::new("loop")
            .with_node(NodeDescription::new("a", "relu").at(0.0, 0.0))
            .with_node(NodeDescription::new("b", "tanh").at(1.0, 0.0))
            .with_edge("a", "b", "in")
            .with_edge("b", "a", "in")
            .with_edge("a", "ghost", "in");
        let form = canonicalize(&desc, &Catalog::standard(), CanonicalOrder::Topological);
        assert_eq!(form.labels, vec!["relu", "tanh"]);
        assert_eq!(form.edges, vec![(0, 1), (1, 0)]);
    }
}
