use std::{collections::VecDeque, time::Instant};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{
    catalog::Catalog,
    description::GraphDescription,
    node::{Edge, Node, NodeArena, NodeId},
    op::Op,
};

/// A violation of the graph invariants. Fatal for the whole validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Unsupported graph description version '{0}'")]
    UnsupportedVersion(String),

    #[error("Duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("Edge '{edge}' references unknown node '{node}'")]
    DanglingEdge { edge: String, node: String },

    #[error("Edge '{edge}' uses handle '{handle}', which node '{node}' does not have")]
    InvalidHandle {
        edge: String,
        node: String,
        handle: String,
    },

    #[error("Handle '{handle}' of node '{node}' already has an incoming edge (edge '{edge}')")]
    MultipleIncoming {
        edge: String,
        node: String,
        handle: String,
    },

    #[error("Graph contains a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// A structurally valid, acyclic graph. Immutable once built.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    pub name: String,
    pub nodes: NodeArena,
    pub edges: Vec<Edge>,
    name_to_node: FxHashMap<String, NodeId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

impl Graph {
    /// Builds a graph from an untrusted description. Edge, id and handle
    /// errors are collected together; the cycle check only runs once those
    /// are clean.
    pub fn from_description(
        desc: &GraphDescription,
        catalog: &Catalog,
    ) -> Result<Self, Vec<StructuralError>> {
        let start = Instant::now();
        let mut errors = vec![];

        if desc.version != "1" && !desc.version.starts_with("1.") {
            errors.push(StructuralError::UnsupportedVersion(desc.version.clone()));
        }
        if desc.nodes.is_empty() {
            errors.push(StructuralError::EmptyGraph);
        }

        let mut graph = Graph {
            name: desc.metadata.name.clone(),
            ..Default::default()
        };

        for node in &desc.nodes {
            if graph.name_to_node.contains_key(&node.id) {
                errors.push(StructuralError::DuplicateNodeId(node.id.clone()));
                continue;
            }
            let (kind, op) = match catalog.parse(&node.ty, &node.params) {
                Some((kind, op)) => (Some(kind), op),
                None => (None, Ok(Op::Identity)),
            };
            let id = Node::new(&node.id, &node.ty, kind, op)
                .with_position(node.position)
                .alloc(&mut graph.nodes);
            graph.name_to_node.insert(node.id.clone(), id);
        }

        for edge in &desc.edges {
            let lookup = |name: &String| {
                graph
                    .name_to_node
                    .get(name)
                    .copied()
                    .ok_or_else(|| StructuralError::DanglingEdge {
                        edge: edge.id.clone(),
                        node: name.clone(),
                    })
            };
            let (source, target) = match (lookup(&edge.source), lookup(&edge.target)) {
                (Ok(source), Ok(target)) => (source, target),
                (source, target) => {
                    errors.extend(source.err());
                    errors.extend(target.err());
                    continue;
                }
            };

            if edge.source_handle != Op::OUT || !graph.nodes[source].has_output() {
                errors.push(StructuralError::InvalidHandle {
                    edge: edge.id.clone(),
                    node: edge.source.clone(),
                    handle: edge.source_handle.clone(),
                });
                continue;
            }

            let target_node = &mut graph.nodes[target];
            let Some(slot) = target_node
                .input_handles()
                .iter()
                .position(|h| h.name == edge.target_handle)
            else {
                errors.push(StructuralError::InvalidHandle {
                    edge: edge.id.clone(),
                    node: edge.target.clone(),
                    handle: edge.target_handle.clone(),
                });
                continue;
            };
            if target_node.inputs[slot].is_some() {
                errors.push(StructuralError::MultipleIncoming {
                    edge: edge.id.clone(),
                    node: edge.target.clone(),
                    handle: edge.target_handle.clone(),
                });
                continue;
            }
            target_node.inputs[slot] = Some(source);
            let target_handle = target_node.input_handles()[slot].name;

            graph.edges.push(Edge {
                name: edge.id.clone(),
                source,
                target,
                target_handle,
            });
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        if let Some(cycle) = graph.find_cycle() {
            let names = cycle
                .into_iter()
                .map(|id| graph.nodes[id].name.clone())
                .collect();
            return Err(vec![StructuralError::Cycle(names)]);
        }

        log::info!(
            "build graph '{}' ({} nodes, {} edges): {:?}",
            graph.name,
            graph.nodes.len(),
            graph.edges.len(),
            start.elapsed()
        );

        Ok(graph)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(name).copied()
    }

    /// Nodes fed by each node's output, one entry per edge.
    pub fn get_node_users(&self) -> FxHashMap<NodeId, Vec<NodeId>> {
        let mut node_users: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for edge in &self.edges {
            node_users.entry(edge.source).or_default().push(edge.target);
        }
        node_users
    }

    /// Kahn's algorithm, FIFO, seeded in description order.
    pub fn topo_sort_nodes(&self) -> Vec<NodeId> {
        let node_users = self.get_node_users();

        let mut nodes = vec![];
        let mut num_node_inputs = FxHashMap::default();
        let mut que = VecDeque::new();

        for (id, node) in self.nodes.iter() {
            let num_inputs = node.inputs.iter().flatten().count();
            num_node_inputs.insert(id, num_inputs);
            if num_inputs == 0 {
                que.push_back(id);
            }
        }

        while let Some(id) = que.pop_front() {
            nodes.push(id);
            for user in node_users.get(&id).into_iter().flatten() {
                let Some(num_inputs) = num_node_inputs.get_mut(user) else {
                    continue;
                };
                *num_inputs -= 1;
                if *num_inputs == 0 {
                    que.push_back(*user);
                }
            }
        }

        nodes
    }

    /// Iterative DFS. Returns the nodes of the first cycle found, in edge
    /// order. `path` mirrors the explicit stack.
    pub fn find_cycle(&self) -> Option<Vec<NodeId>> {
        let node_users = self.get_node_users();
        let mut visits = FxHashMap::default();
        let mut path = vec![];
        // (node, index of the next user to visit)
        let mut stack: Vec<(NodeId, usize)> = vec![];

        for (root, _) in self.nodes.iter() {
            if visits.contains_key(&root) {
                continue;
            }
            visits.insert(root, Visit::InProgress);
            path.push(root);
            stack.push((root, 0));

            while let Some((id, next)) = stack.last_mut() {
                let users = node_users.get(id).map_or(&[][..], Vec::as_slice);
                let Some(&user) = users.get(*next) else {
                    visits.insert(*id, Visit::Done);
                    stack.pop();
                    path.pop();
                    continue;
                };
                *next += 1;

                match visits.get(&user) {
                    Some(Visit::InProgress) => {
                        let start = path.iter().position(|&n| n == user)?;
                        return Some(path[start..].to_vec());
                    }
                    Some(Visit::Done) => {}
                    None => {
                        visits.insert(user, Visit::InProgress);
                        path.push(user);
                        stack.push((user, 0));
                    }
                }
            }
        }

        None
    }
}

#[cfg(test)]
use crate::description::NodeDescription;

#[cfg(test)]
fn chain(types: &[&str]) -> GraphDescription {
    let mut desc = GraphDescription::new("chain");
    for (i, ty) in types.iter().enumerate() {
        desc = desc.with_node(NodeDescription::new(format!("n{i}"), *ty));
    }
    for i in 1..types.len() {
        desc = desc.with_edge(format!("n{}", i - 1), format!("n{i}"), "in");
    }
    desc
}

#[test]
fn topo_sort() {
    // Nodes are listed in reverse so the order has to come from the edges.
    let desc = GraphDescription::new("reversed")
        .with_node(NodeDescription::new("out", "output"))
        .with_node(NodeDescription::new("relu", "relu"))
        .with_node(NodeDescription::new("in", "input"))
        .with_edge("relu", "out", "in")
        .with_edge("in", "relu", "in");
    let graph = Graph::from_description(&desc, &Catalog::standard()).unwrap();
    let order = graph
        .topo_sort_nodes()
        .into_iter()
        .map(|id| graph.nodes[id].name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["in", "relu", "out"]);
}

#[test]
fn rejects_duplicates_and_dangling_edges() {
    let desc = chain(&["input", "relu", "output"])
        .with_node(NodeDescription::new("n1", "tanh"))
        .with_edge("n0", "ghost", "in");
    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    assert_eq!(
        errors,
        vec![
            StructuralError::DuplicateNodeId("n1".into()),
            StructuralError::DanglingEdge {
                edge: "e-n0-ghost-2".into(),
                node: "ghost".into()
            },
        ]
    );
}

#[test]
fn rejects_bad_handles() {
    let desc = chain(&["input", "add", "output"]);
    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    assert!(matches!(
        &errors[..],
        [StructuralError::InvalidHandle { node, handle, .. }] if node == "n1" && handle == "in"
    ));

    // Output is a sink.
    let desc = chain(&["input", "output", "relu"]);
    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    assert!(matches!(
        &errors[..],
        [StructuralError::InvalidHandle { node, handle, .. }] if node == "n1" && handle == "out"
    ));
}

#[test]
fn rejects_fan_in() {
    let desc = chain(&["input", "relu"])
        .with_node(NodeDescription::new("other", "input"))
        .with_edge("other", "n1", "in");
    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    assert!(matches!(
        &errors[..],
        [StructuralError::MultipleIncoming { node, .. }] if node == "n1"
    ));
}

#[test]
fn reports_cycle_in_order() {
    let desc = chain(&["input", "add", "relu", "tanh"])
        .with_edge("n3", "n1", "in_b");
    // chain() wires n0 -> n1 through "in", which add does not have.
    let desc = GraphDescription {
        edges: desc
            .edges
            .into_iter()
            .map(|mut e| {
                if e.target == "n1" && e.target_handle == "in" {
                    e.target_handle = "in_a".into();
                }
                e
            })
            .collect(),
        ..desc
    };
    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    assert_eq!(
        errors,
        vec![StructuralError::Cycle(vec![
            "n1".into(),
            "n2".into(),
            "n3".into()
        ])]
    );
    assert_eq!(errors[0].to_string(), "Graph contains a cycle: n1 -> n2 -> n3");
}

#[test]
fn long_chain_has_no_cycle() {
    let types = vec!["relu"; 200_000];
    let desc = chain(&types);
    let graph = Graph::from_description(&desc, &Catalog::standard()).unwrap();
    assert_eq!(graph.find_cycle(), None);
    assert_eq!(graph.topo_sort_nodes().len(), 200_000);
}

#[test]
fn cycle_at_the_end_of_a_long_chain() {
    let mut desc = GraphDescription::new("loop")
        .with_node(NodeDescription::new("in", "input"))
        .with_node(NodeDescription::new("add", "add"))
        .with_edge("in", "add", "in_a");
    let mut prev = "add".to_owned();
    for i in 0..50_000 {
        let name = format!("r{i}");
        desc = desc
            .with_node(NodeDescription::new(name.clone(), "relu"))
            .with_edge(prev, name.clone(), "in");
        prev = name;
    }
    let desc = desc.with_edge(prev, "add", "in_b");

    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    let [StructuralError::Cycle(cycle)] = &errors[..] else {
        panic!("{errors:?}");
    };
    assert_eq!(cycle.len(), 50_001);
    assert_eq!(cycle[0], "add");
    assert_eq!(cycle[50_000], "r49999");
}

#[test]
fn self_loop_is_a_cycle() {
    let desc = GraphDescription::new("loop")
        .with_node(NodeDescription::new("a", "relu"))
        .with_edge("a", "a", "in");
    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    assert_eq!(errors, vec![StructuralError::Cycle(vec!["a".into()])]);
}

#[test]
fn rejects_empty_and_unknown_version() {
    let mut desc = GraphDescription::new("empty");
    desc.version = "2.0".into();
    let errors = Graph::from_description(&desc, &Catalog::standard()).unwrap_err();
    assert_eq!(
        errors,
        vec![
            StructuralError::UnsupportedVersion("2.0".into()),
            StructuralError::EmptyGraph
        ]
    );
}
