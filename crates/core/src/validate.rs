//! Validation entry point: builds the graph, propagates shapes, counts
//! parameters and gathers every diagnostic into one report.

use std::{collections::BTreeMap, time::Instant};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{
        num_params::compute_num_params,
        shape::{infer_shapes, NodeError, NodeState},
    },
    canonical::CanonicalOrder,
    catalog::Catalog,
    compare::Grader,
    description::GraphDescription,
    dim::Dimensions,
    graph::{Graph, StructuralError},
    node::Node,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StructuralError,
    ParamError,
    ShapeError,
    UnknownOperatorWarning,
    UnconnectedInputWarning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    /// `OK`, or the message of the first error.
    pub message: String,
    /// Output shape of every node, `None` where it did not resolve.
    pub shapes: BTreeMap<String, Option<Dimensions>>,
    pub errors: Vec<ErrorRecord>,
    pub total_params: usize,
}

pub struct ValidatorBuilder<'a> {
    catalog: &'a Catalog,
    input_shapes: FxHashMap<String, Dimensions>,
    canonical_order: CanonicalOrder,
}

pub struct Validator<'a> {
    catalog: &'a Catalog,
    input_shapes: FxHashMap<String, Dimensions>,
    canonical_order: CanonicalOrder,
}

impl ErrorKind {
    pub fn is_warning(self) -> bool {
        matches!(
            self,
            ErrorKind::UnknownOperatorWarning | ErrorKind::UnconnectedInputWarning
        )
    }
}

impl ErrorRecord {
    fn node(node: &Node, kind: ErrorKind, message: String) -> Self {
        Self {
            node_id: Some(node.name.clone()),
            edge_id: None,
            kind,
            message,
        }
    }
}

impl From<&StructuralError> for ErrorRecord {
    fn from(err: &StructuralError) -> Self {
        let (node_id, edge_id) = match err {
            StructuralError::EmptyGraph | StructuralError::UnsupportedVersion(_) => (None, None),
            StructuralError::DuplicateNodeId(node) => (Some(node), None),
            StructuralError::DanglingEdge { edge, .. } => (None, Some(edge)),
            StructuralError::InvalidHandle { edge, node, .. }
            | StructuralError::MultipleIncoming { edge, node, .. } => (Some(node), Some(edge)),
            StructuralError::Cycle(nodes) => (nodes.first(), None),
        };
        Self {
            node_id: node_id.cloned(),
            edge_id: edge_id.cloned(),
            kind: ErrorKind::StructuralError,
            message: err.to_string(),
        }
    }
}

impl ValidationReport {
    fn new(
        shapes: BTreeMap<String, Option<Dimensions>>,
        errors: Vec<ErrorRecord>,
        total_params: usize,
    ) -> Self {
        let first_error = errors.iter().find(|e| !e.kind.is_warning());
        Self {
            valid: first_error.is_none(),
            message: first_error.map_or_else(|| "OK".to_owned(), |e| e.message.clone()),
            shapes,
            errors,
            total_params,
        }
    }

    pub fn shape(&self, node: &str) -> Option<&Dimensions> {
        self.shapes.get(node)?.as_ref()
    }

    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl<'a> ValidatorBuilder<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            input_shapes: FxHashMap::default(),
            canonical_order: CanonicalOrder::default(),
        }
    }

    /// Overrides the shape of the Input or TextInput node `node`, e.g. with
    /// one resolved from a dataset.
    pub fn with_input_shape(mut self, node: impl Into<String>, shape: Dimensions) -> Self {
        self.input_shapes.insert(node.into(), shape);
        self
    }

    pub fn with_input_shapes(
        mut self,
        shapes: impl IntoIterator<Item = (String, Dimensions)>,
    ) -> Self {
        self.input_shapes.extend(shapes);
        self
    }

    pub fn with_canonical_order(mut self, order: CanonicalOrder) -> Self {
        self.canonical_order = order;
        self
    }

    pub fn build(self) -> Validator<'a> {
        Validator {
            catalog: self.catalog,
            input_shapes: self.input_shapes,
            canonical_order: self.canonical_order,
        }
    }
}

impl<'a> Validator<'a> {
    pub fn validate(&self, desc: &GraphDescription) -> ValidationReport {
        let start = Instant::now();

        let graph = match Graph::from_description(desc, self.catalog) {
            Ok(graph) => graph,
            Err(errors) => {
                log::debug!("validate: {} structural error(s)", errors.len());
                let errors = errors.iter().map(ErrorRecord::from).collect();
                return ValidationReport::new(BTreeMap::new(), errors, 0);
            }
        };

        for name in self.input_shapes.keys() {
            let is_source = graph.node_id(name).map_or(false, |id| {
                matches!(&graph.nodes[id].op, Ok(op) if op.is_source())
            });
            if !is_source {
                log::warn!("validate: '{}' is not an input node; its shape is ignored", name);
            }
        }

        let inference = infer_shapes(&graph, &self.input_shapes);
        let mut shapes = BTreeMap::new();
        let mut errors = vec![];

        for &id in &inference.order {
            let node = &graph.nodes[id];

            if node.kind.is_none() {
                errors.push(ErrorRecord::node(
                    node,
                    ErrorKind::UnknownOperatorWarning,
                    format!("Unknown operator type '{}', treated as identity", node.ty),
                ));
            }

            match inference.state(id) {
                Some(NodeState::Errored(NodeError::Param(err))) => {
                    errors.push(ErrorRecord::node(node, ErrorKind::ParamError, err.to_string()))
                }
                Some(NodeState::Errored(NodeError::Shape(err))) => {
                    errors.push(ErrorRecord::node(node, ErrorKind::ShapeError, err.to_string()))
                }
                Some(NodeState::Unreachable) => {
                    let handles = node.unconnected_handles().collect::<Vec<_>>();
                    if !handles.is_empty() {
                        errors.push(ErrorRecord::node(
                            node,
                            ErrorKind::UnconnectedInputWarning,
                            format!(
                                "Node '{}' has no incoming edge on {}",
                                node.name,
                                handles.join(", ")
                            ),
                        ));
                    }
                }
                Some(NodeState::Resolved(_) | NodeState::Unresolved) | None => {}
            }

            shapes.insert(node.name.clone(), inference.shape(id).cloned());
        }

        let num_params = compute_num_params(&graph, &inference);
        for (id, err) in &num_params.errors {
            errors.push(ErrorRecord::node(
                &graph.nodes[*id],
                ErrorKind::ParamError,
                err.to_string(),
            ));
        }
        let report = ValidationReport::new(shapes, errors, num_params.total);

        log::info!(
            "validate '{}': valid = {}, {:?}",
            graph.name,
            report.valid,
            start.elapsed()
        );

        report
    }

    pub fn compare(&self, reference: &GraphDescription, submission: &GraphDescription) -> bool {
        self.grader(reference).grade(submission)
    }

    pub fn grader(&self, reference: &GraphDescription) -> Grader<'a> {
        Grader::new(reference, self.catalog, self.canonical_order)
    }
}

/// Validates `desc` with no externally resolved input shapes.
pub fn validate(desc: &GraphDescription, catalog: &Catalog) -> ValidationReport {
    ValidatorBuilder::new(catalog).build().validate(desc)
}
