use crate::{
    description::Position,
    op::{Handle, Op, OpKind},
    params::ParamError,
};
use id_arena::{Arena, Id};

pub type NodeId = Id<Node>;
pub type NodeArena = Arena<Node>;

/// Handles of a node whose kind the catalog does not know.
const UNKNOWN_HANDLES: &[Handle] = &[Handle::required(Op::IN)];

#[derive(Debug, Clone)]
pub struct Node {
    /// Id of the node in the graph description.
    pub name: String,
    /// Type name as written in the description.
    pub ty: String,
    /// `None` if the catalog does not know `ty`.
    pub kind: Option<OpKind>,
    pub op: Result<Op, ParamError>,
    /// Source node connected to each of `input_handles()`, in order.
    pub inputs: Vec<Option<NodeId>>,
    pub position: Position,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub name: String,
    pub source: NodeId,
    pub target: NodeId,
    pub target_handle: &'static str,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        ty: impl Into<String>,
        kind: Option<OpKind>,
        op: Result<Op, ParamError>,
    ) -> Self {
        let num_inputs = kind.map_or(UNKNOWN_HANDLES, OpKind::input_handles).len();
        Self {
            name: name.into(),
            ty: ty.into(),
            kind,
            op,
            inputs: vec![None; num_inputs],
            position: Position::default(),
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn input_handles(&self) -> &'static [Handle] {
        self.kind.map_or(UNKNOWN_HANDLES, OpKind::input_handles)
    }

    pub fn has_output(&self) -> bool {
        self.kind.map_or(true, OpKind::has_output)
    }

    pub fn is_output(&self) -> bool {
        self.kind == Some(OpKind::Output)
    }

    /// Required handles without an incoming edge.
    pub fn unconnected_handles(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.input_handles()
            .iter()
            .zip(self.inputs.iter())
            .filter(|(handle, input)| handle.required && input.is_none())
            .map(|(handle, _)| handle.name)
    }

    pub fn alloc(self, arena: &mut NodeArena) -> NodeId {
        arena.alloc(self)
    }
}

#[test]
fn unknown_kind_takes_one_input() {
    let node = Node::new("x", "Transformer", None, Ok(Op::Identity));
    assert_eq!(node.inputs.len(), 1);
    assert!(node.has_output());
    assert_eq!(node.unconnected_handles().collect::<Vec<_>>(), vec!["in"]);
}

#[test]
fn concat_optional_handles() {
    let node = Node::new(
        "c",
        "concat",
        Some(OpKind::Concat),
        Ok(Op::Concat(crate::op::Concat { dim: 1 })),
    );
    assert_eq!(node.inputs.len(), 4);
    assert_eq!(
        node.unconnected_handles().collect::<Vec<_>>(),
        vec!["in_a", "in_b"]
    );
}
