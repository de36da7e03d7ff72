use netcanvas_core::{
    canonical::{canonicalize, CanonicalOrder},
    catalog::Catalog,
    compare::{compare, compare_with, Grader},
    description::{load_graph_from_str, GraphDescription, NodeDescription},
    validate::ValidatorBuilder,
};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

const MLP: &str = include_str!("fixtures/mlp.json");
const MLP_SUBMISSION: &str = include_str!("fixtures/mlp_submission.json");

fn relu_chain(activation: NodeDescription) -> GraphDescription {
    GraphDescription::new("chain")
        .with_node(NodeDescription::new("in", "Input").at(0.0, 0.0))
        .with_node(activation.at(100.0, 0.0))
        .with_node(NodeDescription::new("out", "Output").at(200.0, 0.0))
        .with_edge("in", "act", "in")
        .with_edge("act", "out", "in")
}

#[test]
fn invariant_to_ids_and_edge_ids() {
    let catalog = Catalog::standard();
    let reference = load_graph_from_str(MLP).unwrap();
    let submission = load_graph_from_str(MLP_SUBMISSION).unwrap();
    assert!(compare(&reference, &submission, &catalog));
    assert!(compare_with(
        &reference,
        &submission,
        &catalog,
        CanonicalOrder::Topological
    ));
}

#[test]
fn order_preserving_moves_keep_equivalence() {
    let catalog = Catalog::standard();
    let reference = load_graph_from_str(MLP).unwrap();
    let mut moved = reference.clone();
    for node in &mut moved.nodes {
        node.position.x = node.position.x * 3.0 + 50.0;
        node.position.y -= 400.0;
    }
    assert!(compare(&reference, &moved, &catalog));
}

#[test]
fn activation_aliasing() {
    let catalog = Catalog::standard();
    let generic =
        relu_chain(NodeDescription::new("act", "Activation").with_param("function", "relu"));
    let dedicated = relu_chain(NodeDescription::new("act", "ReLU"));
    let gelu = relu_chain(NodeDescription::new("act", "Activation").with_param("function", "gelu"));

    assert_eq!(
        canonicalize(&generic, &catalog, CanonicalOrder::Layout),
        canonicalize(&dedicated, &catalog, CanonicalOrder::Layout)
    );
    assert!(compare(&generic, &dedicated, &catalog));
    assert!(!compare(&generic, &gelu, &catalog));
}

#[test]
fn different_structure_is_not_equivalent() {
    let catalog = Catalog::standard();
    let reference = load_graph_from_str(MLP).unwrap();

    let mut extra_node = reference
        .clone()
        .with_node(NodeDescription::new("drop", "Dropout").at(500.0, 100.0));
    extra_node.edges.pop();
    let extra_node = extra_node
        .with_edge("linear-1", "drop", "in")
        .with_edge("drop", "output-1", "in");
    assert!(!compare(&reference, &extra_node, &catalog));

    let mut swapped = reference.clone();
    swapped.nodes[1].ty = "Dropout".into();
    assert!(!compare(&reference, &swapped, &catalog));
}

#[test]
fn grade_in_parallel() {
    let catalog = Catalog::standard();
    let validator = ValidatorBuilder::new(&catalog)
        .with_canonical_order(CanonicalOrder::Topological)
        .build();
    let grader: Grader = validator.grader(&load_graph_from_str(MLP).unwrap());

    let submissions = vec![
        load_graph_from_str(MLP_SUBMISSION).unwrap(),
        relu_chain(NodeDescription::new("act", "ReLU")),
        load_graph_from_str(MLP).unwrap(),
    ];
    let grades = submissions
        .into_par_iter()
        .map(|submission| grader.grade(&submission))
        .collect::<Vec<_>>();
    assert_eq!(grades, vec![true, false, true]);
}
