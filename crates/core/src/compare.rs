use crate::{
    canonical::{canonicalize, CanonicalForm, CanonicalOrder},
    catalog::Catalog,
    description::GraphDescription,
};

impl CanonicalForm {
    /// Same labels element-wise and same sorted edge pairs. No partial credit.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.labels == other.labels && self.edges == other.edges
    }
}

/// Structural equivalence in layout order.
pub fn compare(
    reference: &GraphDescription,
    submission: &GraphDescription,
    catalog: &Catalog,
) -> bool {
    compare_with(reference, submission, catalog, CanonicalOrder::default())
}

pub fn compare_with(
    reference: &GraphDescription,
    submission: &GraphDescription,
    catalog: &Catalog,
    order: CanonicalOrder,
) -> bool {
    Grader::new(reference, catalog, order).grade(submission)
}

/// Grades submissions against one reference, canonicalized once.
pub struct Grader<'a> {
    catalog: &'a Catalog,
    order: CanonicalOrder,
    reference: CanonicalForm,
}

impl<'a> Grader<'a> {
    pub fn new(reference: &GraphDescription, catalog: &'a Catalog, order: CanonicalOrder) -> Self {
        Self {
            catalog,
            order,
            reference: canonicalize(reference, catalog, order),
        }
    }

    pub fn reference(&self) -> &CanonicalForm {
        &self.reference
    }

    pub fn grade(&self, submission: &GraphDescription) -> bool {
        let submission = canonicalize(submission, self.catalog, self.order);
        let equivalent = self.reference.is_equivalent(&submission);
        if !equivalent {
            log::debug!(
                "not equivalent: expected {:?}, got {:?}",
                self.reference,
                submission
            );
        }
        equivalent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::NodeDescription;

    fn residual(prefix: &str, out_features: usize) -> GraphDescription {
        let id = |s: &str| format!("{prefix}{s}");
        GraphDescription::new("residual")
            .with_node(NodeDescription::new(id("in"), "Input").at(0.0, 0.0))
            .with_node(NodeDescription::new(id("flat"), "Flatten").at(100.0, 0.0))
            .with_node(
                NodeDescription::new(id("fc"), "Linear")
                    .with_param("out_features", out_features)
                    .at(200.0, 0.0),
            )
            .with_node(NodeDescription::new(id("add"), "Add").at(300.0, 0.0))
            .with_node(NodeDescription::new(id("out"), "Output").at(400.0, 0.0))
            .with_edge(id("in"), id("flat"), "in")
            .with_edge(id("flat"), id("fc"), "in")
            .with_edge(id("flat"), id("add"), "in_b")
            .with_edge(id("fc"), id("add"), "in_a")
            .with_edge(id("add"), id("out"), "in")
    }

    #[test]
    fn ignores_ids_and_params() {
        let catalog = Catalog::standard();
        assert!(compare(&residual("a-", 784), &residual("b-", 512), &catalog));
    }

    #[test]
    fn detects_missing_edge() {
        let catalog = Catalog::standard();
        let mut submission = residual("", 784);
        submission.edges.retain(|e| e.target_handle != "in_b");
        assert!(!compare(&residual("", 784), &submission, &catalog));
    }

    #[test]
    fn grader_reuses_reference() {
        let catalog = Catalog::standard();
        let grader = Grader::new(&residual("", 784), &catalog, CanonicalOrder::Topological);
        assert_eq!(grader.reference().labels.len(), 5);
        assert!(grader.grade(&residual("x", 784)));
        let mut shifted = residual("y", 784);
        for node in &mut shifted.nodes {
            node.position.y += 1000.0;
            node.position.x = -node.position.x;
        }
        assert!(grader.grade(&shifted));
        assert!(!compare(&residual("", 784), &shifted, &catalog));
    }
}
