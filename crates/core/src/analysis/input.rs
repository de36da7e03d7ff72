use thiserror::Error;

use crate::{
    dim::{Dimension, Dimensions},
    validate::ValidationReport,
};

/// A concrete runtime tensor that does not fit an Input node's shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputShapeError {
    #[error("Expected a rank-{expected} input {shape}, got {actual:?}")]
    Rank {
        expected: usize,
        shape: Dimensions,
        actual: Vec<usize>,
    },

    #[error("Input dimension {axis} must be {expected}, got {actual}")]
    Dim {
        axis: usize,
        expected: usize,
        actual: usize,
    },

    #[error("Input dimension {axis} is the batch and must be positive")]
    EmptyBatch { axis: usize },
}

/// Checks a concrete shape against an inferred one. A batch dimension
/// accepts any positive size.
pub fn check_input_shape(actual: &[usize], expected: &Dimensions) -> Result<(), InputShapeError> {
    if actual.len() != expected.len() {
        return Err(InputShapeError::Rank {
            expected: expected.len(),
            shape: expected.clone(),
            actual: actual.to_vec(),
        });
    }

    for (axis, (&actual, &expected)) in actual.iter().zip(expected.iter()).enumerate() {
        match expected {
            Dimension::Batch if actual == 0 => return Err(InputShapeError::EmptyBatch { axis }),
            Dimension::Batch => {}
            Dimension::Static(expected) if expected != actual => {
                return Err(InputShapeError::Dim {
                    axis,
                    expected,
                    actual,
                })
            }
            Dimension::Static(_) => {}
        }
    }

    Ok(())
}

/// The inferred shape of `node` in a report, if it resolved.
pub fn expected_input_shape<'a>(
    report: &'a ValidationReport,
    node: &str,
) -> Option<&'a Dimensions> {
    report.shapes.get(node)?.as_ref()
}

#[test]
fn accepts_any_batch() {
    let expected = Dimensions::batched(&[1, 28, 28]);
    assert!(check_input_shape(&[64, 1, 28, 28], &expected).is_ok());
    assert!(check_input_shape(&[1, 1, 28, 28], &expected).is_ok());
    assert_eq!(
        check_input_shape(&[0, 1, 28, 28], &expected),
        Err(InputShapeError::EmptyBatch { axis: 0 })
    );
}

#[test]
fn names_first_bad_axis() {
    let expected = Dimensions::batched(&[3, 32, 32]);
    let err = check_input_shape(&[8, 3, 28, 28], &expected).unwrap_err();
    assert_eq!(
        err,
        InputShapeError::Dim {
            axis: 2,
            expected: 32,
            actual: 28
        }
    );
    let err = check_input_shape(&[8, 3072], &expected).unwrap_err();
    insta::assert_snapshot!(err.to_string(), @"Expected a rank-4 input [B, 3, 32, 32], got [8, 3072]");
}
