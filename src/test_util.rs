//! Helpers for comparing tensors in tests.

use std::error::Error;
use std::fmt;

use crate::tensor::Tensor;

/// The difference between two tensors exceeded the comparison tolerance.
#[derive(Debug)]
pub struct ExpectEqualError {
    message: String,
}

impl fmt::Display for ExpectEqualError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ExpectEqualError {}

/// Check that two float tensors have the same shape and approximately equal
/// elements.
pub fn expect_equal_with_tolerance(
    result: &Tensor<f32>,
    expected: &Tensor<f32>,
    epsilon: f32,
) -> Result<(), ExpectEqualError> {
    if result.shape() != expected.shape() {
        return Err(ExpectEqualError {
            message: format!(
                "tensors have different shapes: {:?} vs {:?}",
                result.shape(),
                expected.shape()
            ),
        });
    }

    let result_data = result.to_dense();
    let expected_data = expected.to_dense();
    let result_data = result_data.data().expect("dense after to_dense");
    let expected_data = expected_data.data().expect("dense after to_dense");

    let mismatches: Vec<usize> = result_data
        .iter()
        .zip(expected_data)
        .enumerate()
        .filter(|(_, (&a, &b))| (a - b).abs() > epsilon)
        .map(|(i, _)| i)
        .collect();
    if !mismatches.is_empty() {
        return Err(ExpectEqualError {
            message: format!(
                "tensors differ at {} of {} elements, first at index {}: {} vs {}",
                mismatches.len(),
                result_data.len(),
                mismatches[0],
                result_data[mismatches[0]],
                expected_data[mismatches[0]],
            ),
        });
    }
    Ok(())
}

/// Check that two float tensors are approximately equal with the default
/// tolerance.
pub fn expect_equal(
    result: &Tensor<f32>,
    expected: &Tensor<f32>,
) -> Result<(), ExpectEqualError> {
    expect_equal_with_tolerance(result, expected, 1e-5)
}
