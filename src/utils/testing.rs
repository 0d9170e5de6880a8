//! Tolerance-based comparisons shared by the unit tests.
use ndarray::{ArrayBase, Data, Dimension};

pub const TOLERANCE: f64 = 1e-9;

/// Asserts that two arrays have the same shape and agree element-wise
/// within `tol * (1 + |expected|)`.
pub fn assert_all_close<S1, S2, D>(actual: &ArrayBase<S1, D>, expected: &ArrayBase<S2, D>, tol: f64)
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    assert_eq!(actual.shape(), expected.shape(), "Shapes differ");
    for (&a, &e) in actual.iter().zip(expected.iter()) {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "Mismatch: got {}, expected {}\nactual:\n{:?}\nexpected:\n{:?}",
            a,
            e,
            actual,
            expected
        );
    }
}
