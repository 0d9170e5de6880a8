//! Displacement, shift and coordinate-transform primitives for free and periodic spaces.
pub mod config;
pub mod error;
pub mod free_space;
pub mod periodic_box;
pub mod periodic_general;
pub mod traits;
pub mod transform;

use error::{Result, SpaceError};
use ndarray::{ArrayBase, Data, Dimension};

/// Returns the length of the trailing (spatial) axis of `a`.
///
/// Arrays without axes, or with an empty trailing axis, carry no vectors and are rejected.
pub(crate) fn spatial_dimension<S, D>(operation: &'static str, a: &ArrayBase<S, D>) -> Result<usize>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    match a.shape().last() {
        Some(&d) if d > 0 => Ok(d),
        _ => Err(SpaceError::shape_mismatch(operation, a.shape(), &[])),
    }
}

/// Checks that two arrays have identical shapes.
pub(crate) fn check_same_shape<S1, S2, D>(
    operation: &'static str,
    a: &ArrayBase<S1, D>,
    b: &ArrayBase<S2, D>,
) -> Result<()>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    if a.shape() == b.shape() {
        Ok(())
    } else {
        Err(SpaceError::shape_mismatch(operation, a.shape(), b.shape()))
    }
}
