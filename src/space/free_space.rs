use super::error::{Result, SpaceError};
use super::{check_same_shape, spatial_dimension};
use super::traits::{into_functions, DisplacementFn, ShiftFn, Space};
use ndarray::{Array, Array2, Array3, ArrayBase, ArrayView2, Axis, Data, Ix3, RemoveAxis, Zip};

/// Computes the displacement between every pair of positions in free space.
///
/// # Arguments
/// * `ra` - Positions with shape `[N, d]`.
/// * `rb` - Positions with shape `[M, d]`.
///
/// # Returns
/// An array of shape `[N, M, d]` holding `ra[i] - rb[j]` at `[i, j, ..]`.
///
/// # Errors
/// Returns [`SpaceError::ShapeMismatch`] if the trailing dimensions differ or are empty.
pub fn pairwise_displacement<'a, 'b, A, B>(ra: A, rb: B) -> Result<Array3<f64>>
where
    A: Into<ArrayView2<'a, f64>>,
    B: Into<ArrayView2<'b, f64>>,
{
    let ra = ra.into();
    let rb = rb.into();
    let d = spatial_dimension("pairwise_displacement", &ra)?;
    if rb.ncols() != d {
        return Err(SpaceError::shape_mismatch(
            "pairwise_displacement",
            ra.shape(),
            rb.shape(),
        ));
    }

    // Broadcast [N, 1, d] against [1, M, d]
    Ok(&ra.insert_axis(Axis(1)) - &rb.insert_axis(Axis(0)))
}

/// Vector-Jacobian product of [`pairwise_displacement`].
///
/// Given the cotangent `g` (shape `[N, M, d]`) of the displacements, returns the cotangents of
/// `ra` and `rb`: `Σ_j g[i, j]` and `-Σ_i g[i, j]`.
pub fn pairwise_displacement_vjp<S>(g: &ArrayBase<S, Ix3>) -> (Array2<f64>, Array2<f64>)
where
    S: Data<Elem = f64>,
{
    (g.sum_axis(Axis(1)), -g.sum_axis(Axis(0)))
}

/// Computes the Euclidean norm of every vector along the trailing axis of `dr`.
///
/// # Arguments
/// * `dr` - Displacements with the spatial dimension on the trailing axis.
///
/// # Returns
/// The norms, with the trailing axis removed: displacements of shape `[N, M, d]` give distances
/// of shape `[N, M]`.
///
/// # Errors
/// Returns [`SpaceError::ShapeMismatch`] if `dr` has no axes or an empty trailing axis.
pub fn distance<S, D>(dr: &ArrayBase<S, D>) -> Result<Array<f64, D::Smaller>>
where
    S: Data<Elem = f64>,
    D: RemoveAxis,
{
    spatial_dimension("distance", dr)?;
    Ok(dr.map_axis(Axis(dr.ndim() - 1), |v| v.dot(&v).sqrt()))
}

/// Vector-Jacobian product of [`distance`].
///
/// Given the cotangent `g` of the distances, returns `g * dr / |dr|`.
///
/// The norm is not differentiable at the origin. There the gradient is set to zero, which is
/// the natural choice for coincident particles and for the self-pairs of a pairwise
/// displacement.
///
/// # Errors
/// Returns [`SpaceError::ShapeMismatch`] if `g` does not have the shape of `distance(dr)`.
pub fn distance_vjp<S1, S2, D>(
    dr: &ArrayBase<S1, D>,
    g: &ArrayBase<S2, D::Smaller>,
) -> Result<Array<f64, D>>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: RemoveAxis,
{
    let r = distance(dr)?;
    if r.shape() != g.shape() {
        return Err(SpaceError::shape_mismatch("distance_vjp", dr.shape(), g.shape()));
    }

    let mut grad = dr.to_owned();
    Zip::from(grad.lanes_mut(Axis(dr.ndim() - 1)))
        .and(&r)
        .and(g)
        .for_each(|mut lane, &ri, &gi| {
            if ri > 0.0 {
                lane *= gi / ri;
            } else {
                lane.fill(0.0);
            }
        });
    Ok(grad)
}

/// Unrestricted Euclidean space of any dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FreeSpace;

impl Space for FreeSpace {
    fn spatial_dimensions(&self) -> Option<usize> {
        None
    }

    fn displacement<'a, 'b, A, B>(&self, ra: A, rb: B, _time: Option<f64>) -> Result<Array3<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        pairwise_displacement(ra, rb)
    }

    fn shift<'a, 'b, A, B>(&self, r: A, dr: B, _time: Option<f64>) -> Result<Array2<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        let r = r.into();
        let dr = dr.into();
        check_same_shape("shift", &r, &dr)?;
        Ok(&r + &dr)
    }
}

/// Displacement and shift functions of free space.
pub fn free() -> (DisplacementFn, ShiftFn) {
    into_functions(FreeSpace)
}
