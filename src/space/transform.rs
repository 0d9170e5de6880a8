use super::error::{Result, SpaceError};
use super::spatial_dimension;
use log::{trace, warn};
use ndarray::{array, Array, Array2, ArrayBase, ArrayView2, Data, Dimension};

/// Relative determinant below which a matrix is reported as near-singular.
///
/// Compared against `|det| / Π‖row‖`, which is 1 for orthogonal rows and 0 for singular ones.
const NEAR_SINGULAR_TOLERANCE: f64 = 1e-10;

/// Whether `det` is small relative to Hadamard's bound `|det| <= Π‖row‖` of `m`.
fn is_near_singular(m: &ArrayView2<f64>, det: f64) -> bool {
    let hadamard: f64 = m.rows().into_iter().map(|row| row.dot(&row).sqrt()).product();
    det.abs() <= NEAR_SINGULAR_TOLERANCE * hadamard
}

/// Inverts a 2x2 or 3x3 matrix with the closed-form adjugate formula.
///
/// Simulation cells are always 2x2 or 3x3, so the explicit cofactor expansion is used instead
/// of a general solver. This keeps the inverse a smooth rational function of the entries, with
/// a gradient given by [`small_inverse_vjp`].
///
/// Near-singular matrices are not rejected: the result degrades to large magnitudes and a
/// warning is logged.
///
/// # Arguments
/// * `m` - A square matrix of size 2 or 3.
///
/// # Returns
/// The inverse `m^-1`. Exactly singular matrices give non-finite entries.
///
/// # Errors
/// Returns [`SpaceError::UnsupportedDimension`] for any other matrix shape.
pub fn small_inverse<'a, M>(m: M) -> Result<Array2<f64>>
where
    M: Into<ArrayView2<'a, f64>>,
{
    let m = m.into();
    let (rows, cols) = m.dim();
    let (adjugate, det) = match (rows, cols) {
        (2, 2) => {
            let det = m[[0, 0]] * m[[1, 1]] - m[[0, 1]] * m[[1, 0]];
            let adjugate = array![[m[[1, 1]], -m[[0, 1]]], [-m[[1, 0]], m[[0, 0]]]];
            (adjugate, det)
        }
        (3, 3) => {
            let c00 = m[[1, 1]] * m[[2, 2]] - m[[1, 2]] * m[[2, 1]];
            let c01 = m[[1, 2]] * m[[2, 0]] - m[[1, 0]] * m[[2, 2]];
            let c02 = m[[1, 0]] * m[[2, 1]] - m[[1, 1]] * m[[2, 0]];
            let c10 = m[[0, 2]] * m[[2, 1]] - m[[0, 1]] * m[[2, 2]];
            let c11 = m[[0, 0]] * m[[2, 2]] - m[[0, 2]] * m[[2, 0]];
            let c12 = m[[0, 1]] * m[[2, 0]] - m[[0, 0]] * m[[2, 1]];
            let c20 = m[[0, 1]] * m[[1, 2]] - m[[0, 2]] * m[[1, 1]];
            let c21 = m[[0, 2]] * m[[1, 0]] - m[[0, 0]] * m[[1, 2]];
            let c22 = m[[0, 0]] * m[[1, 1]] - m[[0, 1]] * m[[1, 0]];
            let det = m[[0, 0]] * c00 + m[[0, 1]] * c01 + m[[0, 2]] * c02;
            // Transpose of the cofactor matrix
            let adjugate = array![[c00, c10, c20], [c01, c11, c21], [c02, c12, c22]];
            (adjugate, det)
        }
        _ => return Err(SpaceError::UnsupportedDimension { rows, cols }),
    };

    if is_near_singular(&m, det) {
        warn!(
            "Inverting a near-singular {}x{} matrix (det = {:e}), result is unreliable",
            rows, cols, det
        );
    }

    Ok(adjugate / det)
}

/// Vector-Jacobian product of [`small_inverse`].
///
/// Given the cotangent `g` of `M^-1`, returns the cotangent of `M`, i.e. `-M^-T g M^-T`.
///
/// # Errors
/// Fails like [`small_inverse`], or with [`SpaceError::ShapeMismatch`] if `g` and `m` differ in
/// shape.
pub fn small_inverse_vjp<'a, 'b, M, G>(m: M, g: G) -> Result<Array2<f64>>
where
    M: Into<ArrayView2<'a, f64>>,
    G: Into<ArrayView2<'b, f64>>,
{
    let m = m.into();
    let g = g.into();
    if m.shape() != g.shape() {
        return Err(SpaceError::shape_mismatch(
            "small_inverse_vjp",
            m.shape(),
            g.shape(),
        ));
    }
    let inverse = small_inverse(m)?;
    Ok(-inverse.t().dot(&g).dot(&inverse.t()))
}

/// Checks `t` against the trailing axis of `r` and flattens `r` into rows of that length.
fn as_rows<S, D>(
    operation: &'static str,
    t: &ArrayView2<f64>,
    r: &ArrayBase<S, D>,
) -> Result<Array2<f64>>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    let d = spatial_dimension(operation, r)?;
    if t.nrows() != d || t.ncols() != d {
        return Err(SpaceError::shape_mismatch(operation, t.shape(), r.shape()));
    }
    Array2::from_shape_vec((r.len() / d, d), r.iter().copied().collect())
        .map_err(|_| SpaceError::shape_mismatch(operation, t.shape(), r.shape()))
}

/// Applies the linear map `t` to every vector along the trailing axis of `r`.
///
/// Vectors are rows, so the map is a right-multiplication: `result[..., :] = r[..., :] · t`.
/// With `t` the cell matrix this maps fractional coordinates to real ones, and with its
/// inverse real coordinates back to fractional ones.
///
/// # Arguments
/// * `t` - A `d x d` matrix whose rows are the images of the unit vectors.
/// * `r` - Vectors of dimension `d`, stacked along any number of leading axes.
///
/// # Returns
/// An array of the shape of `r` holding the transformed vectors.
///
/// # Errors
/// Returns [`SpaceError::ShapeMismatch`] unless `t` is `d x d` with `d` the trailing dimension
/// of `r`.
pub fn transform<'a, M, S, D>(t: M, r: &ArrayBase<S, D>) -> Result<Array<f64, D>>
where
    M: Into<ArrayView2<'a, f64>>,
    S: Data<Elem = f64>,
    D: Dimension,
{
    let t = t.into();
    let rows = as_rows("transform", &t, r)?;
    trace!("Transforming {} vectors of dimension {}", rows.nrows(), t.nrows());
    rows.dot(&t)
        .into_shape_with_order(r.raw_dim())
        .map_err(|_| SpaceError::shape_mismatch("transform", t.shape(), r.shape()))
}

/// Vector-Jacobian product of [`transform`].
///
/// Given the cotangent `g` of `transform(t, r)`, returns `(grad_t, grad_r)`.
///
/// `grad_t = Σ r^T g` is the ordinary gradient of the matrix product. The gradient with respect
/// to `r` is passed through unchanged: energies written in terms of transformed positions are
/// differentiated in real space, so `grad_r E(transform(t, r))` equals the gradient of `E`
/// evaluated at the real positions. This is what yields real-space forces from fractional
/// coordinates.
///
/// # Errors
/// Returns [`SpaceError::ShapeMismatch`] if the shapes of `t`, `r` and `g` are inconsistent.
pub fn transform_vjp<'a, M, S1, S2, D>(
    t: M,
    r: &ArrayBase<S1, D>,
    g: &ArrayBase<S2, D>,
) -> Result<(Array2<f64>, Array<f64, D>)>
where
    M: Into<ArrayView2<'a, f64>>,
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    let t = t.into();
    if r.shape() != g.shape() {
        return Err(SpaceError::shape_mismatch(
            "transform_vjp",
            r.shape(),
            g.shape(),
        ));
    }
    let r_rows = as_rows("transform_vjp", &t, r)?;
    let g_rows = as_rows("transform_vjp", &t, g)?;
    Ok((r_rows.t().dot(&g_rows), g.to_owned()))
}
