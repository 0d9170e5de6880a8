use super::error::{Result, SpaceError};
use super::free_space::pairwise_displacement;
use super::traits::{into_functions, DisplacementFn, ShiftFn, Space};
use super::{check_same_shape, spatial_dimension};
use log::debug;
use ndarray::{Array, Array1, Array2, Array3, ArrayBase, ArrayView2, Axis, Data, Dimension};
use serde::{Deserialize, Serialize};

/// Side lengths of an axis-aligned periodic box.
///
/// A scalar describes a cube (or square) and applies to every axis; a vector gives one side per
/// axis and must match the spatial dimension of the arrays it is used with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoxSize {
    Scalar(f64),
    PerAxis(Vec<f64>),
}

impl BoxSize {
    /// The unit cell, used for fractional coordinates.
    pub const UNIT: BoxSize = BoxSize::Scalar(1.0);

    /// Checks that every side is finite and strictly positive.
    pub fn validate(&self) -> Result<()> {
        let sides: &[f64] = match self {
            BoxSize::Scalar(l) => std::slice::from_ref(l),
            BoxSize::PerAxis(sides) => sides,
        };
        match sides.iter().find(|l| !(l.is_finite() && **l > 0.0)) {
            Some(&value) => Err(SpaceError::InvalidBoxSize { value }),
            None => Ok(()),
        }
    }

    /// Number of axes the box is bound to, or `None` for a scalar side.
    pub fn dimensions(&self) -> Option<usize> {
        match self {
            BoxSize::Scalar(_) => None,
            BoxSize::PerAxis(sides) => Some(sides.len()),
        }
    }

    /// Side lengths along each of `dimensions` axes.
    ///
    /// # Arguments
    /// * `dimensions` - The spatial dimension of the system.
    ///
    /// # Returns
    /// A vector of `dimensions` side lengths. A scalar side is repeated along every axis.
    ///
    /// # Errors
    /// Returns [`SpaceError::ShapeMismatch`] if a per-axis box has a different number of axes.
    pub fn sides(&self, dimensions: usize) -> Result<Array1<f64>> {
        match self {
            BoxSize::Scalar(l) => Ok(Array1::from_elem(dimensions, *l)),
            BoxSize::PerAxis(sides) if sides.len() == dimensions => Ok(Array1::from(sides.clone())),
            BoxSize::PerAxis(sides) => Err(SpaceError::shape_mismatch(
                "box_size",
                &[sides.len()],
                &[dimensions],
            )),
        }
    }

    /// The box as a diagonal cell matrix, mapping fractional coordinates to real ones.
    pub fn as_transform(&self, dimensions: usize) -> Result<Array2<f64>> {
        Ok(Array2::from_diag(&self.sides(dimensions)?))
    }

    /// D-dimensional volume of the box.
    pub fn volume(&self, dimensions: usize) -> Result<f64> {
        Ok(self.sides(dimensions)?.product())
    }

    /// Applies `f(x, side)` to every element of `a`, pairing the trailing axis with the sides.
    fn map_per_axis<S, D, F>(
        &self,
        operation: &'static str,
        a: &ArrayBase<S, D>,
        f: F,
    ) -> Result<Array<f64, D>>
    where
        S: Data<Elem = f64>,
        D: Dimension,
        F: Fn(f64, f64) -> f64,
    {
        let d = spatial_dimension(operation, a)?;
        match self {
            BoxSize::Scalar(l) => Ok(a.mapv(|x| f(x, *l))),
            BoxSize::PerAxis(sides) => {
                if sides.len() != d {
                    return Err(SpaceError::shape_mismatch(operation, &[sides.len()], a.shape()));
                }
                let mut out = a.to_owned();
                for mut lane in out.lanes_mut(Axis(a.ndim() - 1)) {
                    lane.iter_mut()
                        .zip(sides)
                        .for_each(|(x, &l)| *x = f(*x, l));
                }
                Ok(out)
            }
        }
    }

    /// Gradient with respect to the sides of a wrap that removes `images(x, side)` periods
    /// from every element `x`, contracted with the cotangent `g`.
    fn image_gradient<S1, S2, D, F>(
        &self,
        operation: &'static str,
        x: &ArrayBase<S1, D>,
        g: &ArrayBase<S2, D>,
        images: F,
    ) -> Result<BoxSize>
    where
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        D: Dimension,
        F: Fn(f64, f64) -> f64,
    {
        check_same_shape(operation, x, g)?;
        let d = spatial_dimension(operation, x)?;
        match self {
            BoxSize::Scalar(l) => Ok(BoxSize::Scalar(
                x.iter()
                    .zip(g.iter())
                    .map(|(&xi, &gi)| -gi * images(xi, *l))
                    .sum(),
            )),
            BoxSize::PerAxis(sides) => {
                if sides.len() != d {
                    return Err(SpaceError::shape_mismatch(operation, &[sides.len()], x.shape()));
                }
                let axis = Axis(x.ndim() - 1);
                let mut grad = vec![0.0; d];
                for (x_lane, g_lane) in x.lanes(axis).into_iter().zip(g.lanes(axis)) {
                    let axes = x_lane.iter().zip(g_lane.iter()).zip(sides);
                    for (k, ((&xk, &gk), &l)) in axes.enumerate() {
                        grad[k] -= gk * images(xk, l);
                    }
                }
                Ok(BoxSize::PerAxis(grad))
            }
        }
    }
}

impl From<f64> for BoxSize {
    fn from(side: f64) -> Self {
        BoxSize::Scalar(side)
    }
}

impl From<Vec<f64>> for BoxSize {
    fn from(sides: Vec<f64>) -> Self {
        BoxSize::PerAxis(sides)
    }
}

impl<const D: usize> From<[f64; D]> for BoxSize {
    fn from(sides: [f64; D]) -> Self {
        BoxSize::PerAxis(sides.to_vec())
    }
}

impl From<Array1<f64>> for BoxSize {
    fn from(sides: Array1<f64>) -> Self {
        BoxSize::PerAxis(sides.to_vec())
    }
}

/// Nearest image of a displacement component, in `[-side/2, side/2)`.
fn wrap_displacement(x: f64, side: f64) -> f64 {
    (x + 0.5 * side).rem_euclid(side) - 0.5 * side
}

/// Number of periods removed by [`wrap_displacement`].
fn displacement_images(x: f64, side: f64) -> f64 {
    ((x + 0.5 * side) / side).floor()
}

/// Fundamental image of a position component, in `[0, side)`.
///
/// `rem_euclid` rounds to `side` itself for tiny negative inputs; those land on `0`.
fn wrap_position(x: f64, side: f64) -> f64 {
    let wrapped = x.rem_euclid(side);
    if wrapped < side {
        wrapped
    } else {
        0.0
    }
}

/// Number of periods removed by [`wrap_position`].
fn position_images(x: f64, side: f64) -> f64 {
    (x / side).floor()
}

/// Wraps displacements into the minimum-image convention of a periodic box.
///
/// Every component along the trailing axis becomes `((dr + side/2) mod side) - side/2`, the
/// shortest signed displacement equivalent to `dr` modulo the box.
///
/// # Arguments
/// * `side` - The side lengths of the box.
/// * `dr` - Raw displacements of any shape, with the spatial dimension on the trailing axis.
///
/// # Returns
/// An array of the shape of `dr` with every component in `[-side/2, side/2)`.
///
/// # Errors
/// Returns [`SpaceError::InvalidBoxSize`] if a side is not finite and positive, or
/// [`SpaceError::ShapeMismatch`] if a per-axis box does not match the trailing dimension of
/// `dr`.
pub fn periodic_displacement<S, D>(side: &BoxSize, dr: &ArrayBase<S, D>) -> Result<Array<f64, D>>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    side.validate()?;
    side.map_per_axis("periodic_displacement", dr, wrap_displacement)
}

/// Vector-Jacobian product of [`periodic_displacement`].
///
/// The wrap is a translation by a locally constant number of periods, so the cotangent of `dr`
/// is `g` itself. Returns `(grad_dr, grad_side)`, with `grad_side` of the same kind as `side`.
pub fn periodic_displacement_vjp<S1, S2, D>(
    side: &BoxSize,
    dr: &ArrayBase<S1, D>,
    g: &ArrayBase<S2, D>,
) -> Result<(Array<f64, D>, BoxSize)>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    side.validate()?;
    let grad_side = side.image_gradient("periodic_displacement_vjp", dr, g, displacement_images)?;
    Ok((g.to_owned(), grad_side))
}

/// Moves positions `r` by `dr` and wraps the result into the box `[0, side)`.
///
/// The result always lies inside the box, whatever the size of `dr`. Displacements longer
/// than half the box are wrapped too, which the minimum-image convention cannot undo.
///
/// # Arguments
/// * `side` - The side lengths of the box.
/// * `r` - Positions inside the box.
/// * `dr` - Displacements with the shape of `r`.
///
/// # Returns
/// The moved positions, each component in `[0, side)`.
///
/// # Errors
/// Returns [`SpaceError::InvalidBoxSize`] for a side that is not finite and positive, and
/// [`SpaceError::ShapeMismatch`] if `r` and `dr` differ in shape or a per-axis box does not
/// match their trailing dimension.
pub fn periodic_shift<S1, S2, D>(
    side: &BoxSize,
    r: &ArrayBase<S1, D>,
    dr: &ArrayBase<S2, D>,
) -> Result<Array<f64, D>>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    D: Dimension,
{
    side.validate()?;
    check_same_shape("periodic_shift", r, dr)?;
    let mut moved = r.to_owned();
    moved += dr;
    side.map_per_axis("periodic_shift", &moved, wrap_position)
}

/// Vector-Jacobian product of [`periodic_shift`].
///
/// Returns `(grad_r, grad_dr, grad_side)`; the first two are `g` itself.
pub fn periodic_shift_vjp<S1, S2, S3, D>(
    side: &BoxSize,
    r: &ArrayBase<S1, D>,
    dr: &ArrayBase<S2, D>,
    g: &ArrayBase<S3, D>,
) -> Result<(Array<f64, D>, Array<f64, D>, BoxSize)>
where
    S1: Data<Elem = f64>,
    S2: Data<Elem = f64>,
    S3: Data<Elem = f64>,
    D: Dimension,
{
    side.validate()?;
    check_same_shape("periodic_shift_vjp", r, dr)?;
    let mut moved = r.to_owned();
    moved += dr;
    let grad_side = side.image_gradient("periodic_shift_vjp", &moved, g, position_images)?;
    Ok((g.to_owned(), g.to_owned(), grad_side))
}

/// A box with periodic boundary conditions along every axis.
///
/// Positions are real coordinates in `[0, side)`. Displacements follow the minimum-image
/// convention and shifted positions are wrapped back to their fundamental image.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicBox {
    /// The lengths of the box.
    side: BoxSize,
}

impl PeriodicBox {
    /// Creates a new `PeriodicBox`.
    ///
    /// # Arguments
    /// * `side` - A scalar side shared by every axis, or one side per axis.
    ///
    /// # Returns
    /// A new `PeriodicBox` with the given sides.
    ///
    /// # Errors
    /// Returns [`SpaceError::InvalidBoxSize`] if any side is not finite and positive.
    pub fn new<B: Into<BoxSize>>(side: B) -> Result<Self> {
        let side = side.into();
        side.validate()?;
        debug!("Periodic box with sides {:?}", side);
        Ok(Self { side })
    }

    /// Returns the side lengths of the box.
    pub fn side(&self) -> &BoxSize {
        &self.side
    }

    /// D-dimensional volume of the box.
    pub fn volume(&self, dimensions: usize) -> Result<f64> {
        self.side.volume(dimensions)
    }

    /// Maps positions to their fundamental image, in `[0, side)` along every axis.
    ///
    /// # Arguments
    /// * `r` - Positions of any shape, with the spatial dimension on the trailing axis.
    ///
    /// # Errors
    /// Returns [`SpaceError::ShapeMismatch`] if a per-axis box does not match `r`.
    pub fn fundamental_image<S, D>(&self, r: &ArrayBase<S, D>) -> Result<Array<f64, D>>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        self.side.map_per_axis("fundamental_image", r, wrap_position)
    }
}

impl Space for PeriodicBox {
    fn spatial_dimensions(&self) -> Option<usize> {
        self.side.dimensions()
    }

    /// Computes the minimum-image displacement between every pair.
    fn displacement<'a, 'b, A, B>(&self, ra: A, rb: B, _time: Option<f64>) -> Result<Array3<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        periodic_displacement(&self.side, &pairwise_displacement(ra, rb)?)
    }

    /// Moves every particle and wraps it back into the box.
    fn shift<'a, 'b, A, B>(&self, r: A, dr: B, _time: Option<f64>) -> Result<Array2<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        let r: ArrayView2<f64> = r.into();
        let dr: ArrayView2<f64> = dr.into();
        periodic_shift(&self.side, &r, &dr)
    }
}

/// Displacement and shift functions of an axis-aligned periodic box.
///
/// # Errors
/// Returns [`SpaceError::InvalidBoxSize`] if any side is not finite and positive.
pub fn periodic<B: Into<BoxSize>>(box_size: B) -> Result<(DisplacementFn, ShiftFn)> {
    Ok(into_functions(PeriodicBox::new(box_size)?))
}
