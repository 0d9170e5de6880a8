use super::error::{Result, SpaceError};
use super::free_space::{pairwise_displacement, pairwise_displacement_vjp};
use super::periodic_box::{
    periodic_displacement, periodic_displacement_vjp, periodic_shift, periodic_shift_vjp, BoxSize,
};
use super::traits::{into_functions, DisplacementFn, ShiftFn, Space};
use super::transform::{small_inverse, small_inverse_vjp, transform, transform_vjp};
use log::{debug, trace};
use ndarray::{Array2, Array3, ArrayBase, ArrayView2, Data, Ix2, Ix3};
use std::fmt;
use std::sync::Arc;

/// Function of time returning a cell matrix, or its derivative.
type CellFn = Arc<dyn Fn(f64) -> Array2<f64> + Send + Sync>;

/// Cell matrix of a periodic parallelepiped, either fixed or a function of time.
///
/// Rows are the lattice vectors: fractional coordinates map to real ones by right
/// multiplication, `real = fractional · T`.
#[derive(Clone)]
pub enum CellTransform {
    /// A fixed cell.
    Constant(Array2<f64>),
    /// A deforming cell, evaluated at the simulation time. The optional `derivative` returns
    /// `dT/dt` and is needed for gradients with respect to time.
    TimeVarying {
        cell: CellFn,
        derivative: Option<CellFn>,
    },
}

impl fmt::Debug for CellTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellTransform::Constant(t) => f.debug_tuple("Constant").field(t).finish(),
            CellTransform::TimeVarying { derivative, .. } => f
                .debug_struct("TimeVarying")
                .field("has_derivative", &derivative.is_some())
                .finish_non_exhaustive(),
        }
    }
}

impl From<Array2<f64>> for CellTransform {
    fn from(t: Array2<f64>) -> Self {
        CellTransform::Constant(t)
    }
}

impl CellTransform {
    /// Wraps a function of time returning the cell matrix.
    ///
    /// The resulting cell has no time derivative; use
    /// [`time_varying_with_derivative`](Self::time_varying_with_derivative) when gradients with
    /// respect to time are needed.
    pub fn time_varying<F>(f: F) -> Self
    where
        F: Fn(f64) -> Array2<f64> + Send + Sync + 'static,
    {
        CellTransform::TimeVarying {
            cell: Arc::new(f),
            derivative: None,
        }
    }

    /// Wraps a function of time returning the cell matrix, together with its derivative.
    ///
    /// # Arguments
    /// * `f` - The cell matrix `T(t)`.
    /// * `df` - Its element-wise derivative `dT/dt`.
    pub fn time_varying_with_derivative<F, G>(f: F, df: G) -> Self
    where
        F: Fn(f64) -> Array2<f64> + Send + Sync + 'static,
        G: Fn(f64) -> Array2<f64> + Send + Sync + 'static,
    {
        CellTransform::TimeVarying {
            cell: Arc::new(f),
            derivative: Some(Arc::new(df)),
        }
    }

    /// Cell interpolating linearly between two matrices: `T(t) = t·T0 + (1 - t)·T1`.
    ///
    /// The derivative `dT/dt = T0 - T1` is attached.
    ///
    /// # Errors
    /// Returns [`SpaceError::ShapeMismatch`] if the matrices differ in shape.
    pub fn linear_interpolation(transform_0: Array2<f64>, transform_1: Array2<f64>) -> Result<Self> {
        if transform_0.shape() != transform_1.shape() {
            return Err(SpaceError::shape_mismatch(
                "linear_interpolation",
                transform_0.shape(),
                transform_1.shape(),
            ));
        }
        let rate = &transform_0 - &transform_1;
        Ok(Self::time_varying_with_derivative(
            move |t| &transform_0 * t + &transform_1 * (1.0 - t),
            move |_| rate.clone(),
        ))
    }

    pub fn is_time_dependent(&self) -> bool {
        matches!(self, CellTransform::TimeVarying { .. })
    }

    /// Evaluates the cell matrix. A constant cell ignores `time`.
    ///
    /// # Arguments
    /// * `time` - The simulation time, required by a time-varying cell.
    ///
    /// # Returns
    /// The `d x d` cell matrix at `time`.
    ///
    /// # Errors
    /// Returns [`SpaceError::MissingTimeArgument`] if a time-varying cell is evaluated without
    /// a time.
    pub fn at(&self, time: Option<f64>) -> Result<Array2<f64>> {
        match (self, time) {
            (CellTransform::Constant(t), _) => Ok(t.clone()),
            (CellTransform::TimeVarying { cell, .. }, Some(time)) => Ok(cell(time)),
            (CellTransform::TimeVarying { .. }, None) => Err(SpaceError::MissingTimeArgument),
        }
    }

    /// Evaluates `dT/dt`. A constant cell has a zero derivative.
    ///
    /// # Errors
    /// Returns [`SpaceError::MissingTimeArgument`] if a time-varying cell is evaluated without
    /// a time, and [`SpaceError::MissingTimeDerivative`] if it was built without a derivative.
    pub fn time_derivative(&self, time: Option<f64>) -> Result<Array2<f64>> {
        match (self, time) {
            (CellTransform::Constant(t), _) => Ok(Array2::zeros(t.raw_dim())),
            (CellTransform::TimeVarying { .. }, None) => Err(SpaceError::MissingTimeArgument),
            (CellTransform::TimeVarying { derivative, .. }, Some(time)) => derivative
                .as_ref()
                .map(|df| df(time))
                .ok_or(SpaceError::MissingTimeDerivative),
        }
    }

    /// Chains a cell gradient into a gradient with respect to time.
    ///
    /// # Arguments
    /// * `grad_cell` - The gradient with respect to the cell matrix at `time`, as returned by
    ///   [`PeriodicGeneral::displacement_vjp`] or [`PeriodicGeneral::shift_vjp`].
    /// * `time` - The simulation time.
    ///
    /// # Returns
    /// `Σ grad_cell ∘ dT/dt`.
    ///
    /// # Errors
    /// Fails like [`time_derivative`](Self::time_derivative), or with
    /// [`SpaceError::ShapeMismatch`] if `grad_cell` does not have the shape of the cell.
    pub fn time_vjp<S: Data<Elem = f64>>(
        &self,
        grad_cell: &ArrayBase<S, Ix2>,
        time: Option<f64>,
    ) -> Result<f64> {
        let rate = self.time_derivative(time)?;
        if rate.shape() != grad_cell.shape() {
            return Err(SpaceError::shape_mismatch(
                "time_vjp",
                rate.shape(),
                grad_cell.shape(),
            ));
        }
        Ok((&rate * grad_cell).sum())
    }
}

/// Periodic boundary conditions in a general, possibly sheared and deforming, cell.
///
/// Positions are fractional coordinates in the unit cell `[0, 1)^d`. Displacements are returned
/// in real space, and shifts take real-space displacements.
///
/// With a diagonal cell `diag(box_size)` this is equivalent to a
/// [`PeriodicBox`](super::periodic_box::PeriodicBox) of the same size acting on
/// `fractional * box_size`.
///
/// The minimum image is taken in fractional space. For strongly sheared cells this can differ
/// from the shortest real-space image; keep cells reduced if that matters.
#[derive(Debug, Clone)]
pub struct PeriodicGeneral {
    transform: CellTransform,
    /// Inverse of a constant cell.
    inverse: Option<Array2<f64>>,
}

impl PeriodicGeneral {
    /// Creates a periodic space over the given cell.
    ///
    /// # Errors
    /// Returns [`SpaceError::UnsupportedDimension`] if a constant cell is not 2x2 or 3x3.
    pub fn new<T: Into<CellTransform>>(transform: T) -> Result<Self> {
        let transform = transform.into();
        let inverse = match &transform {
            CellTransform::Constant(t) => {
                debug!("Periodic cell with constant transform\n{:?}", t);
                Some(small_inverse(t)?)
            }
            CellTransform::TimeVarying { .. } => {
                debug!("Periodic cell with time-dependent transform");
                None
            }
        };
        Ok(Self { transform, inverse })
    }

    /// Returns the cell transform.
    pub fn transform(&self) -> &CellTransform {
        &self.transform
    }

    /// Cell matrix at the given time.
    ///
    /// # Errors
    /// Returns [`SpaceError::MissingTimeArgument`] for a time-varying cell without a time.
    pub fn cell(&self, time: Option<f64>) -> Result<Array2<f64>> {
        self.transform.at(time)
    }

    /// Cell matrix and its inverse at the given time.
    fn cell_and_inverse(&self, time: Option<f64>) -> Result<(Array2<f64>, Array2<f64>)> {
        let cell = self.cell(time)?;
        let inverse = match &self.inverse {
            Some(inverse) => inverse.clone(),
            None => small_inverse(&cell)?,
        };
        Ok((cell, inverse))
    }

    /// Maps fractional positions to real positions.
    ///
    /// # Arguments
    /// * `r` - Fractional positions with shape `[N, d]`.
    /// * `time` - The simulation time, required by a time-varying cell.
    ///
    /// # Returns
    /// The real positions `r · T`.
    ///
    /// # Errors
    /// Fails if the time is missing for a time-varying cell or `r` does not match the cell.
    pub fn to_real<S: Data<Elem = f64>>(
        &self,
        r: &ArrayBase<S, Ix2>,
        time: Option<f64>,
    ) -> Result<Array2<f64>> {
        transform(&self.cell(time)?, r)
    }

    /// Maps real positions to fractional positions.
    ///
    /// # Arguments
    /// * `r` - Real positions with shape `[N, d]`.
    /// * `time` - The simulation time, required by a time-varying cell.
    ///
    /// # Returns
    /// The fractional positions `r · T^-1`. They are not wrapped into the unit cell.
    ///
    /// # Errors
    /// Fails if the time is missing, the cell cannot be inverted, or `r` does not match the
    /// cell.
    pub fn to_fractional<S: Data<Elem = f64>>(
        &self,
        r: &ArrayBase<S, Ix2>,
        time: Option<f64>,
    ) -> Result<Array2<f64>> {
        let (_, inverse) = self.cell_and_inverse(time)?;
        transform(&inverse, r)
    }

    /// Vector-Jacobian product of [`Space::displacement`].
    ///
    /// Given the cotangent `g` (shape `[N, M, d]`) of the displacements, returns
    /// `(grad_ra, grad_rb, grad_cell)`. Position gradients are in real space (see
    /// [`transform_vjp`]); `grad_cell` is the gradient with respect to the cell matrix at
    /// `time`. For a deforming cell, [`CellTransform::time_vjp`] turns it into a gradient with
    /// respect to `time`.
    ///
    /// # Errors
    /// Fails like [`Space::displacement`], or with [`SpaceError::ShapeMismatch`] if `g` does not
    /// have shape `[N, M, d]`.
    pub fn displacement_vjp<'a, 'b, A, B, S>(
        &self,
        ra: A,
        rb: B,
        g: &ArrayBase<S, Ix3>,
        time: Option<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>, Array2<f64>)>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
        S: Data<Elem = f64>,
    {
        let cell = self.cell(time)?;
        let raw = pairwise_displacement(ra, rb)?;
        let wrapped = periodic_displacement(&BoxSize::UNIT, &raw)?;

        let (grad_cell, grad_wrapped) = transform_vjp(&cell, &wrapped, g)?;
        let (grad_raw, _) = periodic_displacement_vjp(&BoxSize::UNIT, &raw, &grad_wrapped)?;
        let (grad_ra, grad_rb) = pairwise_displacement_vjp(&grad_raw);
        Ok((grad_ra, grad_rb, grad_cell))
    }

    /// Vector-Jacobian product of [`Space::shift`].
    ///
    /// Given the cotangent `g` of the shifted positions, returns `(grad_r, grad_dr, grad_cell)`.
    /// The cell gradient flows through the inverse cell that maps `dr` to fractional space.
    ///
    /// # Errors
    /// Fails like [`Space::shift`], or with [`SpaceError::ShapeMismatch`] if `g` does not have
    /// the shape of `r`.
    pub fn shift_vjp<'a, 'b, A, B, S>(
        &self,
        r: A,
        dr: B,
        g: &ArrayBase<S, Ix2>,
        time: Option<f64>,
    ) -> Result<(Array2<f64>, Array2<f64>, Array2<f64>)>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
        S: Data<Elem = f64>,
    {
        let r: ArrayView2<f64> = r.into();
        let dr: ArrayView2<f64> = dr.into();
        let (cell, inverse) = self.cell_and_inverse(time)?;
        let dr_fractional = transform(&inverse, &dr)?;

        let (grad_r, grad_dr_fractional, _) =
            periodic_shift_vjp(&BoxSize::UNIT, &r, &dr_fractional, g)?;
        let (grad_inverse, grad_dr) = transform_vjp(&inverse, &dr, &grad_dr_fractional)?;
        let grad_cell = small_inverse_vjp(&cell, &grad_inverse)?;
        Ok((grad_r, grad_dr, grad_cell))
    }
}

impl Space for PeriodicGeneral {
    fn spatial_dimensions(&self) -> Option<usize> {
        match &self.transform {
            CellTransform::Constant(t) => Some(t.nrows()),
            CellTransform::TimeVarying { .. } => None,
        }
    }

    /// Minimum-image displacement between fractional positions, expressed in real space.
    ///
    /// The fractional difference is wrapped into the unit cell and then mapped through the
    /// cell matrix. This equals taking the real-space difference of the mapped positions and
    /// wrapping it in fractional space, as the map is linear.
    fn displacement<'a, 'b, A, B>(&self, ra: A, rb: B, time: Option<f64>) -> Result<Array3<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        let cell = self.cell(time)?;
        let wrapped = periodic_displacement(&BoxSize::UNIT, &pairwise_displacement(ra, rb)?)?;
        trace!("Mapping {:?} fractional displacements to real space", wrapped.shape());
        transform(&cell, &wrapped)
    }

    /// Moves fractional positions `r` by real-space displacements `dr` and wraps them back
    /// into the unit cell.
    fn shift<'a, 'b, A, B>(&self, r: A, dr: B, time: Option<f64>) -> Result<Array2<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        let r: ArrayView2<f64> = r.into();
        let dr: ArrayView2<f64> = dr.into();
        let (_, inverse) = self.cell_and_inverse(time)?;
        periodic_shift(&BoxSize::UNIT, &r, &transform(&inverse, &dr)?)
    }
}

/// Displacement and shift functions of a general periodic cell.
///
/// # Arguments
/// * `transform` - A constant cell matrix or a [`CellTransform`].
///
/// # Returns
/// A `(displacement, shift)` pair. Both functions take an optional time: it selects the cell
/// of a time-varying transform and is required there, and is ignored by a constant one.
///
/// # Errors
/// Returns [`SpaceError::UnsupportedDimension`] if a constant cell is not 2x2 or 3x3.
pub fn periodic_general<T: Into<CellTransform>>(transform: T) -> Result<(DisplacementFn, ShiftFn)> {
    Ok(into_functions(PeriodicGeneral::new(transform)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::periodic_box::periodic;
    use crate::utils::sampling::{gaussian, random_cell, uniform_positions};
    use crate::utils::testing::{assert_all_close, TOLERANCE};
    use ndarray::{array, Array1};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const PARTICLE_COUNT: usize = 10;
    const STOCHASTIC_SAMPLES: usize = 10;
    const SPATIAL_DIMENSION: [usize; 2] = [2, 3];

    #[test]
    fn test_periodic_against_periodic_general() {
        let mut rng = StdRng::seed_from_u64(0);
        for &d in &SPATIAL_DIMENSION {
            for _ in 0..STOCHASTIC_SAMPLES {
                let max_box_size = 10.0;
                let box_size =
                    Array1::from_iter((0..d).map(|_| max_box_size * rng.gen_range(0.1..1.0)));
                let cell = Array2::from_diag(&box_size);

                let r = uniform_positions(&mut rng, PARTICLE_COUNT, d);
                let r_scaled = &r * &box_size;
                let dr = gaussian(&mut rng, PARTICLE_COUNT, d, 1.0).unwrap();

                let (disp_fn, shift_fn) = periodic(box_size.clone()).unwrap();
                let (general_disp_fn, general_shift_fn) = periodic_general(cell).unwrap();

                assert_all_close(
                    &general_disp_fn(r.view(), r.view(), None).unwrap(),
                    &disp_fn(r_scaled.view(), r_scaled.view(), None).unwrap(),
                    TOLERANCE,
                );
                assert_all_close(
                    &(general_shift_fn(r.view(), dr.view(), None).unwrap() * &box_size),
                    &shift_fn(r_scaled.view(), dr.view(), None).unwrap(),
                    TOLERANCE,
                );
            }
        }
    }

    #[test]
    fn test_periodic_general_time_dependence() {
        let mut rng = StdRng::seed_from_u64(0);
        for &d in &SPATIAL_DIMENSION {
            for _ in 0..STOCHASTIC_SAMPLES {
                let size_0 = 10.0 * rng.gen::<f64>();
                let transform_0 = random_cell(&mut rng, d, size_0, 0.5).unwrap();
                let size_1 = 10.0 * rng.gen::<f64>();
                let transform_1 = random_cell(&mut rng, d, size_1, 0.5).unwrap();

                let t_g = rng.gen::<f64>();
                let cell = CellTransform::linear_interpolation(transform_0, transform_1).unwrap();
                let cell_at_t_g = cell.at(Some(t_g)).unwrap();

                let (disp_fn, shift_fn) = periodic_general(cell).unwrap();
                let (true_disp_fn, true_shift_fn) = periodic_general(cell_at_t_g).unwrap();

                let r = uniform_positions(&mut rng, PARTICLE_COUNT, d);
                let dr = gaussian(&mut rng, PARTICLE_COUNT, d, 1.0).unwrap();

                assert_all_close(
                    &disp_fn(r.view(), r.view(), Some(t_g)).unwrap(),
                    &true_disp_fn(r.view(), r.view(), None).unwrap(),
                    TOLERANCE,
                );
                assert_all_close(
                    &shift_fn(r.view(), dr.view(), Some(t_g)).unwrap(),
                    &true_shift_fn(r.view(), dr.view(), None).unwrap(),
                    TOLERANCE,
                );
            }
        }
    }

    #[test]
    fn test_missing_time_argument() {
        let cell = CellTransform::time_varying(|t| Array2::<f64>::eye(2) * (1.0 + t));
        let space = PeriodicGeneral::new(cell).unwrap();
        let r = array![[0.1, 0.2]];

        assert_eq!(
            space.displacement(&r, &r, None).unwrap_err(),
            SpaceError::MissingTimeArgument
        );
        assert_eq!(
            space.shift(&r, &r, None).unwrap_err(),
            SpaceError::MissingTimeArgument
        );
        assert!(space.displacement(&r, &r, Some(0.5)).is_ok());
    }

    #[test]
    fn test_constant_cell_ignores_time() {
        let space = PeriodicGeneral::new(array![[2.0, 0.0], [0.5, 1.0]]).unwrap();
        let ra = array![[0.1, 0.9], [0.5, 0.5]];
        let rb = array![[0.8, 0.2]];
        assert_eq!(
            space.displacement(&ra, &rb, None).unwrap(),
            space.displacement(&ra, &rb, Some(42.0)).unwrap()
        );
    }

    #[test]
    fn test_sheared_cell_displacement() {
        // Lattice vectors (1, 0) and (0.5, 1)
        let space = PeriodicGeneral::new(array![[1.0, 0.0], [0.5, 1.0]]).unwrap();
        let ra = array![[0.05, 0.5]];
        let rb = array![[0.95, 0.5], [0.05, 0.9]];

        let dr = space.displacement(&ra, &rb, None).unwrap();
        // Fractional differences wrap to (0.1, 0) and (0, -0.4)
        assert_all_close(&dr, &array![[[0.1, 0.0], [-0.2, -0.4]]], 1e-12);
    }

    #[test]
    fn test_real_fractional_round_trip() {
        let mut rng = StdRng::seed_from_u64(7);
        for &d in &SPATIAL_DIMENSION {
            let cell = random_cell(&mut rng, d, 5.0, 0.2).unwrap();
            let space = PeriodicGeneral::new(cell.clone()).unwrap();
            let r = uniform_positions(&mut rng, PARTICLE_COUNT, d);

            let real = space.to_real(&r, None).unwrap();
            assert_all_close(&real, &r.dot(&cell), TOLERANCE);
            assert_all_close(&space.to_fractional(&real, None).unwrap(), &r, 1e-8);
        }
    }

    #[test]
    fn test_unsupported_cell_dimension() {
        assert_eq!(
            PeriodicGeneral::new(Array2::<f64>::eye(4)).unwrap_err(),
            SpaceError::UnsupportedDimension { rows: 4, cols: 4 }
        );
        assert!(periodic_general(Array2::<f64>::eye(1)).is_err());

        // A time-varying cell is only checked when evaluated
        let cell = CellTransform::time_varying(|_| Array2::<f64>::eye(4));
        let space = PeriodicGeneral::new(cell).unwrap();
        let r = Array2::<f64>::zeros((2, 4));
        assert!(matches!(
            space.shift(&r, &r, Some(0.0)),
            Err(SpaceError::UnsupportedDimension { .. })
        ));
    }

    #[test]
    fn test_linear_interpolation_shape_mismatch() {
        let identity = Array2::<f64>::eye(2);
        assert!(
            CellTransform::linear_interpolation(identity.clone(), Array2::<f64>::eye(3)).is_err()
        );

        let cell = CellTransform::linear_interpolation(identity.clone(), &identity * 3.0).unwrap();
        assert!(cell.is_time_dependent());
        assert_eq!(cell.at(Some(0.25)).unwrap(), &identity * 2.5);
        assert_eq!(cell.time_derivative(Some(0.25)).unwrap(), &identity * -2.0);
    }

    #[test]
    fn test_time_derivative() {
        let constant = CellTransform::from(array![[2.0, 0.0], [0.5, 1.0]]);
        assert_eq!(
            constant.time_derivative(None).unwrap(),
            Array2::<f64>::zeros((2, 2))
        );

        let without_derivative =
            CellTransform::time_varying(|t| Array2::<f64>::eye(2) * (1.0 + t));
        assert_eq!(
            without_derivative.time_derivative(Some(0.5)).unwrap_err(),
            SpaceError::MissingTimeDerivative
        );
        assert_eq!(
            without_derivative.time_derivative(None).unwrap_err(),
            SpaceError::MissingTimeArgument
        );

        let with_derivative = CellTransform::time_varying_with_derivative(
            |t| Array2::<f64>::eye(2) * t * t,
            |t| Array2::<f64>::eye(2) * 2.0 * t,
        );
        assert_eq!(
            with_derivative.time_derivative(Some(1.5)).unwrap(),
            Array2::<f64>::eye(2) * 3.0
        );
        assert!(with_derivative
            .time_vjp(&Array2::<f64>::eye(3), Some(1.5))
            .is_err());
    }

    #[test]
    fn test_time_varying_vjp_matches_constant_cell() {
        let mut rng = StdRng::seed_from_u64(17);
        for &d in &SPATIAL_DIMENSION {
            let transform_0 = random_cell(&mut rng, d, 3.0, 0.2).unwrap();
            let transform_1 = random_cell(&mut rng, d, 4.0, 0.2).unwrap();
            let cell = CellTransform::linear_interpolation(transform_0, transform_1).unwrap();
            let t_g = rng.gen::<f64>();

            let space = PeriodicGeneral::new(cell.clone()).unwrap();
            let frozen = PeriodicGeneral::new(cell.at(Some(t_g)).unwrap()).unwrap();

            let r = uniform_positions(&mut rng, PARTICLE_COUNT, d);
            let dr = gaussian(&mut rng, PARTICLE_COUNT, d, 0.1).unwrap();
            let g_pairs = Array3::from_shape_fn((PARTICLE_COUNT, PARTICLE_COUNT, d), |(i, j, k)| {
                ((3 * i + j + k) % 7) as f64 - 3.0
            });
            let g = gaussian(&mut rng, PARTICLE_COUNT, d, 1.0).unwrap();

            let (ra, rb, cell_grad) = space.displacement_vjp(&r, &r, &g_pairs, Some(t_g)).unwrap();
            let (ra_ref, rb_ref, cell_grad_ref) =
                frozen.displacement_vjp(&r, &r, &g_pairs, None).unwrap();
            assert_all_close(&ra, &ra_ref, TOLERANCE);
            assert_all_close(&rb, &rb_ref, TOLERANCE);
            assert_all_close(&cell_grad, &cell_grad_ref, TOLERANCE);

            let (r_grad, dr_grad, cell_grad) = space.shift_vjp(&r, &dr, &g, Some(t_g)).unwrap();
            let (r_grad_ref, dr_grad_ref, cell_grad_ref) =
                frozen.shift_vjp(&r, &dr, &g, None).unwrap();
            assert_all_close(&r_grad, &r_grad_ref, TOLERANCE);
            assert_all_close(&dr_grad, &dr_grad_ref, TOLERANCE);
            assert_all_close(&cell_grad, &cell_grad_ref, 1e-8);

            assert_eq!(
                space.displacement_vjp(&r, &r, &g_pairs, None).unwrap_err(),
                SpaceError::MissingTimeArgument
            );
            assert_eq!(
                space.shift_vjp(&r, &dr, &g, None).unwrap_err(),
                SpaceError::MissingTimeArgument
            );
        }
    }

    #[test]
    fn test_time_gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(19);
        let h = 1e-6;
        for &d in &SPATIAL_DIMENSION {
            let transform_0 = random_cell(&mut rng, d, 2.0, 0.1).unwrap();
            let transform_1 = random_cell(&mut rng, d, 2.5, 0.1).unwrap();
            let cell = CellTransform::linear_interpolation(transform_0, transform_1).unwrap();
            let space = PeriodicGeneral::new(cell.clone()).unwrap();
            let t = 0.3;

            // Keep r + dr·T^-1 well inside the unit cell so no wrap occurs under perturbation
            let r = uniform_positions(&mut rng, PARTICLE_COUNT, d).mapv(|x| 0.4 + 0.2 * x);
            let dr = gaussian(&mut rng, PARTICLE_COUNT, d, 0.02).unwrap();
            let g_pairs = Array3::from_shape_fn((PARTICLE_COUNT, PARTICLE_COUNT, d), |(i, j, k)| {
                ((i + 2 * j + 3 * k) % 5) as f64 - 2.0
            });
            let g = gaussian(&mut rng, PARTICLE_COUNT, d, 1.0).unwrap();

            let displacement_energy =
                |t: f64| (space.displacement(&r, &r, Some(t)).unwrap() * &g_pairs).sum();
            let (_, _, grad_cell) = space.displacement_vjp(&r, &r, &g_pairs, Some(t)).unwrap();
            let grad_time = cell.time_vjp(&grad_cell, Some(t)).unwrap();
            let numeric =
                (displacement_energy(t + h) - displacement_energy(t - h)) / (2.0 * h);
            assert!(
                (grad_time - numeric).abs() < 1e-5 * (1.0 + numeric.abs()),
                "displacement: {} vs {}",
                grad_time,
                numeric
            );

            let shift_energy = |t: f64| (space.shift(&r, &dr, Some(t)).unwrap() * &g).sum();
            let (_, _, grad_cell) = space.shift_vjp(&r, &dr, &g, Some(t)).unwrap();
            let grad_time = cell.time_vjp(&grad_cell, Some(t)).unwrap();
            let numeric = (shift_energy(t + h) - shift_energy(t - h)) / (2.0 * h);
            assert!(
                (grad_time - numeric).abs() < 1e-5 * (1.0 + numeric.abs()),
                "shift: {} vs {}",
                grad_time,
                numeric
            );
        }
    }

    #[test]
    fn test_displacement_vjp_cell_gradient() {
        let mut rng = StdRng::seed_from_u64(11);
        let h = 1e-6;
        for &d in &SPATIAL_DIMENSION {
            let cell = random_cell(&mut rng, d, 3.0, 0.2).unwrap();
            let r = uniform_positions(&mut rng, PARTICLE_COUNT, d);
            let g = Array3::from_shape_fn((PARTICLE_COUNT, PARTICLE_COUNT, d), |(i, j, k)| {
                ((i + 2 * j + 3 * k) % 5) as f64 - 2.0
            });
            let objective = |cell: &Array2<f64>| {
                let space = PeriodicGeneral::new(cell.clone()).unwrap();
                (space.displacement(&r, &r, None).unwrap() * &g).sum()
            };

            let space = PeriodicGeneral::new(cell.clone()).unwrap();
            let (grad_ra, grad_rb, grad_cell) = space.displacement_vjp(&r, &r, &g, None).unwrap();
            assert_eq!(grad_ra.shape(), &[PARTICLE_COUNT, d]);
            assert_eq!(grad_rb.shape(), &[PARTICLE_COUNT, d]);

            let numeric = Array2::from_shape_fn((d, d), |(i, j)| {
                let mut plus = cell.clone();
                let mut minus = cell.clone();
                plus[[i, j]] += h;
                minus[[i, j]] -= h;
                (objective(&plus) - objective(&minus)) / (2.0 * h)
            });
            assert_all_close(&grad_cell, &numeric, 1e-5);
        }
    }

    #[test]
    fn test_shift_vjp_cell_gradient() {
        let mut rng = StdRng::seed_from_u64(13);
        let h = 1e-6;
        for &d in &SPATIAL_DIMENSION {
            let cell = random_cell(&mut rng, d, 2.0, 0.1).unwrap();
            // Keep r + dr·T^-1 well inside the unit cell so no wrap occurs under perturbation
            let r = uniform_positions(&mut rng, PARTICLE_COUNT, d).mapv(|x| 0.4 + 0.2 * x);
            let dr = gaussian(&mut rng, PARTICLE_COUNT, d, 0.02).unwrap();
            let g = gaussian(&mut rng, PARTICLE_COUNT, d, 1.0).unwrap();
            let objective = |cell: &Array2<f64>| {
                let space = PeriodicGeneral::new(cell.clone()).unwrap();
                (space.shift(&r, &dr, None).unwrap() * &g).sum()
            };

            let space = PeriodicGeneral::new(cell.clone()).unwrap();
            let (grad_r, grad_dr, grad_cell) = space.shift_vjp(&r, &dr, &g, None).unwrap();
            assert_all_close(&grad_r, &g, TOLERANCE);
            assert_all_close(&grad_dr, &g, TOLERANCE);

            let numeric = Array2::from_shape_fn((d, d), |(i, j)| {
                let mut plus = cell.clone();
                let mut minus = cell.clone();
                plus[[i, j]] += h;
                minus[[i, j]] -= h;
                (objective(&plus) - objective(&minus)) / (2.0 * h)
            });
            assert_all_close(&grad_cell, &numeric, 1e-5);
        }
    }
}
