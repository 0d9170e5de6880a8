use super::error::Result;
use super::free_space::distance;
use ndarray::{Array2, Array3, ArrayView2};
use std::sync::Arc;

/// Pairwise displacement function `(ra, rb, time) -> [len(ra), len(rb), d]`.
pub type DisplacementFn = Box<
    dyn Fn(ArrayView2<'_, f64>, ArrayView2<'_, f64>, Option<f64>) -> Result<Array3<f64>>
        + Send
        + Sync,
>;

/// Shift function `(r, dr, time) -> [len(r), d]`.
pub type ShiftFn = Box<
    dyn Fn(ArrayView2<'_, f64>, ArrayView2<'_, f64>, Option<f64>) -> Result<Array2<f64>>
        + Send
        + Sync,
>;

/// Trait for spaces in which particles can be displaced and moved.
///
/// Positions are `[N, d]` arrays. The optional `time` argument selects the cell of
/// time-dependent spaces and is ignored by all others.
pub trait Space {
    /// Number of spatial dimensions the space is bound to, or `None` for any dimension.
    fn spatial_dimensions(&self) -> Option<usize>;

    /// Computes the displacement `ra[i] - rb[j]` for every pair, with shape `[N, M, d]`.
    fn displacement<'a, 'b, A, B>(&self, ra: A, rb: B, time: Option<f64>) -> Result<Array3<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>;

    /// Moves every particle of `r` by the matching row of `dr`.
    fn shift<'a, 'b, A, B>(&self, r: A, dr: B, time: Option<f64>) -> Result<Array2<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>;

    /// Computes the distance between every pair, with shape `[N, M]`.
    fn distance<'a, 'b, A, B>(&self, ra: A, rb: B, time: Option<f64>) -> Result<Array2<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        distance(&self.displacement(ra, rb, time)?)
    }
}

fn boxed_displacement<F>(f: F) -> DisplacementFn
where
    F: Fn(ArrayView2<'_, f64>, ArrayView2<'_, f64>, Option<f64>) -> Result<Array3<f64>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

fn boxed_shift<F>(f: F) -> ShiftFn
where
    F: Fn(ArrayView2<'_, f64>, ArrayView2<'_, f64>, Option<f64>) -> Result<Array2<f64>>
        + Send
        + Sync
        + 'static,
{
    Box::new(f)
}

/// Splits a space into its displacement and shift functions, both sharing the same space.
pub fn into_functions<S>(space: S) -> (DisplacementFn, ShiftFn)
where
    S: Space + Send + Sync + 'static,
{
    let space = Arc::new(space);
    let shift_space = Arc::clone(&space);
    (
        boxed_displacement(move |ra, rb, time| space.displacement(ra, rb, time)),
        boxed_shift(move |r, dr, time| shift_space.shift(r, dr, time)),
    )
}
