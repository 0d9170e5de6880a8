//! Random configurations for seeding simulations and stochastic tests.
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal, NormalError};

/// Draws `particles` fractional positions uniformly from the unit cell `[0, 1)^dimensions`.
pub fn uniform_positions<R>(rng: &mut R, particles: usize, dimensions: usize) -> Array2<f64>
where
    R: Rng,
{
    Array2::from_shape_simple_fn((particles, dimensions), || rng.gen::<f64>())
}

/// Draws a `rows x cols` array of independent zero-mean gaussian samples.
///
/// # Errors
/// Returns [`NormalError::BadVariance`] if `std_dev` is negative or not finite.
pub fn gaussian<R>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    std_dev: f64,
) -> Result<Array2<f64>, NormalError>
where
    R: Rng,
{
    if !(std_dev.is_finite() && std_dev >= 0.0) {
        return Err(NormalError::BadVariance);
    }
    let normal = Normal::new(0.0, std_dev)?;
    Ok(Array2::from_shape_simple_fn((rows, cols), || {
        normal.sample(rng)
    }))
}

/// Draws a random simulation cell `size * (I + jitter * N(0, 1))`.
///
/// With `jitter = 0` this is a cube of side `size`; small jitters give
/// sheared, generally well conditioned cells.
///
/// # Errors
/// Returns [`NormalError::BadVariance`] if `jitter` is negative or not finite.
pub fn random_cell<R>(
    rng: &mut R,
    dimensions: usize,
    size: f64,
    jitter: f64,
) -> Result<Array2<f64>, NormalError>
where
    R: Rng,
{
    let deformation = gaussian(rng, dimensions, dimensions, jitter)?;
    Ok((Array2::<f64>::eye(dimensions) + deformation) * size)
}
