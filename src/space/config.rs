use super::error::{Result, SpaceError};
use super::free_space::FreeSpace;
use super::periodic_box::{BoxSize, PeriodicBox};
use super::periodic_general::{CellTransform, PeriodicGeneral};
use super::traits::{into_functions, DisplacementFn, ShiftFn, Space};
use super::transform::small_inverse;
use log::debug;
use ndarray::{Array2, Array3, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};

/// Serializable description of the boundary conditions of a simulation.
///
/// Stored as JSON tagged by `kind`, e.g.
/// `{"kind": "periodic", "box_size": [10.0, 12.0, 8.0]}` or
/// `{"kind": "periodic_general", "transform": [[4.0, 0.0], [1.0, 4.0]]}`.
/// Matrices are lists of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryConfig {
    Free,
    Periodic {
        box_size: BoxSize,
    },
    PeriodicGeneral {
        transform: Vec<Vec<f64>>,
    },
    /// Deforming cell `T(t) = t·T0 + (1 - t)·T1`.
    PeriodicGeneralInterpolated {
        transform_0: Vec<Vec<f64>>,
        transform_1: Vec<Vec<f64>>,
    },
}

/// Builds a matrix from a list of equally long rows.
fn matrix_from_rows(rows: &[Vec<f64>]) -> Result<Array2<f64>> {
    let ncols = rows.first().map_or(0, Vec::len);
    if let Some(row) = rows.iter().find(|row| row.len() != ncols) {
        return Err(SpaceError::shape_mismatch(
            "matrix_from_rows",
            &[rows.len(), ncols],
            &[row.len()],
        ));
    }
    let data = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((rows.len(), ncols), data)
        .map_err(|_| SpaceError::shape_mismatch("matrix_from_rows", &[rows.len(), ncols], &[]))
}

impl BoundaryConfig {
    /// Builds the space described by this configuration.
    ///
    /// # Errors
    /// Fails if a box size is invalid, a matrix is ragged, or a cell is not 2x2 or 3x3.
    pub fn build(&self) -> Result<Boundary> {
        let boundary = match self {
            BoundaryConfig::Free => Boundary::Free(FreeSpace),
            BoundaryConfig::Periodic { box_size } => {
                Boundary::Periodic(PeriodicBox::new(box_size.clone())?)
            }
            BoundaryConfig::PeriodicGeneral { transform } => {
                Boundary::PeriodicGeneral(PeriodicGeneral::new(matrix_from_rows(transform)?)?)
            }
            BoundaryConfig::PeriodicGeneralInterpolated {
                transform_0,
                transform_1,
            } => {
                let transform_0 = matrix_from_rows(transform_0)?;
                let transform_1 = matrix_from_rows(transform_1)?;
                // Both ends must be invertible cells
                small_inverse(&transform_0)?;
                small_inverse(&transform_1)?;
                Boundary::PeriodicGeneral(PeriodicGeneral::new(
                    CellTransform::linear_interpolation(transform_0, transform_1)?,
                )?)
            }
        };
        debug!("Built boundary {:?}", boundary);
        Ok(boundary)
    }

    /// Saves the configuration to a file in JSON format.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written to.
    pub fn save_to_file(&self, filename: &str) -> io::Result<()> {
        let file = File::create(filename)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self)?;
        Ok(())
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is invalid.
    pub fn load_from_file(filename: &str) -> io::Result<Self> {
        let file = File::open(filename)?;
        let reader = BufReader::new(file);
        let config = serde_json::from_reader(reader)?;
        debug!("Loaded boundary configuration from {}", filename);
        Ok(config)
    }
}

/// Any of the supported spaces, selected at run time.
#[derive(Debug, Clone)]
pub enum Boundary {
    Free(FreeSpace),
    Periodic(PeriodicBox),
    PeriodicGeneral(PeriodicGeneral),
}

impl Boundary {
    /// Splits the space into its displacement and shift functions.
    pub fn into_functions(self) -> (DisplacementFn, ShiftFn) {
        into_functions(self)
    }
}

impl Space for Boundary {
    fn spatial_dimensions(&self) -> Option<usize> {
        match self {
            Boundary::Free(space) => space.spatial_dimensions(),
            Boundary::Periodic(space) => space.spatial_dimensions(),
            Boundary::PeriodicGeneral(space) => space.spatial_dimensions(),
        }
    }

    fn displacement<'a, 'b, A, B>(&self, ra: A, rb: B, time: Option<f64>) -> Result<Array3<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        match self {
            Boundary::Free(space) => space.displacement(ra, rb, time),
            Boundary::Periodic(space) => space.displacement(ra, rb, time),
            Boundary::PeriodicGeneral(space) => space.displacement(ra, rb, time),
        }
    }

    fn shift<'a, 'b, A, B>(&self, r: A, dr: B, time: Option<f64>) -> Result<Array2<f64>>
    where
        A: Into<ArrayView2<'a, f64>>,
        B: Into<ArrayView2<'b, f64>>,
    {
        match self {
            Boundary::Free(space) => space.shift(r, dr, time),
            Boundary::Periodic(space) => space.shift(r, dr, time),
            Boundary::PeriodicGeneral(space) => space.shift(r, dr, time),
        }
    }
}
