//! Differentiable spatial primitives for particle simulations.
//!
//! Displacements, distances and position shifts in free space, in axis-aligned periodic boxes
//! and in general (sheared, possibly deforming) periodic cells, together with the cell
//! transforms that map fractional coordinates to real ones. Every operation comes with an
//! explicit vector-Jacobian product so that forces can be obtained as gradients of energies.
pub mod space;
pub mod utils;

pub use space::config::{Boundary, BoundaryConfig};
pub use space::error::{Result, SpaceError};
pub use space::free_space::{distance, free, pairwise_displacement, FreeSpace};
pub use space::periodic_box::{periodic, periodic_displacement, periodic_shift, BoxSize, PeriodicBox};
pub use space::periodic_general::{periodic_general, CellTransform, PeriodicGeneral};
pub use space::traits::{DisplacementFn, ShiftFn, Space};
pub use space::transform::{small_inverse, transform};
