use thiserror::Error;

/// Errors raised by the space primitives.
///
/// Every fallible operation fails synchronously and never returns a partial result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpaceError {
    /// The closed-form inverse only handles 2x2 and 3x3 matrices.
    #[error("closed-form inverse supports 2x2 and 3x3 matrices, got {rows}x{cols}")]
    UnsupportedDimension { rows: usize, cols: usize },

    /// Two arguments of an operation have incompatible shapes.
    #[error("{operation}: incompatible shapes {left:?} and {right:?}")]
    ShapeMismatch {
        operation: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    /// A time-dependent cell was evaluated without a time argument.
    #[error("time-dependent cell transform evaluated without a time argument")]
    MissingTimeArgument,

    /// The time derivative of a deforming cell was requested but never provided.
    #[error("time-dependent cell transform has no time derivative")]
    MissingTimeDerivative,

    /// Box sides must be finite and strictly positive.
    #[error("box size must be finite and positive along every axis, got {value}")]
    InvalidBoxSize { value: f64 },
}

pub type Result<T> = std::result::Result<T, SpaceError>;

impl SpaceError {
    pub(crate) fn shape_mismatch(operation: &'static str, left: &[usize], right: &[usize]) -> Self {
        SpaceError::ShapeMismatch {
            operation,
            left: left.to_vec(),
            right: right.to_vec(),
        }
    }
}
