use thiserror::Error;

/// A result type for Laplace posterior and pushforward kernel computations
pub type Result<T> = std::result::Result<T, LaplaceError>;

/// An error when building curvature operators, posteriors or pushforward kernels
#[derive(Error, Debug)]
pub enum LaplaceError {
    /// When batch inputs/targets or model inputs/outputs have inconsistent shapes
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    /// When the loss kind is not part of the supported loss family
    #[error("Unsupported loss: {0}")]
    UnsupportedLoss(String),
    /// When a factorization fails or NaN/Inf values show up
    #[error("Non finite result: {0}")]
    NonFiniteResult(String),
    /// When a parameter or output layout disagrees with the model
    #[error("Layout mismatch: {0}")]
    LayoutMismatch(String),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
}
