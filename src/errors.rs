use thiserror::Error;

/// A result type for gaussian process regression operations
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when building a kernel or operating a [`GaussianProcess`](crate::GaussianProcess)
#[derive(Error, Debug)]
pub enum GpError {
    /// When inputs disagree in shape with the kernel or with each other
    #[error("Dimension mismatch: {0}")]
    DimensionError(String),
    /// When a metric specification is malformed or not positive definite
    #[error("Invalid metric: {0}")]
    MetricError(String),
    /// When a hyperparameter value, index or vector length is invalid
    #[error("Invalid parameter: {0}")]
    ParamError(String),
    /// When the model is used before a successful `compute`
    #[error("Gaussian process not computed, call compute() first")]
    NotComputed,
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
}
