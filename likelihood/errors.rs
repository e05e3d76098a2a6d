use crate::faer_ndarray::FaerLinalgError;
use thiserror::Error;

/// A comprehensive error type for covariance construction, factorization and
/// the likelihood operations built on top of it.
///
/// Nothing in this crate retries. A sampler that receives an error for which
/// [`GpError::is_invalid_region`] is true should reject the proposal (treat it
/// as a log-probability of −∞); every other variant is a programming error.
#[derive(Error, Debug)]
pub enum GpError {
    #[error("Length of {quantity} ({found}) does not match the number of data points ({expected}).")]
    ShapeMismatch {
        quantity: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("The {kernel} kernel expects {expected} parameters, but {found} were supplied.")]
    KernelLength {
        kernel: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Covariance matrix is not positive definite: {0}")]
    NonPositiveDefinite(#[from] FaerLinalgError),

    #[error(
        "Log-determinant of the factorized covariance is not finite ({log_det}); the matrix is ill-conditioned."
    )]
    NonFiniteLogDeterminant { log_det: f64 },

    #[error("Non-finite value found in {quantity}.")]
    NonFiniteInput { quantity: &'static str },

    #[error("Outlier location {location} is outside the valid index range [0, {n}).")]
    OutlierLocation { location: f64, n: usize },

    #[error("The {kernel} kernel only predicts at the training points; the query {quantity} differs from the training data.")]
    OutOfSampleQuery {
        kernel: &'static str,
        quantity: &'static str,
    },

    #[error("Kernel family '{0}' is not implemented.")]
    UnimplementedKernel(String),

    #[error("No covariance factorization is available: {0}")]
    MissingFactorization(&'static str),
}

impl GpError {
    /// True when the kernel parameters landed somewhere the covariance cannot
    /// be built or factorized. Outlier locations are sampled entries of the raw
    /// kernel vector, so a location off the pixel grid belongs here too.
    pub fn is_invalid_region(&self) -> bool {
        matches!(
            self,
            GpError::NonPositiveDefinite(_)
                | GpError::NonFiniteLogDeterminant { .. }
                | GpError::NonFiniteInput { .. }
                | GpError::OutlierLocation { .. }
        )
    }
}

/// Fails with [`GpError::ShapeMismatch`] unless `found == expected`.
pub(crate) fn ensure_len(quantity: &'static str, expected: usize, found: usize) -> Result<(), GpError> {
    if found == expected {
        Ok(())
    } else {
        Err(GpError::ShapeMismatch {
            quantity,
            expected,
            found,
        })
    }
}
