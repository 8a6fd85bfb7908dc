//! Multivariate normal sampling behind prior and posterior draws.

use crate::errors::{GpError, Result};
use linfa::Float;
use linfa_linalg::cholesky::*;
use linfa_linalg::eigh::*;
use ndarray::{Array1, Array2};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

/// A multivariate normal distribution `N(mean, cov)` prepared for
/// sampling.
///
/// The covariance transform is the lower Cholesky factor when the matrix
/// is positive definite. Covariance matrices built from bare kernels are
/// often only semi-definite, so a failed factorization falls back to an
/// eigendecomposition with eigenvalues below `1e-9` clamped to zero.
#[derive(Debug, Clone)]
pub struct MultivariateNormal<F: Float> {
    mean: Array1<F>,
    transform: Array2<F>,
}

impl<F: Float> MultivariateNormal<F> {
    /// Prepare the distribution, factoring `cov`
    pub fn new(mean: Array1<F>, cov: Array2<F>) -> Result<Self> {
        if cov.nrows() != mean.len() || cov.ncols() != mean.len() {
            return Err(GpError::DimensionError(format!(
                "covariance is {}x{}, expected {n}x{n}",
                cov.nrows(),
                cov.ncols(),
                n = mean.len()
            )));
        }
        let transform = match cov.cholesky() {
            Ok(c) => c,
            Err(_) => {
                let (vals, vecs) = cov.eigh()?;
                let sq = vals.mapv(|v| {
                    if v < F::cast(1e-9) {
                        F::zero()
                    } else {
                        v.sqrt()
                    }
                });
                vecs.dot(&Array2::from_diag(&sq))
            }
        };
        Ok(MultivariateNormal { mean, transform })
    }

    /// Dimension of the distribution
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// Draw `size` samples, one per row
    pub fn sample<R: Rng>(&self, size: usize, rng: &mut R) -> Array2<F> {
        let n = self.mean.len();
        let normal = Normal::new(0., 1.).unwrap();
        let draws = Array2::random_using((size, n), normal, rng).mapv(|v| F::cast(v));
        draws.dot(&self.transform.t()) + &self.mean
    }
}
