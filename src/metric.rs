//! Distance metrics for radial kernels.
//!
//! A radial kernel evaluates a scalar profile at the squared
//! distance `r^2 = dx^T C^-1 dx` where `C` is the metric matrix. The
//! metric is declared through [`MetricSpec`] which pins down how many free
//! parameters it carries: one for an isotropic metric, one per axis for an
//! axis-aligned one, and the full lower triangle for a general symmetric
//! matrix.
//!
//! The one dimensional case skips the factorization entirely and keeps
//! the inverse variance around.

use crate::errors::{GpError, Result};
use crate::kernels::check_n_params;
use linfa::Float;
use linfa_linalg::cholesky::*;
use ndarray::{Array1, Array2, ArrayView1};

/// Specification of the metric matrix `C` of a radial kernel.
///
/// Entries are raw variances and covariances, not log values.
#[derive(Debug, Clone)]
pub enum MetricSpec<F: Float> {
    /// `C = s I`: a single length scale shared by every axis
    Isotropic(F),
    /// `C = diag(v)`: one variance per axis
    AxisAligned(Vec<F>),
    /// Symmetric `C` given by its lower triangle, row-major
    General(Vec<F>),
}

/// Derived metric state: the free parameters plus whatever the radial
/// kernel needs to turn pairwise differences into squared distances.
#[derive(Debug, Clone)]
pub(crate) struct Metric<F: Float> {
    kind: MetricKind,
    ndim: usize,
    params: Array1<F>,
    state: MetricState<F>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Isotropic,
    AxisAligned,
    General,
}

#[derive(Debug, Clone)]
pub(crate) enum MetricState<F: Float> {
    /// One dimensional fast path: the inverse variance
    Scalar { ivar: F },
    /// Lower Cholesky factor of `C` for higher dimensions
    Factored { factor: Array2<F> },
}

impl<F: Float> Metric<F> {
    pub fn new(spec: &MetricSpec<F>, ndim: usize) -> Result<Self> {
        if ndim == 0 {
            return Err(GpError::DimensionError(
                "kernel dimension must be at least 1".into(),
            ));
        }
        let (kind, params) = match spec {
            MetricSpec::Isotropic(s) => (MetricKind::Isotropic, vec![*s]),
            MetricSpec::AxisAligned(v) => {
                if v.len() != ndim {
                    return Err(GpError::MetricError(format!(
                        "axis-aligned metric over {ndim} dimension(s) needs {ndim} entries, got {}",
                        v.len()
                    )));
                }
                (MetricKind::AxisAligned, v.clone())
            }
            MetricSpec::General(v) => {
                let nfree = ndim * (ndim + 1) / 2;
                if v.len() != nfree {
                    return Err(GpError::MetricError(format!(
                        "general metric over {ndim} dimension(s) needs {nfree} entries, got {}",
                        v.len()
                    )));
                }
                (MetricKind::General, v.clone())
            }
        };
        for &p in &params {
            if !(p > F::zero()) || !p.is_finite() {
                return Err(GpError::MetricError(
                    "metric entries must be positive and finite".into(),
                ));
            }
        }
        let params = Array1::from(params);
        let state = Self::build_state(kind, ndim, &params)?;
        Ok(Metric {
            kind,
            ndim,
            params,
            state,
        })
    }

    fn build_state(kind: MetricKind, ndim: usize, params: &Array1<F>) -> Result<MetricState<F>> {
        if ndim == 1 {
            return Ok(MetricState::Scalar {
                ivar: F::one() / params[0],
            });
        }
        let c = Self::materialize(kind, ndim, params);
        let factor = c
            .cholesky()
            .map_err(|_| GpError::MetricError("metric matrix is not positive definite".into()))?;
        Ok(MetricState::Factored { factor })
    }

    fn materialize(kind: MetricKind, ndim: usize, params: &Array1<F>) -> Array2<F> {
        let mut c = Array2::zeros((ndim, ndim));
        match kind {
            MetricKind::Isotropic => {
                for i in 0..ndim {
                    c[[i, i]] = params[0];
                }
            }
            MetricKind::AxisAligned => {
                for i in 0..ndim {
                    c[[i, i]] = params[i];
                }
            }
            MetricKind::General => {
                let mut k = 0;
                for i in 0..ndim {
                    for j in 0..=i {
                        c[[i, j]] = params[k];
                        c[[j, i]] = params[k];
                        k += 1;
                    }
                }
            }
        }
        c
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn n_params(&self) -> usize {
        self.params.len()
    }

    /// Free metric parameters in log-space
    pub fn log_params(&self) -> Array1<F> {
        self.params.mapv(|v| v.ln())
    }

    /// Replace the free parameters from log values and rebuild the
    /// derived state. Nothing changes when the rebuild fails.
    pub fn set_log_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(self.params.len(), v.len())?;
        let params = v.mapv(|x| x.exp());
        let state = Self::build_state(self.kind, self.ndim, &params)?;
        self.params = params;
        self.state = state;
        Ok(())
    }

    /// The full metric matrix `C`
    pub fn matrix(&self) -> Array2<F> {
        Self::materialize(self.kind, self.ndim, &self.params)
    }

    pub fn state(&self) -> &MetricState<F> {
        &self.state
    }

    /// Quadratic form `u^T E_k u` where `E_k` is the unit basis matrix of
    /// the `k`-th free parameter and `u = C^-1 dx`. Together with the
    /// chain rule factor `-dk/dr^2 * theta_k` this yields the gradient of
    /// the kernel with respect to the `k`-th log metric parameter.
    pub fn basis_quadratic(&self, k: usize, u: &ArrayView1<F>) -> F {
        match self.kind {
            MetricKind::Isotropic => u.dot(u),
            MetricKind::AxisAligned => u[k] * u[k],
            MetricKind::General => {
                let (i, j) = tril_index(k);
                if i == j {
                    u[i] * u[i]
                } else {
                    F::cast(2.) * u[i] * u[j]
                }
            }
        }
    }

    /// Raw value of the `k`-th free parameter
    pub fn param(&self, k: usize) -> F {
        self.params[k]
    }
}

/// Row-major lower-triangle coordinates of the `k`-th flat entry.
fn tril_index(k: usize) -> (usize, usize) {
    let mut row = 0;
    let mut base = 0;
    while base + row + 1 <= k {
        base += row + 1;
        row += 1;
    }
    (row, k - base)
}
