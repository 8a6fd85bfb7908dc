//! Hyperparameter fitting over the SLSQP minimizer.
//!
//! The negative log marginal likelihood is minimized in the kernel's
//! log-parameter space, optionally restricted to a subset of parameters.
//! Probes into degenerate regions (indefinite covariance, non-finite
//! likelihood) are mapped to a large penalty value so the line search
//! can back away from them.

use crate::algorithm::GaussianProcess;
use crate::errors::Result;
use crate::kernels::Kernel;
use crate::mean_models::MeanModel;
use linfa::Float;
use log::{debug, info, warn};
use ndarray::Array1;
use std::cell::RefCell;

/// Penalty substituted for objective values the minimizer cannot order
const NLL_PENALTY: f64 = 1e25;

/// Stop criteria and bounds for the SLSQP hyperparameter search
#[derive(Debug, Clone)]
pub struct SlsqpParams {
    /// Maximum number of objective evaluations
    pub maxeval: usize,
    /// Relative tolerance on objective change
    pub ftol_rel: f64,
    /// Absolute tolerance on objective change
    pub ftol_abs: f64,
    /// Box bounds applied to every optimized log-parameter
    pub bounds: (f64, f64),
}

impl Default for SlsqpParams {
    fn default() -> Self {
        SlsqpParams {
            maxeval: 200,
            ftol_rel: 1e-4,
            ftol_abs: 0.0,
            bounds: (-20., 20.),
        }
    }
}

/// Outcome of a hyperparameter optimization run
#[derive(Debug, Clone)]
pub struct OptimizeResult<F: Float> {
    /// Optimized log-parameters, one per selected dimension, written
    /// back to the kernel
    pub x: Array1<F>,
    /// Final objective value, the negative log marginal likelihood
    pub fval: F,
    /// Whether the minimizer reported success
    pub success: bool,
    /// Minimizer status for diagnostics
    pub message: String,
}

#[inline(always)]
fn into_f64<F: Float>(v: &F) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

/// Write `values` into the selected slots of the kernel's log-parameter
/// vector.
fn set_selected<F: Float, M: MeanModel<F>, K: Kernel<F>>(
    gp: &mut GaussianProcess<F, M, K>,
    dims: &[usize],
    values: &[f64],
) -> Result<()> {
    let mut p = gp.kernel().params();
    for (&i, &v) in dims.iter().zip(values) {
        p[i] = F::cast(v);
    }
    gp.kernel_mut().set_params(&p.view())
}

pub(crate) fn optimize_params<F: Float, M: MeanModel<F>, K: Kernel<F>>(
    gp: &mut GaussianProcess<F, M, K>,
    y: &Array1<F>,
    dims: &[usize],
    params: &SlsqpParams,
) -> Result<OptimizeResult<F>> {
    let (lo, up) = params.bounds;
    let full = gp.kernel().params();
    // SLSQP needs the start point inside the box
    let xinit: Vec<f64> = dims
        .iter()
        .map(|&i| into_f64(&full[i]).clamp(lo, up))
        .collect();
    let bounds = vec![(lo, up); dims.len()];

    // SLSQP requires its user data to be Clone, which a mutable engine
    // borrow cannot be. The state lives in a RefCell captured by the
    // objective instead, and the user data degenerates to ().
    let cell = RefCell::new(gp);
    let nll = |x: &[f64], gradient: Option<&mut [f64]>, _params: &mut ()| -> f64 {
        let mut guard = cell.borrow_mut();
        let gp = &mut **guard;
        if set_selected(gp, dims, x).is_err() {
            if let Some(g) = gradient {
                g.fill(0.0);
            }
            return NLL_PENALTY;
        }
        if let Some(g) = gradient {
            match gp.grad_ln_likelihood(y, Some(dims), true) {
                Ok(dl) => {
                    for (dst, v) in g.iter_mut().zip(dl.iter()) {
                        *dst = -into_f64(v);
                    }
                }
                Err(_) => g.fill(0.0),
            }
        }
        match gp.ln_likelihood(y, true) {
            Ok(ll) => {
                let ll = into_f64(&ll);
                if ll.is_finite() {
                    -ll
                } else {
                    NLL_PENALTY
                }
            }
            Err(_) => NLL_PENALTY,
        }
    };

    let cstrs: Vec<fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64> = vec![];

    debug!(
        "starting SLSQP over {} log-parameter(s) from {xinit:?}",
        dims.len()
    );
    let res = slsqp::minimize(
        nll,
        &xinit,
        &bounds,
        &cstrs,
        (),
        params.maxeval,
        Some(slsqp::StopTols {
            ftol_rel: params.ftol_rel,
            ftol_abs: params.ftol_abs,
            ..slsqp::StopTols::default()
        }),
    );
    let gp = cell.into_inner();
    let (success, message, x_opt, fval) = match res {
        Ok((status, x_opt, fval)) => (true, format!("{status:?}"), x_opt, fval),
        Err((status, x_opt, fval)) => {
            warn!("SLSQP failed in hyperparameter fit: status={status:?}");
            (false, format!("{status:?}"), x_opt, fval)
        }
    };
    // Land the kernel on the returned point
    set_selected(gp, dims, &x_opt)?;
    info!("hyperparameter fit finished: status={message} nll={fval}");
    Ok(OptimizeResult {
        x: Array1::from(x_opt).mapv(F::cast),
        fval: F::cast(fval),
        success,
        message,
    })
}
