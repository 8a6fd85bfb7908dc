//! Mean models for the gaussian process prior.
//!
//! The covariance kernel models fluctuations around a deterministic mean
//! function. Observations are centered on the mean before any likelihood
//! or prediction computation, and predictions add it back.

use linfa::Float;
use ndarray::{Array1, ArrayBase, Data, Ix2};
use std::fmt;

/// A trait for the prior mean of a gaussian process
pub trait MeanModel<F: Float>: Clone + fmt::Debug + fmt::Display {
    /// Mean value at each row of `x`
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F>;

    /// Raw parameters of the mean model
    fn params(&self) -> Array1<F> {
        Array1::zeros(0)
    }

    /// Log-prior contribution of the mean parameters
    fn log_prior(&self) -> F {
        F::zero()
    }
}

/// Constant mean model
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantMean<F: Float>(F);

impl<F: Float> ConstantMean<F> {
    /// New constant mean with the given value
    pub fn new(value: F) -> Self {
        ConstantMean(value)
    }
}

impl<F: Float> Default for ConstantMean<F> {
    fn default() -> Self {
        ConstantMean(F::zero())
    }
}

impl<F: Float> From<F> for ConstantMean<F> {
    fn from(value: F) -> Self {
        ConstantMean(value)
    }
}

impl<F: Float> fmt::Display for ConstantMean<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Constant")
    }
}

impl<F: Float> MeanModel<F> for ConstantMean<F> {
    fn value(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array1<F> {
        Array1::from_elem(x.nrows(), self.0)
    }

    fn params(&self) -> Array1<F> {
        Array1::from_elem(1, self.0)
    }
}
