//! Radial (stationary) kernels over a metric-weighted distance.
//!
//! A radial kernel is a scalar profile `k(r^2)` of the squared
//! mahalanobis distance `r^2 = dx^T C^-1 dx` between two points, with the
//! metric `C` declared by a [`MetricSpec`]. The profile contributes its
//! own leading parameters (only the rational quadratic has one); the
//! metric parameters follow in the flat log-parameter vector.
//!
//! Profiles
//! * [`Exp`]: `exp(-r)`
//! * [`ExpSquared`]: `exp(-r^2/2)`
//! * [`Matern32`]: `(1 + sqrt(3) r) exp(-sqrt(3) r)`
//! * [`Matern52`]: `(1 + sqrt(5) r + 5 r^2 / 3) exp(-sqrt(5) r)`
//! * [`RationalQuadratic`]: `(1 + r^2 / (2 alpha))^-alpha`

use crate::errors::Result;
use crate::kernels::{check_input_dims, check_n_params, check_positive, Kernel};
use crate::metric::{Metric, MetricState};
use crate::utils::pairwise_differences;
use linfa::Float;
use linfa_linalg::triangular::*;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip};
use paste::paste;
use std::fmt;

pub use crate::metric::MetricSpec;

/// A trait for radial covariance profiles.
///
/// Implementations are scalar functions of the squared distance together
/// with the derivatives the kernel gradient needs. Profile parameters
/// ("extra" parameters, ahead of the metric block in the flat vector) are
/// raw values, exponentiated by the kernel from log-space.
pub trait RadialFunction<F: Float>: Clone + fmt::Debug {
    /// Number of profile parameters ahead of the metric block
    fn n_extra(&self) -> usize {
        0
    }

    /// Raw profile parameters
    fn extra(&self) -> Array1<F> {
        Array1::zeros(0)
    }

    /// Replace the raw profile parameters
    fn set_extra(&mut self, _extra: &ArrayView1<F>) {}

    /// Profile value at squared distance `r2`
    fn value(&self, r2: F) -> F;

    /// Derivative of the profile with respect to `r2`
    fn grad_r2(&self, r2: F) -> F;

    /// Derivative of the profile with respect to the log of the `e`-th
    /// profile parameter
    fn grad_extra(&self, _r2: F, _e: usize) -> F {
        F::zero()
    }
}

/// Exponential profile `exp(-r)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Exp;

impl<F: Float> RadialFunction<F> for Exp {
    fn value(&self, r2: F) -> F {
        (-r2.sqrt()).exp()
    }

    fn grad_r2(&self, r2: F) -> F {
        let r = r2.sqrt();
        if r > F::zero() {
            -F::cast(0.5) * (-r).exp() / r
        } else {
            // The profile has a kink at coincident points
            F::zero()
        }
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Exp")
    }
}

/// Squared exponential profile `exp(-r^2/2)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpSquared;

impl<F: Float> RadialFunction<F> for ExpSquared {
    fn value(&self, r2: F) -> F {
        (-F::cast(0.5) * r2).exp()
    }

    fn grad_r2(&self, r2: F) -> F {
        -F::cast(0.5) * (-F::cast(0.5) * r2).exp()
    }
}

impl fmt::Display for ExpSquared {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ExpSquared")
    }
}

/// Matern 3/2 profile `(1 + s) exp(-s)` with `s = sqrt(3 r^2)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Matern32;

impl<F: Float> RadialFunction<F> for Matern32 {
    fn value(&self, r2: F) -> F {
        let s = (F::cast(3.) * r2).sqrt();
        (F::one() + s) * (-s).exp()
    }

    fn grad_r2(&self, r2: F) -> F {
        let s = (F::cast(3.) * r2).sqrt();
        -F::cast(1.5) * (-s).exp()
    }
}

impl fmt::Display for Matern32 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern32")
    }
}

/// Matern 5/2 profile `(1 + s + s^2/3) exp(-s)` with `s = sqrt(5 r^2)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Matern52;

impl<F: Float> RadialFunction<F> for Matern52 {
    fn value(&self, r2: F) -> F {
        let s = (F::cast(5.) * r2).sqrt();
        (F::one() + s + s * s / F::cast(3.)) * (-s).exp()
    }

    fn grad_r2(&self, r2: F) -> F {
        let s = (F::cast(5.) * r2).sqrt();
        -F::cast(5. / 6.) * (F::one() + s) * (-s).exp()
    }
}

impl fmt::Display for Matern52 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Matern52")
    }
}

/// Rational quadratic profile `(1 + r^2 / (2 alpha))^-alpha`, the scale
/// mixture of squared exponentials. `alpha` is a profile parameter and
/// leads the flat parameter vector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RationalQuadratic<F: Float> {
    alpha: F,
}

impl<F: Float> RationalQuadratic<F> {
    /// New profile with mixture parameter `alpha`
    pub fn new(alpha: F) -> Result<Self> {
        check_positive(alpha, "alpha")?;
        Ok(RationalQuadratic { alpha })
    }

    /// The mixture parameter
    pub fn alpha(&self) -> F {
        self.alpha
    }
}

impl<F: Float> RadialFunction<F> for RationalQuadratic<F> {
    fn n_extra(&self) -> usize {
        1
    }

    fn extra(&self) -> Array1<F> {
        Array1::from_elem(1, self.alpha)
    }

    fn set_extra(&mut self, extra: &ArrayView1<F>) {
        self.alpha = extra[0];
    }

    fn value(&self, r2: F) -> F {
        let t1 = F::one() + F::cast(0.5) * r2 / self.alpha;
        t1.powf(-self.alpha)
    }

    fn grad_r2(&self, r2: F) -> F {
        let t1 = F::one() + F::cast(0.5) * r2 / self.alpha;
        -F::cast(0.5) * t1.powf(-self.alpha - F::one())
    }

    fn grad_extra(&self, r2: F, _e: usize) -> F {
        let t1 = F::one() + F::cast(0.5) * r2 / self.alpha;
        let t2 = F::cast(2.) * self.alpha + r2;
        self.alpha * t1.powf(-self.alpha) * (r2 - t2 * t1.ln()) / t2
    }
}

impl<F: Float> fmt::Display for RationalQuadratic<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RationalQuadratic")
    }
}

/// Radial kernel combining a profile with a metric.
///
/// The flat parameter vector is `[profile extras..., metric entries...]`,
/// all in log-space.
#[derive(Debug, Clone)]
pub struct RadialKernel<F: Float, R: RadialFunction<F>> {
    radial: R,
    metric: Metric<F>,
    version: u64,
}

impl<F: Float, R: RadialFunction<F>> RadialKernel<F, R> {
    /// Build from a profile instance and a metric specification
    pub fn with_radial(radial: R, metric: &MetricSpec<F>, ndim: usize) -> Result<Self> {
        Ok(RadialKernel {
            radial,
            metric: Metric::new(metric, ndim)?,
            version: 0,
        })
    }

    /// The radial profile
    pub fn radial(&self) -> &R {
        &self.radial
    }

    /// The full metric matrix `C`
    pub fn metric_matrix(&self) -> Array2<F> {
        self.metric.matrix()
    }

    /// Squared metric distances between row pairs, flattened row-major.
    fn squared_radii(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<RadiusData<F>> {
        match self.metric.state() {
            MetricState::Scalar { ivar } => {
                let ivar = *ivar;
                let mut r2 = Array1::zeros(x1.nrows() * x2.nrows());
                let n2 = x2.nrows();
                Zip::indexed(&mut r2).for_each(|idx, v| {
                    let d = x1[[idx / n2, 0]] - x2[[idx % n2, 0]];
                    *v = d * d * ivar;
                });
                Ok(RadiusData { r2, u: None })
            }
            MetricState::Factored { factor } => {
                let d = pairwise_differences(x1, x2);
                let w = factor.solve_triangular(&d.t(), UPLO::Lower)?;
                let r2 = w.mapv(|v| v * v).sum_axis(Axis(0));
                let u = factor.t().solve_triangular(&w, UPLO::Upper)?;
                Ok(RadiusData { r2, u: Some(u) })
            }
        }
    }
}

/// Flattened squared distances, plus the metric solves `u = C^-1 dx`
/// (one column per pair) when the metric is factored.
struct RadiusData<F: Float> {
    r2: Array1<F>,
    u: Option<Array2<F>>,
}

impl<F: Float, R: RadialFunction<F>> Kernel<F> for RadialKernel<F, R> {
    fn ndim(&self) -> usize {
        self.metric.ndim()
    }

    fn n_params(&self) -> usize {
        self.radial.n_extra() + self.metric.n_params()
    }

    fn params(&self) -> Array1<F> {
        let nx = self.radial.n_extra();
        let mut v = Array1::zeros(self.n_params());
        v.slice_mut(s![..nx])
            .assign(&self.radial.extra().mapv(|x| x.ln()));
        v.slice_mut(s![nx..]).assign(&self.metric.log_params());
        v
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(self.n_params(), v.len())?;
        let nx = self.radial.n_extra();
        self.metric.set_log_params(&v.slice(s![nx..]))?;
        let extra = v.slice(s![..nx]).mapv(|x| x.exp());
        self.radial.set_extra(&extra.view());
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        check_input_dims(self.metric.ndim(), x1, x2)?;
        let radii = self.squared_radii(x1, x2)?;
        let k = radii.r2.mapv(|r2| self.radial.value(r2));
        Ok(k.into_shape((x1.nrows(), x2.nrows())).unwrap())
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        check_input_dims(self.metric.ndim(), x1, x2)?;
        let (n1, n2) = (x1.nrows(), x2.nrows());
        let radii = self.squared_radii(x1, x2)?;
        let kg = radii.r2.mapv(|r2| self.radial.grad_r2(r2));

        let nx = self.radial.n_extra();
        let mut g = Array3::zeros((self.n_params(), n1, n2));
        for e in 0..nx {
            let ge = radii.r2.mapv(|r2| self.radial.grad_extra(r2, e));
            g.index_axis_mut(Axis(0), e)
                .assign(&ge.into_shape((n1, n2)).unwrap());
        }
        for m in 0..self.metric.n_params() {
            let theta = self.metric.param(m);
            let mut gm = Array1::zeros(n1 * n2);
            match &radii.u {
                // dr^2/d ln theta = -r^2 in one dimension
                None => {
                    Zip::from(&mut gm)
                        .and(&kg)
                        .and(&radii.r2)
                        .for_each(|gv, &kgv, &r2| *gv = -kgv * r2);
                }
                Some(u) => {
                    Zip::indexed(&mut gm).and(&kg).for_each(|idx, gv, &kgv| {
                        let quad = self.metric.basis_quadratic(m, &u.column(idx));
                        *gv = -kgv * theta * quad;
                    });
                }
            }
            g.index_axis_mut(Axis(0), nx + m)
                .assign(&gm.into_shape((n1, n2)).unwrap());
        }
        Ok(g)
    }
}

macro_rules! declare_radial_kernel {
    ($profile:ident, $doc:literal) => {
        paste! {
            #[doc = $doc]
            pub type [<$profile Kernel>]<F> = RadialKernel<F, $profile>;

            impl<F: Float> RadialKernel<F, $profile> {
                /// Build with the given metric specification
                pub fn new(metric: &MetricSpec<F>, ndim: usize) -> Result<Self> {
                    Self::with_radial($profile, metric, ndim)
                }
            }
        }
    };
}

declare_radial_kernel!(Exp, "Exponential kernel `exp(-r)`");
declare_radial_kernel!(ExpSquared, "Squared exponential kernel `exp(-r^2/2)`");
declare_radial_kernel!(Matern32, "Matern 3/2 kernel");
declare_radial_kernel!(Matern52, "Matern 5/2 kernel");

/// Squared exponential kernel under its other common name
pub type RBFKernel<F> = ExpSquaredKernel<F>;

/// Rational quadratic kernel
pub type RationalQuadraticKernel<F> = RadialKernel<F, RationalQuadratic<F>>;

impl<F: Float> RadialKernel<F, RationalQuadratic<F>> {
    /// Build with mixture parameter `alpha` and the given metric
    pub fn new(alpha: F, metric: &MetricSpec<F>, ndim: usize) -> Result<Self> {
        Self::with_radial(RationalQuadratic::new(alpha)?, metric, ndim)
    }
}
