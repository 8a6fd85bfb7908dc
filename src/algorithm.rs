//! Exact gaussian process regression over a composable covariance kernel.
//!
//! The model owns a [`Kernel`] and a [`MeanModel`]. `compute` stores the
//! training coordinates, sorts them for numerical reproducibility, and
//! factors the covariance matrix `K + diag(yerr^2)` once; likelihoods,
//! gradients, predictions and draws then reuse the factorization until
//! the kernel parameters change. Staleness is tracked through the kernel
//! version counter, so mutating parameters between calls is cheap and
//! safe: the next operation refactors on demand.
//!
//! Observations enter every operation in the caller's original order;
//! the internal permutation is applied on the way in and undone on the
//! way out.

use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::mean_models::{ConstantMean, MeanModel};
use crate::multivariate_normal::MultivariateNormal;
use crate::optimization::{self, OptimizeResult, SlsqpParams};
use crate::utils::{argsort_by_distance, argsort_by_value};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use log::debug;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, Zip};
use ndarray_einsum_beta::*;
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

/// Default observational noise standard deviation, applied when none is
/// given. Added in quadrature to the covariance diagonal, it keeps the
/// factorization of smooth kernels from collapsing on coincident points.
pub const TINY: f64 = 1.25e-12;

/// Per-point observational noise specification, as standard deviations.
#[derive(Debug, Clone)]
pub enum Noise<F: Float> {
    /// No stated uncertainty: the [`TINY`] stabilizing default applies
    Tiny,
    /// The same standard deviation for every point
    Uniform(F),
    /// One standard deviation per point, aligned with the input order
    PerPoint(Array1<F>),
}

impl<F: Float> Default for Noise<F> {
    fn default() -> Self {
        Noise::Tiny
    }
}

/// Training inputs after parsing.
#[derive(Debug, Clone)]
struct TrainingData<F: Float> {
    /// Coordinates in sorted order, one row per sample
    x: Array2<F>,
    /// Noise standard deviations aligned with `x`
    yerr: Array1<F>,
    /// Permutation: `x.row(j)` is row `inds[j]` of the original input
    inds: Vec<usize>,
}

/// Factorization of the noisy covariance matrix.
#[derive(Debug, Clone)]
struct Factorization<F: Float> {
    /// Lower Cholesky factor of `K + diag(yerr^2)`
    factor: Array2<F>,
    /// Normalization constant of the log likelihood
    log_norm: F,
    /// Kernel version the factor was built against
    version: u64,
}

/// Gaussian process regression model.
///
/// ```
/// # fn main() -> Result<(), gpcov::GpError> {
/// use gpcov::{GaussianProcess, MetricSpec, Noise, ExpSquaredKernel};
/// use ndarray::array;
///
/// let kernel = ExpSquaredKernel::<f64>::new(&MetricSpec::Isotropic(1.0), 1)?;
/// let mut gp = GaussianProcess::new(kernel);
/// let x = array![[0.0], [0.7], [1.5], [2.1]];
/// let y = array![0.0, 0.64, 1.0, 0.86];
/// gp.compute(&x, &Noise::Uniform(0.05), true)?;
/// let ll = gp.ln_likelihood(&y, false)?;
/// assert!(ll.is_finite());
/// let (mu, cov) = gp.predict(&y, &array![[1.0]])?;
/// assert_eq!(mu.len(), 1);
/// assert_eq!(cov.shape(), &[1, 1]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct GaussianProcess<F: Float, M: MeanModel<F>, K: Kernel<F>> {
    kernel: K,
    mean: M,
    train: Option<TrainingData<F>>,
    fact: Option<Factorization<F>>,
}

impl<F: Float, K: Kernel<F>> GaussianProcess<F, ConstantMean<F>, K> {
    /// Model with a zero constant mean
    pub fn new(kernel: K) -> Self {
        Self::with_mean(kernel, ConstantMean::default())
    }
}

impl<F: Float, M: MeanModel<F>, K: Kernel<F>> GaussianProcess<F, M, K> {
    /// Model with an explicit mean function
    pub fn with_mean(kernel: K, mean: M) -> Self {
        GaussianProcess {
            kernel,
            mean,
            train: None,
            fact: None,
        }
    }

    /// The covariance kernel
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Mutable access to the covariance kernel. Parameter changes are
    /// picked up lazily by the next operation.
    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// The mean model
    pub fn mean(&self) -> &M {
        &self.mean
    }

    /// Whether the stored factorization is current for the kernel's
    /// parameters
    pub fn computed(&self) -> bool {
        self.train.is_some()
            && matches!(&self.fact, Some(f) if f.version == self.kernel.version())
    }

    /// Log-prior of the kernel and mean parameters
    pub fn log_prior(&self) -> F {
        self.kernel.log_prior() + self.mean.log_prior()
    }

    /// Validate a coordinate matrix against the kernel dimension and
    /// optionally sort it: one dimensional inputs by value, higher
    /// dimensional ones by distance from the first point. Returns the
    /// permuted samples and the permutation itself.
    pub fn parse_samples(
        &self,
        t: &ArrayBase<impl Data<Elem = F>, Ix2>,
        sort: bool,
    ) -> Result<(Array2<F>, Vec<usize>)> {
        if t.ncols() != self.kernel.ndim() {
            return Err(GpError::DimensionError(format!(
                "samples have dimension {}, kernel expects {}",
                t.ncols(),
                self.kernel.ndim()
            )));
        }
        let inds = if !sort {
            (0..t.nrows()).collect()
        } else if t.ncols() == 1 {
            argsort_by_value(&t.column(0))
        } else {
            argsort_by_distance(t)
        };
        let mut x = Array2::zeros((t.nrows(), t.ncols()));
        for (row, &src) in inds.iter().enumerate() {
            x.row_mut(row).assign(&t.row(src));
        }
        Ok((x, inds))
    }

    /// Store training coordinates with their observational noise and
    /// factor the covariance matrix. `sort` should stay on unless the
    /// input is already ordered.
    pub fn compute(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        yerr: &Noise<F>,
        sort: bool,
    ) -> Result<()> {
        let (xs, inds) = self.parse_samples(x, sort)?;
        let n = xs.nrows();
        let yerr = match yerr {
            Noise::Tiny => Array1::from_elem(n, F::cast(TINY)),
            Noise::Uniform(s) => Array1::from_elem(n, *s),
            Noise::PerPoint(v) => {
                if v.len() != n {
                    return Err(GpError::DimensionError(format!(
                        "noise vector has length {}, expected {n}",
                        v.len()
                    )));
                }
                let mut e = Array1::zeros(n);
                for (row, &src) in inds.iter().enumerate() {
                    e[row] = v[src];
                }
                e
            }
        };
        self.train = Some(TrainingData { x: xs, yerr, inds });
        // The old factor no longer matches the data, even at an unchanged
        // kernel version.
        self.fact = None;
        self.factorize()
    }

    fn factorize(&mut self) -> Result<()> {
        let train = self.train.as_ref().ok_or(GpError::NotComputed)?;
        let n = train.x.nrows();
        debug!("factorizing the {n}x{n} covariance matrix");
        let mut k = self.kernel.value(&train.x.view(), &train.x.view())?;
        Zip::from(k.diag_mut())
            .and(&train.yerr)
            .for_each(|d, &e| *d += e * e);
        let factor = k.cholesky()?;
        let half_ln_2pi = F::cast(0.5 * (2. * std::f64::consts::PI).ln());
        let log_norm = -(factor.diag().mapv(|v| v.ln()).sum() + half_ln_2pi * F::cast(n as f64));
        self.fact = Some(Factorization {
            factor,
            log_norm,
            version: self.kernel.version(),
        });
        Ok(())
    }

    /// Ensure the stored factorization matches the kernel's current
    /// parameters, rebuilding it from the stored training data when
    /// needed. With `quiet`, numerical failures yield `Ok(false)` instead
    /// of an error; using the model before `compute` is an error either
    /// way.
    pub fn recompute(&mut self, quiet: bool) -> Result<bool> {
        if self.computed() {
            return Ok(true);
        }
        if self.train.is_none() {
            return Err(GpError::NotComputed);
        }
        match self.factorize() {
            Ok(()) => Ok(true),
            Err(err) if quiet => {
                debug!("covariance factorization failed quietly: {err}");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Observations permuted into training order, centered on the mean,
    /// as a column.
    fn residual(&self, y: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<Array2<F>> {
        let train = self.train.as_ref().ok_or(GpError::NotComputed)?;
        let n = train.x.nrows();
        if y.len() != n {
            return Err(GpError::DimensionError(format!(
                "observations have length {}, expected {n}",
                y.len()
            )));
        }
        let mean = self.mean.value(&train.x);
        let mut r = Array2::zeros((n, 1));
        for (row, &src) in train.inds.iter().enumerate() {
            r[[row, 0]] = y[src] - mean[row];
        }
        Ok(r)
    }

    fn selected_dims(&self, dims: Option<&[usize]>) -> Result<Vec<usize>> {
        let p = self.kernel.n_params();
        match dims {
            None => Ok((0..p).collect()),
            Some(d) => {
                for &i in d {
                    if i >= p {
                        return Err(GpError::ParamError(format!(
                            "gradient index {i} out of range for {p} parameter(s)"
                        )));
                    }
                }
                Ok(d.to_vec())
            }
        }
    }

    /// Log marginal likelihood of observations `y` under the model.
    ///
    /// With `quiet`, a failed factorization yields negative infinity.
    /// A non-finite result is mapped to negative infinity in any case, so
    /// optimizer probes into degenerate parameter regions stay ordered.
    pub fn ln_likelihood(
        &mut self,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        quiet: bool,
    ) -> Result<F> {
        if !self.recompute(quiet)? {
            return Ok(F::neg_infinity());
        }
        let r = self.residual(y)?;
        let fact = self.fact.as_ref().ok_or(GpError::NotComputed)?;
        let z = fact.factor.solve_triangular(&r, UPLO::Lower)?;
        let ll = fact.log_norm - F::cast(0.5) * z.mapv(|v| v * v).sum();
        Ok(if ll.is_finite() {
            ll
        } else {
            F::neg_infinity()
        })
    }

    /// Gradient of the log marginal likelihood with respect to the kernel
    /// log-parameters, restricted to `dims` when given.
    ///
    /// With `quiet`, a failed factorization yields a zero gradient of the
    /// selected shape.
    pub fn grad_ln_likelihood(
        &mut self,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        dims: Option<&[usize]>,
        quiet: bool,
    ) -> Result<Array1<F>> {
        let sel = self.selected_dims(dims)?;
        if !self.recompute(quiet)? {
            return Ok(Array1::zeros(sel.len()));
        }
        if sel.is_empty() {
            return Ok(Array1::zeros(0));
        }
        let r = self.residual(y)?;
        let train = self.train.as_ref().ok_or(GpError::NotComputed)?;
        let fact = self.fact.as_ref().ok_or(GpError::NotComputed)?;

        let z = fact.factor.solve_triangular(&r, UPLO::Lower)?;
        let alpha = fact.factor.t().solve_triangular(&z, UPLO::Upper)?;
        let alpha = alpha.column(0).to_owned();

        let kg = self.kernel.gradient(&train.x.view(), &train.x.view())?;
        // alpha^T K_i alpha for every parameter at once
        let va = einsum("pij,j->pi", &[&kg, &alpha]).unwrap();
        let quad = einsum("pi,i->p", &[&va, &alpha])
            .unwrap()
            .into_dimensionality::<Ix1>()
            .unwrap();

        let half = F::cast(0.5);
        let mut g = Array1::zeros(sel.len());
        for (slot, &i) in sel.iter().enumerate() {
            let ki = kg.index_axis(Axis(0), i);
            // tr(K^-1 K_i) through the factor
            let w = fact.factor.solve_triangular(&ki, UPLO::Lower)?;
            let m = fact.factor.t().solve_triangular(&w, UPLO::Upper)?;
            g[slot] = half * (quad[i] - m.diag().sum());
        }
        Ok(g)
    }

    /// Predictive mean and covariance at coordinates `t` conditioned on
    /// observations `y`.
    pub fn predict(
        &mut self,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        t: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<(Array1<F>, Array2<F>)> {
        self.recompute(false)?;
        let r = self.residual(y)?;
        let (xs, _) = self.parse_samples(t, false)?;
        let train = self.train.as_ref().ok_or(GpError::NotComputed)?;
        let fact = self.fact.as_ref().ok_or(GpError::NotComputed)?;

        let z = fact.factor.solve_triangular(&r, UPLO::Lower)?;
        let alpha = fact.factor.t().solve_triangular(&z, UPLO::Upper)?;
        let kxs = self.kernel.value(&xs.view(), &train.x.view())?;
        let mu = kxs.dot(&alpha).column(0).to_owned() + self.mean.value(&xs);

        let v = fact.factor.solve_triangular(&kxs.t(), UPLO::Lower)?;
        let cov = self.kernel.value(&xs.view(), &xs.view())? - v.t().dot(&v);
        Ok((mu, cov))
    }

    /// Covariance matrix of the bare kernel at coordinates `t`
    pub fn covariance(&self, t: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let (xs, _) = self.parse_samples(t, false)?;
        self.kernel.value(&xs.view(), &xs.view())
    }

    /// Draw `size` samples from the prior at the computed training
    /// coordinates, one row per sample, columns in the original input
    /// order.
    pub fn sample<R: Rng>(&mut self, size: usize, rng: &mut R) -> Result<Array2<F>> {
        self.recompute(false)?;
        let train = self.train.as_ref().ok_or(GpError::NotComputed)?;
        let fact = self.fact.as_ref().ok_or(GpError::NotComputed)?;
        let n = train.x.nrows();
        let normal = Normal::new(0., 1.).unwrap();
        let draws = Array2::random_using((size, n), normal, rng).mapv(|v| F::cast(v));
        let sorted = draws.dot(&fact.factor.t()) + &self.mean.value(&train.x);
        // Undo the training permutation so columns line up with the
        // caller's input order.
        let mut out = Array2::zeros((size, n));
        for (col, &orig) in train.inds.iter().enumerate() {
            out.column_mut(orig).assign(&sorted.column(col));
        }
        Ok(out)
    }

    /// Draw `size` samples from the prior at arbitrary coordinates `t`.
    ///
    /// No computed state is needed: the bare kernel matrix is factored on
    /// the fly, falling back to an eigendecomposition when it is merely
    /// semi-definite.
    pub fn sample_at<R: Rng>(
        &self,
        t: &ArrayBase<impl Data<Elem = F>, Ix2>,
        size: usize,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        let (xs, _) = self.parse_samples(t, false)?;
        let cov = self.kernel.value(&xs.view(), &xs.view())?;
        let mean = self.mean.value(&xs);
        Ok(MultivariateNormal::new(mean, cov)?.sample(size, rng))
    }

    /// Draw `size` samples from the predictive distribution at
    /// coordinates `t` conditioned on observations `y`.
    pub fn sample_conditional<R: Rng>(
        &mut self,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        t: &ArrayBase<impl Data<Elem = F>, Ix2>,
        size: usize,
        rng: &mut R,
    ) -> Result<Array2<F>> {
        let (mu, cov) = self.predict(y, t)?;
        Ok(MultivariateNormal::new(mu, cov)?.sample(size, rng))
    }

    /// Fit the kernel hyperparameters by maximizing the log marginal
    /// likelihood with SLSQP, restricted to the log-parameters listed in
    /// `dims` when given. The kernel is left at the optimum.
    pub fn optimize(
        &mut self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
        y: &ArrayBase<impl Data<Elem = F>, Ix1>,
        yerr: &Noise<F>,
        sort: bool,
        dims: Option<&[usize]>,
        params: &SlsqpParams,
    ) -> Result<OptimizeResult<F>> {
        self.compute(x, yerr, sort)?;
        let sel = self.selected_dims(dims)?;
        if sel.is_empty() {
            return Err(GpError::ParamError(
                "no kernel parameter selected for optimization".into(),
            ));
        }
        let y = y.to_owned();
        optimization::optimize_params(self, &y, &sel, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{add, mul, ConstantKernel, WhiteKernel};
    use crate::radial::{
        ExpSquaredKernel, Matern32Kernel, Matern52Kernel, MetricSpec, RationalQuadraticKernel,
    };
    use approx::assert_abs_diff_eq;
    use argmin_testfunctions::rosenbrock;
    use finitediff::FiniteDiff;
    use ndarray::{array, Array3, ArrayView1, ArrayView2};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use rand_xoshiro::Xoshiro256Plus;
    use std::cell::RefCell;

    /// A symmetric but indefinite "kernel" forcing factorization
    /// failures, for exercising the quiet paths.
    #[derive(Debug)]
    struct IndefiniteKernel;

    impl Kernel<f64> for IndefiniteKernel {
        fn ndim(&self) -> usize {
            1
        }
        fn n_params(&self) -> usize {
            1
        }
        fn params(&self) -> Array1<f64> {
            Array1::zeros(1)
        }
        fn set_params(&mut self, _v: &ArrayView1<f64>) -> Result<()> {
            Ok(())
        }
        fn version(&self) -> u64 {
            0
        }
        fn value(&self, x1: &ArrayView2<f64>, x2: &ArrayView2<f64>) -> Result<Array2<f64>> {
            // 1 on the diagonal, 2 everywhere else: eigenvalues of the
            // 2x2 case are 3 and -1
            let mut k = Array2::from_elem((x1.nrows(), x2.nrows()), 2.0);
            k.diag_mut().fill(1.0);
            Ok(k)
        }
        fn gradient(&self, x1: &ArrayView2<f64>, x2: &ArrayView2<f64>) -> Result<Array3<f64>> {
            Ok(Array3::zeros((1, x1.nrows(), x2.nrows())))
        }
    }

    fn sine_data(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>, Array1<f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        let x: Array2<f64> = Array2::random_using((n, 1), Uniform::new(0., 10.), &mut rng);
        let y = x.column(0).mapv(|v| v.sin());
        let yerr = Array1::random_using(n, Uniform::new(0.05, 0.06), &mut rng);
        (x, y, yerr)
    }

    #[test]
    fn test_likelihood_closed_form_single_point() {
        let kernel = ConstantKernel::new(2.0, 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&array![[0.5]], &Noise::Uniform(0.3), true).unwrap();
        let ll = gp.ln_likelihood(&array![1.2], false).unwrap();
        let k = 4.0 + 0.09;
        let expected = -0.5 * (2. * std::f64::consts::PI * k).ln() - 0.5 * 1.2 * 1.2 / k;
        assert_abs_diff_eq!(expected, ll, epsilon = 1e-10);
    }

    #[test]
    fn test_likelihood_closed_form_two_points() {
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&array![[0.0], [1.0]], &Noise::Uniform(0.3), true)
            .unwrap();
        let y = array![0.7, -0.4];
        let ll = gp.ln_likelihood(&y, false).unwrap();

        // K = [[d, o], [o, d]] with d = 1 + 0.3^2 and o = exp(-1/2)
        let o = (-0.5_f64).exp();
        let d = 1.0 + 0.09;
        let det = d * d - o * o;
        let quad = (d * y[0] * y[0] - 2. * o * y[0] * y[1] + d * y[1] * y[1]) / det;
        let expected = -(2. * std::f64::consts::PI).ln() - 0.5 * det.ln() - 0.5 * quad;
        assert_abs_diff_eq!(expected, ll, epsilon = 1e-10);
    }

    #[test]
    fn test_likelihood_invariant_under_input_order() {
        let (x, y, yerr) = sine_data(20, 3);
        let make = || {
            let kernel = Matern32Kernel::new(&MetricSpec::Isotropic(2.0), 1).unwrap();
            GaussianProcess::new(kernel)
        };
        let mut gp = make();
        gp.compute(&x, &Noise::PerPoint(yerr.clone()), true).unwrap();
        let ll = gp.ln_likelihood(&y, false).unwrap();

        // Feed the same data reversed
        let mut xr = Array2::zeros(x.raw_dim());
        let mut yr = Array1::zeros(y.len());
        let mut er = Array1::zeros(yerr.len());
        let n = x.nrows();
        for i in 0..n {
            xr.row_mut(i).assign(&x.row(n - 1 - i));
            yr[i] = y[n - 1 - i];
            er[i] = yerr[n - 1 - i];
        }
        let mut gp = make();
        gp.compute(&xr, &Noise::PerPoint(er), true).unwrap();
        let llr = gp.ln_likelihood(&yr, false).unwrap();
        assert_abs_diff_eq!(ll, llr, epsilon = 1e-9);

        let (mu, _) = gp.predict(&yr, &array![[4.2]]).unwrap();
        let mut gp = make();
        gp.compute(&x, &Noise::PerPoint(yerr), true).unwrap();
        let (mu2, _) = gp.predict(&y, &array![[4.2]]).unwrap();
        assert_abs_diff_eq!(mu[0], mu2[0], epsilon = 1e-9);
    }

    #[test]
    fn test_factor_reproduces_covariance() {
        let (x, _, _) = sine_data(12, 5);
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.5), 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&x, &Noise::Uniform(0.1), true).unwrap();
        let train = gp.train.as_ref().unwrap();
        let mut expected = gp
            .kernel
            .value(&train.x.view(), &train.x.view())
            .unwrap();
        for d in expected.diag_mut() {
            *d += 0.01;
        }
        let l = &gp.fact.as_ref().unwrap().factor;
        assert_abs_diff_eq!(expected, l.dot(&l.t()), epsilon = 1e-10);
    }

    #[test]
    fn test_noiseless_interpolation() {
        let x = array![[0.0], [0.5], [1.0], [1.5], [2.0]];
        let y = array![0.1, -0.3, 0.8, 0.4, -0.2];
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&x, &Noise::Tiny, true).unwrap();
        let (mu, cov) = gp.predict(&y, &x).unwrap();
        assert_abs_diff_eq!(y, mu, epsilon = 1e-6);
        for i in 0..x.nrows() {
            assert_abs_diff_eq!(0.0, cov[[i, i]], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_constant_mean_shifts_predictions() {
        let (x, y, yerr) = sine_data(15, 11);
        let y_shifted = &y + 2.0;
        let kernel = || Matern32Kernel::new(&MetricSpec::Isotropic(2.0), 1).unwrap();

        let mut gp0 = GaussianProcess::new(kernel());
        gp0.compute(&x, &Noise::PerPoint(yerr.clone()), true).unwrap();
        let ll0 = gp0.ln_likelihood(&y, false).unwrap();
        let g0 = gp0.grad_ln_likelihood(&y, None, false).unwrap();

        let mut gp2 = GaussianProcess::with_mean(kernel(), ConstantMean::new(2.0));
        gp2.compute(&x, &Noise::PerPoint(yerr), true).unwrap();
        let ll2 = gp2.ln_likelihood(&y_shifted, false).unwrap();
        let g2 = gp2.grad_ln_likelihood(&y_shifted, None, false).unwrap();

        assert_abs_diff_eq!(ll0, ll2, epsilon = 1e-9);
        assert_abs_diff_eq!(g0, g2, epsilon = 1e-9);

        let t = array![[3.3], [7.1]];
        let (mu0, cov0) = gp0.predict(&y, &t).unwrap();
        let (mu2, cov2) = gp2.predict(&y_shifted, &t).unwrap();
        assert_abs_diff_eq!(&mu0 + 2.0, mu2, epsilon = 1e-9);
        assert_abs_diff_eq!(cov0, cov2, epsilon = 1e-9);
    }

    #[test]
    fn test_gradient_against_finite_differences() {
        let (x, y, yerr) = sine_data(18, 7);
        let kernel = add(
            mul(
                ConstantKernel::new(1.2, 1).unwrap(),
                Matern32Kernel::new(&MetricSpec::Isotropic(3.0), 1).unwrap(),
            )
            .unwrap(),
            WhiteKernel::new(0.05, 1).unwrap(),
        )
        .unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&x, &Noise::PerPoint(yerr), true).unwrap();
        let grad = gp.grad_ln_likelihood(&y, None, false).unwrap();

        let p0 = gp.kernel().params();
        let cell = RefCell::new(gp);
        let f = |p: &Array1<f64>| -> f64 {
            let mut gp = cell.borrow_mut();
            gp.kernel_mut().set_params(&p.view()).unwrap();
            gp.ln_likelihood(&y, false).unwrap()
        };
        let fd = p0.central_diff(&f);
        assert_abs_diff_eq!(grad, fd, epsilon = 1e-4);
    }

    #[test]
    fn test_gradient_matches_differences_general_metric() {
        // Nine log-parameters: amplitude, shape, six metric entries, noise
        let mut rng = Xoshiro256Plus::seed_from_u64(19);
        let x: Array2<f64> = Array2::random_using((16, 3), Uniform::new(-1.5, 1.5), &mut rng);
        let mut y = Array1::zeros(x.nrows());
        for (i, p) in x.rows().into_iter().enumerate() {
            y[i] = (0.9 * p[0]).sin() + 0.4 * p[1] * p[2];
        }
        let kernel = add(
            mul(
                ConstantKernel::new(1.3, 3).unwrap(),
                RationalQuadraticKernel::new(
                    1.7,
                    &MetricSpec::General(vec![1.0, 0.2, 0.9, 0.1, 0.15, 1.1]),
                    3,
                )
                .unwrap(),
            )
            .unwrap(),
            WhiteKernel::new(0.05, 3).unwrap(),
        )
        .unwrap();
        let mut gp = GaussianProcess::new(kernel);
        assert_eq!(9, gp.kernel().n_params());
        gp.compute(&x, &Noise::Uniform(0.08), true).unwrap();
        let grad = gp.grad_ln_likelihood(&y, None, false).unwrap();

        let p0 = gp.kernel().params();
        let cell = RefCell::new(gp);
        let f = |p: &Array1<f64>| -> f64 {
            let mut gp = cell.borrow_mut();
            gp.kernel_mut().set_params(&p.view()).unwrap();
            gp.ln_likelihood(&y, false).unwrap()
        };
        let fd = p0.central_diff(&f);
        assert_abs_diff_eq!(grad, fd, epsilon = 1e-4);
    }

    #[test]
    fn test_gradient_dims_selection() {
        let (x, y, yerr) = sine_data(14, 9);
        let kernel = mul(
            ConstantKernel::new(1.2, 1).unwrap(),
            Matern32Kernel::new(&MetricSpec::Isotropic(3.0), 1).unwrap(),
        )
        .unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&x, &Noise::PerPoint(yerr), true).unwrap();
        let full = gp.grad_ln_likelihood(&y, None, false).unwrap();
        let part = gp.grad_ln_likelihood(&y, Some(&[1]), false).unwrap();
        assert_eq!(1, part.len());
        assert_abs_diff_eq!(full[1], part[0], epsilon = 1e-12);
        assert!(gp.grad_ln_likelihood(&y, Some(&[7]), false).is_err());
    }

    #[test]
    fn test_quiet_failure_paths() {
        let mut gp = GaussianProcess::new(IndefiniteKernel);
        let x = array![[0.0], [1.0]];
        let y = array![0.3, -0.1];

        // Factorization fails loudly at compute time
        assert!(gp.compute(&x, &Noise::Tiny, true).is_err());

        // Quiet likelihood maps the failure to negative infinity
        let ll = gp.ln_likelihood(&y, true).unwrap();
        assert_eq!(f64::NEG_INFINITY, ll);
        // Quiet gradient is zero in the selected shape
        let g = gp.grad_ln_likelihood(&y, None, true).unwrap();
        assert_abs_diff_eq!(Array1::<f64>::zeros(1), g, epsilon = 1e-12);
        // Loud calls propagate the factorization error
        assert!(gp.ln_likelihood(&y, false).is_err());
        assert!(matches!(
            gp.ln_likelihood(&y, false),
            Err(GpError::LinalgError(_))
        ));
    }

    #[test]
    fn test_not_computed_is_an_error_even_quietly() {
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        let y = array![0.0, 1.0];
        assert!(matches!(
            gp.ln_likelihood(&y, true),
            Err(GpError::NotComputed)
        ));
        assert!(matches!(
            gp.recompute(true),
            Err(GpError::NotComputed)
        ));
        assert!(gp.predict(&y, &array![[0.5]]).is_err());
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        assert!(gp.sample(3, &mut rng).is_err());
    }

    #[test]
    fn test_parameter_change_triggers_refactorization() {
        let (x, y, yerr) = sine_data(10, 13);
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&x, &Noise::PerPoint(yerr), true).unwrap();
        assert!(gp.computed());
        let ll1 = gp.ln_likelihood(&y, false).unwrap();

        gp.kernel_mut().set_param(0, 2.0_f64.ln()).unwrap();
        assert!(!gp.computed());
        let ll2 = gp.ln_likelihood(&y, false).unwrap();
        assert!(gp.computed());
        assert!((ll1 - ll2).abs() > 1e-6, "likelihood should move with the parameter");
    }

    #[test]
    fn test_compute_input_validation() {
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        // Wrong dimensionality
        assert!(gp.compute(&array![[0.0, 1.0]], &Noise::Tiny, true).is_err());
        // Wrong noise length
        let x = array![[0.0], [1.0]];
        assert!(gp
            .compute(&x, &Noise::PerPoint(array![0.1]), true)
            .is_err());
        // Wrong observation length surfaces on use
        gp.compute(&x, &Noise::Tiny, true).unwrap();
        assert!(gp.ln_likelihood(&array![0.0], false).is_err());
    }

    #[test]
    fn test_sample_columns_follow_input_order() {
        let x_sorted = array![[0.0], [1.0], [2.0], [3.0]];
        let x_shuffled = array![[2.0], [0.0], [3.0], [1.0]];
        let kernel = || ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();

        let mut gp_sorted = GaussianProcess::new(kernel());
        gp_sorted.compute(&x_sorted, &Noise::Uniform(0.1), true).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(99);
        let reference = gp_sorted.sample(6, &mut rng).unwrap();

        let mut gp_shuffled = GaussianProcess::new(kernel());
        gp_shuffled
            .compute(&x_shuffled, &Noise::Uniform(0.1), true)
            .unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(99);
        let shuffled = gp_shuffled.sample(6, &mut rng).unwrap();

        // Same factor, same draws: column j of the shuffled model matches
        // the column of the sorted model holding the same coordinate
        for (shuffled_col, &coord) in x_shuffled.column(0).iter().enumerate() {
            let sorted_col = coord as usize;
            assert_abs_diff_eq!(
                reference.column(sorted_col),
                shuffled.column(shuffled_col),
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_sample_at_fresh_coordinates() {
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let gp = GaussianProcess::new(kernel);
        let t = array![[0.0], [2.0], [5.0]];
        let mut rng = Xoshiro256Plus::seed_from_u64(21);
        let s = gp.sample_at(&t, 8, &mut rng).unwrap();
        assert_eq!(s.shape(), &[8, 3]);
        let mut rng = Xoshiro256Plus::seed_from_u64(21);
        let s2 = gp.sample_at(&t, 8, &mut rng).unwrap();
        assert_abs_diff_eq!(s, s2, epsilon = 1e-12);
    }

    #[test]
    fn test_sample_conditional_tracks_observations() {
        let x: Array2<f64> = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 0.8, 0.9, 0.1];
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&x, &Noise::Uniform(0.01), true).unwrap();
        let t = array![[0.5], [1.5]];
        let mut rng = Xoshiro256Plus::seed_from_u64(17);
        let s = gp.sample_conditional(&y, &t, 200, &mut rng).unwrap();
        assert_eq!(s.shape(), &[200, 2]);
        let (mu, _) = gp.predict(&y, &t).unwrap();
        for j in 0..2 {
            let m = s.column(j).sum() / 200.;
            assert!(
                (m - mu[j]).abs() < 0.2,
                "conditional draws should concentrate near the predictive mean"
            );
        }
    }

    #[test]
    fn test_covariance_matches_kernel() {
        let kernel = ExpSquaredKernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap();
        let gp = GaussianProcess::new(kernel);
        let t = array![[0.0], [1.0]];
        let c = gp.covariance(&t).unwrap();
        assert_abs_diff_eq!(1.0, c[[0, 0]], epsilon = 1e-12);
        assert_abs_diff_eq!((-0.5_f64).exp(), c[[0, 1]], epsilon = 1e-12);
    }

    #[test]
    fn test_optimize_improves_likelihood() {
        let (x, y, yerr) = sine_data(40, 42);
        let kernel = mul(
            ConstantKernel::new(0.8, 1).unwrap(),
            Matern32Kernel::new(&MetricSpec::Isotropic(1.0), 1).unwrap(),
        )
        .unwrap();
        let mut gp = GaussianProcess::new(kernel);
        let noise = Noise::PerPoint(yerr);
        gp.compute(&x, &noise, true).unwrap();
        let before = gp.ln_likelihood(&y, false).unwrap();

        let res = gp
            .optimize(&x, &y, &noise, true, None, &SlsqpParams::default())
            .unwrap();
        let after = gp.ln_likelihood(&y, false).unwrap();
        assert!(
            after >= before - 1e-9,
            "optimization should not lose likelihood: {before} -> {after}"
        );
        // The kernel is left at the reported optimum
        assert_abs_diff_eq!(res.x, gp.kernel().params(), epsilon = 1e-10);
        assert_abs_diff_eq!(-res.fval, after, epsilon = 1e-9);
    }

    #[test]
    fn test_optimize_respects_dims() {
        let (x, y, yerr) = sine_data(25, 8);
        let kernel = mul(
            ConstantKernel::new(0.9, 1).unwrap(),
            Matern32Kernel::new(&MetricSpec::Isotropic(2.0), 1).unwrap(),
        )
        .unwrap();
        let mut gp = GaussianProcess::new(kernel);
        let p0 = gp.kernel().params();
        gp.optimize(
            &x,
            &y,
            &Noise::PerPoint(yerr),
            true,
            Some(&[0]),
            &SlsqpParams::default(),
        )
        .unwrap();
        let p1 = gp.kernel().params();
        // The frozen metric parameter stays put
        assert_abs_diff_eq!(p0[1], p1[1], epsilon = 1e-12);
    }

    #[test]
    fn test_matern_composition_scenario() {
        // Noisy sine observations under an amplitude-scaled Matern 3/2
        // plus a small constant floor
        let (x, y, yerr) = sine_data(50, 1234);
        let kernel = add(
            mul(
                ConstantKernel::from_value(1.0, 1).unwrap(),
                Matern32Kernel::new(&MetricSpec::Isotropic(5.0), 1).unwrap(),
            )
            .unwrap(),
            ConstantKernel::from_value(0.001, 1).unwrap(),
        )
        .unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&x, &Noise::PerPoint(yerr), true).unwrap();
        let ll = gp.ln_likelihood(&y, false).unwrap();
        assert!(ll.is_finite());
        let g = gp.grad_ln_likelihood(&y, None, false).unwrap();
        assert_eq!(3, g.len());
        assert!(g.iter().all(|v| v.is_finite()));

        let t = Array2::from_shape_fn((25, 1), |(i, _)| 10. * i as f64 / 24.);
        let (mu, cov) = gp.predict(&y, &t).unwrap();
        assert!(mu.iter().all(|v| v.is_finite()));
        assert!(cov.iter().all(|v| v.is_finite()));
        // The fit should track the underlying sine reasonably well
        for (i, m) in mu.iter().enumerate() {
            let truth = (10. * i as f64 / 24.).sin();
            assert!(
                (m - truth).abs() < 0.5,
                "prediction {m} strayed from {truth}"
            );
        }
    }

    fn rosenb(x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array1<f64> {
        let mut y: Array1<f64> = Array1::zeros(x.nrows());
        Zip::from(&mut y).and(x.rows()).for_each(|yi, xi| {
            *yi = rosenbrock(&xi.to_vec());
        });
        y
    }

    #[test]
    fn test_rosenbrock_2d_fit() {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt = Array2::random_using((60, 2), Uniform::new(-1., 1.), &mut rng);
        // Normalize targets so the unit-amplitude kernel is a sensible prior
        let raw = rosenb(&xt);
        let scale = raw.mapv(|v| v * v).mean().unwrap().sqrt();
        let yt = raw.mapv(|v| v / scale);

        let kernel = Matern52Kernel::new(&MetricSpec::AxisAligned(vec![0.25, 0.25]), 2).unwrap();
        let mut gp = GaussianProcess::new(kernel);
        gp.compute(&xt, &Noise::Uniform(0.01), true).unwrap();
        assert!(gp.ln_likelihood(&yt, false).unwrap().is_finite());

        // In-sample reconstruction is tight at low noise
        let (mu, cov) = gp.predict(&yt, &xt).unwrap();
        let err = (&mu - &yt).mapv(|v| v * v).sum().sqrt() / yt.mapv(|v| v * v).sum().sqrt();
        assert!(err < 0.1, "in-sample relative error too large: {err}");
        for i in 0..xt.nrows() {
            assert!(cov[[i, i]] < 0.1, "posterior variance should collapse on data");
        }

        // Held-out points are looser but still tracked
        let xv = Array2::random_using((100, 2), Uniform::new(-1., 1.), &mut rng);
        let yv = rosenb(&xv).mapv(|v| v / scale);
        let (mv, _) = gp.predict(&yt, &xv).unwrap();
        let err = (&mv - &yv).mapv(|v| v * v).sum().sqrt() / yv.mapv(|v| v * v).sum().sqrt();
        assert!(err < 0.4, "held-out relative error too large: {err}");
    }
}
