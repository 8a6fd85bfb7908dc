//! Covariance kernels and their compositional algebra.
//!
//! A kernel maps two sets of coordinates to a covariance matrix. Kernels
//! expose their hyperparameters as a flat vector in log-space, which keeps
//! positive quantities unconstrained during optimization, and report
//! analytic gradients with respect to those log-parameters.
//!
//! Kernels compose: [`add`] and [`mul`] build [`Sum`] and [`Product`]
//! nodes over boxed operands, and the resulting tree behaves like any
//! other kernel. Parameter vectors of composite kernels concatenate the
//! operand vectors, first operand first.
//!
//! Distance-based kernels parameterized by a metric live in
//! [`radial`](crate::radial); this module provides the leaves that do not
//! fit the radial form: [`ConstantKernel`], [`WhiteKernel`],
//! [`DotProductKernel`], [`CosineKernel`] and [`ExpSine2Kernel`].

use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Zip};
use std::fmt;

/// A trait for covariance kernels.
///
/// Implementations must be usable behind a trait object so that kernel
/// trees can mix leaf types freely.
pub trait Kernel<F: Float>: fmt::Debug {
    /// Declared input dimensionality
    fn ndim(&self) -> usize;

    /// Number of hyperparameters
    fn n_params(&self) -> usize;

    /// Hyperparameter vector in log-space
    fn params(&self) -> Array1<F>;

    /// Replace the whole log-parameter vector, rebuilding any derived
    /// state and bumping the version counter
    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()>;

    /// Monotone counter incremented on every parameter mutation, used to
    /// detect stale factorizations
    fn version(&self) -> u64;

    /// Covariance matrix between the rows of `x1` and the rows of `x2`,
    /// shape `(x1.nrows(), x2.nrows())`
    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>>;

    /// Gradient of [`value`](Kernel::value) with respect to each
    /// log-parameter, shape `(n_params, x1.nrows(), x2.nrows())`
    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>>;

    /// Log-prior of the kernel parameters
    fn log_prior(&self) -> F {
        F::zero()
    }

    /// Read the `i`-th log-parameter
    fn param(&self, i: usize) -> Result<F> {
        let v = self.params();
        if i >= v.len() {
            return Err(param_index_error(i, v.len()));
        }
        Ok(v[i])
    }

    /// Write the `i`-th log-parameter
    fn set_param(&mut self, i: usize, value: F) -> Result<()> {
        let mut v = self.params();
        if i >= v.len() {
            return Err(param_index_error(i, v.len()));
        }
        v[i] = value;
        self.set_params(&v.view())
    }
}

impl<F: Float> Kernel<F> for Box<dyn Kernel<F>> {
    fn ndim(&self) -> usize {
        (**self).ndim()
    }
    fn n_params(&self) -> usize {
        (**self).n_params()
    }
    fn params(&self) -> Array1<F> {
        (**self).params()
    }
    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        (**self).set_params(v)
    }
    fn version(&self) -> u64 {
        (**self).version()
    }
    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        (**self).value(x1, x2)
    }
    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        (**self).gradient(x1, x2)
    }
    fn log_prior(&self) -> F {
        (**self).log_prior()
    }
    fn param(&self, i: usize) -> Result<F> {
        (**self).param(i)
    }
    fn set_param(&mut self, i: usize, value: F) -> Result<()> {
        (**self).set_param(i, value)
    }
}

fn param_index_error(i: usize, len: usize) -> GpError {
    GpError::ParamError(format!("index {i} out of range for {len} parameter(s)"))
}

pub(crate) fn check_n_params(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(GpError::ParamError(format!(
            "expected {expected} parameter(s), got {got}"
        )));
    }
    Ok(())
}

pub(crate) fn check_positive<F: Float>(value: F, what: &str) -> Result<()> {
    if !(value > F::zero()) || !value.is_finite() {
        return Err(GpError::ParamError(format!(
            "{what} must be positive and finite"
        )));
    }
    Ok(())
}

pub(crate) fn check_input_dims<F: Float>(
    ndim: usize,
    x1: &ArrayView2<F>,
    x2: &ArrayView2<F>,
) -> Result<()> {
    if x1.ncols() != ndim || x2.ncols() != ndim {
        return Err(GpError::DimensionError(format!(
            "kernel expects {}-dimensional inputs, got {} and {}",
            ndim,
            x1.ncols(),
            x2.ncols()
        )));
    }
    Ok(())
}

/// Euclidean squared distance between each row pair.
fn squared_distances<F: Float>(x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Array2<F> {
    let mut d2 = Array2::zeros((x1.nrows(), x2.nrows()));
    Zip::indexed(&mut d2).for_each(|(i, j), v| {
        let diff = &x1.row(i) - &x2.row(j);
        *v = diff.dot(&diff);
    });
    d2
}

/// Compose two kernels as `k1 + k2`. Fails when the operands do not share
/// the same input dimensionality.
pub fn add<F: Float>(
    k1: impl Kernel<F> + 'static,
    k2: impl Kernel<F> + 'static,
) -> Result<Sum<F>> {
    Sum::new(Box::new(k1), Box::new(k2))
}

/// Compose two kernels as `k1 * k2`. Fails when the operands do not share
/// the same input dimensionality.
pub fn mul<F: Float>(
    k1: impl Kernel<F> + 'static,
    k2: impl Kernel<F> + 'static,
) -> Result<Product<F>> {
    Product::new(Box::new(k1), Box::new(k2))
}

fn check_same_ndim<F: Float>(k1: &dyn Kernel<F>, k2: &dyn Kernel<F>) -> Result<()> {
    if k1.ndim() != k2.ndim() {
        return Err(GpError::DimensionError(format!(
            "cannot compose kernels of dimension {} and {}",
            k1.ndim(),
            k2.ndim()
        )));
    }
    Ok(())
}

/// Sum of two kernels
#[derive(Debug)]
pub struct Sum<F: Float> {
    k1: Box<dyn Kernel<F>>,
    k2: Box<dyn Kernel<F>>,
}

impl<F: Float> Sum<F> {
    /// Compose `k1 + k2` from boxed operands
    pub fn new(k1: Box<dyn Kernel<F>>, k2: Box<dyn Kernel<F>>) -> Result<Self> {
        check_same_ndim(k1.as_ref(), k2.as_ref())?;
        Ok(Sum { k1, k2 })
    }

    /// First operand
    pub fn k1(&self) -> &dyn Kernel<F> {
        self.k1.as_ref()
    }

    /// Second operand
    pub fn k2(&self) -> &dyn Kernel<F> {
        self.k2.as_ref()
    }
}

impl<F: Float> Kernel<F> for Sum<F> {
    fn ndim(&self) -> usize {
        self.k1.ndim()
    }

    fn n_params(&self) -> usize {
        self.k1.n_params() + self.k2.n_params()
    }

    fn params(&self) -> Array1<F> {
        let mut v = Array1::zeros(self.n_params());
        let split = self.k1.n_params();
        v.slice_mut(s![..split]).assign(&self.k1.params());
        v.slice_mut(s![split..]).assign(&self.k2.params());
        v
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(self.n_params(), v.len())?;
        let split = self.k1.n_params();
        self.k1.set_params(&v.slice(s![..split]))?;
        self.k2.set_params(&v.slice(s![split..]))
    }

    fn version(&self) -> u64 {
        self.k1.version() + self.k2.version()
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        Ok(self.k1.value(x1, x2)? + self.k2.value(x1, x2)?)
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        let g1 = self.k1.gradient(x1, x2)?;
        let g2 = self.k2.gradient(x1, x2)?;
        let mut g = Array3::zeros((self.n_params(), x1.nrows(), x2.nrows()));
        let split = self.k1.n_params();
        g.slice_mut(s![..split, .., ..]).assign(&g1);
        g.slice_mut(s![split.., .., ..]).assign(&g2);
        Ok(g)
    }

    fn log_prior(&self) -> F {
        self.k1.log_prior() + self.k2.log_prior()
    }
}

/// Product of two kernels
#[derive(Debug)]
pub struct Product<F: Float> {
    k1: Box<dyn Kernel<F>>,
    k2: Box<dyn Kernel<F>>,
}

impl<F: Float> Product<F> {
    /// Compose `k1 * k2` from boxed operands
    pub fn new(k1: Box<dyn Kernel<F>>, k2: Box<dyn Kernel<F>>) -> Result<Self> {
        check_same_ndim(k1.as_ref(), k2.as_ref())?;
        Ok(Product { k1, k2 })
    }

    /// First operand
    pub fn k1(&self) -> &dyn Kernel<F> {
        self.k1.as_ref()
    }

    /// Second operand
    pub fn k2(&self) -> &dyn Kernel<F> {
        self.k2.as_ref()
    }
}

impl<F: Float> Kernel<F> for Product<F> {
    fn ndim(&self) -> usize {
        self.k1.ndim()
    }

    fn n_params(&self) -> usize {
        self.k1.n_params() + self.k2.n_params()
    }

    fn params(&self) -> Array1<F> {
        let mut v = Array1::zeros(self.n_params());
        let split = self.k1.n_params();
        v.slice_mut(s![..split]).assign(&self.k1.params());
        v.slice_mut(s![split..]).assign(&self.k2.params());
        v
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(self.n_params(), v.len())?;
        let split = self.k1.n_params();
        self.k1.set_params(&v.slice(s![..split]))?;
        self.k2.set_params(&v.slice(s![split..]))
    }

    fn version(&self) -> u64 {
        self.k1.version() + self.k2.version()
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        Ok(self.k1.value(x1, x2)? * self.k2.value(x1, x2)?)
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        // Product rule: each operand gradient is scaled by the other
        // operand's value.
        let mut g1 = self.k1.gradient(x1, x2)?;
        let mut g2 = self.k2.gradient(x1, x2)?;
        let k1v = self.k1.value(x1, x2)?;
        let k2v = self.k2.value(x1, x2)?;
        for mut gi in g1.axis_iter_mut(Axis(0)) {
            gi *= &k2v;
        }
        for mut gi in g2.axis_iter_mut(Axis(0)) {
            gi *= &k1v;
        }
        let mut g = Array3::zeros((self.n_params(), x1.nrows(), x2.nrows()));
        let split = self.k1.n_params();
        g.slice_mut(s![..split, .., ..]).assign(&g1);
        g.slice_mut(s![split.., .., ..]).assign(&g2);
        Ok(g)
    }

    fn log_prior(&self) -> F {
        self.k1.log_prior() + self.k2.log_prior()
    }
}

/// Constant covariance `c^2` between every pair of points.
///
/// The single parameter is `c`; [`ConstantKernel::from_value`] builds the
/// kernel evaluating to a given covariance directly.
#[derive(Debug, Clone)]
pub struct ConstantKernel<F: Float> {
    constant: F,
    ndim: usize,
    version: u64,
}

impl<F: Float> ConstantKernel<F> {
    /// New constant kernel with parameter `c`, evaluating to `c^2`
    pub fn new(constant: F, ndim: usize) -> Result<Self> {
        check_positive(constant, "constant")?;
        Ok(ConstantKernel {
            constant,
            ndim,
            version: 0,
        })
    }

    /// Kernel evaluating to covariance `value`: the stored parameter is
    /// `sqrt(|value|)`, so `value` must be non-zero
    pub fn from_value(value: F, ndim: usize) -> Result<Self> {
        Self::new(value.abs().sqrt(), ndim)
    }
}

impl<F: Float> Kernel<F> for ConstantKernel<F> {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn n_params(&self) -> usize {
        1
    }

    fn params(&self) -> Array1<F> {
        Array1::from_elem(1, self.constant.ln())
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(1, v.len())?;
        self.constant = v[0].exp();
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        let c2 = self.constant * self.constant;
        Ok(Array2::from_elem((x1.nrows(), x2.nrows()), c2))
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        let dc2 = F::cast(2.) * self.constant * self.constant;
        Ok(Array3::from_elem((1, x1.nrows(), x2.nrows()), dc2))
    }
}

/// White noise kernel: covariance `c^2` between coincident points, zero
/// everywhere else.
///
/// Coincidence is exact equality of the squared euclidean distance with
/// zero, so the kernel contributes to the diagonal when a point set is
/// compared with itself.
#[derive(Debug, Clone)]
pub struct WhiteKernel<F: Float> {
    level: F,
    ndim: usize,
    version: u64,
}

impl<F: Float> WhiteKernel<F> {
    /// New white noise kernel with standard deviation `level`
    pub fn new(level: F, ndim: usize) -> Result<Self> {
        check_positive(level, "level")?;
        Ok(WhiteKernel {
            level,
            ndim,
            version: 0,
        })
    }

    fn fill_coincident(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>, fill: F) -> Array2<F> {
        let d2 = squared_distances(x1, x2);
        d2.mapv(|v| if v == F::zero() { fill } else { F::zero() })
    }
}

impl<F: Float> Kernel<F> for WhiteKernel<F> {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn n_params(&self) -> usize {
        1
    }

    fn params(&self) -> Array1<F> {
        Array1::from_elem(1, self.level.ln())
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(1, v.len())?;
        self.level = v[0].exp();
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        Ok(self.fill_coincident(x1, x2, self.level * self.level))
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        let d = self.fill_coincident(x1, x2, F::cast(2.) * self.level * self.level);
        Ok(d.insert_axis(Axis(0)))
    }
}

/// Linear covariance `x1 . x2` with no hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DotProductKernel {
    ndim: usize,
}

impl DotProductKernel {
    /// New dot product kernel over `ndim`-dimensional inputs
    pub fn new(ndim: usize) -> Self {
        DotProductKernel { ndim }
    }
}

impl<F: Float> Kernel<F> for DotProductKernel {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn n_params(&self) -> usize {
        0
    }

    fn params(&self) -> Array1<F> {
        Array1::zeros(0)
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(0, v.len())
    }

    fn version(&self) -> u64 {
        0
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        Ok(x1.dot(&x2.t()))
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        Ok(Array3::zeros((0, x1.nrows(), x2.nrows())))
    }
}

/// Cosine kernel `cos(2 pi |x1 - x2| / period)`
#[derive(Debug, Clone)]
pub struct CosineKernel<F: Float> {
    period: F,
    omega: F,
    ndim: usize,
    version: u64,
}

impl<F: Float> CosineKernel<F> {
    /// New cosine kernel with the given period
    pub fn new(period: F, ndim: usize) -> Result<Self> {
        check_positive(period, "period")?;
        let mut k = CosineKernel {
            period,
            omega: F::zero(),
            ndim,
            version: 0,
        };
        k.rebuild();
        Ok(k)
    }

    fn rebuild(&mut self) {
        self.omega = F::cast(2. * std::f64::consts::PI) / self.period;
    }
}

impl<F: Float> Kernel<F> for CosineKernel<F> {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn n_params(&self) -> usize {
        1
    }

    fn params(&self) -> Array1<F> {
        Array1::from_elem(1, self.period.ln())
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(1, v.len())?;
        self.period = v[0].exp();
        self.rebuild();
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        let omega = self.omega;
        Ok(squared_distances(x1, x2).mapv(|d2| (omega * d2.sqrt()).cos()))
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        let omega = self.omega;
        let g = squared_distances(x1, x2).mapv(|d2| {
            let x = d2.sqrt();
            x * (omega * x).sin() * omega
        });
        Ok(g.insert_axis(Axis(0)))
    }
}

/// Exponential sine squared kernel
/// `exp(-gamma sin^2(pi |x1 - x2| / period))`, suited to strictly
/// periodic signals
#[derive(Debug, Clone)]
pub struct ExpSine2Kernel<F: Float> {
    gamma: F,
    period: F,
    omega: F,
    ndim: usize,
    version: u64,
}

impl<F: Float> ExpSine2Kernel<F> {
    /// New periodic kernel with scale `gamma` and the given period
    pub fn new(gamma: F, period: F, ndim: usize) -> Result<Self> {
        check_positive(gamma, "gamma")?;
        check_positive(period, "period")?;
        let mut k = ExpSine2Kernel {
            gamma,
            period,
            omega: F::zero(),
            ndim,
            version: 0,
        };
        k.rebuild();
        Ok(k)
    }

    fn rebuild(&mut self) {
        self.omega = F::cast(std::f64::consts::PI) / self.period;
    }
}

impl<F: Float> Kernel<F> for ExpSine2Kernel<F> {
    fn ndim(&self) -> usize {
        self.ndim
    }

    fn n_params(&self) -> usize {
        2
    }

    fn params(&self) -> Array1<F> {
        Array1::from_vec(vec![self.gamma.ln(), self.period.ln()])
    }

    fn set_params(&mut self, v: &ArrayView1<F>) -> Result<()> {
        check_n_params(2, v.len())?;
        self.gamma = v[0].exp();
        self.period = v[1].exp();
        self.rebuild();
        self.version += 1;
        Ok(())
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn value(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array2<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        let (gamma, omega) = (self.gamma, self.omega);
        Ok(squared_distances(x1, x2).mapv(|d2| {
            let s = (omega * d2.sqrt()).sin();
            (-gamma * s * s).exp()
        }))
    }

    fn gradient(&self, x1: &ArrayView2<F>, x2: &ArrayView2<F>) -> Result<Array3<F>> {
        check_input_dims(self.ndim, x1, x2)?;
        let (gamma, omega) = (self.gamma, self.omega);
        let d2 = squared_distances(x1, x2);
        let mut g = Array3::zeros((2, d2.nrows(), d2.ncols()));
        Zip::indexed(&d2).for_each(|(i, j), &v| {
            let x = v.sqrt();
            let sx = (omega * x).sin();
            let cx = (omega * x).cos();
            let k = (-gamma * sx * sx).exp();
            g[[0, i, j]] = -k * gamma * sx * sx;
            g[[1, i, j]] = F::cast(2.) * k * gamma * sx * cx * x * omega;
        });
        Ok(g)
    }
}
