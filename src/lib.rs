//! This library implements exact [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression with composable covariance kernels.
//!
//! Covariance functions are assembled from building blocks implementing the
//! [Kernel] trait. Radial kernels such as [ExpSquaredKernel] or
//! [Matern32Kernel] evaluate a radial profile at squared distances measured
//! by a metric over the input space ([MetricSpec]): isotropic, axis-aligned
//! or a general positive definite matrix. Closed-form kernels
//! ([ConstantKernel], [CosineKernel], [ExpSine2Kernel], ...) cover the
//! non-radial shapes, and [add]/[mul] combine any of them into sum and
//! product expressions. Every kernel carries the analytic gradient of its
//! value with respect to its own log-parameters, so the marginal likelihood
//! of a model can be maximized with a gradient-based optimizer.
//!
//! The regression engine is implemented by [GaussianProcess]: it factors
//! the noisy covariance matrix once per parameter setting and reuses the
//! factorization for likelihoods, gradients, predictions and sampling until
//! the kernel parameters change.
//!
//! Example:
//! ```
//! use gpcov::{GaussianProcess, MetricSpec, Noise, RBFKernel, SlsqpParams};
//! use ndarray::{array, Array1, Array2};
//!
//! // Noisy observations of a smooth signal of one variable.
//! let x: Array2<f64> = array![[-4.0], [-3.1], [-1.9], [-0.7], [0.4], [1.6], [2.8], [4.0]];
//! let y: Array1<f64> = x.column(0).mapv(|v| (0.8 * v).sin());
//!
//! let kernel = RBFKernel::new(&MetricSpec::Isotropic(1.5), 1).unwrap();
//! let mut gp = GaussianProcess::new(kernel);
//!
//! // Fit the kernel log-parameters by maximum likelihood.
//! let res = gp
//!     .optimize(&x, &y, &Noise::Uniform(0.05), true, None, &SlsqpParams::default())
//!     .unwrap();
//! assert!(res.fval.is_finite());
//!
//! // Predict at new coordinates under the fitted model.
//! let (mu, cov) = gp.predict(&y, &array![[0.0], [1.0]]).unwrap();
//! assert_eq!(mu.len(), 2);
//! assert!(cov[[0, 0]] >= 0.);
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod errors;
mod kernels;
mod mean_models;
mod metric;
mod multivariate_normal;
mod optimization;
mod radial;
mod utils;

pub use algorithm::*;
pub use errors::*;
pub use kernels::*;
pub use mean_models::*;
pub use multivariate_normal::MultivariateNormal;
pub use optimization::{OptimizeResult, SlsqpParams};
pub use radial::*;
pub use utils::{argsort_by_distance, argsort_by_value};
