//! This library turns a trained neural network into a [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! through a [Laplace approximation](https://en.wikipedia.org/wiki/Laplace%27s_approximation)
//! of the posterior over its weights.
//!
//! The computation goes in three steps:
//! * a generalized Gauss-Newton (GGN) curvature operator `v ↦ Hv` is built from a loss,
//!   a batch and the trained weights with [`create_curvature_operator`],
//! * a posterior covariance over weights `Σ = (H + τI)^{-1}` is derived with [`create_posterior`],
//!   either exactly ([`PosteriorStrategy::Full`]), from the leading eigenpairs of the
//!   curvature computed with Lanczos ([`PosteriorStrategy::LowRank`]) or from its
//!   diagonal ([`PosteriorStrategy::Diagonal`]),
//! * the covariance is pushed forward through the network Jacobian giving the kernel
//!   `k(x, x') = J(x) Σ J(x')ᵀ` set up with [`set_posterior_gp_kernel`].
//!
//! Curvature and covariance are never stored as `P x P` matrices unless the full
//! strategy is selected, they are [`LinearOperator`]s acting on flat weight vectors.
//! Weights are handled as [`ParamTree`]s, any model implementing [`DifferentiableModel`]
//! (forward evaluation, Jacobian-vector and vector-Jacobian products) can be used.
//! A tanh multi-layer perceptron [`Mlp`] and a least-squares trainer are provided.
//!
//! ```
//! use laplace_gp::*;
//! use linfa::Dataset;
//! use ndarray::{Array, Axis};
//! use ndarray_rand::rand::SeedableRng;
//! use rand_xoshiro::Xoshiro256Plus;
//!
//! let mlp = Mlp::new(&[1, 10, 1]).expect("valid sizes");
//! let init = mlp.init_params(&mut Xoshiro256Plus::seed_from_u64(42));
//! let xt = Array::linspace(0., 3., 10).insert_axis(Axis(1));
//! let yt = xt.mapv(f64::sin);
//! let dataset = Dataset::new(xt, yt);
//! let params = fit_least_squares(&mlp, &init, &dataset, AdamParams::new().epochs(100))
//!     .expect("training");
//!
//! let ggn = create_curvature_operator(&mlp, &params, &dataset, LossKind::SquaredError)
//!     .expect("curvature operator");
//! let posterior = create_posterior(
//!     PosteriorStrategy::LowRank,
//!     &ggn,
//!     &mlp.param_layout(),
//!     PosteriorParams::new().maxiter(20),
//! )
//! .expect("posterior");
//! let prior = PriorArguments::isotropic(1.);
//! let kernel = set_posterior_gp_kernel(&mlp, &params, &posterior, &prior, true, OutputLayout::Full)
//!     .expect("kernel");
//!
//! let xs = Array::linspace(0., 5., 6).insert_axis(Axis(1));
//! let var = kernel.predict_var(&xs).expect("variances");
//! assert!(var.iter().all(|v| *v >= 0.));
//! ```
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod curvature;
mod errors;
mod kernel;
pub mod lanczos;
pub mod models;
pub mod operators;
pub mod param_tree;
mod parameters;
mod posterior;
mod pushforward;
pub mod training;
mod utils;

pub use curvature::*;
pub use errors::*;
pub use kernel::*;
pub use models::{DifferentiableModel, Mlp};
pub use operators::{DenseOperator, FnOperator, LinearOperator};
pub use param_tree::{ParamLayout, ParamNode, ParamTree};
pub use parameters::*;
pub use posterior::*;
pub use pushforward::*;
pub use training::{fit_least_squares, AdamParams};
