//! Laplace posterior covariance over weights.
//!
//! The posterior covariance is `Σ = (H + T)^{-1}` where `H` is the curvature
//! (GGN) operator and `T` the diagonal prior precision. Three strategies are
//! available, see [`PosteriorStrategy`]. [`create_posterior`] performs the work
//! which does not depend on the prior (materialized curvature, curvature diagonal
//! or leading eigenpairs) once, then [`Posterior::covariance`] builds the
//! covariance operator for a given prior precision.
use crate::errors::{LaplaceError, Result};
use crate::lanczos::{lanczos, EigenPairs};
use crate::operators::LinearOperator;
use crate::param_tree::ParamLayout;
use crate::parameters::{PosteriorParams, PosteriorValidParams};
use crate::utils::{check_finite, symmetrize};

use linfa::{Float, ParamGuard};
use linfa_linalg::{cholesky::*, triangular::*};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use ndarray_stats::QuantileExt;
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Posterior covariance approximation strategies
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum PosteriorStrategy {
    /// Exact inverse of the materialized regularized curvature.
    /// Memory is `O(P²)` and time `O(P³)`.
    Full,
    /// Woodbury form built on the leading eigenpairs of the curvature computed
    /// with Lanczos. Requires an isotropic prior precision.
    LowRank,
    /// Inverse of the curvature diagonal plus the prior precision
    Diagonal,
}

impl fmt::Display for PosteriorStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PosteriorStrategy::Full => "full",
            PosteriorStrategy::LowRank => "low_rank",
            PosteriorStrategy::Diagonal => "diagonal",
        };
        write!(f, "{s}")
    }
}

impl TryFrom<&str> for PosteriorStrategy {
    type Error = LaplaceError;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "full" => Ok(PosteriorStrategy::Full),
            "low_rank" | "lowrank" => Ok(PosteriorStrategy::LowRank),
            "diagonal" => Ok(PosteriorStrategy::Diagonal),
            other => Err(LaplaceError::InvalidValueError(format!(
                "unknown posterior strategy `{other}`, should be one of 'full', 'low_rank', 'diagonal'"
            ))),
        }
    }
}

/// Prior precision `τ` of the isotropic Gaussian prior over weights
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum PriorPrecision<F: Float> {
    /// Same precision for every parameter
    Isotropic(F),
    /// One precision per top-level layer given as `(layer name, τ)`
    PerLayer(Vec<(String, F)>),
}

/// Arguments of the prior, consumed when building the posterior covariance
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct PriorArguments<F: Float> {
    /// Prior precision
    pub prior_prec: PriorPrecision<F>,
}

impl<F: Float> PriorArguments<F> {
    /// Isotropic prior with precision `prior_prec`
    pub fn isotropic(prior_prec: F) -> Self {
        PriorArguments {
            prior_prec: PriorPrecision::Isotropic(prior_prec),
        }
    }

    /// Per layer prior precisions
    pub fn per_layer(prior_precs: &[(&str, F)]) -> Self {
        PriorArguments {
            prior_prec: PriorPrecision::PerLayer(
                prior_precs
                    .iter()
                    .map(|(name, tau)| (name.to_string(), *tau))
                    .collect(),
            ),
        }
    }

    fn check_value(tau: F) -> Result<()> {
        if !tau.is_finite() || tau <= F::zero() {
            return Err(LaplaceError::InvalidValueError(format!(
                "prior precision should be positive, got {tau}"
            )));
        }
        Ok(())
    }

    /// Common precision when the prior is isotropic
    pub fn isotropic_precision(&self) -> Result<Option<F>> {
        match &self.prior_prec {
            PriorPrecision::Isotropic(tau) => {
                Self::check_value(*tau)?;
                Ok(Some(*tau))
            }
            PriorPrecision::PerLayer(precs) => {
                for (_, tau) in precs.iter() {
                    Self::check_value(*tau)?;
                }
                match precs.first() {
                    Some((_, tau0)) if precs.iter().all(|(_, tau)| tau == tau0) => Ok(Some(*tau0)),
                    _ => Ok(None),
                }
            }
        }
    }

    /// Expand the prior precision into a per-parameter diagonal following `layout`.
    ///
    /// Every top-level layer of the layout must be given exactly one precision.
    pub fn to_diagonal(&self, layout: &ParamLayout) -> Result<Array1<F>> {
        match &self.prior_prec {
            PriorPrecision::Isotropic(tau) => {
                Self::check_value(*tau)?;
                Ok(Array1::from_elem(layout.size(), *tau))
            }
            PriorPrecision::PerLayer(precs) => {
                let layers = layout.layers();
                for (name, tau) in precs.iter() {
                    Self::check_value(*tau)?;
                    if !layers.contains(&name.as_str()) {
                        return Err(LaplaceError::LayoutMismatch(format!(
                            "prior precision given for unknown layer `{name}`, layers are {layers:?}"
                        )));
                    }
                }
                let mut diag = Array1::zeros(layout.size());
                for layer in layers {
                    let tau = precs
                        .iter()
                        .find(|(name, _)| name == layer)
                        .map(|(_, tau)| *tau)
                        .ok_or_else(|| {
                            LaplaceError::LayoutMismatch(format!(
                                "no prior precision given for layer `{layer}`"
                            ))
                        })?;
                    if let Some(range) = layout.layer_range(layer) {
                        diag.slice_mut(ndarray::s![range]).fill(tau);
                    }
                }
                Ok(diag)
            }
        }
    }
}

/// Prior independent state computed once by [`create_posterior`]
#[derive(Clone, Debug)]
enum PosteriorState<F: Float> {
    Full { curvature: Array2<F> },
    LowRank { eigen: EigenPairs<F> },
    Diagonal { curvature_diag: Array1<F> },
}

/// Laplace posterior ready to produce covariance operators for any prior precision
#[derive(Clone, Debug)]
pub struct Posterior<F: Float> {
    strategy: PosteriorStrategy,
    layout: ParamLayout,
    state: PosteriorState<F>,
    params: PosteriorValidParams<F>,
}

impl<F: Float> Posterior<F> {
    /// Posterior strategy
    pub fn strategy(&self) -> PosteriorStrategy {
        self.strategy
    }

    /// Layout of the weights
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Options used to build the posterior
    pub fn options(&self) -> &PosteriorValidParams<F> {
        &self.params
    }

    /// Leading curvature eigenpairs for the low rank strategy
    pub fn eigenpairs(&self) -> Option<&EigenPairs<F>> {
        match &self.state {
            PosteriorState::LowRank { eigen } => Some(eigen),
            _ => None,
        }
    }

    /// Build the posterior covariance operator for the given prior arguments.
    ///
    /// Fails with [`LaplaceError::NonFiniteResult`] when the regularized curvature
    /// cannot be inverted, with [`LaplaceError::InvalidValueError`] for invalid
    /// precisions or a non isotropic prior with the low rank strategy and with
    /// [`LaplaceError::LayoutMismatch`] when per-layer precisions do not match the layout.
    pub fn covariance(&self, prior: &PriorArguments<F>) -> Result<CovarianceOperator<F>> {
        let now = Instant::now();
        let cov = match &self.state {
            PosteriorState::Full { curvature } => {
                let t = prior.to_diagonal(&self.layout)?;
                full_covariance(curvature, &t)?
            }
            PosteriorState::LowRank { eigen } => {
                let tau = prior.isotropic_precision()?.ok_or_else(|| {
                    LaplaceError::InvalidValueError(
                        "low rank posterior requires an isotropic prior precision".to_string(),
                    )
                })?;
                let d = eigen.values.mapv(|l| l / (tau * (l + tau)));
                let g = eigen.values.mapv(|l| F::one() - (tau / (l + tau)).sqrt());
                CovarianceOperator::LowRank {
                    prior_var: F::one() / tau,
                    u: eigen.vectors.to_owned(),
                    d,
                    g,
                }
            }
            PosteriorState::Diagonal { curvature_diag } => {
                let t = prior.to_diagonal(&self.layout)?;
                let precision = curvature_diag + &t;
                if precision.iter().any(|p| !p.is_finite() || *p <= F::zero()) {
                    return Err(LaplaceError::NonFiniteResult(
                        "diagonal posterior precision should be positive and finite".to_string(),
                    ));
                }
                CovarianceOperator::Diagonal {
                    var: precision.mapv(|p| F::one() / p),
                }
            }
        };
        debug!(
            "{} posterior covariance built in {:?}",
            self.strategy,
            now.elapsed()
        );
        Ok(cov)
    }
}

fn full_covariance<F: Float>(
    curvature: &Array2<F>,
    prior_diag: &Array1<F>,
) -> Result<CovarianceOperator<F>> {
    let mut precision = curvature.to_owned();
    precision.diag_mut().zip_mut_with(prior_diag, |h, &t| *h += t);
    let chol = precision.cholesky().map_err(|e| {
        LaplaceError::NonFiniteResult(format!("regularized curvature factorization failed: {e}"))
    })?;
    check_finite(&chol, "Cholesky factor of the regularized curvature")?;

    let diag = chol.diag();
    let undefined = |_| {
        LaplaceError::NonFiniteResult("Cholesky factor diagonal cannot be ordered".to_string())
    };
    let dmin = *diag.min().map_err(undefined)?;
    let dmax = *diag.max().map_err(undefined)?;
    if dmin <= F::zero() {
        return Err(LaplaceError::NonFiniteResult(
            "regularized curvature is not positive definite".to_string(),
        ));
    }
    let cond = (dmax / dmin) * (dmax / dmin);
    if cond > F::one() / F::epsilon() {
        return Err(LaplaceError::NonFiniteResult(format!(
            "regularized curvature is ill-conditioned (condition estimate {cond:e})"
        )));
    } else if cond > F::one() / F::epsilon().sqrt() {
        warn!("Regularized curvature condition estimate is high: {cond:e}");
    }

    let chol_inv = chol.solve_triangular(&Array2::eye(chol.nrows()), UPLO::Lower)?;
    let mut sigma = chol_inv.t().dot(&chol_inv);
    symmetrize(&mut sigma);
    check_finite(&sigma, "full posterior covariance")?;
    Ok(CovarianceOperator::Full { sigma, chol_inv })
}

/// Build the Laplace posterior of the curvature `operator` acting on weights with the given `layout`.
///
/// The returned [`Posterior`] is the curried form of the posterior covariance:
/// call [`Posterior::covariance`] with prior arguments to get the covariance operator.
pub fn create_posterior<F, O>(
    strategy: PosteriorStrategy,
    operator: &O,
    layout: &ParamLayout,
    options: PosteriorParams<F>,
) -> Result<Posterior<F>>
where
    F: Float,
    O: LinearOperator<F>,
{
    let params = options.check()?;
    if operator.dim() != layout.size() {
        return Err(LaplaceError::LayoutMismatch(format!(
            "curvature operator acts on vectors of size {} while layout holds {} parameters",
            operator.dim(),
            layout.size()
        )));
    }
    let now = Instant::now();
    let parallel = params.mv_jittable();
    let state = match strategy {
        PosteriorStrategy::Full => {
            let mut curvature = operator.to_dense(parallel)?;
            symmetrize(&mut curvature);
            check_finite(&curvature, "materialized curvature")?;
            PosteriorState::Full { curvature }
        }
        PosteriorStrategy::LowRank => {
            let mut rng = Xoshiro256Plus::seed_from_u64(params.seed());
            let mut eigen = lanczos(operator, params.maxiter(), params.tol(), &mut rng, parallel)?;
            if let Some(rank) = params.rank() {
                eigen = eigen.truncate(rank);
            }
            let requested = params.rank().unwrap_or(params.maxiter()).min(layout.size());
            if eigen.rank() < requested {
                debug!(
                    "Low rank posterior keeps {} eigenpairs out of {} requested",
                    eigen.rank(),
                    requested
                );
            }
            PosteriorState::LowRank { eigen }
        }
        PosteriorStrategy::Diagonal => {
            let curvature_diag = operator.diagonal(parallel)?;
            check_finite(&curvature_diag, "curvature diagonal")?;
            PosteriorState::Diagonal { curvature_diag }
        }
    };
    info!(
        "{} posterior over {} parameters created in {:?}",
        strategy,
        layout.size(),
        now.elapsed()
    );
    Ok(Posterior {
        strategy,
        layout: layout.clone(),
        state,
        params,
    })
}

/// Posterior covariance operator over flat weights
#[derive(Clone, Debug)]
pub enum CovarianceOperator<F: Float> {
    /// Dense covariance with the inverse of the Cholesky factor `L` of `H + T`
    Full {
        /// Covariance `Σ = L^{-T} L^{-1}` (P, P)
        sigma: Array2<F>,
        /// `L^{-1}` (P, P)
        chol_inv: Array2<F>,
    },
    /// `Σ v = τ^{-1} v - U diag(d) Uᵀ v`
    LowRank {
        /// Prior variance `1/τ`
        prior_var: F,
        /// Orthonormal eigenvectors of the curvature (P, k)
        u: Array2<F>,
        /// `λ_j / (τ (λ_j + τ))` (k,)
        d: Array1<F>,
        /// `1 - sqrt(τ / (λ_j + τ))` used by the square root (k,)
        g: Array1<F>,
    },
    /// `Σ = diag(var)`
    Diagonal {
        /// Posterior variances (P,)
        var: Array1<F>,
    },
}

impl<F: Float> LinearOperator<F> for CovarianceOperator<F> {
    fn dim(&self) -> usize {
        match self {
            CovarianceOperator::Full { sigma, .. } => sigma.nrows(),
            CovarianceOperator::LowRank { u, .. } => u.nrows(),
            CovarianceOperator::Diagonal { var } => var.len(),
        }
    }

    fn apply(&self, v: &ArrayView1<F>) -> Result<Array1<F>> {
        self.check_size(v)?;
        let res = match self {
            CovarianceOperator::Full { sigma, .. } => sigma.dot(v),
            CovarianceOperator::LowRank { prior_var, u, d, .. } => {
                let coeffs = u.t().dot(v) * d;
                v.mapv(|e| e * *prior_var) - u.dot(&coeffs)
            }
            CovarianceOperator::Diagonal { var } => v * var,
        };
        Ok(res)
    }
}

impl<F: Float> CovarianceOperator<F> {
    fn check_size(&self, v: &ArrayView1<F>) -> Result<()> {
        if v.len() != self.dim() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "covariance over {} weights cannot be applied to a vector of size {}",
                self.dim(),
                v.len()
            )));
        }
        Ok(())
    }

    /// Apply a square root factor `S` of the covariance (`S Sᵀ = Σ`) to `z`.
    ///
    /// `S` is `L^{-T}` for the full covariance and the symmetric square root otherwise.
    pub fn apply_sqrt(&self, z: &ArrayView1<F>) -> Result<Array1<F>> {
        self.check_size(z)?;
        let res = match self {
            CovarianceOperator::Full { chol_inv, .. } => chol_inv.t().dot(z),
            CovarianceOperator::LowRank { prior_var, u, g, .. } => {
                let coeffs = u.t().dot(z) * g;
                (z - &u.dot(&coeffs)).mapv(|e| e * prior_var.sqrt())
            }
            CovarianceOperator::Diagonal { var } => z * &var.mapv(|v| v.sqrt()),
        };
        Ok(res)
    }

    /// Marginal variances of the weights, i.e. the diagonal of `Σ`
    pub fn weight_variances(&self) -> Array1<F> {
        match self {
            CovarianceOperator::Full { sigma, .. } => sigma.diag().to_owned(),
            CovarianceOperator::LowRank { prior_var, u, d, .. } => {
                let correction = (u * u * &d.view().insert_axis(Axis(0))).sum_axis(Axis(1));
                correction.mapv(|c| *prior_var - c)
            }
            CovarianceOperator::Diagonal { var } => var.to_owned(),
        }
    }

    /// Draw `n` weight perturbations `δ ~ N(0, Σ)` returned as a (n, P) matrix
    pub fn sample_weights<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Array2<F>> {
        let z = Array2::<f64>::random_using((n, self.dim()), StandardNormal, rng).mapv(F::cast);
        let mut samples = Array2::zeros((n, self.dim()));
        for (mut row, zi) in samples.rows_mut().into_iter().zip(z.rows()) {
            row.assign(&self.apply_sqrt(&zi)?);
        }
        Ok(samples)
    }
}
