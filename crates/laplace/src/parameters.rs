use crate::curvature::{LossKind, Reduction};
use crate::errors::{LaplaceError, Result};
use crate::models::DifferentiableModel;
use crate::param_tree::ParamTree;
use linfa::{Float, ParamGuard};

#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default max number of Lanczos iterations of the low rank posterior
pub const LANCZOS_DEFAULT_MAXITER: usize = 20;
/// Default tolerance on Ritz values error bounds relative to each Ritz value
pub const LANCZOS_DEFAULT_TOL: f64 = 1e-2;
/// Default seed of random number generators
pub const DEFAULT_SEED: u64 = 42;
/// Default number of weight samples drawn by pushforward predictives
pub const PUSHFORWARD_DEFAULT_N_SAMPLES: usize = 100;

/// Validated parameters of the GGN curvature operator
pub struct GgnValidParams<'a, F: Float, M: DifferentiableModel<F>> {
    /// Differentiable model
    pub(crate) model: &'a M,
    /// Trained parameters, curvature linearization point
    pub(crate) params: ParamTree<F>,
    /// Loss function
    pub(crate) loss: LossKind,
    /// Reduction over the batch
    pub(crate) reduction: Reduction,
    /// Extra scaling factor of the curvature
    pub(crate) factor: F,
}

impl<F: Float, M: DifferentiableModel<F>> Clone for GgnValidParams<'_, F, M> {
    fn clone(&self) -> Self {
        GgnValidParams {
            model: self.model,
            params: self.params.clone(),
            loss: self.loss,
            reduction: self.reduction,
            factor: self.factor,
        }
    }
}

impl<'a, F: Float, M: DifferentiableModel<F>> GgnValidParams<'a, F, M> {
    /// Get the model
    pub fn model(&self) -> &'a M {
        self.model
    }

    /// Get the parameters the curvature is computed at
    pub fn linearization_point(&self) -> &ParamTree<F> {
        &self.params
    }

    /// Get the loss
    pub fn loss(&self) -> LossKind {
        self.loss
    }

    /// Get the batch reduction
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Get the curvature scaling factor
    pub fn factor(&self) -> F {
        self.factor
    }
}

/// The set of parameters that can be specified to build a
/// [GGN curvature operator](crate::GgnOperator).
pub struct GgnParams<'a, F: Float, M: DifferentiableModel<F>>(GgnValidParams<'a, F, M>);

impl<'a, F: Float, M: DifferentiableModel<F>> GgnParams<'a, F, M> {
    /// A constructor given the model, its trained parameters and the loss
    pub fn new(model: &'a M, params: ParamTree<F>, loss: LossKind) -> Self {
        Self(GgnValidParams {
            model,
            params,
            loss,
            reduction: Reduction::default(),
            factor: F::one(),
        })
    }

    /// Set the reduction of per-sample curvatures over the batch
    pub fn reduction(mut self, reduction: Reduction) -> Self {
        self.0.reduction = reduction;
        self
    }

    /// Set the curvature scaling factor (e.g. a dataset size when the batch is a minibatch)
    pub fn factor(mut self, factor: F) -> Self {
        self.0.factor = factor;
        self
    }
}

impl<'a, F: Float, M: DifferentiableModel<F>> ParamGuard for GgnParams<'a, F, M> {
    type Checked = GgnValidParams<'a, F, M>;
    type Error = LaplaceError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if !self.0.factor.is_finite() || self.0.factor <= F::zero() {
            return Err(LaplaceError::InvalidValueError(format!(
                "`factor` should be positive, got {}",
                self.0.factor
            )));
        }
        self.0.loss.check()?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Validated options of the posterior constructor
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct PosteriorValidParams<F: Float> {
    /// Max number of Lanczos iterations (low rank)
    pub(crate) maxiter: usize,
    /// Optional cap on the number of retained eigenpairs (low rank)
    pub(crate) rank: Option<usize>,
    /// Relative tolerance on Ritz values error bounds (low rank)
    pub(crate) tol: F,
    /// Whether the curvature operator may be called concurrently
    pub(crate) mv_jittable: bool,
    /// Seed of the Lanczos start vector
    pub(crate) seed: u64,
}

impl<F: Float> Default for PosteriorValidParams<F> {
    fn default() -> PosteriorValidParams<F> {
        PosteriorValidParams {
            maxiter: LANCZOS_DEFAULT_MAXITER,
            rank: None,
            tol: F::cast(LANCZOS_DEFAULT_TOL),
            mv_jittable: false,
            seed: DEFAULT_SEED,
        }
    }
}

impl<F: Float> PosteriorValidParams<F> {
    /// Get max number of Lanczos iterations
    pub fn maxiter(&self) -> usize {
        self.maxiter
    }

    /// Get the cap on the number of eigenpairs if any
    pub fn rank(&self) -> Option<usize> {
        self.rank
    }

    /// Get Ritz value tolerance
    pub fn tol(&self) -> F {
        self.tol
    }

    /// Whether operator products run concurrently
    pub fn mv_jittable(&self) -> bool {
        self.mv_jittable
    }

    /// Get the random seed
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[derive(Clone, Debug, Default)]
/// The set of options that can be specified for the
/// [posterior constructor](crate::create_posterior).
pub struct PosteriorParams<F: Float>(PosteriorValidParams<F>);

impl<F: Float> PosteriorParams<F> {
    /// A constructor with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the max number of Lanczos iterations, hence the max rank of the low rank posterior
    pub fn maxiter(mut self, maxiter: usize) -> Self {
        self.0.maxiter = maxiter;
        self
    }

    /// Keep at most `rank` eigenpairs
    pub fn rank(mut self, rank: Option<usize>) -> Self {
        self.0.rank = rank;
        self
    }

    /// Set the tolerance on Ritz values error bounds, relative to each Ritz value
    pub fn tol(mut self, tol: F) -> Self {
        self.0.tol = tol;
        self
    }

    /// Declare the curvature operator safe to call concurrently.
    ///
    /// Operator products are then dispatched over the rayon thread pool.
    pub fn mv_jittable(mut self, mv_jittable: bool) -> Self {
        self.0.mv_jittable = mv_jittable;
        self
    }

    /// Set the seed of the Lanczos start vector
    pub fn seed(mut self, seed: u64) -> Self {
        self.0.seed = seed;
        self
    }
}

impl<F: Float> From<PosteriorValidParams<F>> for PosteriorParams<F> {
    fn from(valid: PosteriorValidParams<F>) -> Self {
        PosteriorParams(valid)
    }
}

impl<F: Float> ParamGuard for PosteriorParams<F> {
    type Checked = PosteriorValidParams<F>;
    type Error = LaplaceError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if self.0.maxiter == 0 {
            return Err(LaplaceError::InvalidValueError(
                "`maxiter` should be strictly positive".to_string(),
            ));
        }
        if self.0.rank == Some(0) {
            return Err(LaplaceError::InvalidValueError(
                "`rank` cannot be 0".to_string(),
            ));
        }
        if !self.0.tol.is_finite() || self.0.tol <= F::zero() {
            return Err(LaplaceError::InvalidValueError(format!(
                "`tol` should be positive, got {}",
                self.0.tol
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Validated parameters of pushforward predictives
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct PushforwardValidParams {
    /// Number of weight samples
    pub(crate) n_samples: usize,
    /// Seed of the weight sampler
    pub(crate) seed: u64,
}

impl Default for PushforwardValidParams {
    fn default() -> Self {
        PushforwardValidParams {
            n_samples: PUSHFORWARD_DEFAULT_N_SAMPLES,
            seed: DEFAULT_SEED,
        }
    }
}

impl PushforwardValidParams {
    /// Get the number of weight samples
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Get the random seed
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[derive(Clone, Debug, Default)]
/// The set of parameters of [linearized](crate::set_lin_pushforward) and
/// [Monte-Carlo](crate::set_mc_pushforward) pushforwards.
pub struct PushforwardParams(PushforwardValidParams);

impl PushforwardParams {
    /// A constructor with default parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of weight samples
    pub fn n_samples(mut self, n_samples: usize) -> Self {
        self.0.n_samples = n_samples;
        self
    }

    /// Set the seed of the weight sampler
    pub fn seed(mut self, seed: u64) -> Self {
        self.0.seed = seed;
        self
    }
}

impl ParamGuard for PushforwardParams {
    type Checked = PushforwardValidParams;
    type Error = LaplaceError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        if self.0.n_samples < 2 {
            return Err(LaplaceError::InvalidValueError(format!(
                "`n_samples` should be at least 2 to estimate a spread, got {}",
                self.0.n_samples
            )));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
