//! Generalized Gauss-Newton (GGN) curvature operator.
//!
//! Given a model `f(x, θ)`, trained parameters `θ` and a batch `(X, Y)`, the GGN
//! approximation of the loss Hessian reads:
//!
//! `H = c ∑_i J_iᵀ Λ_i J_i`
//!
//! where:
//! * `J_i` is the Jacobian of the model output at `x_i` wrt the flat parameters,
//! * `Λ_i` is the Hessian of the loss wrt the model output (positive semi-definite
//!   for the supported losses, hence `H` is PSD),
//! * `c` is `1` or `1/N` depending on the batch [`Reduction`], times a user factor.
//!
//! `H` is never formed: `Hv` is computed per sample as a Jacobian-vector product
//! followed by a vector-Jacobian product.
use crate::errors::{LaplaceError, Result};
use crate::models::DifferentiableModel;
use crate::operators::LinearOperator;
use crate::param_tree::{ParamLayout, ParamTree};
use crate::parameters::{GgnParams, GgnValidParams};

use linfa::prelude::{DatasetBase, Fit, Float};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix2};

use log::debug;
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Supported loss functions (regression family)
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum LossKind {
    /// `∑_k (f_k(x) - y_k)^2`, output Hessian `2 I`
    SquaredError,
    /// Gaussian negative log-likelihood with fixed noise variance, output Hessian `I / noise_var`
    GaussianNll {
        /// Observation noise variance
        noise_var: f64,
    },
}

impl LossKind {
    /// Scalar `s` such that the per-sample output Hessian is `Λ_i = s I`
    pub fn output_hessian_scale<F: Float>(&self) -> F {
        match self {
            LossKind::SquaredError => F::cast(2.),
            LossKind::GaussianNll { noise_var } => F::cast(1. / noise_var),
        }
    }

    pub(crate) fn check(&self) -> Result<()> {
        if let LossKind::GaussianNll { noise_var } = self {
            if !noise_var.is_finite() || *noise_var <= 0. {
                return Err(LaplaceError::InvalidValueError(format!(
                    "Gaussian noise variance should be positive, got {noise_var}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LossKind::SquaredError => write!(f, "mse"),
            LossKind::GaussianNll { noise_var } => write!(f, "gaussian_nll(noise_var={noise_var})"),
        }
    }
}

impl FromStr for LossKind {
    type Err = LaplaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mse" | "squared_error" => Ok(LossKind::SquaredError),
            "gaussian_nll" => Ok(LossKind::GaussianNll { noise_var: 1. }),
            other => Err(LaplaceError::UnsupportedLoss(format!(
                "`{other}`, should be one of 'mse', 'squared_error', 'gaussian_nll'"
            ))),
        }
    }
}

impl TryFrom<&str> for LossKind {
    type Error = LaplaceError;

    fn try_from(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl TryFrom<String> for LossKind {
    type Error = LaplaceError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// How per-sample curvature contributions are aggregated over the batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Reduction {
    /// Sum over samples
    #[default]
    Sum,
    /// Average over samples
    Mean,
}

/// GGN matrix-vector product operator `v ↦ Hv` over flat parameter vectors
pub struct GgnOperator<'a, F: Float, M: DifferentiableModel<F>> {
    model: &'a M,
    params: ParamTree<F>,
    layout: ParamLayout,
    inputs: Array2<F>,
    loss: LossKind,
    scale: F,
}

impl<'a, F: Float, M: DifferentiableModel<F>> GgnOperator<'a, F, M> {
    /// GGN parameters constructor
    pub fn params(model: &'a M, params: ParamTree<F>, loss: LossKind) -> GgnParams<'a, F, M> {
        GgnParams::new(model, params, loss)
    }

    /// Parameters at which the curvature is computed
    pub fn linearization_point(&self) -> &ParamTree<F> {
        &self.params
    }

    /// Layout of the flat vectors the operator acts on
    pub fn layout(&self) -> &ParamLayout {
        &self.layout
    }

    /// Loss whose curvature is approximated
    pub fn loss(&self) -> LossKind {
        self.loss
    }

    /// Number of samples of the batch
    pub fn n_samples(&self) -> usize {
        self.inputs.nrows()
    }
}

impl<F: Float, M: DifferentiableModel<F>> LinearOperator<F> for GgnOperator<'_, F, M> {
    fn dim(&self) -> usize {
        self.layout.size()
    }

    fn apply(&self, v: &ArrayView1<F>) -> Result<Array1<F>> {
        let tangent = self.layout.unflatten(v)?;
        let p = self.dim();
        (0..self.inputs.nrows())
            .into_par_iter()
            .map(|i| -> Result<Array1<F>> {
                let x = self.inputs.row(i);
                let (_, jv) = self.model.jvp(&self.params, &x, &tangent)?;
                let lambda_jv = jv.mapv(|e| e * self.scale);
                Ok(self
                    .model
                    .vjp(&self.params, &x, &lambda_jv.view())?
                    .flatten())
            })
            .try_reduce(|| Array1::zeros(p), |acc, g| Ok(acc + g))
    }
}

impl<'a, F, M, D> Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>, LaplaceError>
    for GgnValidParams<'a, F, M>
where
    F: Float,
    M: DifferentiableModel<F>,
    D: Data<Elem = F>,
{
    type Object = GgnOperator<'a, F, M>;

    /// Check the batch against the model and build the GGN operator
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>>,
    ) -> Result<Self::Object> {
        let now = Instant::now();
        let x = dataset.records();
        let y = dataset.targets();
        let model = self.model();

        if x.nrows() != y.nrows() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "batch inputs have {} samples while targets have {}",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.nrows() == 0 {
            return Err(LaplaceError::ShapeMismatch("empty batch".to_string()));
        }
        if x.ncols() != model.input_dim() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "batch inputs have {} features, model expects {}",
                x.ncols(),
                model.input_dim()
            )));
        }
        if y.ncols() != model.output_dim() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "batch targets have {} components, model outputs {}",
                y.ncols(),
                model.output_dim()
            )));
        }
        let layout = model.param_layout();
        layout.check(self.linearization_point())?;
        self.loss().check()?;

        let reduction = match self.reduction() {
            Reduction::Sum => F::one(),
            Reduction::Mean => F::one() / F::cast(x.nrows()),
        };
        let scale = self.loss().output_hessian_scale::<F>() * reduction * self.factor();

        debug!(
            "GGN operator built for {} samples, {} parameters, loss={} in {:?}",
            x.nrows(),
            layout.size(),
            self.loss(),
            now.elapsed()
        );
        Ok(GgnOperator {
            model,
            params: self.linearization_point().clone(),
            layout,
            inputs: x.to_owned(),
            loss: self.loss(),
            scale,
        })
    }
}

/// Build the GGN curvature operator of `loss_kind` for `model` at `params` over the given `batch`.
///
/// Fails with [`LaplaceError::ShapeMismatch`] when the batch is inconsistent with itself
/// or with the model, and with [`LaplaceError::LayoutMismatch`] when `params` does not have
/// the layout expected by the model.
pub fn create_curvature_operator<'a, F, M, D>(
    model: &'a M,
    params: &ParamTree<F>,
    batch: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>>,
    loss_kind: LossKind,
) -> Result<GgnOperator<'a, F, M>>
where
    F: Float,
    M: DifferentiableModel<F>,
    D: Data<Elem = F>,
{
    GgnParams::new(model, params.clone(), loss_kind).fit(batch)
}
