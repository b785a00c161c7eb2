//! Least-squares fitting of a [`DifferentiableModel`] with the Adam optimizer.
//!
//! Full-batch gradient descent on the mean squared error
//! `L(θ) = 1/N ∑_i ‖f(x_i, θ) - y_i‖²`, the gradient being accumulated
//! with vector-Jacobian products.
use crate::errors::{LaplaceError, Result};
use crate::models::DifferentiableModel;
use crate::param_tree::ParamTree;

use linfa::prelude::DatasetBase;
use linfa::{Float, ParamGuard};
use log::{debug, info};
use ndarray::{Array1, ArrayBase, Data, Ix2};
use rayon::prelude::*;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Validated Adam optimizer parameters
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct AdamValidParams<F: Float> {
    learning_rate: F,
    beta1: F,
    beta2: F,
    epsilon: F,
    epochs: usize,
    log_every: usize,
}

impl<F: Float> Default for AdamValidParams<F> {
    fn default() -> Self {
        AdamValidParams {
            learning_rate: F::cast(1e-3),
            beta1: F::cast(0.9),
            beta2: F::cast(0.999),
            epsilon: F::cast(1e-8),
            epochs: 1000,
            log_every: 500,
        }
    }
}

impl<F: Float> AdamValidParams<F> {
    /// Get the learning rate
    pub fn learning_rate(&self) -> F {
        self.learning_rate
    }

    /// Get first and second moments decay rates
    pub fn betas(&self) -> (F, F) {
        (self.beta1, self.beta2)
    }

    /// Get the number of epochs
    pub fn epochs(&self) -> usize {
        self.epochs
    }
}

/// Adam optimizer parameters
#[derive(Clone, Debug, Default)]
pub struct AdamParams<F: Float>(AdamValidParams<F>);

impl<F: Float> AdamParams<F> {
    /// Default parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the learning rate
    pub fn learning_rate(mut self, learning_rate: F) -> Self {
        self.0.learning_rate = learning_rate;
        self
    }

    /// Set the exponential decay rates of first and second moment estimates
    pub fn betas(mut self, beta1: F, beta2: F) -> Self {
        self.0.beta1 = beta1;
        self.0.beta2 = beta2;
        self
    }

    /// Set the number of full-batch epochs
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.0.epochs = epochs;
        self
    }

    /// Log the training loss every `log_every` epochs
    pub fn log_every(mut self, log_every: usize) -> Self {
        self.0.log_every = log_every;
        self
    }
}

impl<F: Float> ParamGuard for AdamParams<F> {
    type Checked = AdamValidParams<F>;
    type Error = LaplaceError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        let p = &self.0;
        if !p.learning_rate.is_finite() || p.learning_rate <= F::zero() {
            return Err(LaplaceError::InvalidValueError(format!(
                "`learning_rate` should be positive, got {}",
                p.learning_rate
            )));
        }
        for beta in [p.beta1, p.beta2] {
            if !(F::zero()..F::one()).contains(&beta) {
                return Err(LaplaceError::InvalidValueError(format!(
                    "Adam decay rates should be in [0, 1), got {beta}"
                )));
            }
        }
        if p.log_every == 0 {
            return Err(LaplaceError::InvalidValueError(
                "`log_every` cannot be 0".to_string(),
            ));
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Mean squared error over the batch and its gradient wrt flat parameters
pub fn mse_and_gradient<F, M, D>(
    model: &M,
    params: &ParamTree<F>,
    batch: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>>,
) -> Result<(F, Array1<F>)>
where
    F: Float,
    M: DifferentiableModel<F>,
    D: Data<Elem = F>,
{
    let x = batch.records().view();
    let y = batch.targets().view();
    if x.nrows() != y.nrows() || x.nrows() == 0 {
        return Err(LaplaceError::ShapeMismatch(format!(
            "batch should hold the same non zero number of inputs and targets, got {} and {}",
            x.nrows(),
            y.nrows()
        )));
    }
    let n = F::cast(x.nrows());
    let two = F::cast(2.);
    let size = params.size();
    let (loss, grad) = (0..x.nrows())
        .into_par_iter()
        .map(|i| -> Result<(F, Array1<F>)> {
            let xi = x.row(i);
            let residual = model.forward(params, &xi)? - y.row(i);
            let grad = model
                .vjp(params, &xi, &residual.mapv(|r| r * two / n).view())?
                .flatten();
            Ok((residual.dot(&residual) / n, grad))
        })
        .try_reduce(
            || (F::zero(), Array1::zeros(size)),
            |(l1, g1), (l2, g2)| Ok((l1 + l2, g1 + g2)),
        )?;
    Ok((loss, grad))
}

/// Fit `model` to the `batch` from initial parameters `init` by minimizing the
/// mean squared error with full-batch Adam. Returns the trained parameters.
pub fn fit_least_squares<F, M, D>(
    model: &M,
    init: &ParamTree<F>,
    batch: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix2>>,
    adam: AdamParams<F>,
) -> Result<ParamTree<F>>
where
    F: Float,
    M: DifferentiableModel<F>,
    D: Data<Elem = F>,
{
    let adam = adam.check()?;
    let layout = model.param_layout();
    layout.check(init)?;
    let now = Instant::now();

    let mut theta = init.flatten();
    let mut m = Array1::<F>::zeros(theta.len());
    let mut v = Array1::<F>::zeros(theta.len());
    let (beta1, beta2) = adam.betas();
    let mut params = init.clone();
    let mut loss = F::zero();
    for epoch in 1..=adam.epochs() {
        let (l, grad) = mse_and_gradient(model, &params, batch)?;
        loss = l;
        if epoch == 1 || epoch % adam.log_every == 0 {
            debug!("Adam epoch {epoch}: mse = {loss}");
        }
        m = m * beta1 + &grad * (F::one() - beta1);
        v = v * beta2 + grad.mapv(|g| g * g) * (F::one() - beta2);
        let m_corr = F::one() - beta1.powi(epoch as i32);
        let v_corr = F::one() - beta2.powi(epoch as i32);
        ndarray::Zip::from(&mut theta)
            .and(&m)
            .and(&v)
            .for_each(|t, &mi, &vi| {
                *t -= adam.learning_rate * (mi / m_corr) / ((vi / v_corr).sqrt() + adam.epsilon);
            });
        params = layout.unflatten(&theta)?;
    }
    if !loss.is_finite() {
        return Err(LaplaceError::NonFiniteResult(format!(
            "training diverged, last mse = {loss}"
        )));
    }
    info!(
        "Model trained with {} Adam epochs in {:?} (mse = {})",
        adam.epochs(),
        now.elapsed(),
        loss
    );
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Mlp;
    use linfa::Dataset;
    use ndarray::{Array, Axis};
    use ndarray_rand::rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    #[test]
    fn test_fit_least_squares_decreases_loss() {
        let mlp = Mlp::new(&[1, 10, 1]).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let init = mlp.init_params(&mut rng);
        let x = Array::linspace(-2., 2., 15).insert_axis(Axis(1));
        let y = x.mapv(|v: f64| v * v - 1.);
        let ds = Dataset::new(x, y);

        let (initial, _) = mse_and_gradient(&mlp, &init, &ds).unwrap();
        let params = fit_least_squares(
            &mlp,
            &init,
            &ds,
            AdamParams::new().learning_rate(1e-2).epochs(1500),
        )
        .unwrap();
        let (trained, _) = mse_and_gradient(&mlp, &params, &ds).unwrap();
        assert!(trained < 0.2 * initial, "{trained} vs {initial}");
        assert_eq!(params.layout(), mlp.param_layout());
    }

    #[test]
    fn test_gradient_direction() {
        let mlp = Mlp::new(&[2, 4, 1]).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(3);
        let params = mlp.init_params(&mut rng);
        let ds = Dataset::new(
            ndarray::array![[0., 1.], [1., 0.], [0.5, 0.5]],
            ndarray::array![[1.], [-1.], [0.]],
        );
        let (loss, grad) = mse_and_gradient(&mlp, &params, &ds).unwrap();
        let step = params.add_flat(&grad.mapv(|g| -1e-4 * g)).unwrap();
        let (next, _) = mse_and_gradient(&mlp, &step, &ds).unwrap();
        assert!(next < loss);
    }

    #[test]
    fn test_invalid_adam_params() {
        assert!(AdamParams::<f64>::new().learning_rate(0.).check().is_err());
        assert!(AdamParams::<f64>::new().betas(0.9, 1.).check().is_err());
        assert!(AdamParams::<f64>::new().log_every(0).check().is_err());
    }
}
