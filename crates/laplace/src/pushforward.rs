//! Predictive distributions obtained by pushing weight samples forward.
//!
//! Weight perturbations `δ_s ~ N(0, Σ)` are drawn once, then for every input `x`:
//! * the linearized pushforward predicts `f(x; θ*) + J(x) δ_s`, its spread being
//!   also available in closed form from the kernel diagonal,
//! * the Monte-Carlo pushforward evaluates the network at `θ* + δ_s`.
use crate::errors::{LaplaceError, Result};
use crate::kernel::{set_posterior_gp_kernel, OutputLayout, PosteriorGpKernel};
use crate::models::DifferentiableModel;
use crate::param_tree::ParamTree;
use crate::parameters::PushforwardParams;
use crate::posterior::{Posterior, PriorArguments};

use linfa::{Float, ParamGuard};
use log::debug;
use ndarray::{s, Array1, Array2, Array3, ArrayBase, ArrayView1, Axis, Data, Ix2};
use ndarray_rand::rand::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::time::Instant;

/// Predictions at `n` points for `O` outputs
#[derive(Clone, Debug)]
pub struct PushforwardResults<F: Float> {
    /// Network prediction at the mean weights (n, O)
    pub pred: Array2<F>,
    /// Mean of the predictive samples (n, O)
    pub pred_mean: Array2<F>,
    /// Standard deviation of the predictive (n, O)
    pub pred_std: Array2<F>,
    /// Predictive samples (n_samples, n, O)
    pub samples: Array3<F>,
}

/// Per point results: prediction, sample mean, std and samples (n_samples, O)
type PointPrediction<F> = (Array1<F>, Array1<F>, Array1<F>, Array2<F>);

fn collect_results<F: Float>(
    points: Vec<PointPrediction<F>>,
    n_out: usize,
    n_samples: usize,
) -> PushforwardResults<F> {
    let n = points.len();
    let mut res = PushforwardResults {
        pred: Array2::zeros((n, n_out)),
        pred_mean: Array2::zeros((n, n_out)),
        pred_std: Array2::zeros((n, n_out)),
        samples: Array3::zeros((n_samples, n, n_out)),
    };
    for (i, (pred, mean, std, samples)) in points.into_iter().enumerate() {
        res.pred.row_mut(i).assign(&pred);
        res.pred_mean.row_mut(i).assign(&mean);
        res.pred_std.row_mut(i).assign(&std);
        res.samples.slice_mut(s![.., i, ..]).assign(&samples);
    }
    res
}

fn check_points<F: Float, M: DifferentiableModel<F>>(
    model: &M,
    xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<()> {
    if xs.ncols() != model.input_dim() {
        return Err(LaplaceError::ShapeMismatch(format!(
            "points should have {} components, got {}",
            model.input_dim(),
            xs.ncols()
        )));
    }
    Ok(())
}

fn sample_mean<F: Float>(samples: &Array2<F>) -> Result<Array1<F>> {
    samples
        .mean_axis(Axis(0))
        .ok_or_else(|| LaplaceError::InvalidValueError("no predictive sample".to_string()))
}

/// Linearized pushforward predictive `f(x; θ*) + J(x) δ`
pub struct LinearizedPushforward<'a, F: Float, M: DifferentiableModel<F>> {
    kernel: PosteriorGpKernel<'a, F, M>,
    weight_samples: Array2<F>,
}

impl<F: Float, M: DifferentiableModel<F>> LinearizedPushforward<'_, F, M> {
    /// Underlying pushforward kernel
    pub fn kernel(&self) -> &PosteriorGpKernel<'_, F, M> {
        &self.kernel
    }

    /// Weight perturbations (n_samples, P)
    pub fn weight_samples(&self) -> &Array2<F> {
        &self.weight_samples
    }

    fn predict_point(&self, x: &ArrayView1<F>) -> Result<PointPrediction<F>> {
        let model = self.kernel.model();
        let mean = self.kernel.mean();
        let layout = model.param_layout();
        let pred = model.forward(mean, x)?;
        let mut samples = Array2::zeros((self.weight_samples.nrows(), pred.len()));
        for (mut row, delta) in samples.rows_mut().into_iter().zip(self.weight_samples.rows()) {
            let (_, jv) = model.jvp(mean, x, &layout.unflatten(&delta)?)?;
            row.assign(&(&pred + &jv));
        }
        let std = self.kernel.variance(x)?.mapv(|v| v.sqrt());
        let pred_mean = sample_mean(&samples)?;
        Ok((pred, pred_mean, std, samples))
    }

    /// Predictive at `n` points given as a (n, input_dim) matrix
    pub fn predict(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<PushforwardResults<F>> {
        check_points(self.kernel.model(), xs)?;
        let xs = xs.view();
        let points = (0..xs.nrows())
            .into_par_iter()
            .map(|i| self.predict_point(&xs.row(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(collect_results(
            points,
            self.kernel.model().output_dim(),
            self.weight_samples.nrows(),
        ))
    }
}

/// Monte-Carlo pushforward predictive `f(x; θ* + δ)`
pub struct MonteCarloPushforward<'a, F: Float, M: DifferentiableModel<F>> {
    model: &'a M,
    mean: ParamTree<F>,
    sampled_params: Vec<ParamTree<F>>,
}

impl<F: Float, M: DifferentiableModel<F>> MonteCarloPushforward<'_, F, M> {
    /// Sampled network weights
    pub fn sampled_params(&self) -> &[ParamTree<F>] {
        &self.sampled_params
    }

    fn predict_point(&self, x: &ArrayView1<F>) -> Result<PointPrediction<F>> {
        let pred = self.model.forward(&self.mean, x)?;
        let mut samples = Array2::zeros((self.sampled_params.len(), pred.len()));
        for (mut row, params) in samples.rows_mut().into_iter().zip(self.sampled_params.iter()) {
            row.assign(&self.model.forward(params, x)?);
        }
        let pred_mean = sample_mean(&samples)?;
        let std = samples.std_axis(Axis(0), F::one());
        Ok((pred, pred_mean, std, samples))
    }

    /// Predictive at `n` points given as a (n, input_dim) matrix
    pub fn predict(
        &self,
        xs: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<PushforwardResults<F>> {
        check_points(self.model, xs)?;
        let xs = xs.view();
        let points = (0..xs.nrows())
            .into_par_iter()
            .map(|i| self.predict_point(&xs.row(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(collect_results(
            points,
            self.model.output_dim(),
            self.sampled_params.len(),
        ))
    }
}

fn draw_weight_samples<F: Float, M: DifferentiableModel<F>>(
    kernel: &PosteriorGpKernel<'_, F, M>,
    params: PushforwardParams,
) -> Result<Array2<F>> {
    let params = params.check()?;
    let mut rng = Xoshiro256Plus::seed_from_u64(params.seed());
    kernel
        .covariance_operator()
        .sample_weights(params.n_samples(), &mut rng)
}

/// Build the linearized pushforward predictive of the Laplace posterior
pub fn set_lin_pushforward<'a, F, M>(
    model: &'a M,
    mean: &ParamTree<F>,
    posterior: &Posterior<F>,
    prior: &PriorArguments<F>,
    params: PushforwardParams,
) -> Result<LinearizedPushforward<'a, F, M>>
where
    F: Float,
    M: DifferentiableModel<F>,
{
    let now = Instant::now();
    let kernel = set_posterior_gp_kernel(model, mean, posterior, prior, true, OutputLayout::Full)?;
    let weight_samples = draw_weight_samples(&kernel, params)?;
    debug!(
        "Linearized pushforward with {} weight samples set in {:?}",
        weight_samples.nrows(),
        now.elapsed()
    );
    Ok(LinearizedPushforward {
        kernel,
        weight_samples,
    })
}

/// Build the Monte-Carlo pushforward predictive of the Laplace posterior
pub fn set_mc_pushforward<'a, F, M>(
    model: &'a M,
    mean: &ParamTree<F>,
    posterior: &Posterior<F>,
    prior: &PriorArguments<F>,
    params: PushforwardParams,
) -> Result<MonteCarloPushforward<'a, F, M>>
where
    F: Float,
    M: DifferentiableModel<F>,
{
    let now = Instant::now();
    let kernel = set_posterior_gp_kernel(model, mean, posterior, prior, true, OutputLayout::Full)?;
    let weight_samples = draw_weight_samples(&kernel, params)?;
    let sampled_params = weight_samples
        .rows()
        .into_iter()
        .map(|delta| mean.add_flat(&delta))
        .collect::<Result<Vec<_>>>()?;
    debug!(
        "Monte-Carlo pushforward with {} weight samples set in {:?}",
        sampled_params.len(),
        now.elapsed()
    );
    Ok(MonteCarloPushforward {
        model,
        mean: mean.clone(),
        sampled_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curvature::{create_curvature_operator, LossKind};
    use crate::models::Mlp;
    use crate::parameters::PosteriorParams;
    use crate::posterior::{create_posterior, PosteriorStrategy};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use linfa::Dataset;
    use ndarray::{array, Array};

    fn setup(strategy: PosteriorStrategy) -> (Mlp<f64>, ParamTree<f64>, Posterior<f64>) {
        let mlp = Mlp::new(&[1, 8, 2]).unwrap();
        let params = mlp.init_params(&mut Xoshiro256Plus::seed_from_u64(42));
        let x = Array::linspace(-1., 1., 8).insert_axis(Axis(1));
        let y = ndarray::concatenate![Axis(1), x.mapv(f64::sin), x.mapv(f64::cos)];
        let ggn =
            create_curvature_operator(&mlp, &params, &Dataset::new(x, y), LossKind::SquaredError)
                .unwrap();
        let posterior = create_posterior(
            strategy,
            &ggn,
            &mlp.param_layout(),
            PosteriorParams::new().maxiter(30),
        )
        .unwrap();
        (mlp, params, posterior)
    }

    #[test]
    fn test_pushforward_shapes() {
        let xs = array![[-2.], [0.], [0.5], [3.]];
        for strategy in [
            PosteriorStrategy::Full,
            PosteriorStrategy::LowRank,
            PosteriorStrategy::Diagonal,
        ] {
            let (mlp, params, posterior) = setup(strategy);
            let prior = PriorArguments::isotropic(1.);
            let lin = set_lin_pushforward(
                &mlp,
                &params,
                &posterior,
                &prior,
                PushforwardParams::new().n_samples(10),
            )
            .unwrap();
            let res = lin.predict(&xs).unwrap();
            assert_eq!(res.pred.dim(), (4, 2));
            assert_eq!(res.pred_mean.dim(), (4, 2));
            assert_eq!(res.samples.dim(), (10, 4, 2));
            assert!(res.pred_std.iter().all(|&s| s >= 0.));
            assert_abs_diff_eq!(res.pred, mlp.predict(&params, &xs).unwrap(), epsilon = 1e-12);

            let mc = set_mc_pushforward(
                &mlp,
                &params,
                &posterior,
                &prior,
                PushforwardParams::new().n_samples(10),
            )
            .unwrap();
            assert_eq!(mc.sampled_params().len(), 10);
            let res = mc.predict(&xs).unwrap();
            assert_eq!(res.samples.dim(), (10, 4, 2));
            assert!(res.pred_std.iter().all(|&s| s >= 0.));
        }
    }

    #[test]
    fn test_linearized_samples_spread() {
        let (mlp, params, posterior) = setup(PosteriorStrategy::Full);
        let prior = PriorArguments::isotropic(1.);
        let lin = set_lin_pushforward(
            &mlp,
            &params,
            &posterior,
            &prior,
            PushforwardParams::new().n_samples(4000),
        )
        .unwrap();
        let xs = array![[-1.5], [0.2], [2.]];
        let res = lin.predict(&xs).unwrap();
        let empirical = res.samples.std_axis(Axis(0), 1.);
        assert_relative_eq!(empirical, res.pred_std, max_relative = 0.1);
        assert_abs_diff_eq!(res.pred_mean, res.pred, epsilon = 0.2 * res.pred_std.sum());
    }

    #[test]
    fn test_mc_matches_linearized_for_small_covariance() {
        let (mlp, params, posterior) = setup(PosteriorStrategy::Full);
        let prior = PriorArguments::isotropic(1e4);
        let pf_params = PushforwardParams::new().n_samples(200).seed(7);
        let lin =
            set_lin_pushforward(&mlp, &params, &posterior, &prior, pf_params.clone()).unwrap();
        let mc = set_mc_pushforward(&mlp, &params, &posterior, &prior, pf_params).unwrap();
        let xs = array![[-0.5], [0.7]];
        let lin_res = lin.predict(&xs).unwrap();
        let mc_res = mc.predict(&xs).unwrap();
        assert_relative_eq!(
            mc_res.pred_std,
            lin_res.samples.std_axis(Axis(0), 1.),
            max_relative = 0.05
        );
    }

    #[test]
    fn test_pushforward_errors() {
        let (mlp, params, posterior) = setup(PosteriorStrategy::Diagonal);
        let prior = PriorArguments::isotropic(1.);
        assert!(matches!(
            set_lin_pushforward(
                &mlp,
                &params,
                &posterior,
                &prior,
                PushforwardParams::new().n_samples(1)
            ),
            Err(LaplaceError::InvalidValueError(_))
        ));
        let lin = set_lin_pushforward(&mlp, &params, &posterior, &prior, PushforwardParams::new())
            .unwrap();
        assert!(matches!(
            lin.predict(&array![[0., 1.]]),
            Err(LaplaceError::ShapeMismatch(_))
        ));
    }
}
