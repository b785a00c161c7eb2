//! Pushforward Gaussian process kernel.
//!
//! The weight-space posterior `N(θ*, Σ)` is pushed through the linearization of
//! the network around its trained weights `θ*`, giving a Gaussian process in
//! function space with kernel:
//!
//! `k(x, x') = J(x) Σ J(x')ᵀ`
//!
//! where `J(x)` is the Jacobian of the model output at `x` wrt the weights.
//! The kernel is evaluated without forming any Jacobian: one vector-Jacobian
//! product, one covariance product and one Jacobian-vector product per output.
use crate::errors::{LaplaceError, Result};
use crate::models::DifferentiableModel;
use crate::operators::LinearOperator;
use crate::param_tree::{ParamLayout, ParamTree};
use crate::posterior::{CovarianceOperator, Posterior, PriorArguments};
use crate::utils::{basis_vector, symmetrize};

use linfa::Float;
use log::debug;
use ndarray::{s, Array1, Array2, ArrayBase, ArrayView1, Data, Ix2};
use rayon::prelude::*;
use std::ops::Range;
use std::time::Instant;

/// Selection of the model outputs the kernel is computed for
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputLayout {
    /// All outputs
    #[default]
    Full,
    /// All outputs, the given number being checked against the model output dimension
    Declared(usize),
    /// A single output
    Index(usize),
    /// A contiguous range of outputs
    Range(Range<usize>),
}

impl OutputLayout {
    /// Output indices selected among `output_dim` outputs
    pub fn resolve(&self, output_dim: usize) -> Result<Range<usize>> {
        let range = match self {
            OutputLayout::Full => 0..output_dim,
            OutputLayout::Declared(o) => {
                if *o != output_dim {
                    return Err(LaplaceError::LayoutMismatch(format!(
                        "declared output dimension {o} differs from model output dimension {output_dim}"
                    )));
                }
                0..output_dim
            }
            OutputLayout::Index(i) => *i..i.saturating_add(1),
            OutputLayout::Range(r) => r.clone(),
        };
        if range.is_empty() || range.end > output_dim {
            return Err(LaplaceError::LayoutMismatch(format!(
                "output selection {range:?} is not a non empty subset of the {output_dim} model outputs"
            )));
        }
        Ok(range)
    }
}

/// Kernel `k(x, x') = J(x) Σ J(x')ᵀ` over selected outputs
pub struct PosteriorGpKernel<'a, F: Float, M: DifferentiableModel<F>> {
    model: &'a M,
    mean: ParamTree<F>,
    layout: ParamLayout,
    covariance: CovarianceOperator<F>,
    outputs: Range<usize>,
    dense: bool,
}

/// Result of a kernel evaluation
pub enum KernelValue<'k, F: Float, M: DifferentiableModel<F>> {
    /// Dense (O', O') block
    Dense(Array2<F>),
    /// Kernel-vector product `w ↦ k(x, x') w`
    Operator(KernelVectorProduct<'k, F, M>),
}

impl<F: Float, M: DifferentiableModel<F>> KernelValue<'_, F, M> {
    /// Dense block, computing it from the kernel-vector product if needed
    pub fn into_dense(self) -> Result<Array2<F>> {
        match self {
            KernelValue::Dense(k) => Ok(k),
            KernelValue::Operator(kvp) => kvp.to_dense(false),
        }
    }
}

/// Kernel-vector product `w ↦ J(x) Σ J(x')ᵀ w` at a fixed pair of points
pub struct KernelVectorProduct<'k, F: Float, M: DifferentiableModel<F>> {
    kernel: &'k PosteriorGpKernel<'k, F, M>,
    x: Array1<F>,
    x_prime: Array1<F>,
}

impl<F: Float, M: DifferentiableModel<F>> LinearOperator<F> for KernelVectorProduct<'_, F, M> {
    fn dim(&self) -> usize {
        self.kernel.n_outputs()
    }

    fn apply(&self, w: &ArrayView1<F>) -> Result<Array1<F>> {
        if w.len() != self.dim() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "kernel over {} outputs cannot be applied to a vector of size {}",
                self.dim(),
                w.len()
            )));
        }
        let mut cotangent = Array1::zeros(self.kernel.model.output_dim());
        cotangent
            .slice_mut(s![self.kernel.outputs.clone()])
            .assign(w);
        self.kernel.push(&self.x.view(), &self.x_prime.view(), &cotangent.view())
    }
}

impl<'a, F: Float, M: DifferentiableModel<F>> PosteriorGpKernel<'a, F, M> {
    /// Model the kernel is derived from
    pub fn model(&self) -> &'a M {
        self.model
    }

    /// Mean weights, i.e. the linearization point
    pub fn mean(&self) -> &ParamTree<F> {
        &self.mean
    }

    /// Posterior covariance over weights
    pub fn covariance_operator(&self) -> &CovarianceOperator<F> {
        &self.covariance
    }

    /// Selected output indices
    pub fn outputs(&self) -> Range<usize> {
        self.outputs.clone()
    }

    /// Number of selected outputs `O'`
    pub fn n_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Whether [`PosteriorGpKernel::evaluate`] returns dense blocks
    pub fn is_dense(&self) -> bool {
        self.dense
    }

    fn check_input(&self, x: &ArrayView1<F>) -> Result<()> {
        if x.len() != self.model.input_dim() {
            return Err(LaplaceError::ShapeMismatch(format!(
                "kernel input should have {} components, got {}",
                self.model.input_dim(),
                x.len()
            )));
        }
        Ok(())
    }

    /// `J(x)ᵀ u` as a flat weight vector
    fn pull(&self, x: &ArrayView1<F>, cotangent: &ArrayView1<F>) -> Result<Array1<F>> {
        Ok(self.model.vjp(&self.mean, x, cotangent)?.flatten())
    }

    /// Selected rows of `J(x) Σ J(x')ᵀ u`
    fn push(
        &self,
        x: &ArrayView1<F>,
        x_prime: &ArrayView1<F>,
        cotangent: &ArrayView1<F>,
    ) -> Result<Array1<F>> {
        let g = self.pull(x_prime, cotangent)?;
        let sg = self.covariance.apply(&g.view())?;
        let tangent = self.layout.unflatten(&sg)?;
        let (_, jv) = self.model.jvp(&self.mean, x, &tangent)?;
        Ok(jv.slice(s![self.outputs.clone()]).to_owned())
    }

    /// Evaluate the kernel at `(x, x')` as a dense block or as a kernel-vector
    /// product depending on the kernel setting.
    pub fn evaluate(
        &self,
        x: &ArrayView1<F>,
        x_prime: &ArrayView1<F>,
    ) -> Result<KernelValue<'_, F, M>> {
        self.check_input(x)?;
        self.check_input(x_prime)?;
        if self.dense {
            Ok(KernelValue::Dense(self.covariance(x, x_prime)?))
        } else {
            Ok(KernelValue::Operator(KernelVectorProduct {
                kernel: self,
                x: x.to_owned(),
                x_prime: x_prime.to_owned(),
            }))
        }
    }

    /// Dense (O', O') block `k(x, x')`, rows indexing outputs at `x`
    /// and columns outputs at `x'`.
    pub fn covariance(&self, x: &ArrayView1<F>, x_prime: &ArrayView1<F>) -> Result<Array2<F>> {
        self.check_input(x)?;
        self.check_input(x_prime)?;
        let n_out = self.model.output_dim();
        let mut block = Array2::zeros((self.n_outputs(), self.n_outputs()));
        for (j, k) in self.outputs.clone().enumerate() {
            let e = basis_vector(n_out, k);
            block
                .column_mut(j)
                .assign(&self.push(x, x_prime, &e.view())?);
        }
        Ok(block)
    }

    /// Marginal variances (O',) of the selected outputs at `x`
    pub fn variance(&self, x: &ArrayView1<F>) -> Result<Array1<F>> {
        self.check_input(x)?;
        let n_out = self.model.output_dim();
        let mut var = Array1::zeros(self.n_outputs());
        for (j, k) in self.outputs.clone().enumerate() {
            let g = self.pull(x, &basis_vector(n_out, k).view())?;
            let v = g.dot(&self.covariance.apply(&g.view())?);
            // Clamp round-off negative values
            var[j] = v.max(F::zero());
        }
        Ok(var)
    }

    /// Marginal variances at `n` points given as a (n, input_dim) matrix.
    /// Returns a (n, O') matrix.
    pub fn predict_var(&self, xs: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let now = Instant::now();
        let xs = xs.view();
        let rows: Vec<Array1<F>> = (0..xs.nrows())
            .into_par_iter()
            .map(|i| self.variance(&xs.row(i)))
            .collect::<Result<_>>()?;
        let mut var = Array2::zeros((xs.nrows(), self.n_outputs()));
        for (mut row, v) in var.rows_mut().into_iter().zip(rows.iter()) {
            row.assign(v);
        }
        debug!("Variances at {} points computed in {:?}", xs.nrows(), now.elapsed());
        Ok(var)
    }

    /// Joint covariance (n·O', n·O') of the selected outputs at `n` points,
    /// entries are ordered point-major.
    pub fn covariance_matrix(&self, xs: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
        let now = Instant::now();
        let xs = xs.view();
        let n_out = self.model.output_dim();
        let o = self.n_outputs();
        let grads: Vec<Array1<F>> = (0..xs.nrows() * o)
            .into_par_iter()
            .map(|r| {
                let x = xs.row(r / o);
                self.check_input(&x)?;
                let e = basis_vector(n_out, self.outputs.start + r % o);
                self.pull(&x, &e.view())
            })
            .collect::<Result<_>>()?;
        let mut jac = Array2::zeros((grads.len(), self.layout.size()));
        for (mut row, g) in jac.rows_mut().into_iter().zip(grads.iter()) {
            row.assign(g);
        }
        let sigma_jt = self.covariance.apply_columns(&jac.t(), true)?;
        let mut cov = jac.dot(&sigma_jt);
        symmetrize(&mut cov);
        debug!(
            "Joint covariance over {} points computed in {:?}",
            xs.nrows(),
            now.elapsed()
        );
        Ok(cov)
    }
}

/// Build the pushforward GP kernel of the Laplace posterior.
///
/// * `model`: differentiable model,
/// * `mean`: trained weights, the linearization point,
/// * `posterior`: Laplace posterior over the weights of `model`,
/// * `prior`: prior arguments used to build the posterior covariance,
/// * `dense`: whether evaluations return dense blocks or kernel-vector products,
/// * `output_layout`: outputs the kernel is computed for.
pub fn set_posterior_gp_kernel<'a, F, M>(
    model: &'a M,
    mean: &ParamTree<F>,
    posterior: &Posterior<F>,
    prior: &PriorArguments<F>,
    dense: bool,
    output_layout: OutputLayout,
) -> Result<PosteriorGpKernel<'a, F, M>>
where
    F: Float,
    M: DifferentiableModel<F>,
{
    let now = Instant::now();
    let layout = model.param_layout();
    layout.check(mean)?;
    if posterior.layout() != &layout {
        return Err(LaplaceError::LayoutMismatch(format!(
            "posterior over {} parameters does not match the {} model parameters",
            posterior.layout().size(),
            layout.size()
        )));
    }
    let outputs = output_layout.resolve(model.output_dim())?;
    let probe = model.forward(mean, &Array1::zeros(model.input_dim()).view())?;
    if probe.len() != model.output_dim() {
        return Err(LaplaceError::ShapeMismatch(format!(
            "model returns {} outputs while declaring {}",
            probe.len(),
            model.output_dim()
        )));
    }
    let covariance = posterior.covariance(prior)?;
    debug!(
        "Pushforward kernel over outputs {:?} set in {:?}",
        outputs,
        now.elapsed()
    );
    Ok(PosteriorGpKernel {
        model,
        mean: mean.clone(),
        layout,
        covariance,
        outputs,
        dense,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curvature::{create_curvature_operator, LossKind};
    use crate::models::Mlp;
    use crate::parameters::PosteriorParams;
    use crate::posterior::{create_posterior, PosteriorStrategy};
    use crate::training::{fit_least_squares, AdamParams};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use env_logger::{Builder, Env, Target};
    use linfa::Dataset;
    use ndarray::{array, Array, Axis};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use paste::paste;
    use rand_xoshiro::Xoshiro256Plus;

    fn init_log() {
        let env = Env::new().filter_or("LAPLACE_GP_LOG", "info");
        Builder::from_env(env).target(Target::Stdout).try_init().ok();
    }

    fn small_kernel_setup() -> (Mlp<f64>, ParamTree<f64>, Posterior<f64>) {
        small_kernel_setup_with(PosteriorStrategy::Full)
    }

    fn small_kernel_setup_with(
        strategy: PosteriorStrategy,
    ) -> (Mlp<f64>, ParamTree<f64>, Posterior<f64>) {
        let mlp = Mlp::new(&[2, 6, 3]).unwrap();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let params = mlp.init_params(&mut rng);
        let x = Array2::random_using((10, 2), Normal::new(0., 1.).unwrap(), &mut rng);
        let y = Array2::random_using((10, 3), Normal::new(0., 1.).unwrap(), &mut rng);
        let ggn = create_curvature_operator(&mlp, &params, &Dataset::new(x, y), LossKind::SquaredError)
            .unwrap();
        let posterior = create_posterior(
            strategy,
            &ggn,
            &mlp.param_layout(),
            PosteriorParams::new(),
        )
        .unwrap();
        (mlp, params, posterior)
    }

    macro_rules! test_kernel_symmetry {
        ($strategy:ident) => {
            paste! {
                #[test]
                fn [<test_ $strategy:snake _kernel_symmetry_and_diagonal>]() {
                    let (mlp, params, posterior) =
                        small_kernel_setup_with(PosteriorStrategy::$strategy);
                    let prior = PriorArguments::isotropic(1.);
                    let kernel = set_posterior_gp_kernel(
                        &mlp, &params, &posterior, &prior, true, OutputLayout::Full
                    ).unwrap();
                    let x = array![0.3, -1.];
                    let xp = array![1.5, 0.2];
                    let kxx = kernel.covariance(&x.view(), &xp.view()).unwrap();
                    let kxpx = kernel.covariance(&xp.view(), &x.view()).unwrap();
                    assert_eq!(kxx.dim(), (3, 3));
                    assert_abs_diff_eq!(kxx.t(), kxpx, epsilon = 1e-10);

                    // unclamped block at a single point
                    let kself = kernel.covariance(&x.view(), &x.view()).unwrap();
                    assert_abs_diff_eq!(kself.t(), kself, epsilon = 1e-10);
                    assert!(kself.diag().iter().all(|&v| v >= -1e-12), "{kself}");
                    assert_abs_diff_eq!(
                        kernel.variance(&x.view()).unwrap(),
                        kself.diag().to_owned(),
                        epsilon = 1e-10
                    );
                }
            }
        };
    }

    test_kernel_symmetry!(Full);
    test_kernel_symmetry!(LowRank);
    test_kernel_symmetry!(Diagonal);

    #[test]
    fn test_kernel_vector_product_matches_dense() {
        let (mlp, params, posterior) = small_kernel_setup();
        let prior = PriorArguments::isotropic(2.);
        let dense =
            set_posterior_gp_kernel(&mlp, &params, &posterior, &prior, true, OutputLayout::Full)
                .unwrap();
        let kvp = set_posterior_gp_kernel(
            &mlp,
            &params,
            &posterior,
            &prior,
            false,
            OutputLayout::Declared(3),
        )
        .unwrap();
        let x = array![-0.5, 0.5];
        let xp = array![2., 1.];
        let w = array![1., -2., 0.5];
        let block = match dense.evaluate(&x.view(), &xp.view()).unwrap() {
            KernelValue::Dense(k) => k,
            KernelValue::Operator(_) => panic!("dense block expected"),
        };
        match kvp.evaluate(&x.view(), &xp.view()).unwrap() {
            KernelValue::Operator(op) => {
                assert_abs_diff_eq!(op.apply(&w.view()).unwrap(), block.dot(&w), epsilon = 1e-10);
            }
            KernelValue::Dense(_) => panic!("kernel-vector product expected"),
        }
        assert_abs_diff_eq!(
            kvp.evaluate(&x.view(), &xp.view()).unwrap().into_dense().unwrap(),
            block,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_kernel_output_layouts() {
        let (mlp, params, posterior) = small_kernel_setup();
        let prior = PriorArguments::isotropic(1.);
        let full =
            set_posterior_gp_kernel(&mlp, &params, &posterior, &prior, true, OutputLayout::Full)
                .unwrap();
        let x = array![0.1, 0.2];
        let xp = array![-0.3, 0.4];
        let block = full.covariance(&x.view(), &xp.view()).unwrap();

        let single =
            set_posterior_gp_kernel(&mlp, &params, &posterior, &prior, true, OutputLayout::Index(1))
                .unwrap();
        assert_eq!(single.n_outputs(), 1);
        assert_abs_diff_eq!(
            single.covariance(&x.view(), &xp.view()).unwrap()[[0, 0]],
            block[[1, 1]],
            epsilon = 1e-12
        );

        let range = set_posterior_gp_kernel(
            &mlp,
            &params,
            &posterior,
            &prior,
            false,
            OutputLayout::Range(1..3),
        )
        .unwrap();
        assert_abs_diff_eq!(
            range.covariance(&x.view(), &xp.view()).unwrap(),
            block.slice(s![1..3, 1..3]),
            epsilon = 1e-12
        );

        for layout in [
            OutputLayout::Declared(2),
            OutputLayout::Index(3),
            OutputLayout::Index(usize::MAX),
            OutputLayout::Range(2..2),
            OutputLayout::Range(1..4),
        ] {
            assert!(matches!(
                set_posterior_gp_kernel(&mlp, &params, &posterior, &prior, true, layout),
                Err(LaplaceError::LayoutMismatch(_))
            ));
        }
    }

    #[test]
    fn test_kernel_errors() {
        let (mlp, params, posterior) = small_kernel_setup();
        let prior = PriorArguments::isotropic(1.);
        let other = Mlp::new(&[2, 4, 3]).unwrap();
        let other_params = other.init_params(&mut Xoshiro256Plus::seed_from_u64(0));
        assert!(matches!(
            set_posterior_gp_kernel(&other, &other_params, &posterior, &prior, true, OutputLayout::Full),
            Err(LaplaceError::LayoutMismatch(_))
        ));
        assert!(matches!(
            set_posterior_gp_kernel(&mlp, &other_params, &posterior, &prior, true, OutputLayout::Full),
            Err(LaplaceError::LayoutMismatch(_))
        ));
        assert!(matches!(
            set_posterior_gp_kernel(
                &mlp,
                &params,
                &posterior,
                &PriorArguments::isotropic(-1.),
                true,
                OutputLayout::Full
            ),
            Err(LaplaceError::InvalidValueError(_))
        ));

        let kernel =
            set_posterior_gp_kernel(&mlp, &params, &posterior, &prior, false, OutputLayout::Full)
                .unwrap();
        assert!(!kernel.is_dense());
        let bad = array![1., 2., 3.];
        assert!(matches!(
            kernel.evaluate(&bad.view(), &array![0., 0.].view()),
            Err(LaplaceError::ShapeMismatch(_))
        ));
        assert!(matches!(
            kernel.variance(&bad.view()),
            Err(LaplaceError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_kernel_batch_evaluations() {
        let (mlp, params, posterior) = small_kernel_setup();
        let prior = PriorArguments::isotropic(1.);
        let kernel = set_posterior_gp_kernel(
            &mlp,
            &params,
            &posterior,
            &prior,
            true,
            OutputLayout::Range(0..2),
        )
        .unwrap();
        let xs = array![[0., 0.], [1., -1.], [0.5, 2.], [-2., 0.3]];
        let var = kernel.predict_var(&xs).unwrap();
        assert_eq!(var.dim(), (4, 2));
        let cov = kernel.covariance_matrix(&xs).unwrap();
        assert_eq!(cov.dim(), (8, 8));
        for i in 0..4 {
            assert_abs_diff_eq!(var.row(i), kernel.variance(&xs.row(i)).unwrap(), epsilon = 1e-10);
            for j in 0..4 {
                let block = kernel.covariance(&xs.row(i), &xs.row(j)).unwrap();
                assert_abs_diff_eq!(
                    cov.slice(s![2 * i..2 * i + 2, 2 * j..2 * j + 2]),
                    block,
                    epsilon = 1e-10
                );
            }
        }
    }

    /// 1→50→1 MLP trained on 20 noisy samples of sin over [0, 2π]
    fn sinusoid_setup() -> (Mlp<f64>, ParamTree<f64>, Dataset<f64, f64>) {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt = Array::linspace(0., 2. * std::f64::consts::PI, 20).insert_axis(Axis(1));
        let noise = Array2::random_using((20, 1), Normal::new(0., 0.3).unwrap(), &mut rng);
        let yt = xt.mapv(f64::sin) + noise;
        let mlp = Mlp::new(&[1, 50, 1]).unwrap();
        let init = mlp.init_params(&mut rng);
        let dataset = Dataset::new(xt, yt);
        let params = fit_least_squares(
            &mlp,
            &init,
            &dataset,
            AdamParams::new().learning_rate(1e-2).epochs(2000),
        )
        .unwrap();
        (mlp, params, dataset)
    }

    fn sinusoid_variances(
        (mlp, params, dataset): &(Mlp<f64>, ParamTree<f64>, Dataset<f64, f64>),
        strategy: PosteriorStrategy,
        maxiter: usize,
    ) -> (Array1<f64>, Array2<f64>) {
        let ggn = create_curvature_operator(mlp, params, dataset, LossKind::SquaredError).unwrap();
        let posterior = create_posterior(
            strategy,
            &ggn,
            &mlp.param_layout(),
            PosteriorParams::new().maxiter(maxiter).mv_jittable(true),
        )
        .unwrap();
        let prior = PriorArguments::isotropic(1.);
        let kernel =
            set_posterior_gp_kernel(mlp, params, &posterior, &prior, true, OutputLayout::Full)
                .unwrap();
        let grid = Array::linspace(0.5, 8., 200);
        let var = kernel.predict_var(&grid.view().insert_axis(Axis(1))).unwrap();
        (grid, var)
    }

    #[test]
    fn test_sinusoid_full_posterior() {
        init_log();
        let (grid, var) = sinusoid_variances(&sinusoid_setup(), PosteriorStrategy::Full, 20);
        assert_eq!(var.dim(), (200, 1));
        assert!(var.iter().all(|&v| v > 0.));

        let two_pi = 2. * std::f64::consts::PI;
        let (mut inside, mut n_in, mut outside, mut n_out) = (0., 0., 0., 0.);
        for (x, v) in grid.iter().zip(var.iter()) {
            if *x > two_pi {
                outside += v;
                n_out += 1.;
            } else {
                inside += v;
                n_in += 1.;
            }
        }
        assert!(outside / n_out > inside / n_in);
    }

    #[test]
    fn test_sinusoid_low_rank_posterior() {
        init_log();
        let trained = sinusoid_setup();
        let (_, full) = sinusoid_variances(&trained, PosteriorStrategy::Full, 20);
        let (_, low_rank) = sinusoid_variances(&trained, PosteriorStrategy::LowRank, 50);
        assert!(low_rank.iter().all(|&v| v > 0.));
        for (lr, f) in low_rank.iter().zip(full.iter()) {
            assert_relative_eq!(*lr, *f, max_relative = 0.2);
        }
    }
}
