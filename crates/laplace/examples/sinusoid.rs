use env_logger::{Builder, Env, Target};
use laplace_gp::*;
use linfa::Dataset;
use ndarray::{concatenate, Array, Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn main() {
    let env = Env::new().filter_or("LAPLACE_GP_LOG", "info");
    Builder::from_env(env).target(Target::Stdout).init();

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let xtrain = Array::linspace(0., 2. * std::f64::consts::PI, 20).insert_axis(Axis(1));
    let noise = Array2::random_using((20, 1), Normal::new(0., 0.3).unwrap(), &mut rng);
    let ytrain = xtrain.mapv(f64::sin) + noise;
    let dataset = Dataset::new(xtrain, ytrain);

    let mlp = Mlp::new(&[1, 50, 1]).expect("MLP sizes");
    let init = mlp.init_params(&mut rng);
    let params = fit_least_squares(
        &mlp,
        &init,
        &dataset,
        AdamParams::new().learning_rate(1e-2).epochs(2000),
    )
    .expect("MLP training");

    let ggn = create_curvature_operator(&mlp, &params, &dataset, LossKind::SquaredError)
        .expect("GGN operator");
    let prior = PriorArguments::isotropic(1.);
    let xtest = Array::linspace(0.5, 8., 200).insert_axis(Axis(1));
    let ytest = mlp.predict(&params, &xtest).expect("MLP prediction");

    for strategy in ["full", "low_rank"] {
        let strategy = PosteriorStrategy::try_from(strategy).expect("known strategy");
        let posterior = create_posterior(
            strategy,
            &ggn,
            &mlp.param_layout(),
            PosteriorParams::new().maxiter(50).mv_jittable(true),
        )
        .expect("Laplace posterior");
        let kernel =
            set_posterior_gp_kernel(&mlp, &params, &posterior, &prior, true, OutputLayout::Full)
                .expect("Pushforward kernel");
        let var = kernel.predict_var(&xtest).expect("Kernel variances");

        println!("{strategy} posterior: x, prediction, std");
        let std = var.mapv(f64::sqrt);
        let res = concatenate![Axis(1), xtest, ytest, std];
        for row in res.rows().into_iter().step_by(20) {
            println!("{:.3} {:.4} {:.4}", row[0], row[1], row[2]);
        }
    }

    let posterior = create_posterior(
        PosteriorStrategy::Full,
        &ggn,
        &mlp.param_layout(),
        PosteriorParams::new(),
    )
    .expect("Laplace posterior");
    let lin = set_lin_pushforward(&mlp, &params, &posterior, &prior, PushforwardParams::new())
        .expect("Linearized pushforward");
    let mc = set_mc_pushforward(&mlp, &params, &posterior, &prior, PushforwardParams::new())
        .expect("Monte-Carlo pushforward");
    let xs = Array::linspace(0., 8., 5).insert_axis(Axis(1));
    let lin_res = lin.predict(&xs).expect("Linearized predictive");
    let mc_res = mc.predict(&xs).expect("Monte-Carlo predictive");
    println!("x, linearized mean/std, Monte-Carlo mean/std");
    for i in 0..xs.nrows() {
        println!(
            "{:.2} {:.4}/{:.4} {:.4}/{:.4}",
            xs[[i, 0]],
            lin_res.pred_mean[[i, 0]],
            lin_res.pred_std[[i, 0]],
            mc_res.pred_mean[[i, 0]],
            mc_res.pred_std[[i, 0]]
        );
    }
}
