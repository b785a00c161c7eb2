//! Truncated symmetric eigendecomposition with the Lanczos algorithm.
//!
//! Only the action of the operator on vectors is required. The Krylov basis is
//! kept and fully reorthogonalized at each step (two Gram-Schmidt passes), which
//! is affordable as the number of steps is bounded by `maxiter`.
//!
//! Ritz pairs coming out of the tridiagonal eigenproblem are not trusted blindly:
//! each one is checked against the operator with an explicit residual `r = ‖Au - θu‖`
//! giving the eigenvalue error bound `min(r, r² / gap)`, `gap` being the distance to
//! the closest other Ritz value. Pairs whose bound exceeds `tol · θ`, or that sit at
//! the round-off noise floor, are dropped. The leading pair is always kept: its Ritz
//! value is the first to converge and a lower bound of the largest eigenvalue.
use crate::errors::{LaplaceError, Result};
use crate::operators::LinearOperator;
use crate::utils::{check_finite, norm};

use linfa::Float;
use linfa_linalg::eigh::*;
use log::debug;
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rayon::prelude::*;
use std::time::Instant;

/// Leading eigenpairs of a symmetric operator
#[derive(Clone, Debug)]
pub struct EigenPairs<F: Float> {
    /// Eigenvalues sorted in descending order (k,)
    pub values: Array1<F>,
    /// Orthonormal eigenvectors as columns (dim, k)
    pub vectors: Array2<F>,
    /// Number of Lanczos steps actually performed
    pub n_iter: usize,
}

impl<F: Float> EigenPairs<F> {
    /// Number of eigenpairs `k`
    pub fn rank(&self) -> usize {
        self.values.len()
    }

    /// Keep at most the `rank` leading eigenpairs
    pub fn truncate(mut self, rank: usize) -> Self {
        if rank < self.rank() {
            self.values = self.values.slice_move(ndarray::s![..rank]);
            self.vectors = self.vectors.slice_move(ndarray::s![.., ..rank]);
        }
        self
    }
}

fn reorthogonalize<F: Float>(w: &mut Array1<F>, basis: &[Array1<F>]) {
    for _ in 0..2 {
        for q in basis.iter() {
            let c = q.dot(w);
            w.scaled_add(-c, q);
        }
    }
}

/// Compute the leading eigenpairs of the symmetric positive semi-definite `operator`
/// with at most `min(maxiter, dim)` Lanczos steps started from a random vector drawn with `rng`.
///
/// Ritz pairs `(θ, u)` above the noise floor `√ε · θ_max`, the resolution of the breakdown
/// test, are kept when their eigenvalue error bound is below `tol · θ`. When `parallel` is set
/// the residual checks call the operator concurrently.
pub fn lanczos<F, O, R>(
    operator: &O,
    maxiter: usize,
    tol: F,
    rng: &mut R,
    parallel: bool,
) -> Result<EigenPairs<F>>
where
    F: Float,
    O: LinearOperator<F>,
    R: Rng,
{
    let now = Instant::now();
    let dim = operator.dim();
    if dim == 0 || maxiter == 0 {
        return Err(LaplaceError::InvalidValueError(format!(
            "Lanczos requires a non empty operator and maxiter > 0, got dim={dim}, maxiter={maxiter}"
        )));
    }
    let max_steps = maxiter.min(dim);

    let start = Array1::<f64>::random_using(dim, StandardNormal, rng).mapv(F::cast);
    let mut q = &start / norm(&start);
    let mut basis: Vec<Array1<F>> = Vec::with_capacity(max_steps);
    let mut alphas: Vec<F> = Vec::with_capacity(max_steps);
    let mut betas: Vec<F> = Vec::with_capacity(max_steps);
    let mut t_norm = F::zero();
    let breakdown = F::epsilon().sqrt();

    loop {
        let mut w = operator.apply(&q.view())?;
        check_finite(&w, "Lanczos operator product")?;
        let alpha = q.dot(&w);
        w.scaled_add(-alpha, &q);
        if let (Some(prev), Some(&beta)) = (basis.last(), betas.last()) {
            w.scaled_add(-beta, prev);
        }
        basis.push(q);
        reorthogonalize(&mut w, &basis);
        alphas.push(alpha);

        let beta = norm(&w);
        let prev_beta = betas.last().copied().unwrap_or_else(F::zero);
        t_norm = t_norm.max(alpha.abs() + beta + prev_beta);
        if basis.len() == max_steps {
            break;
        }
        if beta <= breakdown * t_norm {
            debug!("Lanczos breakdown after {} steps (beta={:?})", basis.len(), beta);
            break;
        }
        betas.push(beta);
        q = w / beta;
    }

    let m = alphas.len();
    let mut tridiag = Array2::<F>::zeros((m, m));
    for (i, &a) in alphas.iter().enumerate() {
        tridiag[[i, i]] = a;
    }
    for (i, &b) in betas.iter().take(m - 1).enumerate() {
        tridiag[[i, i + 1]] = b;
        tridiag[[i + 1, i]] = b;
    }
    let (theta, s) = tridiag.eigh_into()?;
    check_finite(&theta, "Lanczos Ritz values")?;

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| theta[j].partial_cmp(&theta[i]).unwrap_or(std::cmp::Ordering::Equal));
    let theta_max = theta.iter().fold(F::zero(), |acc, t| acc.max(t.abs()));
    let noise_floor = breakdown * theta_max;

    let mut q_mat = Array2::<F>::zeros((dim, m));
    for (mut col, qi) in q_mat.columns_mut().into_iter().zip(basis.iter()) {
        col.assign(qi);
    }
    let candidates: Vec<usize> = order.into_iter().filter(|&i| theta[i] > noise_floor).collect();
    let ritz: Vec<Array1<F>> = candidates
        .iter()
        .map(|&i| q_mat.dot(&s.column(i)))
        .collect();

    let error_bound = |(&i, u): (&usize, &Array1<F>)| -> Result<F> {
        let mut r = operator.apply(&u.view())?;
        r.scaled_add(-theta[i], u);
        let r = norm(&r);
        let gap = theta
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .fold(F::infinity(), |gap, (_, t)| gap.min((theta[i] - *t).abs()));
        Ok(r.min(r * r / gap))
    };
    let bounds: Vec<F> = if parallel {
        candidates
            .par_iter()
            .zip(ritz.par_iter())
            .map(error_bound)
            .collect::<Result<_>>()?
    } else {
        candidates
            .iter()
            .zip(ritz.iter())
            .map(error_bound)
            .collect::<Result<_>>()?
    };

    let kept: Vec<usize> = (0..candidates.len())
        .filter(|&j| j == 0 || bounds[j] <= tol * theta[candidates[j]])
        .collect();
    let mut values = Array1::zeros(kept.len());
    let mut vectors = Array2::zeros((dim, kept.len()));
    for (k, &j) in kept.iter().enumerate() {
        values[k] = theta[candidates[j]];
        vectors.column_mut(k).assign(&ritz[j]);
    }
    check_finite(&vectors, "Lanczos Ritz vectors")?;

    debug!(
        "Lanczos: {} steps, {} Ritz pairs above noise floor, {} converged in {:?}",
        m,
        candidates.len(),
        kept.len(),
        now.elapsed()
    );
    if kept.len() < candidates.len() {
        debug!(
            "Lanczos: {} Ritz pairs dropped by the error bound check (tol={:?})",
            candidates.len() - kept.len(),
            tol
        );
    }
    Ok(EigenPairs {
        values,
        vectors,
        n_iter: m,
    })
}

/// Dense reconstruction `U diag(λ) Uᵀ` of the eigenpairs
pub fn reconstruct<F: Float>(pairs: &EigenPairs<F>) -> Array2<F> {
    let scaled = &pairs.vectors * &pairs.values.view().insert_axis(Axis(0));
    scaled.dot(&pairs.vectors.t())
}
