use crate::errors::{LaplaceError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Data, Dimension, Ix1, Zip};

/// Euclidean norm of a vector
pub fn norm<F: Float>(v: &ArrayBase<impl Data<Elem = F>, Ix1>) -> F {
    v.dot(v).sqrt()
}

/// Standard basis vector `e_i` of size `n`
pub fn basis_vector<F: Float>(n: usize, i: usize) -> Array1<F> {
    let mut e = Array1::zeros(n);
    e[i] = F::one();
    e
}

/// Fail with [`LaplaceError::NonFiniteResult`] when `values` holds NaN or Inf
pub fn check_finite<F: Float, D: Dimension>(
    values: &ArrayBase<impl Data<Elem = F>, D>,
    what: &str,
) -> Result<()> {
    if values.iter().any(|v| !v.is_finite()) {
        return Err(LaplaceError::NonFiniteResult(format!(
            "{what} contains NaN or Inf values"
        )));
    }
    Ok(())
}

/// Replace the square matrix `m` by `(m + mᵀ) / 2`
pub fn symmetrize<F: Float>(m: &mut Array2<F>) {
    let half = F::cast(0.5);
    let mt = m.t().to_owned();
    Zip::from(m).and(&mt).for_each(|a, &b| *a = (*a + b) * half);
}
